//! Execution snapshot persistence

use std::path::PathBuf;

use async_trait::async_trait;

use super::interactive::InteractiveExecution;
use crate::error::AppError;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save(&self, execution: &InteractiveExecution) -> Result<(), AppError>;

    async fn load(&self, execution_id: &str) -> Result<Option<InteractiveExecution>, AppError>;

    async fn list(&self) -> Result<Vec<InteractiveExecution>, AppError>;
}

/// Keeps nothing; used when persistence is disabled.
pub struct NoopStore;

#[async_trait]
impl ExecutionStore for NoopStore {
    async fn save(&self, _execution: &InteractiveExecution) -> Result<(), AppError> {
        Ok(())
    }

    async fn load(&self, _execution_id: &str) -> Result<Option<InteractiveExecution>, AppError> {
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<InteractiveExecution>, AppError> {
        Ok(Vec::new())
    }
}

/// One pretty-printed JSON file per execution.
pub struct JsonExecutionStore {
    dir: PathBuf,
}

impl JsonExecutionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, execution_id: &str) -> PathBuf {
        self.dir.join(format!("interactive-{execution_id}.json"))
    }
}

#[async_trait]
impl ExecutionStore for JsonExecutionStore {
    async fn save(&self, execution: &InteractiveExecution) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let data = serde_json::to_string_pretty(execution)
            .map_err(|e| AppError::io(format!("Failed to serialize execution: {e}")))?;
        let path = self.path(&execution.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<InteractiveExecution>, AppError> {
        let path = self.path(execution_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let execution = serde_json::from_str(&raw).map_err(|e| {
            AppError::io(format!("Invalid execution snapshot {}: {e}", path.display()))
        })?;
        Ok(Some(execution))
    }

    async fn list(&self) -> Result<Vec<InteractiveExecution>, AppError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<InteractiveExecution>(&raw) {
                Ok(execution) => out.push(execution),
                Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable execution snapshot: {e}"),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::recipe::types::{Operation, Recipe, SleepOp, Step};

    fn execution(id: &str) -> InteractiveExecution {
        let recipe = Recipe {
            name: "demo".to_string(),
            version: "1".to_string(),
            description: None,
            target: None,
            variables: HashMap::new(),
            steps: vec![Step::new("a", Operation::Sleep(SleepOp { duration_secs: 1 }))],
        };
        InteractiveExecution::new(
            id.to_string(),
            &recipe,
            "demo.toml".to_string(),
            "__local__".to_string(),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_json_store_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonExecutionStore::new(dir.path().join("executions"));
        assert!(store.load("missing").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());

        store.save(&execution("e1")).await.unwrap();
        store.save(&execution("e2")).await.unwrap();

        let loaded = store.load("e1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "e1");
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
