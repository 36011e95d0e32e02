use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Get the unified Doppio data directory
///
/// - macOS: ~/Library/Application Support/doppio/
/// - Linux: ~/.local/share/doppio/
/// - Windows: %APPDATA%\doppio\
///
/// Can be overridden with DOPPIO_DATA_DIR environment variable.
pub fn doppio_data_dir() -> PathBuf {
    if let Ok(env) = std::env::var("DOPPIO_DATA_DIR") {
        if !env.trim().is_empty() {
            return PathBuf::from(env);
        }
    }

    dirs::data_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local")
                .join("share")
        })
        .join("doppio")
}

pub fn default_config_path() -> PathBuf {
    doppio_data_dir().join("config.json")
}

/// Engine settings shared by the runner, the log channel and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for recipes, execution snapshots and logs (None = doppio data dir)
    pub data_dir: Option<PathBuf>,
    /// Mirror run logs to JSONL files
    pub persist_logs: bool,
    /// Write execution snapshots as JSON after every state change
    pub persist_executions: bool,
    /// Buffered events per execution subscriber before it starts lagging
    pub event_capacity: usize,
    /// Default `max_bytes` for a log read when the caller passes none
    pub log_read_max_bytes: u64,
    /// Upper bound for the host handshake in the `connecting` state
    pub connect_timeout_secs: u64,
    /// Step outputs longer than this are truncated in the aggregate
    pub max_step_output_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            persist_logs: true,
            persist_executions: true,
            event_capacity: 1024,
            log_read_max_bytes: 256 * 1024,
            connect_timeout_secs: 180,
            max_step_output_bytes: 64 * 1024,
        }
    }
}

impl EngineConfig {
    /// In-memory configuration: nothing is written to disk.
    pub fn ephemeral() -> Self {
        Self {
            persist_logs: false,
            persist_executions: false,
            ..Self::default()
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(doppio_data_dir)
    }

    pub fn recipes_dir(&self) -> PathBuf {
        self.data_dir().join("recipes")
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.data_dir().join("recipe_executions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.executions_dir().join("logs")
    }
}

pub async fn load_config() -> Result<EngineConfig, AppError> {
    load_config_from(&default_config_path()).await
}

pub async fn load_config_from(path: &Path) -> Result<EngineConfig, AppError> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let raw = tokio::fs::read_to_string(path).await?;
    let cfg: EngineConfig = serde_json::from_str(&raw)
        .map_err(|e| AppError::io(format!("Invalid config JSON at {}: {e}", path.display())))?;
    Ok(cfg)
}

pub async fn save_config_to(path: &Path, cfg: &EngineConfig) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_string_pretty(cfg)
        .map_err(|e| AppError::io(format!("Failed to serialize config: {e}")))?;
    tokio::fs::write(path, format!("{data}\n")).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("config.json")).await.unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[tokio::test]
    async fn test_partial_config_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{ "persist_logs": false, "event_capacity": 8 }"#)
            .await
            .unwrap();

        let cfg = load_config_from(&path).await.unwrap();
        assert!(!cfg.persist_logs);
        assert_eq!(cfg.event_capacity, 8);
        assert_eq!(cfg.log_read_max_bytes, 256 * 1024);
    }

    #[tokio::test]
    async fn test_config_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let cfg = EngineConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::ephemeral()
        };
        save_config_to(&path, &cfg).await.unwrap();
        assert_eq!(load_config_from(&path).await.unwrap(), cfg);
        assert_eq!(cfg.logs_dir(), dir.path().join("recipe_executions").join("logs"));
    }
}
