//! Recipe System
//!
//! Recipes are TOML files describing a DAG of steps. An interactive
//! execution walks that DAG one step at a time under operator control:
//! pause, resume, interrupt, cancel, skip, answer prompts, or take the
//! intervention lock. Operations are carried out by pluggable collaborators
//! (see [`operations`]).

pub mod events;
pub mod execution;
pub mod graph;
pub mod interactive;
pub mod interpolate;
pub mod operations;
pub mod parser;
pub mod retry;
pub mod run_logs;
pub mod runner;
pub mod store;
pub mod types;

use std::path::{Path, PathBuf};

use crate::error::AppError;

pub use events::{EventHub, InteractiveEvent};
pub use interactive::{ExecutionSummary, InteractiveExecution, InteractiveStatus};
pub use operations::{Collaborators, LOCAL_TARGET};
pub use parser::*;
pub use run_logs::{LogAppended, RecipeLogChunk, RecipeLogEntry, RecipeLogStream, RunLogs};
pub use runner::{PrepareRequest, RecipeRunner};
pub use types::*;

fn recipe_slug_from_name(name: &str) -> Result<String, AppError> {
    let mut out = String::new();
    let mut last_was_dash = false;

    for c in name.trim().to_lowercase().chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_was_dash = false;
            continue;
        }

        if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }

    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        return Err(AppError::invalid_input(
            "Recipe name must contain at least one alphanumeric character",
        ));
    }

    Ok(out)
}

fn recipe_path_for_name(recipes_dir: &Path, name: &str) -> Result<PathBuf, AppError> {
    Ok(recipes_dir.join(format!("{}.toml", recipe_slug_from_name(name)?)))
}

// ============================================================
// Recipe Store
// ============================================================

/// Recipe files under one directory, named after the recipe's slug.
pub struct RecipeStore {
    recipes_dir: PathBuf,
}

impl RecipeStore {
    pub fn new(recipes_dir: PathBuf) -> Self {
        Self { recipes_dir }
    }

    pub fn recipes_dir(&self) -> &Path {
        &self.recipes_dir
    }

    async fn ensure_dir(&self) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.recipes_dir)
            .await
            .map_err(|e| AppError::io(format!("Failed to create recipes directory: {e}")))
    }

    async fn free_path_for(&self, name: &str) -> Result<PathBuf, AppError> {
        let path = recipe_path_for_name(&self.recipes_dir, name)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AppError::invalid_input("A recipe with this name already exists"));
        }
        Ok(path)
    }

    /// Summaries of every readable recipe, sorted by name. Files whose name
    /// no longer matches the recipe's slug are renamed when possible.
    pub async fn list(&self) -> Result<Vec<RecipeSummary>, AppError> {
        let dir = &self.recipes_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "toml") {
                continue;
            }
            let mut summary = match get_recipe_summary(&path).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "failed to load recipe: {}", e.message);
                    continue;
                }
            };

            match recipe_path_for_name(dir, &summary.name) {
                Ok(desired) if desired != path => {
                    if tokio::fs::try_exists(&desired).await.unwrap_or(false) {
                        tracing::warn!(
                            path = %path.display(),
                            wanted = %desired.display(),
                            "recipe file name mismatch but destination exists; keeping original"
                        );
                    } else if let Err(e) = tokio::fs::rename(&path, &desired).await {
                        tracing::warn!(path = %path.display(), "failed to rename recipe file: {e}");
                    } else {
                        summary.path = desired.to_string_lossy().to_string();
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), "failed to derive recipe filename: {}", e.message);
                }
            }
            summaries.push(summary);
        }

        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    pub async fn get(&self, path: &Path) -> Result<Recipe, AppError> {
        load_recipe(path).await
    }

    /// Save under the slug of `recipe.name`, renaming the file at `path`
    /// when the name changed. Returns the final path.
    pub async fn save(&self, path: &Path, recipe: &Recipe) -> Result<PathBuf, AppError> {
        self.ensure_dir().await?;
        let desired = recipe_path_for_name(&self.recipes_dir, &recipe.name)?;

        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            if !path.starts_with(&self.recipes_dir) {
                return Err(AppError::invalid_input("Invalid recipe path"));
            }
            if path != desired {
                if tokio::fs::try_exists(&desired).await.unwrap_or(false) {
                    return Err(AppError::invalid_input("A recipe with this name already exists"));
                }
                tokio::fs::rename(path, &desired)
                    .await
                    .map_err(|e| AppError::io(format!("Failed to rename recipe file: {e}")))?;
            }
        }

        save_recipe(&desired, recipe).await?;
        Ok(desired)
    }

    /// Create an empty recipe file.
    pub async fn create(&self, name: &str) -> Result<PathBuf, AppError> {
        self.ensure_dir().await?;
        let path = self.free_path_for(name).await?;
        let recipe = Recipe {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: None,
            target: None,
            variables: Default::default(),
            steps: vec![],
        };
        save_recipe(&path, &recipe).await?;
        Ok(path)
    }

    pub async fn delete(&self, path: &Path) -> Result<(), AppError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| AppError::io(format!("Failed to delete recipe: {e}")))?;
        }
        Ok(())
    }

    /// Copy a valid recipe from anywhere into the store.
    pub async fn import(&self, source: &Path) -> Result<PathBuf, AppError> {
        let recipe = load_recipe(source).await?;
        let validation = validate_recipe(&recipe);
        if !validation.valid {
            let errors: Vec<String> = validation.errors.iter().map(|e| e.message.clone()).collect();
            return Err(AppError::validation(format!("Invalid recipe: {}", errors.join(", "))));
        }

        self.ensure_dir().await?;
        let dest = self.free_path_for(&recipe.name).await?;
        save_recipe(&dest, &recipe).await?;
        Ok(dest)
    }

    pub async fn export(&self, path: &Path, dest: &Path) -> Result<(), AppError> {
        let recipe = load_recipe(path).await?;
        save_recipe(dest, &recipe).await
    }

    pub async fn duplicate(&self, path: &Path, new_name: &str) -> Result<PathBuf, AppError> {
        let mut recipe = load_recipe(path).await?;
        recipe.name = new_name.to_string();
        let new_path = self.free_path_for(new_name).await?;
        save_recipe(&new_path, &recipe).await?;
        Ok(new_path)
    }
}
