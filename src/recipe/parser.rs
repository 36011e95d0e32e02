//! Recipe parsing, serialization and validation

use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::graph::find_cycle;
use super::interpolate::unresolved_references;
use super::types::{
    Operation, Recipe, RecipeFile, RecipeSummary, Step, ValidationError, ValidationResult,
    ValidationWarning,
};
use crate::error::AppError;

/// Parse a recipe from TOML string
pub fn parse_recipe(toml_str: &str) -> Result<Recipe, AppError> {
    let file: RecipeFile = toml::from_str(toml_str)?;
    Ok(file.into())
}

/// Parse a recipe from file
pub async fn load_recipe(path: &Path) -> Result<Recipe, AppError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppError::io(format!("Failed to read recipe file {}: {e}", path.display())))?;
    parse_recipe(&content)
}

/// Serialize a recipe to TOML string
pub fn serialize_recipe(recipe: &Recipe) -> Result<String, AppError> {
    // Convert back to RecipeFile format for proper TOML structure
    let file = RecipeFile::from(recipe);
    Ok(toml::to_string_pretty(&file)?)
}

/// Save a recipe to file
pub async fn save_recipe(path: &Path, recipe: &Recipe) -> Result<(), AppError> {
    let content = serialize_recipe(recipe)?;

    // Create parent directories if needed
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::io(format!("Failed to create directory: {e}")))?;
    }

    tokio::fs::write(path, content)
        .await
        .map_err(|e| AppError::io(format!("Failed to write recipe file: {e}")))?;

    Ok(())
}

/// Get recipe summary without keeping the steps around
pub async fn get_recipe_summary(path: &Path) -> Result<RecipeSummary, AppError> {
    let recipe = load_recipe(path).await?;

    Ok(RecipeSummary {
        path: path.to_string_lossy().to_string(),
        name: recipe.name,
        version: recipe.version,
        description: recipe.description,
        step_count: recipe.steps.len(),
    })
}

/// Validate a recipe for correctness
pub fn validate_recipe(recipe: &Recipe) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Check for empty name
    if recipe.name.trim().is_empty() {
        errors.push(ValidationError {
            step_id: None,
            message: "Recipe name is required".to_string(),
        });
    }

    // Check for duplicate step IDs
    let mut seen_ids = HashSet::new();
    for step in &recipe.steps {
        if !seen_ids.insert(&step.id) {
            errors.push(ValidationError {
                step_id: Some(step.id.clone()),
                message: format!("Duplicate step ID: {}", step.id),
            });
        }
    }

    // Validate step dependencies
    let step_ids: HashSet<_> = recipe.steps.iter().map(|s| &s.id).collect();

    for step in &recipe.steps {
        for dep in &step.depends_on {
            // Check for self-dependency
            if dep == &step.id {
                errors.push(ValidationError {
                    step_id: Some(step.id.clone()),
                    message: "Step cannot depend on itself".to_string(),
                });
            } else if !step_ids.contains(dep) {
                errors.push(ValidationError {
                    step_id: Some(step.id.clone()),
                    message: format!("Unknown dependency: {dep}"),
                });
            }
        }

        // Validate step-specific rules
        validate_step(step, &mut errors, &mut warnings);
    }

    validate_groups(recipe, &step_ids, &mut errors);
    warn_unresolved_variables(recipe, &mut warnings);

    // Check for circular dependencies
    if let Some(cycle) = find_cycle(&recipe.steps) {
        errors.push(ValidationError {
            step_id: None,
            message: format!("Circular dependency detected: {}", cycle.join(" -> ")),
        });
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Validate a single step
fn validate_step(step: &Step, errors: &mut Vec<ValidationError>, warnings: &mut Vec<ValidationWarning>) {
    // Check for empty step ID
    if step.id.trim().is_empty() {
        errors.push(ValidationError {
            step_id: Some(step.id.clone()),
            message: "Step ID cannot be empty".to_string(),
        });
    }

    // Check ID format (alphanumeric + underscore + hyphen)
    if !step
        .id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        warnings.push(ValidationWarning {
            step_id: Some(step.id.clone()),
            message: "Step ID should only contain alphanumeric characters, underscores, and hyphens"
                .to_string(),
        });
    }

    // Validate retry configuration
    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            warnings.push(ValidationWarning {
                step_id: Some(step.id.clone()),
                message: "Retry max_attempts is 0, the step runs once".to_string(),
            });
        }
    }

    if let Some(0) = step.timeout_secs {
        warnings.push(ValidationWarning {
            step_id: Some(step.id.clone()),
            message: "timeout_secs is 0, every attempt times out immediately".to_string(),
        });
    }
}

/// Group members must exist, must not be the group itself, and belong to one group.
fn validate_groups(recipe: &Recipe, step_ids: &HashSet<&String>, errors: &mut Vec<ValidationError>) {
    let mut owner: HashMap<&str, &str> = HashMap::new();
    for step in &recipe.steps {
        let Operation::Group(group) = &step.operation else {
            continue;
        };
        if group.steps.is_empty() {
            errors.push(ValidationError {
                step_id: Some(step.id.clone()),
                message: "Group has no steps".to_string(),
            });
        }
        for member in &group.steps {
            if member == &step.id {
                errors.push(ValidationError {
                    step_id: Some(step.id.clone()),
                    message: "Group cannot contain itself".to_string(),
                });
            } else if !step_ids.contains(member) {
                errors.push(ValidationError {
                    step_id: Some(step.id.clone()),
                    message: format!("Unknown group member: {member}"),
                });
            } else if let Some(prev) = owner.insert(member, &step.id) {
                errors.push(ValidationError {
                    step_id: Some(step.id.clone()),
                    message: format!("Step {member} already belongs to group {prev}"),
                });
            }
        }
    }
}

/// Variables a step defines for the steps after it.
fn defined_variables(step: &Step) -> Vec<&str> {
    let defined = match &step.operation {
        Operation::RunCommands(op) => op.capture_output.as_deref(),
        Operation::SshCommand(op) => op.capture_output.as_deref(),
        Operation::TmuxCapture(op) => op.capture_output.as_deref(),
        Operation::HttpRequest(op) => op.capture_response.as_deref(),
        Operation::SetVar(op) => Some(op.name.as_str()),
        Operation::GetValue(op) => Some(op.var_name.as_str()),
        _ => None,
    };
    defined.into_iter().collect()
}

/// References nothing can define stay verbatim at run time; flag them early.
fn warn_unresolved_variables(recipe: &Recipe, warnings: &mut Vec<ValidationWarning>) {
    let mut known: HashSet<&str> = recipe.variables.keys().map(String::as_str).collect();
    known.insert("target");
    for step in &recipe.steps {
        known.extend(defined_variables(step));
    }

    for step in &recipe.steps {
        let mut text = serde_json::to_string(&step.operation).unwrap_or_default();
        if let Some(guard) = &step.when {
            text.push_str(&serde_json::to_string(guard).unwrap_or_default());
        }
        for name in unresolved_references(&text) {
            if name.starts_with('_') || known.contains(name.as_str()) {
                continue;
            }
            warnings.push(ValidationWarning {
                step_id: Some(step.id.clone()),
                message: format!("Undefined variable: ${{{name}}}"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_recipe() {
        let toml = r#"
[recipe]
name = "test"
version = "1.0"

[variables]
host = "my-host"

[[step]]
id = "step1"
ssh_command = { host_id = "${host}", command = "echo hello" }
"#;

        let recipe = parse_recipe(toml).unwrap();
        assert_eq!(recipe.name, "test");
        assert_eq!(recipe.steps.len(), 1);
        assert_eq!(recipe.variables["host"], "my-host");
        assert!(validate_recipe(&recipe).valid);
    }

    #[test]
    fn test_parse_error_is_validation() {
        let err = parse_recipe("[recipe]\nname = \"x\"\n\n[[step]]\nid = \"a\"\n").unwrap_err();
        assert_eq!(err.code, "validation");
        assert!(err.message.contains("no operation"));
    }

    #[test]
    fn test_validate_circular_dependency() {
        let toml = r#"
[recipe]
name = "circular"

[[step]]
id = "a"
depends_on = ["c"]
ssh_command = { host_id = "h", command = "a" }

[[step]]
id = "b"
depends_on = ["a"]
ssh_command = { host_id = "h", command = "b" }

[[step]]
id = "c"
depends_on = ["b"]
ssh_command = { host_id = "h", command = "c" }
"#;

        let recipe = parse_recipe(toml).unwrap();
        let result = validate_recipe(&recipe);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.message.contains("Circular")));
    }

    #[test]
    fn test_validate_dependencies_and_groups() {
        let toml = r#"
[recipe]
name = "groups"

[[step]]
id = "a"
depends_on = ["a", "missing"]
sleep = { duration_secs = 1 }

[[step]]
id = "g1"
group = { steps = ["a", "ghost"] }

[[step]]
id = "g2"
group = { mode = "parallel", steps = ["a"] }
"#;

        let recipe = parse_recipe(toml).unwrap();
        let result = validate_recipe(&recipe);
        let messages: Vec<&str> = result.errors.iter().map(|e| e.message.as_str()).collect();
        assert!(messages.contains(&"Step cannot depend on itself"));
        assert!(messages.contains(&"Unknown dependency: missing"));
        assert!(messages.contains(&"Unknown group member: ghost"));
        assert!(messages.contains(&"Step a already belongs to group g1"));
    }

    #[test]
    fn test_undefined_variables_are_warnings() {
        let toml = r#"
[recipe]
name = "vars"

[variables]
model = "llama"

[[step]]
id = "gpu_info"
ssh_command = { host_id = "${target}", command = "nvidia-smi", capture_output = "gpu" }

[[step]]
id = "train"
depends_on = ["gpu_info"]
run_commands = { commands = "train ${model} ${gpu} ${epochs} ${secret:wandb}" }
"#;

        let recipe = parse_recipe(toml).unwrap();
        let result = validate_recipe(&recipe);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].step_id.as_deref(), Some("train"));
        assert!(result.warnings[0].message.contains("${epochs}"));
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("demo.toml");
        let recipe = parse_recipe(
            r#"
[recipe]
name = "demo"
description = "roundtrip"

[[step]]
id = "wait"
when = { not = { var_equals = { name = "fast", value = "1" } } }
sleep = { duration_secs = 3 }
"#,
        )
        .unwrap();

        save_recipe(&path, &recipe).await.unwrap();
        let loaded = load_recipe(&path).await.unwrap();
        assert_eq!(loaded.steps, recipe.steps);

        let summary = get_recipe_summary(&path).await.unwrap();
        assert_eq!(summary.name, "demo");
        assert_eq!(summary.step_count, 1);
    }
}
