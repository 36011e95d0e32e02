//! Interactive execution aggregate
//!
//! One [`InteractiveExecution`] exists per run. It is mutated only by the
//! runner while holding the execution's lock; the methods here are the
//! synchronous rules (which command is legal in which status, how skips
//! propagate) so they can be checked without spinning up a driver.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::graph::{self, OrderPlan};
use super::run_logs::now_rfc3339;
use super::types::{Recipe, Step, StepStatus};
use crate::error::AppError;

/// State of an interactive execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveExecution {
    pub id: String,
    pub recipe_path: String,
    pub recipe_name: String,
    /// Host the run targets (also exposed as the `target` variable)
    pub host_id: String,
    pub status: InteractiveStatus,
    /// While set, nothing is dispatched and no input is delivered
    pub intervention_locked: bool,
    pub current_step: Option<String>,
    pub steps: Vec<InteractiveStepState>,
    /// Latest progress message keyed by step_id
    #[serde(default)]
    pub step_progress: HashMap<String, String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub pending_input: Option<PendingInput>,
    #[serde(default)]
    pub failed_step: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Execution this one was rerun from
    #[serde(default)]
    pub rerun_of: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InteractiveStatus {
    /// Waiting to start
    Pending,
    /// Connecting to host
    Connecting,
    Running,
    /// Paused by user
    Paused,
    /// A running operation is blocked on operator input
    WaitingForInput,
    Completed,
    Failed,
    /// Cancelled by user
    Cancelled,
}

impl InteractiveStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InteractiveStatus::Completed | InteractiveStatus::Failed | InteractiveStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InteractiveStatus::Pending => "pending",
            InteractiveStatus::Connecting => "connecting",
            InteractiveStatus::Running => "running",
            InteractiveStatus::Paused => "paused",
            InteractiveStatus::WaitingForInput => "waiting_for_input",
            InteractiveStatus::Completed => "completed",
            InteractiveStatus::Failed => "failed",
            InteractiveStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractiveStepState {
    pub step_id: String,
    pub name: Option<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    /// Captured output (truncated)
    #[serde(default)]
    pub output: Option<String>,
}

impl InteractiveStepState {
    pub fn from_step(step: &Step) -> Self {
        Self {
            step_id: step.id.clone(),
            name: step.name.clone(),
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
            output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingInput {
    pub step_id: String,
    pub prompt: String,
    pub is_password: bool,
}

impl InteractiveExecution {
    pub fn new(
        id: String,
        recipe: &Recipe,
        recipe_path: String,
        host_id: String,
        variables: HashMap<String, String>,
    ) -> Self {
        let now = now_rfc3339();
        let mut steps: Vec<InteractiveStepState> =
            recipe.steps.iter().map(InteractiveStepState::from_step).collect();
        graph::refresh_waiting(&recipe.steps, &mut steps);
        Self {
            id,
            recipe_path,
            recipe_name: recipe.name.clone(),
            host_id,
            status: InteractiveStatus::Pending,
            intervention_locked: false,
            current_step: None,
            steps,
            step_progress: HashMap::new(),
            variables,
            pending_input: None,
            failed_step: None,
            error: None,
            rerun_of: None,
            created_at: now.clone(),
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&InteractiveStepState> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut InteractiveStepState> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn set_step_status(&mut self, step_id: &str, status: StepStatus) {
        if let Some(step) = self.step_mut(step_id) {
            step.status = status;
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = now_rfc3339();
    }

    /// Reject any command once the run has finished.
    pub fn ensure_active(&self, action: &str) -> Result<(), AppError> {
        if self.status.is_terminal() {
            return Err(AppError::invalid_state(format!(
                "Cannot {action}: execution is {}",
                self.status.as_str()
            )));
        }
        Ok(())
    }

    pub fn ensure_status(&self, allowed: &[InteractiveStatus], action: &str) -> Result<(), AppError> {
        self.ensure_active(action)?;
        if !allowed.contains(&self.status) {
            return Err(AppError::invalid_state(format!(
                "Cannot {action} while execution is {}",
                self.status.as_str()
            )));
        }
        Ok(())
    }

    /// Skip a step that has not started, or unskip one before the run starts.
    pub fn toggle_skip(&mut self, recipe_steps: &[Step], step_id: &str) -> Result<StepStatus, AppError> {
        self.ensure_active("toggle skip")?;
        let run_started = self.status != InteractiveStatus::Pending;
        let step = self
            .step_mut(step_id)
            .ok_or_else(|| AppError::not_found(format!("Step not found: {step_id}")))?;

        let next = match step.status {
            StepStatus::Pending | StepStatus::Waiting => StepStatus::Skipped,
            StepStatus::Skipped if !run_started => StepStatus::Pending,
            StepStatus::Skipped => {
                return Err(AppError::invalid_state(format!(
                    "Step {step_id} can only be unskipped before the run starts"
                )))
            }
            other => {
                return Err(AppError::invalid_state(format!(
                    "Cannot toggle skip for step {step_id} in status {other:?}"
                )))
            }
        };
        step.status = next;
        graph::refresh_waiting(recipe_steps, &mut self.steps);
        self.touch();
        Ok(next)
    }

    /// Mark every step ordered before `step_id` as skipped.
    pub fn skip_before(&mut self, plan: &OrderPlan, step_id: &str) -> Result<(), AppError> {
        let before: Vec<String> = plan
            .before(step_id)
            .ok_or_else(|| AppError::not_found(format!("Step not found: {step_id}")))?
            .to_vec();
        for id in before {
            if let Some(step) = self.step_mut(&id) {
                step.status = StepStatus::Skipped;
            }
        }
        Ok(())
    }

    /// Variables carried into a rerun: internal `_` keys and `target` dropped.
    pub fn rerun_variables(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .filter(|(k, _)| !k.starts_with('_') && k.as_str() != "target")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Mark unfinished steps cancelled.
    pub fn cancel_open_steps(&mut self) {
        for step in &mut self.steps {
            if matches!(step.status, StepStatus::Running | StepStatus::Retrying) {
                step.status = StepStatus::Cancelled;
            }
        }
    }
}

/// Short summary for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: String,
    pub recipe_name: String,
    pub host_id: String,
    pub status: InteractiveStatus,
    pub current_step: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&InteractiveExecution> for ExecutionSummary {
    fn from(e: &InteractiveExecution) -> Self {
        Self {
            id: e.id.clone(),
            recipe_name: e.recipe_name.clone(),
            host_id: e.host_id.clone(),
            status: e.status,
            current_step: e.current_step.clone(),
            created_at: e.created_at.clone(),
            updated_at: e.updated_at.clone(),
        }
    }
}
