//! Typed execution events and their per-execution fan-out.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::AppError;

/// Events emitted during interactive execution
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractiveEvent {
    ExecutionStarted {
        execution_id: String,
    },
    /// Host handshake finished
    ExecutionConnected {
        execution_id: String,
        host_id: String,
    },
    StepStarted {
        execution_id: String,
        step_id: String,
        /// Redacted description of the operation
        command: Option<String>,
    },
    StepProgress {
        execution_id: String,
        step_id: String,
        message: String,
    },
    StepRetrying {
        execution_id: String,
        step_id: String,
        attempt: u32,
        delay_secs: f64,
        error: String,
    },
    StepCompleted {
        execution_id: String,
        step_id: String,
    },
    StepFailed {
        execution_id: String,
        step_id: String,
        error: String,
    },
    StepSkipped {
        execution_id: String,
        step_id: String,
        reason: String,
    },
    /// About to dispatch (intervention point)
    CommandPending {
        execution_id: String,
        step_id: String,
        command: String,
    },
    CommandSent {
        execution_id: String,
        step_id: String,
        command: String,
    },
    InterventionLockChanged {
        execution_id: String,
        locked: bool,
    },
    /// A running operation is blocked on operator input
    WaitingForConfirmation {
        execution_id: String,
        step_id: String,
        prompt: String,
        is_password: bool,
    },
    InputReceived {
        execution_id: String,
        step_id: String,
    },
    ExecutionPaused {
        execution_id: String,
    },
    ExecutionResumed {
        execution_id: String,
    },
    ExecutionCompleted {
        execution_id: String,
    },
    ExecutionFailed {
        execution_id: String,
        error: String,
    },
    ExecutionCancelled {
        execution_id: String,
    },
}

impl InteractiveEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            InteractiveEvent::ExecutionStarted { execution_id }
            | InteractiveEvent::ExecutionConnected { execution_id, .. }
            | InteractiveEvent::StepStarted { execution_id, .. }
            | InteractiveEvent::StepProgress { execution_id, .. }
            | InteractiveEvent::StepRetrying { execution_id, .. }
            | InteractiveEvent::StepCompleted { execution_id, .. }
            | InteractiveEvent::StepFailed { execution_id, .. }
            | InteractiveEvent::StepSkipped { execution_id, .. }
            | InteractiveEvent::CommandPending { execution_id, .. }
            | InteractiveEvent::CommandSent { execution_id, .. }
            | InteractiveEvent::InterventionLockChanged { execution_id, .. }
            | InteractiveEvent::WaitingForConfirmation { execution_id, .. }
            | InteractiveEvent::InputReceived { execution_id, .. }
            | InteractiveEvent::ExecutionPaused { execution_id }
            | InteractiveEvent::ExecutionResumed { execution_id }
            | InteractiveEvent::ExecutionCompleted { execution_id }
            | InteractiveEvent::ExecutionFailed { execution_id, .. }
            | InteractiveEvent::ExecutionCancelled { execution_id } => execution_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InteractiveEvent::ExecutionCompleted { .. }
                | InteractiveEvent::ExecutionFailed { .. }
                | InteractiveEvent::ExecutionCancelled { .. }
        )
    }
}

/// Broadcast channels keyed by execution id.
pub struct EventHub {
    channels: Mutex<HashMap<String, broadcast::Sender<InteractiveEvent>>>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<InteractiveEvent>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, execution_id: &str) {
        self.channels()
            .entry(execution_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Deliver to current subscribers of the event's execution.
    pub fn publish(&self, event: InteractiveEvent) {
        let channels = self.channels();
        match channels.get(event.execution_id()) {
            // No receivers is not an error.
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => {
                tracing::debug!(execution_id = event.execution_id(), "event for unregistered execution dropped");
            }
        }
    }

    pub fn subscribe(&self, execution_id: &str) -> Result<broadcast::Receiver<InteractiveEvent>, AppError> {
        self.channels()
            .get(execution_id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| AppError::not_found(format!("Execution not found: {execution_id}")))
    }
}
