//! Interactive execution runner
//!
//! [`RecipeRunner`] owns every live execution. Each one has a slot holding
//! the recipe, its resolved plan and the [`InteractiveExecution`] aggregate
//! behind an async mutex. Operator commands take that mutex, check the
//! transition against the aggregate and wake the driver; the driver is a
//! spawned task that walks the plan, dispatching one step at a time and
//! re-checking pause, lock and cancellation at every step boundary.
//!
//! Collaborators are only awaited with the mutex released.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::{broadcast, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinError;

use super::events::{EventHub, InteractiveEvent};
use super::execution::{self, DispatchContext, Intent, Outcome};
use super::graph::{self, OrderPlan};
use super::interactive::{
    ExecutionSummary, InteractiveExecution, InteractiveStatus, PendingInput,
};
use super::operations::conditions::{self, EvalContext};
use super::operations::{Collaborators, StepIo};
use super::parser::{load_recipe, validate_recipe};
use super::retry::RetryPolicy;
use super::run_logs::{now_rfc3339, LogAppended, RecipeLogChunk, RecipeLogEntry, RecipeLogStream, RunLogs};
use super::store::{ExecutionStore, JsonExecutionStore, NoopStore};
use super::types::{GroupMode, Operation, Recipe, Step, StepStatus};
use crate::config::EngineConfig;
use crate::error::AppError;

/// How an execution is set up before it starts.
#[derive(Debug, Clone, Default)]
pub struct PrepareRequest {
    pub recipe_path: String,
    pub host_id: String,
    /// Overrides on top of the recipe's `[variables]`
    pub variables: HashMap<String, String>,
    /// Skip every step ordered before this one
    pub start_step_id: Option<String>,
}

struct ExecutionSlot {
    id: String,
    recipe: Recipe,
    plan: OrderPlan,
    group_children: HashSet<String>,
    state: Mutex<InteractiveExecution>,
    /// Answer channel for the prompt in `pending_input`
    input: Mutex<Option<oneshot::Sender<String>>>,
    /// Bumped on every command the driver may be waiting on
    wake: watch::Sender<u64>,
    interrupts: watch::Sender<u64>,
    cancel: watch::Sender<bool>,
    status: watch::Sender<InteractiveStatus>,
}

impl ExecutionSlot {
    fn wake(&self) {
        self.wake.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn set_status(&self, exec: &mut InteractiveExecution, status: InteractiveStatus) {
        exec.status = status;
        exec.touch();
        self.status.send_replace(status);
    }
}

enum StepOutcome {
    Succeeded,
    Skipped,
    Failed(AppError),
    /// The execution went terminal underneath the step
    Stopped,
}

enum RunEnd {
    Completed,
    Failed {
        step_id: Option<String>,
        error: String,
    },
    Stopped,
}

struct RunnerInner {
    config: EngineConfig,
    collaborators: Collaborators,
    executions: RwLock<HashMap<String, Arc<ExecutionSlot>>>,
    events: EventHub,
    logs: RunLogs,
    store: Arc<dyn ExecutionStore>,
}

/// Cheap to clone; every clone drives the same set of executions.
#[derive(Clone)]
pub struct RecipeRunner {
    inner: Arc<RunnerInner>,
}

impl RecipeRunner {
    /// Persistence follows `config`: snapshots and log mirrors go under the
    /// data directory unless disabled.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let store: Arc<dyn ExecutionStore> = if config.persist_executions {
            Arc::new(JsonExecutionStore::new(config.executions_dir()))
        } else {
            Arc::new(NoopStore)
        };
        Self::with_store(config, collaborators, store)
    }

    pub fn with_store(
        config: EngineConfig,
        collaborators: Collaborators,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let mirror = config.persist_logs.then(|| config.logs_dir());
        let logs = RunLogs::new(mirror, config.log_read_max_bytes, config.event_capacity);
        let events = EventHub::new(config.event_capacity);
        Self {
            inner: Arc::new(RunnerInner {
                config,
                collaborators,
                executions: RwLock::new(HashMap::new()),
                events,
                logs,
                store,
            }),
        }
    }

    // ------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------

    /// Validate `recipe` and register a pending execution for it.
    pub async fn prepare(
        &self,
        recipe: Recipe,
        request: PrepareRequest,
    ) -> Result<InteractiveExecution, AppError> {
        self.prepare_inner(recipe, request, None).await
    }

    pub async fn prepare_from_path(
        &self,
        path: &Path,
        mut request: PrepareRequest,
    ) -> Result<InteractiveExecution, AppError> {
        let recipe = load_recipe(path).await?;
        if request.recipe_path.is_empty() {
            request.recipe_path = path.to_string_lossy().to_string();
        }
        self.prepare(recipe, request).await
    }

    async fn prepare_inner(
        &self,
        recipe: Recipe,
        request: PrepareRequest,
        rerun_of: Option<String>,
    ) -> Result<InteractiveExecution, AppError> {
        if request.host_id.trim().is_empty() {
            return Err(AppError::invalid_input("host_id is required"));
        }
        let validation = validate_recipe(&recipe);
        if !validation.valid {
            let messages: Vec<String> = validation
                .errors
                .iter()
                .map(|e| match &e.step_id {
                    Some(step) => format!("{step}: {}", e.message),
                    None => e.message.clone(),
                })
                .collect();
            return Err(AppError::validation(messages.join("; ")));
        }
        let plan = graph::resolve(&recipe.steps)?;

        let mut variables = recipe.variables.clone();
        variables.extend(request.variables);
        variables.insert("target".to_string(), request.host_id.clone());

        let id = uuid::Uuid::new_v4().to_string();
        variables.insert("_execution_id".to_string(), id.clone());

        let mut exec = InteractiveExecution::new(
            id.clone(),
            &recipe,
            request.recipe_path,
            request.host_id,
            variables,
        );
        exec.rerun_of = rerun_of;
        if let Some(start) = request.start_step_id.as_deref() {
            exec.skip_before(&plan, start)?;
            graph::refresh_waiting(&recipe.steps, &mut exec.steps);
        }

        let inner = &self.inner;
        inner.logs.open(&id).await?;
        inner.events.register(&id);

        let slot = Arc::new(ExecutionSlot {
            id: id.clone(),
            group_children: graph::group_children(&recipe.steps),
            recipe,
            plan,
            state: Mutex::new(exec.clone()),
            input: Mutex::new(None),
            wake: watch::channel(0).0,
            interrupts: watch::channel(0).0,
            cancel: watch::channel(false).0,
            status: watch::channel(InteractiveStatus::Pending).0,
        });
        inner.executions.write().await.insert(id.clone(), slot);

        let origin = match &exec.rerun_of {
            Some(prev) => format!(" (rerun of {prev})"),
            None => String::new(),
        };
        self.log(&id, None, format!("Prepared recipe '{}' on {}{origin}", exec.recipe_name, exec.host_id))
            .await;
        self.persist(&exec).await;
        tracing::info!(execution_id = %id, recipe = %exec.recipe_name, "prepared interactive execution");
        Ok(exec)
    }

    async fn slot(&self, execution_id: &str) -> Result<Arc<ExecutionSlot>, AppError> {
        self.inner
            .executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("Execution not found: {execution_id}")))
    }

    // ------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------

    pub async fn start(&self, execution_id: &str) -> Result<InteractiveExecution, AppError> {
        let slot = self.slot(execution_id).await?;
        let snapshot = {
            let mut exec = slot.state.lock().await;
            exec.ensure_status(&[InteractiveStatus::Pending], "start")?;
            exec.started_at = Some(now_rfc3339());
            slot.set_status(&mut exec, InteractiveStatus::Connecting);
            self.emit(InteractiveEvent::ExecutionStarted {
                execution_id: slot.id.clone(),
            });
            exec.clone()
        };
        self.log(&slot.id, None, format!("Connecting to {}", snapshot.host_id)).await;
        self.persist(&snapshot).await;

        let runner = self.clone();
        tokio::spawn(async move { runner.drive(slot).await });
        Ok(snapshot)
    }

    /// Takes effect at the next step boundary; the step in flight finishes.
    pub async fn pause(&self, execution_id: &str) -> Result<InteractiveExecution, AppError> {
        let slot = self.slot(execution_id).await?;
        let snapshot = {
            let mut exec = slot.state.lock().await;
            exec.ensure_status(
                &[InteractiveStatus::Running, InteractiveStatus::WaitingForInput],
                "pause",
            )?;
            slot.set_status(&mut exec, InteractiveStatus::Paused);
            self.emit(InteractiveEvent::ExecutionPaused {
                execution_id: slot.id.clone(),
            });
            exec.clone()
        };
        slot.wake();
        self.log(&slot.id, None, "Execution paused").await;
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    pub async fn resume(&self, execution_id: &str) -> Result<InteractiveExecution, AppError> {
        let slot = self.slot(execution_id).await?;
        let snapshot = {
            let mut exec = slot.state.lock().await;
            exec.ensure_status(&[InteractiveStatus::Paused], "resume")?;
            let next = if exec.pending_input.is_some() {
                InteractiveStatus::WaitingForInput
            } else {
                InteractiveStatus::Running
            };
            slot.set_status(&mut exec, next);
            self.emit(InteractiveEvent::ExecutionResumed {
                execution_id: slot.id.clone(),
            });
            exec.clone()
        };
        slot.wake();
        self.log(&slot.id, None, "Execution resumed").await;
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Interrupt the operation in flight (Ctrl+C). The run itself continues;
    /// the interrupted step fails or retries like any other failure.
    pub async fn interrupt(&self, execution_id: &str) -> Result<(), AppError> {
        let slot = self.slot(execution_id).await?;
        {
            let exec = slot.state.lock().await;
            exec.ensure_active("interrupt")?;
            if exec.status == InteractiveStatus::Pending {
                return Err(AppError::invalid_state("Cannot interrupt: execution has not started"));
            }
        }
        slot.interrupts.send_modify(|n| *n = n.wrapping_add(1));
        self.log(&slot.id, None, "Interrupt sent").await;
        Ok(())
    }

    pub async fn cancel(&self, execution_id: &str) -> Result<InteractiveExecution, AppError> {
        let slot = self.slot(execution_id).await?;
        let snapshot = {
            let mut exec = slot.state.lock().await;
            exec.ensure_active("cancel")?;
            exec.cancel_open_steps();
            exec.pending_input = None;
            exec.current_step = None;
            exec.completed_at = Some(now_rfc3339());
            slot.set_status(&mut exec, InteractiveStatus::Cancelled);
            slot.input.lock().await.take();
            self.emit(InteractiveEvent::ExecutionCancelled {
                execution_id: slot.id.clone(),
            });
            exec.clone()
        };
        slot.cancel.send_replace(true);
        slot.wake();
        self.log(&slot.id, None, "Execution cancelled").await;
        self.persist(&snapshot).await;
        tracing::info!(execution_id = %slot.id, "interactive execution cancelled");
        Ok(snapshot)
    }

    /// Answer the prompt the running step is blocked on.
    pub async fn send_input(&self, execution_id: &str, data: &str) -> Result<(), AppError> {
        let slot = self.slot(execution_id).await?;
        let snapshot = {
            let mut exec = slot.state.lock().await;
            exec.ensure_active("send input")?;
            if exec.intervention_locked {
                return Err(AppError::intervention_conflict(
                    "Intervention lock is held; input is not accepted",
                ));
            }
            exec.ensure_status(&[InteractiveStatus::WaitingForInput], "send input")?;
            let responder = slot
                .input
                .lock()
                .await
                .take()
                .ok_or_else(|| AppError::invalid_state("No prompt is waiting for input"))?;
            let step_id = exec
                .pending_input
                .take()
                .map(|p| p.step_id)
                .unwrap_or_default();
            if responder.send(data.to_string()).is_err() {
                return Err(AppError::invalid_state("The prompt is no longer waiting for input"));
            }
            slot.set_status(&mut exec, InteractiveStatus::Running);
            self.emit(InteractiveEvent::InputReceived {
                execution_id: slot.id.clone(),
                step_id,
            });
            exec.clone()
        };
        slot.wake();
        self.log(&slot.id, snapshot.current_step.as_deref(), "Input received").await;
        self.persist(&snapshot).await;
        Ok(())
    }

    /// While the lock is held no step is dispatched and no input is delivered.
    pub async fn set_intervention_lock(
        &self,
        execution_id: &str,
        locked: bool,
    ) -> Result<InteractiveExecution, AppError> {
        let slot = self.slot(execution_id).await?;
        let snapshot = {
            let mut exec = slot.state.lock().await;
            exec.ensure_active("change intervention lock")?;
            exec.intervention_locked = locked;
            exec.touch();
            self.emit(InteractiveEvent::InterventionLockChanged {
                execution_id: slot.id.clone(),
                locked,
            });
            exec.clone()
        };
        slot.wake();
        let msg = if locked {
            "Intervention lock acquired"
        } else {
            "Intervention lock released"
        };
        self.log(&slot.id, None, msg).await;
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    pub async fn toggle_skip_step(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> Result<InteractiveExecution, AppError> {
        let slot = self.slot(execution_id).await?;
        let (snapshot, status) = {
            let mut exec = slot.state.lock().await;
            let status = exec.toggle_skip(&slot.recipe.steps, step_id)?;
            if status == StepStatus::Skipped {
                self.emit(InteractiveEvent::StepSkipped {
                    execution_id: slot.id.clone(),
                    step_id: step_id.to_string(),
                    reason: "skipped by operator".to_string(),
                });
            }
            (exec.clone(), status)
        };
        slot.wake();
        let msg = if status == StepStatus::Skipped {
            "Step marked skipped"
        } else {
            "Step unskipped"
        };
        self.log(&slot.id, Some(step_id), msg).await;
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Prepare a fresh execution of the same recipe that starts at `step_id`.
    ///
    /// The source execution is left untouched, so this works from any status.
    pub async fn rerun_from(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> Result<InteractiveExecution, AppError> {
        let (recipe, source) = match self.slot(execution_id).await {
            Ok(slot) => (slot.recipe.clone(), slot.state.lock().await.clone()),
            Err(_) => {
                let source = self
                    .inner
                    .store
                    .load(execution_id)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("Execution not found: {execution_id}")))?;
                (load_recipe(Path::new(&source.recipe_path)).await?, source)
            }
        };
        if recipe.step(step_id).is_none() {
            return Err(AppError::not_found(format!("Step not found: {step_id}")));
        }

        let request = PrepareRequest {
            recipe_path: source.recipe_path.clone(),
            host_id: source.host_id.clone(),
            variables: source.rerun_variables(),
            start_step_id: Some(step_id.to_string()),
        };
        self.prepare_inner(recipe, request, Some(source.id)).await
    }

    /// Re-attach the operator's terminal after it dropped.
    pub async fn reconnect_terminal(&self, execution_id: &str) -> Result<(), AppError> {
        let slot = self.slot(execution_id).await?;
        let host_id = {
            let exec = slot.state.lock().await;
            exec.ensure_active("reconnect terminal")?;
            exec.host_id.clone()
        };
        self.inner.collaborators.host.reattach(&host_id).await?;
        self.log(&slot.id, None, "Terminal reconnected").await;
        Ok(())
    }

    // ------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------

    pub async fn get(&self, execution_id: &str) -> Result<InteractiveExecution, AppError> {
        if let Ok(slot) = self.slot(execution_id).await {
            return Ok(slot.state.lock().await.clone());
        }
        self.inner
            .store
            .load(execution_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Execution not found: {execution_id}")))
    }

    /// Live and persisted executions, newest first.
    pub async fn list(&self) -> Result<Vec<ExecutionSummary>, AppError> {
        let slots: Vec<Arc<ExecutionSlot>> =
            self.inner.executions.read().await.values().cloned().collect();
        let mut out: Vec<InteractiveExecution> = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.state.lock().await.clone());
        }
        let live: HashSet<String> = out.iter().map(|e| e.id.clone()).collect();
        for stored in self.inner.store.list().await? {
            if !live.contains(&stored.id) {
                out.push(stored);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out.iter().map(ExecutionSummary::from).collect())
    }

    /// Wait until the execution reaches a terminal status.
    pub async fn wait(&self, execution_id: &str) -> Result<InteractiveExecution, AppError> {
        let slot = self.slot(execution_id).await?;
        let mut rx = slot.status.subscribe();
        loop {
            if rx.borrow_and_update().is_terminal() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        let exec = slot.state.lock().await.clone();
        Ok(exec)
    }

    pub fn subscribe_events(
        &self,
        execution_id: &str,
    ) -> Result<broadcast::Receiver<InteractiveEvent>, AppError> {
        self.inner.events.subscribe(execution_id)
    }

    pub async fn subscribe_logs(
        &self,
        execution_id: &str,
    ) -> Result<broadcast::Receiver<LogAppended>, AppError> {
        self.ensure_logs(execution_id).await?;
        self.inner.logs.subscribe(execution_id).await
    }

    pub async fn log_read(
        &self,
        execution_id: &str,
        cursor: Option<u64>,
        max_bytes: Option<u64>,
    ) -> Result<RecipeLogChunk, AppError> {
        self.ensure_logs(execution_id).await?;
        self.inner.logs.read(execution_id, cursor, max_bytes).await
    }

    pub async fn log_tail(
        &self,
        execution_id: &str,
        limit: usize,
    ) -> Result<Vec<RecipeLogEntry>, AppError> {
        self.ensure_logs(execution_id).await?;
        self.inner.logs.tail(execution_id, limit).await
    }

    pub async fn log_clear(&self, execution_id: &str) -> Result<(), AppError> {
        self.ensure_logs(execution_id).await?;
        self.inner.logs.clear(execution_id).await
    }

    /// Logs of executions from an earlier process are replayed on demand.
    async fn ensure_logs(&self, execution_id: &str) -> Result<(), AppError> {
        if self.slot(execution_id).await.is_ok() {
            return Ok(());
        }
        if self.inner.store.load(execution_id).await?.is_none() {
            return Err(AppError::not_found(format!("Execution not found: {execution_id}")));
        }
        self.inner.logs.open(execution_id).await
    }

    // ------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------

    fn emit(&self, event: InteractiveEvent) {
        self.inner.events.publish(event);
    }

    async fn log(&self, execution_id: &str, step_id: Option<&str>, message: impl Into<String>) {
        self.append(execution_id, RecipeLogEntry::system(step_id, message)).await;
    }

    async fn append(&self, execution_id: &str, entry: RecipeLogEntry) {
        if let Err(e) = self.inner.logs.append_one(execution_id, entry).await {
            tracing::warn!(execution_id, "failed to append run log: {}", e.message);
        }
    }

    async fn persist(&self, exec: &InteractiveExecution) {
        if let Err(e) = self.inner.store.save(exec).await {
            tracing::warn!(execution_id = %exec.id, "failed to persist execution: {}", e.message);
        }
    }

    // ------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------

    /// Steps run on their own task so a panic below fails the execution
    /// instead of leaving it running forever.
    async fn drive(self, slot: Arc<ExecutionSlot>) {
        let mut cancel = slot.cancel.subscribe();
        let worker = {
            let runner = self.clone();
            let slot = slot.clone();
            tokio::spawn(async move { runner.run_steps(&slot).await })
        };
        let abort = worker.abort_handle();
        let end = tokio::select! {
            joined = worker => match joined {
                Ok(end) => end,
                Err(e) => self.driver_lost(&slot, e).await,
            },
            _ = cancelled(&mut cancel) => {
                abort.abort();
                RunEnd::Stopped
            }
        };
        self.finish(&slot, end).await;
    }

    async fn driver_lost(&self, slot: &ExecutionSlot, err: JoinError) -> RunEnd {
        let error = if err.is_panic() {
            "Execution driver panicked".to_string()
        } else {
            format!("Execution driver stopped: {err}")
        };
        tracing::error!(execution_id = %slot.id, "{error}: {err}");

        let mut exec = slot.state.lock().await;
        let open: Vec<String> = exec
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Running | StepStatus::Retrying))
            .map(|s| s.step_id.clone())
            .collect();
        for id in &open {
            if let Some(state) = exec.step_mut(id) {
                state.status = StepStatus::Failed;
                state.error = Some(error.clone());
            }
        }
        exec.pending_input = None;
        slot.input.lock().await.take();
        RunEnd::Failed {
            step_id: exec.current_step.clone().or_else(|| open.first().cloned()),
            error,
        }
    }

    async fn run_steps(&self, slot: &Arc<ExecutionSlot>) -> RunEnd {
        let host_id = slot.state.lock().await.host_id.clone();
        let limit = Duration::from_secs(self.inner.config.connect_timeout_secs);
        let connected = match tokio::time::timeout(limit, self.inner.collaborators.host.connect(&host_id)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout(format!(
                "Connection to {host_id} timed out after {}s",
                limit.as_secs()
            ))),
        };
        if let Err(e) = connected {
            return RunEnd::Failed {
                step_id: None,
                error: format!("Failed to connect to {host_id}: {}", e.message),
            };
        }

        {
            let mut exec = slot.state.lock().await;
            if exec.status.is_terminal() {
                return RunEnd::Stopped;
            }
            slot.set_status(&mut exec, InteractiveStatus::Running);
            self.emit(InteractiveEvent::ExecutionConnected {
                execution_id: slot.id.clone(),
                host_id: host_id.clone(),
            });
        }
        self.log(&slot.id, None, format!("Connected to {host_id}")).await;

        // First failure that left the remaining steps independent of it.
        let mut deferred: Option<(String, String)> = None;
        loop {
            if self.wait_for_dispatch(slot).await.is_err() {
                return RunEnd::Stopped;
            }
            let next = {
                let exec = slot.state.lock().await;
                graph::next_eligible(&slot.plan, &slot.recipe.steps, &exec.steps, &slot.group_children)
                    .map(str::to_string)
            };
            let Some(step_id) = next else { break };

            match self.run_step(slot, &step_id).await {
                StepOutcome::Succeeded | StepOutcome::Skipped => {}
                StepOutcome::Stopped => return RunEnd::Stopped,
                StepOutcome::Failed(err) => {
                    let tolerated = slot
                        .recipe
                        .step(&step_id)
                        .map(|s| s.continue_on_failure)
                        .unwrap_or(false);
                    if tolerated {
                        continue;
                    }
                    let dependents = graph::transitive_dependents(&slot.recipe.steps, &step_id);
                    let blocks_rest = {
                        let exec = slot.state.lock().await;
                        exec.steps
                            .iter()
                            .any(|s| s.status.is_unstarted() && dependents.contains(&s.step_id))
                    };
                    if blocks_rest {
                        return RunEnd::Failed {
                            step_id: Some(step_id),
                            error: err.message,
                        };
                    }
                    deferred.get_or_insert((step_id, err.message));
                }
            }
        }

        self.skip_unreached(slot).await;
        match deferred {
            Some((step_id, error)) => RunEnd::Failed {
                step_id: Some(step_id),
                error,
            },
            None => RunEnd::Completed,
        }
    }

    /// Block while paused or locked. Errors once the execution is terminal.
    async fn wait_for_dispatch(&self, slot: &ExecutionSlot) -> Result<(), AppError> {
        let mut wake = slot.wake.subscribe();
        loop {
            {
                let exec = slot.state.lock().await;
                if exec.status.is_terminal() {
                    return Err(AppError::cancelled(format!("Execution {}", exec.status.as_str())));
                }
                if exec.status != InteractiveStatus::Paused && !exec.intervention_locked {
                    return Ok(());
                }
            }
            if wake.changed().await.is_err() {
                return Err(AppError::internal("execution slot dropped"));
            }
        }
    }

    /// Steps left unstarted once nothing else is eligible, such as the
    /// children of a skipped group.
    async fn skip_unreached(&self, slot: &ExecutionSlot) {
        let skipped: Vec<String> = {
            let mut exec = slot.state.lock().await;
            let ids: Vec<String> = exec
                .steps
                .iter()
                .filter(|s| s.status.is_unstarted())
                .map(|s| s.step_id.clone())
                .collect();
            for id in &ids {
                exec.set_step_status(id, StepStatus::Skipped);
                self.emit(InteractiveEvent::StepSkipped {
                    execution_id: slot.id.clone(),
                    step_id: id.clone(),
                    reason: "not reached".to_string(),
                });
            }
            ids
        };
        for id in skipped {
            self.log(&slot.id, Some(&id), "Step not reached; marked skipped").await;
        }
    }

    fn run_step<'a>(&'a self, slot: &'a Arc<ExecutionSlot>, step_id: &'a str) -> BoxFuture<'a, StepOutcome> {
        async move {
            let Some(step) = slot.recipe.step(step_id) else {
                return StepOutcome::Failed(AppError::not_found(format!("Step not found: {step_id}")));
            };
            let vars = slot.state.lock().await.variables.clone();

            if let Some(guard) = &step.when {
                let ctx = EvalContext {
                    variables: &vars,
                    host: self.inner.collaborators.host.as_ref(),
                    storage: self.inner.collaborators.storage.as_ref(),
                };
                if !conditions::evaluate(guard, &ctx).await {
                    self.skip_step(slot, step, "condition not met").await;
                    return StepOutcome::Skipped;
                }
            }

            let description = execution::describe(&step.operation, &vars);
            {
                let mut exec = slot.state.lock().await;
                if exec.status.is_terminal() {
                    return StepOutcome::Stopped;
                }
                exec.current_step = Some(step.id.clone());
                if let Some(state) = exec.step_mut(&step.id) {
                    state.status = StepStatus::Running;
                    state.attempts = 0;
                    state.error = None;
                }
                exec.touch();
                self.emit(InteractiveEvent::StepStarted {
                    execution_id: slot.id.clone(),
                    step_id: step.id.clone(),
                    command: Some(description.clone()),
                });
                self.emit(InteractiveEvent::CommandPending {
                    execution_id: slot.id.clone(),
                    step_id: step.id.clone(),
                    command: description.clone(),
                });
            }
            self.log(&slot.id, Some(&step.id), format!("Starting step: {}", step.display_name()))
                .await;

            let intent = match execution::build_intent(&step.operation, &vars) {
                Ok(intent) => intent,
                Err(e) => {
                    self.fail_step(slot, &step.id, &e).await;
                    return StepOutcome::Failed(e);
                }
            };

            if self.wait_for_dispatch(slot).await.is_err() {
                return StepOutcome::Stopped;
            }
            self.emit(InteractiveEvent::CommandSent {
                execution_id: slot.id.clone(),
                step_id: step.id.clone(),
                command: description.clone(),
            });
            self.log(&slot.id, Some(&step.id), format!("$ {description}")).await;

            let policy = RetryPolicy::from_step(step);
            let result = policy
                .run(
                    |n| self.attempt(slot, step, &intent, n),
                    |n, err, delay| self.on_retry(slot, step, n, err, delay),
                )
                .await;

            match result {
                Ok(outcome) => {
                    self.complete_step(slot, &step.id, outcome).await;
                    StepOutcome::Succeeded
                }
                Err(e) => {
                    if slot.state.lock().await.status.is_terminal() {
                        return StepOutcome::Stopped;
                    }
                    self.settle_group_children(slot, step, &e).await;
                    self.fail_step(slot, &step.id, &e).await;
                    StepOutcome::Failed(e)
                }
            }
        }
        .boxed()
    }

    async fn attempt(
        &self,
        slot: &Arc<ExecutionSlot>,
        step: &Step,
        intent: &Intent,
        n: u32,
    ) -> Result<Outcome, AppError> {
        let (variables, step_outputs) = {
            let mut exec = slot.state.lock().await;
            if exec.status.is_terminal() {
                return Err(AppError::cancelled(format!("Execution {}", exec.status.as_str())));
            }
            if let Some(state) = exec.step_mut(&step.id) {
                state.attempts = n;
                state.status = StepStatus::Running;
            }
            exec.touch();
            let outputs: HashMap<String, String> = exec
                .steps
                .iter()
                .filter_map(|s| s.output.clone().map(|o| (s.step_id.clone(), o)))
                .collect();
            (exec.variables.clone(), outputs)
        };
        if n > 1 {
            self.log(&slot.id, Some(&step.id), format!("Attempt {n}")).await;
        }

        if let Intent::Group { mode, steps } = intent {
            return self.run_group(slot, step, *mode, steps).await;
        }

        let io = RunnerIo::new(self.clone(), slot.clone(), step.id.clone());
        let ctx = DispatchContext {
            collaborators: &self.inner.collaborators,
            variables: &variables,
            step_outputs: &step_outputs,
            io: &io,
        };
        execution::perform(intent, &ctx).await
    }

    async fn run_group(
        &self,
        slot: &Arc<ExecutionSlot>,
        group: &Step,
        mode: GroupMode,
        children: &[String],
    ) -> Result<Outcome, AppError> {
        let failed_fatally = |child: &str, outcome: &StepOutcome| match outcome {
            StepOutcome::Failed(_) => !slot
                .recipe
                .step(child)
                .map(|s| s.continue_on_failure)
                .unwrap_or(false),
            _ => false,
        };

        // Children that succeeded in an earlier attempt of the group stay done.
        let done: HashSet<String> = {
            let exec = slot.state.lock().await;
            children
                .iter()
                .filter(|c| exec.step(c).map(|s| s.status) == Some(StepStatus::Success))
                .cloned()
                .collect()
        };

        match mode {
            GroupMode::Sequential => {
                for (i, child) in children.iter().enumerate() {
                    if done.contains(child) {
                        continue;
                    }
                    let outcome = self.run_step(slot, child).await;
                    if matches!(outcome, StepOutcome::Stopped) {
                        return Err(AppError::cancelled("Execution stopped"));
                    }
                    if failed_fatally(child, &outcome) {
                        for rest in &children[i + 1..] {
                            self.skip_if_unstarted(slot, rest, "earlier step in group failed").await;
                        }
                        return Err(AppError::command(format!(
                            "Group {} failed at step {child}",
                            group.id
                        )));
                    }
                }
            }
            GroupMode::Parallel => {
                let todo: Vec<&String> = children.iter().filter(|c| !done.contains(*c)).collect();
                let outcomes = join_all(todo.iter().map(|child| self.run_step(slot, child))).await;
                if outcomes.iter().any(|o| matches!(o, StepOutcome::Stopped)) {
                    return Err(AppError::cancelled("Execution stopped"));
                }
                let failed: Vec<&str> = todo
                    .iter()
                    .copied()
                    .zip(outcomes.iter())
                    .filter(|(child, outcome)| failed_fatally(child, outcome))
                    .map(|(child, _)| child.as_str())
                    .collect();
                if !failed.is_empty() {
                    return Err(AppError::command(format!(
                        "Group {} failed: {}",
                        group.id,
                        failed.join(", ")
                    )));
                }
            }
        }
        Ok(Outcome::default())
    }

    async fn on_retry(&self, slot: &ExecutionSlot, step: &Step, attempt: u32, err: AppError, delay: Duration) {
        self.settle_group_children(slot, step, &err).await;
        let step_id = step.id.as_str();
        {
            let mut exec = slot.state.lock().await;
            clear_pending_input(slot, &mut exec, step_id).await;
            if let Some(state) = exec.step_mut(step_id) {
                state.status = StepStatus::Retrying;
                state.error = Some(err.message.clone());
            }
            exec.touch();
            self.emit(InteractiveEvent::StepRetrying {
                execution_id: slot.id.clone(),
                step_id: step_id.to_string(),
                attempt,
                delay_secs: delay.as_secs_f64(),
                error: err.message.clone(),
            });
        }
        self.log(
            &slot.id,
            Some(step_id),
            format!("Attempt {attempt} failed: {}; retrying in {:.1}s", err.message, delay.as_secs_f64()),
        )
        .await;
    }

    /// A group attempt that ended early (timeout, failure) drops its children
    /// mid-flight. Those still marked running are failed and their prompts
    /// withdrawn; nested groups are followed.
    async fn settle_group_children(&self, slot: &ExecutionSlot, step: &Step, err: &AppError) {
        let Operation::Group(group) = &step.operation else {
            return;
        };
        let mut stack: Vec<&str> = group.steps.iter().map(String::as_str).collect();
        let mut settled = Vec::new();
        {
            let mut exec = slot.state.lock().await;
            if exec.status.is_terminal() {
                return;
            }
            while let Some(child) = stack.pop() {
                if let Some(Operation::Group(inner)) = slot.recipe.step(child).map(|s| &s.operation) {
                    stack.extend(inner.steps.iter().map(String::as_str));
                }
                let open = exec
                    .step(child)
                    .map(|s| matches!(s.status, StepStatus::Running | StepStatus::Retrying))
                    .unwrap_or(false);
                if !open {
                    continue;
                }
                clear_pending_input(slot, &mut exec, child).await;
                let error = format!("Group {} stopped: {}", step.id, err.message);
                if let Some(state) = exec.step_mut(child) {
                    state.status = StepStatus::Failed;
                    state.error = Some(error.clone());
                }
                if exec.current_step.as_deref() == Some(child) {
                    exec.current_step = Some(step.id.clone());
                }
                self.emit(InteractiveEvent::StepFailed {
                    execution_id: slot.id.clone(),
                    step_id: child.to_string(),
                    error: error.clone(),
                });
                settled.push((child.to_string(), error));
            }
            exec.touch();
        }
        for (child, error) in settled {
            self.log(&slot.id, Some(&child), format!("Step failed: {error}")).await;
        }
    }

    async fn complete_step(&self, slot: &ExecutionSlot, step_id: &str, outcome: Outcome) {
        let snapshot = {
            let mut exec = slot.state.lock().await;
            if exec.status.is_terminal() {
                return;
            }
            clear_pending_input(slot, &mut exec, step_id).await;
            for (name, value) in outcome.set_vars {
                exec.variables.insert(name, value);
            }
            let limit = self.inner.config.max_step_output_bytes;
            if let Some(state) = exec.step_mut(step_id) {
                state.status = StepStatus::Success;
                state.error = None;
                state.output = outcome.output.map(|o| truncate_output(&o, limit));
            }
            if exec.current_step.as_deref() == Some(step_id) {
                exec.current_step = None;
            }
            graph::refresh_waiting(&slot.recipe.steps, &mut exec.steps);
            exec.touch();
            self.emit(InteractiveEvent::StepCompleted {
                execution_id: slot.id.clone(),
                step_id: step_id.to_string(),
            });
            exec.clone()
        };
        self.log(&slot.id, Some(step_id), "Step completed").await;
        self.persist(&snapshot).await;
    }

    async fn fail_step(&self, slot: &ExecutionSlot, step_id: &str, err: &AppError) {
        let snapshot = {
            let mut exec = slot.state.lock().await;
            if exec.status.is_terminal() {
                return;
            }
            clear_pending_input(slot, &mut exec, step_id).await;
            if let Some(state) = exec.step_mut(step_id) {
                state.status = StepStatus::Failed;
                state.error = Some(err.message.clone());
            }
            if exec.current_step.as_deref() == Some(step_id) {
                exec.current_step = None;
            }
            graph::refresh_waiting(&slot.recipe.steps, &mut exec.steps);
            exec.touch();
            self.emit(InteractiveEvent::StepFailed {
                execution_id: slot.id.clone(),
                step_id: step_id.to_string(),
                error: err.message.clone(),
            });
            exec.clone()
        };
        self.log(&slot.id, Some(step_id), format!("Step failed: {}", err.message))
            .await;
        self.persist(&snapshot).await;
    }

    /// Skip a step whose guard did not hold; a group takes its children along.
    async fn skip_step(&self, slot: &ExecutionSlot, step: &Step, reason: &str) {
        let mut ids = vec![step.id.clone()];
        if let Operation::Group(group) = &step.operation {
            ids.extend(group.steps.iter().cloned());
        }
        for id in &ids {
            self.skip_if_unstarted(slot, id, reason).await;
        }
    }

    async fn skip_if_unstarted(&self, slot: &ExecutionSlot, step_id: &str, reason: &str) {
        {
            let mut exec = slot.state.lock().await;
            let unstarted = exec
                .step(step_id)
                .map(|s| s.status.is_unstarted())
                .unwrap_or(false);
            if !unstarted || exec.status.is_terminal() {
                return;
            }
            exec.set_step_status(step_id, StepStatus::Skipped);
            graph::refresh_waiting(&slot.recipe.steps, &mut exec.steps);
            self.emit(InteractiveEvent::StepSkipped {
                execution_id: slot.id.clone(),
                step_id: step_id.to_string(),
                reason: reason.to_string(),
            });
        }
        self.log(&slot.id, Some(step_id), format!("Step skipped: {reason}")).await;
    }

    /// Record the final status. Waiters are released only after the closing
    /// log entry and snapshot are written.
    async fn finish(&self, slot: &ExecutionSlot, end: RunEnd) {
        let (snapshot, message) = {
            let mut exec = slot.state.lock().await;
            if exec.status.is_terminal() {
                return;
            }
            let message = match end {
                RunEnd::Stopped => return,
                RunEnd::Completed => {
                    exec.status = InteractiveStatus::Completed;
                    self.emit(InteractiveEvent::ExecutionCompleted {
                        execution_id: slot.id.clone(),
                    });
                    "Execution completed".to_string()
                }
                RunEnd::Failed { step_id, error } => {
                    let message = match &step_id {
                        Some(step) => format!("Execution failed at step {step}: {error}"),
                        None => format!("Execution failed: {error}"),
                    };
                    exec.failed_step = step_id;
                    exec.error = Some(error.clone());
                    exec.status = InteractiveStatus::Failed;
                    self.emit(InteractiveEvent::ExecutionFailed {
                        execution_id: slot.id.clone(),
                        error,
                    });
                    message
                }
            };
            exec.current_step = None;
            exec.pending_input = None;
            exec.completed_at = Some(now_rfc3339());
            exec.touch();
            (exec.clone(), message)
        };
        self.log(&slot.id, None, message.clone()).await;
        self.persist(&snapshot).await;
        slot.status.send_replace(snapshot.status);
        tracing::info!(execution_id = %slot.id, status = snapshot.status.as_str(), "{message}");
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drop the prompt a finished or abandoned step was waiting on.
async fn clear_pending_input(slot: &ExecutionSlot, exec: &mut InteractiveExecution, step_id: &str) {
    if exec.pending_input.as_ref().map(|p| p.step_id.as_str()) != Some(step_id) {
        return;
    }
    exec.pending_input = None;
    slot.input.lock().await.take();
    if exec.status == InteractiveStatus::WaitingForInput {
        slot.set_status(exec, InteractiveStatus::Running);
    }
}

/// Keep the last `max_bytes` of `output`, cut on a char boundary.
fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut start = output.len() - max_bytes;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("...(truncated)\n{}", &output[start..])
}

/// The execution side of [`StepIo`] for one step.
struct RunnerIo {
    runner: RecipeRunner,
    slot: Arc<ExecutionSlot>,
    step_id: String,
    interrupts: watch::Receiver<u64>,
    base: u64,
}

impl RunnerIo {
    fn new(runner: RecipeRunner, slot: Arc<ExecutionSlot>, step_id: String) -> Self {
        let interrupts = slot.interrupts.subscribe();
        let base = *interrupts.borrow();
        Self {
            runner,
            slot,
            step_id,
            interrupts,
            base,
        }
    }
}

#[async_trait]
impl StepIo for RunnerIo {
    async fn output(&self, stream: RecipeLogStream, line: &str) {
        self.runner
            .append(&self.slot.id, RecipeLogEntry::new(stream, Some(&self.step_id), line))
            .await;
    }

    async fn progress(&self, message: &str) {
        {
            let mut exec = self.slot.state.lock().await;
            exec.step_progress
                .insert(self.step_id.clone(), message.to_string());
            self.runner.emit(InteractiveEvent::StepProgress {
                execution_id: self.slot.id.clone(),
                step_id: self.step_id.clone(),
                message: message.to_string(),
            });
        }
        self.runner
            .append(
                &self.slot.id,
                RecipeLogEntry::new(RecipeLogStream::Progress, Some(&self.step_id), message),
            )
            .await;
    }

    async fn request_input(&self, prompt: &str, is_password: bool) -> Result<String, AppError> {
        let (tx, rx) = oneshot::channel();
        let snapshot = {
            let mut exec = self.slot.state.lock().await;
            if exec.status.is_terminal() {
                return Err(AppError::cancelled(format!("Execution {}", exec.status.as_str())));
            }
            if exec.pending_input.is_some() {
                return Err(AppError::intervention_conflict(
                    "Another step is already waiting for input",
                ));
            }
            exec.pending_input = Some(PendingInput {
                step_id: self.step_id.clone(),
                prompt: prompt.to_string(),
                is_password,
            });
            *self.slot.input.lock().await = Some(tx);
            if exec.status == InteractiveStatus::Running {
                self.slot.set_status(&mut exec, InteractiveStatus::WaitingForInput);
            }
            self.runner.emit(InteractiveEvent::WaitingForConfirmation {
                execution_id: self.slot.id.clone(),
                step_id: self.step_id.clone(),
                prompt: prompt.to_string(),
                is_password,
            });
            exec.clone()
        };
        self.runner
            .log(&self.slot.id, Some(&self.step_id), format!("Waiting for input: {prompt}"))
            .await;
        self.runner.persist(&snapshot).await;

        rx.await
            .map_err(|_| AppError::cancelled("Input request abandoned"))
    }

    async fn interrupted(&self) {
        let mut rx = self.interrupts.clone();
        loop {
            if *rx.borrow_and_update() != self.base {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::time::Instant;

    use super::*;
    use crate::recipe::operations::{
        CommandOutput, CommandRequest, GdriveMountRequest, GitCloneRequest, HfDownloadRequest,
        HostSession, HttpCall, HttpClient, InstanceControl, Notification, Notifier, StorageService,
        TransferRequest, TransferService,
    };
    use crate::recipe::types::{
        Condition, GroupOp, Operation, RetryConfig, SetVarOp, SleepOp, SshCommandOp, WaitConditionOp,
    };

    /// Scripted host: commands containing `fail` exit 1, `prompt` asks for
    /// input and echoes the answer, `hang` never finishes on its own,
    /// `ready` succeeds once `ready_at` has passed and `panic` panics.
    #[derive(Default)]
    struct FakeHost {
        commands: StdMutex<Vec<String>>,
        connect_error: bool,
        ready_at: StdMutex<Option<Instant>>,
    }

    impl FakeHost {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HostSession for FakeHost {
        async fn connect(&self, host_id: &str) -> Result<(), AppError> {
            if self.connect_error {
                return Err(AppError::command(format!("{host_id} unreachable")));
            }
            Ok(())
        }

        async fn run_command(
            &self,
            request: &CommandRequest,
            io: &dyn StepIo,
        ) -> Result<CommandOutput, AppError> {
            self.commands.lock().unwrap().push(request.command.clone());
            if request.command.contains("panic") {
                panic!("host crashed");
            }
            if request.command.contains("ready") {
                let ready = self.ready_at.lock().unwrap().is_some_and(|t| Instant::now() >= t);
                return Ok(CommandOutput {
                    exit_code: Some(if ready { 0 } else { 1 }),
                    ..Default::default()
                });
            }
            if request.command.contains("hang") {
                io.interrupted().await;
                return Err(AppError::command("Interrupted by operator"));
            }
            if request.command.contains("prompt") {
                let answer = io.request_input("Password:", true).await?;
                io.output(RecipeLogStream::Stdout, "accepted").await;
                return Ok(CommandOutput {
                    stdout: answer,
                    stderr: String::new(),
                    exit_code: Some(0),
                });
            }
            let code = if request.command.contains("fail") { 1 } else { 0 };
            io.output(RecipeLogStream::Stdout, &request.command).await;
            Ok(CommandOutput {
                stdout: request.command.clone(),
                stderr: String::new(),
                exit_code: Some(code),
            })
        }

        async fn tmux_new(&self, _: &str, _: &str, _: Option<&str>, _: Option<&str>) -> Result<(), AppError> {
            Ok(())
        }

        async fn tmux_send(&self, _: &str, _: &str, _: &str) -> Result<(), AppError> {
            Ok(())
        }

        async fn tmux_capture(&self, _: &str, _: &str, _: Option<i64>) -> Result<String, AppError> {
            Ok(String::new())
        }

        async fn tmux_kill(&self, _: &str, _: &str) -> Result<(), AppError> {
            Ok(())
        }

        async fn is_host_online(&self, _: &str) -> Result<bool, AppError> {
            Ok(true)
        }

        async fn is_tmux_alive(&self, _: &str, _: &str) -> Result<bool, AppError> {
            Ok(false)
        }

        async fn gpu_count(&self, _: &str) -> Result<u32, AppError> {
            Ok(0)
        }
    }

    struct Unused;

    #[async_trait]
    impl TransferService for Unused {
        async fn transfer(&self, _: &TransferRequest, _: &dyn StepIo) -> Result<(), AppError> {
            Err(AppError::not_implemented("transfer"))
        }
    }

    #[async_trait]
    impl StorageService for Unused {
        async fn git_clone(&self, _: &GitCloneRequest, _: &dyn StepIo) -> Result<(), AppError> {
            Err(AppError::not_implemented("git"))
        }
        async fn hf_download(&self, _: &HfDownloadRequest, _: &dyn StepIo) -> Result<(), AppError> {
            Err(AppError::not_implemented("hf"))
        }
        async fn gdrive_mount(&self, _: &GdriveMountRequest, _: &dyn StepIo) -> Result<(), AppError> {
            Err(AppError::not_implemented("gdrive"))
        }
        async fn gdrive_unmount(&self, _: &str, _: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn is_gdrive_mounted(&self, _: &str, _: &str) -> Result<bool, AppError> {
            Ok(false)
        }
    }

    #[async_trait]
    impl InstanceControl for Unused {
        async fn start(&self, _: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn stop(&self, _: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn destroy(&self, _: &str) -> Result<(), AppError> {
            Ok(())
        }
    }

    #[async_trait]
    impl HttpClient for Unused {
        async fn request(&self, _: &HttpCall) -> Result<String, AppError> {
            Err(AppError::not_implemented("http"))
        }
    }

    #[async_trait]
    impl Notifier for Unused {
        async fn notify(&self, _: &Notification) -> Result<(), AppError> {
            Ok(())
        }
    }

    fn runner_with(host: Arc<FakeHost>) -> RecipeRunner {
        let collaborators = Collaborators {
            host,
            transfer: Arc::new(Unused),
            storage: Arc::new(Unused),
            instances: Arc::new(Unused),
            http: Arc::new(Unused),
            notifier: Arc::new(Unused),
        };
        RecipeRunner::with_store(EngineConfig::ephemeral(), collaborators, Arc::new(NoopStore))
    }

    fn cmd(id: &str, command: &str) -> Step {
        Step::new(
            id,
            Operation::SshCommand(SshCommandOp {
                host_id: "${target}".to_string(),
                command: command.to_string(),
                workdir: None,
                env: HashMap::new(),
                capture_output: None,
                timeout_secs: None,
            }),
        )
    }

    fn cmd_with_timeout(id: &str, command: &str, secs: u64) -> Step {
        let mut step = cmd(id, command);
        if let Operation::SshCommand(op) = &mut step.operation {
            op.timeout_secs = Some(secs);
        }
        step
    }

    fn group(id: &str, mode: GroupMode, children: &[&str]) -> Step {
        Step::new(
            id,
            Operation::Group(GroupOp {
                mode,
                steps: children.iter().map(|c| c.to_string()).collect(),
            }),
        )
    }

    fn sleep(id: &str, secs: u64) -> Step {
        Step::new(id, Operation::Sleep(SleepOp { duration_secs: secs }))
    }

    fn recipe(steps: Vec<Step>) -> Recipe {
        Recipe {
            name: "demo".to_string(),
            version: "1".to_string(),
            description: None,
            target: None,
            variables: HashMap::new(),
            steps,
        }
    }

    async fn prepare(runner: &RecipeRunner, steps: Vec<Step>) -> String {
        runner
            .prepare(
                recipe(steps),
                PrepareRequest {
                    recipe_path: "demo.toml".to_string(),
                    host_id: "h1".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id
    }

    fn status_of(exec: &InteractiveExecution, step: &str) -> StepStatus {
        exec.step(step).unwrap().status
    }

    async fn wait_until(runner: &RecipeRunner, id: &str, check: impl Fn(&InteractiveExecution) -> bool) {
        for _ in 0..500 {
            if check(&runner.get(id).await.unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {id} never reached the expected state");
    }

    async fn wait_for_status(runner: &RecipeRunner, id: &str, status: InteractiveStatus) {
        wait_until(runner, id, |e| e.status == status).await;
    }

    #[tokio::test]
    async fn test_pending_execution_only_accepts_start() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let id = prepare(&runner, vec![cmd("a", "echo a")]).await;

        assert_eq!(runner.pause(&id).await.unwrap_err().code, "invalid_state");
        assert_eq!(runner.resume(&id).await.unwrap_err().code, "invalid_state");
        assert_eq!(runner.interrupt(&id).await.unwrap_err().code, "invalid_state");
        assert_eq!(runner.send_input(&id, "x").await.unwrap_err().code, "invalid_state");

        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::Completed);
        assert_eq!(status_of(&exec, "a"), StepStatus::Success);
        assert!(exec.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_execution_rejects_every_command() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let id = prepare(&runner, vec![cmd("a", "echo a")]).await;
        runner.start(&id).await.unwrap();
        runner.wait(&id).await.unwrap();

        assert_eq!(runner.start(&id).await.unwrap_err().code, "invalid_state");
        assert_eq!(runner.pause(&id).await.unwrap_err().code, "invalid_state");
        assert_eq!(runner.resume(&id).await.unwrap_err().code, "invalid_state");
        assert_eq!(runner.interrupt(&id).await.unwrap_err().code, "invalid_state");
        assert_eq!(runner.cancel(&id).await.unwrap_err().code, "invalid_state");
        assert_eq!(runner.send_input(&id, "x").await.unwrap_err().code, "invalid_state");
        assert_eq!(
            runner.set_intervention_lock(&id, true).await.unwrap_err().code,
            "invalid_state"
        );
        assert_eq!(runner.toggle_skip_step(&id, "a").await.unwrap_err().code, "invalid_state");
        assert_eq!(runner.reconnect_terminal(&id).await.unwrap_err().code, "invalid_state");
    }

    #[tokio::test]
    async fn test_guard_skips_step_when_variable_differs() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let a = Step::new(
            "A",
            Operation::SetVar(SetVarOp {
                name: "mode".to_string(),
                value: "train".to_string(),
            }),
        );
        let b = cmd("B", "echo eval")
            .depends_on(["A"])
            .when(Condition::var_equals("mode", "eval"));
        let id = prepare(&runner, vec![a, b]).await;

        let mut events = runner.subscribe_events(&id).unwrap();
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Completed);
        assert_eq!(status_of(&exec, "A"), StepStatus::Success);
        assert_eq!(status_of(&exec, "B"), StepStatus::Skipped);
        assert_eq!(exec.variables["mode"], "train");

        let mut saw_skip = false;
        while let Ok(event) = events.try_recv() {
            if let InteractiveEvent::StepSkipped { step_id, .. } = event {
                saw_skip |= step_id == "B";
            }
        }
        assert!(saw_skip);
    }

    #[tokio::test]
    async fn test_failure_halts_when_dependents_remain() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let id = prepare(
            &runner,
            vec![
                cmd("a", "fail here"),
                cmd("b", "echo b").depends_on(["a"]),
                cmd("c", "echo c"),
            ],
        )
        .await;
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert_eq!(exec.failed_step.as_deref(), Some("a"));
        assert_eq!(status_of(&exec, "a"), StepStatus::Failed);
        assert_ne!(status_of(&exec, "b"), StepStatus::Success);
        assert!(!host.commands().contains(&"echo b".to_string()));

        let logs = runner.log_tail(&id, 100).await.unwrap();
        assert!(logs
            .iter()
            .any(|e| e.stream == RecipeLogStream::System && e.message.contains("failed at step a")));
    }

    #[tokio::test]
    async fn test_independent_steps_run_after_failure() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let id = prepare(&runner, vec![cmd("a", "fail here"), cmd("c", "echo c")]).await;
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(status_of(&exec, "c"), StepStatus::Success);
        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert_eq!(exec.failed_step.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_continue_on_failure_keeps_dependents_running() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let id = prepare(
            &runner,
            vec![
                cmd("a", "fail here").continue_on_failure(),
                cmd("b", "echo b").depends_on(["a"]),
            ],
        )
        .await;
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Completed);
        assert_eq!(status_of(&exec, "a"), StepStatus::Failed);
        assert_eq!(status_of(&exec, "b"), StepStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_emits_retrying_events() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let step = cmd("a", "fail always").retry(RetryConfig {
            max_attempts: 3,
            delay_secs: 1,
            backoff_multiplier: Some(2.0),
        });
        let id = prepare(&runner, vec![step]).await;
        let mut events = runner.subscribe_events(&id).unwrap();
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert_eq!(exec.step("a").unwrap().attempts, 3);

        let mut delays = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let InteractiveEvent::StepRetrying { delay_secs, .. } = event {
                delays.push(delay_secs);
            }
        }
        assert_eq!(delays, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_pause_holds_next_step_until_resume() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let id = prepare(&runner, vec![cmd("a", "prompt"), cmd("b", "echo b").depends_on(["a"])]).await;
        runner.start(&id).await.unwrap();
        wait_for_status(&runner, &id, InteractiveStatus::WaitingForInput).await;

        runner.pause(&id).await.unwrap();
        // Input is only accepted once resumed.
        assert_eq!(runner.send_input(&id, "pw").await.unwrap_err().code, "invalid_state");

        let exec = runner.resume(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::WaitingForInput);
        runner.send_input(&id, "pw").await.unwrap();
        wait_for_status(&runner, &id, InteractiveStatus::Completed).await;

        let exec = runner.get(&id).await.unwrap();
        assert_eq!(status_of(&exec, "b"), StepStatus::Success);
        assert_eq!(exec.step("a").unwrap().output.as_deref(), Some("pw"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_run_does_not_dispatch() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let id = prepare(&runner, vec![sleep("a", 60), cmd("b", "echo b").depends_on(["a"])]).await;
        runner.start(&id).await.unwrap();
        wait_until(&runner, &id, |e| status_of(e, "a") == StepStatus::Running).await;

        // The sleep in flight finishes; the next step waits for resume.
        runner.pause(&id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        let exec = runner.get(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::Paused);
        assert_eq!(status_of(&exec, "a"), StepStatus::Success);
        assert!(host.commands().is_empty());

        runner.resume(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::Completed);
        assert_eq!(host.commands(), vec!["echo b".to_string()]);
    }

    #[tokio::test]
    async fn test_intervention_lock_blocks_input() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let id = prepare(&runner, vec![cmd("a", "prompt")]).await;
        runner.start(&id).await.unwrap();
        wait_for_status(&runner, &id, InteractiveStatus::WaitingForInput).await;

        let exec = runner.get(&id).await.unwrap();
        let pending = exec.pending_input.unwrap();
        assert_eq!(pending.step_id, "a");
        assert!(pending.is_password);

        runner.set_intervention_lock(&id, true).await.unwrap();
        let err = runner.send_input(&id, "pw").await.unwrap_err();
        assert_eq!(err.code, "intervention_conflict");

        runner.set_intervention_lock(&id, false).await.unwrap();
        runner.send_input(&id, "pw").await.unwrap();
        let exec = runner.wait(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::Completed);
        assert!(exec.pending_input.is_none());
    }

    #[tokio::test]
    async fn test_intervention_lock_holds_dispatch() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let id = prepare(&runner, vec![cmd("a", "echo a")]).await;
        runner.set_intervention_lock(&id, true).await.unwrap();
        runner.start(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(host.commands().is_empty());
        assert_eq!(runner.get(&id).await.unwrap().status, InteractiveStatus::Running);

        runner.set_intervention_lock(&id, false).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::Completed);
        assert_eq!(host.commands(), vec!["echo a".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_step() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let id = prepare(&runner, vec![sleep("a", 3600), cmd("b", "echo b").depends_on(["a"])]).await;
        runner.start(&id).await.unwrap();
        wait_until(&runner, &id, |e| status_of(e, "a") == StepStatus::Running).await;

        let mut events = runner.subscribe_events(&id).unwrap();
        let exec = runner.cancel(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::Cancelled);

        let exec = runner.wait(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::Cancelled);
        assert_eq!(status_of(&exec, "a"), StepStatus::Cancelled);
        assert_ne!(status_of(&exec, "b"), StepStatus::Success);
        let mut saw_cancel = false;
        while let Ok(event) = events.try_recv() {
            saw_cancel |= matches!(event, InteractiveEvent::ExecutionCancelled { .. });
        }
        assert!(saw_cancel);
    }

    #[tokio::test]
    async fn test_interrupt_fails_the_running_step() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let id = prepare(&runner, vec![cmd("a", "hang")]).await;
        runner.start(&id).await.unwrap();
        wait_until(&runner, &id, |e| status_of(e, "a") == StepStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        runner.interrupt(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert!(exec.error.unwrap().contains("Interrupted"));
    }

    #[tokio::test]
    async fn test_connect_failure_fails_execution() {
        let host = Arc::new(FakeHost {
            connect_error: true,
            ..Default::default()
        });
        let runner = runner_with(host);
        let id = prepare(&runner, vec![cmd("a", "echo a")]).await;
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert!(exec.failed_step.is_none());
        assert!(exec.error.as_deref().unwrap().contains("unreachable"));
        assert_eq!(status_of(&exec, "a"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_toggle_skip_before_start() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let id = prepare(&runner, vec![cmd("a", "echo a"), cmd("b", "echo b").depends_on(["a"])]).await;

        let exec = runner.toggle_skip_step(&id, "a").await.unwrap();
        assert_eq!(status_of(&exec, "a"), StepStatus::Skipped);
        assert_eq!(status_of(&exec, "b"), StepStatus::Pending);

        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::Completed);
        assert_eq!(host.commands(), vec!["echo b".to_string()]);
    }

    #[tokio::test]
    async fn test_rerun_from_skips_earlier_steps() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let id = prepare(
            &runner,
            vec![
                cmd("a", "echo a"),
                cmd("b", "fail b").depends_on(["a"]),
                cmd("c", "echo c").depends_on(["b"]),
            ],
        )
        .await;
        runner.start(&id).await.unwrap();
        let first = runner.wait(&id).await.unwrap();
        assert_eq!(first.status, InteractiveStatus::Failed);

        let rerun = runner.rerun_from(&id, "b").await.unwrap();
        assert_ne!(rerun.id, id);
        assert_eq!(rerun.rerun_of.as_deref(), Some(id.as_str()));
        assert_eq!(rerun.status, InteractiveStatus::Pending);
        assert_eq!(status_of(&rerun, "a"), StepStatus::Skipped);
        assert_eq!(status_of(&rerun, "b"), StepStatus::Pending);
        assert_eq!(rerun.variables["target"], "h1");

        assert_eq!(runner.rerun_from(&id, "zz").await.unwrap_err().code, "not_found");
        assert_eq!(runner.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sequential_group_runs_children_in_order() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let group = Step::new(
            "g",
            Operation::Group(GroupOp {
                mode: GroupMode::Sequential,
                steps: vec!["x".to_string(), "y".to_string(), "z".to_string()],
            }),
        );
        let id = prepare(
            &runner,
            vec![group, cmd("x", "echo x"), cmd("y", "fail y"), cmd("z", "echo z")],
        )
        .await;
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert_eq!(exec.failed_step.as_deref(), Some("g"));
        assert_eq!(status_of(&exec, "x"), StepStatus::Success);
        assert_eq!(status_of(&exec, "y"), StepStatus::Failed);
        assert_eq!(status_of(&exec, "z"), StepStatus::Skipped);
        assert_eq!(host.commands(), vec!["echo x".to_string(), "fail y".to_string()]);
    }

    #[tokio::test]
    async fn test_parallel_group_lets_siblings_finish() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let group = Step::new(
            "g",
            Operation::Group(GroupOp {
                mode: GroupMode::Parallel,
                steps: vec!["x".to_string(), "y".to_string()],
            }),
        );
        let id = prepare(&runner, vec![group, cmd("x", "fail x"), cmd("y", "echo y")]).await;
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert_eq!(status_of(&exec, "x"), StepStatus::Failed);
        assert_eq!(status_of(&exec, "y"), StepStatus::Success);
        assert_eq!(status_of(&exec, "g"), StepStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout_fails_and_is_retried() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let step = cmd_with_timeout("a", "hang", 2).retry(RetryConfig {
            max_attempts: 2,
            delay_secs: 0,
            backoff_multiplier: None,
        });
        let id = prepare(&runner, vec![step]).await;
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert_eq!(status_of(&exec, "a"), StepStatus::Failed);
        assert_eq!(exec.step("a").unwrap().attempts, 2);
        assert!(exec.error.as_deref().unwrap().contains("timed out after 2s"));
        assert_eq!(host.commands(), vec!["hang".to_string(), "hang".to_string()]);
    }

    #[tokio::test]
    async fn test_driver_panic_fails_execution() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let id = prepare(&runner, vec![cmd("a", "panic now"), cmd("b", "echo b")]).await;
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert_eq!(exec.failed_step.as_deref(), Some("a"));
        assert_eq!(status_of(&exec, "a"), StepStatus::Failed);
        assert!(exec.error.as_deref().unwrap().contains("panicked"));
        assert!(exec.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_condition_succeeds_before_timeout() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let wait = Step::new(
            "w",
            Operation::WaitCondition(WaitConditionOp {
                condition: Condition::command_succeeds("${target}", "ready"),
                timeout_secs: 2,
                poll_interval_secs: 1,
            }),
        );
        let id = prepare(&runner, vec![wait, cmd("next", "echo next").depends_on(["w"])]).await;

        let start = Instant::now();
        *host.ready_at.lock().unwrap() = Some(start + Duration::from_millis(1500));
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Completed, "{:?}", exec.error);
        assert_eq!(status_of(&exec, "w"), StepStatus::Success);
        assert_eq!(status_of(&exec, "next"), StepStatus::Success);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1500) && elapsed <= Duration::from_secs(2));
        // Polled at 0s, 1s and 2s.
        let polls = host.commands().iter().filter(|c| c.as_str() == "ready").count();
        assert_eq!(polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_condition_times_out() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let wait = Step::new(
            "w",
            Operation::WaitCondition(WaitConditionOp {
                condition: Condition::command_succeeds("${target}", "ready"),
                timeout_secs: 2,
                poll_interval_secs: 1,
            }),
        );
        let id = prepare(&runner, vec![wait]).await;
        *host.ready_at.lock().unwrap() = Some(Instant::now() + Duration::from_secs(3));
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert!(exec.error.as_deref().unwrap().contains("Timeout waiting for condition"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipping_waiting_step_unblocks_dependents() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let id = prepare(
            &runner,
            vec![
                sleep("a", 60),
                cmd("w", "echo w").depends_on(["a"]),
                cmd("c", "echo c").depends_on(["w"]),
            ],
        )
        .await;
        runner.start(&id).await.unwrap();
        wait_until(&runner, &id, |e| status_of(e, "a") == StepStatus::Running).await;

        let exec = runner.get(&id).await.unwrap();
        assert_eq!(status_of(&exec, "w"), StepStatus::Waiting);
        assert_eq!(status_of(&exec, "c"), StepStatus::Waiting);
        assert_eq!(runner.toggle_skip_step(&id, "a").await.unwrap_err().code, "invalid_state");

        let exec = runner.toggle_skip_step(&id, "w").await.unwrap();
        assert_eq!(status_of(&exec, "w"), StepStatus::Skipped);
        assert_eq!(status_of(&exec, "c"), StepStatus::Pending);
        // Unskipping is only possible before the run starts.
        assert_eq!(runner.toggle_skip_step(&id, "w").await.unwrap_err().code, "invalid_state");

        let exec = runner.wait(&id).await.unwrap();
        assert_eq!(exec.status, InteractiveStatus::Completed);
        assert_eq!(status_of(&exec, "a"), StepStatus::Success);
        assert_eq!(status_of(&exec, "c"), StepStatus::Success);
        assert_eq!(host.commands(), vec!["echo c".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_timeout_settles_children() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let g = group("g", GroupMode::Parallel, &["x", "p", "y"]).timeout_secs(5);
        let id = prepare(
            &runner,
            vec![g, cmd("x", "hang"), cmd("p", "prompt"), cmd("y", "echo y")],
        )
        .await;
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert_eq!(exec.failed_step.as_deref(), Some("g"));
        assert_eq!(status_of(&exec, "g"), StepStatus::Failed);
        assert_eq!(status_of(&exec, "x"), StepStatus::Failed);
        assert_eq!(status_of(&exec, "p"), StepStatus::Failed);
        assert_eq!(status_of(&exec, "y"), StepStatus::Success);
        assert!(exec.pending_input.is_none());
        assert!(exec
            .steps
            .iter()
            .all(|s| !matches!(s.status, StepStatus::Running | StepStatus::Retrying)));
    }

    #[tokio::test]
    async fn test_group_retry_keeps_succeeded_children() {
        let host = Arc::new(FakeHost::default());
        let runner = runner_with(host.clone());
        let g = group("g", GroupMode::Sequential, &["x", "y"]).retry(RetryConfig {
            max_attempts: 2,
            delay_secs: 0,
            backoff_multiplier: None,
        });
        let id = prepare(&runner, vec![g, cmd("x", "echo x"), cmd("y", "fail y")]).await;
        runner.start(&id).await.unwrap();
        let exec = runner.wait(&id).await.unwrap();

        assert_eq!(exec.status, InteractiveStatus::Failed);
        assert_eq!(exec.step("g").unwrap().attempts, 2);
        assert_eq!(status_of(&exec, "x"), StepStatus::Success);
        assert_eq!(
            host.commands(),
            vec!["echo x".to_string(), "fail y".to_string(), "fail y".to_string()]
        );
    }

    #[tokio::test]
    async fn test_logs_record_output_and_system_entries() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let id = prepare(&runner, vec![cmd("a", "echo hello")]).await;
        runner.start(&id).await.unwrap();
        runner.wait(&id).await.unwrap();

        let chunk = runner.log_read(&id, None, None).await.unwrap();
        assert!(chunk.eof);
        assert!(chunk
            .entries
            .iter()
            .any(|e| e.stream == RecipeLogStream::Stdout && e.message == "echo hello"));
        assert!(chunk
            .entries
            .iter()
            .any(|e| e.stream == RecipeLogStream::System && e.message == "Execution completed"));

        runner.log_clear(&id).await.unwrap();
        assert!(runner.log_tail(&id, 10).await.unwrap().is_empty());
        assert_eq!(runner.log_read("nope", None, None).await.unwrap_err().code, "not_found");
    }

    #[tokio::test]
    async fn test_prepare_rejects_invalid_recipe() {
        let runner = runner_with(Arc::new(FakeHost::default()));
        let err = runner
            .prepare(
                recipe(vec![cmd("a", "x").depends_on(["b"]), cmd("b", "y").depends_on(["a"])]),
                PrepareRequest {
                    host_id: "h1".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation");
    }

    #[test]
    fn test_truncate_output_keeps_tail() {
        assert_eq!(truncate_output("short", 10), "short");
        let out = truncate_output("abcdefghij", 4);
        assert!(out.ends_with("ghij"));
        assert!(out.starts_with("...(truncated)"));
    }
}
