//! Collaborator seams for recipe operations
//!
//! The engine never talks to SSH, tmux, rclone or cloud APIs directly. Each
//! dispatched intent goes to one of the traits below; [`Collaborators`]
//! bundles one implementation of each. `local` provides implementations that
//! work against the `__local__` target without any remote plumbing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::run_logs::RecipeLogStream;
use super::types::{HfRepoType, HttpMethod, NotifyLevel, TransferEndpoint};
use crate::error::AppError;

pub mod conditions;
pub mod http;
pub mod local;
pub mod notify;
pub mod storage;

/// Special target value for local execution
pub const LOCAL_TARGET: &str = "__local__";

pub fn is_local_target(target: &str) -> bool {
    target == LOCAL_TARGET
}

// ============================================================
// Requests and results
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub host_id: String,
    pub command: String,
    pub workdir: Option<String>,
    pub env: HashMap<String, String>,
    /// Fails the command with a timeout error once elapsed
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(host_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            command: command.into(),
            workdir: None,
            env: HashMap::new(),
            timeout: None,
        }
    }

    /// Shell line with exported env and workdir, as sent to `sh -c` or ssh.
    pub fn shell_line(&self) -> String {
        let mut full_cmd = String::new();
        let mut keys: Vec<&String> = self.env.keys().collect();
        keys.sort();
        for key in keys {
            full_cmd.push_str(&format!("export {}={}; ", key, shell_quote(&self.env[key])));
        }
        if let Some(wd) = &self.workdir {
            full_cmd.push_str(&format!("cd {} && ", shell_quote(wd)));
        }
        full_cmd.push_str(&self.command);
        full_cmd
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout and stderr joined for display.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n--- stderr ---\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            (true, false) => format!("(stderr only)\n{}", self.stderr),
            (true, true) => String::new(),
        }
    }

    /// Turn a non-zero exit into a `command` error.
    pub fn into_result(self) -> Result<CommandOutput, AppError> {
        if self.success() {
            return Ok(self);
        }
        let combined = self.combined();
        Err(AppError::command(format!(
            "Command failed with exit code {:?}: {}",
            self.exit_code,
            if combined.is_empty() {
                "(no output)".to_string()
            } else {
                combined
            }
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source: TransferEndpoint,
    pub destination: TransferEndpoint,
    pub include_paths: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub use_gitignore: bool,
    pub delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCloneRequest {
    pub host_id: String,
    pub repo_url: String,
    pub destination: String,
    pub branch: Option<String>,
    pub depth: Option<u32>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfDownloadRequest {
    pub host_id: String,
    pub repo_id: String,
    pub destination: String,
    pub repo_type: HfRepoType,
    pub files: Vec<String>,
    pub revision: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GdriveMountRequest {
    pub host_id: String,
    pub storage_id: Option<String>,
    pub mount_path: String,
    pub gdrive_path: Option<String>,
    pub vfs_cache: bool,
    pub cache_mode: String,
    pub background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCall {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: Option<String>,
    pub level: NotifyLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Start,
    Stop,
    Destroy,
}

// ============================================================
// Engine <-> collaborator channel
// ============================================================

/// What a running operation can do back into the execution.
#[async_trait]
pub trait StepIo: Send + Sync {
    async fn output(&self, stream: RecipeLogStream, line: &str);

    async fn progress(&self, message: &str);

    /// Ask the operator for input and wait for the answer.
    async fn request_input(&self, prompt: &str, is_password: bool) -> Result<String, AppError>;

    /// Resolves once the operator interrupts the current operation.
    async fn interrupted(&self);
}

/// For condition checks and connects that have no operator attached.
pub struct NullIo;

#[async_trait]
impl StepIo for NullIo {
    async fn output(&self, _stream: RecipeLogStream, _line: &str) {}

    async fn progress(&self, _message: &str) {}

    async fn request_input(&self, prompt: &str, _is_password: bool) -> Result<String, AppError> {
        Err(AppError::invalid_state(format!(
            "No operator attached to answer prompt: {prompt}"
        )))
    }

    async fn interrupted(&self) {
        std::future::pending::<()>().await
    }
}

// ============================================================
// Collaborators
// ============================================================

#[async_trait]
pub trait HostSession: Send + Sync {
    /// Handshake with the host before the run starts.
    async fn connect(&self, host_id: &str) -> Result<(), AppError>;

    /// Re-attach the observation channel after the operator's terminal dropped.
    async fn reattach(&self, _host_id: &str) -> Result<(), AppError> {
        Ok(())
    }

    /// Run a command to completion; a non-zero exit is not an error here.
    async fn run_command(
        &self,
        request: &CommandRequest,
        io: &dyn StepIo,
    ) -> Result<CommandOutput, AppError>;

    async fn tmux_new(
        &self,
        host_id: &str,
        session_name: &str,
        command: Option<&str>,
        workdir: Option<&str>,
    ) -> Result<(), AppError>;

    async fn tmux_send(&self, host_id: &str, session_name: &str, keys: &str) -> Result<(), AppError>;

    async fn tmux_capture(
        &self,
        host_id: &str,
        session_name: &str,
        lines: Option<i64>,
    ) -> Result<String, AppError>;

    async fn tmux_kill(&self, host_id: &str, session_name: &str) -> Result<(), AppError>;

    async fn is_host_online(&self, host_id: &str) -> Result<bool, AppError>;

    async fn is_tmux_alive(&self, host_id: &str, session_name: &str) -> Result<bool, AppError>;

    async fn gpu_count(&self, host_id: &str) -> Result<u32, AppError>;
}

#[async_trait]
pub trait TransferService: Send + Sync {
    async fn transfer(&self, request: &TransferRequest, io: &dyn StepIo) -> Result<(), AppError>;
}

#[async_trait]
pub trait StorageService: Send + Sync {
    async fn git_clone(&self, request: &GitCloneRequest, io: &dyn StepIo) -> Result<(), AppError>;

    async fn hf_download(&self, request: &HfDownloadRequest, io: &dyn StepIo)
        -> Result<(), AppError>;

    async fn gdrive_mount(&self, request: &GdriveMountRequest, io: &dyn StepIo)
        -> Result<(), AppError>;

    async fn gdrive_unmount(&self, host_id: &str, mount_path: &str) -> Result<(), AppError>;

    async fn is_gdrive_mounted(&self, host_id: &str, mount_path: &str) -> Result<bool, AppError>;
}

#[async_trait]
pub trait InstanceControl: Send + Sync {
    async fn start(&self, host_id: &str) -> Result<(), AppError>;

    async fn stop(&self, host_id: &str) -> Result<(), AppError>;

    async fn destroy(&self, host_id: &str) -> Result<(), AppError>;
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Returns the response body; non-2xx statuses are errors.
    async fn request(&self, call: &HttpCall) -> Result<String, AppError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), AppError>;
}

/// One implementation of every collaborator, shared by all executions.
#[derive(Clone)]
pub struct Collaborators {
    pub host: Arc<dyn HostSession>,
    pub transfer: Arc<dyn TransferService>,
    pub storage: Arc<dyn StorageService>,
    pub instances: Arc<dyn InstanceControl>,
    pub http: Arc<dyn HttpClient>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Local-only wiring: commands run through `sh -c` on this machine.
    pub fn local() -> Self {
        let host: Arc<local::LocalHost> = Arc::new(local::LocalHost::new());
        Self {
            host: host.clone(),
            transfer: Arc::new(local::LocalTransfer::new(host.clone())),
            storage: Arc::new(storage::ShellStorage::new(host)),
            instances: Arc::new(local::NoInstances),
            http: Arc::new(http::ReqwestHttp::new()),
            notifier: Arc::new(notify::LogNotifier),
        }
    }
}

pub(crate) fn shell_quote(s: &str) -> String {
    shell_escape::unix::escape(s.into()).into_owned()
}
