//! Recipe types and data models
//!
//! A recipe is an immutable definition: metadata, target requirements,
//! default variables and an ordered list of steps. Every step carries
//! exactly one [`Operation`]; the step table is checked for that when it is
//! parsed, so the rest of the engine can match on the enum exhaustively.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

// ============================================================
// Recipe Definition
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipe {
    pub name: String,
    /// Version string (semver recommended)
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Target host requirements (the actual host is selected at runtime)
    #[serde(default)]
    pub target: Option<TargetRequirements>,
    /// Default variables, overridable per execution
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Recipe {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// On-disk TOML layout: `[recipe]`, `[target]`, `[variables]`, `[[step]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeFile {
    pub recipe: RecipeMeta,
    #[serde(default)]
    pub target: Option<TargetRequirements>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeMeta {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl From<RecipeFile> for Recipe {
    fn from(file: RecipeFile) -> Self {
        Self {
            name: file.recipe.name,
            version: file.recipe.version,
            description: file.recipe.description,
            target: file.target,
            variables: file.variables,
            steps: file.steps,
        }
    }
}

impl From<&Recipe> for RecipeFile {
    fn from(recipe: &Recipe) -> Self {
        Self {
            recipe: RecipeMeta {
                name: recipe.name.clone(),
                version: recipe.version.clone(),
                description: recipe.description.clone(),
            },
            target: recipe.target.clone(),
            variables: recipe.variables.clone(),
            steps: recipe.steps.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TargetRequirements {
    #[serde(rename = "type", default)]
    pub host_type: TargetHostType,
    #[serde(default)]
    pub min_gpus: Option<u32>,
    #[serde(default)]
    pub min_memory_gb: Option<f64>,
    /// Specific GPU type (e.g., "T4", "A100", "H100")
    #[serde(default)]
    pub gpu_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetHostType {
    #[default]
    Any,
    Local,
    Vast,
    Colab,
    Custom,
}

/// A step is the basic execution unit in a recipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "StepFile")]
pub struct Step {
    /// Unique identifier within the recipe
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// IDs of steps that must be terminal before this one is eligible
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Guard: the step is skipped when this evaluates false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    #[serde(flatten)]
    pub operation: Operation,
}

impl Step {
    pub fn new(id: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: id.into(),
            name: None,
            depends_on: Vec::new(),
            timeout_secs: None,
            continue_on_failure: false,
            retry: None,
            when: None,
            operation,
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.when = Some(condition);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Raw step table. The remaining keys must name exactly one operation.
#[derive(Deserialize)]
struct StepFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    continue_on_failure: bool,
    #[serde(default)]
    retry: Option<RetryConfig>,
    #[serde(default)]
    when: Option<Condition>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<StepFile> for Step {
    type Error = String;

    fn try_from(file: StepFile) -> Result<Self, Self::Error> {
        let (ops, unknown): (Vec<_>, Vec<_>) = file
            .rest
            .into_iter()
            .partition(|(key, _)| Operation::TAGS.contains(&key.as_str()));

        if !unknown.is_empty() {
            let keys: Vec<&str> = unknown.iter().map(|(k, _)| k.as_str()).collect();
            return Err(format!(
                "Step '{}' has unknown field(s): {}",
                file.id,
                keys.join(", ")
            ));
        }

        let mut ops = ops.into_iter();
        let (tag, body) = match (ops.next(), ops.next()) {
            (Some(op), None) => op,
            (None, _) => return Err(format!("Step '{}' has no operation", file.id)),
            (Some((first, _)), Some((second, _))) => {
                return Err(format!(
                    "Step '{}' sets more than one operation ({first}, {second})",
                    file.id
                ))
            }
        };

        let mut tagged = serde_json::Map::new();
        tagged.insert(tag.clone(), body);
        let operation: Operation = serde_json::from_value(serde_json::Value::Object(tagged))
            .map_err(|e| format!("Step '{}' has an invalid {tag} operation: {e}", file.id))?;

        Ok(Step {
            id: file.id,
            name: file.name,
            depends_on: file.depends_on,
            timeout_secs: file.timeout_secs,
            continue_on_failure: file.continue_on_failure,
            retry: file.retry,
            when: file.when,
            operation,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_secs: u64,
    /// Multiplier applied to the delay after each failed attempt
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

// ============================================================
// Operations
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    RunCommands(RunCommandsOp),
    /// Legacy single command (prefer run_commands)
    SshCommand(SshCommandOp),

    Transfer(TransferOp),
    /// Legacy rsync operations, normalized into transfers at dispatch
    RsyncUpload(RsyncUploadOp),
    RsyncDownload(RsyncDownloadOp),

    VastStart(VastInstanceOp),
    VastStop(VastInstanceOp),
    VastDestroy(VastInstanceOp),

    TmuxNew(TmuxNewOp),
    TmuxSend(TmuxSendOp),
    TmuxCapture(TmuxCaptureOp),
    TmuxKill(TmuxKillOp),

    GdriveMount(GdriveMountOp),
    GdriveUnmount(GdriveUnmountOp),

    GitClone(GitCloneOp),
    HfDownload(HfDownloadOp),

    Sleep(SleepOp),
    WaitCondition(WaitConditionOp),
    Assert(AssertOp),

    SetVar(SetVarOp),
    GetValue(GetValueOp),

    HttpRequest(HttpRequestOp),
    Notify(NotifyOp),

    Group(GroupOp),
}

impl Operation {
    pub const TAGS: [&'static str; 24] = [
        "run_commands",
        "ssh_command",
        "transfer",
        "rsync_upload",
        "rsync_download",
        "vast_start",
        "vast_stop",
        "vast_destroy",
        "tmux_new",
        "tmux_send",
        "tmux_capture",
        "tmux_kill",
        "gdrive_mount",
        "gdrive_unmount",
        "git_clone",
        "hf_download",
        "sleep",
        "wait_condition",
        "assert",
        "set_var",
        "get_value",
        "http_request",
        "notify",
        "group",
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Operation::RunCommands(_) => "run_commands",
            Operation::SshCommand(_) => "ssh_command",
            Operation::Transfer(_) => "transfer",
            Operation::RsyncUpload(_) => "rsync_upload",
            Operation::RsyncDownload(_) => "rsync_download",
            Operation::VastStart(_) => "vast_start",
            Operation::VastStop(_) => "vast_stop",
            Operation::VastDestroy(_) => "vast_destroy",
            Operation::TmuxNew(_) => "tmux_new",
            Operation::TmuxSend(_) => "tmux_send",
            Operation::TmuxCapture(_) => "tmux_capture",
            Operation::TmuxKill(_) => "tmux_kill",
            Operation::GdriveMount(_) => "gdrive_mount",
            Operation::GdriveUnmount(_) => "gdrive_unmount",
            Operation::GitClone(_) => "git_clone",
            Operation::HfDownload(_) => "hf_download",
            Operation::Sleep(_) => "sleep",
            Operation::WaitCondition(_) => "wait_condition",
            Operation::Assert(_) => "assert",
            Operation::SetVar(_) => "set_var",
            Operation::GetValue(_) => "get_value",
            Operation::HttpRequest(_) => "http_request",
            Operation::Notify(_) => "notify",
            Operation::Group(_) => "group",
        }
    }
}

// ============================================================
// Operation Parameters
// ============================================================

/// Run commands on the target host, optionally inside tmux.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCommandsOp {
    /// Host to run on (None = `target` variable)
    #[serde(default)]
    pub host_id: Option<String>,
    /// Commands, one per line
    pub commands: String,
    #[serde(default)]
    pub tmux_mode: TmuxMode,
    /// Session name for tmux modes (required for `existing`)
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Store stdout in this variable (tmux_mode = none only)
    #[serde(default)]
    pub capture_output: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TmuxMode {
    /// Run directly and block until complete
    #[default]
    None,
    /// Create a new tmux session running the commands
    New,
    /// Send the commands to an existing session
    Existing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshCommandOp {
    pub host_id: String,
    pub command: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub capture_output: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RsyncUploadOp {
    pub host_id: String,
    pub local_path: String,
    pub remote_path: String,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub use_gitignore: bool,
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RsyncDownloadOp {
    pub host_id: String,
    pub remote_path: String,
    pub local_path: String,
    #[serde(default)]
    pub excludes: Vec<String>,
}

/// File transfer between any two endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferOp {
    pub source: TransferEndpoint,
    pub destination: TransferEndpoint,
    /// Paths relative to the source root; empty = everything not excluded
    #[serde(default)]
    pub include_paths: Vec<String>,
    /// Glob patterns
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub use_gitignore: bool,
    /// Delete files in destination that don't exist in source
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferEndpoint {
    Local {
        path: String,
    },
    /// A configured host (None = `target` variable)
    Host {
        #[serde(default)]
        host_id: Option<String>,
        path: String,
    },
    /// A configured storage backend (Google Drive, S3, etc.)
    Storage { storage_id: String, path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitCloneOp {
    #[serde(default)]
    pub host_id: Option<String>,
    pub repo_url: String,
    pub destination: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Shallow clone depth (None = full clone)
    #[serde(default)]
    pub depth: Option<u32>,
    /// Token for private repos (use `${secret:name}`)
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HfDownloadOp {
    #[serde(default)]
    pub host_id: Option<String>,
    /// e.g. "meta-llama/Llama-2-7b"
    pub repo_id: String,
    pub destination: String,
    #[serde(default)]
    pub repo_type: HfRepoType,
    /// Specific files (empty = all files)
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HfRepoType {
    #[default]
    Model,
    Dataset,
    Space,
}

impl HfRepoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HfRepoType::Model => "model",
            HfRepoType::Dataset => "dataset",
            HfRepoType::Space => "space",
        }
    }
}

/// Cloud instance operation on the recipe target (start/stop/destroy)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct VastInstanceOp {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GdriveMountOp {
    #[serde(default)]
    pub host_id: Option<String>,
    /// Configured Google Drive storage (None = first available)
    #[serde(default)]
    pub storage_id: Option<String>,
    #[serde(default = "default_gdrive_mount_path")]
    pub mount_path: String,
    /// Folder in Google Drive to mount (None = root)
    #[serde(default)]
    pub gdrive_path: Option<String>,
    #[serde(default = "default_true")]
    pub vfs_cache: bool,
    /// off, minimal, writes, full
    #[serde(default = "default_cache_mode")]
    pub cache_mode: String,
    #[serde(default = "default_true")]
    pub background: bool,
}

fn default_gdrive_mount_path() -> String {
    "/content/drive/MyDrive".to_string()
}

fn default_cache_mode() -> String {
    "writes".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GdriveUnmountOp {
    pub host_id: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TmuxNewOp {
    pub host_id: String,
    pub session_name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TmuxSendOp {
    pub host_id: String,
    pub session_name: String,
    pub keys: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TmuxCaptureOp {
    pub host_id: String,
    pub session_name: String,
    /// Number of lines to capture (negative = from end)
    #[serde(default)]
    pub lines: Option<i64>,
    #[serde(default)]
    pub capture_output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TmuxKillOp {
    pub host_id: String,
    pub session_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SleepOp {
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitConditionOp {
    pub condition: Condition,
    #[serde(default = "default_wait_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_wait_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertOp {
    pub condition: Condition,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetVarOp {
    pub name: String,
    pub value: String,
}

/// Read a value, optionally extract it with a regex, store it in a variable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetValueOp {
    pub source: ValueSource,
    /// Regex; the first capture group (or the whole match) is stored
    #[serde(default)]
    pub pattern: Option<String>,
    pub var_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Var(String),
    Command {
        #[serde(default = "default_target_host")]
        host_id: String,
        command: String,
    },
    /// Captured output of an earlier step
    StepOutput(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpRequestOp {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Store response body in this variable
    #[serde(default)]
    pub capture_response: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifyOp {
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub level: NotifyLevel,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// Child steps dispatched by this step instead of the main frontier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupOp {
    #[serde(default)]
    pub mode: GroupMode,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    #[default]
    Sequential,
    Parallel,
}

// ============================================================
// Conditions
// ============================================================

/// Boolean expression over variables and live host state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    FileExists(FileExistsCondition),
    FileContains(FileContainsCondition),
    /// Exit code 0
    CommandSucceeds(CommandCondition),
    OutputMatches(OutputMatchesCondition),
    VarEquals(VarEqualsCondition),
    VarMatches(VarMatchesCondition),
    HostOnline(HostOnlineCondition),
    TmuxAlive(TmuxAliveCondition),
    GpuAvailable(GpuAvailableCondition),
    GdriveMounted(GdriveMountedCondition),
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Always,
    Never,
}

impl Condition {
    pub fn not(inner: Condition) -> Self {
        Condition::Not(Box::new(inner))
    }

    pub fn var_equals(name: impl Into<String>, value: impl Into<String>) -> Self {
        Condition::VarEquals(VarEqualsCondition {
            name: name.into(),
            value: value.into(),
        })
    }

    pub fn command_succeeds(host_id: impl Into<String>, command: impl Into<String>) -> Self {
        Condition::CommandSucceeds(CommandCondition {
            host_id: host_id.into(),
            command: command.into(),
        })
    }
}

fn default_target_host() -> String {
    "${target}".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileExistsCondition {
    #[serde(default = "default_target_host")]
    pub host_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileContainsCondition {
    #[serde(default = "default_target_host")]
    pub host_id: String,
    pub path: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandCondition {
    #[serde(default = "default_target_host")]
    pub host_id: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputMatchesCondition {
    #[serde(default = "default_target_host")]
    pub host_id: String,
    pub command: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VarEqualsCondition {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VarMatchesCondition {
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostOnlineCondition {
    #[serde(default = "default_target_host")]
    pub host_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TmuxAliveCondition {
    #[serde(default = "default_target_host")]
    pub host_id: String,
    pub session_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuAvailableCondition {
    #[serde(default = "default_target_host")]
    pub host_id: String,
    #[serde(default = "default_min_gpus")]
    pub min_count: u32,
}

fn default_min_gpus() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GdriveMountedCondition {
    #[serde(default = "default_target_host")]
    pub host_id: String,
    pub mount_path: String,
}

// ============================================================
// Execution State
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    /// Waiting for dependencies
    Waiting,
    Running,
    Success,
    Failed,
    Skipped,
    Retrying,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    /// Not yet dispatched; skip toggling is only legal here.
    pub fn is_unstarted(&self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::Waiting)
    }
}

/// Summary of a recipe (for listing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeSummary {
    pub path: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub step_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub step_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub step_id: Option<String>,
    pub message: String,
}
