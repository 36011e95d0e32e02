//! Step dispatch
//!
//! `build_intent` turns an operation into a fully interpolated [`Intent`]
//! without touching anything outside; `perform` hands the intent to the
//! matching collaborator. Groups are driven by the runner, not here.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;

use super::interpolate::{interpolate, interpolate_map, interpolate_opt, redact_for_log};
use super::operations::conditions::{self, EvalContext};
use super::operations::{
    Collaborators, CommandOutput, CommandRequest, GdriveMountRequest, GitCloneRequest,
    HfDownloadRequest, HttpCall, InstanceAction, Notification, StepIo, TransferRequest,
};
use super::types::*;
use crate::error::AppError;

/// Session name used when `run_commands` opens tmux without one.
const DEFAULT_TMUX_SESSION: &str = "recipe";

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    RunCommand {
        request: CommandRequest,
        capture_output: Option<String>,
    },
    TmuxNew {
        host_id: String,
        session_name: String,
        command: Option<String>,
        workdir: Option<String>,
    },
    /// Each entry is sent as one line followed by Enter
    TmuxSend {
        host_id: String,
        session_name: String,
        keys: Vec<String>,
    },
    TmuxCapture {
        host_id: String,
        session_name: String,
        lines: Option<i64>,
        capture_output: Option<String>,
    },
    TmuxKill {
        host_id: String,
        session_name: String,
    },
    Transfer(TransferRequest),
    Instance {
        action: InstanceAction,
        host_id: String,
    },
    GdriveMount(GdriveMountRequest),
    GdriveUnmount {
        host_id: String,
        mount_path: String,
    },
    GitClone(GitCloneRequest),
    HfDownload(HfDownloadRequest),
    Sleep(Duration),
    /// Condition fields are interpolated at each evaluation
    WaitCondition {
        condition: Condition,
        timeout: Duration,
        poll_interval: Duration,
    },
    Assert {
        condition: Condition,
        message: Option<String>,
    },
    SetVar {
        name: String,
        value: String,
    },
    GetValue {
        source: ResolvedSource,
        pattern: Option<String>,
        var_name: String,
    },
    Http {
        call: HttpCall,
        capture_response: Option<String>,
    },
    Notify(Notification),
    Group {
        mode: GroupMode,
        steps: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedSource {
    Var(String),
    Command(CommandRequest),
    StepOutput(String),
}

/// What a finished operation hands back to the runner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub output: Option<String>,
    /// Variable updates, applied in order
    pub set_vars: Vec<(String, String)>,
}

impl Outcome {
    fn output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            set_vars: Vec::new(),
        }
    }

    fn capture(mut self, var: Option<&String>, value: &str) -> Self {
        if let Some(name) = var {
            self.set_vars.push((name.clone(), value.to_string()));
        }
        self
    }
}

fn resolve_host(host_id: Option<&String>, vars: &HashMap<String, String>) -> Result<String, AppError> {
    host_id
        .map(|h| interpolate(h, vars))
        .filter(|h| !h.trim().is_empty())
        .or_else(|| vars.get("target").cloned())
        .ok_or_else(|| AppError::invalid_input("No host_id specified and no target defined"))
}

fn resolve_endpoint(
    endpoint: &TransferEndpoint,
    vars: &HashMap<String, String>,
) -> Result<TransferEndpoint, AppError> {
    Ok(match endpoint {
        TransferEndpoint::Local { path } => TransferEndpoint::Local {
            path: interpolate(path, vars),
        },
        TransferEndpoint::Host { host_id, path } => TransferEndpoint::Host {
            host_id: Some(resolve_host(host_id.as_ref(), vars)?),
            path: interpolate(path, vars),
        },
        TransferEndpoint::Storage { storage_id, path } => TransferEndpoint::Storage {
            storage_id: interpolate(storage_id, vars),
            path: interpolate(path, vars),
        },
    })
}

fn command_lines(commands: &str) -> Vec<String> {
    commands
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Map an operation to an interpolated intent.
pub fn build_intent(operation: &Operation, vars: &HashMap<String, String>) -> Result<Intent, AppError> {
    let intent = match operation {
        Operation::RunCommands(op) => {
            let host_id = resolve_host(op.host_id.as_ref(), vars)?;
            let commands = interpolate(&op.commands, vars);
            let workdir = interpolate_opt(op.workdir.as_deref(), vars);
            match op.tmux_mode {
                TmuxMode::None => Intent::RunCommand {
                    request: CommandRequest {
                        host_id,
                        command: commands,
                        workdir,
                        env: interpolate_map(&op.env, vars),
                        timeout: op.timeout_secs.map(Duration::from_secs),
                    },
                    capture_output: op.capture_output.clone(),
                },
                TmuxMode::New => Intent::TmuxNew {
                    host_id,
                    session_name: interpolate_opt(op.session_name.as_deref(), vars)
                        .unwrap_or_else(|| DEFAULT_TMUX_SESSION.to_string()),
                    command: Some(commands),
                    workdir,
                },
                TmuxMode::Existing => Intent::TmuxSend {
                    host_id,
                    session_name: interpolate_opt(op.session_name.as_deref(), vars).ok_or_else(
                        || AppError::invalid_input("session_name required for existing tmux mode"),
                    )?,
                    keys: command_lines(&commands),
                },
            }
        }

        Operation::SshCommand(op) => Intent::RunCommand {
            request: CommandRequest {
                host_id: interpolate(&op.host_id, vars),
                command: interpolate(&op.command, vars),
                workdir: interpolate_opt(op.workdir.as_deref(), vars),
                env: interpolate_map(&op.env, vars),
                timeout: op.timeout_secs.map(Duration::from_secs),
            },
            capture_output: op.capture_output.clone(),
        },

        Operation::Transfer(op) => Intent::Transfer(TransferRequest {
            source: resolve_endpoint(&op.source, vars)?,
            destination: resolve_endpoint(&op.destination, vars)?,
            include_paths: op.include_paths.iter().map(|p| interpolate(p, vars)).collect(),
            exclude_patterns: op.exclude_patterns.clone(),
            use_gitignore: op.use_gitignore,
            delete: op.delete,
        }),

        Operation::RsyncUpload(op) => Intent::Transfer(TransferRequest {
            source: TransferEndpoint::Local {
                path: interpolate(&op.local_path, vars),
            },
            destination: TransferEndpoint::Host {
                host_id: Some(interpolate(&op.host_id, vars)),
                path: interpolate(&op.remote_path, vars),
            },
            include_paths: Vec::new(),
            exclude_patterns: op.excludes.clone(),
            use_gitignore: op.use_gitignore,
            delete: op.delete,
        }),

        Operation::RsyncDownload(op) => Intent::Transfer(TransferRequest {
            source: TransferEndpoint::Host {
                host_id: Some(interpolate(&op.host_id, vars)),
                path: interpolate(&op.remote_path, vars),
            },
            destination: TransferEndpoint::Local {
                path: interpolate(&op.local_path, vars),
            },
            include_paths: Vec::new(),
            exclude_patterns: op.excludes.clone(),
            use_gitignore: false,
            delete: false,
        }),

        Operation::VastStart(_) | Operation::VastStop(_) | Operation::VastDestroy(_) => {
            let host_id = vars
                .get("target")
                .cloned()
                .ok_or_else(|| AppError::invalid_input("No target host defined"))?;
            let action = match operation {
                Operation::VastStart(_) => InstanceAction::Start,
                Operation::VastStop(_) => InstanceAction::Stop,
                _ => InstanceAction::Destroy,
            };
            Intent::Instance { action, host_id }
        }

        Operation::TmuxNew(op) => Intent::TmuxNew {
            host_id: interpolate(&op.host_id, vars),
            session_name: interpolate(&op.session_name, vars),
            command: interpolate_opt(op.command.as_deref(), vars),
            workdir: interpolate_opt(op.workdir.as_deref(), vars),
        },
        Operation::TmuxSend(op) => Intent::TmuxSend {
            host_id: interpolate(&op.host_id, vars),
            session_name: interpolate(&op.session_name, vars),
            keys: vec![interpolate(&op.keys, vars)],
        },
        Operation::TmuxCapture(op) => Intent::TmuxCapture {
            host_id: interpolate(&op.host_id, vars),
            session_name: interpolate(&op.session_name, vars),
            lines: op.lines,
            capture_output: op.capture_output.clone(),
        },
        Operation::TmuxKill(op) => Intent::TmuxKill {
            host_id: interpolate(&op.host_id, vars),
            session_name: interpolate(&op.session_name, vars),
        },

        Operation::GdriveMount(op) => Intent::GdriveMount(GdriveMountRequest {
            host_id: resolve_host(op.host_id.as_ref(), vars)?,
            storage_id: interpolate_opt(op.storage_id.as_deref(), vars),
            mount_path: interpolate(&op.mount_path, vars),
            gdrive_path: interpolate_opt(op.gdrive_path.as_deref(), vars),
            vfs_cache: op.vfs_cache,
            cache_mode: op.cache_mode.clone(),
            background: op.background,
        }),
        Operation::GdriveUnmount(op) => Intent::GdriveUnmount {
            host_id: interpolate(&op.host_id, vars),
            mount_path: interpolate(&op.mount_path, vars),
        },

        Operation::GitClone(op) => Intent::GitClone(GitCloneRequest {
            host_id: resolve_host(op.host_id.as_ref(), vars)?,
            repo_url: interpolate(&op.repo_url, vars),
            destination: interpolate(&op.destination, vars),
            branch: interpolate_opt(op.branch.as_deref(), vars),
            depth: op.depth,
            auth_token: interpolate_opt(op.auth_token.as_deref(), vars).filter(|t| !t.is_empty()),
        }),
        Operation::HfDownload(op) => Intent::HfDownload(HfDownloadRequest {
            host_id: resolve_host(op.host_id.as_ref(), vars)?,
            repo_id: interpolate(&op.repo_id, vars),
            destination: interpolate(&op.destination, vars),
            repo_type: op.repo_type,
            files: op.files.iter().map(|f| interpolate(f, vars)).collect(),
            revision: interpolate_opt(op.revision.as_deref(), vars),
            auth_token: interpolate_opt(op.auth_token.as_deref(), vars).filter(|t| !t.is_empty()),
        }),

        Operation::Sleep(op) => Intent::Sleep(Duration::from_secs(op.duration_secs)),
        Operation::WaitCondition(op) => Intent::WaitCondition {
            condition: op.condition.clone(),
            timeout: Duration::from_secs(op.timeout_secs),
            poll_interval: Duration::from_secs(op.poll_interval_secs),
        },
        Operation::Assert(op) => Intent::Assert {
            condition: op.condition.clone(),
            message: interpolate_opt(op.message.as_deref(), vars),
        },

        Operation::SetVar(op) => Intent::SetVar {
            name: op.name.clone(),
            value: interpolate(&op.value, vars),
        },
        Operation::GetValue(op) => Intent::GetValue {
            source: match &op.source {
                ValueSource::Var(name) => ResolvedSource::Var(name.clone()),
                ValueSource::Command { host_id, command } => ResolvedSource::Command(
                    CommandRequest::new(interpolate(host_id, vars), interpolate(command, vars)),
                ),
                ValueSource::StepOutput(step_id) => ResolvedSource::StepOutput(step_id.clone()),
            },
            pattern: interpolate_opt(op.pattern.as_deref(), vars),
            var_name: op.var_name.clone(),
        },

        Operation::HttpRequest(op) => Intent::Http {
            call: HttpCall {
                method: op.method,
                url: interpolate(&op.url, vars),
                headers: interpolate_map(&op.headers, vars),
                body: interpolate_opt(op.body.as_deref(), vars),
                timeout_secs: op.timeout_secs,
            },
            capture_response: op.capture_response.clone(),
        },
        Operation::Notify(op) => Intent::Notify(Notification {
            title: interpolate(&op.title, vars),
            message: interpolate_opt(op.message.as_deref(), vars),
            level: op.level,
        }),

        Operation::Group(op) => Intent::Group {
            mode: op.mode,
            steps: op.steps.clone(),
        },
    };
    Ok(intent)
}

/// Everything `perform` may read besides the intent.
pub struct DispatchContext<'a> {
    pub collaborators: &'a Collaborators,
    pub variables: &'a HashMap<String, String>,
    /// Captured outputs of finished steps, for `get_value.step_output`
    pub step_outputs: &'a HashMap<String, String>,
    pub io: &'a dyn StepIo,
}

/// Run a command on its host, bounded by the request's timeout.
async fn run_command(
    c: &Collaborators,
    request: &CommandRequest,
    io: &dyn StepIo,
) -> Result<CommandOutput, AppError> {
    let Some(limit) = request.timeout else {
        return c.host.run_command(request, io).await;
    };
    match tokio::time::timeout(limit, c.host.run_command(request, io)).await {
        Ok(result) => result,
        Err(_) => Err(AppError::timeout(format!(
            "Command timed out after {}s",
            limit.as_secs()
        ))),
    }
}

/// Forward an intent to its collaborator.
pub async fn perform(intent: &Intent, ctx: &DispatchContext<'_>) -> Result<Outcome, AppError> {
    let c = ctx.collaborators;
    let io = ctx.io;
    match intent {
        Intent::RunCommand {
            request,
            capture_output,
        } => {
            let output = run_command(c, request, io).await?.into_result()?;
            let captured = output.stdout.trim_end().to_string();
            Ok(Outcome::output(output.combined()).capture(capture_output.as_ref(), &captured))
        }

        Intent::TmuxNew {
            host_id,
            session_name,
            command,
            workdir,
        } => {
            c.host
                .tmux_new(host_id, session_name, command.as_deref(), workdir.as_deref())
                .await?;
            Ok(Outcome::default())
        }
        Intent::TmuxSend {
            host_id,
            session_name,
            keys,
        } => {
            for line in keys {
                c.host.tmux_send(host_id, session_name, line).await?;
            }
            Ok(Outcome::default())
        }
        Intent::TmuxCapture {
            host_id,
            session_name,
            lines,
            capture_output,
        } => {
            let pane = c.host.tmux_capture(host_id, session_name, *lines).await?;
            Ok(Outcome::output(pane.clone()).capture(capture_output.as_ref(), pane.trim_end()))
        }
        Intent::TmuxKill {
            host_id,
            session_name,
        } => {
            c.host.tmux_kill(host_id, session_name).await?;
            Ok(Outcome::default())
        }

        Intent::Transfer(request) => {
            c.transfer.transfer(request, io).await?;
            Ok(Outcome::default())
        }

        Intent::Instance { action, host_id } => {
            match action {
                InstanceAction::Start => c.instances.start(host_id).await?,
                InstanceAction::Stop => c.instances.stop(host_id).await?,
                InstanceAction::Destroy => c.instances.destroy(host_id).await?,
            }
            Ok(Outcome::default())
        }

        Intent::GdriveMount(request) => {
            c.storage.gdrive_mount(request, io).await?;
            Ok(Outcome::default())
        }
        Intent::GdriveUnmount {
            host_id,
            mount_path,
        } => {
            c.storage.gdrive_unmount(host_id, mount_path).await?;
            Ok(Outcome::default())
        }
        Intent::GitClone(request) => {
            c.storage.git_clone(request, io).await?;
            Ok(Outcome::default())
        }
        Intent::HfDownload(request) => {
            c.storage.hf_download(request, io).await?;
            Ok(Outcome::default())
        }

        Intent::Sleep(duration) => {
            io.progress(&format!("Sleeping {}s", duration.as_secs())).await;
            tokio::select! {
                _ = tokio::time::sleep(*duration) => Ok(Outcome::default()),
                _ = io.interrupted() => Err(AppError::command("Sleep interrupted")),
            }
        }

        Intent::WaitCondition {
            condition,
            timeout,
            poll_interval,
        } => {
            io.progress(&format!("Waiting for condition (timeout {}s)", timeout.as_secs())).await;
            let eval = EvalContext {
                variables: ctx.variables,
                host: c.host.as_ref(),
                storage: c.storage.as_ref(),
            };
            tokio::select! {
                result = conditions::wait_for(condition, &eval, *timeout, *poll_interval) => {
                    result.map(|_| Outcome::default())
                }
                _ = io.interrupted() => Err(AppError::command("Wait interrupted")),
            }
        }

        Intent::Assert { condition, message } => {
            let eval = EvalContext {
                variables: ctx.variables,
                host: c.host.as_ref(),
                storage: c.storage.as_ref(),
            };
            if conditions::evaluate(condition, &eval).await {
                Ok(Outcome::default())
            } else {
                Err(AppError::command(
                    message.clone().unwrap_or_else(|| "Assertion failed".to_string()),
                ))
            }
        }

        Intent::SetVar { name, value } => Ok(Outcome::default().capture(Some(name), value)),

        Intent::GetValue {
            source,
            pattern,
            var_name,
        } => {
            let raw = match source {
                ResolvedSource::Var(name) => ctx
                    .variables
                    .get(name)
                    .cloned()
                    .ok_or_else(|| AppError::invalid_input(format!("Variable not set: {name}")))?,
                ResolvedSource::Command(request) => {
                    run_command(c, request, io).await?.into_result()?.stdout
                }
                ResolvedSource::StepOutput(step_id) => {
                    ctx.step_outputs.get(step_id).cloned().ok_or_else(|| {
                        AppError::invalid_input(format!("Step {step_id} has no captured output"))
                    })?
                }
            };
            let value = match pattern {
                Some(pattern) => extract(pattern, &raw)?,
                None => raw.trim().to_string(),
            };
            Ok(Outcome::output(value.clone()).capture(Some(var_name), &value))
        }

        Intent::Http {
            call,
            capture_response,
        } => {
            let body = c.http.request(call).await?;
            Ok(Outcome::output(body.clone()).capture(capture_response.as_ref(), &body))
        }

        Intent::Notify(notification) => {
            c.notifier.notify(notification).await?;
            Ok(Outcome::default())
        }

        Intent::Group { .. } => Err(AppError::internal("group steps are driven by the runner")),
    }
}

/// First capture group of `pattern` in `text`, or the whole match.
fn extract(pattern: &str, text: &str) -> Result<String, AppError> {
    let re = Regex::new(pattern).map_err(|e| AppError::invalid_input(format!("Invalid regex: {e}")))?;
    let caps = re
        .captures(text)
        .ok_or_else(|| AppError::command(format!("Pattern {pattern:?} did not match")))?;
    let m = caps.get(1).or_else(|| caps.get(0));
    Ok(m.map(|m| m.as_str().trim().to_string()).unwrap_or_default())
}

/// One-line description of an operation for events and logs, secrets masked.
pub fn describe(operation: &Operation, vars: &HashMap<String, String>) -> String {
    let r = |s: &str| redact_for_log(s, vars);
    let host = |h: Option<&String>| {
        h.map(|h| r(h))
            .or_else(|| vars.get("target").cloned())
            .unwrap_or_else(|| "?".to_string())
    };
    match operation {
        Operation::RunCommands(op) => format!("[{}] {}", host(op.host_id.as_ref()), r(op.commands.trim())),
        Operation::SshCommand(op) => format!("[{}] {}", r(&op.host_id), r(&op.command)),
        Operation::Transfer(op) => format!("transfer {:?} -> {:?}", op.source, op.destination),
        Operation::RsyncUpload(op) => format!("upload {} -> {}:{}", r(&op.local_path), r(&op.host_id), r(&op.remote_path)),
        Operation::RsyncDownload(op) => format!("download {}:{} -> {}", r(&op.host_id), r(&op.remote_path), r(&op.local_path)),
        Operation::VastStart(_) => "start instance".to_string(),
        Operation::VastStop(_) => "stop instance".to_string(),
        Operation::VastDestroy(_) => "destroy instance".to_string(),
        Operation::TmuxNew(op) => format!("tmux new {}", r(&op.session_name)),
        Operation::TmuxSend(op) => format!("tmux send {}: {}", r(&op.session_name), r(&op.keys)),
        Operation::TmuxCapture(op) => format!("tmux capture {}", r(&op.session_name)),
        Operation::TmuxKill(op) => format!("tmux kill {}", r(&op.session_name)),
        Operation::GdriveMount(op) => format!("mount drive at {}", r(&op.mount_path)),
        Operation::GdriveUnmount(op) => format!("unmount {}", r(&op.mount_path)),
        Operation::GitClone(op) => format!("git clone {} {}", r(&op.repo_url), r(&op.destination)),
        Operation::HfDownload(op) => format!("hf download {} -> {}", r(&op.repo_id), r(&op.destination)),
        Operation::Sleep(op) => format!("sleep {}s", op.duration_secs),
        Operation::WaitCondition(op) => format!("wait for condition ({}s)", op.timeout_secs),
        Operation::Assert(_) => "assert".to_string(),
        Operation::SetVar(op) => format!("set {}", op.name),
        Operation::GetValue(op) => format!("get value into {}", op.var_name),
        Operation::HttpRequest(op) => format!("{:?} {}", op.method, r(&op.url)),
        Operation::Notify(op) => format!("notify {}", r(&op.title)),
        Operation::Group(op) => format!("group ({:?}): {}", op.mode, op.steps.join(", ")),
    }
}
