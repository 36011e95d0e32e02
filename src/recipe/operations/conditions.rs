//! Condition evaluation
//!
//! Evaluation is total: a collaborator failure or a bad regex makes the leaf
//! `false` instead of failing the step that asked.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;

use super::{shell_quote, CommandRequest, HostSession, NullIo, StorageService};
use crate::error::AppError;
use crate::recipe::interpolate::interpolate;
use crate::recipe::types::Condition;

/// Lower bound for the polling interval of `wait_for`.
const MIN_POLL: Duration = Duration::from_millis(100);

pub struct EvalContext<'a> {
    pub variables: &'a HashMap<String, String>,
    pub host: &'a dyn HostSession,
    pub storage: &'a dyn StorageService,
}

/// Evaluate a condition
pub async fn evaluate(condition: &Condition, ctx: &EvalContext<'_>) -> bool {
    match condition {
        Condition::Always => true,
        Condition::Never => false,
        Condition::Not(inner) => !Box::pin(evaluate(inner, ctx)).await,
        Condition::And(conditions) => {
            for cond in conditions {
                if !Box::pin(evaluate(cond, ctx)).await {
                    return false;
                }
            }
            true
        }
        Condition::Or(conditions) => {
            for cond in conditions {
                if Box::pin(evaluate(cond, ctx)).await {
                    return true;
                }
            }
            false
        }
        leaf => match evaluate_leaf(leaf, ctx).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(condition = ?leaf, "condition evaluated to false: {}", e.message);
                false
            }
        },
    }
}

async fn evaluate_leaf(condition: &Condition, ctx: &EvalContext<'_>) -> Result<bool, AppError> {
    let vars = ctx.variables;
    match condition {
        Condition::FileExists(c) => {
            let host_id = interpolate(&c.host_id, vars);
            let path = interpolate(&c.path, vars);
            exit_ok(ctx.host, &host_id, format!("test -e {}", shell_quote(&path))).await
        }

        Condition::FileContains(c) => {
            let host_id = interpolate(&c.host_id, vars);
            let path = interpolate(&c.path, vars);
            let pattern = interpolate(&c.pattern, vars);
            let cmd = format!("grep -q -- {} {}", shell_quote(&pattern), shell_quote(&path));
            exit_ok(ctx.host, &host_id, cmd).await
        }

        Condition::CommandSucceeds(c) => {
            let host_id = interpolate(&c.host_id, vars);
            let command = interpolate(&c.command, vars);
            exit_ok(ctx.host, &host_id, command).await
        }

        Condition::OutputMatches(c) => {
            let host_id = interpolate(&c.host_id, vars);
            let command = interpolate(&c.command, vars);
            let re = compile(&interpolate(&c.pattern, vars))?;
            let output = ctx
                .host
                .run_command(&CommandRequest::new(host_id, command), &NullIo)
                .await?;
            Ok(re.is_match(&output.stdout))
        }

        Condition::VarEquals(c) => {
            let expected = interpolate(&c.value, vars);
            let actual = vars.get(&c.name).cloned().unwrap_or_default();
            Ok(actual == expected)
        }

        Condition::VarMatches(c) => {
            let re = compile(&interpolate(&c.pattern, vars))?;
            let actual = vars.get(&c.name).cloned().unwrap_or_default();
            Ok(re.is_match(&actual))
        }

        Condition::HostOnline(c) => {
            let host_id = interpolate(&c.host_id, vars);
            ctx.host.is_host_online(&host_id).await
        }

        Condition::TmuxAlive(c) => {
            let host_id = interpolate(&c.host_id, vars);
            let session_name = interpolate(&c.session_name, vars);
            ctx.host.is_tmux_alive(&host_id, &session_name).await
        }

        Condition::GpuAvailable(c) => {
            let host_id = interpolate(&c.host_id, vars);
            Ok(ctx.host.gpu_count(&host_id).await? >= c.min_count)
        }

        Condition::GdriveMounted(c) => {
            let host_id = interpolate(&c.host_id, vars);
            let mount_path = interpolate(&c.mount_path, vars);
            ctx.storage.is_gdrive_mounted(&host_id, &mount_path).await
        }

        Condition::Not(_) | Condition::And(_) | Condition::Or(_) | Condition::Always | Condition::Never => {
            Err(AppError::internal("combinator passed as a leaf condition"))
        }
    }
}

async fn exit_ok(host: &dyn HostSession, host_id: &str, command: String) -> Result<bool, AppError> {
    let output = host
        .run_command(&CommandRequest::new(host_id, command), &NullIo)
        .await?;
    Ok(output.success())
}

fn compile(pattern: &str) -> Result<Regex, AppError> {
    Regex::new(pattern).map_err(|e| AppError::invalid_input(format!("Invalid regex: {e}")))
}

/// Wait for a condition to be met
///
/// Polls until the condition holds or `timeout` elapses; the last sleep is
/// shortened so the deadline is never overshot by more than one evaluation.
pub async fn wait_for(
    condition: &Condition,
    ctx: &EvalContext<'_>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), AppError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let poll = poll_interval.max(MIN_POLL);

    loop {
        if evaluate(condition, ctx).await {
            return Ok(());
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(AppError::timeout(format!(
                "Timeout waiting for condition after {}s",
                timeout.as_secs()
            )));
        }

        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}
