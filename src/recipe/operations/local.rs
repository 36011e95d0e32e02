//! Collaborators for the `__local__` target
//!
//! Commands run through `sh -c` on this machine with their output streamed
//! line by line. A trailing partial line that looks like a prompt (password,
//! y/n, ...) is turned into an input request to the operator and the answer
//! is written to the process's stdin. Remote hosts need an SSH-backed
//! [`HostSession`] and are rejected with `not_implemented`.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{
    is_local_target, shell_quote, CommandOutput, CommandRequest, HostSession, InstanceControl,
    NullIo, StepIo, TransferRequest, TransferService,
};
use crate::error::AppError;
use crate::recipe::run_logs::RecipeLogStream;
use crate::recipe::types::TransferEndpoint;

/// Patterns that indicate the process is waiting for user input.
/// Checked case-insensitively against the unterminated tail of the output.
const INPUT_PROMPTS: &[&str] = &[
    "password:",
    "password for",
    "passphrase:",
    "passphrase for",
    "[y/n]",
    "(y/n)",
    "[yes/no]",
    "(yes/no)",
    "continue?",
    "proceed?",
    "are you sure?",
    "overwrite?",
    "enter pin",
    "verification code:",
    "token:",
];

fn detect_input_prompt(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    if INPUT_PROMPTS.iter().any(|p| lower.contains(p)) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    None
}

fn is_password_prompt(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    lower.contains("password") || lower.contains("passphrase")
}

fn strip_ansi(s: &str) -> String {
    lazy_static::lazy_static! {
        static ref ANSI_RE: Regex = Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]|\x1b\][^\x07]*\x07|\x1b[()][0-9A-Za-z]|\x08|\x07").unwrap();
    }
    ANSI_RE.replace_all(s, "").to_string()
}

fn ensure_local(host_id: &str) -> Result<(), AppError> {
    if is_local_target(host_id) {
        Ok(())
    } else {
        Err(AppError::not_implemented(format!(
            "Host {host_id} is remote; only the local target is available"
        )))
    }
}

/// Split `buf` into finished lines and a remainder.
#[derive(Default)]
struct LineBuffer {
    pending: String,
    collected: String,
}

impl LineBuffer {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line = strip_ansi(self.pending[..pos].trim_end_matches('\r'));
            self.pending.drain(..=pos);
            self.collected.push_str(&line);
            self.collected.push('\n');
            lines.push(line);
        }
        lines
    }

    /// Take the unterminated remainder when it reads like a prompt.
    fn take_prompt(&mut self) -> Option<String> {
        let prompt = detect_input_prompt(&strip_ansi(&self.pending))?;
        self.collected.push_str(&self.pending);
        self.pending.clear();
        Some(prompt)
    }

    fn finish(mut self) -> String {
        if !self.pending.is_empty() {
            self.collected.push_str(&strip_ansi(&self.pending));
        }
        self.collected
    }
}

/// UTF-8 decoding over reads that may cut a character in two. Incomplete
/// trailing bytes wait for the next read; invalid bytes become U+FFFD.
#[derive(Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(bytes);

        let mut out = String::new();
        let mut rest = data.as_slice();
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Bytes still held at end of stream.
    fn finish(self) -> String {
        String::from_utf8_lossy(&self.carry).into_owned()
    }
}

fn spawn_reader<R>(mut reader: R, stream: RecipeLogStream, tx: mpsc::Sender<(RecipeLogStream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let mut decoder = Utf8Decoder::default();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send((stream, text)).await.is_err() {
                        return;
                    }
                }
            }
        }
        let tail = decoder.finish();
        if !tail.is_empty() {
            let _ = tx.send((stream, tail)).await;
        }
    });
}

#[derive(Debug, Default)]
pub struct LocalHost;

impl LocalHost {
    pub fn new() -> Self {
        Self
    }

    async fn quiet(&self, host_id: &str, command: String) -> Result<CommandOutput, AppError> {
        self.run_command(&CommandRequest::new(host_id, command), &NullIo)
            .await
    }
}

#[async_trait]
impl HostSession for LocalHost {
    async fn connect(&self, host_id: &str) -> Result<(), AppError> {
        ensure_local(host_id)
    }

    async fn run_command(
        &self,
        request: &CommandRequest,
        io: &dyn StepIo,
    ) -> Result<CommandOutput, AppError> {
        ensure_local(&request.host_id)?;
        tracing::debug!(command = %request.command, "running local command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(request.shell_line())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::command(format!("Failed to execute local command: {e}")))?;

        let mut stdin = child.stdin.take();
        let (tx, mut rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, RecipeLogStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, RecipeLogStream::Stderr, tx.clone());
        }
        drop(tx);

        let mut out = LineBuffer::default();
        let mut err = LineBuffer::default();
        loop {
            tokio::select! {
                _ = io.interrupted() => {
                    let _ = child.start_kill();
                    return Err(AppError::command("Interrupted by operator"));
                }
                msg = rx.recv() => {
                    let Some((stream, chunk)) = msg else { break };
                    let buffer = match stream {
                        RecipeLogStream::Stderr => &mut err,
                        _ => &mut out,
                    };
                    for line in buffer.push(&chunk) {
                        io.output(stream, &line).await;
                    }
                    if let Some(prompt) = buffer.take_prompt() {
                        io.output(stream, &prompt).await;
                        let answer = io.request_input(&prompt, is_password_prompt(&prompt)).await?;
                        if let Some(stdin) = stdin.as_mut() {
                            stdin.write_all(format!("{answer}\n").as_bytes()).await?;
                            stdin.flush().await?;
                        }
                    }
                }
            }
        }

        drop(stdin);
        let status = child
            .wait()
            .await
            .map_err(|e| AppError::command(format!("Failed to wait for local command: {e}")))?;

        Ok(CommandOutput {
            stdout: out.finish(),
            stderr: err.finish(),
            exit_code: status.code(),
        })
    }

    async fn tmux_new(
        &self,
        host_id: &str,
        session_name: &str,
        command: Option<&str>,
        workdir: Option<&str>,
    ) -> Result<(), AppError> {
        let mut tmux_cmd = format!("tmux new-session -d -s {}", shell_quote(session_name));
        if let Some(wd) = workdir {
            tmux_cmd.push_str(&format!(" -c {}", shell_quote(wd)));
        }
        if let Some(cmd) = command {
            tmux_cmd.push_str(&format!(" {}", shell_quote(cmd)));
        }

        let output = self.quiet(host_id, tmux_cmd).await?;
        // An existing session with the same name is fine.
        if !output.success() && !output.stderr.contains("duplicate session") {
            return Err(AppError::command(format!(
                "Failed to create tmux session: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn tmux_send(&self, host_id: &str, session_name: &str, keys: &str) -> Result<(), AppError> {
        let tmux_cmd = format!(
            "tmux send-keys -t {} {} Enter",
            shell_quote(session_name),
            shell_quote(keys)
        );
        self.quiet(host_id, tmux_cmd)
            .await?
            .into_result()
            .map(|_| ())
            .map_err(|e| AppError::command(format!("Failed to send keys: {}", e.message)))
    }

    async fn tmux_capture(
        &self,
        host_id: &str,
        session_name: &str,
        lines: Option<i64>,
    ) -> Result<String, AppError> {
        let tmux_cmd = match lines {
            Some(n) => format!("tmux capture-pane -t {} -p -S {}", shell_quote(session_name), n),
            None => format!("tmux capture-pane -t {} -p", shell_quote(session_name)),
        };
        Ok(self.quiet(host_id, tmux_cmd).await?.into_result()?.stdout)
    }

    async fn tmux_kill(&self, host_id: &str, session_name: &str) -> Result<(), AppError> {
        let tmux_cmd = format!(
            "tmux kill-session -t {} 2>/dev/null || true",
            shell_quote(session_name)
        );
        self.quiet(host_id, tmux_cmd).await?;
        Ok(())
    }

    async fn is_host_online(&self, host_id: &str) -> Result<bool, AppError> {
        ensure_local(host_id)?;
        Ok(true)
    }

    async fn is_tmux_alive(&self, host_id: &str, session_name: &str) -> Result<bool, AppError> {
        let tmux_cmd = format!("tmux has-session -t {} 2>/dev/null", shell_quote(session_name));
        Ok(self.quiet(host_id, tmux_cmd).await?.success())
    }

    async fn gpu_count(&self, host_id: &str) -> Result<u32, AppError> {
        let output = self
            .quiet(
                host_id,
                "nvidia-smi --query-gpu=name --format=csv,noheader 2>/dev/null".to_string(),
            )
            .await?;
        if !output.success() {
            return Ok(0);
        }
        Ok(output.stdout.lines().filter(|l| !l.trim().is_empty()).count() as u32)
    }
}

/// `rsync` between paths on this machine.
pub struct LocalTransfer {
    host: Arc<LocalHost>,
}

impl LocalTransfer {
    pub fn new(host: Arc<LocalHost>) -> Self {
        Self { host }
    }
}

fn local_path(endpoint: &TransferEndpoint) -> Result<&str, AppError> {
    match endpoint {
        TransferEndpoint::Local { path } => Ok(path),
        TransferEndpoint::Host { host_id, path } => {
            ensure_local(host_id.as_deref().unwrap_or_default())?;
            Ok(path)
        }
        TransferEndpoint::Storage { storage_id, .. } => Err(AppError::not_implemented(format!(
            "Storage {storage_id} needs a storage transfer backend"
        ))),
    }
}

pub(crate) fn rsync_command(request: &TransferRequest, src: &str, dst: &str) -> String {
    let mut cmd = String::from("rsync -a");
    if request.use_gitignore {
        cmd.push_str(" --filter=':- .gitignore'");
    }
    for pattern in &request.exclude_patterns {
        cmd.push_str(&format!(" --exclude {}", shell_quote(pattern)));
    }
    if request.delete {
        cmd.push_str(" --delete");
    }
    if request.include_paths.is_empty() {
        cmd.push_str(&format!(" {} {}", shell_quote(src), shell_quote(dst)));
    } else {
        // -R keeps each included path relative to the source root.
        cmd.push_str(" -R");
        let root = src.trim_end_matches('/');
        for path in &request.include_paths {
            let rel = path.trim_start_matches('/');
            cmd.push_str(&format!(" {}", shell_quote(&format!("{root}/./{rel}"))));
        }
        cmd.push_str(&format!(" {}", shell_quote(dst)));
    }
    cmd
}

#[async_trait]
impl TransferService for LocalTransfer {
    async fn transfer(&self, request: &TransferRequest, io: &dyn StepIo) -> Result<(), AppError> {
        let src = local_path(&request.source)?;
        let dst = local_path(&request.destination)?;
        io.progress(&format!("Copying {src} to {dst}")).await;

        let cmd = CommandRequest::new(super::LOCAL_TARGET, rsync_command(request, src, dst));
        self.host.run_command(&cmd, io).await?.into_result()?;
        Ok(())
    }
}

/// No cloud instances behind the local target.
pub struct NoInstances;

#[async_trait]
impl InstanceControl for NoInstances {
    async fn start(&self, host_id: &str) -> Result<(), AppError> {
        Err(AppError::not_implemented(format!("No instance control for {host_id}")))
    }

    async fn stop(&self, host_id: &str) -> Result<(), AppError> {
        Err(AppError::not_implemented(format!("No instance control for {host_id}")))
    }

    async fn destroy(&self, host_id: &str) -> Result<(), AppError> {
        Err(AppError::not_implemented(format!("No instance control for {host_id}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::recipe::operations::LOCAL_TARGET;

    #[derive(Default)]
    struct RecordingIo {
        lines: Mutex<Vec<(RecipeLogStream, String)>>,
        prompts: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl StepIo for RecordingIo {
        async fn output(&self, stream: RecipeLogStream, line: &str) {
            self.lines.lock().unwrap().push((stream, line.to_string()));
        }

        async fn progress(&self, _message: &str) {}

        async fn request_input(&self, prompt: &str, is_password: bool) -> Result<String, AppError> {
            self.prompts.lock().unwrap().push((prompt.to_string(), is_password));
            Ok("hunter2".to_string())
        }

        async fn interrupted(&self) {
            std::future::pending::<()>().await
        }
    }

    #[test]
    fn test_detect_input_prompt() {
        assert!(detect_input_prompt("[sudo] password for user:").is_some());
        assert!(detect_input_prompt("Continue? [y/n]").is_some());
        assert!(detect_input_prompt("Building wheel").is_none());
        assert!(is_password_prompt("Enter passphrase for key"));
        assert!(!is_password_prompt("Proceed? (y/n)"));
    }

    #[test]
    fn test_decoder_holds_split_characters() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "café".as_bytes();
        let (head, tail) = bytes.split_at(bytes.len() - 1);
        assert_eq!(decoder.decode(head), "caf");
        assert_eq!(decoder.decode(tail), "é");
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(decoder.decode(&[0xE2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn test_multibyte_output_across_read_boundary() {
        let io = RecordingIo::default();
        let request = CommandRequest::new(
            LOCAL_TARGET,
            "printf '%4095s' '' | tr ' ' a; printf '\\303\\251\\n'",
        );
        let output = LocalHost::new().run_command(&request, &io).await.unwrap();
        assert!(output.stdout.ends_with("aé\n"), "{} bytes", output.stdout.len());
        assert!(!output.stdout.contains(char::REPLACEMENT_CHARACTER));
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[32mok\x1b[0m"), "ok");
    }

    #[test]
    fn test_rsync_command_flags() {
        let request = TransferRequest {
            source: TransferEndpoint::Local { path: "/src".to_string() },
            destination: TransferEndpoint::Local { path: "/dst".to_string() },
            include_paths: vec!["models/a.bin".to_string()],
            exclude_patterns: vec!["*.tmp".to_string()],
            use_gitignore: true,
            delete: true,
        };
        assert_eq!(
            rsync_command(&request, "/src", "/dst"),
            "rsync -a --filter=':- .gitignore' --exclude '*.tmp' --delete -R /src/./models/a.bin /dst"
        );
    }

    #[tokio::test]
    async fn test_remote_host_is_not_implemented() {
        let host = LocalHost::new();
        let err = host
            .run_command(&CommandRequest::new("gpu-1", "true"), &NullIo)
            .await
            .unwrap_err();
        assert_eq!(err.code, "not_implemented");
    }

    #[tokio::test]
    async fn test_local_command_streams_lines_and_exit_code() {
        let host = LocalHost::new();
        let io = RecordingIo::default();
        let mut request = CommandRequest::new(LOCAL_TARGET, "echo \"$GREETING\"; echo oops >&2; exit 3");
        request.env = HashMap::from([("GREETING".to_string(), "hi there".to_string())]);

        let output = host.run_command(&request, &io).await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "hi there\n");
        assert_eq!(output.stderr, "oops\n");
        assert!(output.into_result().is_err());

        let lines = io.lines.lock().unwrap();
        assert!(lines.contains(&(RecipeLogStream::Stdout, "hi there".to_string())));
        assert!(lines.contains(&(RecipeLogStream::Stderr, "oops".to_string())));
    }

    #[tokio::test]
    async fn test_prompt_is_answered_through_step_io() {
        let host = LocalHost::new();
        let io = RecordingIo::default();
        let request = CommandRequest::new(
            LOCAL_TARGET,
            "printf 'Password: '; read secret; echo \"got $secret\"",
        );

        let output = host.run_command(&request, &io).await.unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("got hunter2"));
        assert_eq!(
            *io.prompts.lock().unwrap(),
            vec![("Password:".to_string(), true)]
        );
    }
}
