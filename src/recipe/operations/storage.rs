//! Storage operations carried out as shell commands on the target host
//!
//! Tokens never appear in the command text: they are passed through the
//! command's environment so logs and events stay clean.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    shell_quote, CommandRequest, GdriveMountRequest, GitCloneRequest, HfDownloadRequest,
    HostSession, NullIo, StepIo, StorageService,
};
use crate::error::AppError;

const GIT_TOKEN_ENV: &str = "DOPPIO_GIT_TOKEN";

/// rclone remote used when a mount names no storage.
const DEFAULT_RCLONE_REMOTE: &str = "gdrive";

pub struct ShellStorage {
    host: Arc<dyn HostSession>,
}

impl ShellStorage {
    pub fn new(host: Arc<dyn HostSession>) -> Self {
        Self { host }
    }
}

/// A token still holding a `${secret:...}` reference was never resolved.
fn usable_token(token: Option<&String>) -> Option<&String> {
    token.filter(|t| {
        if t.contains("${secret:") {
            tracing::warn!("unresolved secret reference in auth token, continuing without it");
            false
        } else {
            true
        }
    })
}

/// Escape for use inside double quotes.
fn double_quote_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '"' | '$' | '`' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub(crate) fn git_clone_request(request: &GitCloneRequest) -> CommandRequest {
    let token = usable_token(request.auth_token.as_ref());
    let url = match (token, request.repo_url.strip_prefix("https://")) {
        (Some(_), Some(rest)) => format!(
            "\"https://${{{GIT_TOKEN_ENV}}}@{}\"",
            double_quote_escape(rest)
        ),
        _ => shell_quote(&request.repo_url),
    };

    let mut cmd = String::from("git clone");
    if let Some(depth) = request.depth {
        cmd.push_str(&format!(" --depth {depth}"));
    }
    if let Some(branch) = &request.branch {
        cmd.push_str(&format!(" -b {}", shell_quote(branch)));
    }
    cmd.push_str(&format!(" {} {}", url, shell_quote(&request.destination)));

    let mut command = CommandRequest::new(request.host_id.clone(), cmd);
    if let Some(token) = token {
        command.env.insert(GIT_TOKEN_ENV.to_string(), token.clone());
    }
    command
}

pub(crate) fn hf_download_request(request: &HfDownloadRequest) -> CommandRequest {
    let mut cmd = format!(
        "huggingface-cli download {} --local-dir {} --repo-type {}",
        shell_quote(&request.repo_id),
        shell_quote(&request.destination),
        request.repo_type.as_str()
    );
    if let Some(revision) = &request.revision {
        cmd.push_str(&format!(" --revision {}", shell_quote(revision)));
    }
    for file in &request.files {
        cmd.push_str(&format!(" --include {}", shell_quote(file)));
    }

    let mut command = CommandRequest::new(request.host_id.clone(), cmd);
    if let Some(token) = usable_token(request.auth_token.as_ref()) {
        command.env.insert("HF_TOKEN".to_string(), token.clone());
    }
    command
}

pub(crate) fn rclone_mount_command(request: &GdriveMountRequest) -> String {
    let remote_name = request.storage_id.as_deref().unwrap_or(DEFAULT_RCLONE_REMOTE);
    let remote = match request.gdrive_path.as_deref() {
        Some(path) if !path.is_empty() => format!("{remote_name}:{path}"),
        _ => format!("{remote_name}:"),
    };

    let mut cmd = format!(
        "mkdir -p {mp} && rclone mount {} {mp} --allow-other --allow-non-empty",
        shell_quote(&remote),
        mp = shell_quote(&request.mount_path)
    );
    if request.vfs_cache {
        cmd.push_str(&format!(
            " --vfs-cache-mode {} --vfs-cache-max-age 1h",
            shell_quote(&request.cache_mode)
        ));
    }
    if request.background {
        cmd = format!("nohup sh -c {} > /tmp/rclone-mount.log 2>&1 &", shell_quote(&cmd));
    }
    cmd
}

#[async_trait]
impl StorageService for ShellStorage {
    async fn git_clone(&self, request: &GitCloneRequest, io: &dyn StepIo) -> Result<(), AppError> {
        io.progress(&format!("Cloning {}", request.repo_url)).await;
        self.host
            .run_command(&git_clone_request(request), io)
            .await?
            .into_result()?;
        Ok(())
    }

    async fn hf_download(&self, request: &HfDownloadRequest, io: &dyn StepIo) -> Result<(), AppError> {
        io.progress(&format!("Downloading {} from Hugging Face", request.repo_id)).await;
        self.host
            .run_command(&hf_download_request(request), io)
            .await?
            .into_result()?;
        Ok(())
    }

    async fn gdrive_mount(&self, request: &GdriveMountRequest, io: &dyn StepIo) -> Result<(), AppError> {
        io.progress("Starting rclone mount").await;
        let cmd = CommandRequest::new(request.host_id.clone(), rclone_mount_command(request));
        self.host.run_command(&cmd, io).await?.into_result()?;

        io.progress("Verifying mount").await;
        for _ in 0..5 {
            if self.is_gdrive_mounted(&request.host_id, &request.mount_path).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(AppError::command(format!(
            "Failed to mount Google Drive at {}: mount point not created",
            request.mount_path
        )))
    }

    async fn gdrive_unmount(&self, host_id: &str, mount_path: &str) -> Result<(), AppError> {
        let mp = shell_quote(mount_path);
        let cmd = format!("fusermount -uz {mp} 2>/dev/null || umount -l {mp} 2>/dev/null || true");
        self.host
            .run_command(&CommandRequest::new(host_id, cmd), &NullIo)
            .await?;
        Ok(())
    }

    async fn is_gdrive_mounted(&self, host_id: &str, mount_path: &str) -> Result<bool, AppError> {
        let cmd = format!("mountpoint -q {}", shell_quote(mount_path));
        Ok(self
            .host
            .run_command(&CommandRequest::new(host_id, cmd), &NullIo)
            .await?
            .success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::types::HfRepoType;

    fn clone_request(token: Option<&str>) -> GitCloneRequest {
        GitCloneRequest {
            host_id: "h".to_string(),
            repo_url: "https://github.com/org/repo.git".to_string(),
            destination: "/workspace/repo".to_string(),
            branch: Some("main".to_string()),
            depth: Some(1),
            auth_token: token.map(str::to_string),
        }
    }

    #[test]
    fn test_git_clone_keeps_token_out_of_command() {
        let cmd = git_clone_request(&clone_request(Some("ghp_abc")));
        assert_eq!(
            cmd.command,
            "git clone --depth 1 -b main \"https://${DOPPIO_GIT_TOKEN}@github.com/org/repo.git\" /workspace/repo"
        );
        assert!(!cmd.command.contains("ghp_abc"));
        assert_eq!(cmd.env[GIT_TOKEN_ENV], "ghp_abc");
    }

    #[test]
    fn test_unresolved_secret_token_is_dropped() {
        let cmd = git_clone_request(&clone_request(Some("${secret:github}")));
        assert!(cmd.env.is_empty());
        assert!(cmd.command.contains("https://github.com/org/repo.git"));
    }

    #[test]
    fn test_hf_download_command() {
        let cmd = hf_download_request(&HfDownloadRequest {
            host_id: "h".to_string(),
            repo_id: "meta-llama/Llama-2-7b".to_string(),
            destination: "/models/llama".to_string(),
            repo_type: HfRepoType::Model,
            files: vec!["*.safetensors".to_string()],
            revision: None,
            auth_token: Some("hf_x".to_string()),
        });
        assert_eq!(
            cmd.command,
            "huggingface-cli download meta-llama/Llama-2-7b --local-dir /models/llama --repo-type model --include '*.safetensors'"
        );
        assert_eq!(cmd.env["HF_TOKEN"], "hf_x");
    }

    #[test]
    fn test_rclone_mount_uses_storage_as_remote() {
        let request = GdriveMountRequest {
            host_id: "h".to_string(),
            storage_id: Some("team-drive".to_string()),
            mount_path: "/content/drive/MyDrive".to_string(),
            gdrive_path: Some("datasets".to_string()),
            vfs_cache: false,
            cache_mode: "writes".to_string(),
            background: false,
        };
        let cmd = rclone_mount_command(&request);
        assert!(cmd.starts_with("mkdir -p /content/drive/MyDrive && rclone mount "));
        assert!(cmd.contains("team-drive:datasets"));
        assert!(!cmd.contains("--vfs-cache-mode"));
        assert!(!cmd.starts_with("nohup"));
    }
}
