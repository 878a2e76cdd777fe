//! Process-isolation substrate: named, attachable windows that outlive the
//! controller. One tmux session per repository, one window per branch.

use std::{
    path::{Path, PathBuf},
    process::{Output, Stdio},
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub name: String,
    pub cwd: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    /// Every byte the window prints is appended here.
    pub output_log: PathBuf,
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn window_exists(&self, window: &str) -> Result<bool>;
    async fn spawn_window(&self, spec: &WindowSpec) -> Result<()>;
    /// Sends tmux key names (`Enter`, `Escape`, `y`, ...).
    async fn send_keys(&self, window: &str, keys: &[String]) -> Result<()>;
    /// Pastes multi-line text as one input and submits it.
    async fn paste_text(&self, window: &str, text: &str) -> Result<()>;
    async fn kill_window(&self, window: &str) -> Result<()>;
    async fn list_windows(&self) -> Result<Vec<String>>;
    /// Argv an operator runs to attach to a window.
    fn attach_command(&self, window: &str) -> Vec<String>;
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

fn truncate_stderr(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.chars().count() > 400 {
        let head: String = trimmed.chars().take(400).collect();
        format!("{head}...")
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct TmuxMultiplexer {
    binary: String,
    session: String,
}

impl TmuxMultiplexer {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            binary: "tmux".to_string(),
            session: session.into(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn target(&self, window: &str) -> String {
        format!("={}:={window}", self.session)
    }

    async fn tmux(&self, args: &[&str]) -> Result<Output> {
        debug!(session = %self.session, ?args, "tmux");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {} {}", self.binary, args.join(" ")))
    }

    async fn tmux_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.tmux(args).await?;
        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                truncate_stderr(&output)
            );
        }
        Ok(output)
    }

    async fn session_exists(&self) -> Result<bool> {
        let target = format!("={}", self.session);
        Ok(self
            .tmux(&["has-session", "-t", target.as_str()])
            .await?
            .status
            .success())
    }

    async fn pipe_output(&self, window: &str, log: &Path) -> Result<()> {
        if let Some(parent) = log.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let sink = format!("cat >> {}", shell_quote(&log.display().to_string()));
        let target = self.target(window);
        self.tmux_checked(&["pipe-pane", "-o", "-t", target.as_str(), sink.as_str()])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn window_exists(&self, window: &str) -> Result<bool> {
        Ok(self
            .list_windows()
            .await?
            .iter()
            .any(|existing| existing == window))
    }

    async fn spawn_window(&self, spec: &WindowSpec) -> Result<()> {
        let cwd = spec.cwd.display().to_string();
        let session_target = format!("={}:", self.session);
        let mut args: Vec<&str> = if self.session_exists().await? {
            vec![
                "new-window",
                "-d",
                "-t",
                session_target.as_str(),
                "-n",
                spec.name.as_str(),
                "-c",
                cwd.as_str(),
            ]
        } else {
            vec![
                "new-session",
                "-d",
                "-s",
                self.session.as_str(),
                "-n",
                spec.name.as_str(),
                "-c",
                cwd.as_str(),
            ]
        };
        args.push(spec.program.as_str());
        args.extend(spec.args.iter().map(String::as_str));
        self.tmux_checked(&args)
            .await
            .with_context(|| format!("failed to spawn window {}", spec.name))?;
        self.pipe_output(&spec.name, &spec.output_log).await?;
        info!(
            session = %self.session,
            window = %spec.name,
            log = %spec.output_log.display(),
            "agent window started"
        );
        Ok(())
    }

    async fn send_keys(&self, window: &str, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let target = self.target(window);
        let mut args = vec!["send-keys", "-t", target.as_str()];
        args.extend(keys.iter().map(String::as_str));
        self.tmux_checked(&args).await?;
        Ok(())
    }

    async fn paste_text(&self, window: &str, text: &str) -> Result<()> {
        let buffer = format!("tern-{window}");
        let mut child = Command::new(&self.binary)
            .args(["load-buffer", "-b", buffer.as_str(), "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn tmux load-buffer")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .context("failed to write tmux buffer")?;
        }
        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for tmux load-buffer")?;
        if !output.status.success() {
            bail!("tmux load-buffer failed: {}", truncate_stderr(&output));
        }
        let target = self.target(window);
        self.tmux_checked(&[
            "paste-buffer",
            "-d",
            "-p",
            "-b",
            buffer.as_str(),
            "-t",
            target.as_str(),
        ])
        .await?;
        self.tmux_checked(&["send-keys", "-t", target.as_str(), "Enter"])
            .await?;
        Ok(())
    }

    async fn kill_window(&self, window: &str) -> Result<()> {
        let target = self.target(window);
        self.tmux_checked(&["kill-window", "-t", target.as_str()]).await?;
        info!(session = %self.session, %window, "agent window killed");
        Ok(())
    }

    async fn list_windows(&self) -> Result<Vec<String>> {
        if !self.session_exists().await? {
            return Ok(Vec::new());
        }
        let target = format!("={}", self.session);
        let output = self
            .tmux_checked(&["list-windows", "-t", target.as_str(), "-F", "#{window_name}"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn attach_command(&self, window: &str) -> Vec<String> {
        vec![
            self.binary.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            self.target(window),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn unit_targets_use_exact_match_prefixes() {
        let tmux = TmuxMultiplexer::new("tern_acme__widgets");
        assert_eq!(tmux.target("tern-feature"), "=tern_acme__widgets:=tern-feature");
        assert_eq!(
            tmux.attach_command("tern-feature"),
            vec!["tmux", "attach-session", "-t", "=tern_acme__widgets:=tern-feature"]
        );
    }
}
