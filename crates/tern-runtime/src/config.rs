//! Layered controller configuration.
//!
//! Precedence: built-in defaults, then `<config_dir>/config.toml`, then
//! `<state_dir>/<owner>__<repo>/config.toml`. Each layer only overrides the
//! keys it sets.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TernConfig {
    pub github: GithubSettings,
    pub poll: PollSettings,
    pub trigger: TriggerSettings,
    pub agent: AgentSettings,
    pub workspace: WorkspaceSettings,
    pub pull_request: PullRequestSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GithubSettings {
    pub api_base: String,
    /// Environment variable holding the API token.
    pub token_env: String,
    /// Skips the `/user` lookup when set.
    pub bot_login: Option<String>,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            bot_login: None,
            request_timeout_ms: 30_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub seen_cap: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            seen_cap: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TriggerSettings {
    /// Task messages must contain this mention unless they answer a pending
    /// clarification.
    pub mention: String,
    pub require_mention: bool,
    /// Logins allowed to direct the agent. Empty means nobody.
    pub authorized_users: Vec<String>,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            mention: "@tern".to_string(),
            require_mention: true,
            authorized_users: Vec::new(),
        }
    }
}

impl TriggerSettings {
    pub fn is_authorized(&self, login: &str) -> bool {
        self.authorized_users
            .iter()
            .any(|user| user.trim().eq_ignore_ascii_case(login.trim()))
    }

    /// A mention must stand alone: `@tern,` counts, `@ternary` does not.
    pub fn mentions(&self, body: &str) -> bool {
        if !self.require_mention {
            return true;
        }
        let body = body.to_ascii_lowercase();
        let mention = self.mention.to_ascii_lowercase();
        let is_login_char = |ch: char| ch.is_alphanumeric() || ch == '-' || ch == '_';
        body.match_indices(&mention).any(|(at, _)| {
            let before = body[..at].chars().next_back();
            let after = body[at + mention.len()..].chars().next();
            !before.is_some_and(is_login_char) && !after.is_some_and(is_login_char)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSettings {
    pub command: String,
    pub args: Vec<String>,
    /// Extra arguments for a resumed (continue-context) start.
    pub continue_args: Vec<String>,
    /// tmux key names sent to accept an approval prompt.
    pub confirm_keys: Vec<String>,
    pub reject_keys: Vec<String>,
    /// Keys answering the agent's startup folder-trust prompt.
    pub trust_keys: Vec<String>,
    pub idle_timeout_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            continue_args: vec!["--continue".to_string()],
            confirm_keys: vec!["Enter".to_string()],
            reject_keys: vec!["Escape".to_string()],
            trust_keys: vec!["Enter".to_string()],
            idle_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Defaults to `<state_dir>/workspaces`.
    pub root: Option<PathBuf>,
    /// Defaults to the repository's default branch.
    pub base_branch: Option<String>,
    /// Defaults to `https://github.com/<owner>/<repo>.git`.
    pub remote_url: Option<String>,
    pub keep_on_merge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PullRequestSettings {
    pub branch_prefix: String,
    pub draft: bool,
}

impl Default for PullRequestSettings {
    fn default() -> Self {
        Self {
            branch_prefix: "tern/".to_string(),
            draft: false,
        }
    }
}

impl Default for TernConfig {
    fn default() -> Self {
        Self {
            github: GithubSettings::default(),
            poll: PollSettings::default(),
            trigger: TriggerSettings::default(),
            agent: AgentSettings::default(),
            workspace: WorkspaceSettings::default(),
            pull_request: PullRequestSettings::default(),
        }
    }
}

impl TernConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_secs == 0 {
            bail!("poll.interval_secs must be > 0");
        }
        if self.poll.seen_cap == 0 {
            bail!("poll.seen_cap must be > 0");
        }
        if self.agent.command.trim().is_empty() {
            bail!("agent.command must not be empty");
        }
        if self.agent.idle_timeout_secs == 0 {
            bail!("agent.idle_timeout_secs must be > 0");
        }
        if self.github.api_base.trim().is_empty() {
            bail!("github.api_base must not be empty");
        }
        if self.github.retry_max_attempts == 0 {
            bail!("github.retry_max_attempts must be > 0");
        }
        if self.trigger.require_mention && self.trigger.mention.trim().is_empty() {
            bail!("trigger.mention must not be empty when trigger.require_mention is set");
        }
        Ok(())
    }

    pub fn issue_branch(&self, issue_number: u64) -> String {
        format!("{}issue-{issue_number}", self.pull_request.branch_prefix)
    }
}

fn merge_tables(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        let Value::Table(incoming) = value else {
            base.insert(key, value);
            continue;
        };
        if let Some(Value::Table(existing)) = base.get_mut(&key) {
            merge_tables(existing, incoming);
            continue;
        }
        base.insert(key, Value::Table(incoming));
    }
}

fn read_layer(path: &Path) -> Result<Option<Table>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let table = raw
        .parse::<Table>()
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(Some(table))
}

/// Resolves defaults plus every existing layer, in order.
pub fn load_layered(layers: &[&Path]) -> Result<TernConfig> {
    let mut merged = toml::to_string(&TernConfig::default())
        .context("failed to encode default config")?
        .parse::<Table>()
        .context("failed to parse default config")?;
    for path in layers {
        if let Some(layer) = read_layer(path)? {
            merge_tables(&mut merged, layer);
        }
    }
    let config: TernConfig = Value::Table(merged)
        .try_into()
        .context("invalid merged configuration")?;
    config.validate()?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &TernConfig) -> Result<()> {
    config.validate()?;
    let mut rendered = toml::to_string_pretty(config).context("failed to encode config")?;
    rendered.push('\n');
    tern_core::write_text_atomic(path, &rendered)
}
