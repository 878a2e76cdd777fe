//! Wiring a [`Poller`] to the real GitHub, tmux and git collaborators.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tern_core::{repository_dir_name, sanitize_for_path};
use tern_github::{GithubClient, GithubClientConfig, RepoRef};

use crate::config::load_layered;
use crate::multiplexer::TmuxMultiplexer;
use crate::paths::TernPaths;
use crate::scheduler::{Poller, PollerParts};
use crate::workspace::GitWorkspace;

/// One tmux session per repository. `.` and `:` are tmux target separators.
pub fn tmux_session_name(repo: &RepoRef) -> String {
    format!(
        "tern_{}",
        sanitize_for_path(&repository_dir_name(&repo.owner, &repo.name)).replace('.', "_")
    )
}

/// Builds a poller for `repo`. `token` overrides the environment variable
/// named by `github.token_env`.
pub async fn connect_poller(paths: &TernPaths, repo: &RepoRef, token: Option<&str>) -> Result<Poller> {
    let repo_paths = paths.repository(repo);
    let config = load_layered(&[&paths.global_config(), &repo_paths.config()])?;

    let token = match token.map(str::trim).filter(|token| !token.is_empty()) {
        Some(token) => token.to_string(),
        None => std::env::var(&config.github.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .with_context(|| {
                format!(
                    "no GitHub token: set {} or pass --github-token",
                    config.github.token_env
                )
            })?,
    };
    if config.trigger.authorized_users.is_empty() {
        bail!(
            "trigger.authorized_users is empty for {repo}; nobody could direct the agent"
        );
    }

    let forge = GithubClient::new(GithubClientConfig {
        api_base: config.github.api_base.clone(),
        token,
        repo: repo.clone(),
        request_timeout_ms: config.github.request_timeout_ms,
        retry_max_attempts: config.github.retry_max_attempts,
        retry_base_delay_ms: config.github.retry_base_delay_ms,
    })?;
    let workspace_root = config
        .workspace
        .root
        .clone()
        .unwrap_or_else(|| paths.state_dir.join("workspaces"))
        .join(repository_dir_name(&repo.owner, &repo.name));
    let remote_url = config
        .workspace
        .remote_url
        .clone()
        .unwrap_or_else(|| format!("https://github.com/{}/{}.git", repo.owner, repo.name));

    Poller::new(PollerParts {
        repo: repo.clone(),
        paths: paths.clone(),
        forge: Arc::new(forge),
        multiplexer: Arc::new(TmuxMultiplexer::new(tmux_session_name(repo))),
        workspace: Arc::new(GitWorkspace::new(workspace_root, remote_url)),
    })
    .await
}
