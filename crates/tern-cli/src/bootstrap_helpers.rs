use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tern_runtime=info,tern_cli=info".to_string()),
        );

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .context("HOME is not set; pass --config-dir and --state-dir")
}

fn xdg_dir(variable: &str, fallback: &[&str]) -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(variable).filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir).join("tern"));
    }
    let mut dir = home_dir()?;
    dir.extend(fallback);
    Ok(dir.join("tern"))
}

pub(crate) fn default_config_dir() -> Result<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", &[".config"])
}

pub(crate) fn default_state_dir() -> Result<PathBuf> {
    xdg_dir("XDG_STATE_HOME", &[".local", "state"])
}
