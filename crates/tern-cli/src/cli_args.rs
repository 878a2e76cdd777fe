use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "tern",
    about = "Drives a terminal coding agent from GitHub pull request and issue comments",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long = "config-dir",
        env = "TERN_CONFIG_DIR",
        global = true,
        help = "Directory holding config.toml and the global whitelist. Defaults to $XDG_CONFIG_HOME/tern."
    )]
    pub(crate) config_dir: Option<PathBuf>,

    #[arg(
        long = "state-dir",
        env = "TERN_STATE_DIR",
        global = true,
        help = "Directory holding per-repository registries, history and logs. Defaults to $XDG_STATE_HOME/tern."
    )]
    pub(crate) state_dir: Option<PathBuf>,

    #[arg(
        long = "github-token",
        env = "TERN_GITHUB_TOKEN",
        global = true,
        hide_env_values = true,
        help = "GitHub token. Overrides the variable named by github.token_env."
    )]
    pub(crate) github_token: Option<String>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Selects one repository's state.
#[derive(Debug, Clone, Args)]
pub(crate) struct RepoArg {
    #[arg(long, env = "TERN_REPO", help = "Repository in owner/repo form")]
    pub(crate) repo: String,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct BranchArgs {
    #[command(flatten)]
    pub(crate) repo: RepoArg,
    pub(crate) branch: String,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Write a starter config and global whitelist.
    Init {
        #[arg(long = "user", required = true, help = "GitHub login allowed to direct the agent (repeatable)")]
        users: Vec<String>,
        #[arg(long, help = "Agent program to run in each window")]
        agent: Option<String>,
        #[arg(long, help = "Overwrite an existing config")]
        force: bool,
    },
    /// Run the scheduler in the foreground.
    Start {
        #[arg(required = true, help = "Repositories in owner/repo form")]
        repos: Vec<String>,
        #[arg(long, help = "Run a single poll cycle per repository and exit")]
        once: bool,
    },
    /// Show live sessions of one repository.
    Status {
        #[command(flatten)]
        repo: RepoArg,
        #[arg(long, help = "Print the session records as JSON")]
        json: bool,
    },
    /// List repositories with state on disk.
    List,
    /// Attach the terminal to a branch's agent window.
    Attach(BranchArgs),
    /// Kill a branch's agent and drop its session.
    Stop(BranchArgs),
    /// Stop a branch's agent and re-run the messages of its last session.
    Restart(BranchArgs),
    /// Stop reading a branch's output until resumed.
    Pause(BranchArgs),
    Resume(BranchArgs),
    /// Start the branch's next session without resuming the agent conversation.
    Fresh(BranchArgs),
    /// Re-run the messages of the branch's most recent session.
    Retry(BranchArgs),
    /// Print the tail of a branch's output stream.
    Logs {
        #[command(flatten)]
        target: BranchArgs,
        #[arg(long, default_value_t = 50, value_parser = parse_positive_usize)]
        lines: usize,
    },
    /// Print a branch's history log.
    History {
        #[command(flatten)]
        target: BranchArgs,
        #[arg(long, help = "Print raw JSON lines")]
        json: bool,
    },
    /// Inspect or edit command whitelists.
    Whitelist {
        #[command(subcommand)]
        action: WhitelistAction,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum WhitelistAction {
    Show {
        #[arg(long, help = "Repository whitelist instead of the global one")]
        repo: Option<String>,
    },
    Add {
        pattern: String,
        #[arg(long, help = "Repository whitelist instead of the global one")]
        repo: Option<String>,
    },
    Remove {
        pattern: String,
        #[arg(long, help = "Repository whitelist instead of the global one")]
        repo: Option<String>,
    },
}
