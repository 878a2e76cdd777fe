mod bootstrap_helpers;
mod cli_args;
mod commands;

use anyhow::Result;
use clap::Parser;
use tern_runtime::{ControlOp, TernPaths};

use crate::bootstrap_helpers::{default_config_dir, default_state_dir, init_tracing};
use crate::cli_args::{BranchArgs, Cli, Command, WhitelistAction};
use crate::commands::CliContext;

fn control(context: &CliContext, args: &BranchArgs, ops: &[ControlOp]) -> Result<()> {
    commands::control(context, &args.repo.repo, &args.branch, ops)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => default_config_dir()?,
    };
    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => default_state_dir()?,
    };
    let context = CliContext {
        paths: TernPaths::new(config_dir, state_dir),
        github_token: cli.github_token,
    };

    match cli.command {
        Command::Init { users, agent, force } => commands::init(&context, users, agent, force),
        Command::Start { repos, once } => commands::start(&context, &repos, once).await,
        Command::Status { repo, json } => commands::status(&context, &repo.repo, json),
        Command::List => commands::list(&context),
        Command::Attach(args) => commands::attach(&context, &args.repo.repo, &args.branch),
        Command::Stop(args) => control(&context, &args, &[ControlOp::Stop]),
        Command::Restart(args) => control(&context, &args, &[ControlOp::Stop, ControlOp::Retry]),
        Command::Pause(args) => control(&context, &args, &[ControlOp::Pause]),
        Command::Resume(args) => control(&context, &args, &[ControlOp::Resume]),
        Command::Fresh(args) => control(&context, &args, &[ControlOp::Fresh]),
        Command::Retry(args) => control(&context, &args, &[ControlOp::Retry]),
        Command::Logs { target, lines } => {
            commands::logs(&context, &target.repo.repo, &target.branch, lines)
        }
        Command::History { target, json } => {
            commands::history(&context, &target.repo.repo, &target.branch, json)
        }
        Command::Whitelist { action } => match action {
            WhitelistAction::Show { repo } => commands::whitelist_show(&context, repo.as_deref()),
            WhitelistAction::Add { pattern, repo } => {
                commands::whitelist_add(&context, &pattern, repo.as_deref())
            }
            WhitelistAction::Remove { pattern, repo } => {
                commands::whitelist_remove(&context, &pattern, repo.as_deref())
            }
        },
    }
}
