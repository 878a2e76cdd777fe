//! Command handlers. Everything except `start` and `attach` works on the
//! on-disk records; branch controls go through the scheduler's control inbox.

use std::{fmt::Write as _, path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use tern_github::RepoRef;
use tern_guard::WhitelistFile;
use tern_registry::{HistoryRecord, Session, SessionRegistry};
use tern_runtime::control::{enqueue, ControlOp, ControlRequest};
use tern_runtime::output::strip_ansi;
use tern_runtime::{
    connect_poller, load_layered, tmux_session_name, window_name, write_config, Multiplexer,
    RepositoryPaths, TernConfig, TernPaths, TmuxMultiplexer,
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Whitelist written by `tern init` when none exists yet.
const STARTER_WHITELIST: &[&str] = &[
    r"^git (status|diff|log|show|branch|add|commit)\b",
    r"^(ls|pwd|cat|head|tail|wc|grep|rg)\b",
    r"^cargo (build|check|test|fmt|clippy)\b",
    r"^npm (test|run (build|lint|test))\b",
];

pub(crate) struct CliContext {
    pub(crate) paths: TernPaths,
    pub(crate) github_token: Option<String>,
}

impl CliContext {
    fn repository(&self, raw: &str) -> Result<(RepoRef, RepositoryPaths)> {
        let repo = RepoRef::parse(raw)?;
        let repo_paths = self.paths.repository(&repo);
        Ok((repo, repo_paths))
    }

    /// Repository state must already exist; the scheduler creates it.
    fn existing_repository(&self, raw: &str) -> Result<(RepoRef, RepositoryPaths)> {
        let (repo, repo_paths) = self.repository(raw)?;
        if !repo_paths.root().is_dir() {
            bail!(
                "no state for {repo} under {}; run `tern start {repo}` first",
                self.paths.state_dir.display()
            );
        }
        Ok((repo, repo_paths))
    }

    fn load_registry(&self, raw: &str) -> Result<(RepoRef, SessionRegistry)> {
        let (repo, repo_paths) = self.existing_repository(raw)?;
        let config = load_layered(&[&self.paths.global_config(), &repo_paths.config()])?;
        let registry = SessionRegistry::load(repo_paths.root(), config.poll.seen_cap)?;
        Ok((repo, registry))
    }

    fn whitelist_file(&self, repo: Option<&str>) -> Result<WhitelistFile> {
        Ok(match repo {
            Some(raw) => WhitelistFile::new(self.repository(raw)?.1.whitelist()),
            None => WhitelistFile::new(self.paths.global_whitelist()),
        })
    }
}

pub(crate) fn init(
    context: &CliContext,
    users: Vec<String>,
    agent: Option<String>,
    force: bool,
) -> Result<()> {
    let config_path = context.paths.global_config();
    if config_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }
    let mut config = TernConfig::default();
    config.trigger.authorized_users = users;
    if let Some(agent) = agent {
        config.agent.command = agent;
    }
    write_config(&config_path, &config)?;
    println!("wrote {}", config_path.display());

    let whitelist = WhitelistFile::new(context.paths.global_whitelist());
    if !whitelist.path().exists() {
        let patterns = STARTER_WHITELIST
            .iter()
            .map(|pattern| pattern.to_string())
            .collect::<Vec<_>>();
        whitelist.write(&patterns)?;
        println!("wrote {}", whitelist.path().display());
    }
    Ok(())
}

pub(crate) async fn start(context: &CliContext, repos: &[String], once: bool) -> Result<()> {
    let gate = Arc::new(Mutex::new(()));
    let mut pollers = Vec::with_capacity(repos.len());
    for raw in repos {
        let repo = RepoRef::parse(raw)?;
        let poller = connect_poller(&context.paths, &repo, context.github_token.as_deref())
            .await
            .with_context(|| format!("failed to start {repo}"))?;
        pollers.push(poller.with_cycle_gate(gate.clone()));
    }

    if once {
        let mut failures = 0usize;
        for mut poller in pollers {
            match poller.poll_once().await {
                Ok(report) => println!(
                    "{}: discovered={} tasks={} controls={} completed={} failed={} duplicates={} ignored={}",
                    poller.repo(),
                    report.discovered,
                    report.tasks,
                    report.controls,
                    report.completed,
                    report.failed,
                    report.duplicates,
                    report.ignored
                ),
                Err(error) => {
                    failures += 1;
                    error!(repo = %poller.repo(), %error, "poll cycle failed");
                }
            }
        }
        if failures > 0 {
            bail!("{failures} repository cycle(s) failed");
        }
        return Ok(());
    }

    let handles = pollers
        .into_iter()
        .map(|poller| poller.spawn())
        .collect::<Vec<_>>();
    info!(repositories = handles.len(), "scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    for handle in &handles {
        handle.stop();
    }
    let mut failed = false;
    for handle in handles {
        let repo = handle.repo().to_string();
        if let Err(error) = handle.join().await {
            failed = true;
            error!(%repo, error = %format!("{error:#}"), "poll loop ended with an error");
        }
    }
    if failed {
        bail!("one or more poll loops stopped on a fatal error");
    }
    Ok(())
}

fn describe_session(session: &Session) -> String {
    let target = if session.target.is_issue() {
        format!("issue #{}", session.target.number())
    } else {
        format!("PR #{}", session.target.number())
    };
    let mut line = format!(
        "{:<32} {:<22} {:<12} messages={} queued={}",
        session.branch,
        session.status().as_str(),
        target,
        session.event_ids().len(),
        session.queued().len()
    );
    if session.resumed {
        line.push_str(" resumed");
    }
    if let Some(pending) = session.pending_approval() {
        let _ = write!(line, "\n    waiting on approval: {}", pending.command);
    }
    if let Some(pending) = session.pending_clarification() {
        let _ = write!(line, "\n    waiting on answer: {}", pending.question);
    }
    line
}

pub(crate) fn render_status(repo: &RepoRef, registry: &SessionRegistry) -> String {
    let sessions = registry.sessions().collect::<Vec<_>>();
    let mut rendered = if sessions.is_empty() {
        format!("{repo}: no live sessions\n")
    } else {
        format!("{repo}: {} live session(s)\n", sessions.len())
    };
    for session in sessions {
        rendered.push_str(&describe_session(session));
        rendered.push('\n');
    }
    let resumable = registry.resumable_branches().collect::<Vec<_>>();
    if !resumable.is_empty() {
        let _ = writeln!(rendered, "resumable: {}", resumable.join(", "));
    }
    rendered
}

pub(crate) fn status(context: &CliContext, raw: &str, json: bool) -> Result<()> {
    let (repo, registry) = context.load_registry(raw)?;
    if json {
        let sessions = registry.sessions().collect::<Vec<_>>();
        println!(
            "{}",
            serde_json::to_string_pretty(&sessions).context("failed to encode sessions")?
        );
        return Ok(());
    }
    print!("{}", render_status(&repo, &registry));
    Ok(())
}

/// Repository state directories, as `owner/repo` slugs.
pub(crate) fn known_repositories(state_dir: &Path) -> Result<Vec<String>> {
    if !state_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut repos = std::fs::read_dir(state_dir)
        .with_context(|| format!("failed to read {}", state_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let (owner, repo) = name.split_once("__")?;
            Some(format!("{owner}/{repo}"))
        })
        .collect::<Vec<_>>();
    repos.sort();
    Ok(repos)
}

pub(crate) fn list(context: &CliContext) -> Result<()> {
    let repos = known_repositories(&context.paths.state_dir)?;
    if repos.is_empty() {
        println!("no repositories under {}", context.paths.state_dir.display());
        return Ok(());
    }
    for raw in repos {
        match context.load_registry(&raw) {
            Ok((_, registry)) => println!(
                "{raw:<40} sessions={} tracked_prs={}",
                registry.sessions().count(),
                registry.tracked_pull_requests().len()
            ),
            Err(error) => println!("{raw:<40} unreadable: {error:#}"),
        }
    }
    Ok(())
}

pub(crate) fn attach(context: &CliContext, raw: &str, branch: &str) -> Result<()> {
    let (repo, _) = context.existing_repository(raw)?;
    let multiplexer = TmuxMultiplexer::new(tmux_session_name(&repo));
    let command = multiplexer.attach_command(&window_name(branch));
    let Some((program, args)) = command.split_first() else {
        bail!("multiplexer produced no attach command");
    };
    let status = std::process::Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run {program}"))?;
    if !status.success() {
        bail!("{program} exited with {status}");
    }
    Ok(())
}

/// Hands branch controls to the scheduler; they apply at its next cycle.
pub(crate) fn control(context: &CliContext, raw: &str, branch: &str, ops: &[ControlOp]) -> Result<()> {
    let (repo, repo_paths) = context.existing_repository(raw)?;
    let dir = repo_paths.control_dir();
    for op in ops {
        let path = enqueue(&dir, &ControlRequest::new(*op, branch))?;
        info!(%repo, %branch, op = op.as_str(), path = %path.display(), "control request queued");
    }
    let names = ops.iter().map(|op| op.as_str()).collect::<Vec<_>>();
    println!(
        "{} queued for {branch}; applied at the next poll cycle of {repo}",
        names.join(" + ")
    );
    Ok(())
}

pub(crate) fn tail_lines(text: &str, lines: usize) -> String {
    let all = text.lines().collect::<Vec<_>>();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

pub(crate) fn logs(context: &CliContext, raw: &str, branch: &str, lines: usize) -> Result<()> {
    let (_, repo_paths) = context.existing_repository(raw)?;
    let path = repo_paths.output_log(branch);
    let raw_output = match std::fs::read(&path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            bail!("no output log for {branch} at {}", path.display())
        }
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    println!("{}", tail_lines(&strip_ansi(&raw_output), lines));
    Ok(())
}

pub(crate) fn render_history(records: &[HistoryRecord], json: bool) -> Result<String> {
    let mut rendered = String::new();
    for record in records {
        if json {
            rendered.push_str(&serde_json::to_string(record).context("failed to encode record")?);
        } else {
            let detail = serde_json::to_value(&record.event).context("failed to encode event")?;
            let _ = write!(rendered, "{} {:<24} {detail}", record.timestamp, record.event.name());
        }
        rendered.push('\n');
    }
    Ok(rendered)
}

pub(crate) fn history(context: &CliContext, raw: &str, branch: &str, json: bool) -> Result<()> {
    let (_, registry) = context.load_registry(raw)?;
    let records = registry.history(branch).read()?;
    if records.is_empty() {
        println!("no history for {branch}");
        return Ok(());
    }
    print!("{}", render_history(&records, json)?);
    Ok(())
}

pub(crate) fn whitelist_show(context: &CliContext, repo: Option<&str>) -> Result<()> {
    let file = context.whitelist_file(repo)?;
    let patterns = file.read()?;
    if patterns.is_empty() {
        println!("{} is empty", file.path().display());
    }
    for pattern in patterns {
        println!("{pattern}");
    }
    Ok(())
}

pub(crate) fn whitelist_add(context: &CliContext, pattern: &str, repo: Option<&str>) -> Result<()> {
    let file = context.whitelist_file(repo)?;
    if file.add(pattern)? {
        println!("added to {}", file.path().display());
    } else {
        println!("already present in {}", file.path().display());
    }
    Ok(())
}

pub(crate) fn whitelist_remove(context: &CliContext, pattern: &str, repo: Option<&str>) -> Result<()> {
    let file = context.whitelist_file(repo)?;
    if file.remove(pattern)? {
        println!("removed from {}", file.path().display());
    } else {
        warn!(pattern, path = %file.path().display(), "pattern not present");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::read_json_if_exists;
    use tern_guard::{CommandGuard, GuardScope};
    use tern_registry::{SessionTarget, TriggerKind, TriggerMessage};

    /// Reads a control inbox without draining it.
    fn pending_controls(dir: &Path) -> Result<Vec<ControlRequest>> {
        let mut paths = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect::<Vec<_>>();
        paths.sort();
        let mut requests = Vec::new();
        for path in paths {
            if let Some(request) = read_json_if_exists(&path)? {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    fn context(tempdir: &tempfile::TempDir) -> CliContext {
        CliContext {
            paths: TernPaths::new(tempdir.path().join("config"), tempdir.path().join("state")),
            github_token: None,
        }
    }

    fn trigger(key: &str) -> TriggerMessage {
        TriggerMessage {
            event_key: key.to_string(),
            comment_id: 1,
            author: "alice".to_string(),
            body: "@tern fix it".to_string(),
            kind: TriggerKind::Discussion,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn regression_starter_whitelist_leaves_destructive_commands_to_a_human() {
        let guard = CommandGuard::from_patterns("unused.json", STARTER_WHITELIST.iter().copied());
        for command in [
            "find . -delete",
            "find / -exec rm {} +",
            "find . -name '*.rs' -ok rm {} ;",
            "git push --force",
            "cargo publish",
            "ls & rm -rf ~",
        ] {
            assert!(
                !guard.check(command, GuardScope::Global).is_approved(),
                "{command}"
            );
        }
        for command in ["git status", "ls -la | wc -l", "cargo test -p tern-core 2>&1"] {
            assert!(guard.check(command, GuardScope::Global).is_approved(), "{command}");
        }
    }

    #[test]
    fn unit_tail_lines_keeps_the_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
        assert_eq!(tail_lines("", 5), "");
    }

    #[test]
    fn functional_init_writes_config_and_starter_whitelist_once() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let context = context(&tempdir);
        init(&context, vec!["alice".to_string()], Some("claude".to_string()), false)
            .expect("init");

        let config = load_layered(&[&context.paths.global_config()]).expect("config");
        assert_eq!(config.trigger.authorized_users, ["alice"]);
        assert_eq!(config.agent.command, "claude");
        let patterns = WhitelistFile::new(context.paths.global_whitelist())
            .read()
            .expect("whitelist");
        assert_eq!(patterns.len(), STARTER_WHITELIST.len());

        let error = init(&context, vec!["bob".to_string()], None, false).expect_err("exists");
        assert!(error.to_string().contains("--force"));
        init(&context, vec!["bob".to_string()], None, true).expect("forced");
    }

    #[test]
    fn functional_control_commands_queue_requests_in_order() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let context = context(&tempdir);
        let (_, repo_paths) = context.repository("acme/widgets").expect("repo");
        std::fs::create_dir_all(repo_paths.root()).expect("state");

        control(&context, "acme/widgets", "feature", &[ControlOp::Stop, ControlOp::Retry])
            .expect("control");
        let pending = pending_controls(&repo_paths.control_dir()).expect("pending");
        let ops = pending.iter().map(|request| request.op).collect::<Vec<_>>();
        assert_eq!(ops, [ControlOp::Stop, ControlOp::Retry]);
        assert!(pending.iter().all(|request| request.branch == "feature"));
    }

    #[test]
    fn regression_control_requires_existing_repository_state() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let context = context(&tempdir);
        let error = control(&context, "acme/widgets", "feature", &[ControlOp::Pause])
            .expect_err("missing state");
        assert!(error.to_string().contains("tern start acme/widgets"));
    }

    #[test]
    fn functional_status_and_list_read_the_registry() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let context = context(&tempdir);
        let (repo, repo_paths) = context.repository("acme/widgets").expect("repo");
        std::fs::create_dir_all(repo_paths.root()).expect("state");
        let mut registry = SessionRegistry::load(repo_paths.root(), 100).expect("registry");
        registry
            .insert_session(Session::start(
                "feature".to_string(),
                SessionTarget::PullRequest { number: 12 },
                "tern-feature".to_string(),
                vec![trigger("issue-comment:1")],
                false,
                0,
                1_000,
            ))
            .expect("insert");
        registry.set_resumable("feature", true);
        registry.set_resumable("docs", true);
        registry.save().expect("save");

        let (_, loaded) = context.load_registry("acme/widgets").expect("load");
        let rendered = render_status(&repo, &loaded);
        assert!(rendered.contains("1 live session(s)"));
        assert!(rendered.ends_with("resumable: docs, feature\n"));
        assert!(rendered.contains("feature"));
        assert!(rendered.contains("PR #12"));
        assert!(rendered.contains("running"));

        assert_eq!(
            known_repositories(&context.paths.state_dir).expect("list"),
            ["acme/widgets"]
        );
    }

    #[test]
    fn functional_whitelist_commands_edit_the_selected_file() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let context = context(&tempdir);
        whitelist_add(&context, r"^make\b", Some("acme/widgets")).expect("add");
        let repo_file = context.whitelist_file(Some("acme/widgets")).expect("file");
        assert_eq!(repo_file.read().expect("read"), [r"^make\b"]);
        assert!(context
            .whitelist_file(None)
            .expect("global")
            .read()
            .expect("read")
            .is_empty());

        whitelist_remove(&context, r"^make\b", Some("acme/widgets")).expect("remove");
        assert!(repo_file.read().expect("read").is_empty());
        assert!(whitelist_add(&context, "(", None).is_err());
    }
}
