//! Reconciliation scheduler: one poll loop per repository.
//!
//! Every cycle pulls new upstream messages, applies operator controls, feeds
//! task batches into branch sessions, polls each running session once through
//! the [`SessionMonitor`](crate::monitor::SessionMonitor), reconciles finished
//! runs and cleans up merged or closed pull requests.

mod dispatch;
mod events;
mod reconcile;


use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tern_core::current_unix_timestamp_ms;
use tern_github::{Forge, PullRequest, RepoRef};
use tern_guard::CommandGuard;
use tern_prompt::PromptBuilder;
use tern_registry::{ApprovalMode, HistoryEvent, SessionRegistry, SessionStatus};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::config::{load_layered, TernConfig};
use crate::control::{self, ControlOp, ControlRequest};
use crate::error::{CycleError, CycleResultExt};
use crate::paths::{RepositoryPaths, TernPaths};
use crate::{Multiplexer, Workspace};

use self::events::{
    literal_pattern, parse_control, sort_messages, ControlCommand, InboundMessage, MessageSource,
};

use self::dispatch::TaskBatch;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollCycleReport {
    pub discovered: usize,
    pub tasks: usize,
    pub controls: usize,
    pub completed: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub ignored: usize,
}

/// Collaborators a [`Poller`] drives.
pub struct PollerParts {
    pub repo: RepoRef,
    pub paths: TernPaths,
    pub forge: Arc<dyn Forge>,
    pub multiplexer: Arc<dyn Multiplexer>,
    pub workspace: Arc<dyn Workspace>,
}

pub struct Poller {
    repo: RepoRef,
    slug: String,
    paths: TernPaths,
    repo_paths: RepositoryPaths,
    config: TernConfig,
    forge: Arc<dyn Forge>,
    multiplexer: Arc<dyn Multiplexer>,
    workspace: Arc<dyn Workspace>,
    registry: SessionRegistry,
    guard: CommandGuard,
    prompts: PromptBuilder,
    bot_login: String,
    base_branch: String,
    cycle_gate: Option<Arc<Mutex<()>>>,
}

/// Owner-side handle of a spawned poll loop.
pub struct PollerHandle {
    repo: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl PollerHandle {
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Asks the loop to stop after the current cycle.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .with_context(|| format!("poll loop for {} panicked", self.repo))?
    }
}

impl Poller {
    pub async fn new(parts: PollerParts) -> Result<Self> {
        let PollerParts {
            repo,
            paths,
            forge,
            multiplexer,
            workspace,
        } = parts;
        let slug = repo.as_slug();
        let repo_paths = paths.repository(&repo);
        std::fs::create_dir_all(repo_paths.root())
            .with_context(|| format!("failed to create {}", repo_paths.root().display()))?;

        let config = load_layered(&[&paths.global_config(), &repo_paths.config()])
            .with_context(|| format!("failed to load configuration for {slug}"))?;
        let (mut guard, mut malformed) = CommandGuard::load(paths.global_whitelist())?;
        malformed.extend(guard.register_repository(&slug, repo_paths.whitelist())?);
        if !malformed.is_empty() {
            warn!(repo = %slug, count = malformed.len(), "whitelist contains malformed patterns");
        }
        let registry = SessionRegistry::load(repo_paths.root(), config.poll.seen_cap)?;

        let bot_login = match config
            .github
            .bot_login
            .as_deref()
            .map(str::trim)
            .filter(|login| !login.is_empty())
        {
            Some(login) => login.to_string(),
            None => forge
                .authenticated_login()
                .await
                .context("failed to resolve bot login")?,
        };
        let base_branch = match config.workspace.base_branch.clone() {
            Some(branch) => branch,
            None => forge
                .default_branch()
                .await
                .context("failed to resolve default branch")?,
        };

        info!(
            repo = %slug,
            %bot_login,
            %base_branch,
            sessions = registry.sessions().count(),
            "poller ready"
        );
        Ok(Self {
            repo,
            slug,
            paths,
            repo_paths,
            config,
            forge,
            multiplexer,
            workspace,
            registry,
            guard,
            prompts: PromptBuilder::new()?,
            bot_login,
            base_branch,
            cycle_gate: None,
        })
    }

    /// Shares a gate with other pollers so their cycles run one at a time.
    pub fn with_cycle_gate(mut self, gate: Arc<Mutex<()>>) -> Self {
        self.cycle_gate = Some(gate);
        self
    }

    pub fn repo(&self) -> &RepoRef {
        &self.repo
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn spawn(self) -> PollerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let repo = self.slug.clone();
        let task = tokio::spawn(self.run(receiver));
        PollerHandle {
            repo,
            shutdown,
            task,
        }
    }

    /// Polls until `shutdown` flips or a fatal cycle error stops the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                info!(repo = %self.slug, "poll loop stopped");
                return Ok(());
            }

            let outcome = {
                let _gate = match &self.cycle_gate {
                    Some(gate) => Some(gate.clone().lock_owned().await),
                    None => None,
                };
                self.poll_once().await
            };
            match outcome {
                Ok(_) => {}
                Err(error) if error.is_fatal() => {
                    error!(repo = %self.slug, %error, "stopping repository poll loop");
                    return Err(error.into_inner());
                }
                Err(error) => warn!(repo = %self.slug, %error, "poll cycle skipped"),
            }

            let interval = Duration::from_secs(self.config.poll.interval_secs);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!(repo = %self.slug, "poll loop owner dropped");
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    pub async fn poll_once(&mut self) -> Result<PollCycleReport, CycleError> {
        let mut report = PollCycleReport::default();
        self.reload_settings();
        self.apply_control_requests().await.fatal()?;

        let pull_requests = self
            .forge
            .list_open_pull_requests()
            .await
            .context("failed to list open pull requests")
            .transient()?;
        let messages = self.collect_messages(&pull_requests).await.transient()?;
        report.discovered = messages.len();

        let mut fresh = Vec::with_capacity(messages.len());
        for message in messages {
            if self.registry.is_seen(&message.event_key) {
                report.duplicates += 1;
                continue;
            }
            if let Some(branch) = self.registry.session_incorporating(&message.event_key) {
                debug!(repo = %self.slug, %branch, event_key = %message.event_key, "already incorporated");
                self.registry.mark_seen(&message.event_key);
                report.duplicates += 1;
                continue;
            }
            fresh.push(message);
        }
        sort_messages(&mut fresh);

        let mut controls = Vec::new();
        let mut batches: Vec<TaskBatch> = Vec::new();
        for message in fresh {
            if !self.config.trigger.is_authorized(&message.author) {
                debug!(
                    repo = %self.slug,
                    event_key = %message.event_key,
                    author = %message.author,
                    "ignoring message from unauthorized sender"
                );
                self.registry.mark_seen(&message.event_key);
                report.ignored += 1;
                continue;
            }
            if let Some(command) = parse_control(&message.body) {
                controls.push((message, command));
                continue;
            }
            let route = self.route(&message.source);
            let answers_question = self
                .registry
                .session(&route.branch)
                .is_some_and(|session| session.status() == SessionStatus::WaitingClarification);
            if !answers_question && !self.config.trigger.mentions(&message.body) {
                self.registry.mark_seen(&message.event_key);
                report.ignored += 1;
                continue;
            }
            match batches.iter_mut().find(|batch| batch.route.branch == route.branch) {
                Some(batch) => batch.messages.push(message),
                None => batches.push(TaskBatch::new(route, message)),
            }
        }

        for (message, command) in controls {
            report.controls += 1;
            self.apply_approval_control(&message, command).await;
        }

        for batch in batches {
            report.tasks += batch.messages.len();
            if !self.dispatch_batch(batch).await {
                report.failed += 1;
            }
        }

        self.monitor_sessions(&mut report).await;
        self.cleanup_finished_pull_requests(&pull_requests).await;

        self.registry
            .save()
            .context("failed to persist session registry")
            .fatal()?;
        info!(
            repo = %self.slug,
            discovered = report.discovered,
            tasks = report.tasks,
            controls = report.controls,
            completed = report.completed,
            failed = report.failed,
            duplicates = report.duplicates,
            ignored = report.ignored,
            "poll cycle complete"
        );
        Ok(report)
    }

    /// Re-resolves configuration and whitelists, keeping the previous values
    /// when a layer cannot be loaded.
    fn reload_settings(&mut self) {
        match load_layered(&[&self.paths.global_config(), &self.repo_paths.config()]) {
            Ok(config) => self.config = config,
            Err(error) => {
                warn!(repo = %self.slug, error = %format!("{error:#}"), "keeping previous configuration")
            }
        }
        let mut guard = self.guard.clone();
        match guard.reload() {
            Ok(_) => self.guard = guard,
            Err(error) => warn!(repo = %self.slug, %error, "keeping previous whitelist"),
        }
    }

    async fn collect_messages(&self, pull_requests: &[PullRequest]) -> Result<Vec<InboundMessage>> {
        let mut messages = Vec::new();
        for pr in pull_requests {
            let source = MessageSource::PullRequest {
                number: pr.number,
                head: pr.head.ref_name.clone(),
            };
            for comment in self.forge.list_issue_comments(pr.number).await? {
                messages.push(InboundMessage::from_issue_comment(source.clone(), &comment));
            }
            for comment in self.forge.list_review_comments(pr.number).await? {
                messages.push(InboundMessage::from_review_comment(pr, &comment));
            }
        }

        let issues = self
            .forge
            .list_open_issues()
            .await
            .context("failed to list open issues")?;
        for issue in &issues {
            messages.push(InboundMessage::from_issue_body(issue));
            let source = MessageSource::Issue {
                number: issue.number,
                body: issue.body.clone(),
            };
            for comment in self.forge.list_issue_comments(issue.number).await? {
                messages.push(InboundMessage::from_issue_comment(source.clone(), &comment));
            }
        }

        let bot = self.bot_login.as_str();
        messages.retain(|message| !message.author.eq_ignore_ascii_case(bot));
        Ok(messages)
    }

    async fn apply_control_requests(&mut self) -> Result<()> {
        let requests = control::drain(&self.repo_paths.control_dir())?;
        if requests.is_empty() {
            return Ok(());
        }
        for request in &requests {
            if let Err(error) = self.apply_control_request(request).await {
                warn!(
                    repo = %self.slug,
                    branch = %request.branch,
                    op = request.op.as_str(),
                    error = %format!("{error:#}"),
                    "control request rejected"
                );
            }
        }
        self.registry.save()
    }

    async fn apply_control_request(&mut self, request: &ControlRequest) -> Result<()> {
        let branch = request.branch.as_str();
        let now = current_unix_timestamp_ms();
        match request.op {
            ControlOp::Pause => {
                let session = self
                    .registry
                    .session_mut(branch)
                    .with_context(|| format!("no session for {branch}"))?;
                session.pause()?;
                self.registry.record(branch, HistoryEvent::SessionPaused)?;
            }
            ControlOp::Resume => {
                let session = self
                    .registry
                    .session_mut(branch)
                    .with_context(|| format!("no session for {branch}"))?;
                session.resume(now)?;
                self.registry.record(branch, HistoryEvent::SessionResumed)?;
            }
            ControlOp::Stop => {
                let session = self
                    .registry
                    .remove_session(branch)
                    .with_context(|| format!("no session for {branch}"))?;
                self.registry.set_resumable(branch, false);
                self.registry.record(
                    branch,
                    HistoryEvent::SessionFailed {
                        event_ids: session.event_ids().to_vec(),
                        reason: "stopped by operator".to_string(),
                    },
                )?;
                self.kill_window_if_alive(&session.window).await;
            }
            ControlOp::Fresh => self.registry.set_resumable(branch, false),
            ControlOp::Retry => {
                let keys = self.registry.last_session_event_ids(branch)?;
                let unmarked = keys
                    .iter()
                    .filter(|key| self.registry.unmark_seen(key))
                    .count();
                info!(repo = %self.slug, %branch, unmarked, "event IDs released for retry");
            }
        }
        info!(repo = %self.slug, %branch, op = request.op.as_str(), "control request applied");
        Ok(())
    }

    async fn apply_approval_control(&mut self, message: &InboundMessage, command: ControlCommand) {
        self.registry.mark_seen(&message.event_key);
        let number = message.source.number();
        let waiting = self
            .registry
            .sessions()
            .filter(|session| {
                session.target.number() == number
                    && session.status() == SessionStatus::WaitingApproval
            })
            .map(|session| session.branch.clone())
            .collect::<Vec<_>>();
        if waiting.is_empty() {
            debug!(repo = %self.slug, number, event_key = %message.event_key, "no pending approval for control message");
            return;
        }

        let mut undelivered = 0usize;
        for branch in waiting {
            if let Err(error) = self.resolve_approval(&branch, message, &command).await {
                undelivered += 1;
                warn!(
                    repo = %self.slug,
                    %branch,
                    error = %format!("{error:#}"),
                    "failed to apply approval control"
                );
            }
        }
        if undelivered > 0 {
            // The pending approval is untouched, so the message is replayed next cycle.
            self.registry.unmark_seen(&message.event_key);
            return;
        }
        if let Err(error) = self.forge.add_reaction(message.reaction, "+1").await {
            debug!(repo = %self.slug, %error, "failed to react to control message");
        }
    }

    async fn resolve_approval(
        &mut self,
        branch: &str,
        message: &InboundMessage,
        command: &ControlCommand,
    ) -> Result<()> {
        let session = self
            .registry
            .session(branch)
            .with_context(|| format!("no session for {branch}"))?;
        let pending = session
            .pending_approval()
            .cloned()
            .with_context(|| format!("no pending approval for {branch}"))?;
        let window = session.window.clone();

        let event = match command {
            ControlCommand::Deny => {
                self.multiplexer
                    .send_keys(&window, &self.config.agent.reject_keys)
                    .await?;
                HistoryEvent::CommandDenied {
                    command: pending.command,
                    actor: message.author.clone(),
                }
            }
            ControlCommand::ApproveOnce => {
                self.multiplexer
                    .send_keys(&window, &self.config.agent.confirm_keys)
                    .await?;
                HistoryEvent::CommandApproved {
                    command: pending.command,
                    mode: ApprovalMode::Once,
                    pattern: None,
                    actor: Some(message.author.clone()),
                }
            }
            ControlCommand::ApproveAlways { pattern } => {
                let pattern = pattern
                    .clone()
                    .unwrap_or_else(|| literal_pattern(&pending.failing_fragment));
                self.guard.allow_always(&self.slug, &pattern)?;
                self.multiplexer
                    .send_keys(&window, &self.config.agent.confirm_keys)
                    .await?;
                HistoryEvent::CommandApproved {
                    command: pending.command,
                    mode: ApprovalMode::Always,
                    pattern: Some(pattern),
                    actor: Some(message.author.clone()),
                }
            }
        };
        let session = self
            .registry
            .session_mut(branch)
            .with_context(|| format!("no session for {branch}"))?;
        session.resolve_approval()?;
        session.touch(current_unix_timestamp_ms());
        info!(repo = %self.slug, %branch, event = event.name(), actor = %message.author, "approval resolved");
        self.registry.record(branch, event)?;
        Ok(())
    }

    /// Best effort; a window that cannot be killed is left for the next
    /// fresh start to replace.
    async fn kill_window_if_alive(&self, window: &str) {
        match self.multiplexer.window_exists(window).await {
            Ok(true) => {
                if let Err(error) = self.multiplexer.kill_window(window).await {
                    warn!(repo = %self.slug, %window, error = %format!("{error:#}"), "failed to kill window");
                }
            }
            Ok(false) => {}
            Err(error) => {
                warn!(repo = %self.slug, %window, error = %format!("{error:#}"), "failed to query window")
            }
        }
    }
}
