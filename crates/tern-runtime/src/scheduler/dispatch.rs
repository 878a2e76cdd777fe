//! Feeding task batches into branch sessions.

use anyhow::{Context, Result};
use tern_core::current_unix_timestamp_ms;
use tern_prompt::{TaskContext, REPLY_FILE};
use tern_registry::{HistoryEvent, Session, SessionStatus, SessionTarget, TriggerMessage};
use tracing::{info, warn};

use super::events::{InboundMessage, MessageSource};
use super::Poller;
use crate::output::{output_len, reset_output};
use crate::paths::window_name;
use crate::WindowSpec;

/// Where a message's work happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub(crate) branch: String,
    pub(crate) target: SessionTarget,
}

/// Messages for one branch, in arrival order.
#[derive(Debug, Clone)]
pub(crate) struct TaskBatch {
    pub(crate) route: Route,
    pub(crate) messages: Vec<InboundMessage>,
}

impl TaskBatch {
    pub(crate) fn new(route: Route, first: InboundMessage) -> Self {
        Self {
            route,
            messages: vec![first],
        }
    }

    pub(crate) fn branch(&self) -> &str {
        &self.route.branch
    }

    fn triggers(&self) -> Vec<TriggerMessage> {
        self.messages.iter().map(InboundMessage::to_trigger).collect()
    }

    fn event_keys(&self) -> Vec<String> {
        self.messages
            .iter()
            .map(|message| message.event_key.clone())
            .collect()
    }

    fn issue_body(&self) -> Option<&str> {
        self.messages.iter().find_map(|message| match &message.source {
            MessageSource::Issue { body, .. } => body.as_deref(),
            MessageSource::PullRequest { .. } => None,
        })
    }
}

fn new_triggers(session: &Session, triggers: Vec<TriggerMessage>) -> Vec<TriggerMessage> {
    triggers
        .into_iter()
        .filter(|trigger| !session.contains_event(&trigger.event_key))
        .collect()
}

impl Poller {
    /// Pull requests work on their head branch. Issues work on the branch of
    /// the pull request opened for them, or on a provisional issue branch.
    pub(super) fn route(&self, source: &MessageSource) -> Route {
        match source {
            MessageSource::PullRequest { number, head } => Route {
                branch: head.clone(),
                target: SessionTarget::PullRequest { number: *number },
            },
            MessageSource::Issue { number, .. } => match self.registry.issue_link(*number) {
                Some(link) => Route {
                    branch: link.branch.clone(),
                    target: SessionTarget::PullRequest {
                        number: link.pr_number,
                    },
                },
                None => Route {
                    branch: self.config.issue_branch(*number),
                    target: SessionTarget::Issue { number: *number },
                },
            },
        }
    }

    /// Acknowledges every message of the batch, then acts on it. A failure
    /// restores the branch's session and releases the keys for retry.
    /// Returns false when the batch failed.
    pub(super) async fn dispatch_batch(&mut self, batch: TaskBatch) -> bool {
        let branch = batch.route.branch.clone();
        let snapshot = self.registry.session(&branch).cloned();
        let keys = batch.event_keys();

        let result = match self.acknowledge(&batch).await {
            Ok(()) => self.act_on_batch(&batch, snapshot.as_ref()).await,
            Err(error) => Err(error),
        };
        let Err(error) = result else {
            return true;
        };

        warn!(
            repo = %self.slug,
            %branch,
            error = %format!("{error:#}"),
            "task batch failed; releasing messages for retry"
        );
        self.registry.remove_session(&branch);
        if let Some(previous) = snapshot {
            if let Err(error) = self.registry.insert_session(previous) {
                warn!(repo = %self.slug, %branch, %error, "failed to restore session snapshot");
            }
        }
        for key in &keys {
            self.registry.unmark_seen(key);
        }
        false
    }

    async fn acknowledge(&mut self, batch: &TaskBatch) -> Result<()> {
        for message in &batch.messages {
            self.registry.record(
                &batch.route.branch,
                HistoryEvent::CommentDetected {
                    event_key: message.event_key.clone(),
                    comment_id: message.comment_id,
                    author: message.author.clone(),
                    inline: message.is_inline(),
                    body: message.body.clone(),
                },
            )?;
            self.registry.mark_seen(&message.event_key);
            if let Err(error) = self.forge.add_reaction(message.reaction, "eyes").await {
                warn!(
                    repo = %self.slug,
                    event_key = %message.event_key,
                    error = %format!("{error:#}"),
                    "failed to acknowledge message"
                );
            }
        }
        Ok(())
    }

    async fn act_on_batch(&mut self, batch: &TaskBatch, existing: Option<&Session>) -> Result<()> {
        let Some(session) = existing else {
            return self.start_session(batch).await;
        };
        match session.status() {
            SessionStatus::WaitingClarification => self.answer_clarification(batch, session).await,
            SessionStatus::Running => self.inject_followup(batch, session).await,
            status @ (SessionStatus::WaitingApproval | SessionStatus::Paused) => {
                self.queue_followup(batch, status)
            }
        }
    }

    async fn start_session(&mut self, batch: &TaskBatch) -> Result<()> {
        let now = current_unix_timestamp_ms();
        let Route { branch, target } = &batch.route;
        let resumed = self.registry.is_resumable(branch);
        let window = window_name(branch);
        let output_log = self.repo_paths.output_log(branch);

        let dir = self
            .workspace
            .prepare(branch, &self.base_branch)
            .await
            .with_context(|| format!("failed to prepare workspace for {branch}"))?;
        let reply_path = dir.join(REPLY_FILE);
        if reply_path.exists() {
            tokio::fs::remove_file(&reply_path)
                .await
                .with_context(|| format!("failed to remove stale {}", reply_path.display()))?;
        }
        if self.multiplexer.window_exists(&window).await? {
            info!(repo = %self.slug, %branch, %window, "replacing stale agent window");
            self.multiplexer.kill_window(&window).await?;
        }
        if !resumed {
            reset_output(&output_log).await?;
        }
        let output_offset = output_len(&output_log).await?;

        let triggers = batch.triggers();
        let prompt = self.prompts.render_task(&TaskContext {
            repo: &self.slug,
            branch,
            target: *target,
            issue_body: batch.issue_body(),
            triggers: &triggers,
        })?;
        let mut args = self.config.agent.args.clone();
        if resumed {
            args.extend(self.config.agent.continue_args.iter().cloned());
        }
        args.push(prompt.clone());
        self.multiplexer
            .spawn_window(&WindowSpec {
                name: window.clone(),
                cwd: dir,
                program: self.config.agent.command.clone(),
                args,
                output_log,
            })
            .await?;

        let session = Session::start(
            branch.clone(),
            *target,
            window.clone(),
            triggers,
            resumed,
            output_offset,
            now,
        );
        self.registry.insert_session(session)?;
        if let SessionTarget::PullRequest { number } = target {
            self.registry.track_pull_request(branch, *number);
        }
        self.registry.record(
            branch,
            HistoryEvent::CliStarted {
                window,
                resumed,
                prompt_chars: prompt.chars().count(),
            },
        )?;
        info!(
            repo = %self.slug,
            %branch,
            number = target.number(),
            resumed,
            messages = batch.messages.len(),
            "session started"
        );
        Ok(())
    }

    async fn inject_followup(&mut self, batch: &TaskBatch, session: &Session) -> Result<()> {
        let triggers = new_triggers(session, batch.triggers());
        if triggers.is_empty() {
            return Ok(());
        }
        let prompt = self.prompts.render_followup(session.target, &triggers)?;
        self.multiplexer
            .paste_text(&session.window, &prompt)
            .await
            .with_context(|| format!("failed to inject follow-up into {}", session.window))?;

        let event_keys = triggers
            .iter()
            .map(|trigger| trigger.event_key.clone())
            .collect::<Vec<_>>();
        let branch = batch.branch();
        let live = self
            .registry
            .session_mut(branch)
            .with_context(|| format!("session {branch} disappeared"))?;
        live.incorporate(triggers);
        live.touch(current_unix_timestamp_ms());
        self.registry
            .record(branch, HistoryEvent::FollowupInjected { event_keys })?;
        info!(repo = %self.slug, %branch, "follow-up injected into running session");
        Ok(())
    }

    /// Treats the batch as the answer to the pending question and resumes the
    /// agent in the same session.
    async fn answer_clarification(&mut self, batch: &TaskBatch, session: &Session) -> Result<()> {
        let now = current_unix_timestamp_ms();
        let branch = batch.branch();
        let triggers = new_triggers(session, batch.triggers());
        let question = session
            .pending_clarification()
            .map(|pending| pending.question.clone())
            .unwrap_or_default();
        let prompt =
            self.prompts
                .render_clarification_answer(session.target, &question, &triggers)?;
        let output_log = self.repo_paths.output_log(branch);
        let offset = output_len(&output_log).await?;
        let event_keys = triggers
            .iter()
            .map(|trigger| trigger.event_key.clone())
            .collect::<Vec<_>>();

        let live = self
            .registry
            .session_mut(branch)
            .with_context(|| format!("session {branch} disappeared"))?;
        live.answer_clarification(triggers)?;
        live.begin_run(offset, now);

        if self.multiplexer.window_exists(&session.window).await? {
            self.multiplexer.paste_text(&session.window, &prompt).await?;
        } else {
            let mut args = self.config.agent.args.clone();
            args.extend(self.config.agent.continue_args.iter().cloned());
            args.push(prompt);
            self.multiplexer
                .spawn_window(&WindowSpec {
                    name: session.window.clone(),
                    cwd: self.workspace.path_for(branch),
                    program: self.config.agent.command.clone(),
                    args,
                    output_log,
                })
                .await?;
        }
        self.registry
            .record(branch, HistoryEvent::ClarificationAnswered { event_keys })?;
        info!(repo = %self.slug, %branch, "clarification answered; agent resumed");
        Ok(())
    }

    fn queue_followup(&mut self, batch: &TaskBatch, status: SessionStatus) -> Result<()> {
        let branch = batch.branch();
        let event_keys = batch.event_keys();
        let live = self
            .registry
            .session_mut(branch)
            .with_context(|| format!("session {branch} disappeared"))?;
        let queued = live.queue(batch.triggers());
        self.registry.record(
            branch,
            HistoryEvent::FollowupQueued {
                event_keys,
                status: status.to_string(),
            },
        )?;
        info!(repo = %self.slug, %branch, %status, queued, "follow-up queued until the session runs again");
        Ok(())
    }

    /// Delivers follow-ups queued while the session was paused or waiting.
    pub(super) async fn inject_queued(&mut self, branch: &str) -> Result<()> {
        let Some(session) = self.registry.session(branch) else {
            return Ok(());
        };
        if !session.is_monitored() || session.queued().is_empty() {
            return Ok(());
        }
        let queued = session.queued().to_vec();
        let window = session.window.clone();
        let prompt = self.prompts.render_followup(session.target, &queued)?;
        self.multiplexer
            .paste_text(&window, &prompt)
            .await
            .with_context(|| format!("failed to inject queued follow-up into {window}"))?;
        if let Some(live) = self.registry.session_mut(branch) {
            live.take_queued();
            live.touch(current_unix_timestamp_ms());
        }
        let event_keys = queued.into_iter().map(|trigger| trigger.event_key).collect();
        self.registry
            .record(branch, HistoryEvent::FollowupInjected { event_keys })?;
        info!(repo = %self.slug, %branch, "queued follow-up injected");
        Ok(())
    }
}
