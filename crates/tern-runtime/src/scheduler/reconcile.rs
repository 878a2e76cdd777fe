//! Monitoring running sessions, reconciling finished runs and cleaning up
//! merged or closed pull requests.

use std::collections::HashSet;

use anyhow::{Context, Result};
use tern_core::current_unix_timestamp_ms;
use tern_github::{NewPullRequest, PullRequest, PullRequestState};
use tern_prompt::{default_commit_message, parse_directives, AgentDirectives, REPLY_FILE};
use tern_registry::{
    HistoryEvent, IssueLink, PendingClarification, Session, SessionTarget, TriggerMessage,
};
use tracing::{info, warn};

use super::{PollCycleReport, Poller};
use crate::monitor::{MonitorOutcome, MonitorSettings, SessionMonitor};
use crate::output::{read_output_from, strip_ansi};

/// GitHub rejects comment bodies above 65 536 characters.
const MAX_COMMENT_CHARS: usize = 60_000;

#[derive(Debug, Default)]
struct ReconcileProgress {
    /// Something already reached upstream; the run must not be retried.
    visible: bool,
}

fn truncate_comment(body: &str) -> String {
    if body.chars().count() <= MAX_COMMENT_CHARS {
        return body.to_string();
    }
    let tail: String = body
        .chars()
        .rev()
        .take(MAX_COMMENT_CHARS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("(output truncated)\n\n{tail}")
}

fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

/// Accepts `BRANCH_NAME` only when it is a plausible git ref component.
fn suggested_branch(prefix: &str, suggestion: Option<&str>) -> Option<String> {
    let suggestion = suggestion?.trim().trim_matches('`').trim();
    let name = suggestion.strip_prefix(prefix).unwrap_or(suggestion);
    let name = name.split_whitespace().collect::<Vec<_>>().join("-");
    let valid = !name.is_empty()
        && !name.starts_with(['-', '/', '.'])
        && !name.ends_with(['/', '.'])
        && !name.contains("..")
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/'));
    valid.then(|| format!("{prefix}{name}"))
}

fn inline_trigger(session: &Session, comment_id: u64) -> Option<&TriggerMessage> {
    session
        .triggers()
        .iter()
        .find(|trigger| trigger.comment_id == comment_id && trigger.is_inline())
}

impl Poller {
    pub(super) async fn monitor_sessions(&mut self, report: &mut PollCycleReport) {
        let settings = MonitorSettings::from(&self.config.agent);
        let mut finished = Vec::new();

        for branch in self.registry.branches() {
            if let Err(error) = self.inject_queued(&branch).await {
                warn!(repo = %self.slug, %branch, error = %format!("{error:#}"), "queued follow-up not delivered");
            }
            let history = self.registry.history(&branch);
            let output_log = self.repo_paths.output_log(&branch);
            let Some(session) = self.registry.session_mut(&branch) else {
                continue;
            };
            let monitor = SessionMonitor {
                multiplexer: self.multiplexer.as_ref(),
                forge: self.forge.as_ref(),
                guard: &self.guard,
                settings: &settings,
                repository: &self.slug,
            };
            let outcome = monitor
                .poll(session, &output_log, &history, current_unix_timestamp_ms())
                .await;
            match outcome {
                Ok(MonitorOutcome::Running | MonitorOutcome::Paused) => {}
                Ok(MonitorOutcome::Completed) => finished.push(branch),
                Ok(MonitorOutcome::ApprovalNeeded(pending)) => {
                    if let Err(error) = session.enter_waiting_approval(pending) {
                        warn!(repo = %self.slug, %branch, %error, "could not enter waiting_approval");
                    }
                }
                Err(error) => {
                    warn!(repo = %self.slug, %branch, error = %format!("{error:#}"), "session monitor failed")
                }
            }
        }

        for branch in finished {
            if self.reconcile_session(&branch).await {
                report.completed += 1;
            } else {
                report.failed += 1;
            }
        }
    }

    /// Turns a finished run into upstream effects. Returns false when the run
    /// counts as failed.
    async fn reconcile_session(&mut self, branch: &str) -> bool {
        let Some(session) = self.registry.session(branch).cloned() else {
            return false;
        };
        let mut progress = ReconcileProgress::default();
        match self.reconcile(&session, &mut progress).await {
            Ok(true) => true,
            Ok(false) => {
                self.fail_session(&session, "agent produced no output", true)
                    .await;
                false
            }
            Err(error) => {
                let reason = format!("{error:#}");
                warn!(repo = %self.slug, %branch, error = %reason, "reconciliation failed");
                self.fail_session(&session, &reason, !progress.visible).await;
                false
            }
        }
    }

    async fn read_agent_reply(&self, session: &Session) -> Result<String> {
        let reply_path = self.workspace.path_for(&session.branch).join(REPLY_FILE);
        match tokio::fs::read_to_string(&reply_path).await {
            Ok(reply) => {
                tokio::fs::remove_file(&reply_path)
                    .await
                    .with_context(|| format!("failed to remove {}", reply_path.display()))?;
                if !reply.trim().is_empty() {
                    return Ok(reply);
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read {}", reply_path.display()))
            }
        }
        let output_log = self.repo_paths.output_log(&session.branch);
        let (raw, _) = read_output_from(&output_log, session.run_output_offset()).await?;
        Ok(strip_ansi(&raw))
    }

    /// Returns Ok(false) when the run produced nothing visible.
    async fn reconcile(&mut self, session: &Session, progress: &mut ReconcileProgress) -> Result<bool> {
        session.ensure_completable()?;
        let branch = session.branch.as_str();
        let reply = self.read_agent_reply(session).await?;
        let directives = parse_directives(&reply);

        if let Some(question) = directives.clarification.clone() {
            self.request_clarification(session, &question, &directives)
                .await?;
            return Ok(true);
        }

        let message = directives
            .commit_message
            .clone()
            .unwrap_or_else(|| default_commit_message(session.target));
        let push_branch = match session.target {
            SessionTarget::Issue { .. } => suggested_branch(
                &self.config.pull_request.branch_prefix,
                directives.branch_name.as_deref(),
            )
            .unwrap_or_else(|| branch.to_string()),
            SessionTarget::PullRequest { .. } => branch.to_string(),
        };
        let sha = self
            .workspace
            .commit_and_push(branch, &push_branch, &self.base_branch, &message)
            .await
            .with_context(|| format!("failed to commit and push {branch}"))?;
        if let Some(sha) = &sha {
            progress.visible = true;
            self.registry.set_resumable(branch, false);
            self.registry.record(
                branch,
                HistoryEvent::CommitPushed {
                    sha: sha.clone(),
                    message: message.clone(),
                },
            )?;
        }

        let unmatched = self.post_inline_replies(session, &directives, progress).await?;

        let mut opened = None;
        if let (SessionTarget::Issue { number }, Some(_)) = (session.target, &sha) {
            let pr = self
                .open_pull_request(session, number, &push_branch, &directives)
                .await?;
            progress.visible = true;
            opened = Some(pr.number);
        }

        let mut body = directives.body.clone();
        for (comment_id, text) in unmatched {
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(&format!("Re comment {comment_id}: {text}"));
        }
        if body.is_empty() {
            body = match (&sha, opened) {
                (Some(sha), Some(pr)) => format!("Opened #{pr} with {}: {message}", short_sha(sha)),
                (Some(sha), None) => format!("Pushed {}: {message}", short_sha(sha)),
                _ => String::new(),
            };
        }
        let mut replies = directives.responses.len();
        if !body.is_empty() {
            let posted = self
                .forge
                .create_issue_comment(session.target.number(), &truncate_comment(&body))
                .await
                .context("failed to post reply")?;
            progress.visible = true;
            replies += 1;
            self.registry.record(
                branch,
                HistoryEvent::CommentPosted {
                    comment_id: posted.id,
                    in_reply_to: None,
                },
            )?;
        }

        if !progress.visible {
            return Ok(false);
        }
        self.registry.set_resumable(branch, sha.is_none());
        self.registry.record(
            branch,
            HistoryEvent::SessionCompleted {
                event_ids: session.event_ids().to_vec(),
                committed: sha.is_some(),
                replies,
                tokens: directives.tokens,
            },
        )?;
        self.registry.remove_session(branch);
        self.kill_window_if_alive(&session.window).await;
        info!(
            repo = %self.slug,
            %branch,
            committed = sha.is_some(),
            replies,
            "session reconciled"
        );
        Ok(true)
    }

    async fn request_clarification(
        &mut self,
        session: &Session,
        question: &str,
        directives: &AgentDirectives,
    ) -> Result<()> {
        let branch = session.branch.as_str();
        let mention = session
            .triggers()
            .last()
            .map(|trigger| format!("@{} ", trigger.author))
            .unwrap_or_default();
        let mut body = format!("{mention}I need more information before I can continue:\n\n> {question}");
        if !directives.body.is_empty() {
            body = format!("{}\n\n{body}", directives.body);
        }
        let posted = self
            .forge
            .create_issue_comment(session.target.number(), &truncate_comment(&body))
            .await
            .context("failed to post clarification question")?;
        let live = self
            .registry
            .session_mut(branch)
            .with_context(|| format!("session {branch} disappeared"))?;
        live.enter_waiting_clarification(PendingClarification {
            question: question.to_string(),
            comment_id: posted.id,
            requested_unix_ms: current_unix_timestamp_ms(),
        })?;
        self.registry.record(
            branch,
            HistoryEvent::ClarificationRequested {
                question: question.to_string(),
                comment_id: posted.id,
            },
        )?;
        info!(repo = %self.slug, %branch, "clarification requested");
        Ok(())
    }

    /// Posts `RESPONSE[id]` replies under their inline comments and returns
    /// the ones that do not belong to an inline trigger of this session.
    async fn post_inline_replies(
        &mut self,
        session: &Session,
        directives: &AgentDirectives,
        progress: &mut ReconcileProgress,
    ) -> Result<Vec<(u64, String)>> {
        let mut unmatched = Vec::new();
        for (&comment_id, text) in &directives.responses {
            let SessionTarget::PullRequest { number } = session.target else {
                unmatched.push((comment_id, text.clone()));
                continue;
            };
            if inline_trigger(session, comment_id).is_none() {
                unmatched.push((comment_id, text.clone()));
                continue;
            }
            let posted = self
                .forge
                .reply_to_review_comment(number, comment_id, &truncate_comment(text))
                .await
                .with_context(|| format!("failed to reply to review comment {comment_id}"))?;
            progress.visible = true;
            self.registry.record(
                &session.branch,
                HistoryEvent::CommentPosted {
                    comment_id: posted.id,
                    in_reply_to: Some(comment_id),
                },
            )?;
        }
        Ok(unmatched)
    }

    async fn open_pull_request(
        &mut self,
        session: &Session,
        issue_number: u64,
        push_branch: &str,
        directives: &AgentDirectives,
    ) -> Result<PullRequest> {
        let branch = session.branch.as_str();
        let title = directives
            .pr_title
            .clone()
            .unwrap_or_else(|| default_commit_message(session.target));
        let mut body = format!("Closes #{issue_number}");
        if !directives.body.is_empty() {
            body.push_str("\n\n");
            body.push_str(&directives.body);
        }
        let pr = self
            .forge
            .create_pull_request(&NewPullRequest {
                title,
                head: push_branch.to_string(),
                base: self.base_branch.clone(),
                body: truncate_comment(&body),
                draft: self.config.pull_request.draft,
            })
            .await
            .with_context(|| format!("failed to open pull request for issue #{issue_number}"))?;

        self.registry.track_pull_request(push_branch, pr.number);
        self.registry.link_issue(
            issue_number,
            IssueLink {
                pr_number: pr.number,
                branch: push_branch.to_string(),
            },
        );
        self.registry.record(
            branch,
            HistoryEvent::PullRequestOpened {
                number: pr.number,
                issue_number,
            },
        )?;
        info!(repo = %self.slug, %branch, %push_branch, pr = pr.number, issue = issue_number, "pull request opened");

        if push_branch != branch {
            let workspace_removed = match self.workspace.remove(branch).await {
                Ok(removed) => removed,
                Err(error) => {
                    warn!(repo = %self.slug, %branch, error = %format!("{error:#}"), "failed to remove provisional workspace");
                    false
                }
            };
            self.registry.record(
                branch,
                HistoryEvent::Cleanup {
                    reason: format!("continued on {push_branch}"),
                    workspace_removed,
                },
            )?;
        }
        Ok(pr)
    }

    /// Tears a failed run down. With `retry`, its event IDs are released so
    /// the same messages are picked up again next cycle.
    async fn fail_session(&mut self, session: &Session, reason: &str, retry: bool) {
        let branch = session.branch.as_str();
        self.registry.remove_session(branch);
        self.registry.set_resumable(branch, false);
        if retry {
            for key in session.event_ids() {
                self.registry.unmark_seen(key);
            }
        }
        if let Err(error) = self.registry.record(
            branch,
            HistoryEvent::SessionFailed {
                event_ids: session.event_ids().to_vec(),
                reason: reason.to_string(),
            },
        ) {
            warn!(repo = %self.slug, %branch, error = %format!("{error:#}"), "failed to record session failure");
        }
        self.kill_window_if_alive(&session.window).await;
        warn!(repo = %self.slug, %branch, retry, %reason, "session failed");
    }

    pub(super) async fn cleanup_finished_pull_requests(&mut self, open: &[PullRequest]) {
        let open = open.iter().map(|pr| pr.number).collect::<HashSet<_>>();
        for (branch, number) in self.registry.tracked_pull_requests() {
            if open.contains(&number) {
                continue;
            }
            let state = match self.forge.pull_request_state(number).await {
                Ok(state) => state,
                Err(error) => {
                    warn!(repo = %self.slug, %branch, pr = number, error = %format!("{error:#}"), "failed to read pull request state");
                    continue;
                }
            };
            if state == PullRequestState::Open {
                continue;
            }
            if let Err(error) = self.cleanup_branch(&branch, number, state).await {
                warn!(repo = %self.slug, %branch, error = %format!("{error:#}"), "branch cleanup failed");
            }
        }
    }

    async fn cleanup_branch(&mut self, branch: &str, number: u64, state: PullRequestState) -> Result<()> {
        if let Some(session) = self.registry.remove_session(branch) {
            self.kill_window_if_alive(&session.window).await;
        } else {
            self.kill_window_if_alive(&crate::paths::window_name(branch))
                .await;
        }
        let workspace_removed = if self.config.workspace.keep_on_merge {
            false
        } else {
            self.workspace
                .remove(branch)
                .await
                .with_context(|| format!("failed to remove workspace for {branch}"))?
        };
        self.registry.set_resumable(branch, false);
        self.registry.untrack_pull_request(branch);
        self.registry.unlink_branch_issues(branch);

        let event = match state {
            PullRequestState::Merged => HistoryEvent::PrMerged { number },
            _ => HistoryEvent::PrClosed { number },
        };
        self.registry.record(branch, event)?;
        self.registry.record(
            branch,
            HistoryEvent::Cleanup {
                reason: state.as_str().to_string(),
                workspace_removed,
            },
        )?;
        info!(repo = %self.slug, %branch, pr = number, state = state.as_str(), workspace_removed, "branch cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_suggested_branch_is_prefixed_and_validated() {
        assert_eq!(
            suggested_branch("tern/", Some("fix login")).as_deref(),
            Some("tern/fix-login")
        );
        assert_eq!(
            suggested_branch("tern/", Some("`tern/readme`")).as_deref(),
            Some("tern/readme")
        );
        assert_eq!(suggested_branch("tern/", Some("../etc")), None);
        assert_eq!(suggested_branch("tern/", Some("a:b")), None);
        assert_eq!(suggested_branch("tern/", None), None);
    }

    #[test]
    fn unit_truncate_comment_keeps_the_tail() {
        let long = "x".repeat(MAX_COMMENT_CHARS) + "END";
        let truncated = truncate_comment(&long);
        assert!(truncated.starts_with("(output truncated)"));
        assert!(truncated.ends_with("END"));
        assert_eq!(truncate_comment("short"), "short");
        assert_eq!(short_sha("abc"), "abc");
        assert_eq!(short_sha("0123456789"), "0123456");
    }
}
