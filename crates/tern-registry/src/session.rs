//! Branch session record and its state machine.
//!
//! Status transitions go through the methods on [`Session`]; each one checks
//! the source state and leaves the pending-record invariants intact:
//! `pending_approval` is set iff the status is `waiting_approval`, and
//! `pending_clarification` is set iff the status is `waiting_clarification`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    WaitingApproval,
    WaitingClarification,
    Paused,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::WaitingClarification => "waiting_clarification",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session {branch}: cannot {action} while {from}")]
    Illegal {
        branch: String,
        from: SessionStatus,
        action: &'static str,
    },
    #[error("session {branch}: {detail}")]
    InvariantViolated { branch: String, detail: String },
}

/// What the branch was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionTarget {
    PullRequest { number: u64 },
    Issue { number: u64 },
}

impl SessionTarget {
    pub fn number(self) -> u64 {
        match self {
            Self::PullRequest { number } | Self::Issue { number } => number,
        }
    }

    pub fn is_issue(self) -> bool {
        matches!(self, Self::Issue { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    Inline {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        line: Option<u64>,
    },
    Discussion,
}

/// One operator message folded into a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerMessage {
    pub event_key: String,
    pub comment_id: u64,
    pub author: String,
    pub body: String,
    #[serde(flatten)]
    pub kind: TriggerKind,
    pub created_at: String,
}

impl TriggerMessage {
    pub fn is_inline(&self) -> bool {
        matches!(self.kind, TriggerKind::Inline { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub command: String,
    pub failing_fragment: String,
    pub escalation_comment_id: u64,
    pub requested_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingClarification {
    pub question: String,
    pub comment_id: u64,
    pub requested_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub branch: String,
    pub target: SessionTarget,
    pub window: String,
    #[serde(default)]
    pub resumed: bool,
    #[serde(default)]
    event_ids: Vec<String>,
    #[serde(default)]
    triggers: Vec<TriggerMessage>,
    #[serde(default)]
    queued: Vec<TriggerMessage>,
    status: SessionStatus,
    #[serde(default)]
    cursor: u64,
    #[serde(default)]
    run_output_offset: u64,
    pub started_unix_ms: u64,
    pub last_activity_unix_ms: u64,
    #[serde(default)]
    pending_approval: Option<PendingApproval>,
    #[serde(default)]
    pending_clarification: Option<PendingClarification>,
}

impl Session {
    /// Starts a `running` session. A fresh start reads the stream from 0; a
    /// resumed one continues from `output_offset`, the end of the previous run.
    pub fn start(
        branch: impl Into<String>,
        target: SessionTarget,
        window: impl Into<String>,
        triggers: Vec<TriggerMessage>,
        resumed: bool,
        output_offset: u64,
        now_unix_ms: u64,
    ) -> Self {
        let cursor = if resumed { output_offset } else { 0 };
        let mut session = Self {
            branch: branch.into(),
            target,
            window: window.into(),
            resumed,
            event_ids: Vec::new(),
            triggers: Vec::new(),
            queued: Vec::new(),
            status: SessionStatus::Running,
            cursor,
            run_output_offset: cursor,
            started_unix_ms: now_unix_ms,
            last_activity_unix_ms: now_unix_ms,
            pending_approval: None,
            pending_clarification: None,
        };
        session.incorporate(triggers);
        session
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn event_ids(&self) -> &[String] {
        &self.event_ids
    }

    pub fn triggers(&self) -> &[TriggerMessage] {
        &self.triggers
    }

    pub fn queued(&self) -> &[TriggerMessage] {
        &self.queued
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn run_output_offset(&self) -> u64 {
        self.run_output_offset
    }

    pub fn pending_approval(&self) -> Option<&PendingApproval> {
        self.pending_approval.as_ref()
    }

    pub fn pending_clarification(&self) -> Option<&PendingClarification> {
        self.pending_clarification.as_ref()
    }

    pub fn contains_event(&self, event_key: &str) -> bool {
        self.event_ids.iter().any(|existing| existing == event_key)
    }

    pub fn is_monitored(&self) -> bool {
        self.status == SessionStatus::Running
    }

    /// Moves the cursor forward. Offsets behind the current cursor are ignored.
    pub fn advance_cursor(&mut self, offset: u64) -> u64 {
        if offset > self.cursor {
            self.cursor = offset;
        }
        self.cursor
    }

    pub fn touch(&mut self, now_unix_ms: u64) {
        self.last_activity_unix_ms = self.last_activity_unix_ms.max(now_unix_ms);
    }

    /// Appends triggers to the history, skipping keys already incorporated.
    /// Returns the newly added triggers.
    pub fn incorporate(&mut self, triggers: Vec<TriggerMessage>) -> Vec<TriggerMessage> {
        let mut added = Vec::new();
        for trigger in triggers {
            if self.contains_event(&trigger.event_key) {
                continue;
            }
            self.event_ids.push(trigger.event_key.clone());
            self.triggers.push(trigger.clone());
            added.push(trigger);
        }
        added
    }

    /// Records a follow-up that has to wait until the session is `running`.
    pub fn queue(&mut self, triggers: Vec<TriggerMessage>) -> usize {
        let added = self.incorporate(triggers);
        let count = added.len();
        self.queued.extend(added);
        count
    }

    pub fn take_queued(&mut self) -> Vec<TriggerMessage> {
        std::mem::take(&mut self.queued)
    }

    /// Marks the start of a new agent run inside the same session (clarification
    /// answer). Extraction reads the stream from this offset.
    pub fn begin_run(&mut self, output_offset: u64, now_unix_ms: u64) {
        self.advance_cursor(output_offset);
        self.run_output_offset = self.cursor;
        self.touch(now_unix_ms);
    }

    pub fn enter_waiting_approval(
        &mut self,
        pending: PendingApproval,
    ) -> Result<(), TransitionError> {
        self.require(SessionStatus::Running, "request approval")?;
        self.status = SessionStatus::WaitingApproval;
        self.pending_approval = Some(pending);
        self.check_invariants()
    }

    /// Clears the pending approval after an approve or deny action.
    pub fn resolve_approval(&mut self) -> Result<PendingApproval, TransitionError> {
        self.require(SessionStatus::WaitingApproval, "resolve approval")?;
        let pending = self
            .pending_approval
            .take()
            .ok_or_else(|| self.violation("waiting_approval without a pending approval"))?;
        self.status = SessionStatus::Running;
        self.check_invariants()?;
        Ok(pending)
    }

    pub fn enter_waiting_clarification(
        &mut self,
        pending: PendingClarification,
    ) -> Result<(), TransitionError> {
        self.require(SessionStatus::Running, "request clarification")?;
        self.status = SessionStatus::WaitingClarification;
        self.pending_clarification = Some(pending);
        self.check_invariants()
    }

    /// Folds an answer batch into the trigger history and returns to `running`.
    pub fn answer_clarification(
        &mut self,
        answer: Vec<TriggerMessage>,
    ) -> Result<(PendingClarification, Vec<TriggerMessage>), TransitionError> {
        self.require(SessionStatus::WaitingClarification, "answer clarification")?;
        let pending = self.pending_clarification.take().ok_or_else(|| {
            self.violation("waiting_clarification without a pending clarification")
        })?;
        let added = self.incorporate(answer);
        self.status = SessionStatus::Running;
        self.check_invariants()?;
        Ok((pending, added))
    }

    pub fn pause(&mut self) -> Result<(), TransitionError> {
        self.require(SessionStatus::Running, "pause")?;
        self.status = SessionStatus::Paused;
        self.check_invariants()
    }

    pub fn resume(&mut self, now_unix_ms: u64) -> Result<(), TransitionError> {
        self.require(SessionStatus::Paused, "resume")?;
        self.status = SessionStatus::Running;
        self.touch(now_unix_ms);
        self.check_invariants()
    }

    /// Completion is only legal from `running`; the caller removes the session.
    pub fn ensure_completable(&self) -> Result<(), TransitionError> {
        self.require(SessionStatus::Running, "complete")
    }

    pub fn check_invariants(&self) -> Result<(), TransitionError> {
        let approval_ok =
            self.pending_approval.is_some() == (self.status == SessionStatus::WaitingApproval);
        if !approval_ok {
            return Err(self.violation(&format!(
                "pending approval presence does not match status {}",
                self.status
            )));
        }
        let clarification_ok = self.pending_clarification.is_some()
            == (self.status == SessionStatus::WaitingClarification);
        if !clarification_ok {
            return Err(self.violation(&format!(
                "pending clarification presence does not match status {}",
                self.status
            )));
        }
        Ok(())
    }

    fn require(&self, expected: SessionStatus, action: &'static str) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionError::Illegal {
                branch: self.branch.clone(),
                from: self.status,
                action,
            })
        }
    }

    fn violation(&self, detail: &str) -> TransitionError {
        TransitionError::InvariantViolated {
            branch: self.branch.clone(),
            detail: detail.to_string(),
        }
    }
}
