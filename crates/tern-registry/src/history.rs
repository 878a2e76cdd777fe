//! Append-only per-branch audit trail, one JSON object per line.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tern_core::current_rfc3339;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Auto,
    Once,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HistoryEvent {
    CommentDetected {
        event_key: String,
        comment_id: u64,
        author: String,
        inline: bool,
        body: String,
    },
    CliStarted {
        window: String,
        resumed: bool,
        prompt_chars: usize,
    },
    FollowupInjected {
        event_keys: Vec<String>,
    },
    FollowupQueued {
        event_keys: Vec<String>,
        status: String,
    },
    CommandRequested {
        command: String,
        failing_fragment: String,
        escalation_comment_id: u64,
    },
    CommandApproved {
        command: String,
        mode: ApprovalMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actor: Option<String>,
    },
    CommandDenied {
        command: String,
        actor: String,
    },
    CommitPushed {
        sha: String,
        message: String,
    },
    CommentPosted {
        comment_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        in_reply_to: Option<u64>,
    },
    ClarificationRequested {
        question: String,
        comment_id: u64,
    },
    ClarificationAnswered {
        event_keys: Vec<String>,
    },
    PullRequestOpened {
        number: u64,
        issue_number: u64,
    },
    SessionPaused,
    SessionResumed,
    SessionCompleted {
        event_ids: Vec<String>,
        committed: bool,
        replies: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
    },
    SessionFailed {
        event_ids: Vec<String>,
        reason: String,
    },
    PrMerged {
        number: u64,
    },
    PrClosed {
        number: u64,
    },
    Cleanup {
        reason: String,
        workspace_removed: bool,
    },
}

impl HistoryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CommentDetected { .. } => "comment-detected",
            Self::CliStarted { .. } => "cli-started",
            Self::FollowupInjected { .. } => "followup-injected",
            Self::FollowupQueued { .. } => "followup-queued",
            Self::CommandRequested { .. } => "command-requested",
            Self::CommandApproved { .. } => "command-approved",
            Self::CommandDenied { .. } => "command-denied",
            Self::CommitPushed { .. } => "commit-pushed",
            Self::CommentPosted { .. } => "comment-posted",
            Self::ClarificationRequested { .. } => "clarification-requested",
            Self::ClarificationAnswered { .. } => "clarification-answered",
            Self::PullRequestOpened { .. } => "pull-request-opened",
            Self::SessionPaused => "session-paused",
            Self::SessionResumed => "session-resumed",
            Self::SessionCompleted { .. } => "session-completed",
            Self::SessionFailed { .. } => "session-failed",
            Self::PrMerged { .. } => "pr-merged",
            Self::PrClosed { .. } => "pr-closed",
            Self::Cleanup { .. } => "cleanup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: String,
    pub branch: String,
    #[serde(flatten)]
    pub event: HistoryEvent,
}

/// Writer/reader for one branch's `history/<branch>.jsonl` file.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, branch: &str, event: HistoryEvent) -> Result<HistoryRecord> {
        let record = HistoryRecord {
            timestamp: current_rfc3339(),
            branch: branch.to_string(),
            event,
        };
        self.append_record(&record)?;
        Ok(record)
    }

    pub fn append_record(&self, record: &HistoryRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let line = serde_json::to_string(record).context("failed to encode history event")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        Ok(())
    }

    /// Reads every record. Lines that fail to parse are skipped with a warning.
    pub fn read(&self) -> Result<Vec<HistoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut records = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(trimmed) {
                Ok(record) => records.push(record),
                Err(error) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    %error,
                    "skipping malformed history line"
                ),
            }
        }
        Ok(records)
    }
}
