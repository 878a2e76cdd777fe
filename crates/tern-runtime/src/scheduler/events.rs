//! Upstream message discovery and classification.

use std::sync::LazyLock;

use regex::Regex;
use tern_github::{Issue, IssueComment, PullRequest, ReactionTarget, ReviewComment};
use tern_registry::{TriggerKind, TriggerMessage};

static LEADING_MENTIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:@[\w.\-/\[\]]+[,:]?\s+)+").expect("mention regex is valid"));

pub(crate) fn issue_comment_key(id: u64) -> String {
    format!("issue-comment:{id}")
}

pub(crate) fn review_comment_key(id: u64) -> String {
    format!("review-comment:{id}")
}

pub(crate) fn issue_body_key(issue_id: u64) -> String {
    format!("issue-body:{issue_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MessageSource {
    PullRequest { number: u64, head: String },
    Issue { number: u64, body: Option<String> },
}

impl MessageSource {
    pub(crate) fn number(&self) -> u64 {
        match self {
            Self::PullRequest { number, .. } | Self::Issue { number, .. } => *number,
        }
    }
}

/// One upstream message that may direct the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InboundMessage {
    pub event_key: String,
    pub comment_id: u64,
    pub source: MessageSource,
    pub author: String,
    pub body: String,
    pub kind: TriggerKind,
    pub created_at: String,
    pub reaction: ReactionTarget,
}

impl InboundMessage {
    pub(crate) fn from_issue_comment(source: MessageSource, comment: &IssueComment) -> Self {
        Self {
            event_key: issue_comment_key(comment.id),
            comment_id: comment.id,
            source,
            author: comment.user.login.clone(),
            body: comment.body.clone().unwrap_or_default(),
            kind: TriggerKind::Discussion,
            created_at: comment.created_at.clone(),
            reaction: ReactionTarget::IssueComment(comment.id),
        }
    }

    pub(crate) fn from_review_comment(pr: &PullRequest, comment: &ReviewComment) -> Self {
        Self {
            event_key: review_comment_key(comment.id),
            comment_id: comment.id,
            source: MessageSource::PullRequest {
                number: pr.number,
                head: pr.head.ref_name.clone(),
            },
            author: comment.user.login.clone(),
            body: comment.body.clone().unwrap_or_default(),
            kind: TriggerKind::Inline {
                path: comment.path.clone(),
                line: comment.line,
            },
            created_at: comment.created_at.clone(),
            reaction: ReactionTarget::ReviewComment(comment.id),
        }
    }

    /// The issue description counts as the first message of the thread.
    pub(crate) fn from_issue_body(issue: &Issue) -> Self {
        let body = issue.body.clone().unwrap_or_default();
        Self {
            event_key: issue_body_key(issue.id),
            comment_id: issue.id,
            source: MessageSource::Issue {
                number: issue.number,
                body: None,
            },
            author: issue.user.login.clone(),
            body,
            kind: TriggerKind::Discussion,
            created_at: issue.created_at.clone(),
            reaction: ReactionTarget::Issue(issue.number),
        }
    }

    pub(crate) fn to_trigger(&self) -> TriggerMessage {
        TriggerMessage {
            event_key: self.event_key.clone(),
            comment_id: self.comment_id,
            author: self.author.clone(),
            body: self.body.clone(),
            kind: self.kind.clone(),
            created_at: self.created_at.clone(),
        }
    }

    pub(crate) fn is_inline(&self) -> bool {
        matches!(self.kind, TriggerKind::Inline { .. })
    }
}

/// Creation-time order with the numeric ID as a stable tiebreak.
pub(crate) fn sort_messages(messages: &mut [InboundMessage]) {
    messages.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then(left.comment_id.cmp(&right.comment_id))
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlCommand {
    ApproveOnce,
    /// `None` means "remember the failing fragment literally".
    ApproveAlways { pattern: Option<String> },
    Deny,
}

/// Recognises `/approve`, `/approve always [<regex>]` and `/deny`, optionally
/// preceded by mentions. The first line that carries a command wins.
pub(crate) fn parse_control(body: &str) -> Option<ControlCommand> {
    body.lines().find_map(|line| {
        let line = LEADING_MENTIONS.replace(line.trim(), "");
        let line = line.trim();
        let (command, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(command, rest)| (command, rest.trim()));
        match command.to_ascii_lowercase().as_str() {
            "/deny" => Some(ControlCommand::Deny),
            "/approve" => {
                let Some(pattern) = strip_keyword(rest, "always") else {
                    return Some(ControlCommand::ApproveOnce);
                };
                let pattern = pattern.trim().trim_matches('`').trim();
                Some(ControlCommand::ApproveAlways {
                    pattern: (!pattern.is_empty()).then(|| pattern.to_string()),
                })
            }
            _ => None,
        }
    })
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let head = text.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &text[keyword.len()..];
    (rest.is_empty() || rest.starts_with(char::is_whitespace)).then_some(rest)
}

/// Anchored literal pattern for `/approve always` without an explicit regex.
pub(crate) fn literal_pattern(fragment: &str) -> String {
    format!("^{}$", regex::escape(fragment.trim()))
}
