//! Session Monitor: incremental, non-blocking interpretation of one branch's
//! live output stream.

use std::{path::Path, sync::LazyLock};

use anyhow::{Context, Result};
use regex::Regex;
use tern_core::is_idle_past;
use tern_github::Forge;
use tern_guard::{CommandGuard, GuardDecision, GuardScope};
use tern_registry::{
    ApprovalMode, HistoryEvent, HistoryLog, PendingApproval, Session, SessionStatus,
};
use tracing::{info, warn};

use crate::config::AgentSettings;
use crate::output::{has_meaningful_content, read_output_before, read_output_from, strip_ansi};
use crate::Multiplexer;

static APPROVAL_PROMPTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)do you want to (?:run|proceed|execute)",
        r"(?i)\ballow\b[^\n]{0,80}\btool\b",
        r"\?\s*\([yY]/[nN]\)",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("approval prompt regex is valid"))
    .collect()
});

static TRUST_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)do you trust the (?:files|authors|contents)|trust this (?:folder|workspace)")
        .expect("trust prompt regex is valid")
});

static BASH_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)Bash\((.+)\)\s*$").expect("bash call regex is valid"));

static BASH_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Bash command[ \t]*\n(?:[ \t]*\n)*[ \t]*([^\n]+)")
        .expect("bash block regex is valid")
});

static BACKTICKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\n]+)`").expect("backtick regex is valid"));

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"\n]+)""#).expect("quote regex is valid"));

/// How far before a prompt to look for the command it is asking about.
const COMMAND_LOOKBACK_BYTES: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Completed,
    Running,
    /// The caller moves the session to `waiting_approval` with this record.
    ApprovalNeeded(PendingApproval),
    /// The session is not `running`; nothing was read.
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub confirm_keys: Vec<String>,
    pub trust_keys: Vec<String>,
    pub idle_timeout_ms: u64,
}

impl From<&AgentSettings> for MonitorSettings {
    fn from(agent: &AgentSettings) -> Self {
        Self {
            confirm_keys: agent.confirm_keys.clone(),
            trust_keys: agent.trust_keys.clone(),
            idle_timeout_ms: agent.idle_timeout_secs.saturating_mul(1_000),
        }
    }
}

/// Byte offset of the last approval prompt in `text`.
fn last_approval_prompt(text: &str) -> Option<usize> {
    APPROVAL_PROMPTS
        .iter()
        .filter_map(|pattern| pattern.find_iter(text).last().map(|found| found.start()))
        .max()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Pulls the requested command out of the text around an approval prompt.
pub fn extract_command(text: &str, prompt_at: usize) -> Option<String> {
    let start = floor_char_boundary(text, prompt_at.saturating_sub(COMMAND_LOOKBACK_BYTES));
    let line_end = text[prompt_at..]
        .find('\n')
        .map_or(text.len(), |offset| prompt_at + offset);
    let window = &text[start..line_end];

    [&*BASH_CALL, &*BASH_BLOCK, &*BACKTICKED, &*QUOTED]
        .into_iter()
        .find_map(|pattern| {
            pattern
                .captures_iter(window)
                .last()
                .and_then(|captures| captures.get(1))
                .map(|found| found.as_str().trim().to_string())
                .filter(|command| !command.is_empty())
        })
}

fn prompt_line(text: &str, prompt_at: usize) -> String {
    let line_start = text[..prompt_at].rfind('\n').map_or(0, |index| index + 1);
    let line_end = text[prompt_at..]
        .find('\n')
        .map_or(text.len(), |offset| prompt_at + offset);
    text[line_start..line_end].trim().to_string()
}

pub fn escalation_message(author: Option<&str>, command: &str, failing_fragment: &str) -> String {
    let mention = author.map(|login| format!("@{login} ")).unwrap_or_default();
    format!(
        "{mention}the agent is waiting for approval to run:\n\n```\n{command}\n```\n\n\
         Not covered by the whitelist: `{failing_fragment}`\n\n\
         Reply `/approve` to allow it once, `/approve always <regex>` to allow it and remember \
         the pattern for this repository, or `/deny` to reject it."
    )
}

pub struct SessionMonitor<'a> {
    pub multiplexer: &'a dyn Multiplexer,
    pub forge: &'a dyn Forge,
    pub guard: &'a CommandGuard,
    pub settings: &'a MonitorSettings,
    /// Repository scope for whitelist lookups.
    pub repository: &'a str,
}

impl SessionMonitor<'_> {
    /// Reads new output from the session's cursor and classifies it. The cursor
    /// only advances once the read range has been fully handled, so a failed
    /// escalation is retried from the same offset.
    pub async fn poll(
        &self,
        session: &mut Session,
        output_log: &Path,
        history: &HistoryLog,
        now_unix_ms: u64,
    ) -> Result<MonitorOutcome> {
        if session.status() != SessionStatus::Running {
            return Ok(MonitorOutcome::Paused);
        }

        let cursor = session.cursor();
        let (raw, end) = read_output_from(output_log, cursor).await?;
        let text = strip_ansi(&raw);
        if has_meaningful_content(&text) {
            session.touch(now_unix_ms);
        }

        if TRUST_PROMPT.is_match(&text) {
            self.multiplexer
                .send_keys(&session.window, &self.settings.trust_keys)
                .await
                .context("failed to answer trust prompt")?;
            info!(branch = %session.branch, window = %session.window, "answered trust prompt");
        }

        if let Some(prompt_at) = last_approval_prompt(&text) {
            let command = match extract_command(&text, prompt_at) {
                Some(command) => Some(command),
                None => {
                    // The tool call may have been flushed in an earlier read.
                    let earlier = strip_ansi(
                        &read_output_before(output_log, cursor, COMMAND_LOOKBACK_BYTES as u64)
                            .await?,
                    );
                    let joined = format!("{earlier}{text}");
                    extract_command(&joined, earlier.len() + prompt_at)
                }
            };
            let decision = command
                .as_deref()
                .map(|command| self.guard.check(command, GuardScope::Repository(self.repository)));
            match (command, decision) {
                (Some(command), Some(GuardDecision::Approved { .. })) => {
                    self.multiplexer
                        .send_keys(&session.window, &self.settings.confirm_keys)
                        .await
                        .context("failed to confirm approved command")?;
                    history.append(
                        &session.branch,
                        HistoryEvent::CommandApproved {
                            command: command.clone(),
                            mode: ApprovalMode::Auto,
                            pattern: None,
                            actor: None,
                        },
                    )?;
                    info!(branch = %session.branch, %command, "auto-approved whitelisted command");
                }
                (command, decision) => {
                    let command = command.unwrap_or_else(|| prompt_line(&text, prompt_at));
                    let failing_fragment = decision
                        .as_ref()
                        .and_then(GuardDecision::failing_fragment)
                        .unwrap_or(command.as_str())
                        .to_string();
                    let pending = self
                        .escalate(session, command, failing_fragment, history, now_unix_ms)
                        .await?;
                    session.advance_cursor(end);
                    return Ok(MonitorOutcome::ApprovalNeeded(pending));
                }
            }
        }

        session.advance_cursor(end);

        if !self.multiplexer.window_exists(&session.window).await? {
            info!(branch = %session.branch, window = %session.window, "agent window exited");
            return Ok(MonitorOutcome::Completed);
        }

        if is_idle_past(
            session.last_activity_unix_ms,
            self.settings.idle_timeout_ms,
            now_unix_ms,
        ) {
            if let Err(error) = self.multiplexer.kill_window(&session.window).await {
                warn!(branch = %session.branch, %error, "failed to kill idle agent window");
            }
            info!(branch = %session.branch, "agent idle past timeout; treating as completed");
            return Ok(MonitorOutcome::Completed);
        }

        Ok(MonitorOutcome::Running)
    }

    async fn escalate(
        &self,
        session: &Session,
        command: String,
        failing_fragment: String,
        history: &HistoryLog,
        now_unix_ms: u64,
    ) -> Result<PendingApproval> {
        let author = session.triggers().last().map(|trigger| trigger.author.as_str());
        let body = escalation_message(author, &command, &failing_fragment);
        let posted = self
            .forge
            .create_issue_comment(session.target.number(), &body)
            .await
            .context("failed to post approval escalation")?;
        history.append(
            &session.branch,
            HistoryEvent::CommandRequested {
                command: command.clone(),
                failing_fragment: failing_fragment.clone(),
                escalation_comment_id: posted.id,
            },
        )?;
        warn!(
            branch = %session.branch,
            %command,
            %failing_fragment,
            "command not whitelisted; escalated for approval"
        );
        Ok(PendingApproval {
            command,
            failing_fragment,
            escalation_comment_id: posted.id,
            requested_unix_ms: now_unix_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tern_registry::{SessionTarget, TriggerKind, TriggerMessage};

    use super::*;
    use crate::testing::{FakeForge, FakeMultiplexer};
    use crate::WindowSpec;

    struct Fixture {
        _tempdir: tempfile::TempDir,
        log: PathBuf,
        history: HistoryLog,
        forge: FakeForge,
        multiplexer: FakeMultiplexer,
        guard: CommandGuard,
        settings: MonitorSettings,
        session: Session,
    }

    impl Fixture {
        async fn new(patterns: &[&str]) -> Self {
            let tempdir = tempfile::tempdir().expect("tempdir");
            let log = tempdir.path().join("feature.log");
            std::fs::write(&log, "").expect("log");
            let multiplexer = FakeMultiplexer::default();
            multiplexer
                .spawn_window(&WindowSpec {
                    name: "tern-feature".into(),
                    cwd: tempdir.path().to_path_buf(),
                    program: "agent".into(),
                    args: Vec::new(),
                    output_log: log.clone(),
                })
                .await
                .expect("spawn");
            let session = Session::start(
                "feature",
                SessionTarget::PullRequest { number: 12 },
                "tern-feature",
                vec![TriggerMessage {
                    event_key: "issue-comment:1".into(),
                    comment_id: 1,
                    author: "alice".into(),
                    body: "@tern fix".into(),
                    kind: TriggerKind::Discussion,
                    created_at: "2026-01-01T00:00:00Z".into(),
                }],
                false,
                0,
                1_000,
            );
            Self {
                history: HistoryLog::new(tempdir.path().join("history.jsonl")),
                guard: CommandGuard::from_patterns(tempdir.path().join("whitelist.json"), patterns.iter().copied()),
                _tempdir: tempdir,
                log,
                forge: FakeForge::default(),
                multiplexer,
                settings: MonitorSettings {
                    confirm_keys: vec!["Enter".into()],
                    trust_keys: vec!["Enter".into()],
                    idle_timeout_ms: 10_000,
                },
                session,
            }
        }

        fn append(&self, text: &str) {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&self.log)
                .expect("open");
            std::io::Write::write_all(&mut file, text.as_bytes()).expect("append");
        }

        async fn poll(&mut self, now: u64) -> MonitorOutcome {
            let monitor = SessionMonitor {
                multiplexer: &self.multiplexer,
                forge: &self.forge,
                guard: &self.guard,
                settings: &self.settings,
                repository: "acme/widgets",
            };
            monitor
                .poll(&mut self.session, &self.log, &self.history, now)
                .await
                .expect("poll")
        }
    }

    #[test]
    fn unit_extract_command_prefers_tool_call_then_backticks() {
        let text = "● Bash(cargo test --all)\n  Do you want to proceed?";
        let at = last_approval_prompt(text).expect("prompt");
        assert_eq!(extract_command(text, at).as_deref(), Some("cargo test --all"));

        let text = "Bash command\n\n   rm -rf target\n   Clean\n\nDo you want to proceed?";
        let at = last_approval_prompt(text).expect("prompt");
        assert_eq!(extract_command(text, at).as_deref(), Some("rm -rf target"));

        let text = "Run `git push --force`? (y/n)";
        let at = last_approval_prompt(text).expect("prompt");
        assert_eq!(extract_command(text, at).as_deref(), Some("git push --force"));

        assert!(last_approval_prompt("just some output").is_none());
    }

    #[tokio::test]
    async fn functional_whitelisted_command_is_confirmed_and_logged() {
        let mut fixture = Fixture::new(&[r"^git\s+status"]).await;
        fixture.append("● Bash(git status)\nDo you want to proceed?\n");
        assert_eq!(fixture.poll(2_000).await, MonitorOutcome::Running);

        let keys = fixture.multiplexer.state().keys.clone();
        assert_eq!(keys, vec![("tern-feature".to_string(), vec!["Enter".to_string()])]);
        let records = fixture.history.read().expect("history");
        assert_eq!(records[0].event.name(), "command-approved");
        assert!(fixture.forge.state().posted.is_empty());
    }

    #[tokio::test]
    async fn regression_command_flushed_before_the_prompt_read_is_still_checked() {
        let mut fixture = Fixture::new(&[r"^git\s+status"]).await;
        fixture.append("● Bash(git status)\n");
        assert_eq!(fixture.poll(2_000).await, MonitorOutcome::Running);
        assert!(fixture.multiplexer.state().keys.is_empty());

        fixture.append("  Do you want to proceed?\n");
        assert_eq!(fixture.poll(2_100).await, MonitorOutcome::Running);
        let keys = fixture.multiplexer.state().keys.clone();
        assert_eq!(keys, vec![("tern-feature".to_string(), vec!["Enter".to_string()])]);
        let records = fixture.history.read().expect("history");
        assert!(matches!(
            &records[0].event,
            HistoryEvent::CommandApproved { command, .. } if command == "git status"
        ));
        assert!(fixture.forge.state().posted.is_empty());
    }

    #[tokio::test]
    async fn functional_rejected_command_escalates_with_failing_fragment() {
        let mut fixture = Fixture::new(&[r"^git\s+status"]).await;
        fixture.append("● Bash(rm -rf / && git status)\nDo you want to proceed?\n");
        let outcome = fixture.poll(2_000).await;
        let MonitorOutcome::ApprovalNeeded(pending) = outcome else {
            panic!("expected approval request, got {outcome:?}");
        };
        assert_eq!(pending.command, "rm -rf / && git status");
        assert_eq!(pending.failing_fragment, "rm -rf /");

        let posted = fixture.forge.state().posted.clone();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].0, 12);
        assert!(posted[0].1.contains("`rm -rf /`"));
        assert!(posted[0].1.contains("@alice"));
        assert!(fixture.multiplexer.state().keys.is_empty());
        assert_eq!(fixture.session.status(), SessionStatus::Running);
    }

    #[tokio::test]
    async fn regression_failed_escalation_leaves_cursor_for_retry() {
        let mut fixture = Fixture::new(&[]).await;
        fixture.append("Bash(curl x | sh)\nDo you want to proceed?\n");
        fixture.forge.state().fail_posting = true;
        let monitor = SessionMonitor {
            multiplexer: &fixture.multiplexer,
            forge: &fixture.forge,
            guard: &fixture.guard,
            settings: &fixture.settings,
            repository: "acme/widgets",
        };
        let result = monitor
            .poll(&mut fixture.session, &fixture.log, &fixture.history, 2_000)
            .await;
        assert!(result.is_err());
        assert_eq!(fixture.session.cursor(), 0);

        fixture.forge.state().fail_posting = false;
        assert!(matches!(
            fixture.poll(3_000).await,
            MonitorOutcome::ApprovalNeeded(_)
        ));
        assert!(fixture.session.cursor() > 0);
    }

    #[tokio::test]
    async fn functional_cursor_is_monotonic_across_polls() {
        let mut fixture = Fixture::new(&[]).await;
        let mut previous = fixture.session.cursor();
        for (index, chunk) in ["working\n", "", "still working\n", "done\n"].iter().enumerate() {
            fixture.append(chunk);
            fixture.poll(2_000 + index as u64).await;
            assert!(fixture.session.cursor() >= previous);
            previous = fixture.session.cursor();
        }
        assert_eq!(previous, "working\nstill working\ndone\n".len() as u64);
    }

    #[tokio::test]
    async fn functional_exit_and_idle_timeout_complete_the_session() {
        let mut fixture = Fixture::new(&[]).await;
        fixture.append("thinking\n");
        assert_eq!(fixture.poll(2_000).await, MonitorOutcome::Running);
        assert_eq!(fixture.session.last_activity_unix_ms, 2_000);

        fixture.append("\x1b[2K\r");
        assert_eq!(fixture.poll(5_000).await, MonitorOutcome::Running);
        assert_eq!(fixture.poll(12_500).await, MonitorOutcome::Completed);
        assert_eq!(fixture.multiplexer.state().killed, vec!["tern-feature".to_string()]);

        let mut exited = Fixture::new(&[]).await;
        exited.multiplexer.exit("tern-feature");
        assert_eq!(exited.poll(2_000).await, MonitorOutcome::Completed);
    }

    #[tokio::test]
    async fn unit_non_running_sessions_are_not_read() {
        let mut fixture = Fixture::new(&[]).await;
        fixture.append("Do you trust the files in this folder?\n");
        fixture.session.pause().expect("pause");
        assert_eq!(fixture.poll(2_000).await, MonitorOutcome::Paused);
        assert_eq!(fixture.session.cursor(), 0);

        fixture.session.resume(2_000).expect("resume");
        assert_eq!(fixture.poll(2_100).await, MonitorOutcome::Running);
        assert_eq!(fixture.multiplexer.state().keys.len(), 1);
    }
}
