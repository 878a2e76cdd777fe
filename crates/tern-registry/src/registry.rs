//! Per-repository registry persisted as whole-file JSON records under
//! `<state_dir>/<owner>__<repo>/`.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tern_core::{sanitize_for_path, write_json_atomic};
use tracing::warn;

use crate::{HistoryEvent, HistoryLog, HistoryRecord, SeenEventSet, Session};

pub const REGISTRY_SCHEMA_VERSION: u32 = 1;

const SESSIONS_FILE: &str = "sessions.json";
const SEEN_FILE: &str = "seen.json";
const RESUMABLE_FILE: &str = "resumable.json";
const ISSUE_LINKS_FILE: &str = "issue_links.json";
const TRACKED_PRS_FILE: &str = "tracked_prs.json";
const HISTORY_DIR: &str = "history";

/// The pull request opened to resolve an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLink {
    pub pr_number: u64,
    pub branch: String,
}

trait Versioned {
    fn schema_version(&self) -> u32;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionsRecord {
    schema_version: u32,
    #[serde(default)]
    sessions: BTreeMap<String, Session>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeenRecord {
    schema_version: u32,
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResumableRecord {
    schema_version: u32,
    #[serde(default)]
    branches: BTreeSet<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IssueLinksRecord {
    schema_version: u32,
    #[serde(default)]
    links: BTreeMap<u64, IssueLink>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackedPrsRecord {
    schema_version: u32,
    #[serde(default)]
    pull_requests: BTreeMap<String, u64>,
}

macro_rules! versioned_default {
    ($($record:ident { $($field:ident),* }),* $(,)?) => {
        $(
            impl Versioned for $record {
                fn schema_version(&self) -> u32 {
                    self.schema_version
                }
            }

            impl Default for $record {
                fn default() -> Self {
                    Self {
                        schema_version: REGISTRY_SCHEMA_VERSION,
                        $($field: Default::default()),*
                    }
                }
            }
        )*
    };
}

versioned_default!(
    SessionsRecord { sessions },
    SeenRecord { keys },
    ResumableRecord { branches },
    IssueLinksRecord { links },
    TrackedPrsRecord { pull_requests },
);

/// Loads one record. Unreadable files are errors; unparseable files or a
/// schema mismatch start fresh with a warning.
fn load_record<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default + Versioned,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read registry file {}", path.display()))?;
    let record = match serde_json::from_str::<T>(&raw) {
        Ok(record) => record,
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to parse registry file (starting fresh)");
            return Ok(T::default());
        }
    };
    if record.schema_version() != REGISTRY_SCHEMA_VERSION {
        warn!(
            path = %path.display(),
            expected = REGISTRY_SCHEMA_VERSION,
            found = record.schema_version(),
            "unsupported registry schema (starting fresh)"
        );
        return Ok(T::default());
    }
    Ok(record)
}

#[derive(Debug)]
pub struct SessionRegistry {
    dir: PathBuf,
    sessions: BTreeMap<String, Session>,
    seen: SeenEventSet,
    resumable: BTreeSet<String>,
    issue_links: BTreeMap<u64, IssueLink>,
    tracked_prs: BTreeMap<String, u64>,
}

impl SessionRegistry {
    pub fn load(dir: impl Into<PathBuf>, seen_cap: usize) -> Result<Self> {
        let dir = dir.into();
        let mut sessions = load_record::<SessionsRecord>(&dir.join(SESSIONS_FILE))?.sessions;
        sessions.retain(|branch, session| match session.check_invariants() {
            Ok(()) if *branch == session.branch => true,
            Ok(()) => {
                warn!(%branch, stored = %session.branch, "dropping session stored under the wrong branch");
                false
            }
            Err(error) => {
                warn!(%branch, %error, "dropping session that violates state invariants");
                false
            }
        });
        let seen = SeenEventSet::from_keys(
            load_record::<SeenRecord>(&dir.join(SEEN_FILE))?.keys,
            seen_cap,
        );
        let resumable = load_record::<ResumableRecord>(&dir.join(RESUMABLE_FILE))?.branches;
        let issue_links = load_record::<IssueLinksRecord>(&dir.join(ISSUE_LINKS_FILE))?.links;
        let tracked_prs =
            load_record::<TrackedPrsRecord>(&dir.join(TRACKED_PRS_FILE))?.pull_requests;
        Ok(Self {
            dir,
            sessions,
            seen,
            resumable,
            issue_links,
            tracked_prs,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes every record. Sessions go first so a crash between writes leaves
    /// incorporated keys recoverable from the session event-ID sets.
    pub fn save(&self) -> Result<()> {
        self.save_sessions()?;
        self.save_seen()?;
        write_json_atomic(
            &self.dir.join(RESUMABLE_FILE),
            &ResumableRecord {
                schema_version: REGISTRY_SCHEMA_VERSION,
                branches: self.resumable.clone(),
            },
        )?;
        write_json_atomic(
            &self.dir.join(ISSUE_LINKS_FILE),
            &IssueLinksRecord {
                schema_version: REGISTRY_SCHEMA_VERSION,
                links: self.issue_links.clone(),
            },
        )?;
        write_json_atomic(
            &self.dir.join(TRACKED_PRS_FILE),
            &TrackedPrsRecord {
                schema_version: REGISTRY_SCHEMA_VERSION,
                pull_requests: self.tracked_prs.clone(),
            },
        )?;
        Ok(())
    }

    pub fn save_sessions(&self) -> Result<()> {
        write_json_atomic(
            &self.dir.join(SESSIONS_FILE),
            &SessionsRecord {
                schema_version: REGISTRY_SCHEMA_VERSION,
                sessions: self.sessions.clone(),
            },
        )
    }

    pub fn save_seen(&self) -> Result<()> {
        write_json_atomic(
            &self.dir.join(SEEN_FILE),
            &SeenRecord {
                schema_version: REGISTRY_SCHEMA_VERSION,
                keys: self.seen.keys(),
            },
        )
    }

    pub fn session(&self, branch: &str) -> Option<&Session> {
        self.sessions.get(branch)
    }

    pub fn session_mut(&mut self, branch: &str) -> Option<&mut Session> {
        self.sessions.get_mut(branch)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn branches(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Registers a new session. At most one session may exist per branch.
    pub fn insert_session(&mut self, session: Session) -> Result<()> {
        if self.sessions.contains_key(&session.branch) {
            bail!("a session for branch '{}' already exists", session.branch);
        }
        session.check_invariants()?;
        self.sessions.insert(session.branch.clone(), session);
        Ok(())
    }

    pub fn remove_session(&mut self, branch: &str) -> Option<Session> {
        self.sessions.remove(branch)
    }

    /// Branch of the live session that already incorporated `event_key`.
    pub fn session_incorporating(&self, event_key: &str) -> Option<&str> {
        self.sessions
            .values()
            .find(|session| session.contains_event(event_key))
            .map(|session| session.branch.as_str())
    }

    pub fn is_seen(&self, event_key: &str) -> bool {
        self.seen.contains(event_key)
    }

    pub fn mark_seen(&mut self, event_key: &str) -> bool {
        self.seen.mark(event_key)
    }

    pub fn unmark_seen(&mut self, event_key: &str) -> bool {
        self.seen.unmark(event_key)
    }

    pub fn seen(&self) -> &SeenEventSet {
        &self.seen
    }

    pub fn is_resumable(&self, branch: &str) -> bool {
        self.resumable.contains(branch)
    }

    pub fn set_resumable(&mut self, branch: &str, resumable: bool) {
        if resumable {
            self.resumable.insert(branch.to_string());
        } else {
            self.resumable.remove(branch);
        }
    }

    pub fn resumable_branches(&self) -> impl Iterator<Item = &str> {
        self.resumable.iter().map(String::as_str)
    }

    pub fn link_issue(&mut self, issue_number: u64, link: IssueLink) {
        self.issue_links.insert(issue_number, link);
    }

    pub fn issue_link(&self, issue_number: u64) -> Option<&IssueLink> {
        self.issue_links.get(&issue_number)
    }

    pub fn unlink_branch_issues(&mut self, branch: &str) {
        self.issue_links.retain(|_, link| link.branch != branch);
    }

    pub fn track_pull_request(&mut self, branch: &str, pr_number: u64) {
        self.tracked_prs.insert(branch.to_string(), pr_number);
    }

    pub fn tracked_pull_request(&self, branch: &str) -> Option<u64> {
        self.tracked_prs.get(branch).copied()
    }

    pub fn tracked_pull_requests(&self) -> Vec<(String, u64)> {
        self.tracked_prs
            .iter()
            .map(|(branch, number)| (branch.clone(), *number))
            .collect()
    }

    pub fn untrack_pull_request(&mut self, branch: &str) -> Option<u64> {
        self.tracked_prs.remove(branch)
    }

    pub fn history(&self, branch: &str) -> HistoryLog {
        HistoryLog::new(
            self.dir
                .join(HISTORY_DIR)
                .join(format!("{}.jsonl", sanitize_for_path(branch))),
        )
    }

    pub fn record(&self, branch: &str, event: HistoryEvent) -> Result<HistoryRecord> {
        self.history(branch).append(branch, event)
    }

    /// Event IDs of the branch's live session, or of its most recently
    /// finished session according to history.
    pub fn last_session_event_ids(&self, branch: &str) -> Result<Vec<String>> {
        if let Some(session) = self.sessions.get(branch) {
            return Ok(session.event_ids().to_vec());
        }
        let records = self.history(branch).read()?;
        Ok(records
            .into_iter()
            .rev()
            .find_map(|record| match record.event {
                HistoryEvent::SessionCompleted { event_ids, .. }
                | HistoryEvent::SessionFailed { event_ids, .. } => Some(event_ids),
                _ => None,
            })
            .unwrap_or_default())
    }
}
