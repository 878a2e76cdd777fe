//! Operator requests handed from the CLI to a running scheduler.
//!
//! The CLI never mutates the session registry directly. It drops one JSON file
//! per request into `<repo_state>/control/`; the scheduler drains the inbox at
//! the start of every cycle, so the registry keeps a single writer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tern_core::{current_rfc3339, current_unix_timestamp_ms, sanitize_for_path, write_json_atomic};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    Pause,
    Resume,
    /// Kill the window and drop the session; history is kept.
    Stop,
    /// Clear the resumability flag so the next trigger starts fresh.
    Fresh,
    /// Un-mark the event IDs of the branch's most recent session.
    Retry,
}

impl ControlOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Fresh => "fresh",
            Self::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub op: ControlOp,
    pub branch: String,
    pub requested_at: String,
}

impl ControlRequest {
    pub fn new(op: ControlOp, branch: impl Into<String>) -> Self {
        Self {
            op,
            branch: branch.into(),
            requested_at: current_rfc3339(),
        }
    }
}

/// Writes a request into the inbox and returns its path.
pub fn enqueue(dir: &Path, request: &ControlRequest) -> Result<PathBuf> {
    let name = format!(
        "{:016}-{}-{}.json",
        current_unix_timestamp_ms(),
        request.op.as_str(),
        sanitize_for_path(&request.branch)
    );
    let path = dir.join(name);
    write_json_atomic(&path, request)?;
    Ok(path)
}

/// Reads and removes every pending request, oldest first. Unreadable files are
/// discarded with a warning.
pub fn drain(dir: &Path) -> Result<Vec<ControlRequest>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<_>>();
    paths.sort();

    let mut requests = Vec::with_capacity(paths.len());
    for path in paths {
        let parsed = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<ControlRequest>(&raw).map_err(Into::into));
        match parsed {
            Ok(request) => requests.push(request),
            Err(error) => warn!(path = %path.display(), %error, "discarding unreadable control request"),
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn functional_drain_returns_requests_in_order_and_empties_inbox() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let dir = tempdir.path().join("control");
        assert!(drain(&dir).expect("drain").is_empty());

        enqueue(&dir, &ControlRequest::new(ControlOp::Pause, "feature/x")).expect("pause");
        std::thread::sleep(std::time::Duration::from_millis(2));
        enqueue(&dir, &ControlRequest::new(ControlOp::Resume, "feature/x")).expect("resume");
        std::fs::write(dir.join("zz-garbage.json"), "{not json").expect("garbage");

        let drained = drain(&dir).expect("drain");
        let ops = drained.iter().map(|request| request.op).collect::<Vec<_>>();
        assert_eq!(ops, vec![ControlOp::Pause, ControlOp::Resume]);
        assert_eq!(drained[0].branch, "feature/x");
        assert_eq!(std::fs::read_dir(&dir).expect("dir").count(), 0);
    }
}
