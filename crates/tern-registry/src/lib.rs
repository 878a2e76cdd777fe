//! Durable per-repository controller state.
//!
//! Owns the branch session map and its state machine, the seen-event set,
//! resumability flags, issue to pull-request links, tracked pull requests,
//! and the append-only per-branch history log.

pub mod history;
pub mod registry;
pub mod seen;
pub mod session;

pub use history::{ApprovalMode, HistoryEvent, HistoryLog, HistoryRecord};
pub use registry::{IssueLink, SessionRegistry, REGISTRY_SCHEMA_VERSION};
pub use seen::SeenEventSet;
pub use session::{
    PendingApproval, PendingClarification, Session, SessionStatus, SessionTarget,
    TransitionError, TriggerKind, TriggerMessage,
};
