//! Command approval guard.
//!
//! Decides whether a shell command line requested by the coding agent may run
//! unattended: the line is split into independent fragments (subshells
//! included) and every fragment must match at least one whitelist pattern.

pub mod error;
pub mod guard;
pub mod split;
pub mod whitelist;

pub use error::{GuardError, SplitError};
pub use guard::{CommandGuard, GuardDecision, GuardScope};
pub use split::{split_command, SUBSHELL_MARKER};
pub use whitelist::{Whitelist, WhitelistFile};
