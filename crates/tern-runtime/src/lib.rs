//! Controller runtime: layered configuration, the tmux and git substrates,
//! the session monitor and the per-repository reconciliation scheduler.

pub mod bootstrap;
pub mod config;
pub mod control;
pub mod error;
pub mod monitor;
pub mod multiplexer;
pub mod output;
pub mod paths;
pub mod scheduler;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use bootstrap::{connect_poller, tmux_session_name};
pub use config::{load_layered, write_config, TernConfig};
pub use control::{ControlOp, ControlRequest};
pub use error::CycleError;
pub use monitor::{MonitorOutcome, MonitorSettings, SessionMonitor};
pub use multiplexer::{Multiplexer, TmuxMultiplexer, WindowSpec};
pub use paths::{window_name, RepositoryPaths, TernPaths};
pub use scheduler::{PollCycleReport, Poller, PollerHandle, PollerParts};
pub use workspace::{GitWorkspace, Workspace};
