//! Prompt Builder: renders operator requests into agent instructions and
//! parses the directive lines the agent writes back.

pub mod directives;
pub mod templates;

pub use directives::{default_commit_message, parse_directives, AgentDirectives};
pub use templates::{PromptBuilder, TaskContext, REPLY_FILE};
