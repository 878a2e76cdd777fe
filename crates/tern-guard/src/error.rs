use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid whitelist pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to read whitelist {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse whitelist {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write whitelist {path}: {message}")]
    Write { path: PathBuf, message: String },
    #[error("whitelist pattern must be non-empty")]
    EmptyPattern,
    #[error("repository '{0}' has no whitelist registered")]
    UnknownRepository(String),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("unterminated {quote} quote")]
    UnterminatedQuote { quote: char },
    #[error("unterminated subshell")]
    UnterminatedSubshell,
}
