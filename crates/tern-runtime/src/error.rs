use thiserror::Error;

/// Outcome classes for a failed poll cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Upstream or network failure before any durable state changed.
    #[error("transient cycle failure: {0:#}")]
    Transient(anyhow::Error),
    /// Anything that may leave durable state inconsistent. Stops the loop.
    #[error("fatal cycle failure: {0:#}")]
    Fatal(anyhow::Error),
}

impl CycleError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            Self::Transient(error) | Self::Fatal(error) => error,
        }
    }
}

pub(crate) trait CycleResultExt<T> {
    fn transient(self) -> Result<T, CycleError>;
    fn fatal(self) -> Result<T, CycleError>;
}

impl<T> CycleResultExt<T> for anyhow::Result<T> {
    fn transient(self) -> Result<T, CycleError> {
        self.map_err(CycleError::Transient)
    }

    fn fatal(self) -> Result<T, CycleError> {
        self.map_err(CycleError::Fatal)
    }
}
