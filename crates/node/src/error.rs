use std::fmt::Display;

use sonic_evm::ExecutionError;
use sonic_kvdb::{ErrlockError, StoreError};

/// A permanent error. The node stops, and unless the data directory was
/// already locked, writes the `errlock` file with [`Fatal::report`].
#[derive(Debug, thiserror::Error)]
pub enum Fatal {
    /// Persisted data contradicts itself, e.g. the state database and the
    /// chain disagree on the state root.
    #[error("structural inconsistency: {0}")]
    Structural(String),
    #[error("storage failure")]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Locked(#[from] ErrlockError),
}

impl Fatal {
    pub fn structural(message: impl Display) -> Self {
        Self::Structural(message.to_string())
    }

    /// Whether this error must be recorded in a fresh `errlock` file.
    pub const fn writes_errlock(&self) -> bool {
        !matches!(self, Self::Locked(_))
    }

    /// The error and all its sources on one line.
    pub fn report(&self) -> String {
        let mut report = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(error) = source {
            report.push_str(": ");
            report.push_str(&error.to_string());
            source = error.source();
        }
        report
    }
}

impl From<ExecutionError> for Fatal {
    fn from(error: ExecutionError) -> Self {
        match error {
            ExecutionError::Storage(error) => Self::Storage(error),
            other => Self::structural(other),
        }
    }
}
