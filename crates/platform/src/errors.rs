use std::time::Duration;

/// Typed failure kinds surfaced by the platform.
///
/// External failures (docker daemon, store I/O, builder) are carried as
/// `anyhow` sources so callers can still walk the original chain.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PlatformError {
    /// Malformed input. No state was mutated.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The addressed record does not exist.
    #[error("Resource not found")]
    NotFound,

    /// An upsert lost a race for the same identity. Retryable.
    #[error("Conflicting update for {namespace}/{name}: {reason}")]
    Conflict {
        namespace: String,
        name: String,
        reason: String,
    },

    /// The external builder signalled an error. The function record was
    /// moved to the error state before this was returned.
    #[error("Function build failed")]
    BuildFailed {
        #[source]
        source: anyhow::Error,
    },

    /// Container run or readiness failure. The function record was moved to
    /// the error state; the failing container is left in place so operators
    /// can inspect it.
    #[error("Function deploy failed: {message}")]
    DeployFailed {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// Runtime or store failure not attributable to user input.
    #[error("Runtime failure")]
    Runtime {
        #[source]
        source: anyhow::Error,
    },

    /// A generic wait exceeded its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl PlatformError {
    pub fn runtime(source: anyhow::Error) -> Self {
        Self::Runtime { source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Failed operations that callers may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Timeout(_))
    }
}
