//! Error types for the reconciliation core
//!
//! Per-operation failures are folded into the pass result by the lifecycle
//! manager; only `Persistence` (and cleanup failures) reach the scheduler.

/// Main controller error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Target object absent; tolerated by most callers
    #[error("{0}")]
    NotFound(String),

    /// Scoped client could not be built for the resolved identity
    #[error("failed to create intruder client: {0}")]
    ClientConstruction(#[source] kube::Error),

    /// Verb outside the supported vocabulary
    #[error("unsupported verb: {0}")]
    UnsupportedVerb(String),

    /// Kind that has no pod spec to execute in
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),

    /// Label selector matched nothing
    #[error("no {kind} matches the selector in namespace {namespace}")]
    NoMatchingTarget {
        /// Kind that was listed
        kind: String,
        /// Namespace that was searched
        namespace: String,
    },

    /// Remote command failed or the stream broke
    #[error("remote execution failed: {message}, stderr: {stderr}")]
    RemoteExecution {
        /// Failure reported by the server or transport
        message: String,
        /// Captured stderr
        stderr: String,
    },

    /// Finalizer or status write failed
    #[error("failed to persist event: {0}")]
    Persistence(#[source] kube::Error),

    /// Operation document is malformed
    #[error("invalid resource document: {0}")]
    InvalidDocument(String),

    /// Any other cluster API failure
    #[error("api error: {0}")]
    Api(#[source] kube::Error),

    /// JSON encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stream exceeded its time bound
    #[error("operation timed out after {duration_secs}s")]
    Timeout {
        /// Bound that was exceeded
        duration_secs: u64,
    },

    /// Cleanup of a created object failed
    #[error("failed to delete resource {id}: {source}")]
    Cleanup {
        /// Operation whose reversal failed
        id: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for controller operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Classify a cluster API error; 404 becomes `NotFound` with the server's message
    #[must_use]
    pub fn from_kube(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(ae.message),
            other => Self::Api(other),
        }
    }

    /// Check if the target object was absent
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if re-running the pass may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(_) | Self::Persistence(_) | Self::Timeout { .. } => true,
            Self::Cleanup { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Short machine-readable label for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ClientConstruction(_) => "client_construction",
            Self::UnsupportedVerb(_) => "unsupported_verb",
            Self::UnsupportedKind(_) => "unsupported_kind",
            Self::NoMatchingTarget { .. } => "no_matching_target",
            Self::RemoteExecution { .. } => "remote_execution",
            Self::Persistence(_) => "persistence",
            Self::InvalidDocument(_) => "invalid_document",
            Self::Api(_) => "api",
            Self::Serialization(_) => "serialization",
            Self::Timeout { .. } => "timeout",
            Self::Cleanup { .. } => "cleanup",
            Self::Config(_) => "config",
        }
    }
}

impl From<mallory_crd::UnknownVerb> for Error {
    fn from(value: mallory_crd::UnknownVerb) -> Self {
        Self::UnsupportedVerb(value.0)
    }
}
