use thiserror::Error;

use std::time::SystemTime;

/// Error taxonomy of the apply path and its collaborators.
///
/// Module-local errors (fetch, store, kernel) convert into these variants
/// at the point where they surface to a caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration field `{field}`: {reason}")]
    ConfigInvalid { field: String, reason: String },
    #[error("compilation failed in {stage}: {detail}")]
    Compile { stage: &'static str, detail: String },
    #[error("ruleset validation rejected script: {snippet}")]
    Validate { snippet: String },
    #[error("ruleset apply failed: {detail}")]
    Apply { detail: String },
    #[error("kernel ruleset backend unavailable")]
    KernelUnavailable,
    #[error("fetching `{url}` failed: {cause}")]
    NetworkFetch { url: String, cause: String },
    #[error("cached list failed integrity check")]
    CacheIntegrity,
    #[error("sandbox setup failed at step `{step}`")]
    Sandbox { step: String },
    #[error("another instance already holds the lock")]
    LockHeld,
    #[error("operation `{operation}` timed out")]
    Timeout { operation: String },
    #[error("subsystem not initialized")]
    NotInitialized,
    #[error("another apply is already pending confirmation")]
    AlreadyPending,
    #[error("no pending apply with the given id")]
    PendingNotFound,
    /// Informational: the live ruleset diverged from the expected generation.
    #[error("live ruleset drifted from the expected generation")]
    IntegrityDrift,
    #[error("state store error: {0}")]
    Store(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

impl Error {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Structured result of `apply` and `safe_apply`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApplyOutcome {
    pub success: bool,
    pub pending_id: Option<uuid::Uuid>,
    pub message: String,
    pub rollback_time: Option<SystemTime>,
    pub backup_version: Option<u64>,
}

impl ApplyOutcome {
    pub fn applied(message: impl Into<String>) -> Self {
        ApplyOutcome {
            success: true,
            pending_id: None,
            message: message.into(),
            rollback_time: None,
            backup_version: None,
        }
    }
}
