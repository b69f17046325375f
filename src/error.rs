use std::path::PathBuf;

use crate::clients::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("invalid link descriptor '{descriptor}': {reason}")]
    InvalidLink { descriptor: String, reason: String },

    #[error("invalid ledger key '{key}': {reason}")]
    InvalidLedgerKey { key: String, reason: String },

    #[error("invalid permission set id '{id}': expected <prefix>/<instance>/<permission-set>")]
    InvalidPermissionSetId { id: String },

    #[error("external api error: {0}")]
    Api(#[from] ApiError),

    #[error("assignment operation {operation_id} failed: {reason}")]
    OperationFailed { operation_id: String, reason: String },

    #[error("assignment operation {operation_id} not terminal after {waited_secs}s")]
    CompletionTimeout {
        operation_id: String,
        waited_secs: u64,
    },

    #[error("resolution timed out after {timeout_secs}s in {stage}")]
    ResolutionTimeout { stage: String, timeout_secs: u64 },

    #[error("no assignment instance available")]
    NoInstance,

    #[error("storage error: {reason}")]
    Storage { reason: String },

    #[error("config parse error in {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("malformed event at {path}:{line}: {reason}")]
    EventParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("stage channel closed: {stage}")]
    ChannelClosed { stage: String },

    #[error("notification error: {reason}")]
    Notification { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReconcileError {
    /// Whether redelivering the message that produced this error can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Api(e) => e.is_retryable(),
            ReconcileError::ResolutionTimeout { .. }
            | ReconcileError::ChannelClosed { .. }
            | ReconcileError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
