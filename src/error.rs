//! Error taxonomy shared by the store, the derivation engine and the
//! remote sync layer.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Same message id submitted under two folders within one logical write.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("message '{id}' appears in both '{first_folder}' and '{second_folder}' within one batch")]
pub struct ConflictError {
    pub id: String,
    pub first_folder: String,
    pub second_folder: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(#[from] redb::Error),

    #[error("row codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store file {0} is corrupt")]
    Corrupt(String),
}

macro_rules! redb_into_store_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(e: $ty) -> Self {
                    StoreError::Backend(e.into())
                }
            }
        )*
    };
}

redb_into_store_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Another holder's lease is live. Callers back off and retry.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("lease held by '{holder}' until {expires_at}")]
pub struct LeaseContentionError {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("precondition failed for '{0}'")]
    PreconditionFailed(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("credentials: {0}")]
    Auth(String),

    #[error("invalid object name '{0}'")]
    InvalidKey(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote transfer failed: {0}")]
    Transfer(#[from] BlobError),

    #[error(transparent)]
    Contention(#[from] LeaseContentionError),

    #[error("lease lost: {0}")]
    LeaseLost(String),

    #[error("remote snapshot unreadable: {0}")]
    Corrupt(String),

    #[error("local store: {0}")]
    Store(#[from] StoreError),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl SyncError {
    pub fn is_contention(&self) -> bool {
        matches!(self, SyncError::Contention(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("rule {index}: unknown field '{field}' (expected subject, from, to, body)")]
    UnknownField { index: usize, field: String },

    #[error("rule {index}: unknown operator '{operator}' (expected contains, equals, startswith, endswith)")]
    UnknownOperator { index: usize, operator: String },

    #[error("rule {index}: empty value")]
    EmptyValue { index: usize },

    #[error("smart folder needs at least one rule")]
    NoRules,
}

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    #[error("classifier returned an unusable answer: {0}")]
    InvalidResponse(String),
}

/// Errors surfaced to the tool-dispatch layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid smart folder rules: {}", format_rule_errors(.0))]
    Rules(Vec<RuleError>),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

fn format_rule_errors(errors: &[RuleError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
