use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::CanonicalizationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::DatabaseError(format!("Migration error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::ObjectStoreError(format!("I/O error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    /// The event could not be turned into canonical bytes; the producer must fix it.
    #[error("Canonicalization error: {0}")]
    CanonicalizationError(String),

    #[error("Signer unavailable: {0}")]
    SignerUnavailable(String),

    #[error("Signer rejected request: {0}")]
    SignerRejected(String),

    /// Lost the race for the chain tail or waited on it too long.
    #[error("Chain contention timeout: {0}")]
    ChainContentionTimeout(String),

    #[error("Duplicate event id with different content: {0}")]
    DuplicateEventId(String),

    #[error("Tamper detected for event {event_id}: {detail}")]
    TamperDetected { event_id: String, detail: String },

    #[error("Orphaned batch manifest: {0}")]
    OrphanedBatchManifest(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Object storage error: {0}")]
    ObjectStoreError(String),

    /// A write-once put found the key already taken.
    #[error("Object already exists: {0}")]
    ObjectAlreadyExists(String),

    #[error("Object storage unreachable: {0}")]
    ObjectStoreUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),
}

impl LedgerError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SignerUnavailable(_)
                | Self::ChainContentionTimeout(_)
                | Self::ObjectStoreUnavailable(_)
        )
    }

    pub fn tamper(event_id: &str, detail: impl Into<String>) -> Self {
        Self::TamperDetected {
            event_id: event_id.to_string(),
            detail: detail.into(),
        }
    }

    pub fn canonicalization(msg: impl Into<String>) -> Self {
        Self::CanonicalizationError(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
