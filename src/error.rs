//! Error types for Tierguard.

use thiserror::Error;

/// Main error type for Tierguard operations.
#[derive(Error, Debug)]
pub enum TierguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No rulebook tier covers the current count for this event type
    #[error("No rulebook tier for category {category} event type {event_type}")]
    ConfigurationMissing { category: String, event_type: u32 },

    /// A check or commit specification could not be resolved
    #[error("Invalid specification: {0}")]
    InvalidSpec(String),

    /// The persistence backend could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Compare-and-swap kept losing against concurrent writers
    #[error("Store contention on {key} after {attempts} attempts")]
    StoreContention { key: String, attempts: u32 },

    /// One event of a multi-event commit failed; later events were not recorded
    #[error("Commit of {event} failed: {source}")]
    CommitFailed {
        event: String,
        #[source]
        source: Box<TierguardError>,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TierguardError {
    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            TierguardError::Config(_) => "config",
            TierguardError::ConfigurationMissing { .. } => "configuration_missing",
            TierguardError::InvalidSpec(_) => "invalid_spec",
            TierguardError::StoreUnavailable(_) => "store_unavailable",
            TierguardError::StoreContention { .. } => "store_contention",
            TierguardError::CommitFailed { source, .. } => source.code(),
            TierguardError::Io(_) => "io",
        }
    }
}

/// Result type alias for Tierguard operations.
pub type Result<T> = std::result::Result<T, TierguardError>;
