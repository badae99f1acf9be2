//! Engine-wide error types.

use thiserror::Error;

/// Engine-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error type.
///
/// Provider failures are deliberately absent: adapters report them through
/// [`crate::notification::channels::ProviderError`], which the executor turns
/// into persisted row state instead of propagating.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Unsupported delivery channel: {0}")]
    InvalidChannel(String),

    #[error("Recipient {recipient_id} has no address for channel {channel}")]
    MissingRecipient {
        channel: String,
        recipient_id: String,
    },

    #[error("Delivery attempt {id} is claimed by another executor")]
    ClaimConflict { id: String },

    #[error("Scheduler sweep failed: {0}")]
    SchedulerSweep(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn missing_recipient(channel: impl Into<String>, recipient_id: impl Into<String>) -> Self {
        Self::MissingRecipient {
            channel: channel.into(),
            recipient_id: recipient_id.into(),
        }
    }

    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Whether this error is the benign loser side of a claim race.
    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, Self::ClaimConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_recipient_message() {
        let err = Error::missing_recipient("SMS", "user-1");
        assert_eq!(
            err.to_string(),
            "Recipient user-1 has no address for channel SMS"
        );
    }

    #[test]
    fn test_claim_conflict_detection() {
        let err = Error::ClaimConflict {
            id: "a".to_string(),
        };
        assert!(err.is_claim_conflict());
        assert!(!Error::validation("x").is_claim_conflict());
    }
}
