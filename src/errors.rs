use crate::store::DbError;
use crate::types::UserId;
use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error as ThisError;

/// Entity kinds a [`Error::NotFound`] can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Prediction,
    User,
    Model,
    Transaction,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resource::Prediction => "prediction",
            Resource::User => "user",
            Resource::Model => "model",
            Resource::Transaction => "transaction",
        };
        write!(f, "{s}")
    }
}

#[derive(ThisError, Debug)]
pub enum Error {
    /// Requested entity does not exist
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: Resource, id: String },

    /// A strict debit asked for more than the balance holds
    #[error("user {user_id} has {balance} available, {requested} requested")]
    InsufficientFunds {
        user_id: UserId,
        requested: Decimal,
        balance: Decimal,
    },

    /// The prediction backend faulted. `permanent` marks faults that will
    /// not succeed on redelivery (malformed input, rejected request).
    #[error("predictor failure: {message}")]
    Predictor { message: String, permanent: bool },

    /// Storage operation error
    #[error(transparent)]
    Persistence(#[from] DbError),

    /// The optimistic balance write lost every attempt it was given
    #[error("balance update for user {user_id} conflicted {attempts} times")]
    Conflict { user_id: UserId, attempts: u32 },
}

impl Error {
    /// Whether redelivering the job can change the outcome. Drives the
    /// queue layer's retry-or-abandon decision; classification is by
    /// variant, never by message text.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Predictor { permanent, .. } => !permanent,
            Error::Persistence(_) | Error::Conflict { .. } => true,
            Error::NotFound { .. } | Error::InsufficientFunds { .. } => false,
        }
    }
}

/// Type alias for pipeline operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn retry_classification() {
        let transient = Error::Predictor {
            message: "connection reset".to_string(),
            permanent: false,
        };
        let permanent = Error::Predictor {
            message: "input rejected".to_string(),
            permanent: true,
        };
        let not_found = Error::NotFound {
            resource: Resource::Prediction,
            id: "17".to_string(),
        };
        let broke = Error::InsufficientFunds {
            user_id: Uuid::new_v4(),
            requested: Decimal::ONE,
            balance: Decimal::ZERO,
        };

        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!not_found.is_retryable());
        assert!(!broke.is_retryable());
        assert!(Error::Persistence(DbError::VersionConflict).is_retryable());
        assert!(
            Error::Conflict {
                user_id: Uuid::new_v4(),
                attempts: 5
            }
            .is_retryable()
        );
    }
}
