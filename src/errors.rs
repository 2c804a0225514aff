//! Error taxonomy shared across the crate.
//!
//! Every failure surfaced to a caller carries one of these kinds; callers
//! match on the variant rather than inspecting message strings.

use crate::storage::StorageError;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the placement, commission, ledger, and activation
/// services.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed or missing input. No side effects occurred.
    #[error("validation: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request is well-formed but current state forbids it: cap full,
    /// already placed, deadline passed, double verification.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Authentication, OTP, or lockout failure.
    #[error("authorization: {0}")]
    Authorization(String),

    /// An external collaborator is unreachable or misbehaving.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// An external collaborator returned an error response.
    #[error("api error: {0}")]
    Api(String),

    /// Underlying storage failure.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl CoreError {
    /// Lift storage-level outcomes that have a taxonomy meaning into the
    /// matching variant, leaving genuine I/O failures wrapped.
    pub fn from_storage(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { ref what, ref key } => {
                CoreError::NotFound(format!("{what} {key}"))
            }
            StorageError::CapExceeded { parent } => {
                CoreError::Conflict(format!("parent {parent} has no free slot"))
            }
            StorageError::StatusConflict { ref message } => CoreError::Conflict(message.clone()),
            StorageError::InsufficientFunds { owner } => {
                CoreError::Conflict(format!("insufficient balance for {owner}"))
            }
            other => CoreError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn storage_cap_exceeded_maps_to_conflict() {
        let parent = Uuid::new_v4();
        let err = CoreError::from_storage(StorageError::CapExceeded { parent });
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn storage_not_found_maps_to_not_found() {
        let err = CoreError::from_storage(StorageError::NotFound {
            what: "member",
            key: "abc".to_string(),
        });
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
