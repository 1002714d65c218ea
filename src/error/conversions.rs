//! Type Conversions for ComposeError
//!
//! From implementations for the runtime errors that surface while driving
//! stages.

use super::types::ComposeError;

impl From<tokio::task::JoinError> for ComposeError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Destroyed
        } else {
            Self::Internal(err.to_string())
        }
    }
}

// A dropped continuation means the other side was torn down.
impl From<tokio::sync::oneshot::error::RecvError> for ComposeError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Destroyed
    }
}
