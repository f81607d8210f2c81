//! Error taxonomy for session actions
//!
//! Every rejection is returned synchronously to the caller and never partially
//! applied. [`ErrorKind`] is the stable code that travels over the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collab::CollaboratorError;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Stable, client-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    RoleConflict,
    InvalidTransition,
    Forbidden,
    NotFound,
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// Whether a client may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Errors raised while validating or applying a session action.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed or out-of-range input, rejected before any state change.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested role is held by another active participant.
    #[error("role {role} is already held in session {code}")]
    RoleConflict { code: String, role: String },

    /// The action is not legal in the session's current phase or status.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The caller's role does not permit the action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unknown session code or participant.
    #[error("not found: {0}")]
    NotFound(String),

    /// A collaborator (case lookup, feedback, identity) is unavailable.
    #[error("collaborator unavailable: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// The mutation could not be made durable; nothing was applied.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SessionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Get the wire code for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::RoleConflict { .. } => ErrorKind::RoleConflict,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Collaborator(e) if e.is_not_found() => ErrorKind::NotFound,
            Self::Collaborator(_) => ErrorKind::Unavailable,
            Self::Storage(_) => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
