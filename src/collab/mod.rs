//! External collaborators - identity, case content, feedback
//!
//! The engine only depends on these traits. The in-memory implementations in
//! [`memory`] back the bundled server and the test suite.

mod memory;

pub use memory::{FeedbackEntry, InMemoryCatalog, InMemoryFeedback, StaticIdentity};

use crate::session::{CaseRef, SessionId, UserId};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Failures reported by a collaborator.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl CollaboratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// What the case collaborator should pick from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseSelection {
    /// Random case from any of these topics
    Topics(Vec<String>),
    /// Random case from a recall date
    Recall(NaiveDate),
    /// A specific case chosen by the host
    Specific(CaseRef),
}

/// Acknowledgement returned once feedback is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackAck {
    pub feedback_id: String,
}

/// Resolves a credential token to a stable user identity.
///
/// Called once per inbound connection by the server boundary.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_identity(&self, token: &str) -> Result<UserId, CollaboratorError>;
}

/// Case content lookup.
#[async_trait]
pub trait CaseCatalog: Send + Sync {
    /// Pick a case matching `selection`, never returning one listed in `exclude`
    /// for random selections.
    async fn fetch_or_assign_case(
        &self,
        selection: &CaseSelection,
        exclude: &[CaseRef],
    ) -> Result<CaseRef, CollaboratorError>;
}

/// Feedback persistence.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn record_feedback(
        &self,
        session_id: SessionId,
        from: &UserId,
        to: &UserId,
        payload: &serde_json::Value,
    ) -> Result<FeedbackAck, CollaboratorError>;
}

/// Collaborators the session engine calls while applying actions.
#[derive(Clone)]
pub struct Collaborators {
    pub cases: Arc<dyn CaseCatalog>,
    pub feedback: Arc<dyn FeedbackSink>,
}

impl Collaborators {
    pub fn new(cases: Arc<dyn CaseCatalog>, feedback: Arc<dyn FeedbackSink>) -> Self {
        Self { cases, feedback }
    }
}
