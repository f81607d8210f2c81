//! In-memory collaborator implementations

use super::{
    CaseCatalog, CaseSelection, CollaboratorError, FeedbackAck, FeedbackSink, IdentityResolver,
};
use crate::session::{CaseRef, SessionId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Token table lookup, optionally accepting any token as its own user id.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    tokens: HashMap<String, UserId>,
    allow_anonymous: bool,
}

impl StaticIdentity {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self {
            tokens,
            allow_anonymous: false,
        }
    }

    /// Development mode: unknown tokens resolve to a user with the same id.
    pub fn anonymous() -> Self {
        Self {
            tokens: HashMap::new(),
            allow_anonymous: true,
        }
    }

    pub fn with_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve_identity(&self, token: &str) -> Result<UserId, CollaboratorError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(CollaboratorError::Auth("empty token".to_string()));
        }
        if let Some(user) = self.tokens.get(token) {
            return Ok(user.clone());
        }
        if self.allow_anonymous {
            return Ok(UserId::new(token));
        }
        Err(CollaboratorError::Auth("unknown token".to_string()))
    }
}

/// Case ids grouped by topic and by recall date.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    by_topic: BTreeMap<String, Vec<CaseRef>>,
    by_date: BTreeMap<NaiveDate, Vec<CaseRef>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic<I, S>(mut self, topic: impl Into<String>, cases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by_topic
            .entry(topic.into().to_lowercase())
            .or_default()
            .extend(cases.into_iter().map(CaseRef::new));
        self
    }

    pub fn with_recall<I, S>(mut self, date: NaiveDate, cases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by_date
            .entry(date)
            .or_default()
            .extend(cases.into_iter().map(CaseRef::new));
        self
    }

    fn contains(&self, case: &CaseRef) -> bool {
        self.by_topic
            .values()
            .chain(self.by_date.values())
            .any(|cases| cases.contains(case))
    }

    fn candidates(&self, selection: &CaseSelection) -> Vec<&CaseRef> {
        match selection {
            CaseSelection::Topics(topics) => {
                let mut out: Vec<&CaseRef> = Vec::new();
                for topic in topics {
                    if let Some(cases) = self.by_topic.get(&topic.to_lowercase()) {
                        for case in cases {
                            if !out.contains(&case) {
                                out.push(case);
                            }
                        }
                    }
                }
                out
            }
            CaseSelection::Recall(date) => self
                .by_date
                .get(date)
                .map(|cases| cases.iter().collect())
                .unwrap_or_default(),
            // resolved directly in fetch_or_assign_case
            CaseSelection::Specific(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl CaseCatalog for InMemoryCatalog {
    async fn fetch_or_assign_case(
        &self,
        selection: &CaseSelection,
        exclude: &[CaseRef],
    ) -> Result<CaseRef, CollaboratorError> {
        if let CaseSelection::Specific(case) = selection {
            return if self.contains(case) {
                Ok(case.clone())
            } else {
                Err(CollaboratorError::NotFound(format!("case '{}'", case)))
            };
        }

        let pool: Vec<&CaseRef> = self
            .candidates(selection)
            .into_iter()
            .filter(|c| !exclude.contains(c))
            .collect();

        if pool.is_empty() {
            return Err(CollaboratorError::NotFound(
                "case matching selection".to_string(),
            ));
        }

        let index = (Uuid::new_v4().as_u128() % pool.len() as u128) as usize;
        Ok(pool[index].clone())
    }
}

/// A stored feedback submission.
#[derive(Debug, Clone)]
pub struct FeedbackEntry {
    pub id: String,
    pub session_id: SessionId,
    pub from: UserId,
    pub to: UserId,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Keeps feedback submissions in memory.
#[derive(Debug, Default)]
pub struct InMemoryFeedback {
    entries: Mutex<Vec<FeedbackEntry>>,
}

impl InMemoryFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// All submissions recorded for a session, oldest first.
    pub async fn for_session(&self, session_id: SessionId) -> Vec<FeedbackEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FeedbackSink for InMemoryFeedback {
    async fn record_feedback(
        &self,
        session_id: SessionId,
        from: &UserId,
        to: &UserId,
        payload: &serde_json::Value,
    ) -> Result<FeedbackAck, CollaboratorError> {
        let id = Uuid::new_v4().to_string();
        self.entries.lock().await.push(FeedbackEntry {
            id: id.clone(),
            session_id,
            from: from.clone(),
            to: to.clone(),
            payload: payload.clone(),
            recorded_at: Utc::now(),
        });
        tracing::debug!(session_id = %session_id, from = %from, to = %to, "Feedback recorded");
        Ok(FeedbackAck { feedback_id: id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::new()
            .with_topic("Cardiology", ["chest-pain", "palpitations"])
            .with_topic("respiratory", ["asthma", "chest-pain"])
            .with_recall(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), ["recall-1"])
    }

    #[tokio::test]
    async fn test_random_pick_respects_exclusions() {
        let catalog = catalog();
        let selection = CaseSelection::Topics(vec!["cardiology".into()]);
        let exclude = vec![CaseRef::new("chest-pain")];

        for _ in 0..20 {
            let case = catalog
                .fetch_or_assign_case(&selection, &exclude)
                .await
                .unwrap();
            assert_eq!(case.as_str(), "palpitations");
        }
    }

    #[tokio::test]
    async fn test_exhausted_selection_is_not_found() {
        let catalog = catalog();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let err = catalog
            .fetch_or_assign_case(&CaseSelection::Recall(date), &[CaseRef::new("recall-1")])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_specific_case_must_exist() {
        let catalog = catalog();
        let ok = catalog
            .fetch_or_assign_case(&CaseSelection::Specific(CaseRef::new("asthma")), &[])
            .await;
        assert!(ok.is_ok());

        let missing = catalog
            .fetch_or_assign_case(&CaseSelection::Specific(CaseRef::new("gout")), &[])
            .await;
        assert!(missing.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_static_identity() {
        let mut tokens = HashMap::new();
        tokens.insert("secret".to_string(), UserId::new("alice"));
        let resolver = StaticIdentity::new(tokens);

        assert_eq!(
            resolver.resolve_identity("secret").await.unwrap(),
            UserId::new("alice")
        );
        assert!(resolver.resolve_identity("nope").await.is_err());

        let dev = StaticIdentity::anonymous();
        assert_eq!(
            dev.resolve_identity("bob").await.unwrap(),
            UserId::new("bob")
        );
        assert!(dev.resolve_identity("  ").await.is_err());
    }
}
