use super::actor::Command;
use crate::session::{SessionCode, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Address of a running session actor
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub id: SessionId,
    pub tx: mpsc::Sender<Command>,
}

/// Live session actors keyed by join code.
///
/// Entries are added on create or restore and removed by the actor itself
/// once its session has ended and the retention period is over.
#[derive(Clone, Default)]
pub(crate) struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionCode, SessionHandle>>>,
}

impl SessionRegistry {
    pub async fn get(&self, code: &SessionCode) -> Option<SessionHandle> {
        self.sessions.read().await.get(code).cloned()
    }

    /// Register `handle` under a freshly generated code no live session uses.
    pub async fn insert_unique(&self, handle: SessionHandle) -> SessionCode {
        let mut sessions = self.sessions.write().await;
        loop {
            let code = SessionCode::generate();
            if !sessions.contains_key(&code) {
                sessions.insert(code.clone(), handle);
                return code;
            }
            tracing::debug!(code = %code, "Session code collision, regenerating");
        }
    }

    /// Register `handle` under an existing code. False if the code is taken.
    pub async fn insert(&self, code: SessionCode, handle: SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&code) {
            return false;
        }
        sessions.insert(code, handle);
        true
    }

    /// Remove `code`, but only while it still points at session `id`.
    pub async fn remove(&self, code: &SessionCode, id: SessionId) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(code).map(|h| h.id) == Some(id) {
            sessions.remove(code);
        }
    }

    pub async fn codes(&self) -> Vec<SessionCode> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
