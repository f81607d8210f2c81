//! Session persistence - one JSON document per session

use super::{SessionId, SessionRecord};
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Durable storage for session records.
///
/// Records are written atomically (temp file + rename) after every committed
/// mutation. Without a directory the store only allocates ids.
#[derive(Debug)]
pub struct SessionStore {
    dir: Option<PathBuf>,
    next_id: AtomicU64,
}

impl SessionStore {
    /// Store that keeps nothing on disk.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Open (and create if needed) a state directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let store = Self {
            dir: Some(dir),
            next_id: AtomicU64::new(1),
        };
        let max_id = store
            .load_all()?
            .iter()
            .map(|r| r.id.0)
            .max()
            .unwrap_or(0);
        store.next_id.store(max_id + 1, Ordering::SeqCst);
        Ok(store)
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    /// Allocate the next numeric session id.
    pub fn allocate_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn path_for(dir: &Path, record: &SessionRecord) -> PathBuf {
        dir.join(format!("{}-{}.json", record.id, record.code))
    }

    /// Write a record, replacing any previous version.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = Self::path_for(dir, record);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Every readable record in the state directory.
    pub fn load_all(&self) -> Result<Vec<SessionRecord>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read(&path)?;
            match serde_json::from_slice::<SessionRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session record");
                }
            }
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Records that have not reached a terminal status, for restart recovery.
    pub fn load_live(&self) -> Result<Vec<SessionRecord>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionsConfig;
    use crate::session::{SessionCode, SessionConfig, SessionStatus, UserId};
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(store: &SessionStore, code: &str) -> SessionRecord {
        SessionRecord::new(
            store.allocate_id(),
            SessionCode::parse(code).unwrap(),
            UserId::new("host"),
            SessionConfig::topics(vec!["renal".into()], &SessionsConfig::default()),
            Utc::now(),
        )
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let mut live = record(&store, "LIVE01");
        store.save(&live).unwrap();
        live.current_round = 3;
        store.save(&live).unwrap();

        let mut done = record(&store, "DONE01");
        done.status = SessionStatus::Completed;
        store.save(&done).unwrap();

        let reopened = SessionStore::open(dir.path()).unwrap();
        let all = reopened.load_all().unwrap();
        assert_eq!(all.len(), 2);

        let live_only = reopened.load_live().unwrap();
        assert_eq!(live_only.len(), 1);
        assert_eq!(live_only[0].current_round, 3);

        assert_eq!(reopened.allocate_id(), SessionId(3));
    }

    #[test]
    fn test_unreadable_records_are_skipped() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("9-BROKEN.json"), b"{not json").unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_in_memory_store_allocates_ids() {
        let store = SessionStore::in_memory();
        assert_eq!(store.allocate_id(), SessionId(1));
        assert_eq!(store.allocate_id(), SessionId(2));
        assert!(store.load_all().unwrap().is_empty());
    }
}
