//! InMemoryPersistence - 開発用・テスト用の永続化シンク
//!
//! セッションとタイムラインを HashMap に保持します。
//! `fail_updates` / `fail_file_saves` で障害を注入できます。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::errors::PersistenceError;
use crate::domain::ids::SessionId;
use crate::domain::session::Session;
use crate::ports::{Clock, PersistenceSink, SessionUpdate, SystemClock, TimelineEntry, TimelineItem};

#[derive(Default)]
struct Stored {
    session: Option<Session>,
    timeline: Vec<TimelineItem>,
    files: HashMap<String, Vec<u8>>,
    updates: usize,
}

pub struct InMemoryPersistence {
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<SessionId, Stored>>,
    fail_updates: AtomicBool,
    fail_file_saves: AtomicBool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sessions: Mutex::new(HashMap::new()),
            fail_updates: AtomicBool::new(false),
            fail_file_saves: AtomicBool::new(false),
        }
    }

    /// Make every `update_session` call fail until switched off.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Make every `save_file` call fail until switched off.
    pub fn fail_file_saves(&self, fail: bool) {
        self.fail_file_saves.store(fail, Ordering::SeqCst);
    }

    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.sessions
            .lock()
            .get(&session_id)
            .and_then(|s| s.session.clone())
    }

    pub fn file(&self, session_id: SessionId, path: &str) -> Option<Vec<u8>> {
        self.sessions
            .lock()
            .get(&session_id)
            .and_then(|s| s.files.get(path).cloned())
    }

    /// Number of accepted `update_session` calls.
    pub fn update_count(&self, session_id: SessionId) -> usize {
        self.sessions
            .lock()
            .get(&session_id)
            .map_or(0, |s| s.updates)
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceSink for InMemoryPersistence {
    async fn create_session(&self, session: &Session) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.lock();
        let stored = sessions.entry(session.id).or_default();
        stored.session = Some(session.clone());
        stored.timeline.push(TimelineItem {
            at: session.created_at,
            entry: TimelineEntry::SessionCreated {
                prompt: session.prompt.clone(),
            },
        });
        Ok(())
    }

    async fn update_session(
        &self,
        session_id: SessionId,
        update: SessionUpdate,
    ) -> Result<(), PersistenceError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("update rejected".to_string()));
        }
        let mut sessions = self.sessions.lock();
        let stored = sessions
            .get_mut(&session_id)
            .ok_or_else(|| PersistenceError::SessionNotFound(session_id.to_string()))?;
        let Some(session) = stored.session.as_mut() else {
            return Err(PersistenceError::SessionNotFound(session_id.to_string()));
        };

        session.status = update.status;
        session.metrics = update.metrics;
        session.error_message = update.error_message.clone();
        session.updated_at = update.updated_at;
        stored.updates += 1;
        stored.timeline.push(TimelineItem {
            at: update.updated_at,
            entry: TimelineEntry::StatusUpdated {
                status: update.status,
                error_message: update.error_message,
            },
        });
        Ok(())
    }

    async fn save_file(
        &self,
        session_id: SessionId,
        path: &str,
        content: &[u8],
    ) -> Result<(), PersistenceError> {
        if self.fail_file_saves.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("file save rejected".to_string()));
        }
        let at = self.clock.now();
        let mut sessions = self.sessions.lock();
        let stored = sessions.entry(session_id).or_default();
        stored.files.insert(path.to_string(), content.to_vec());
        stored.timeline.push(TimelineItem {
            at,
            entry: TimelineEntry::FileSaved {
                path: path.to_string(),
                bytes: content.len(),
            },
        });
        Ok(())
    }

    async fn get_timeline_items(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<TimelineItem>, PersistenceError> {
        self.sessions
            .lock()
            .get(&session_id)
            .map(|s| s.timeline.clone())
            .ok_or_else(|| PersistenceError::SessionNotFound(session_id.to_string()))
    }
}
