//! SessionRegistry - オーケストレーターが所有するセッション表
//!
//! プロセス全体のシングルトンではありません。オーケストレーターごとに
//! 1 つ持つので、テストで複数インスタンスを並べても干渉しません。
//!
//! 終了済みセッションは `retain` 件まで保持し、超えた分は古い順
//! （ULID 順）に忘れます。忘れたセッションへの `abort` は `None` です。

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::domain::ids::SessionId;
use crate::domain::session::SessionStatus;

struct Entry {
    cancel: CancellationToken,
    status: watch::Receiver<SessionStatus>,
    workspace_path: PathBuf,
}

/// What `abort` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The cancellation signal was raised by this call.
    Signalled,
    /// Already aborted or already finished. Nothing changed.
    NoOp,
}

pub const DEFAULT_RETAINED_SESSIONS: usize = 1000;

pub struct SessionRegistry {
    entries: Mutex<HashMap<SessionId, Entry>>,
    retain: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_SESSIONS)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retain` finished sessions.
    pub fn with_retention(retain: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retain: retain.max(1),
        }
    }

    pub fn insert(
        &self,
        session_id: SessionId,
        cancel: CancellationToken,
        status: watch::Receiver<SessionStatus>,
        workspace_path: PathBuf,
    ) {
        let mut entries = self.entries.lock();
        entries.insert(
            session_id,
            Entry {
                cancel,
                status,
                workspace_path,
            },
        );
        self.evict_finished(&mut entries);
    }

    /// Drop the oldest finished sessions beyond the retention limit.
    fn evict_finished(&self, entries: &mut HashMap<SessionId, Entry>) {
        let mut finished: Vec<SessionId> = entries
            .iter()
            .filter(|(_, e)| e.status.borrow().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        if finished.len() <= self.retain {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.retain;
        for id in &finished[..excess] {
            entries.remove(id);
        }
        tracing::debug!(evicted = excess, "finished sessions evicted");
    }

    /// The session's cancellation token. Child tokens die with the session.
    pub fn cancel_token(&self, session_id: SessionId) -> Option<CancellationToken> {
        self.entries
            .lock()
            .get(&session_id)
            .map(|e| e.cancel.clone())
    }

    /// `None` for an unknown session.
    pub fn abort(&self, session_id: SessionId) -> Option<AbortOutcome> {
        let entries = self.entries.lock();
        let entry = entries.get(&session_id)?;
        if entry.cancel.is_cancelled() || entry.status.borrow().is_terminal() {
            return Some(AbortOutcome::NoOp);
        }
        entry.cancel.cancel();
        Some(AbortOutcome::Signalled)
    }

    pub fn status(&self, session_id: SessionId) -> Option<SessionStatus> {
        self.entries
            .lock()
            .get(&session_id)
            .map(|e| *e.status.borrow())
    }

    pub fn workspace_path(&self, session_id: SessionId) -> Option<PathBuf> {
        self.entries
            .lock()
            .get(&session_id)
            .map(|e| e.workspace_path.clone())
    }

    /// Sessions that have not reached a terminal status, oldest first.
    pub fn active(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| !e.status.borrow().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.entries
            .lock()
            .values()
            .map(|e| *e.status.borrow())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
