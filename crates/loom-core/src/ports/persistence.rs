//! PersistenceSink port - セッション記録の抽象化
//!
//! コアはセッション作成時と終端状態到達時にだけ呼び出します。
//! 終端時の失敗は呼び出し側に投げ返さず、Warning イベントに落とします。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::PersistenceError;
use crate::domain::ids::SessionId;
use crate::domain::session::{Session, SessionMetrics, SessionStatus};

/// 終端時に書き込む内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub status: SessionStatus,
    pub metrics: SessionMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One entry of a session's persisted history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineItem {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: TimelineEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum TimelineEntry {
    SessionCreated {
        prompt: String,
    },
    StatusUpdated {
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    FileSaved {
        path: String,
        bytes: usize,
    },
}

/// PersistenceSink はセッション・タイムライン・ファイルの保存先
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<(), PersistenceError>;

    async fn update_session(
        &self,
        session_id: SessionId,
        update: SessionUpdate,
    ) -> Result<(), PersistenceError>;

    /// `path` is workspace-relative.
    async fn save_file(
        &self,
        session_id: SessionId,
        path: &str,
        content: &[u8],
    ) -> Result<(), PersistenceError>;

    async fn get_timeline_items(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<TimelineItem>, PersistenceError>;
}
