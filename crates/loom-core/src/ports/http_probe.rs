//! HttpProbe port - HTTP 疎通確認の抽象化

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("probe timed out")]
    Timeout,
}

/// HttpProbe は 1 回だけリクエストを投げる
///
/// どんなステータスコードでも `Ok(status)` を返します。
/// `Err` になるのは接続できなかったときだけです。
#[async_trait]
pub trait HttpProbe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, ProbeError>;
}
