//! ReqwestProbe - reqwest による HTTP 到達確認
//!
//! レスポンスが返ってきた時点で成功です（4xx/5xx も含む）。
//! 接続できない・時間切れだけが失敗です。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::ports::{HttpProbe, ProbeError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ReqwestProbe {
    client: Client,
}

impl ReqwestProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .use_rustls_tls()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, ProbeError> {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => Ok(response.status().as_u16()),
            Err(e) if e.is_timeout() => Err(ProbeError::Timeout),
            Err(e) => Err(ProbeError::Connect(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_port_is_a_connect_error() {
        let probe = ReqwestProbe::new().unwrap();
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let result = probe
            .probe(&format!("http://127.0.0.1:{port}/"), Duration::from_secs(2))
            .await;

        assert!(matches!(result, Err(ProbeError::Connect(_))));
    }

    #[tokio::test]
    async fn error_status_still_counts_as_listening() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        });

        let status = probe_once(port).await;
        assert_eq!(status, Ok(503));
    }

    async fn probe_once(port: u16) -> Result<u16, ProbeError> {
        ReqwestProbe::new()
            .unwrap()
            .probe(&format!("http://127.0.0.1:{port}/"), Duration::from_secs(2))
            .await
    }
}
