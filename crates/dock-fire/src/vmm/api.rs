//! Minimal client for the Firecracker control API: enough to know the VMM
//! has come up. The VM itself is configured via `--config-file`; the runtime
//! only needs `GET /` to answer before it records the pid and returns.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Debug)]
pub struct ApiError {
    pub status: u16,
    pub body: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}: {}", self.status, self.body)
    }
}

impl std::error::Error for ApiError {}

/// Poll `GET /` over the API socket until it answers 2xx or the deadline
/// passes. The socket file appears once Firecracker binds it, so connection
/// failures before that are part of the normal wait.
pub async fn wait_for_ready(socket_path: &Path, timeout: Duration) -> Result<(), ApiError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let timed_out = || ApiError {
        status: 0,
        body: format!("timed out after {timeout:?} waiting for API ready"),
    };
    loop {
        match tokio::time::timeout_at(deadline, request(socket_path, "GET", "/")).await {
            Ok(Ok(_)) => return Ok(()),
            // An instant connect failure never pends, so timeout_at alone
            // would not trip; check the deadline ourselves.
            Ok(Err(_)) if tokio::time::Instant::now() >= deadline => return Err(timed_out()),
            Ok(Err(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(_) => return Err(timed_out()),
        }
    }
}

/// One bodyless HTTP/1.1 request over a Unix socket.
///
/// Returns the response body on 2xx; on failure the error carries the status
/// and Firecracker's `fault_message` when one is present.
async fn request(socket_path: &Path, method: &str, path: &str) -> Result<String, ApiError> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| ApiError {
            status: 0,
            body: format!("connect: {e}"),
        })?;

    let header = format!(
        "{method} {path} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Accept: application/json\r\n\
         Connection: close\r\n\
         \r\n"
    );
    stream
        .write_all(header.as_bytes())
        .await
        .map_err(|e| ApiError {
            status: 0,
            body: format!("write request: {e}"),
        })?;

    let mut buf = Vec::with_capacity(4096);
    stream.read_to_end(&mut buf).await.map_err(|e| ApiError {
        status: 0,
        body: format!("read response: {e}"),
    })?;
    let response = String::from_utf8_lossy(&buf);

    // "HTTP/1.1 204 No Content\r\n..."
    let status = response
        .get(9..12)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    let body = response
        .find("\r\n\r\n")
        .and_then(|i| response.get(i + 4..))
        .unwrap_or_default()
        .to_string();

    if (200..300).contains(&status) {
        Ok(body)
    } else {
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("fault_message")?.as_str().map(String::from))
            .unwrap_or(body);
        Err(ApiError {
            status,
            body: message,
        })
    }
}
