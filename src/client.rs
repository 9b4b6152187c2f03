//! Client side of the page-server socket protocol.

use crate::error::ClientError;
use crate::page::ServiceRequest;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// Ask the server on `socket` for its process ID.
pub async fn query_pid(socket: &Path) -> Result<u32, ClientError> {
    let request = ServiceRequest {
        get_pid: true,
        ..Default::default()
    };
    parse_pid_reply(&send_request(socket, &request).await?)
}

/// Tell the server on `socket` to finish its current requests and exit.
/// Returns the server's process ID.
pub async fn terminate(socket: &Path) -> Result<u32, ClientError> {
    let request = ServiceRequest {
        exit_now: true,
        ..Default::default()
    };
    parse_pid_reply(&send_request(socket, &request).await?)
}

/// Send one request and collect everything the server writes back.
pub async fn send_request(socket: &Path, request: &ServiceRequest) -> Result<Vec<u8>, ClientError> {
    let mut stream = UnixStream::connect(socket)
        .await
        .map_err(|e| ClientError::io(format!("connect to {}", socket.display()), e))?;
    let body = serde_json::to_vec(request)?;
    stream
        .write_all(&body)
        .await
        .map_err(|e| ClientError::io("send request", e))?;
    stream
        .shutdown()
        .await
        .map_err(|e| ClientError::io("send request", e))?;

    let mut reply = Vec::new();
    stream
        .read_to_end(&mut reply)
        .await
        .map_err(|e| ClientError::io("read reply", e))?;
    debug!(socket = %socket.display(), bytes = reply.len(), "Received reply");
    Ok(reply)
}

/// Parse a `gosp-pid <pid>` line.
pub fn parse_pid_reply(reply: &[u8]) -> Result<u32, ClientError> {
    let text = String::from_utf8_lossy(reply);
    text.trim_end()
        .strip_prefix("gosp-pid ")
        .and_then(|pid| pid.parse().ok())
        .ok_or_else(|| ClientError::UnexpectedReply(text.into_owned()))
}
