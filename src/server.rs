//! The page execution server.
//!
//! A page server either listens on a Unix-domain socket, handling one JSON
//! [`ServiceRequest`] per connection, or handles a single request read from a
//! file (or no request at all) and writes the response to standard output.

use crate::config::{Mode, ServerConfig};
use crate::dispatch::{dispatch, page_context};
use crate::error::ServerError;
use crate::metadata::WireFormat;
use crate::page::{PageContext, PageGenerator, ServiceRequest};
use crate::state::ServerState;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode as FileMode;
use nix::unistd::dup2;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest request accepted on a connection.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Why a socket server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// A client asked us to exit; every in-flight request has finished.
    Requested,
    /// Nothing arrived for the configured idle time.
    Idle,
}

/// Run a page server in the configured mode.
pub async fn run(
    config: ServerConfig,
    generator: Arc<dyn PageGenerator>,
) -> Result<Option<Shutdown>, ServerError> {
    let cwd = std::env::current_dir().map_err(|e| ServerError::io("current directory", e))?;
    match config.mode {
        Mode::Socket(socket) => {
            detach_stdio()?;
            let socket = cwd.join(socket);
            let state = ServerState::new(socket, cwd, config.format, config.max_idle, generator);
            run_server(Arc::new(state)).await.map(Some)
        }
        Mode::File(path) => {
            let mut stdout = tokio::io::stdout();
            serve_file(&path, &cwd, config.format, generator, &mut stdout).await?;
            Ok(None)
        }
        Mode::Once => {
            let ctx = PageContext::new(None, cwd);
            let mut stdout = tokio::io::stdout();
            dispatch(generator, ctx, config.format, &mut stdout).await?;
            Ok(None)
        }
    }
}

/// Point standard input and output at `/dev/null`. A socket server talks only
/// through its socket; diagnostics still go to standard error.
pub fn detach_stdio() -> Result<(), ServerError> {
    let null = open("/dev/null", OFlag::O_RDWR, FileMode::empty())
        .map_err(|e| ServerError::io("open /dev/null", e.into()))?;
    for target in [std::io::stdin().as_raw_fd(), std::io::stdout().as_raw_fd()] {
        dup2(null, target).map_err(|e| ServerError::io("redirect standard descriptors", e.into()))?;
    }
    nix::unistd::close(null).map_err(|e| ServerError::io("close /dev/null", e.into()))?;
    Ok(())
}

/// Accept connections on `state.socket` until told to stop or idle for too
/// long.
pub async fn run_server(state: Arc<ServerState>) -> Result<Shutdown, ServerError> {
    let socket = state.socket.clone();
    match std::fs::remove_file(&socket) {
        Ok(()) => debug!(socket = %socket.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ServerError::io(format!("remove {}", socket.display()), e)),
    }
    let listener = UnixListener::bind(&socket)
        .map_err(|e| ServerError::io(format!("listen on {}", socket.display()), e))?;
    info!(socket = %socket.display(), pid = std::process::id(), "Page server listening");

    let mut workers = JoinSet::new();
    let shutdown = loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = state.idle.expired() => {
                info!(max_idle = ?state.idle.timeout(), "Idle timeout reached, exiting");
                remove_socket(&socket);
                return Ok(Shutdown::Idle);
            }
        };
        let (stream, _) =
            accepted.map_err(|e| ServerError::io(format!("accept on {}", socket.display()), e))?;
        if state.shutting_down() {
            break Shutdown::Requested;
        }
        state.idle.reset();
        while workers.try_join_next().is_some() {}
        workers.spawn(handle_connection(stream, state.clone()));
    };
    drop(listener);

    info!(in_flight = workers.len(), "Waiting for requests to finish");
    while workers.join_next().await.is_some() {}
    remove_socket(&socket);
    info!("Page server stopped");
    Ok(shutdown)
}

fn remove_socket(socket: &Path) {
    if let Err(e) = std::fs::remove_file(socket) {
        warn!(socket = %socket.display(), error = %e, "Failed to remove socket");
    }
}

async fn handle_connection(mut stream: UnixStream, state: Arc<ServerState>) {
    let id = Uuid::new_v4();
    let request = match tokio::time::timeout(state.request_timeout, read_request(&mut stream)).await
    {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            debug!(connection = %id, error = %e, "Dropping connection");
            return;
        }
        Err(_) => {
            debug!(connection = %id, error = %ServerError::Timeout, "Dropping connection");
            return;
        }
    };

    if request.exit_now {
        info!(connection = %id, "Shutdown requested");
        if let Err(e) = write_pid(&mut stream).await {
            warn!(connection = %id, error = %e, "Failed to acknowledge shutdown");
        }
        state.request_shutdown();
        // Wake the accept loop so it notices the flag.
        if let Err(e) = UnixStream::connect(&state.socket).await {
            warn!(connection = %id, error = %e, "Failed to wake accept loop");
        }
        return;
    }
    if request.get_pid {
        if let Err(e) = write_pid(&mut stream).await {
            debug!(connection = %id, error = %e, "Failed to report pid");
        }
        return;
    }

    let uri = request.user_data.uri.clone();
    let ctx = match page_context(Some(request.user_data), &state.default_dir) {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(connection = %id, uri = %uri, error = %e, "Cannot serve request");
            return;
        }
    };
    match dispatch(state.generator.clone(), ctx, state.format, &mut stream).await {
        Ok(status) => info!(connection = %id, uri = %uri, status = %status, "Request served"),
        Err(e) => warn!(connection = %id, uri = %uri, error = %e, "Failed to send response"),
    }
    let _ = stream.shutdown().await;
}

/// Decode exactly one JSON request, reading only as much as needed.
///
/// Each byte is scanned once to find where the request ends; the request is
/// then decoded in a single pass.
pub async fn read_request<R>(reader: &mut R) -> Result<ServiceRequest, ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut framer = Framer::default();
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| ServerError::io("read request", e))?;
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(ServerError::io(
                "read request",
                std::io::Error::new(std::io::ErrorKind::InvalidData, "request too large"),
            ));
        }

        match framer.advance(&buf) {
            Frame::Complete(end) => return Ok(serde_json::from_slice(&buf[..end])?),
            Frame::Unframed => return Ok(serde_json::from_slice(&buf)?),
            Frame::Incomplete if n > 0 => continue,
            Frame::Incomplete if buf.iter().all(u8::is_ascii_whitespace) => {
                return Err(ServerError::io(
                    "read request",
                    std::io::ErrorKind::UnexpectedEof.into(),
                ))
            }
            Frame::Incomplete => return Ok(serde_json::from_slice(&buf)?),
        }
    }
}

enum Frame {
    /// The first value ends at this offset.
    Complete(usize),
    /// The input does not start with an object or array.
    Unframed,
    Incomplete,
}

/// Tracks object and array nesting across reads to find the end of the first
/// JSON value.
#[derive(Default)]
struct Framer {
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Framer {
    fn advance(&mut self, buf: &[u8]) -> Frame {
        while let Some(&b) = buf.get(self.scanned) {
            self.scanned += 1;
            if self.in_string {
                match b {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'{' | b'[' => self.depth += 1,
                _ if self.depth == 0 && b.is_ascii_whitespace() => {}
                _ if self.depth == 0 => return Frame::Unframed,
                b'"' => self.in_string = true,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Frame::Complete(self.scanned);
                    }
                }
                _ => {}
            }
        }
        Frame::Incomplete
    }
}

async fn write_pid<W>(out: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(format!("gosp-pid {}\n", std::process::id()).as_bytes())
        .await?;
    out.flush().await
}

/// Handle the single request stored in `path`.
pub async fn serve_file<W>(
    path: &Path,
    default_dir: &Path,
    format: WireFormat,
    generator: Arc<dyn PageGenerator>,
    out: &mut W,
) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ServerError::io(format!("open {}", path.display()), e))?;
    let request = read_request(&mut file).await?;
    if request.get_pid || request.exit_now {
        return write_pid(out)
            .await
            .map_err(|e| ServerError::io("write pid", e));
    }
    let ctx = page_context(Some(request.user_data), default_dir)?;
    let status = dispatch(generator, ctx, format, out).await?;
    debug!(file = %path.display(), status = %status, "Request served");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reads_one_request_from_a_stream() {
        let mut input: &[u8] = br#"  {"GetPID": true} {"ExitNow": true}"#;
        let request = read_request(&mut input).await.unwrap();
        assert!(request.get_pid);
        assert!(!request.exit_now);
    }

    #[tokio::test]
    async fn truncated_request_is_an_error() {
        let mut input: &[u8] = br#"{"UserData": {"Uri": "/x""#;
        assert!(read_request(&mut input).await.is_err());
        let mut empty: &[u8] = b"";
        assert!(read_request(&mut empty).await.is_err());
    }

    #[tokio::test]
    async fn malformed_request_is_a_decode_error() {
        let mut input: &[u8] = b"[1, 2]";
        assert!(matches!(
            read_request(&mut input).await,
            Err(ServerError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn request_split_across_reads_is_reassembled() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(br#"{"UserData": "#).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(br#"{"Method": "GET"}}"#).await.unwrap();
            client
        });
        let request = read_request(&mut server).await.unwrap();
        assert_eq!(request.user_data.method, "GET");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn strings_may_hold_braces_and_escapes() {
        let mut input: &[u8] = br#"{"UserData": {"Uri": "/a}\"]{", "Method": "GET"}} trailing"#;
        let request = read_request(&mut input).await.unwrap();
        assert_eq!(request.user_data.uri, "/a}\"]{");
        assert_eq!(request.user_data.method, "GET");
    }

    #[tokio::test]
    async fn large_request_decodes_in_linear_time() {
        let mut user_data = crate::page::RequestData::default();
        for i in 0..64 {
            user_data
                .post_data
                .insert(format!("field{}", i), "x\"{".repeat(40 * 1024));
        }
        let text = serde_json::to_vec(&ServiceRequest {
            user_data,
            ..Default::default()
        })
        .unwrap();
        assert!(text.len() > 8 * 1024 * 1024);

        let started = std::time::Instant::now();
        let mut input: &[u8] = &text;
        let request = read_request(&mut input).await.unwrap();
        assert_eq!(request.user_data.post_data.len(), 64);
        assert_eq!(request.user_data.post_data["field7"].len(), 3 * 40 * 1024);
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn oversized_request_is_rejected() {
        let mut text = b"[".to_vec();
        text.resize(MAX_REQUEST_BYTES + 1, b' ');
        let mut input: &[u8] = &text;
        assert!(matches!(
            read_request(&mut input).await,
            Err(ServerError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn file_mode_answers_pid_queries() {
        fn unused(_: &PageContext, _: &mut dyn crate::page::Writer, _: crate::page::Metadata) {
            panic!("generator must not run");
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.json");
        std::fs::write(&path, r#"{"GetPID": true}"#).unwrap();
        let mut out = Vec::new();
        serve_file(&path, dir.path(), WireFormat::Structured, Arc::new(unused), &mut out)
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("gosp-pid {}\n", std::process::id())
        );
    }
}
