//! The contract between the server and a compiled page.
//!
//! A page generator receives a [`PageContext`], writes its body to a byte
//! sink and reports status, MIME type, header fields and diagnostics through
//! a [`Metadata`] handle. Dropping the handle ends the metadata stream.

use crate::paths;
use serde::{Deserialize, Deserializer, Serialize};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Once;
use tokio::sync::mpsc;

pub use std::io::Write as Writer;

pub const STATUS_OK: u16 = 200;
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;

/// Capacity of the per-request metadata channel.
pub const METADATA_CAPACITY: usize = 5;

/// Metadata keys understood by the wire formats.
pub mod keys {
    pub const MIME_TYPE: &str = "mime-type";
    pub const HTTP_STATUS: &str = "http-status";
    pub const HEADER_FIELD: &str = "header-field";
    pub const KEEP_ALIVE: &str = "keep-alive";
    pub const ERROR_MESSAGE: &str = "error-message";
    pub const DEBUG_MESSAGE: &str = "debug-message";

    pub const ALL: [&str; 6] = [
        MIME_TYPE,
        HTTP_STATUS,
        HEADER_FIELD,
        KEEP_ALIVE,
        ERROR_MESSAGE,
        DEBUG_MESSAGE,
    ];
}

/// Web-server information about one request.
///
/// Most fields come from the client and must be checked before being used
/// for anything that touches the filesystem or privileges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestData {
    pub scheme: String,
    pub local_hostname: String,
    pub port: u16,
    pub uri: String,
    pub path_info: String,
    pub query_args: String,
    pub url: String,
    pub method: String,
    pub request_line: String,
    /// Nanoseconds since the Unix epoch.
    pub request_time: i64,
    pub remote_hostname: String,
    pub remote_ip: String,
    /// Local filename of the page being served.
    pub filename: String,
    #[serde(deserialize_with = "null_as_default")]
    pub post_data: HashMap<String, String>,
    #[serde(deserialize_with = "null_as_default")]
    pub get_data: HashMap<String, String>,
    #[serde(deserialize_with = "null_as_default")]
    pub header_data: HashMap<String, String>,
    pub admin_email: String,
    #[serde(deserialize_with = "null_as_default")]
    pub environment: HashMap<String, String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One message from the web server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceRequest {
    #[serde(rename = "UserData")]
    pub user_data: RequestData,
    /// Reply with our process ID and do nothing else.
    #[serde(rename = "GetPID")]
    pub get_pid: bool,
    /// Reply with our process ID and shut down cleanly.
    #[serde(rename = "ExitNow")]
    pub exit_now: bool,
}

/// A metadata key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Sending half of a page's metadata stream.
///
/// Not `Clone`: the stream ends exactly when this handle is dropped.
#[derive(Debug)]
pub struct Metadata {
    tx: mpsc::Sender<KeyValue>,
}

impl Metadata {
    /// Create a metadata stream and the receiver that drains it.
    pub fn channel(capacity: usize) -> (Metadata, mpsc::Receiver<KeyValue>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Metadata { tx }, rx)
    }

    /// Send one event, blocking while the channel is full. Events sent after
    /// the receiver has gone away are discarded.
    pub fn send(&self, key: &str, value: impl Into<String>) {
        let _ = self.tx.blocking_send(KeyValue::new(key, value));
    }

    /// Queue an event without blocking; used from async code before the
    /// generator starts. Returns false if the channel is full or closed.
    pub(crate) fn try_send(&self, key: &str, value: impl Into<String>) -> bool {
        self.tx.try_send(KeyValue::new(key, value)).is_ok()
    }

    pub fn set_http_status(&self, status: u16) {
        self.send(keys::HTTP_STATUS, status.to_string());
    }

    pub fn set_mime_type(&self, mime: &str) {
        self.send(keys::MIME_TYPE, mime);
    }

    /// Ask for `name: value` in the response header. With `replace` the
    /// value supersedes earlier values for `name`; otherwise it is appended.
    pub fn set_header_field(&self, name: &str, value: &str, replace: bool) {
        self.send(keys::HEADER_FIELD, format!("{} {} {}", replace, name, value));
    }

    pub fn set_keep_alive(&self, keep: bool) {
        self.send(keys::KEEP_ALIVE, keep.to_string());
    }

    pub fn error_message(&self, message: impl Into<String>) {
        self.send(keys::ERROR_MESSAGE, message);
    }

    pub fn debug_message(&self, message: impl Into<String>) {
        self.send(keys::DEBUG_MESSAGE, message);
    }
}

/// Everything a page knows about the request it is serving.
#[derive(Debug, Clone)]
pub struct PageContext {
    request: Option<RequestData>,
    base_dir: PathBuf,
}

impl PageContext {
    pub fn new(request: Option<RequestData>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            request,
            base_dir: base_dir.into(),
        }
    }

    /// The request, absent only when a page is run once without input.
    pub fn request(&self) -> Option<&RequestData> {
        self.request.as_ref()
    }

    /// Directory containing the page; relative paths resolve against it.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, name: impl AsRef<Path>) -> PathBuf {
        self.base_dir.join(name)
    }

    /// Open a file for reading, refusing anything outside the page's
    /// directory.
    pub fn open(&self, name: impl AsRef<Path>) -> io::Result<File> {
        paths::open_within(&self.base_dir, name.as_ref())
    }
}

/// A compiled page (or anything else that can produce one).
pub trait PageGenerator: Send + Sync + 'static {
    /// Write the body to `out` and report metadata through `meta`. The
    /// metadata stream must end on every exit path, which dropping `meta`
    /// guarantees.
    fn generate(&self, ctx: &PageContext, out: &mut dyn Writer, meta: Metadata);
}

impl<F> PageGenerator for F
where
    F: Fn(&PageContext, &mut dyn Writer, Metadata) + Send + Sync + 'static,
{
    fn generate(&self, ctx: &PageContext, out: &mut dyn Writer, meta: Metadata) {
        self(ctx, out, meta)
    }
}

const TRACE_SEPARATOR: &str = "----------------------------------------";

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static TRACE_HOOK: Once = Once::new();

/// Record a backtrace for every panic so a failing page can report where it
/// failed. The previously installed hook still runs.
fn install_trace_hook() {
    TRACE_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a page body so that the metadata stream always ends properly.
///
/// If the body panics, the page reports an internal server error followed by
/// the panic message and a backtrace as `error-message` events.
pub fn finalize_page<F>(meta: Metadata, body: F)
where
    F: FnOnce(&Metadata),
{
    install_trace_hook();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(&meta))) {
        let trace = PANIC_TRACE.with(|slot| slot.borrow_mut().take());
        report_failure(&meta, &panic_message(payload.as_ref()), trace.as_deref());
    }
}

fn report_failure(meta: &Metadata, message: &str, trace: Option<&str>) {
    tracing::error!(panic = message, "Page generator panicked");
    meta.set_http_status(STATUS_INTERNAL_SERVER_ERROR);
    meta.error_message(format!("page generator failed: {}", message));
    meta.error_message(TRACE_SEPARATOR);
    for line in trace.unwrap_or("").lines().filter(|l| !l.trim().is_empty()) {
        meta.error_message(format!("    {}", line.trim_end()));
    }
    meta.error_message(TRACE_SEPARATOR);
}

/// Write literal page text.
pub fn write_text(out: &mut dyn Writer, text: &str) {
    let _ = out.write_all(text.as_bytes());
}

/// Write formatted output, typically the value of a `go:expr` directive.
pub fn print(out: &mut dyn Writer, args: fmt::Arguments<'_>) {
    let _ = out.write_fmt(args);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut rx: mpsc::Receiver<KeyValue>) -> Vec<KeyValue> {
        let mut events = Vec::new();
        while let Some(kv) = rx.blocking_recv() {
            events.push(kv);
        }
        events
    }

    #[test]
    fn service_request_tolerates_missing_and_unknown_fields() {
        let sr: ServiceRequest =
            serde_json::from_str(r#"{"GetPID": true, "Bogus": 1, "UserData": {"Uri": "/x"}}"#)
                .unwrap();
        assert!(sr.get_pid);
        assert!(!sr.exit_now);
        assert_eq!(sr.user_data.uri, "/x");
        assert_eq!(sr.user_data.port, 0);
    }

    #[test]
    fn null_maps_decode_as_empty() {
        let rd: RequestData =
            serde_json::from_str(r#"{"PostData": null, "HeaderData": {"Host": "h"}}"#).unwrap();
        assert!(rd.post_data.is_empty());
        assert_eq!(rd.header_data["Host"], "h");
    }

    #[test]
    fn helpers_emit_expected_events() {
        let (meta, rx) = Metadata::channel(16);
        meta.set_http_status(404);
        meta.set_mime_type("text/plain");
        meta.set_header_field("X-Test", "a b", true);
        drop(meta);
        assert_eq!(
            drain(rx),
            vec![
                KeyValue::new("http-status", "404"),
                KeyValue::new("mime-type", "text/plain"),
                KeyValue::new("header-field", "true X-Test a b"),
            ]
        );
    }

    #[test]
    fn finalizer_reports_panics_and_closes_stream() {
        let (meta, rx) = Metadata::channel(METADATA_CAPACITY);
        let reader = std::thread::spawn(move || drain(rx));
        finalize_page(meta, |meta| {
            meta.set_mime_type("text/plain");
            panic!("boom");
        });
        let events = reader.join().unwrap();

        assert_eq!(events[0], KeyValue::new("mime-type", "text/plain"));
        assert_eq!(events[1], KeyValue::new("http-status", "500"));
        assert_eq!(events[2].value, "page generator failed: boom");
        assert_eq!(events[3].value, TRACE_SEPARATOR);
        assert_eq!(events.last().unwrap().value, TRACE_SEPARATOR);
        assert!(events[4..events.len() - 1]
            .iter()
            .all(|kv| kv.key == keys::ERROR_MESSAGE && kv.value.starts_with("    ")));
    }

    #[test]
    fn finalizer_is_silent_on_success() {
        let (meta, rx) = Metadata::channel(METADATA_CAPACITY);
        finalize_page(meta, |meta| meta.set_http_status(201));
        assert_eq!(drain(rx), vec![KeyValue::new("http-status", "201")]);
    }

    #[test]
    fn context_open_is_confined_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("site");
        std::fs::create_dir(&base).unwrap();
        std::fs::write(base.join("data.txt"), "ok").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "no").unwrap();

        let ctx = PageContext::new(None, &base);
        assert!(ctx.open("data.txt").is_ok());
        assert!(ctx.open("../secret.txt").is_err());
        assert_eq!(ctx.resolve("data.txt"), base.join("data.txt"));
    }
}
