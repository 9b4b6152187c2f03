//! Running one page generator and streaming its response.

use crate::error::ServerError;
use crate::metadata::{sanitize, MetadataWriter, WireFormat};
use crate::page::{
    keys, KeyValue, Metadata, PageContext, PageGenerator, RequestData, METADATA_CAPACITY,
    STATUS_INTERNAL_SERVER_ERROR,
};
use crate::paths;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Build the context for a request.
///
/// The base directory is the directory holding `Filename`, or `default_dir`
/// when there is no request or no filename.
pub fn page_context(
    request: Option<RequestData>,
    default_dir: &Path,
) -> Result<PageContext, ServerError> {
    let dir = match request.as_ref().map(|r| Path::new(&r.filename)) {
        Some(file) if !file.as_os_str().is_empty() => match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => default_dir.to_path_buf(),
        },
        _ => default_dir.to_path_buf(),
    };
    let base = paths::canonical_path(&dir, default_dir)
        .map_err(|e| ServerError::io(format!("resolve {}", dir.display()), e))?;
    if !base.is_dir() {
        return Err(ServerError::io(
            format!("page directory {}", base.display()),
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        ));
    }
    Ok(PageContext::new(request, base))
}

/// Run `generator` for `ctx` and write the header and (on success) the body
/// to `out`. Returns the final HTTP status string.
pub async fn dispatch<W>(
    generator: Arc<dyn PageGenerator>,
    ctx: PageContext,
    format: WireFormat,
    out: &mut W,
) -> Result<String, ServerError>
where
    W: AsyncWrite + Unpin,
{
    let (meta, mut rx) = Metadata::channel(METADATA_CAPACITY);
    meta.try_send(
        keys::DEBUG_MESSAGE,
        sanitize(&format!("Handling {:?}", ctx.request())),
    );

    let task = tokio::task::spawn_blocking(move || {
        let mut body = Vec::new();
        generator.generate(&ctx, &mut body, meta);
        body
    });

    let mut header = MetadataWriter::new(format);
    while let Some(kv) = rx.recv().await {
        header.record(&kv);
    }

    let body = match task.await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Page generator failed without reporting it");
            header.record(&KeyValue::new(
                keys::HTTP_STATUS,
                STATUS_INTERNAL_SERVER_ERROR.to_string(),
            ));
            Vec::new()
        }
    };

    let status = header.status().to_string();
    let success = header.is_success();
    debug!(status = %status, body_len = body.len(), "Page generated");

    out.write_all(&header.finish())
        .await
        .map_err(|e| ServerError::io("write header", e))?;
    if success {
        out.write_all(&body)
            .await
            .map_err(|e| ServerError::io("write body", e))?;
    }
    out.flush()
        .await
        .map_err(|e| ServerError::io("flush response", e))?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{finalize_page, Writer};

    fn hello(_: &PageContext, out: &mut dyn Writer, meta: Metadata) {
        meta.set_mime_type("text/plain");
        let _ = out.write_all(b"hello");
    }

    fn not_found(_: &PageContext, out: &mut dyn Writer, meta: Metadata) {
        meta.set_http_status(404);
        let _ = out.write_all(b"secret body");
    }

    fn bare_panic(_: &PageContext, _: &mut dyn Writer, _: Metadata) {
        panic!("no finalizer here");
    }

    fn chatty(_: &PageContext, out: &mut dyn Writer, meta: Metadata) {
        finalize_page(meta, |meta| {
            for i in 0..50 {
                meta.debug_message(format!("step {}", i));
            }
            let _ = out.write_all(b"done");
        });
    }

    async fn run(generator: Arc<dyn PageGenerator>, format: WireFormat) -> (String, String) {
        let dir = std::env::temp_dir();
        let ctx = PageContext::new(None, dir);
        let mut out = Vec::new();
        let status = dispatch(generator, ctx, format, &mut out).await.unwrap();
        (status, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn success_writes_header_then_body() {
        let (status, out) = run(Arc::new(hello), WireFormat::Structured).await;
        assert_eq!(status, "200");
        assert_eq!(
            out,
            "debug-message Handling None\nmime-type text/plain\nend-header\nhello"
        );
    }

    #[tokio::test]
    async fn raw_format_prefixes_content_type() {
        let (_, out) = run(Arc::new(hello), WireFormat::Raw).await;
        assert_eq!(out, "Content-type: text/plain\n\nhello");
    }

    #[tokio::test]
    async fn body_is_withheld_on_error_status() {
        let (status, out) = run(Arc::new(not_found), WireFormat::None).await;
        assert_eq!(status, "404");
        assert!(out.is_empty());
    }

    fn secret(_: &PageContext, out: &mut dyn Writer, meta: Metadata) {
        meta.set_http_status(500);
        let _ = out.write_all(b"secret");
    }

    #[tokio::test]
    async fn failure_suppresses_body_in_every_format() {
        for format in [WireFormat::Structured, WireFormat::Raw, WireFormat::None] {
            let (status, out) = run(Arc::new(secret), format).await;
            assert_eq!(status, "500");
            assert!(!out.contains("secret"), "{format}: {out:?}");
        }
    }

    #[tokio::test]
    async fn unguarded_panic_becomes_500() {
        let (status, out) = run(Arc::new(bare_panic), WireFormat::Structured).await;
        assert_eq!(status, "500");
        assert!(out.ends_with("http-status 500\nend-header\n"));
    }

    #[tokio::test]
    async fn more_events_than_capacity_do_not_block() {
        let (status, out) = run(Arc::new(chatty), WireFormat::Structured).await;
        assert_eq!(status, "200");
        assert!(out.contains("debug-message step 49\n"));
        assert!(out.ends_with("end-header\ndone"));
    }

    #[tokio::test]
    async fn debug_message_describes_request() {
        let request = RequestData {
            uri: "/a b".into(),
            ..Default::default()
        };
        let ctx = PageContext::new(Some(request), std::env::temp_dir());
        let mut out = Vec::new();
        dispatch(Arc::new(hello), ctx, WireFormat::Structured, &mut out)
            .await
            .unwrap();
        let first = String::from_utf8(out).unwrap().lines().next().unwrap().to_string();
        assert!(first.starts_with("debug-message Handling Some(RequestData {"));
        assert!(first.contains("uri: \"/a b\""));
    }

    #[test]
    fn context_uses_page_directory() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site");
        std::fs::create_dir(&site).unwrap();
        let request = RequestData {
            filename: site.join("index.gosp").display().to_string(),
            ..Default::default()
        };
        let ctx = page_context(Some(request), dir.path()).unwrap();
        assert_eq!(ctx.base_dir(), std::fs::canonicalize(&site).unwrap());

        let ctx = page_context(None, dir.path()).unwrap();
        assert_eq!(ctx.base_dir(), std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn missing_page_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let request = RequestData {
            filename: dir.path().join("gone").join("x.gosp").display().to_string(),
            ..Default::default()
        };
        assert!(page_context(Some(request), dir.path()).is_err());
    }
}
