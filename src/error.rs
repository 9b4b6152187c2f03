//! Error types shared by the compiler, the server and the control client.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure while turning a page into Rust source.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{path} is not allowed to be included from directory {dir}")]
    SandboxViolation { path: PathBuf, dir: PathBuf },

    #[error("inclusion depth exceeded the maximum of {max}")]
    IncludeDepthExceeded { max: usize },

    #[error("too many go:top blocks ({count} versus a maximum of {max})")]
    TooManyTopBlocks { count: usize, max: usize },

    #[error("{name:?} is not in the list of approved imports for {page} ({allowed:?})")]
    ImportRejected {
        name: String,
        page: String,
        allowed: String,
    },

    #[error("generated code does not parse: {0}")]
    Parse(#[from] syn::Error),

    #[error("invalid import list: {0}")]
    AllowList(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CompileError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CompileError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure that stops the execution server or a single-shot run.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed request: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("timed out waiting for a request")]
    Timeout,

    #[error("page generator task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ServerError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        ServerError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Failure talking to a running page server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unexpected reply from server: {0:?}")]
    UnexpectedReply(String),
}

impl ClientError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        ClientError::Io {
            context: context.into(),
            source,
        }
    }
}
