//! Command-line configuration for page servers.

use crate::metadata::WireFormat;
use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

/// Default idle time before a socket server exits.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(5 * 60);

/// Where a page server gets its requests from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Listen on a Unix-domain socket until told to stop or idle too long.
    Socket(PathBuf),
    /// Handle the single request stored in a file.
    File(PathBuf),
    /// Run the page once with no request data.
    Once,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mode: Mode,
    pub max_idle: Duration,
    pub format: WireFormat,
}

/// Options shared by every page server.
#[derive(Args, Debug, Clone)]
pub struct ServerOptions {
    /// Unix-domain socket on which to listen for JSON requests
    #[arg(long, conflicts_with = "file")]
    pub socket: Option<PathBuf>,

    /// File from which to read a single JSON request
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Idle time after which the server exits ("0s" means never)
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    pub max_idle: Duration,

    /// Response header format: "mod_gosp", "raw" or "none"
    #[arg(long = "http-headers", default_value = "mod_gosp")]
    pub http_headers: WireFormat,
}

impl ServerOptions {
    pub fn config(&self) -> ServerConfig {
        let mode = match (&self.socket, &self.file) {
            (Some(socket), _) => Mode::Socket(socket.clone()),
            (None, Some(file)) => Mode::File(file.clone()),
            (None, None) => Mode::Once,
        };
        ServerConfig {
            mode,
            max_idle: self.max_idle,
            format: self.http_headers,
        }
    }
}

/// Arguments accepted by a compiled page.
#[derive(Parser, Debug)]
#[command(about = "Serve a compiled server page", version)]
pub struct ServerArgs {
    #[command(flatten)]
    pub options: ServerOptions,
}

/// Parse durations such as `300s`, `5m`, `1h30m` or `250ms`. A bare number
/// is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {:?}", s))?;
        if digits == 0 {
            return Err(format!("invalid duration {:?}", s));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid duration {:?}: {}", s, e))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            other => return Err(format!("unknown unit {:?} in duration {:?}", other, s)),
        };
        total += unit;
        rest = &rest[unit_len..];
    }
    Ok(total)
}
