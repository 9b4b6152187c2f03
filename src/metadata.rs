//! Rendering of page metadata into the response header formats.

use crate::page::{keys, KeyValue, STATUS_OK};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_MIME_TYPE: &str = "text/html";

/// How page metadata is sent back ahead of the body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// `<key> <value>` lines terminated by `end-header`, for the web-server
    /// module.
    #[default]
    Structured,
    /// An HTTP-style header block.
    Raw,
    /// No header at all; the page writes its own.
    None,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mod_gosp" | "structured" => Ok(WireFormat::Structured),
            "raw" => Ok(WireFormat::Raw),
            "none" => Ok(WireFormat::None),
            _ => Err(format!(
                "{:?} is not a valid header format (expected \"mod_gosp\", \"raw\" or \"none\")",
                s
            )),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WireFormat::Structured => "mod_gosp",
            WireFormat::Raw => "raw",
            WireFormat::None => "none",
        })
    }
}

/// Replace every run of whitespace with a single space.
pub fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Accumulates metadata events for one response.
#[derive(Debug)]
pub struct MetadataWriter {
    format: WireFormat,
    status: String,
    lines: Vec<u8>,
    mime_type: String,
    fields: Vec<(String, String)>,
}

impl MetadataWriter {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            status: STATUS_OK.to_string(),
            lines: Vec::new(),
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn record(&mut self, kv: &KeyValue) {
        if kv.key == keys::HTTP_STATUS {
            self.status = kv.value.trim().to_string();
        }
        match self.format {
            WireFormat::Structured => {
                if keys::ALL.contains(&kv.key.as_str()) {
                    let line = format!("{} {}\n", sanitize(&kv.key), sanitize(&kv.value));
                    self.lines.extend_from_slice(line.as_bytes());
                }
            }
            WireFormat::Raw => match kv.key.as_str() {
                keys::MIME_TYPE => self.mime_type = sanitize(&kv.value),
                keys::HEADER_FIELD => self.header_field(&kv.value),
                keys::HTTP_STATUS
                | keys::KEEP_ALIVE
                | keys::ERROR_MESSAGE
                | keys::DEBUG_MESSAGE => {}
                other => self
                    .fields
                    .push((sanitize(other), sanitize(&kv.value))),
            },
            WireFormat::None => {}
        }
    }

    /// Apply a `"<replace> <name> <value>"` header-field event. Anything else
    /// is kept as a literal header line.
    fn header_field(&mut self, value: &str) {
        let mut parts = value.splitn(3, ' ');
        let replace = match parts.next() {
            Some("true") => true,
            Some("false") => false,
            _ => {
                self.fields.push((String::new(), sanitize(value)));
                return;
            }
        };
        let name = sanitize(parts.next().unwrap_or(""));
        let field = sanitize(parts.next().unwrap_or(""));
        if replace {
            self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        }
        self.fields.push((name, field));
    }

    /// The HTTP status as last reported, `"200"` if never set.
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK.to_string()
    }

    /// Produce the header bytes that precede the body.
    pub fn finish(self) -> Vec<u8> {
        match self.format {
            WireFormat::Structured => {
                let mut out = self.lines;
                out.extend_from_slice(b"end-header\n");
                out
            }
            WireFormat::Raw => {
                let mut out = format!("Content-type: {}\n", self.mime_type);
                for (name, value) in &self.fields {
                    if name.is_empty() {
                        out.push_str(value);
                    } else {
                        out.push_str(&format!("{}: {}", name, value));
                    }
                    out.push('\n');
                }
                out.push('\n');
                out.into_bytes()
            }
            WireFormat::None => Vec::new(),
        }
    }
}
