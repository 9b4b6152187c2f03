//! Pages produced by an external program.
//!
//! The program runs once per request in the page's directory, with a
//! CGI-style environment and the request as JSON on standard input. Its
//! standard output becomes the body and each line of standard error becomes
//! an `error-message` event.

use crate::page::{
    finalize_page, Metadata, PageContext, PageGenerator, RequestData, Writer,
    STATUS_INTERNAL_SERVER_ERROR,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tracing::{info, warn};

/// Runs a program per request.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a command line; `None` if it is empty.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program, args.to_vec()))
    }

    fn run(&self, ctx: &PageContext) -> Result<Output, String> {
        info!(program = %self.program.display(), dir = %ctx.base_dir().display(), "Running page program");
        let input = match ctx.request() {
            Some(request) => {
                serde_json::to_vec(request).map_err(|e| format!("encode request: {}", e))?
            }
            None => Vec::new(),
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(ctx.base_dir())
            .envs(cgi_env(ctx.request()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("spawn {}: {}", self.program.display(), e))?;

        // Feed stdin from another thread so a chatty child cannot deadlock us.
        let stdin = child.stdin.take();
        let feeder = std::thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&input);
            }
        });
        let output = child
            .wait_with_output()
            .map_err(|e| format!("wait for {}: {}", self.program.display(), e))?;
        let _ = feeder.join();
        Ok(output)
    }
}

impl PageGenerator for CommandGenerator {
    fn generate(&self, ctx: &PageContext, out: &mut dyn Writer, meta: Metadata) {
        finalize_page(meta, |meta| match self.run(ctx) {
            Ok(output) => {
                let _ = out.write_all(&output.stdout);
                for line in String::from_utf8_lossy(&output.stderr).lines() {
                    meta.error_message(line);
                }
                if !output.status.success() {
                    warn!(program = %self.program.display(), status = %output.status, "Page program failed");
                    meta.set_http_status(STATUS_INTERNAL_SERVER_ERROR);
                }
            }
            Err(e) => {
                warn!(error = %e, "Page program did not run");
                meta.set_http_status(STATUS_INTERNAL_SERVER_ERROR);
                meta.error_message(e);
            }
        });
    }
}

/// CGI-style variables describing `request`.
fn cgi_env(request: Option<&RequestData>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let Some(request) = request else {
        return env;
    };
    env.extend(request.environment.clone());
    for (name, value) in &request.header_data {
        let name = name.to_ascii_uppercase().replace('-', "_");
        env.insert(format!("HTTP_{}", name), value.clone());
    }
    env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
    env.insert("REQUEST_METHOD".into(), request.method.clone());
    env.insert("REQUEST_URI".into(), request.uri.clone());
    env.insert("QUERY_STRING".into(), request.query_args.clone());
    env.insert("PATH_INFO".into(), request.path_info.clone());
    env.insert("SCRIPT_FILENAME".into(), request.filename.clone());
    env.insert("SERVER_NAME".into(), request.local_hostname.clone());
    env.insert("SERVER_PORT".into(), request.port.to_string());
    env.insert("SERVER_ADMIN".into(), request.admin_email.clone());
    env.insert("REMOTE_ADDR".into(), request.remote_ip.clone());
    env.insert("REMOTE_HOST".into(), request.remote_hostname.clone());
    env.insert("REQUEST_SCHEME".into(), request.scheme.clone());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{KeyValue, METADATA_CAPACITY};

    fn run(generator: &CommandGenerator, ctx: &PageContext) -> (Vec<u8>, Vec<KeyValue>) {
        let (meta, mut rx) = Metadata::channel(METADATA_CAPACITY);
        let reader = std::thread::spawn(move || {
            let mut events = Vec::new();
            while let Some(kv) = rx.blocking_recv() {
                events.push(kv);
            }
            events
        });
        let mut body = Vec::new();
        generator.generate(ctx, &mut body, meta);
        (body, reader.join().unwrap())
    }

    fn sh(script: &str) -> CommandGenerator {
        CommandGenerator::new("/bin/sh", vec!["-c".into(), script.into()])
    }

    #[test]
    fn stdout_becomes_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("name.txt"), "page").unwrap();
        let request = RequestData {
            method: "GET".into(),
            ..Default::default()
        };
        let ctx = PageContext::new(Some(request), dir.path());
        let (body, events) = run(&sh("printf '%s %s' \"$REQUEST_METHOD\" \"$(cat name.txt)\""), &ctx);
        assert_eq!(body, b"GET page");
        assert!(events.is_empty());
    }

    #[test]
    fn request_arrives_on_stdin() {
        let request = RequestData {
            uri: "/hello".into(),
            ..Default::default()
        };
        let ctx = PageContext::new(Some(request), std::env::temp_dir());
        let (body, _) = run(&sh("cat"), &ctx);
        let echoed: RequestData = serde_json::from_slice(&body).unwrap();
        assert_eq!(echoed.uri, "/hello");
    }

    #[test]
    fn failure_reports_stderr_and_500() {
        let ctx = PageContext::new(None, std::env::temp_dir());
        let (_, events) = run(&sh("echo oops >&2; exit 3"), &ctx);
        assert_eq!(
            events,
            vec![
                KeyValue::new("error-message", "oops"),
                KeyValue::new("http-status", "500"),
            ]
        );
    }

    #[test]
    fn missing_program_is_a_500() {
        let generator = CommandGenerator::new("/nonexistent/page-program", Vec::new());
        let ctx = PageContext::new(None, std::env::temp_dir());
        let (_, events) = run(&generator, &ctx);
        assert_eq!(events[0], KeyValue::new("http-status", "500"));
        assert!(events[1].value.starts_with("spawn /nonexistent/page-program"));
    }

    #[test]
    fn headers_map_to_http_variables() {
        let mut request = RequestData::default();
        request.header_data.insert("User-Agent".into(), "test".into());
        let env = cgi_env(Some(&request));
        assert_eq!(env["HTTP_USER_AGENT"], "test");
        assert!(cgi_env(None).is_empty());
    }
}
