//! Server page to Rust compiler.
//!
//! A page is literal text with embedded directives:
//!
//! * `<?go:top CODE ?>`: items hoisted to module level
//! * `<?go:block CODE ?>`: statements run in place
//! * `<?go:expr CODE ?>`: an expression whose value is written in place
//! * `<?go:include PATH ?>`: the text of another page, spliced in first
//!
//! Inclusion is confined to the including page's directory tree and nested at
//! most [`CompilePolicy::max_include_depth`] levels deep.

use crate::error::CompileError;
use crate::imports::{self, ImportAllowList};
use crate::paths;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_MAX_TOP: usize = 1;
pub const DEFAULT_MAX_INCLUDE_DEPTH: usize = 10;

const HEADER: &str = "\
// This file was generated by gosp from a server page.

#![allow(unused_imports, unused_variables, unused_mut, dead_code, unreachable_code)]

";

const BODY_BEGIN: &str = "\
/// The server page, expressed in Rust.
pub fn gosp_generate_page(
    gosp_ctx: &gosp::PageContext,
    gosp_out: &mut dyn gosp::Writer,
    gosp_meta: gosp::Metadata,
) {
    // The metadata stream ends when this call returns. A panic in the page
    // becomes an internal server error.
    gosp::finalize_page(gosp_meta, |gosp_meta| {
        let gosp_req = gosp_ctx.request();

        // Pass metadata back to the web server.
        let gosp_set_http_status = |status: u16| gosp_meta.set_http_status(status);
        let gosp_set_mime_type = |mime: &str| gosp_meta.set_mime_type(mime);
        let gosp_set_header_field = |name: &str, value: &str, replace: bool| {
            gosp_meta.set_header_field(name, value, replace)
        };

// The page itself.
";

const BODY_END: &str = "    });
}
";

const TRAILER: &str = "
fn main() {
    gosp::serve_main(gosp_generate_page);
}
";

static INCLUDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\?go:include\s+(.*?)\s+\?>").expect("include pattern"));

static DIRECTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<\?go:(top|block|expr)\s+((?s:.*?))\?>([\t ]*\n?)").expect("directive pattern")
});

/// Limits applied while compiling a page.
#[derive(Debug, Clone)]
pub struct CompilePolicy {
    /// Maximum number of `go:top` directives per page.
    pub max_top: usize,
    pub max_include_depth: usize,
    /// Directory the include sandbox starts from.
    pub include_root: PathBuf,
    pub allowed: ImportAllowList,
}

impl CompilePolicy {
    pub fn new(include_root: impl Into<PathBuf>) -> Self {
        Self {
            max_top: DEFAULT_MAX_TOP,
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
            include_root: include_root.into(),
            allowed: ImportAllowList::all(),
        }
    }
}

/// One piece of a page's body, in page order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Literal text written as-is.
    Text(String),
    /// Statements from a `go:block` directive.
    Code(String),
    /// A `go:expr` directive and the whitespace that followed it.
    Expr { code: String, trailing: String },
}

impl Fragment {
    fn render(&self, out: &mut String) {
        match self {
            Fragment::Text(text) => {
                out.push_str(&format!("gosp::write_text(gosp_out, {:?});\n", text));
            }
            Fragment::Code(code) => out.push_str(code),
            Fragment::Expr { code, trailing } => out.push_str(&format!(
                "gosp::print(gosp_out, format_args!(\"{{}}{{}}\", ({}), {:?}));\n",
                code, trailing
            )),
        }
    }
}

/// A page split into hoisted items and body fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub top: Vec<String>,
    pub body: Vec<Fragment>,
}

/// Split already include-expanded page text into its parts.
pub fn scan(text: &str) -> ParsedPage {
    let mut page = ParsedPage::default();
    let mut rest = text;
    while let Some(caps) = DIRECTIVE_RE.captures(rest) {
        let (Some(whole), Some(kind), Some(code), Some(space)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            break;
        };
        if whole.start() > 0 {
            page.body.push(Fragment::Text(rest[..whole.start()].to_string()));
        }
        let code = code.as_str();
        match kind.as_str() {
            "top" => page.top.push(with_newline(code)),
            "block" => page.body.push(Fragment::Code(with_newline(code))),
            _ => page.body.push(Fragment::Expr {
                code: code.trim().to_string(),
                trailing: space.as_str().to_string(),
            }),
        }
        rest = &rest[whole.end()..];
    }
    if !rest.is_empty() {
        page.body.push(Fragment::Text(rest.to_string()));
    }
    page
}

fn with_newline(code: &str) -> String {
    if code.is_empty() || code.ends_with('\n') {
        code.to_string()
    } else {
        format!("{}\n", code)
    }
}

/// Rust source generated from a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSource(String);

impl GeneratedSource {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for GeneratedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Directories of the pages currently being expanded, innermost last.
struct IncludeStack {
    dirs: Vec<PathBuf>,
    max_depth: usize,
}

impl IncludeStack {
    fn new(root: &Path, max_depth: usize) -> Result<Self, CompileError> {
        let root = fs::canonicalize(root).map_err(|e| CompileError::io(root, e))?;
        Ok(Self {
            dirs: vec![root],
            max_depth,
        })
    }

    fn top(&self) -> &Path {
        &self.dirs[self.dirs.len() - 1]
    }

    fn push(&mut self, dir: PathBuf) -> Result<(), CompileError> {
        // The first entry is the starting directory, not an inclusion.
        if self.dirs.len() > self.max_depth {
            return Err(CompileError::IncludeDepthExceeded {
                max: self.max_depth,
            });
        }
        self.dirs.push(dir);
        Ok(())
    }

    fn pop(&mut self) {
        self.dirs.pop();
    }

    /// Replace every include directive in `text` with the expanded contents
    /// of the file it names.
    fn expand(&mut self, text: &str) -> Result<String, CompileError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in INCLUDE_RE.captures_iter(text) {
            let (Some(whole), Some(target)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&text[last..whole.start()]);
            out.push_str(&self.include(target.as_str())?);
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    fn include(&mut self, target: &str) -> Result<String, CompileError> {
        let dir = self.top().to_path_buf();
        let path = paths::canonical_path(Path::new(target), &dir)
            .map_err(|e| CompileError::io(target, e))?;
        if !path.starts_with(&dir) {
            return Err(CompileError::SandboxViolation {
                path: PathBuf::from(target),
                dir,
            });
        }
        let text = fs::read_to_string(&path).map_err(|e| CompileError::io(&path, e))?;
        debug!(path = %path.display(), depth = self.dirs.len(), "Including page");

        let child_dir = path.parent().map(Path::to_path_buf).unwrap_or(dir);
        self.push(child_dir)?;
        let expanded = self.expand(&text);
        self.pop();
        expanded
    }
}

/// Compile page text into Rust source.
///
/// Includes are resolved relative to `policy.include_root`. Imports are not
/// checked here; see [`compile_page`].
pub fn compile(source: &str, policy: &CompilePolicy) -> Result<GeneratedSource, CompileError> {
    let mut stack = IncludeStack::new(&policy.include_root, policy.max_include_depth)?;
    let expanded = stack.expand(source)?;
    let page = scan(&expanded);
    if page.top.len() > policy.max_top {
        return Err(CompileError::TooManyTopBlocks {
            count: page.top.len(),
            max: policy.max_top,
        });
    }
    Ok(assemble(&page))
}

fn assemble(page: &ParsedPage) -> GeneratedSource {
    let mut out = String::from(HEADER);
    for top in &page.top {
        out.push_str(top);
    }
    out.push('\n');
    out.push_str(BODY_BEGIN);
    for fragment in &page.body {
        fragment.render(&mut out);
    }
    out.push_str(BODY_END);
    out.push_str(TRAILER);
    GeneratedSource(out)
}

/// Compile the page in `input` (`-` for standard input) and check its
/// imports.
///
/// A page read from a file starts its include sandbox in that file's
/// directory; standard input uses `policy.include_root`.
pub fn compile_page(input: &Path, policy: &CompilePolicy) -> Result<GeneratedSource, CompileError> {
    let mut policy = policy.clone();
    let (source, page_name) = if input == Path::new("-") {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .map_err(|e| CompileError::io("<standard input>", e))?;
        (source, "<standard input>".to_string())
    } else {
        let source = fs::read_to_string(input).map_err(|e| CompileError::io(input, e))?;
        let dir = match input.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        policy.include_root = dir;
        (source, input.display().to_string())
    };

    let generated = compile(&source, &policy)?;
    imports::validate_imports(generated.as_str(), &page_name, &policy.allowed)?;
    debug!(page = %page_name, bytes = generated.as_str().len(), "Page compiled");
    Ok(generated)
}
