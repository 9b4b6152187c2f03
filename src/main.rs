//! gosp - compile server pages and talk to page servers.
//!
//! Usage:
//!   gosp compile [--allowed LIST] [-o OUT] PAGE     # Page to Rust source
//!   gosp serve --socket S -- <program> [args]        # Serve a program's output
//!   gosp status --socket S                           # Ask a server for its pid
//!   gosp stop --socket S                             # Shut a server down
//!   gosp request --socket S REQUEST.json             # Send one request

use clap::{Parser, Subcommand};
use gosp::command::CommandGenerator;
use gosp::compiler::{self, CompilePolicy, DEFAULT_MAX_INCLUDE_DEPTH, DEFAULT_MAX_TOP};
use gosp::config::ServerOptions;
use gosp::imports::ImportAllowList;
use gosp::ServiceRequest;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gosp", version)]
#[command(about = "Compile server pages to Rust and manage page servers")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a server page to Rust source
    Compile {
        /// Maximum number of go:top blocks
        #[arg(short = 't', long, default_value_t = DEFAULT_MAX_TOP)]
        max_top: usize,

        /// Comma-separated crates the page may use ("ALL" and "NONE" are special)
        #[arg(short = 'a', long, default_value = "ALL")]
        allowed: String,

        /// Maximum nesting of go:include directives
        #[arg(long, default_value_t = DEFAULT_MAX_INCLUDE_DEPTH)]
        max_include_depth: usize,

        /// Output file ("-" for standard output)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Input page ("-" for standard input)
        #[arg(default_value = "-")]
        input: PathBuf,
    },

    /// Serve the output of an external program as a page
    Serve {
        #[command(flatten)]
        server: ServerOptions,

        /// Program and arguments to run per request
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Ask a page server for its process ID
    Status {
        /// Socket the server listens on
        #[arg(long)]
        socket: PathBuf,
    },

    /// Tell a page server to finish its requests and exit
    Stop {
        /// Socket the server listens on
        #[arg(long)]
        socket: PathBuf,
    },

    /// Send a JSON request to a page server and print the response
    Request {
        /// Socket the server listens on
        #[arg(long)]
        socket: PathBuf,

        /// File holding the request ("-" for standard input)
        #[arg(default_value = "-")]
        file: PathBuf,
    },
}

fn main() {
    let args = Args::parse();
    gosp::init_logging();

    match args.command {
        Commands::Compile {
            max_top,
            allowed,
            max_include_depth,
            output,
            input,
        } => {
            if let Err(e) = compile(&input, &output, max_top, &allowed, max_include_depth) {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Serve { server, command } => {
            let Some(generator) = CommandGenerator::from_command_line(&command) else {
                eprintln!("Error: No command specified");
                exit(1);
            };
            gosp::run_page_server(server.config(), Arc::new(generator));
        }
        Commands::Status { socket } => {
            let runtime = runtime();
            match runtime.block_on(gosp::client::query_pid(&socket)) {
                Ok(pid) => println!("{}", pid),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
        Commands::Stop { socket } => {
            let runtime = runtime();
            match runtime.block_on(gosp::client::terminate(&socket)) {
                Ok(pid) => info!(pid, "Page server is shutting down"),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
        Commands::Request { socket, file } => {
            let runtime = runtime();
            let result = read_input(&file)
                .and_then(|text| serde_json::from_slice::<ServiceRequest>(&text).map_err(|e| e.to_string()))
                .and_then(|request| {
                    runtime
                        .block_on(gosp::client::send_request(&socket, &request))
                        .map_err(|e| e.to_string())
                })
                .and_then(|reply| std::io::stdout().write_all(&reply).map_err(|e| e.to_string()));
            if let Err(e) = result {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
    }
}

fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: start runtime: {}", e);
            exit(1);
        }
    }
}

fn compile(
    input: &Path,
    output: &Path,
    max_top: usize,
    allowed: &str,
    max_include_depth: usize,
) -> Result<(), String> {
    let cwd = std::env::current_dir().map_err(|e| format!("current directory: {}", e))?;
    let mut policy = CompilePolicy::new(cwd);
    policy.max_top = max_top;
    policy.max_include_depth = max_include_depth;
    policy.allowed = allowed
        .parse::<ImportAllowList>()
        .map_err(|e| e.to_string())?;

    let source = compiler::compile_page(input, &policy).map_err(|e| e.to_string())?;
    info!(input = %input.display(), bytes = source.as_str().len(), "Compiled page");

    if output == Path::new("-") {
        std::io::stdout()
            .write_all(source.as_str().as_bytes())
            .map_err(|e| format!("write output: {}", e))
    } else {
        std::fs::write(output, source.as_str())
            .map_err(|e| format!("{}: {}", output.display(), e))
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>, String> {
    if path == Path::new("-") {
        let mut text = Vec::new();
        std::io::Read::read_to_end(&mut std::io::stdin(), &mut text)
            .map_err(|e| format!("read standard input: {}", e))?;
        Ok(text)
    } else {
        std::fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))
    }
}
