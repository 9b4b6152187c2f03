//! Server pages compiled to Rust.
//!
//! A server page mixes literal text with `<?go:...?>` directives holding Rust
//! code. [`compiler::compile_page`] turns a page into a Rust program whose
//! `main` hands the page to [`serve_main`]; the resulting executable answers
//! JSON requests from a web-server module over a Unix-domain socket, or
//! handles a single request from a file.

#[cfg(not(unix))]
compile_error!("gosp needs Unix-domain sockets.");

pub mod client;
pub mod command;
pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod imports;
pub mod metadata;
pub mod page;
pub mod paths;
pub mod server;
pub mod state;

pub use page::{
    finalize_page, print, write_text, KeyValue, Metadata, PageContext, PageGenerator,
    RequestData, ServiceRequest, Writer,
};

use clap::Parser;
use config::{ServerArgs, ServerConfig};
use server::Shutdown;
use std::process::exit;
use std::sync::Arc;

/// Install the log subscriber. Logs go to standard error, which stays open
/// when a socket server gives up its standard output.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init();
}

/// Entry point of a compiled page: parse the command line and serve
/// `generator` until done.
pub fn serve_main<G: PageGenerator>(generator: G) {
    let args = ServerArgs::parse();
    init_logging();
    run_page_server(args.options.config(), Arc::new(generator));
}

/// Serve `generator` with `config`, then exit the process.
pub fn run_page_server(config: ServerConfig, generator: Arc<dyn PageGenerator>) -> ! {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: start runtime: {}", e);
            exit(1);
        }
    };
    match runtime.block_on(server::run(config, generator)) {
        Ok(Some(Shutdown::Idle)) => tracing::info!("Exiting after idle timeout"),
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    }
    // Pages still running after an idle timeout are abandoned.
    exit(0);
}
