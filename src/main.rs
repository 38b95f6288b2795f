//! Gateway application entry point.

use clap::Parser;
use cog_debug::config::Settings;
use cog_debug::rpc::dispatcher::{BackendFactory, Dispatcher};
use cog_debug::rpc::server;
use cog_debug::sandbox::SandboxPolicy;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project directory: settings lookup, sandbox scope and the base for
    /// relative paths in tool calls. Defaults to the working directory.
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Extra directories debuggees may write (repeatable). `/tmp` is
    /// always writable.
    #[arg(long = "allow-write")]
    allow_write: Vec<PathBuf>,
}

fn main() {
    cog_debug::log::init();
    let args = Args::parse();

    let project_dir = match args.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir().expect("working directory is accessible"),
    };

    let settings = Settings::load(&project_dir);
    let mut sandbox = SandboxPolicy::new(project_dir.clone());
    for path in args.allow_write {
        sandbox = sandbox.allow_write(path);
    }

    let factory = BackendFactory::new(settings, sandbox);
    let mut dispatcher = Dispatcher::new(Box::new(factory), project_dir);

    match server::serve(&mut dispatcher) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!(target: "gateway", "unrecoverable dispatcher error: {e:#}");
            std::process::exit(1);
        }
    }
}
