//! Command-line diagnostics for the Python addon loader.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pyloader_core::config::{defaults, env_vars, LoaderConfig};
use pyloader_core::discovery;
use pyloader_core::locator::RuntimeLocator;
use pyloader_core::module::SystemLoader;
use pyloader_core::paths;
use tracing::{debug, info, warn};

/// Python addon loader - inspect how the embedded runtime would be found.
#[derive(Parser, Debug)]
#[command(name = "pyloader")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Try every Python runtime library candidate and report each attempt.
    Locate,
    /// Print where the bridge library is expected for a loader directory.
    BridgePath {
        /// The addon loader's `lib/` directory.
        module_dir: PathBuf,
    },
    /// List the extension modules that would be imported for an app.
    Discover {
        /// Application root directory.
        app_root: PathBuf,
    },
    /// Print the effective configuration.
    Config,
    /// Find the application root above a path.
    AppRoot {
        /// Directory to start from.
        path: PathBuf,
    },
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args.command) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    // Check if JSON logging is requested
    let json_logging = std::env::var("PYLOADER_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose { "pyloader=debug" } else { "pyloader=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn run(command: Command) -> Result<()> {
    debug!(?command, "Running command");
    match command {
        Command::Locate => locate(),
        Command::BridgePath { module_dir } => bridge_path(&module_dir),
        Command::Discover { app_root } => discover(&app_root),
        Command::Config => show_config(),
        Command::AppRoot { path } => app_root(&path),
    }
}

fn locate() -> Result<()> {
    let config = LoaderConfig::from_env();
    let locator = RuntimeLocator::from_config(&config);
    let (result, report) = locator.locate_with_report(&SystemLoader);

    println!("Python Runtime Candidates");
    println!("=========================\n");
    for attempt in &report.attempts {
        match &attempt.error {
            None => println!("  [ok]   {}", attempt.candidate.path.display()),
            Some(reason) => println!("  [fail] {}\n         {}", attempt.candidate.path.display(), reason),
        }
    }
    println!();

    let located = result.context("No Python runtime library could be loaded")?;
    info!(path = %located.candidate.path.display(), origin = ?located.candidate.origin, "Python runtime located");
    println!("Using: {}", located.candidate.path.display());
    Ok(())
}

fn bridge_path(module_dir: &Path) -> Result<()> {
    let path = paths::bridge_library_path(module_dir, defaults::RUNTIME_PACKAGE)
        .with_context(|| format!("Cannot derive bridge path from {}", module_dir.display()))?;
    println!("{}", path.display());
    if !path.is_file() {
        warn!(path = %path.display(), "Bridge library not found at expected path");
    }
    Ok(())
}

fn discover(app_root: &Path) -> Result<()> {
    let root = paths::extensions_dir(app_root, defaults::NAMESPACE);
    let entries = discovery::discover(&root)
        .with_context(|| format!("Cannot list extensions of {}", app_root.display()))?;

    let mut modules: Vec<String> = entries
        .map(|descriptor| descriptor.module_name(defaults::NAMESPACE))
        .collect();
    modules.sort();

    for module in &modules {
        println!("{}", module);
    }
    if modules.is_empty() {
        warn!(root = %root.display(), "No extensions found");
    } else {
        info!(root = %root.display(), count = modules.len(), "Discovered extensions");
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let config = LoaderConfig::from_env();
    println!("{}", serde_json::to_string_pretty(&config)?);

    match config.debug.endpoint() {
        Ok(Some(endpoint)) => println!("Debugger: listening on {}:{}", endpoint.host, endpoint.port),
        Ok(None) => println!("Debugger: disabled (set {}=true)", env_vars::ENABLE_PYTHON_DEBUG),
        Err(e) => println!("Debugger: {} (debugger will not start)", e),
    }
    Ok(())
}

fn app_root(path: &Path) -> Result<()> {
    let root = paths::find_app_base_dir(path)
        .with_context(|| format!("No app found above {}", path.display()))?;
    println!("{}", root.display());
    Ok(())
}
