//! flix-bridge CLI - drives the bridge from the command line.
//!
//! Each invocation starts one worker, opens the given files as documents,
//! runs a single command against them and shuts the worker down.
//!
//! ```text
//! main() -> FlixBridge::start(config) -> add_document(..) per file
//!                                          |
//!                                          v
//!                         version | check | run | test | bench
//! ```

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use url::Url;

use flix_bridge::{BridgeEvent, FlixBridge, JobPayload, NotifyLevel, ProgressPhase};
use flix_bridge_config::FlixConfig;

/// Run Flix compiler commands through the bridge's job queue
#[derive(Parser)]
#[command(name = "flix-bridge")]
#[command(version)]
#[command(about = "Run Flix compiler commands through the bridge's job queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the worker's Flix version
    Version,
    /// Check files and print their diagnostics
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run the program's entry point
    Run {
        /// Fully qualified entry point (default: main)
        #[arg(long)]
        entrypoint: Option<String>,
        /// Arguments passed to the program as one string
        #[arg(long, allow_hyphen_values = true)]
        args: Option<String>,
        files: Vec<PathBuf>,
    },
    /// Run tests, optionally only those named
    Test {
        /// Test name to run; repeat for several
        #[arg(long = "filter")]
        filters: Vec<String>,
        files: Vec<PathBuf>,
    },
    /// Run benchmarks
    Bench { files: Vec<PathBuf> },
}

impl Commands {
    fn files(&self) -> &[PathBuf] {
        match self {
            Commands::Version => &[],
            Commands::Check { files }
            | Commands::Run { files, .. }
            | Commands::Test { files, .. }
            | Commands::Bench { files } => files,
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No writable log file: fall back to stderr so stdout stays clean for results.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: next to the config file, ~/.flix-bridge/logs/flix-bridge.log
    if let Some(config_path) = FlixConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("flix-bridge.log"));
    }

    candidates.push(PathBuf::from(".flix-bridge").join("logs").join("flix-bridge.log"));

    candidates
}

/// `file://` URI for a source file on disk.
fn file_uri(path: &Path) -> Result<Url> {
    let absolute = fs::canonicalize(path).with_context(|| format!("resolving {}", path.display()))?;
    Url::from_file_path(&absolute).map_err(|()| anyhow!("{} is not a valid file path", absolute.display()))
}

/// Opens every file as a document. Returns how each URI should be displayed.
async fn open_documents(bridge: &FlixBridge, files: &[PathBuf]) -> Result<HashMap<String, String>> {
    let mut locations = HashMap::new();
    for path in files {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let uri = file_uri(path)?.to_string();
        bridge.add_document(&uri, &text);
        locations.insert(uri, path.display().to_string());
    }
    Ok(locations)
}

/// Mirror user-visible events onto stderr while a command runs.
fn spawn_event_printer(mut events: mpsc::UnboundedReceiver<BridgeEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BridgeEvent::Notify {
                    level: NotifyLevel::Error,
                    message,
                } => eprintln!("error: {message}"),
                BridgeEvent::Notify {
                    level: NotifyLevel::Info,
                    message,
                } => eprintln!("{message}"),
                BridgeEvent::Progress {
                    title,
                    phase: ProgressPhase::Started,
                } => eprintln!("{title}..."),
                BridgeEvent::Progress {
                    title,
                    phase: ProgressPhase::TimedOut,
                } => eprintln!("{title}: gave up waiting"),
                BridgeEvent::WorkerState(state) => tracing::debug!(%state, "Worker state"),
                _ => {}
            }
        }
    });
}

fn print_result(result: &Value) {
    match result {
        Value::Null => {}
        Value::String(text) => println!("{text}"),
        other => println!("{other:#}"),
    }
}

/// Check all open documents and print what the worker found.
async fn check(bridge: &FlixBridge, locations: &HashMap<String, String>) -> Result<ExitCode> {
    bridge
        .submit(JobPayload::Check { uri: None })
        .wait()
        .await
        .context("check failed")?;

    let snapshot = bridge.diagnostics().await;
    for (uri, items) in snapshot.files() {
        let location = locations.get(uri).map_or(uri.as_str(), String::as_str);
        for diagnostic in items {
            println!("{}", diagnostic.display_with_location(location));
        }
    }
    if snapshot.error_count() > 0 {
        eprintln!("{}", snapshot.status_string());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(bridge: &FlixBridge, command: Commands) -> Result<ExitCode> {
    let locations = open_documents(bridge, command.files()).await?;

    let result = match command {
        Commands::Version => {
            return Ok(match bridge.version().await {
                Some(version) => {
                    println!("{version}");
                    ExitCode::SUCCESS
                }
                None => ExitCode::FAILURE,
            });
        }
        Commands::Check { .. } => return check(bridge, &locations).await,
        Commands::Run {
            entrypoint, args, ..
        } => bridge.run_main(entrypoint.as_deref(), args.as_deref()).await,
        Commands::Test { filters, .. } => bridge.run_tests(filters.as_slice()).await,
        Commands::Bench { .. } => bridge.run_benchmarks().await,
    };

    match result {
        Ok(value) => {
            print_result(&value);
            Ok(ExitCode::SUCCESS)
        }
        // Already reported through the event printer.
        Err(e) => {
            tracing::info!("Command failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = FlixConfig::load();
    let level = config
        .as_ref()
        .ok()
        .and_then(Option::as_ref)
        .and_then(|c| c.log.level.as_deref());
    init_tracing(level);

    let config = match config {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(ExitCode::from(2));
        }
    };

    let (bridge, events) = FlixBridge::start(config.bridge);
    spawn_event_printer(events);

    let outcome = run(&bridge, cli.command).await;
    bridge.shutdown().await;
    outcome
}
