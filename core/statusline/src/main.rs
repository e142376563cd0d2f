//! statusline: Claude Code status line entrypoint.
//!
//! Spawned by Claude Code on every UI refresh with the session JSON on stdin.
//! Prints exactly one line to stdout and always exits 0 in render mode: a
//! stale field is better than a broken status bar.
//!
//! ## Subcommands
//!
//! - *(none)*: Render from stdin
//! - `scan`: Scan a transcript and print the result as JSON
//! - `state list` / `state reset`: Inspect or reset scanner state
//! - `cache show`: Print the shared global cache

mod logging;
mod render;

use std::io::Read;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde_json::Value;
use statusline_core::broker::GlobalDataCache;
use statusline_core::scanner::state::StateManager;
use statusline_core::{
    Config, DataSourceRegistry, GatherContext, HealthStore, Scanner, StatuslineError, StorageConfig,
    UnifiedDataBroker,
};

#[derive(Parser)]
#[command(name = "statusline")]
#[command(about = "Claude Code status line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a transcript incrementally and print the result as JSON
    Scan {
        /// Session whose scanner state to use
        #[arg(long)]
        session_id: String,

        /// Path to the session's JSONL transcript
        #[arg(long)]
        transcript: PathBuf,
    },

    /// Inspect or reset per-session scanner state
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Inspect the shared global data cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// List sessions with persisted scanner state
    List,
    /// Delete a session's scanner state so the next scan starts over
    Reset {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print the global cache file
    Show,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] StatuslineError),

    #[error("JSON output failed: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() {
    let started = Instant::now();
    let storage = StorageConfig::default();
    let _logging_guard = logging::init(&storage);
    logging::install_panic_hook();

    let cli = Cli::parse();
    let config = Config::load(&storage);

    let result = match cli.command {
        None => {
            render(&storage, &config, started);
            Ok(())
        }
        Some(Commands::Scan {
            session_id,
            transcript,
        }) => scan(&storage, &config, &session_id, &transcript),
        Some(Commands::State { action }) => state(&storage, &config, action),
        Some(Commands::Cache {
            action: CacheAction::Show,
        }) => cache_show(&storage),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "statusline command failed");
        eprintln!("statusline: {}", e);
        std::process::exit(1);
    }
}

fn render(storage: &StorageConfig, config: &Config, started: Instant) {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        tracing::warn!(error = %e, "Failed to read stdin");
    }
    let raw = match serde_json::from_str::<Value>(input.trim()) {
        Ok(value) if value.is_object() => value,
        Ok(_) | Err(_) => {
            tracing::debug!(bytes = input.len(), "No usable host input");
            println!("{}", render::FALLBACK_LINE);
            return;
        }
    };

    let registry = match DataSourceRegistry::builtin(config) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build data source registry");
            println!("{}", render::FALLBACK_LINE);
            return;
        }
    };

    let ctx = GatherContext::from_host_input(raw, storage, config)
        .with_deadline(started + config.deadline());
    let health = UnifiedDataBroker::new(registry, storage.clone()).gather_all(ctx);

    if let Err(e) = HealthStore::new(storage.clone()).save(&health) {
        tracing::warn!(session = %health.session_id, error = %e, "Failed to save health record");
    }
    println!("{}", render::render_line(&health));
}

fn scan(
    storage: &StorageConfig,
    config: &Config,
    session_id: &str,
    transcript: &std::path::Path,
) -> Result<(), CliError> {
    let result = Scanner::new(storage.clone(), config).scan(session_id, transcript)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn state(storage: &StorageConfig, config: &Config, action: StateAction) -> Result<(), CliError> {
    match action {
        StateAction::List => {
            for session_id in StateManager::new(storage.clone()).list() {
                println!("{}", session_id);
            }
        }
        StateAction::Reset { session_id } => {
            Scanner::new(storage.clone(), config).reset(&session_id)?;
            println!("Reset scanner state for {}", session_id);
        }
    }
    Ok(())
}

fn cache_show(storage: &StorageConfig) -> Result<(), CliError> {
    let cache = GlobalDataCache::new(storage);
    println!("{}", serde_json::to_string_pretty(&cache.read())?);
    Ok(())
}
