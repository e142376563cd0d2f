//! File logging for the status line binary.
//!
//! stdout belongs to the host (it is the rendered line) and stderr may be
//! surfaced in the UI, so all diagnostics go to a daily file under
//! `<root>/logs/`. `STATUSLINE_LOG` takes an `EnvFilter` directive;
//! `STATUSLINE_DEBUG_LOG=1` forces `debug`.

use std::env;

use statusline_core::StorageConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "STATUSLINE_LOG";
const DEBUG_ENV: &str = "STATUSLINE_DEBUG_LOG";

fn debug_forced() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn filter() -> EnvFilter {
    if debug_forced() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. Keep the guard alive until exit so
/// buffered lines are flushed. Returns `None` when the log dir is unusable;
/// the status line still renders without logs.
pub fn init(storage: &StorageConfig) -> Option<WorkerGuard> {
    let dir = storage.logs_dir();
    fs_err::create_dir_all(&dir).ok()?;

    let appender = tracing_appender::rolling::daily(&dir, "statusline.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .ok()?;

    Some(guard)
}

/// Routes panic messages to the log instead of the host's stderr.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "Panic");
    }));
}
