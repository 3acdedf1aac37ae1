//! Logging setup for cadence.
//!
//! Log levels:
//! - ERROR: infrastructure failures that abort a run
//! - WARN: retries, skipped tasks, permanent task failures
//! - INFO: run lifecycle (prepared, started, paused, finished)
//! - DEBUG: per-task transitions and store operations
//! - TRACE: event publishing and individual record writes
//!
//! Debug mode can be enabled with the `--debug` flag or `CADENCE_DEBUG=1`.
//! `RUST_LOG`, when set, overrides both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Environment variable that turns on debug logging.
pub const DEBUG_ENV: &str = "CADENCE_DEBUG";

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Level used when `RUST_LOG` is not set.
pub fn default_level(debug: bool) -> &'static str {
    if debug || env_debug() {
        "debug"
    } else {
        "info"
    }
}

/// Path of the log file, `~/.cadence/cadence.log`.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cadence").join("cadence.log"))
}

fn open_log_file() -> Option<File> {
    let path = log_path()?;
    std::fs::create_dir_all(path.parent()?).ok()?;
    // Truncated on every start.
    File::create(path).ok()
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(debug: bool) {
    let level = default_level(debug);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match open_log_file() {
        Some(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
