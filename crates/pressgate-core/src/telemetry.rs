//! Tracing setup for the `pressgate` binary.
//!
//! Logs always go to stderr: stdout carries the CLI's machine-readable output
//! (`run --output json`, `fingerprint`) and must stay parseable.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Filter directive read before `RUST_LOG`, e.g. `pressgate_core=debug`.
pub const LOG_ENV: &str = "PRESSGATE_LOG";

/// `PRESSGATE_LOG`, then `RUST_LOG`, then `level`.
fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber. Only the first call in a process has any
/// effect.
///
/// With `json`, each line is one object whose `event` field names the run
/// lifecycle step, so CI log collectors can follow a run by `run_id`.
pub fn init_tracing(json: bool, level: Level) {
    let output = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let output = if json {
        output.json().boxed()
    } else {
        output.boxed()
    };
    tracing_subscriber::registry()
        .with(filter(level))
        .with(output)
        .try_init()
        .ok();
}
