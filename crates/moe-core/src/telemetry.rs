//! Tracing initialisation for the tracker binary.
//!
//! Call [`init_tracing`] once at program start. Subsequent calls are
//! ignored (the global subscriber can only be set once per process).

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Storage engine internals are chatty at `info`; keep them at `warn`
/// unless `RUST_LOG` says otherwise.
const QUIET_DEPENDENCIES: &str = "surrealdb=warn,surrealkv=warn,hyper=warn,reqwest=warn";

/// Default filter for a given verbosity.
pub fn default_filter(level: Level) -> String {
    format!("{},{}", level.as_str().to_lowercase(), QUIET_DEPENDENCIES)
}

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
///
/// Logs go to stderr so stdout stays free for snapshot output.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
