/*!
 * Logging and tracing initialization for the connection reservoir
 */

use std::fs::File;
use std::path::Path;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{ReservoirError, Result};

/// Initialize structured logging. Intended to be called once by the host
/// application; the reservoir itself never calls this implicitly, since a
/// library should not install a global subscriber on the caller's behalf
/// unless explicitly asked.
pub fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("conn_reservoir=info"))
        .map_err(|e| ReservoirError::Config(format!("failed to build log filter: {}", e)))?;

    match log_file {
        Some(path) => init_file_logging(path, env_filter),
        None => {
            init_stdout_logging(env_filter);
            Ok(())
        }
    }
}

fn init_stdout_logging(env_filter: EnvFilter) {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn init_file_logging(path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| ReservoirError::Config(format!("failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}

/// Initialize a test-scoped subscriber, safe to call from many tests: only
/// the first call actually installs a global subscriber.
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("conn_reservoir=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}
