use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const ENV_LOG_FORMAT: &str = "QREPORT_LOG_FORMAT";
const LOG_FILE_PREFIX: &str = "qreport-backup.log";

/// Installs the global subscriber: stderr output filtered by `RUST_LOG`
/// (default `info`), JSON when `QREPORT_LOG_FORMAT=json`, plus a daily JSON
/// file under `log_dir` when one is given.
///
/// Keep the returned guard alive for as long as file logs should flush. A
/// subscriber that is already installed is left in place.
pub fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(ENV_LOG_FORMAT)
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let stderr_layer = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(target: "qreport", event = "logging_initialized", json);
    }
    Ok(guard)
}
