use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber: stdout always, plus a daily-rolling file
/// when `log_dir` is given. Keep the returned guard alive for the life of
/// the process so buffered file output is flushed.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            // No subscriber yet, so stderr is the only place to say this.
            if let Err(e) = crate::utils::ensure_dir(dir) {
                eprintln!("{:#}", e);
            }
            let appender = tracing_appender::rolling::daily(dir, "civic_proximity.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let initialised = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init();

    if initialised.is_ok() {
        tracing::info!("Logging initialized");
    }
    guard
}
