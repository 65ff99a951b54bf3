use std::path::Path;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "tankwatch-hub";

/// Keeps the file writer thread alive; buffered lines are flushed on drop.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// `RUST_LOG` always wins; this only picks the fallback directive.
pub fn default_directive(log_level: Option<String>, debug: bool) -> String {
    match log_level.filter(|level| !level.trim().is_empty()) {
        Some(level) => level,
        None if debug => "debug".to_string(),
        None => "info".to_string(),
    }
}

fn file_appender(dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
}

pub fn init_logging(debug: bool, log_dir: Option<&Path>) -> LogGuard {
    let directive = default_directive(std::env::var("TANKWATCH_LOG_LEVEL").ok(), debug);
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

    let mut guard = None;
    let file_layer = match log_dir.map(file_appender) {
        Some(Ok(appender)) => {
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard = Some(worker);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(filter()),
            )
        }
        Some(Err(err)) => {
            eprintln!("log_file_error: {err}");
            None
        }
        None => None,
    };

    let console = tracing_subscriber::fmt::layer().with_filter(filter());
    if let Err(err) = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
    {
        eprintln!("log_init_error: {err}");
    }
    LogGuard { _file: guard }
}
