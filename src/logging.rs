//! Logging initialization: a console layer and an optional non-blocking file
//! layer, composed the way the teacher's tracing setup composes its layers.

use std::path::Path;

use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to install global tracing subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Guard returned by [`init`]; dropping it flushes the non-blocking file
/// writer. Holding `None` means no file layer was configured.
pub struct LoggingGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// `log_dir` mirrors the optional file-logging directory from the config
/// snapshot; when absent only the console layer is installed.
pub fn init(log_dir: Option<&Path>) -> Result<LoggingGuard, LoggingError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_target(true)
        .boxed();

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "swapgate.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(non_blocking)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(LoggingGuard(guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    // `init` installs a process-global subscriber, so only the first call in
    // this test binary can ever succeed; serialized so a parallel test run
    // doesn't race two `try_init` calls and get a nondeterministic winner.
    #[test]
    #[serial_test::serial]
    fn second_global_init_is_rejected_once_a_subscriber_is_installed() {
        let dir = tempfile::tempdir().unwrap();
        let _ = init(Some(dir.path())); // first call in the binary: may succeed or may not, depending on test order
        let second = init(None);
        assert!(second.is_err(), "a subscriber is already installed by this point in the process");
    }
}
