use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,sqlx::query=warn";

/// Whether a service manager (systemd) supervises the process; it stamps log lines itself.
fn under_service_manager() -> bool {
    std::env::var_os("INVOCATION_ID").is_some_and(|id| !id.is_empty())
}

/// Installs the global subscriber: human-readable stdout plus, when `log_dir`
/// is set, daily-rotated JSON files. Keep the returned guard alive until exit
/// so buffered file output is flushed.
pub fn init_logging(log_dir: Option<&str>) -> Option<WorkerGuard> {
    let omit_time = under_service_manager();

    // Default to `info,sqlx::query=warn` if RUST_LOG is not set.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stdout_layer = if omit_time {
        fmt::layer().with_writer(std::io::stdout).without_time().boxed()
    } else {
        fmt::layer().with_writer(std::io::stdout).boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, "selector.log"));
            let layer = fmt::layer().with_writer(writer).with_ansi(false).json();
            let layer = if omit_time {
                layer.without_time().boxed()
            } else {
                layer.boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}
