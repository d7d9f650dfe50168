use clap::{Parser, Subcommand};
use monitor_selector::config::SelectorConfig;
use monitor_selector::logging::init_logging;
use monitor_selector::selector;
use monitor_selector::version::VERSION;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Assigns NTP monitors to servers", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Review servers continuously until interrupted
    Server {
        /// Port of the Prometheus metrics endpoint
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Review the servers currently due once, then exit
    Once {
        /// Port of the Prometheus metrics endpoint
        #[arg(long)]
        metrics_port: Option<u16>,
    },
}

/// Cancels `token` on Ctrl-C or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler.");
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("Shutdown signal received.");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let mut config = match SelectorConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load selector configuration: {e}");
            return Err(e.into());
        }
    };

    let (continuous, metrics_port) = match args.command {
        Command::Server { metrics_port } => (true, metrics_port),
        Command::Once { metrics_port } => (false, metrics_port),
    };
    if let Some(port) = metrics_port {
        config.metrics_port = port;
    }

    let _log_guard = init_logging(config.log_dir.as_deref());
    info!(version = VERSION, continuous, metrics_port = config.metrics_port, "Starting selector.");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if let Err(e) = selector::run(&config, continuous, cancel).await {
        error!(error = %e, "Selector failed.");
        return Err(e.into());
    }

    Ok(())
}
