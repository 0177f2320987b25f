use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use swapgate::config::ConfigSnapshot;
use swapgate::dispatcher::run_server;
use swapgate::event::EventBus;
use swapgate::registry::Registry;

#[derive(Parser)]
#[command(name = "swapgate", about = "Model-swapping reverse proxy for inference backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the configuration, build the Registry, and serve until terminated.
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Load and validate the configuration without starting a listener.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Check { config } => {
            let _guard = swapgate::logging::init(None).expect("logging init should not fail");
            match ConfigSnapshot::load(&config) {
                Ok(_) => {
                    tracing::info!(path = %config.display(), "configuration is valid");
                }
                Err(err) => {
                    tracing::error!(path = %config.display(), error = %err, "configuration is invalid");
                    std::process::exit(1);
                }
            }
        }
        Command::Run { config, listen, log_dir } => {
            let _guard = swapgate::logging::init(log_dir.as_deref()).expect("logging init should not fail");

            let snapshot = match ConfigSnapshot::load(&config) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::error!(path = %config.display(), error = %err, "failed to load configuration");
                    std::process::exit(1);
                }
            };

            let events = Arc::new(EventBus::new());
            let registry = Registry::build_from(&snapshot, events);

            let server = match run_server(listen.clone(), registry.clone(), snapshot) {
                Ok(server) => server,
                Err(err) => {
                    tracing::error!(error = %err, "failed to start HTTP server");
                    std::process::exit(1);
                }
            };
            tracing::info!(addr = %listen, "swapgate listening");

            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            let shutdown_tx = std::sync::Mutex::new(Some(shutdown_tx));
            ctrlc::set_handler(move || {
                if let Some(tx) = shutdown_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            })
            .expect("installing a Ctrl-C handler should not fail");

            let _ = shutdown_rx.await;
            tracing::info!("shutdown signal received, draining");

            // P7: Shutdown() on the Registry terminates all child processes
            // within gracefulStopTimeout + kill-grace, regardless of state.
            for group_id in registry.iter_group_ids().await {
                if let Some(group) = registry.group(&group_id).await {
                    group.shutdown().await;
                }
            }

            if let Err(err) = server.shutdown().await {
                tracing::error!(error = %err, "error while shutting down HTTP server");
            }
        }
    }
}
