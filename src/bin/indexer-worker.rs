use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use log::{error, info};
use tokio::signal;
use tokio::sync::watch;

use indexer_harness::worker::{load_runner_config, IndexerRunner};

/// Wait for shutdown signal (CTRL+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let matches = Command::new("indexer-worker")
        .version("0.1.0")
        .about("Indexer worker - streams gateway events into storage for one run")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("run-id")
                .long("run-id")
                .value_name("ID")
                .help("Run identity namespacing checkpoints and documents"),
        )
        .arg(
            Arg::new("gateway")
                .long("gateway")
                .value_name("URL")
                .help("Event gateway gRPC endpoint"),
        )
        .arg(
            Arg::new("storage")
                .long("storage")
                .value_name("URL")
                .help("PostgreSQL connection string"),
        )
        .arg(
            Arg::new("network")
                .long("network")
                .value_name("URL")
                .help("Network node RPC endpoint"),
        )
        .arg(
            Arg::new("filters")
                .long("filters")
                .value_name("JSON")
                .help("JSON array of {address, name} event filters"),
        )
        .arg(
            Arg::new("handler")
                .long("handler")
                .value_name("NAME")
                .help("Batch handler (store_events, checkpoint_only)"),
        )
        .arg(
            Arg::new("pool-size")
                .long("pool-size")
                .value_name("NUMBER")
                .help("Storage connection pool size"),
        )
        .arg(
            Arg::new("reconnect-backoff-ms")
                .long("reconnect-backoff-ms")
                .value_name("MILLIS")
                .help("Initial delay before reconnecting to the gateway"),
        )
        .arg(
            Arg::new("reset-state")
                .long("reset-state")
                .help("Drop stored state of this run before indexing")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("run-migrations")
                .long("run-migrations")
                .help("Apply storage migrations before indexing")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = load_runner_config(config_path, &matches)?;
    log::debug!("Runner config: {config:?}");

    let runner = IndexerRunner::from_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run_id = runner.run_id().clone();
    let mut runner_task = tokio::spawn(runner.run(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            runner_task.await??;
        }
        result = &mut runner_task => {
            result??;
        }
    }

    info!("Indexer worker for run {run_id} shut down");
    Ok(())
}
