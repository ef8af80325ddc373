//! Gateway entry point: configuration, logging, signal handling.

use anyhow::Context as _;
use tracing::info;
use tracing_subscriber::EnvFilter;

use odin_gateway::config::LogFormat;
use odin_gateway::{Config, Gateway};

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("configuration error")?;
    init_tracing(&config);

    info!(
        addr = %config.ws_addr,
        shards = config.shard_count,
        max_connections = config.max_connections,
        kafka_brokers = %config.kafka_brokers,
        consumer_group = %config.kafka_consumer_group,
        cpu_reject = config.cpu_reject_threshold,
        cpu_pause = config.cpu_pause_threshold,
        "starting odin-gateway"
    );

    let gateway = Gateway::spawn(config).await?;

    shutdown_signal().await;
    info!("shutdown signal received");
    gateway.shutdown().await;

    Ok(())
}
