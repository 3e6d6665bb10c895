use kube::Client;
use mongo_sidecar::{config::Config, controller, identity};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::default();

    // Both of these are fatal: without an identity there is nothing to elect,
    // and without a cluster client there is nothing to observe.
    let host = identity::init(config.mongo_port).await?;
    info!("resolved host identity {}", host.address());
    let client = Client::try_default().await?;

    info!("starting reconcile loop with config {:?}", config);
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        if let Err(e) = controller::reconcile_tick(&client, &config).await {
            error!("reconcile failed: {}", e);
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(config.loop_sleep_seconds)) => {}
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down");
                break;
            }
        }
    }
    Ok(())
}
