use std::env;

use rheomesh_forward::config::WorkerConfig;
use rheomesh_forward::worker::Worker;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), rheomesh_forward::error::Error> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rheomesh_forward=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match env::var("WORKER_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(path)?;
            WorkerConfig::from_json(&json)?
        }
        Err(_) => WorkerConfig::default(),
    };

    let worker = Worker::new(config);
    let addrs = worker.listen_range().await?;
    tracing::info!("listening on {:?}", addrs);

    tokio::signal::ctrl_c().await?;
    worker.close().await;
    Ok(())
}
