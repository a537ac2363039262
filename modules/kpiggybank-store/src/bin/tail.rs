use anyhow::Result;
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kpiggybank_store::{BlobStore, StoreConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kpiggybank=info".parse()?))
        .init();

    let config = StoreConfig::from_env()?;
    let (store, already_existed) = BlobStore::open(&config).await?;
    info!(database = %config.database, already_existed, "Connected");

    match store.count().await {
        Ok(total) => info!(total, "Blobs stored"),
        Err(e) => warn!(error = %e, "Count unavailable"),
    }

    store.on_feed_error(|e| warn!(error = %e, "Change feed fault"));
    let mut changes = store.changes();

    loop {
        tokio::select! {
            change = changes.next() => {
                let Some(change) = change else { break };
                match change.blob() {
                    Some(blob) => info!(
                        seq = %change.sequence,
                        id = %change.id,
                        timestamp = ?blob.timestamp_ms(),
                        recorded_at = ?blob.recorded_at(),
                        events = blob.event_stream.len(),
                        "Blob received"
                    ),
                    None => info!(seq = %change.sequence, id = %change.id, deleted = change.deleted, "Change"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
