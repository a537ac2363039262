//! Validated ingestion, range and count queries, and change subscriptions
//! over one CouchDB database.
//!
//! Writes become visible in the views and on the change relay eventually,
//! never synchronously with `save` returning.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::barrier;
use crate::bootstrap::bootstrap;
use crate::client::CouchClient;
use crate::config::StoreConfig;
use crate::design::{ALL_VIEW, COUNT_VIEW, DESIGN_NAME};
use crate::error::{Result, StoreError};
use crate::relay::{ChangeRelay, ChangeStream, RelayState, SubscriptionId};
use crate::types::{Blob, BlobInput, ChangeEvent, RangeOptions, SaveReceipt};

/// Handle to an open blob store. Cheap to clone; the change relay stops when
/// the last clone is dropped.
#[derive(Clone)]
pub struct BlobStore {
    client: CouchClient,
    relay: Arc<ChangeRelay>,
}

impl BlobStore {
    /// Bootstrap the database and start the change relay.
    ///
    /// Returns the store and whether the database already existed. Nothing is
    /// usable if this fails.
    pub async fn open(config: &StoreConfig) -> Result<(Self, bool)> {
        let client = CouchClient::new(config)?;
        Self::open_with(client).await
    }

    pub async fn open_with(client: CouchClient) -> Result<(Self, bool)> {
        let already_existed = bootstrap(&client).await?;

        let relay = Arc::new(ChangeRelay::new());
        relay.start(client.clone()).await?;

        info!(
            database = client.database(),
            already_existed, "Blob store open"
        );
        Ok((Self { client, relay }, already_existed))
    }

    pub fn client(&self) -> &CouchClient {
        &self.client
    }

    /// Persist one blob. Rejected without any I/O when it has no numeric timestamp.
    pub async fn save(&self, blob: &Blob) -> Result<SaveReceipt> {
        save_blob(&self.client, blob).await
    }

    /// Persist one blob or a batch.
    ///
    /// A batch is validated up front, then every element is written
    /// concurrently. The call resolves once all writes have finished; the
    /// first failure is the result even though sibling writes may have
    /// succeeded server-side. Receipts come back in input order.
    pub async fn save_many(&self, input: impl Into<BlobInput>) -> Result<Vec<SaveReceipt>> {
        match input.into() {
            BlobInput::Single(blob) => Ok(vec![self.save(&blob).await?]),
            BlobInput::Many(blobs) => {
                for (i, blob) in blobs.iter().enumerate() {
                    blob.validate().map_err(|e| match e {
                        StoreError::Validation(msg) => {
                            StoreError::Validation(format!("blob {i} of {}: {msg}", blobs.len()))
                        }
                        other => other,
                    })?;
                }

                debug!(count = blobs.len(), "Saving batch");
                let writes = blobs
                    .into_iter()
                    .map(|blob| {
                        let client = self.client.clone();
                        async move { save_blob(&client, &blob).await }
                    })
                    .collect();
                barrier::join_all(writes).await
            }
        }
    }

    /// Blobs in the `all` view between the given timestamps, ordered by timestamp.
    pub async fn fetch_range(&self, options: &RangeOptions) -> Result<Vec<Blob>> {
        let params = options.to_query();
        let resp = self
            .client
            .query_view::<Blob>(DESIGN_NAME, ALL_VIEW, &params)
            .await
            .map_err(query_error)?;

        debug!(rows = resp.rows.len(), ?params, "Fetched range");
        Ok(resp.rows.into_iter().map(|row| row.value).collect())
    }

    /// Total number of stored documents according to the `count` view.
    pub async fn count(&self) -> Result<u64> {
        let resp = self
            .client
            .query_view::<Value>(DESIGN_NAME, COUNT_VIEW, &[])
            .await
            .map_err(query_error)?;

        match resp.rows.first() {
            None => Ok(0),
            Some(row) => row.value.as_u64().ok_or_else(|| {
                StoreError::Query(format!("count view returned a non-integer total: {}", row.value))
            }),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.relay.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.relay.unsubscribe(id)
    }

    pub fn on_feed_error(&self, handler: impl Fn(&StoreError) + Send + Sync + 'static) -> SubscriptionId {
        self.relay.on_feed_error(handler)
    }

    pub fn changes(&self) -> ChangeStream {
        self.relay.changes()
    }

    pub fn relay_state(&self) -> RelayState {
        self.relay.state()
    }
}

async fn save_blob(client: &CouchClient, blob: &Blob) -> Result<SaveReceipt> {
    blob.validate()?;
    let receipt = client.post_document(blob).await?;
    debug!(id = %receipt.id, rev = %receipt.rev, "Blob saved");
    Ok(receipt)
}

fn query_error(err: StoreError) -> StoreError {
    match err {
        StoreError::Api { status, message } => {
            StoreError::Query(format!("view query failed (status {status}): {message}"))
        }
        StoreError::Parse(msg) => StoreError::Query(format!("unreadable view result: {msg}")),
        other => other,
    }
}
