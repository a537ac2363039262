use tracing::{info, warn};

use crate::client::CouchClient;
use crate::design::{DesignDocument, DESIGN_ID, DESIGN_VERSION};
use crate::error::{Result, StoreError};

const STATUS_CONFLICT: u16 = 409;
const STATUS_PRECONDITION_FAILED: u16 = 412;

/// Ensure the database and its design document exist.
///
/// Returns `true` when the database was already there, in which case nothing
/// is written. A fresh database gets both views in a single design document
/// write. Losing a creation race to another bootstrapper counts as "already
/// existed"; whoever created the database owns the design document.
pub async fn bootstrap(client: &CouchClient) -> Result<bool> {
    let db = client.database();

    let exists = client
        .database_exists()
        .await
        .map_err(|e| match e {
            StoreError::Api { status, message } => {
                StoreError::Bootstrap(format!("checking database {db} (status {status}): {message}"))
            }
            other => other,
        })?;

    if exists {
        info!(database = db, "Database already exists, leaving indexes untouched");
        report_version_drift(client).await;
        return Ok(true);
    }

    match client.create_database().await {
        Ok(()) => info!(database = db, "Database created"),
        Err(e) if e.status() == Some(STATUS_PRECONDITION_FAILED) => {
            warn!(database = db, "Database created concurrently by another process");
            return Ok(true);
        }
        Err(e) => {
            return Err(StoreError::Bootstrap(format!("creating database {db}: {e}")));
        }
    }

    match client.put_document(DESIGN_ID, &DesignDocument::current()).await {
        Ok(receipt) => {
            info!(database = db, rev = %receipt.rev, version = DESIGN_VERSION, "Index definitions created");
        }
        Err(e) if e.status() == Some(STATUS_CONFLICT) => {
            warn!(database = db, "Index definitions already written by another process");
        }
        Err(e) => {
            return Err(StoreError::Bootstrap(format!("creating index definitions in {db}: {e}")));
        }
    }

    Ok(false)
}

/// Version recorded in the installed design document, if any.
pub async fn installed_design_version(client: &CouchClient) -> Result<Option<u32>> {
    let doc: Option<DesignDocument> = client.get_document(DESIGN_ID).await?;
    Ok(doc.and_then(|d| d.version))
}

/// Overwrite the installed index definitions with the current ones.
///
/// CouchDB rebuilds the views lazily on the next query. This is the only path
/// that replaces an existing design document.
pub async fn rebuild_indexes(client: &CouchClient) -> Result<()> {
    let existing: Option<DesignDocument> = client
        .get_document(DESIGN_ID)
        .await
        .map_err(|e| StoreError::Bootstrap(format!("reading index definitions: {e}")))?;

    let mut doc = DesignDocument::current();
    doc.rev = existing.and_then(|d| d.rev);

    let receipt = client
        .put_document(DESIGN_ID, &doc)
        .await
        .map_err(|e| StoreError::Bootstrap(format!("rebuilding index definitions: {e}")))?;

    info!(
        database = client.database(),
        rev = %receipt.rev,
        version = DESIGN_VERSION,
        "Index definitions rebuilt"
    );
    Ok(())
}

async fn report_version_drift(client: &CouchClient) {
    match installed_design_version(client).await {
        Ok(Some(v)) if v == DESIGN_VERSION => {}
        Ok(Some(v)) => warn!(
            installed = v,
            expected = DESIGN_VERSION,
            "Index definitions are out of date; run rebuild_indexes to replace them"
        ),
        Ok(None) => warn!(
            database = client.database(),
            "Database has no versioned index definitions"
        ),
        Err(e) => warn!(error = %e, "Could not read installed index definitions (non-fatal)"),
    }
}
