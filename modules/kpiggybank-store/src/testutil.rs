//! Fixtures and polling helpers for tests against a live CouchDB.

use std::time::Duration;

use serde_json::json;

use crate::error::{Result, StoreError};
use crate::store::BlobStore;
use crate::types::{Blob, RangeOptions};

/// A realistic sign-in telemetry blob.
pub fn make_blob(timestamp: i64) -> Blob {
    Blob::new(timestamp)
        .with_event("picker", 732_i64)
        .with_event("picker::change", 1700_i64)
        .with_event("picker::signin", 2300_i64)
        .with_event("assertion_generation", 2500_i64)
        .with_event("certified", 3300_i64)
        .with_event("assertion_generated", 4500_i64)
        .with_event("complete", 4777_i64)
        .with_field("email_type", "secondary")
        .with_field("number_emails", 3)
        .with_field("new_account", false)
        .with_field("language", "en_US")
        .with_field("number_sites_logged_in", 1)
        .with_field("screen_size", json!({ "width": 640, "height": 480 }))
        .with_field("sample_rate", 1.0)
        .with_field(
            "user_agent",
            json!({ "os": "iOS", "browser": "Safari", "version": "5.1" }),
        )
}

/// Poll `fetch_range` at `timestamp` until exactly one row shows up.
///
/// Waits 1ms, then doubles the wait each round until it exceeds `max_wait`.
/// Query errors count as "not there yet".
pub async fn expect_eventually(store: &BlobStore, timestamp: i64, max_wait: Duration) -> Result<Blob> {
    let mut wait = Duration::from_millis(1);
    loop {
        if let Ok(mut rows) = store.fetch_range(&RangeOptions::at(timestamp)).await {
            if rows.len() == 1 && rows[0].timestamp.as_ref().and_then(|n| n.as_i64()) == Some(timestamp) {
                return Ok(rows.remove(0));
            }
        }
        if wait > max_wait {
            return Err(StoreError::Query(format!(
                "no single blob at {timestamp} within {max_wait:?}"
            )));
        }
        tokio::time::sleep(wait).await;
        wait *= 2;
    }
}

/// Poll `count` until it reaches `expected`, with the same backoff as [`expect_eventually`].
pub async fn expect_count(store: &BlobStore, expected: u64, max_wait: Duration) -> Result<u64> {
    let mut wait = Duration::from_millis(1);
    let mut last = None;
    loop {
        if let Ok(n) = store.count().await {
            if n == expected {
                return Ok(n);
            }
            last = Some(n);
        }
        if wait > max_wait {
            return Err(StoreError::Query(format!(
                "count stayed at {last:?}, expected {expected} within {max_wait:?}"
            )));
        }
        tokio::time::sleep(wait).await;
        wait *= 2;
    }
}
