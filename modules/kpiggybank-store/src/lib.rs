//! Telemetry blob store on CouchDB.
//!
//! Bootstraps a database with two derived indexes (`all` by timestamp and a
//! `count` aggregate), validates and writes blobs, answers range and count
//! queries, and relays committed changes to local subscribers.

pub mod barrier;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod design;
pub mod error;
pub mod relay;
pub mod store;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use bootstrap::{bootstrap, installed_design_version, rebuild_indexes};
pub use client::CouchClient;
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use relay::{ChangeRelay, ChangeStream, RelayState, SubscriptionId};
pub use store::BlobStore;
pub use types::{Blob, BlobInput, ChangeEvent, EventMarker, RangeOptions, SaveReceipt, Seq};
