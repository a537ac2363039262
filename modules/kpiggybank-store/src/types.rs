//! Wire shapes: blobs as stored in CouchDB, range options, change events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::error::{Result, StoreError};

/// One `[label, offset_ms]` marker in a blob's `event_stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMarker(pub String, pub Number);

impl EventMarker {
    pub fn new(label: impl Into<String>, offset_ms: impl Into<Number>) -> Self {
        Self(label.into(), offset_ms.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }

    pub fn offset_ms(&self) -> Option<f64> {
        self.1.as_f64()
    }
}

/// A timestamped telemetry record.
///
/// `timestamp` is optional in the type so that incoming documents can be
/// represented before validation; the store refuses to persist a blob
/// without one. Every field not named here is kept verbatim in `fields`.
/// A `null` or malformed `event_stream` reads as empty, and markers that are
/// not `[label, offset]` pairs are dropped.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Number>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "lenient_event_stream"
    )]
    pub event_stream: Vec<EventMarker>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Blob {
    pub fn new(timestamp: impl Into<Number>) -> Self {
        Self {
            timestamp: Some(timestamp.into()),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, label: impl Into<String>, offset_ms: impl Into<Number>) -> Self {
        self.event_stream.push(EventMarker::new(label, offset_ms));
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Timestamp in milliseconds since the epoch.
    pub fn timestamp_ms(&self) -> Option<f64> {
        self.timestamp.as_ref().and_then(Number::as_f64)
    }

    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        let ms = self.timestamp.as_ref()?.as_i64()?;
        DateTime::from_timestamp_millis(ms)
    }

    /// Rejects blobs that must never reach the database.
    pub fn validate(&self) -> Result<()> {
        match self.timestamp_ms() {
            Some(ts) if ts.is_finite() => Ok(()),
            Some(_) => Err(StoreError::Validation("timestamp must be a finite number".into())),
            None => Err(StoreError::Validation(
                "At a minimum, a timestamp is required".into(),
            )),
        }
    }
}

fn lenient_event_stream<'de, D>(deserializer: D) -> std::result::Result<Vec<EventMarker>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        Value::Null => return Ok(Vec::new()),
        other => {
            warn!(event_stream = %other, "Ignoring event_stream that is not a list");
            return Ok(Vec::new());
        }
    };

    let total = items.len();
    let markers: Vec<EventMarker> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    if markers.len() != total {
        warn!(dropped = total - markers.len(), total, "Dropped malformed event markers");
    }
    Ok(markers)
}

/// What `save_many` was handed. The caller picks the variant; nothing is inferred.
#[derive(Debug, Clone)]
pub enum BlobInput {
    Single(Blob),
    Many(Vec<Blob>),
}

impl BlobInput {
    pub fn len(&self) -> usize {
        match self {
            BlobInput::Single(_) => 1,
            BlobInput::Many(blobs) => blobs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Blob> for BlobInput {
    fn from(blob: Blob) -> Self {
        BlobInput::Single(blob)
    }
}

impl From<Vec<Blob>> for BlobInput {
    fn from(blobs: Vec<Blob>) -> Self {
        BlobInput::Many(blobs)
    }
}

/// CouchDB's answer to a successful document write.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SaveReceipt {
    pub id: String,
    pub rev: String,
}

/// Options for a timestamp range scan. Bounds are inclusive; a missing bound is open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeOptions {
    pub start_key: Option<Number>,
    pub end_key: Option<Number>,
    pub limit: Option<u32>,
    pub descending: bool,
}

impl RangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both bounds at the same timestamp.
    pub fn at(timestamp: impl Into<Number>) -> Self {
        let ts = timestamp.into();
        Self {
            start_key: Some(ts.clone()),
            end_key: Some(ts),
            ..Self::default()
        }
    }

    pub fn start_key(mut self, key: impl Into<Number>) -> Self {
        self.start_key = Some(key.into());
        self
    }

    pub fn end_key(mut self, key: impl Into<Number>) -> Self {
        self.end_key = Some(key.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    /// View query parameters. CouchDB walks a descending view from `startkey`
    /// down to `endkey`, so the bounds are swapped to keep them meaning
    /// lower and upper.
    pub(crate) fn to_query(&self) -> Vec<(&'static str, String)> {
        let (lower, upper) = if self.descending {
            ("endkey", "startkey")
        } else {
            ("startkey", "endkey")
        };

        let mut params = Vec::new();
        if let Some(ref key) = self.start_key {
            params.push((lower, key.to_string()));
        }
        if let Some(ref key) = self.end_key {
            params.push((upper, key.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        if self.descending {
            params.push(("descending", "true".to_string()));
        }
        params
    }
}

/// Position in the change feed. CouchDB 1.x hands out integers, 2.x+ opaque tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seq {
    Number(u64),
    Token(String),
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seq::Number(n) => write!(f, "{n}"),
            Seq::Token(t) => f.write_str(t),
        }
    }
}

/// One committed mutation observed on the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "seq")]
    pub sequence: Seq,
    pub id: String,
    #[serde(rename = "doc", default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl ChangeEvent {
    pub fn is_design(&self) -> bool {
        self.id.starts_with("_design/")
    }

    /// Decode the included document as a blob. Deletions and design documents yield `None`.
    pub fn blob(&self) -> Option<Blob> {
        if self.deleted || self.is_design() {
            return None;
        }
        let doc = self.document.clone()?;
        serde_json::from_value(doc).ok()
    }
}
