//! Declarative index definitions and the design document that carries them.
//!
//! The views are written once, when a database is first created. Changing a
//! definition here means bumping [`DESIGN_VERSION`] and running
//! [`crate::bootstrap::rebuild_indexes`] against existing databases; bootstrap
//! never overwrites what is already installed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const DESIGN_NAME: &str = "data";
pub const DESIGN_ID: &str = "_design/data";
pub const DESIGN_VERSION: u32 = 1;

pub const ALL_VIEW: &str = "all";
pub const COUNT_VIEW: &str = "count";

/// One derived index: a map step and an optional reduce step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: &'static str,
    pub map: &'static str,
    pub reduce: Option<&'static str>,
}

/// Blobs keyed by timestamp, for ordered range scans.
pub const ALL_INDEX: IndexDefinition = IndexDefinition {
    name: ALL_VIEW,
    map: "function (doc) { if (typeof doc.timestamp === 'number') { emit(doc.timestamp, doc); } }",
    reduce: None,
};

/// One row per document, summed.
pub const COUNT_INDEX: IndexDefinition = IndexDefinition {
    name: COUNT_VIEW,
    map: "function (doc) { emit(doc._id, 1); }",
    reduce: Some("_sum"),
};

pub const INDEXES: [IndexDefinition; 2] = [ALL_INDEX, COUNT_INDEX];

/// The `_design/data` document as stored in CouchDB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub views: Map<String, Value>,
}

impl DesignDocument {
    /// The document built from the current definitions.
    pub fn current() -> Self {
        let views = INDEXES
            .iter()
            .map(|index| {
                let mut view = json!({ "map": index.map });
                if let Some(reduce) = index.reduce {
                    view["reduce"] = Value::String(reduce.to_string());
                }
                (index.name.to_string(), view)
            })
            .collect();

        Self {
            id: DESIGN_ID.to_string(),
            rev: None,
            language: Some("javascript".to_string()),
            version: Some(DESIGN_VERSION),
            views,
        }
    }

    pub fn has_view(&self, name: &str) -> bool {
        self.views.contains_key(name)
    }
}
