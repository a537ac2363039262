use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A blob was rejected before any write happened.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database or index creation failed during startup.
    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    /// A range scan or count aggregate failed.
    #[error("Query error: {0}")]
    Query(String),

    /// Change feed transport fault. Only ever handed to feed-error listeners.
    #[error("Feed transport error: {0}")]
    FeedTransport(String),

    /// A change subscriber panicked. Delivered to feed-error listeners; the
    /// relay keeps running.
    #[error("Subscriber error: {0}")]
    Subscriber(String),

    #[error("CouchDB error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    /// The batched-save join barrier saw a completion twice or not at all.
    #[error("Write barrier error: {0}")]
    Barrier(String),
}

impl StoreError {
    pub(crate) fn status(&self) -> Option<u16> {
        match self {
            StoreError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Parse(err.to_string())
    }
}
