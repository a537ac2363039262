use anyhow::{Context, Result};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5984;
const DEFAULT_DATABASE: &str = "bid_kpi";

/// Where the blob store lives: CouchDB host, port and database name.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl StoreConfig {
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Load from `KPIG_COUCHDB_*` environment variables (a `.env` file is honored).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let port = match std::env::var("KPIG_COUCHDB_PORT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("KPIG_COUCHDB_PORT must be a port number, got {raw:?}"))?,
            Err(_) => DEFAULT_PORT,
        };

        let config = Self {
            host: std::env::var("KPIG_COUCHDB_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port,
            database: std::env::var("KPIG_COUCHDB_DB")
                .unwrap_or_else(|_| DEFAULT_DATABASE.to_string()),
            username: std::env::var("KPIG_COUCHDB_USER").ok(),
            password: std::env::var("KPIG_COUCHDB_PASSWORD").ok(),
        };

        config.log_values();
        Ok(config)
    }

    /// Base URL of the CouchDB server. A host that already carries a scheme is kept as is.
    pub fn server_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}:{}", self.port)
        } else {
            format!("http://{host}:{}", self.port)
        }
    }

    fn log_values(&self) {
        tracing::info!(
            host = %self.host,
            port = self.port,
            database = %self.database,
            username = self.username.as_deref().unwrap_or("<not set>"),
            password = if self.password.is_some() { "<set>" } else { "<not set>" },
            "Store config loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_url_adds_scheme_when_missing() {
        let config = StoreConfig::new("couch.internal", 5984, "bid_kpi");
        assert_eq!(config.server_url(), "http://couch.internal:5984");
    }

    #[test]
    fn server_url_keeps_explicit_scheme() {
        let config = StoreConfig::new("https://couch.example.com/", 6984, "bid_kpi");
        assert_eq!(config.server_url(), "https://couch.example.com:6984");
    }

    #[test]
    fn credentials_are_optional() {
        let config = StoreConfig::new("localhost", 5984, "bid_kpi");
        assert!(config.username.is_none());

        let config = config.with_credentials("admin", "secret");
        assert_eq!(config.username.as_deref(), Some("admin"));
        assert_eq!(config.password.as_deref(), Some("secret"));
    }
}
