//! Connection handle: one CouchDB database addressed over HTTP.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::types::SaveReceipt;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result envelope of a CouchDB view query.
#[derive(Debug, Deserialize)]
pub struct ViewResponse<T> {
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    pub rows: Vec<ViewRow<T>>,
}

#[derive(Debug, Deserialize)]
pub struct ViewRow<T> {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    pub value: T,
}

/// Thin handle around a pooled `reqwest::Client` bound to one database.
///
/// Clones share the connection pool. No request-level timeout is set because
/// the change feed is a single long-lived response.
#[derive(Clone)]
pub struct CouchClient {
    http: reqwest::Client,
    server_url: String,
    database: String,
    auth: Option<(String, String)>,
}

impl CouchClient {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Connection(format!("Failed to build HTTP client: {e}")))?;

        let auth = config
            .username
            .clone()
            .map(|user| (user, config.password.clone().unwrap_or_default()));

        Ok(Self {
            http,
            server_url: config.server_url(),
            database: config.database.clone(),
            auth,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// URL of the database itself, or of a path below it when `path` is non-empty.
    pub fn db_url(&self, path: &str) -> String {
        let db = self.database.replace('/', "%2F");
        if path.is_empty() {
            format!("{}/{}", self.server_url, db)
        } else {
            format!("{}/{}/{}", self.server_url, db, path.trim_start_matches('/'))
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match self.auth {
            Some((ref user, ref password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    pub async fn database_exists(&self) -> Result<bool> {
        let resp = self.request(Method::HEAD, &self.db_url("")).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StoreError::Api {
                status: status.as_u16(),
                message: format!("unexpected answer checking database {}", self.database),
            }),
        }
    }

    pub async fn create_database(&self) -> Result<()> {
        let resp = self.request(Method::PUT, &self.db_url("")).send().await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn delete_database(&self) -> Result<()> {
        let resp = self.request(Method::DELETE, &self.db_url("")).send().await?;
        check(resp).await?;
        Ok(())
    }

    /// Write a new document and let CouchDB assign its id.
    pub async fn post_document<T: Serialize + ?Sized>(&self, doc: &T) -> Result<SaveReceipt> {
        let resp = self
            .request(Method::POST, &self.db_url(""))
            .json(doc)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    /// Create or replace the document at `id`.
    pub async fn put_document<T: Serialize + ?Sized>(&self, id: &str, doc: &T) -> Result<SaveReceipt> {
        let resp = self
            .request(Method::PUT, &self.db_url(id))
            .json(doc)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    /// Fetch a document, `None` when it does not exist.
    pub async fn get_document<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        let resp = self.request(Method::GET, &self.db_url(id)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(resp).await?.json().await?))
    }

    pub async fn query_view<T: DeserializeOwned>(
        &self,
        design: &str,
        view: &str,
        params: &[(&str, String)],
    ) -> Result<ViewResponse<T>> {
        let url = self.db_url(&format!("_design/{design}/_view/{view}"));
        let resp = self.request(Method::GET, &url).query(params).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    /// Open a continuous change feed. Returns once the response headers arrive,
    /// i.e. once the subscription is live on the server.
    pub async fn open_changes(&self, since: &str, heartbeat: Duration) -> Result<Response> {
        let params = [
            ("feed", "continuous".to_string()),
            ("include_docs", "true".to_string()),
            ("since", since.to_string()),
            ("heartbeat", heartbeat.as_millis().to_string()),
        ];
        let resp = self
            .request(Method::GET, &self.db_url("_changes"))
            .query(&params)
            .send()
            .await?;
        check(resp).await
    }
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(StoreError::Api {
        status: status.as_u16(),
        message,
    })
}
