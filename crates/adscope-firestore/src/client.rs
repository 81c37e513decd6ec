//! Firestore REST API client.
//!
//! Production-grade client with:
//! - Token caching with refresh margin and one transparent re-auth per call
//! - HTTP client tuning (pooling, timeouts)
//! - Observability (tracing spans, metrics)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, info_span, Instrument};

use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_request;
use crate::retry::RetryConfig;
use crate::token_cache::TokenCache;
use crate::types::{
    Document, FieldWrite, ListDocumentsResponse, RunQueryRequest, RunQueryResponse,
    StructuredQuery, Value,
};

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// Request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry configuration
    pub retry: RetryConfig,
}

impl FirestoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .map_err(|_| {
                FirestoreError::auth_error(
                    "GCP_PROJECT_ID or FIREBASE_PROJECT_ID must be set to access Firestore",
                )
            })?;

        if project_id.is_empty() {
            return Err(FirestoreError::auth_error(
                "GCP_PROJECT_ID or FIREBASE_PROJECT_ID cannot be empty",
            ));
        }

        let connect_timeout_secs: u64 = std::env::var("FIRESTORE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            project_id,
            database_id: std::env::var("FIRESTORE_DATABASE_ID")
                .unwrap_or_else(|_| "(default)".to_string()),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            retry: RetryConfig::from_env(),
        })
    }
}

/// Firestore REST API client.
pub struct FirestoreClient {
    http: Client,
    config: FirestoreConfig,
    base_url: String,
    token_cache: Arc<TokenCache>,
}

impl Clone for FirestoreClient {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            config: self.config.clone(),
            base_url: self.base_url.clone(),
            token_cache: Arc::clone(&self.token_cache),
        }
    }
}

impl FirestoreClient {
    /// Create a new Firestore client.
    pub async fn new(config: FirestoreConfig) -> FirestoreResult<Self> {
        let auth = Self::create_auth_provider()?;

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("adscope-firestore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FirestoreError::Network)?;

        let base_url = format!(
            "https://firestore.googleapis.com/v1/projects/{}/databases/{}/documents",
            config.project_id, config.database_id
        );

        Ok(Self {
            http,
            config,
            base_url,
            token_cache: Arc::new(TokenCache::new(auth)),
        })
    }

    fn create_auth_provider() -> FirestoreResult<Arc<dyn TokenProvider>> {
        let service_account = CustomServiceAccount::from_env().map_err(|e| {
            FirestoreError::auth_error(format!("Failed to load service account: {}", e))
        })?;

        match service_account {
            Some(sa) => Ok(Arc::new(sa)),
            None => Err(FirestoreError::auth_error(
                "GOOGLE_APPLICATION_CREDENTIALS not set. \
                 Set it to the path of your service account JSON file.",
            )),
        }
    }

    /// Create from environment variables.
    pub async fn from_env() -> FirestoreResult<Self> {
        let config = FirestoreConfig::from_env()?;
        Self::new(config).await
    }

    fn is_access_token_expired(body: &str) -> bool {
        body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
    }

    /// Build document path.
    fn document_path(&self, collection: &str, doc_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, doc_id)
    }

    /// Send a request, re-authenticating once if the token was rejected.
    ///
    /// The builder closure is invoked with a bearer token; it may be called
    /// a second time after a token refresh.
    async fn send_authorized<F>(&self, build: F) -> FirestoreResult<reqwest::Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.token_cache.get_token().await?;
        let response = build(&token).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if !Self::is_access_token_expired(&body) {
            return Err(FirestoreError::from_http_status(401, body));
        }

        self.token_cache.invalidate().await;
        let token = self.token_cache.get_token().await?;
        Ok(build(&token).send().await?)
    }

    // =========================================================================
    // CRUD Operations
    // =========================================================================

    /// Get a document. Returns `None` when it does not exist.
    pub async fn get_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> FirestoreResult<Option<Document>> {
        let url = self.document_path(collection, doc_id);

        self.execute_request("get_document", collection, Some(doc_id), async {
            let response = self
                .send_authorized(|token| self.http.get(&url).bearer_auth(token))
                .await?;

            match response.status() {
                StatusCode::OK => Ok(Some(response.json().await?)),
                StatusCode::NOT_FOUND => Ok(None),
                status => Err(Self::error_from(status, &url, response).await),
            }
        })
        .await
    }

    /// Create a document, failing if it already exists.
    pub async fn create_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
    ) -> FirestoreResult<Document> {
        let url = format!("{}/{}", self.base_url, collection);
        let body = Document::new(fields);

        self.execute_request("create_document", collection, Some(doc_id), async {
            let response = self
                .send_authorized(|token| {
                    self.http
                        .post(&url)
                        .query(&[("documentId", doc_id)])
                        .bearer_auth(token)
                        .json(&body)
                })
                .await?;

            match response.status() {
                StatusCode::OK | StatusCode::CREATED => Ok(response.json().await?),
                StatusCode::CONFLICT => Err(FirestoreError::AlreadyExists(format!(
                    "{}/{}",
                    collection, doc_id
                ))),
                status => Err(Self::error_from(status, &url, response).await),
            }
        })
        .await
    }

    /// Write all given fields, creating the document if needed.
    ///
    /// A mask naming exactly the written fields makes this a merge that
    /// also creates missing documents.
    pub async fn set_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
    ) -> FirestoreResult<Document> {
        let mask: Vec<String> = fields.keys().cloned().collect();
        self.patch_document(collection, doc_id, fields, mask, false, None)
            .await
    }

    /// Apply per-field writes (partial update with a field mask).
    ///
    /// `FieldWrite::Delete` entries are named in the mask but omitted from
    /// the body, which deletes the field. Fails with `NotFound` when the
    /// document does not exist.
    pub async fn update_fields(
        &self,
        collection: &str,
        doc_id: &str,
        writes: Vec<(String, FieldWrite)>,
    ) -> FirestoreResult<Document> {
        let (fields, mask) = split_writes(writes);
        self.patch_document(collection, doc_id, fields, mask, true, None)
            .await
    }

    /// Per-field writes guarded by an `updateTime` precondition.
    ///
    /// Fails with `PreconditionFailed` when the document changed since the
    /// given revision was read; used for optimistic concurrency.
    pub async fn update_fields_with_precondition(
        &self,
        collection: &str,
        doc_id: &str,
        writes: Vec<(String, FieldWrite)>,
        update_time: &str,
    ) -> FirestoreResult<Document> {
        let (fields, mask) = split_writes(writes);
        self.patch_document(collection, doc_id, fields, mask, true, Some(update_time))
            .await
    }

    /// Merge fields under an explicit mask, creating the document if needed.
    ///
    /// The mask may name nested paths (`subscription.adsUsed`) while the
    /// body carries the corresponding nested map values; masked paths absent
    /// from the body are deleted.
    pub async fn upsert_fields(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
        mask: Vec<String>,
    ) -> FirestoreResult<Document> {
        self.patch_document(collection, doc_id, fields, mask, false, None)
            .await
    }

    async fn patch_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
        mask: Vec<String>,
        must_exist: bool,
        update_time: Option<&str>,
    ) -> FirestoreResult<Document> {
        let url = self.document_path(collection, doc_id);

        let mut params: Vec<(&str, String)> = Vec::with_capacity(mask.len() + 2);
        for path in &mask {
            params.push(("updateMask.fieldPaths", path.clone()));
        }
        if must_exist {
            // Without this a partial update would silently create a
            // skeleton record.
            params.push(("currentDocument.exists", "true".to_string()));
        }
        if let Some(ts) = update_time {
            params.push(("currentDocument.updateTime", ts.to_string()));
        }

        let body = Document::new(fields);
        let operation = if update_time.is_some() {
            "update_fields_precondition"
        } else if must_exist {
            "update_fields"
        } else {
            "upsert_fields"
        };

        self.execute_request(operation, collection, Some(doc_id), async {
            let response = self
                .send_authorized(|token| {
                    self.http
                        .patch(&url)
                        .query(&params)
                        .bearer_auth(token)
                        .json(&body)
                })
                .await?;

            match response.status() {
                StatusCode::OK => Ok(response.json().await?),
                StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                    let body = response.text().await.unwrap_or_default();
                    Err(FirestoreError::PreconditionFailed(body))
                }
                StatusCode::NOT_FOUND => {
                    Err(FirestoreError::not_found(format!("{}/{}", collection, doc_id)))
                }
                status => Err(Self::error_from(status, &url, response).await),
            }
        })
        .await
    }

    /// Delete a document (idempotent).
    pub async fn delete_document(&self, collection: &str, doc_id: &str) -> FirestoreResult<()> {
        let url = self.document_path(collection, doc_id);

        self.execute_request("delete_document", collection, Some(doc_id), async {
            let response = self
                .send_authorized(|token| self.http.delete(&url).bearer_auth(token))
                .await?;

            match response.status() {
                StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
                StatusCode::NOT_FOUND => {
                    debug!("Document {}/{} already deleted (idempotent)", collection, doc_id);
                    Ok(())
                }
                status => Err(Self::error_from(status, &url, response).await),
            }
        })
        .await
    }

    /// List documents in a collection, one page at a time.
    pub async fn list_documents(
        &self,
        collection: &str,
        page_size: Option<u32>,
        page_token: Option<&str>,
    ) -> FirestoreResult<ListDocumentsResponse> {
        let url = format!("{}/{}", self.base_url, collection);
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(size) = page_size {
            params.push(("pageSize", size.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        self.execute_request("list_documents", collection, None, async {
            let response = self
                .send_authorized(|token| self.http.get(&url).query(&params).bearer_auth(token))
                .await?;

            match response.status() {
                StatusCode::OK => Ok(response.json().await?),
                status => Err(Self::error_from(status, &url, response).await),
            }
        })
        .await
    }

    /// Run an equality query over a collection.
    ///
    /// Returns the documents where `field == value`, up to `limit`.
    pub async fn query_equal(
        &self,
        collection: &str,
        field: &str,
        value: Value,
        limit: Option<u32>,
    ) -> FirestoreResult<Vec<Document>> {
        let url = format!("{}:runQuery", self.base_url);
        let mut query = StructuredQuery::equality(collection, field, value);
        if let Some(limit) = limit {
            query = query.with_limit(limit);
        }
        let request = RunQueryRequest {
            structured_query: query,
        };

        self.execute_request("run_query", collection, None, async {
            let response = self
                .send_authorized(|token| self.http.post(&url).bearer_auth(token).json(&request))
                .await?;

            match response.status() {
                StatusCode::OK => {
                    let body = response.text().await.unwrap_or_default();
                    // runQuery returns a JSON array of per-document responses
                    let responses: Vec<RunQueryResponse> =
                        serde_json::from_str(&body).map_err(|e| {
                            FirestoreError::invalid_response(format!(
                                "Failed to parse runQuery response: {} (body prefix: {})",
                                e,
                                &body[..body.len().min(200)]
                            ))
                        })?;

                    Ok(responses.into_iter().filter_map(|r| r.document).collect())
                }
                status => Err(Self::error_from(status, &url, response).await),
            }
        })
        .await
    }

    /// Execute with retry.
    pub async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> FirestoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = FirestoreResult<T>>,
    {
        crate::retry::with_retry(&self.config.retry, operation, op).await
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    /// Execute a request with tracing and metrics.
    async fn execute_request<T, F>(
        &self,
        operation: &str,
        collection: &str,
        doc_id: Option<&str>,
        fut: F,
    ) -> FirestoreResult<T>
    where
        F: std::future::Future<Output = FirestoreResult<T>>,
    {
        let span = if let Some(id) = doc_id {
            info_span!("firestore_request", operation = %operation, collection = %collection, doc_id = %id)
        } else {
            info_span!("firestore_request", operation = %operation, collection = %collection)
        };

        let start = Instant::now();
        let result = fut.instrument(span).await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, latency_ms);

        result
    }

    async fn error_from(
        status: StatusCode,
        url: &str,
        response: reqwest::Response,
    ) -> FirestoreError {
        let body = response.text().await.unwrap_or_default();
        FirestoreError::from_http_status(status.as_u16(), format!("{} failed: {}", url, body))
    }
}

/// Split field writes into the request body and the field mask.
///
/// Every write lands in the mask; only `Set` writes land in the body, which
/// is what makes `Delete` a deletion on the server.
fn split_writes(writes: Vec<(String, FieldWrite)>) -> (HashMap<String, Value>, Vec<String>) {
    let mut fields = HashMap::new();
    let mut mask = Vec::with_capacity(writes.len());
    for (path, write) in writes {
        mask.push(path.clone());
        if let FieldWrite::Set(value) = write {
            fields.insert(path, value);
        }
    }
    (fields, mask)
}
