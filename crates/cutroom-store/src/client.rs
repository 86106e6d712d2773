//! REST client for the hosted document store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::listen::LiveQuery;
use crate::{
    Document, DocumentStore, Fields, Query, StoreError, Subscription, WriteBatch, WriteOp,
};

/// Attempts per request: the initial one plus three retries.
const MAX_ATTEMPTS: u32 = 4;

/// Client for the document store's REST API.
///
/// Transient failures (5xx with a retryable code, timeouts, refused
/// connections) are retried with exponential backoff. Everything else is
/// returned to the caller as-is.
#[derive(Clone)]
pub struct HttpStore {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    retry_backoff: Duration,
}

impl HttpStore {
    /// Create a client for the store at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build tuned HTTP client, using defaults");
                Client::new()
            });

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Authenticate every request with a bearer key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Base delay between retries. Doubles on every attempt.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a request, retrying transient failures.
    async fn execute<B, R>(
        &self,
        op: &'static str,
        method: Method,
        path: &str,
        body: Option<&B>,
        target: Option<(&str, &str)>,
    ) -> Result<R, StoreError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);

        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            let mut request = self.http.request(method.clone(), &url);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let result = match request.send().await {
                Ok(response) => self.handle_response(response, target).await,
                Err(e) => Err(StoreError::Http(e)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    let backoff = self.retry_backoff * (1 << attempt);
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient error in {}, retrying",
                        op
                    );
                    tokio::time::sleep(backoff).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::InvalidResponse("retry exhausted".into())))
    }

    async fn handle_response<R: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        target: Option<(&str, &str)>,
    ) -> Result<R, StoreError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(StoreError::RateLimited { retry_after_secs });
        }

        let text = response.text().await.map_err(|e| {
            StoreError::InvalidResponse(format!(
                "request failed ({}): failed to read response: {}",
                status, e
            ))
        })?;

        if !status.is_success() {
            let api_error = serde_json::from_str::<ApiErrorBody>(&text)
                .ok()
                .map(|b| b.error);

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(StoreError::PermissionDenied(
                    api_error.map(|e| e.message).unwrap_or(text),
                ));
            }
            if status == StatusCode::NOT_FOUND {
                if let Some((collection, id)) = target {
                    return Err(StoreError::NotFound {
                        collection: collection.to_string(),
                        id: id.to_string(),
                    });
                }
            }
            if let Some(err) = api_error {
                if err.code == "permission-denied" {
                    return Err(StoreError::PermissionDenied(err.message));
                }
                return Err(StoreError::Server {
                    code: err.code,
                    message: err.message,
                });
            }
            return Err(StoreError::InvalidResponse(format!(
                "request failed ({}): {}",
                status, text
            )));
        }

        let body = if text.trim().is_empty() { "null" } else { &text };
        Ok(serde_json::from_str(body)?)
    }
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn get_all(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let response: QueryResponse = self
            .execute("get_all", Method::POST, "/v1/query", Some(query), None)
            .await?;
        debug!(
            collection = %query.collection,
            count = response.documents.len(),
            "fetched documents"
        );
        Ok(response.documents)
    }

    fn subscribe(&self, query: Query) -> Subscription {
        LiveQuery::new(&self.base_url, self.api_key.clone()).spawn(query)
    }

    async fn create(&self, collection: &str, data: Fields) -> Result<String, StoreError> {
        #[derive(Serialize)]
        struct CreateRequest<'a> {
            data: &'a Fields,
        }

        let path = format!("/v1/documents/{}", collection);
        let response: CreateResponse = self
            .execute(
                "create",
                Method::POST,
                &path,
                Some(&CreateRequest { data: &data }),
                None,
            )
            .await?;
        debug!(collection = %collection, id = %response.id, "created document");
        Ok(response.id)
    }

    async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<(), StoreError> {
        #[derive(Serialize)]
        struct UpdateRequest<'a> {
            patch: &'a Fields,
        }

        let path = format!("/v1/documents/{}/{}", collection, id);
        let _: IgnoredAny = self
            .execute(
                "update",
                Method::PATCH,
                &path,
                Some(&UpdateRequest { patch: &patch }),
                Some((collection, id)),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let path = format!("/v1/documents/{}/{}", collection, id);
        let _: IgnoredAny = self
            .execute::<(), _>("delete", Method::DELETE, &path, None, None)
            .await?;
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        #[derive(Serialize)]
        struct CommitRequest<'a> {
            writes: &'a [WriteOp],
        }

        if batch.is_empty() {
            return Ok(());
        }

        let result: Result<IgnoredAny, _> = self
            .execute(
                "commit",
                Method::POST,
                "/v1/commit",
                Some(&CommitRequest {
                    writes: batch.ops(),
                }),
                None,
            )
            .await;

        match result {
            Ok(_) => {
                debug!(writes = batch.len(), "committed batch");
                Ok(())
            }
            Err(StoreError::Server { code, message }) if code == "failed-precondition" => {
                Err(StoreError::Batch(message))
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    documents: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

/// Error envelope returned by the store API.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    message: String,
}
