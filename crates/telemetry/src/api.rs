//! REST client for the telemetry refetch endpoints.
//!
//! The push channel is the primary path; this client is what the poller
//! falls back to when a cached snapshot goes stale or a consumer asks for
//! a refresh. Responses carry the same `{entityId, payload, timestamp}`
//! body as push messages and go through the same validation.

use async_trait::async_trait;

use gridlens_core::snapshot::{MetricKind, MetricSnapshot};

use crate::error::TelemetryError;
use crate::messages::SnapshotBody;

/// Default `timeRange` query value.
pub const DEFAULT_TIME_RANGE: &str = "1h";

/// Something that can produce a fresh snapshot on demand.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, kind: MetricKind, entity_id: &str) -> Result<MetricSnapshot, TelemetryError>;
}

/// HTTP client for `GET {api_url}/metrics/{kind}`.
pub struct MetricsApi {
    client: reqwest::Client,
    api_url: String,
    time_range: String,
}

impl MetricsApi {
    /// * `api_url` - Base HTTP URL, e.g. `https://host/api`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            time_range: DEFAULT_TIME_RANGE.to_string(),
        }
    }

    pub fn with_time_range(mut self, time_range: impl Into<String>) -> Self {
        self.time_range = time_range.into();
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Fetch the latest snapshot of `kind` for `entity_id`.
    pub async fn fetch_snapshot(
        &self,
        kind: MetricKind,
        entity_id: &str,
    ) -> Result<MetricSnapshot, TelemetryError> {
        let response = self
            .client
            .get(self.metrics_url(kind))
            .query(&[("entityId", entity_id), ("timeRange", self.time_range.as_str())])
            .send()
            .await?;

        let body: SnapshotBody = Self::parse_response(response).await?;
        if body.entity_id != entity_id {
            return Err(TelemetryError::Validation(format!(
                "refetch for {entity_id} answered with entity {}",
                body.entity_id
            )));
        }
        body.into_snapshot(kind)
    }

    // ---- private helpers ----

    fn metrics_url(&self, kind: MetricKind) -> String {
        format!("{}/metrics/{}", self.api_url, kind.path_segment())
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or [`TelemetryError::Api`] with the
    /// status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, TelemetryError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TelemetryError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TelemetryError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl SnapshotSource for MetricsApi {
    async fn fetch(&self, kind: MetricKind, entity_id: &str) -> Result<MetricSnapshot, TelemetryError> {
        self.fetch_snapshot(kind, entity_id).await
    }
}
