use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{CollectionSource, FetchScope};
use crate::config::SourceConfig;
use crate::registry::CollectionKind;

/// Callback type for recording backend request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Collection endpoints answer either with `{"data": [...]}` or a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum CollectionResponse {
    Wrapped { data: Vec<Value> },
    Bare(Vec<Value>),
}

impl CollectionResponse {
    fn into_values(self) -> Vec<Value> {
        match self {
            Self::Wrapped { data } => data,
            Self::Bare(values) => values,
        }
    }
}

/// HTTP client for the backend's collection endpoints.
pub struct HttpSource {
    http: reqwest::Client,
    endpoint: String,
    primary_path: String,
    fallback_path: String,
    metrics: Option<MetricsCallback>,
}

impl HttpSource {
    pub fn new(cfg: &SourceConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            primary_path: cfg.primary_path.clone(),
            fallback_path: cfg.fallback_path.clone(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (endpoint_name, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    fn url(&self, template: &str, kind: CollectionKind) -> String {
        format!(
            "{}{}",
            self.endpoint,
            template.replace("{collection}", kind.as_str())
        )
    }

    async fn get_collection(
        &self,
        endpoint_name: &str,
        url: String,
        scope: FetchScope,
    ) -> Result<Vec<Value>> {
        let start = Instant::now();

        let mut request = self.http.get(&url).header("Accept", "application/json");
        if let Some(date) = scope.date {
            request = request.query(&[("selectedDate", date.format("%Y-%m-%d").to_string())]);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.record_request(endpoint_name, "error", start.elapsed());
                return Err(e).with_context(|| format!("requesting {url}"));
            }
        };

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint_name, "error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, url, body);
        }

        let decoded: Result<CollectionResponse> = response
            .json()
            .await
            .with_context(|| format!("decoding response from {url}"));
        let values = match decoded {
            Ok(body) => body.into_values(),
            Err(e) => {
                self.record_request(endpoint_name, "error", start.elapsed());
                return Err(e);
            }
        };

        self.record_request(endpoint_name, "success", start.elapsed());
        debug!(url = %url, records = values.len(), "fetched collection");

        Ok(values)
    }
}

impl CollectionSource for HttpSource {
    async fn fetch_collection(
        &self,
        kind: CollectionKind,
        scope: FetchScope,
    ) -> Result<Vec<Value>> {
        let url = self.url(&self.primary_path, kind);
        self.get_collection("primary", url, scope).await
    }

    async fn fetch_collection_fallback(
        &self,
        kind: CollectionKind,
        scope: FetchScope,
    ) -> Result<Vec<Value>> {
        let url = self.url(&self.fallback_path, kind);
        self.get_collection("fallback", url, scope).await
    }
}
