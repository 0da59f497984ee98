//! HTTP client for the metrics daemon API

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header carrying the viewer-scope token
const SCOPE_HEADER: &str = "x-viewer-scope";

pub struct ApiClient {
    client: Client,
    base_url: String,
    scope_token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, scope_token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            scope_token,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.scope_token {
            Some(token) => builder.header(SCOPE_HEADER, token),
            None => builder,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// GET returning the raw body, for streamed exports.
    pub async fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.text().await.context("Failed to read response")
    }

    /// POST where only the status matters (the daemon replies 201 with an
    /// empty body).
    pub async fn post_unit<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .request(self.client.post(&url).json(body))
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }
        Ok(())
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .request(self.client.post(&url).json(body))
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }
}

// API request/response types, mirroring the daemon's JSON surface

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitySelector {
    Ids(Vec<String>),
    Labels(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub selector: EntitySelector,
    pub metric_type: String,
    pub from: i64,
    pub to: i64,
    pub granularity: String,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub mode: String,
    pub metric_type: String,
    pub from: i64,
    pub to: i64,
    pub granularity: String,
    pub series: Vec<EntitySeries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySeries {
    pub entity_id: String,
    pub kind: String,
    #[serde(default)]
    pub points: Vec<RawPoint>,
    #[serde(default)]
    pub buckets: Vec<Bucket>,
    #[serde(default)]
    pub trend: Option<TrendOutput>,
    #[serde(default)]
    pub analysis_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPoint {
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub entity_id: String,
    pub metric_type: String,
    pub bucket_start: i64,
    pub granularity: String,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendOutput {
    pub direction: String,
    pub slope: f64,
    pub confidence: f64,
    pub low_confidence: bool,
    pub anomaly: bool,
    #[serde(default)]
    pub forecast_at: Option<i64>,
    #[serde(default)]
    pub forecast_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_id: String,
    pub kind: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}
