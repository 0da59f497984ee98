//! HTTP sampler against the sampling collaborator
//!
//! The collaborator exposes one endpoint per entity returning a full
//! reading as JSON. Any transport or decode failure maps to
//! `Unavailable` for that entity; the sampling loop skips it this tick
//! and moves on.

use async_trait::async_trait;
use metrics_core::scheduler::Sampler;
use metrics_core::{Reading, Unavailable};
use std::time::Duration;
use tracing::debug;

pub struct HttpSampler {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSampler {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Sampler for HttpSampler {
    async fn pull(&self, entity_id: &str) -> Result<Reading, Unavailable> {
        let url = format!("{}/reading/{}", self.base_url, entity_id);
        debug!(entity_id, url = %url, "Pulling reading");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Unavailable::new(entity_id, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Unavailable::new(
                entity_id,
                format!("collaborator returned {}", response.status()),
            ));
        }

        response
            .json::<Reading>()
            .await
            .map_err(|e| Unavailable::new(entity_id, format!("invalid reading: {}", e)))
    }
}
