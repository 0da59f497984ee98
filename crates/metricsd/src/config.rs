//! Daemon configuration

use anyhow::Result;
use metrics_core::CoreConfig;
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. Environment variables use the `METRICSD` prefix
/// with `__` separating nesting, e.g. `METRICSD__CORE__RAW_ROW_CAP=5000`.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// API server port for queries, health, and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Base URL of the sampling collaborator; sampling is disabled when
    /// unset
    #[serde(default)]
    pub sampler_url: Option<String>,

    /// Scope tokens granted access to every entity, comma-separated.
    /// Empty means no scope enforcement.
    #[serde(default)]
    pub admin_scope_tokens: Option<String>,

    /// Path for hourly rollups of expired raw data
    #[serde(default)]
    pub rollup_path: Option<String>,

    /// Core engine tunables
    #[serde(default)]
    pub core: CoreConfig,
}

fn default_api_port() -> u16 {
    8080
}

impl DaemonConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("METRICSD").separator("__"))
            .build()?;

        match config.try_deserialize() {
            Ok(parsed) => Ok(parsed),
            Err(e) => {
                warn!(
                    error = %e,
                    "Malformed environment configuration, falling back to defaults"
                );
                Ok(DaemonConfig {
                    api_port: default_api_port(),
                    sampler_url: None,
                    admin_scope_tokens: None,
                    rollup_path: None,
                    core: CoreConfig::default(),
                })
            }
        }
    }
}
