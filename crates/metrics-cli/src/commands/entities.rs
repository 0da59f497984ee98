//! `metricsctl entities` and `metricsctl health`

use crate::client::{ApiClient, EntityRef, HealthResponse};
use crate::output::{self, OutputFormat};
use anyhow::Result;
use std::collections::BTreeMap;
use tabled::Tabled;

#[derive(Tabled)]
struct EntityRow {
    #[tabled(rename = "ENTITY")]
    entity_id: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "LABELS")]
    labels: String,
}

pub async fn list(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let entities: Vec<EntityRef> = client.get("/api/entities").await?;

    if let OutputFormat::Json = format {
        if let Ok(json) = serde_json::to_string_pretty(&entities) {
            println!("{}", json);
        }
        return Ok(());
    }

    let rows: Vec<EntityRow> = entities
        .into_iter()
        .map(|e| EntityRow {
            entity_id: e.entity_id,
            kind: e.kind,
            labels: e
                .labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        })
        .collect();
    output::print_table(&rows);
    Ok(())
}

pub async fn register(
    client: &ApiClient,
    entity_id: String,
    kind: String,
    labels: Vec<String>,
) -> Result<()> {
    let mut label_map = BTreeMap::new();
    for label in labels {
        let (key, value) = label
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("labels must be key=value, got {:?}", label))?;
        label_map.insert(key.to_string(), value.to_string());
    }

    let entity = EntityRef {
        entity_id: entity_id.clone(),
        kind,
        labels: label_map,
    };
    client.post_unit("/api/entities", &entity).await?;

    output::print_success(&format!("Registered {}", entity_id));
    Ok(())
}

pub async fn health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: HealthResponse = client.get("/healthz").await?;

    if let OutputFormat::Json = format {
        if let Ok(json) = serde_json::to_string_pretty(&health) {
            println!("{}", json);
        }
        return Ok(());
    }

    println!("Overall: {}", output::color_status(&health.status));
    for (name, component) in &health.components {
        let detail = component
            .message
            .as_deref()
            .map(|m| format!(" ({})", m))
            .unwrap_or_default();
        println!(
            "  {:12} {}{}",
            name,
            output::color_status(&component.status),
            detail
        );
    }
    Ok(())
}
