//! `metricsctl query`: raw, aggregated, and predicted reads

use crate::client::{ApiClient, EntitySelector, QueryRequest, QueryResponse};
use crate::output::{self, OutputFormat};
use anyhow::Result;
use std::collections::BTreeMap;
use tabled::Tabled;

#[derive(Tabled)]
struct BucketRow {
    #[tabled(rename = "ENTITY")]
    entity_id: String,
    #[tabled(rename = "BUCKET START")]
    bucket_start: String,
    #[tabled(rename = "MIN")]
    min: String,
    #[tabled(rename = "MAX")]
    max: String,
    #[tabled(rename = "MEAN")]
    mean: String,
    #[tabled(rename = "SAMPLES")]
    sample_count: u64,
}

#[derive(Tabled)]
struct PointRow {
    #[tabled(rename = "ENTITY")]
    entity_id: String,
    #[tabled(rename = "TIMESTAMP")]
    timestamp: String,
    #[tabled(rename = "VALUE")]
    value: String,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    client: &ApiClient,
    entities: Option<String>,
    labels: Vec<String>,
    metric: String,
    since: String,
    mode: String,
    granularity: String,
    forecast_at: Option<i64>,
    format: OutputFormat,
) -> Result<()> {
    let selector = build_selector(entities, labels)?;
    let now = chrono::Utc::now().timestamp();
    let from = now - super::parse_duration_secs(&since)?;

    let request = QueryRequest {
        selector,
        metric_type: metric,
        from,
        to: now,
        granularity,
        mode,
        forecast_at,
    };

    let response: QueryResponse = client.post("/api/query", &request).await?;
    render(&response, format);
    Ok(())
}

fn build_selector(entities: Option<String>, labels: Vec<String>) -> Result<EntitySelector> {
    if let Some(ids) = entities {
        return Ok(EntitySelector::Ids(
            ids.split(',').map(|s| s.trim().to_string()).collect(),
        ));
    }
    if labels.is_empty() {
        anyhow::bail!("either --entities or at least one --label is required");
    }

    let mut selector = BTreeMap::new();
    for label in labels {
        let (key, value) = label
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("labels must be key=value, got {:?}", label))?;
        selector.insert(key.to_string(), value.to_string());
    }
    Ok(EntitySelector::Labels(selector))
}

fn render(response: &QueryResponse, format: OutputFormat) {
    if let OutputFormat::Json = format {
        if let Ok(json) = serde_json::to_string_pretty(response) {
            println!("{}", json);
        }
        return;
    }

    for series in &response.series {
        match series.kind.as_str() {
            "raw" => {
                let rows: Vec<PointRow> = series
                    .points
                    .iter()
                    .map(|p| PointRow {
                        entity_id: series.entity_id.clone(),
                        timestamp: output::format_timestamp(p.timestamp),
                        value: format!("{:.2}", p.value),
                    })
                    .collect();
                output::print_table(&rows);
            }
            _ => {
                let rows: Vec<BucketRow> = series
                    .buckets
                    .iter()
                    .map(|b| BucketRow {
                        entity_id: series.entity_id.clone(),
                        bucket_start: output::format_timestamp(b.bucket_start),
                        min: format!("{:.2}", b.min),
                        max: format!("{:.2}", b.max),
                        mean: format!("{:.2}", b.mean),
                        sample_count: b.sample_count,
                    })
                    .collect();
                output::print_table(&rows);

                if let Some(trend) = &series.trend {
                    let mut line = format!(
                        "{}: {} trend, slope {:.3}/bucket, confidence {}",
                        series.entity_id,
                        output::color_direction(&trend.direction),
                        trend.slope,
                        output::color_confidence(trend.confidence),
                    );
                    if let (Some(at), Some(value)) = (trend.forecast_at, trend.forecast_value) {
                        line.push_str(&format!(
                            ", forecast {:.2} at {}",
                            value,
                            output::format_timestamp(at)
                        ));
                    }
                    output::print_info(&line);
                    if trend.anomaly {
                        output::print_warning(&format!(
                            "{}: latest bucket deviates from the fitted trend",
                            series.entity_id
                        ));
                    }
                    if trend.low_confidence {
                        output::print_warning(&format!(
                            "{}: low-confidence fit, treat the trend as indicative only",
                            series.entity_id
                        ));
                    }
                }
                if let Some(err) = &series.analysis_error {
                    output::print_warning(&format!("{}: {}", series.entity_id, err));
                }
            }
        }
    }
}
