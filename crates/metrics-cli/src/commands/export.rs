//! `metricsctl export`: download raw or aggregated rows as CSV or JSON
//! lines

use crate::client::ApiClient;
use crate::output;
use anyhow::{Context, Result};
use std::io::Write;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    client: &ApiClient,
    entities: String,
    metric: String,
    since: String,
    mode: String,
    granularity: String,
    format: String,
    output_path: Option<String>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let from = now - super::parse_duration_secs(&since)?;

    let path = format!(
        "/api/export?entities={}&metric_type={}&from={}&to={}&mode={}&granularity={}&format={}",
        entities, metric, from, now, mode, granularity, format
    );
    let body = client.get_text(&path).await?;

    match output_path {
        Some(file) => {
            let mut out = std::fs::File::create(&file)
                .with_context(|| format!("Failed to create {}", file))?;
            out.write_all(body.as_bytes())
                .with_context(|| format!("Failed to write {}", file))?;
            let rows = body.lines().count();
            output::print_success(&format!("Wrote {} lines to {}", rows, file));
        }
        None => print!("{}", body),
    }
    Ok(())
}
