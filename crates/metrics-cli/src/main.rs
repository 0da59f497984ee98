//! Cluster metrics CLI
//!
//! A command-line tool for querying metrics, exporting history, and
//! inspecting the metrics daemon.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Cluster metrics CLI
#[derive(Parser)]
#[command(name = "metricsctl")]
#[command(author, version, about = "CLI for the cluster metrics daemon", long_about = None)]
pub struct Cli {
    /// Daemon API URL (can also be set via METRICSCTL_API_URL env var)
    #[arg(long, env = "METRICSCTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Viewer-scope token sent with every request
    #[arg(long, env = "METRICSCTL_SCOPE_TOKEN")]
    pub scope_token: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Query metric series
    Query {
        /// Comma-separated entity ids
        #[arg(long, short)]
        entities: Option<String>,

        /// Label selector, repeatable (key=value, all must match)
        #[arg(long, short)]
        label: Vec<String>,

        /// Metric type (e.g. cpu_percent, memory_percent)
        #[arg(long, short, default_value = "cpu_percent")]
        metric: String,

        /// Window ending now (e.g. 30m, 6h, 7d)
        #[arg(long, default_value = "2h")]
        since: String,

        /// Read mode: raw, aggregated, or predicted
        #[arg(long, default_value = "aggregated")]
        mode: String,

        /// Bucket granularity: five_minutes, one_hour, six_hours, one_day
        #[arg(long, short, default_value = "five_minutes")]
        granularity: String,

        /// Predicted mode only: forecast the value at this Unix timestamp
        #[arg(long)]
        forecast_at: Option<i64>,
    },

    /// Export rows as CSV or JSON lines
    Export {
        /// Comma-separated entity ids
        #[arg(long, short)]
        entities: String,

        /// Metric type
        #[arg(long, short, default_value = "cpu_percent")]
        metric: String,

        /// Window ending now (e.g. 24h, 7d)
        #[arg(long, default_value = "24h")]
        since: String,

        /// Export mode: raw or aggregated
        #[arg(long, default_value = "raw")]
        mode: String,

        /// Bucket granularity for aggregated exports
        #[arg(long, short, default_value = "five_minutes")]
        granularity: String,

        /// Wire format: csv or json
        #[arg(long, default_value = "csv")]
        wire_format: String,

        /// Output file path (stdout if omitted)
        #[arg(long, short)]
        output: Option<String>,
    },

    /// List or register entities
    #[command(subcommand)]
    Entities(EntitiesCommands),

    /// Show daemon health
    Health,
}

#[derive(Subcommand)]
pub enum EntitiesCommands {
    /// List registered entities
    List,

    /// Register an entity
    Register {
        /// Entity id
        entity_id: String,

        /// Entity kind: node or service
        #[arg(long, short, default_value = "node")]
        kind: String,

        /// Labels, repeatable (key=value)
        #[arg(long, short)]
        label: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = client::ApiClient::new(&cli.api_url, cli.scope_token.clone())?;

    match cli.command {
        Commands::Query {
            entities,
            label,
            metric,
            since,
            mode,
            granularity,
            forecast_at,
        } => {
            commands::query::run(
                &client,
                entities,
                label,
                metric,
                since,
                mode,
                granularity,
                forecast_at,
                cli.format,
            )
            .await?;
        }
        Commands::Export {
            entities,
            metric,
            since,
            mode,
            granularity,
            wire_format,
            output,
        } => {
            commands::export::run(
                &client,
                entities,
                metric,
                since,
                mode,
                granularity,
                wire_format,
                output,
            )
            .await?;
        }
        Commands::Entities(cmd) => match cmd {
            EntitiesCommands::List => commands::entities::list(&client, cli.format).await?,
            EntitiesCommands::Register {
                entity_id,
                kind,
                label,
            } => commands::entities::register(&client, entity_id, kind, label).await?,
        },
        Commands::Health => commands::entities::health(&client, cli.format).await?,
    }

    Ok(())
}
