use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadflow_adapters::{
    HttpCompletionConfig, HttpCompletionService, HttpJobService, HttpJobServiceConfig,
    JsonFileSheet,
};
use leadflow_sync::{EnrichConfig, EnrichmentPipeline, LeadScorer};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadflow-cli")]
#[command(about = "Lead enrichment pipeline command-line interface")]
struct Cli {
    /// Path of the JSON spreadsheet file holding the lead worksheets.
    #[arg(long, default_value = "./leads_sheet.json")]
    sheet: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full run: submit seeds, poll snapshots, merge, score.
    Run,
    /// Score unscored rows only, without submitting or polling.
    Score,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = EnrichConfig::from_env();
    let sheet = JsonFileSheet::open(&cli.sheet)
        .await
        .with_context(|| format!("opening sheet file {}", cli.sheet))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let jobs = HttpJobService::new(HttpJobServiceConfig {
                api_token: std::env::var("BRIGHTDATA_API_TOKEN")
                    .context("BRIGHTDATA_API_TOKEN is not set")?,
                ..HttpJobServiceConfig::default()
            })?;
            let completions = HttpCompletionService::new(completion_config()?)?;

            let pipeline = EnrichmentPipeline::new(&sheet, &jobs, &completions, config);
            let summary = pipeline.run().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Score => {
            let completions = HttpCompletionService::new(completion_config()?)?;
            let scorer = LeadScorer::new(&sheet, &completions, &config);
            let summary = scorer.score_all().await?;
            println!("scoring complete: rows_scored={}", summary.scored);
        }
    }

    Ok(())
}

fn completion_config() -> Result<HttpCompletionConfig> {
    let mut config = HttpCompletionConfig {
        api_key: std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?,
        ..HttpCompletionConfig::default()
    };
    if let Ok(model) = std::env::var("LEADFLOW_SCORING_MODEL") {
        config.model = model;
    }
    Ok(config)
}
