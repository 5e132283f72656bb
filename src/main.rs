use anyhow::Context;
use clap::{Parser, Subcommand};
use finnews_aggregator::{
    utils::parse_date, AggregationStore, CompletenessTracker, ComponentStore, ExtractionProducer,
    JsonBacklogFeed, MemoryComponentStore, MockExtractionProducer, OpenRouterConfig,
    OpenRouterProducer, PgComponentStore, PipelineConfig, PipelineOrchestrator, QueryEngine,
    QueryFilters, Sentiment,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "finnews", about = "Financial news extraction and daily aggregation")]
struct Cli {
    /// Directory holding the per-date aggregate documents.
    #[arg(long, default_value = "data/master", global = true)]
    data_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the extraction pipeline over a day's article backlog.
    Process {
        /// Target date (YYYY-MM-DD).
        #[arg(long)]
        date: String,
        /// Directory holding per-date article dumps.
        #[arg(long, default_value = "data/articles")]
        articles_dir: String,
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
        /// Delay between article extractions, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        delay_ms: u64,
        /// Postgres URL for the component store; falls back to DATABASE_URL,
        /// then to an in-memory store.
        #[arg(long)]
        database_url: Option<String>,
    },
    /// Query a day's aggregate.
    Query {
        #[arg(long)]
        date: String,
        #[arg(long, value_delimiter = ',')]
        tickers: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        sectors: Vec<String>,
        /// Sentiment labels: positive, negative, neutral.
        #[arg(long, value_delimiter = ',')]
        sentiments: Vec<String>,
        #[arg(long)]
        market_moving: bool,
        #[arg(long)]
        min_confidence: Option<f64>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        full_content: bool,
    },
    /// Per-ticker analysis for a date.
    Ticker {
        #[arg(long)]
        date: String,
        #[arg(long)]
        symbol: String,
    },
    /// Per-sector analysis for a date.
    Sector {
        #[arg(long)]
        date: String,
        #[arg(long)]
        name: String,
    },
    /// Export the report bundle for a date.
    Report {
        #[arg(long)]
        date: String,
        #[arg(long, value_delimiter = ',')]
        tickers: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        sectors: Vec<String>,
    },
    /// List dates with aggregate data.
    Dates,
}

fn parse_sentiment(value: &str) -> anyhow::Result<Sentiment> {
    match value.to_lowercase().as_str() {
        "positive" => Ok(Sentiment::Positive),
        "negative" => Ok(Sentiment::Negative),
        "neutral" => Ok(Sentiment::Neutral),
        other => anyhow::bail!("unknown sentiment label: {}", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let store = Arc::new(AggregationStore::new(&cli.data_dir)?);

    match cli.command {
        Command::Process {
            date,
            articles_dir,
            batch_size,
            delay_ms,
            database_url,
        } => {
            let date = parse_date(&date)?;

            let component_store: Arc<dyn ComponentStore> = match database_url
                .or_else(|| std::env::var("DATABASE_URL").ok())
            {
                Some(url) => {
                    info!("Using Postgres component store");
                    Arc::new(
                        PgComponentStore::new(&url)
                            .await
                            .context("failed to connect to component store")?,
                    )
                }
                None => {
                    info!("DATABASE_URL not set, using in-memory component store");
                    Arc::new(MemoryComponentStore::new())
                }
            };

            let producer: Arc<dyn ExtractionProducer> =
                if std::env::var("OPENROUTER_API_KEY").is_ok() {
                    let config = OpenRouterConfig::from_env()?;
                    Arc::new(OpenRouterProducer::new(config)?)
                } else {
                    info!("OPENROUTER_API_KEY not set, using mock producer");
                    Arc::new(MockExtractionProducer::new("cli"))
                };

            let orchestrator = PipelineOrchestrator::new(
                Arc::new(JsonBacklogFeed::new(articles_dir)),
                producer,
                Arc::new(CompletenessTracker::new(component_store)),
                store,
                PipelineConfig {
                    batch_size,
                    article_delay: Duration::from_millis(delay_ms),
                    batch_delay: Duration::from_millis(delay_ms),
                },
            );

            let result = orchestrator.process_backlog(date).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Query {
            date,
            tickers,
            sectors,
            sentiments,
            market_moving,
            min_confidence,
            limit,
            full_content,
        } => {
            let date = parse_date(&date)?;
            let sentiments = sentiments
                .iter()
                .map(|s| parse_sentiment(s))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let engine = QueryEngine::new(store);
            let response = engine
                .query(
                    date,
                    &QueryFilters {
                        tickers,
                        sectors,
                        sentiments,
                        market_moving_only: market_moving,
                        min_confidence,
                        limit,
                        include_full_content: full_content,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Ticker { date, symbol } => {
            let date = parse_date(&date)?;
            let engine = QueryEngine::new(store);
            let analysis = engine.ticker_analysis(date, &symbol, false).await?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Command::Sector { date, name } => {
            let date = parse_date(&date)?;
            let engine = QueryEngine::new(store);
            let analysis = engine.sector_analysis(date, &name, false).await?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Command::Report {
            date,
            tickers,
            sectors,
        } => {
            let date = parse_date(&date)?;
            let engine = QueryEngine::new(store);
            let tickers = (!tickers.is_empty()).then_some(tickers);
            let sectors = (!sectors.is_empty()).then_some(sectors);
            let report = engine.export_report(date, tickers, sectors).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Dates => {
            let engine = QueryEngine::new(store);
            let dates = engine.available_dates()?;
            println!("{}", serde_json::to_string_pretty(&dates)?);
        }
    }

    Ok(())
}
