use std::path::PathBuf;
use std::sync::Arc;

use brascrap::dimension::TopicId;
use brascrap::process::{load_catalog, merge_topic, populate, Orchestrator};
use brascrap::queue::RequestQueue;
use brascrap::request::HttpConnector;
use brascrap::{info_time, Config, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "brascrap", version, about = "Harvests the BRÅ crime statistics portal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Request queue database, overrides the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Maximum estimated rows per request, overrides the config file
    #[arg(long, global = true)]
    row_limit: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan the tiles of each topic and queue them as pending requests
    Populate {
        /// Only these topics (default: every topic in the catalog)
        #[arg(long = "topic")]
        topics: Vec<u32>,
        /// Keep the existing queue instead of resetting it
        #[arg(long)]
        keep_existing: bool,
    },
    /// Execute pending requests
    Scrape {
        #[arg(long = "topic")]
        topics: Vec<u32>,
    },
    /// Execute every request that is not done yet
    Resume,
    /// Show request counts per status
    Status {
        #[arg(long)]
        topic: Option<u32>,
    },
    /// Merge the stored responses of a topic into one CSV file
    Merge {
        #[arg(long)]
        topic: u32,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Drop all requests and responses
    Reset,
}

fn init_logging(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(row_limit) = cli.row_limit {
        config.row_limit = row_limit;
    }
    config.validate()?;
    Ok(config)
}

fn topic_ids(ids: &[u32]) -> Vec<TopicId> {
    ids.iter().copied().map(TopicId).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let start_time = Local::now();
    let config = load_config(&cli)?;
    let queue = Arc::new(RequestQueue::from_config(&config)?);
    let connector = HttpConnector::new(&config);

    match cli.command {
        Commands::Populate {
            topics,
            keep_existing,
        } => {
            let catalog = load_catalog(&connector, &config.catalog_path).await?;
            let topics = if topics.is_empty() {
                catalog.topic_ids()
            } else {
                topic_ids(&topics)
            };
            let report = populate(&queue, &catalog, &topics, config.row_limit, !keep_existing)?;
            for (topic, e) in &report.failed {
                error!(%topic, error = %e, "topic not queued");
            }
            info_time!(
                "Queued {} requests for {} topics, {} failed",
                report.queued,
                topics.len() - report.failed.len(),
                report.failed.len()
            );
        }
        Commands::Scrape { topics } => {
            let orchestrator = Orchestrator::new(connector, queue, config.persist_capacity);
            let topics = topic_ids(&topics);
            let selected = (!topics.is_empty()).then_some(topics.as_slice());
            orchestrator.run(selected).await?;
        }
        Commands::Resume => {
            let orchestrator = Orchestrator::new(connector, queue, config.persist_capacity);
            orchestrator.run(None).await?;
        }
        Commands::Status { topic } => {
            let counts = queue.status_counts(topic.map(TopicId))?;
            println!(
                "pending: {}\ndone: {}\nerror: {}\ntotal: {}",
                counts.pending,
                counts.done,
                counts.error,
                counts.total()
            );
        }
        Commands::Merge { topic, output } => {
            merge_topic(&queue, TopicId(topic), &output)?;
        }
        Commands::Reset => {
            queue.reset_all()?;
        }
    }

    info_time!(start_time, "Full program time:");
    Ok(())
}
