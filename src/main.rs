use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{ArgGroup, CommandFactory, Parser};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use kb_crawler::crawler::{CrawlOptions, CrawlTargets, Crawler};
use kb_crawler::db::Repository;
use kb_crawler::{AppError, Config};

#[derive(Debug, Parser)]
#[command(
    name = "kb-crawler",
    version,
    about = "Crawl knowledge-base articles into a local catalog"
)]
#[command(group(ArgGroup::new("target").required(true).args(["kb", "start"])))]
struct Cli {
    /// Crawl a single article id
    #[arg(long, conflicts_with_all = ["start", "end"])]
    kb: Option<u64>,

    /// First id of the range (inclusive)
    #[arg(long, requires = "end")]
    start: Option<u64>,

    /// Last id of the range (inclusive)
    #[arg(long, requires = "start")]
    end: Option<u64>,

    /// Number of concurrent workers
    #[arg(long, visible_alias = "workers")]
    threads: Option<usize>,

    /// Re-crawl and overwrite articles that are already stored
    #[arg(long)]
    force: bool,

    /// Re-download images even when a local copy exists
    #[arg(long)]
    refresh_resources: bool,

    /// Path to config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the database path
    #[arg(long)]
    db: Option<String>,

    /// Override the root directory for images and attachments
    #[arg(long)]
    static_root: Option<String>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn targets(&self) -> Result<CrawlTargets, AppError> {
        match (self.kb, self.start, self.end) {
            (Some(id), _, _) => CrawlTargets::single(id),
            (None, Some(start), Some(end)) => CrawlTargets::range(start, end),
            _ => Err(AppError::Config(
                "either --kb or --start with --end is required".to_string(),
            )),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kb_crawler=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let targets = match cli.targets() {
        Ok(targets) => targets,
        Err(e) => Cli::command().error(ErrorKind::ValueValidation, e).exit(),
    };

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(root) = &cli.static_root {
        config.static_root = root.clone();
    }
    if let Some(threads) = cli.threads {
        config.workers = threads;
    }
    config.validate()?;

    let repo = Repository::new(&config.db_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.db_path))?;

    // First Ctrl+C stops handing out ids; second one exits immediately.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl+C, finishing in-flight articles...");
            eprintln!("Press Ctrl+C again to force quit");
            let _ = shutdown_tx.send(true);

            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nForce quit requested, exiting immediately...");
                std::process::exit(130);
            }
        }
    });

    let show_progress = !cli.json && std::io::stderr().is_terminal();
    let crawler = Crawler::new(&config, Arc::new(repo), cli.refresh_resources)?
        .with_shutdown(shutdown_rx)
        .with_progress(show_progress);

    let summary = Arc::new(crawler)
        .run(
            targets,
            CrawlOptions {
                workers: config.workers,
                force: cli.force,
            },
        )
        .await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }

    Ok(())
}
