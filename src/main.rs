mod config;
mod db;
mod error;
mod extract;
mod fetcher;
mod normalize;
mod pipeline;
mod sitemap;
mod transform;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use regex::Regex;
use tracing::{info, warn};

use crate::config::Settings;
use crate::extract::tagger::{LexiconTagger, PosTagger};
use crate::extract::tokenizer::KanjiTokenizer;
use crate::extract::translate::PosTable;
use crate::fetcher::HttpFetcher;
use crate::pipeline::{Pipeline, PipelineOptions};

#[derive(Parser)]
#[command(name = "jp_news_pipeline", about = "Incremental kanji extraction from Japanese news")]
struct Cli {
    /// TOML settings file (JPNEWS_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Max concurrent article fetches
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    /// Hide progress bars
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the ledger and token tables
    Init,
    /// List candidate article URLs found on the configured sources
    Discover,
    /// Ingest new articles: dedup, fetch, extract, filter, append
    Run {
        /// Candidate article URLs
        urls: Vec<String>,
        /// File with one candidate URL per line
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Also discover candidates from the configured sources
        #[arg(short, long)]
        discover: bool,
        /// Print the appended rows as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Release ledger URLs of runs that never committed
    Reconcile,
    /// Show ledger and token table statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    if let Some(n) = cli.concurrency {
        settings.concurrency = n;
    }
    if cli.quiet {
        settings.progress = false;
    }
    settings.concurrency = settings.concurrency.max(1);
    info!(settings = ?settings, "Settings loaded");

    let result = match cli.command {
        Commands::Init => {
            let conn = open_db(&settings.db_path)?;
            drop(conn);
            println!("Schema ready at {}", settings.db_path.display());
            Ok(())
        }
        Commands::Discover => {
            let urls = discover(&settings).await?;
            for url in &urls {
                println!("{}", url);
            }
            eprintln!("{} candidate urls", urls.len());
            Ok(())
        }
        Commands::Run {
            urls,
            file,
            discover: with_discovery,
            json,
        } => {
            let mut candidates = urls;
            if let Some(path) = file {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                candidates.extend(raw.lines().map(str::to_string));
            }
            if with_discovery {
                candidates.extend(discover(&settings).await?);
            }
            if candidates.is_empty() {
                println!("No candidate URLs. Pass URLs, --file or --discover.");
                return Ok(());
            }

            ensure_parent_dir(&settings.db_path)?;
            let pipeline = build_pipeline(&settings)?;
            let report = pipeline.run(&candidates, &settings.db_path).await?;

            println!(
                "Run {}: {} candidates, {} already known, {} new ({} raced).",
                report.run_id,
                report.candidates,
                report.already_known,
                report.new_urls.len(),
                report.raced.len()
            );
            if !report.skipped.is_empty() {
                println!("Skipped {} urls (will be retried next run):", report.skipped.len());
                for s in &report.skipped {
                    println!("  {}: {}", s.url, s.reason);
                }
            }
            println!("Appended {} rows to japan_news.", report.records.len());
            if json {
                for r in &report.records {
                    println!("{}", serde_json::to_string(r)?);
                }
            }
            Ok(())
        }
        Commands::Reconcile => {
            ensure_parent_dir(&settings.db_path)?;
            let released = pipeline::reconcile(&settings.db_path)?;
            println!("Released {} ledger urls of uncommitted runs.", released);
            Ok(())
        }
        Commands::Stats => {
            let conn = open_db(&settings.db_path)?;
            let s = db::get_stats(&conn)?;
            println!("Ledger urls:  {}", s.ledger_urls);
            println!("Pending urls: {}", s.pending_urls);
            println!("Token rows:   {}", s.token_rows);
            println!("Runs:         {}", s.runs);
            println!("Last commit:  {}", s.last_commit.as_deref().unwrap_or("-"));
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

fn open_db(path: &Path) -> anyhow::Result<rusqlite::Connection> {
    ensure_parent_dir(path)?;
    let conn = db::connect(path).with_context(|| format!("Failed to open {}", path.display()))?;
    db::init_schema(&conn)?;
    Ok(conn)
}

async fn discover(settings: &Settings) -> anyhow::Result<Vec<String>> {
    if settings.sources.is_empty() {
        anyhow::bail!("No sources configured (set `sources` or JPNEWS_SOURCES)");
    }
    let pattern = settings
        .link_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("Invalid link_pattern")?;
    let fetcher = HttpFetcher::new(&settings.fetch_options())?;
    Ok(sitemap::discover(&fetcher, &settings.sources, pattern.as_ref()).await)
}

fn build_pipeline(settings: &Settings) -> anyhow::Result<Pipeline> {
    let tagger: Arc<dyn PosTagger> = match &settings.lexicon_path {
        Some(path) => {
            let lexicon = LexiconTagger::from_json_file(path, settings.default_pos.as_str())?;
            if lexicon.is_empty() {
                warn!(
                    "POS lexicon {} is empty, every compound is tagged {}",
                    path.display(),
                    settings.default_pos
                );
            } else {
                info!(entries = lexicon.len(), "Loaded POS lexicon from {}", path.display());
            }
            Arc::new(lexicon)
        }
        None => Arc::new(LexiconTagger::new(Default::default(), settings.default_pos.as_str())),
    };

    Ok(Pipeline {
        fetcher: Arc::new(HttpFetcher::new(&settings.fetch_options())?),
        tokenizer: Arc::new(KanjiTokenizer),
        tagger,
        translator: Arc::new(PosTable::with_extra(settings.pos_glosses.clone())),
        options: PipelineOptions {
            concurrency: settings.concurrency,
            excluded_pos: settings.excluded_pos_set(),
            duplicate_policy: settings.duplicate_policy,
            stale_after_secs: settings.stale_run_secs,
            progress: settings.progress,
        },
    })
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
