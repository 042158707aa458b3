mod config;
mod db;
mod enrich;
mod formatting;
mod github;
mod harvest;
mod sanitize;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, HarvestConfig, MAX_COUNT};
use db::Database;
use formatting::format_stars;
use github::GitHubClient;

#[derive(Parser)]
#[command(name = "gh-harvest")]
#[command(about = "Harvest GitHub repository metadata into SQLite")]
#[command(after_help = "\x1b[36mExamples:\x1b[0m
  gh-harvest harvest \"language:go stars:>1000\" --count 300
  gh-harvest harvest \"topic:cli\" --count 50 --no-save > batch.ndjson
  gh-harvest stats")]
struct Cli {
    /// Print per-request timing diagnostics
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search, enrich, and persist repositories
    Harvest {
        /// Search query (GitHub repository search syntax)
        query: String,

        /// Number of repositories to harvest (1 to 1000)
        #[arg(short, long, default_value = "100")]
        count: i64,

        /// Skip persistence; the batch still goes to stdout as NDJSON
        #[arg(long)]
        no_save: bool,

        /// Database file (default: platform data dir)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Concurrent enrichment workers
        #[arg(long, default_value = "5")]
        pool: usize,

        /// Results per search page (API max: 100)
        #[arg(long, default_value = "100")]
        page_size: usize,

        /// Pause between search pages, in milliseconds
        #[arg(long, default_value = "100")]
        delay_ms: u64,
    },

    /// Show statistics for the stored repositories
    Stats {
        /// Database file (default: platform data dir)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Check GitHub API rate limit
    RateLimit,
}

/// Reject harvest sizes the search API cannot serve, before any network
/// traffic happens.
fn validate_count(count: i64) -> Result<usize> {
    if count <= 0 {
        bail!("--count must be positive (got {})", count);
    }
    if count as usize > MAX_COUNT {
        bail!("--count must be at most {} (got {})", MAX_COUNT, count);
    }
    Ok(count as usize)
}

fn resolve_db_path(db: Option<PathBuf>) -> Result<PathBuf> {
    match db {
        Some(path) => Ok(path),
        None => Config::db_path(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Harvest {
            query,
            count,
            no_save,
            db,
            pool,
            page_size,
            delay_ms,
        } => {
            let count = validate_count(count)?;

            let config = HarvestConfig {
                pool: pool.max(1),
                page_size: page_size.clamp(1, 100), // API serves at most 100
                page_delay: Duration::from_millis(delay_ms),
                ..HarvestConfig::default()
            };

            let token = Config::github_token();
            if token.is_none() {
                eprintln!("\x1b[33m..\x1b[0m No GitHub token found. Rate limit: 60 req/hour");
                eprintln!("  Set GITHUB_TOKEN or run: gh auth login");
            }
            let client = GitHubClient::new(token, cli.debug)?;

            let database = if no_save {
                None
            } else {
                Some(Database::open(&resolve_db_path(db)?)?)
            };

            let stdout = io::stdout();
            let mut out = stdout.lock();
            let report =
                harvest::run_harvest(&client, database, &query, count, &config, &mut out).await?;
            if cli.debug {
                eprintln!(
                    "\x1b[90m[debug] harvested={} dropped={} written={}\x1b[0m",
                    report.harvested, report.dropped, report.written
                );
            }
            Ok(())
        }
        Commands::Stats { db } => {
            let database = Database::open(&resolve_db_path(db)?)?;
            show_stats(&database)
        }
        Commands::RateLimit => {
            let client = GitHubClient::new(Config::github_token(), cli.debug)?;
            check_rate_limit(&client).await
        }
    }
}

/// Show statistics
fn show_stats(db: &Database) -> Result<()> {
    let stats = db.stats()?;

    if stats.total == 0 {
        eprintln!("\x1b[31mx\x1b[0m No repositories stored yet.");
        eprintln!("  Run: gh-harvest harvest \"<query>\" to harvest some first.");
        return Ok(());
    }

    eprintln!("\x1b[36mStore Statistics\x1b[0m\n");
    eprintln!("  \x1b[90mRepositories:\x1b[0m {}", stats.total);
    eprintln!("  \x1b[90mTotal stars:\x1b[0m  {}", stats.total_stars);
    eprintln!("  \x1b[90mAvg stars:\x1b[0m    {:.1}", stats.avg_stars());
    if let Some((name, stars)) = &stats.most_starred {
        eprintln!(
            "  \x1b[90mTop repo:\x1b[0m     {} ({} stars)",
            name,
            format_stars(*stars)
        );
    }
    if let Some(last) = &stats.last_ingested {
        eprintln!("  \x1b[90mLast ingest:\x1b[0m  {}", last);
    }

    if !stats.by_language.is_empty() {
        eprintln!("\n  \x1b[90mLanguages:\x1b[0m");
        for (lang, count) in stats.by_language.iter().take(10) {
            eprintln!("    {:<16} {}", lang, count);
        }
    }

    Ok(())
}

/// Check rate limit
async fn check_rate_limit(client: &GitHubClient) -> Result<()> {
    let rates = client.rate_limit().await?;

    eprintln!("\x1b[36mGitHub API Rate Limit\x1b[0m\n");
    for (name, rate) in [("core", &rates.core), ("search", &rates.search)] {
        let reset_time = chrono::DateTime::from_timestamp(rate.reset as i64, 0)
            .map(|dt| dt.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "?".to_string());
        eprintln!(
            "  \x1b[90m{:<7}\x1b[0m {}/{} remaining, resets at {}",
            name, rate.remaining, rate.limit, reset_time
        );
    }

    Ok(())
}
