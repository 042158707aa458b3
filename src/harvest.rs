//! End-to-end harvest driver: paginate, enrich, dump, persist, report.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use crate::config::HarvestConfig;
use crate::db::{write_batch, Database};
use crate::enrich::{enrich_all, Repository};
use crate::formatting::{format_stars, truncate_str};
use crate::github::{paginate_search, HarvestSource};

/// What a finished run did.
#[derive(Debug)]
pub struct HarvestReport {
    pub harvested: usize,
    pub dropped: usize,
    pub written: usize,
}

/// Aggregate statistics over one assembled batch.
#[derive(Debug)]
pub struct BatchStats {
    pub total: usize,
    pub by_language: Vec<(String, usize)>,
    pub total_stars: u64,
    pub most_starred: Option<(String, u64)>,
}

impl BatchStats {
    pub fn compute(batch: &[Repository]) -> Self {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for repo in batch {
            let lang = repo
                .language
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            *counts.entry(lang).or_default() += 1;
        }
        let mut by_language: Vec<_> = counts.into_iter().collect();
        by_language.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Self {
            total: batch.len(),
            by_language,
            total_stars: batch.iter().map(|r| r.stars).sum(),
            most_starred: batch
                .iter()
                .max_by_key(|r| r.stars)
                .map(|r| (r.full_name.clone(), r.stars)),
        }
    }

    pub fn avg_stars(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_stars as f64 / self.total as f64
        }
    }
}

/// Line-delimited JSON dump of the batch, one record per line.
fn write_ndjson(out: &mut dyn Write, batch: &[Repository]) -> Result<()> {
    for repo in batch {
        serde_json::to_writer(&mut *out, repo).context("Failed to serialize record")?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn print_summary(stats: &BatchStats, dropped: usize, written: usize, elapsed: Duration) {
    eprintln!("\n\x1b[36mHarvest summary\x1b[0m");
    eprintln!("  \x1b[90mHarvested:\x1b[0m   {}", stats.total);
    if dropped > 0 {
        eprintln!(
            "  \x1b[90mDropped:\x1b[0m     {} (unusable search results)",
            dropped
        );
    }
    eprintln!("  \x1b[90mWritten:\x1b[0m     {}", written);
    eprintln!("  \x1b[90mTotal stars:\x1b[0m {}", stats.total_stars);
    eprintln!("  \x1b[90mAvg stars:\x1b[0m   {:.1}", stats.avg_stars());
    if let Some((name, stars)) = &stats.most_starred {
        eprintln!(
            "  \x1b[90mTop repo:\x1b[0m    {} ({} stars)",
            name,
            format_stars(*stars)
        );
    }
    if !stats.by_language.is_empty() {
        eprintln!("  \x1b[90mLanguages:\x1b[0m");
        for (lang, count) in stats.by_language.iter().take(10) {
            eprintln!("    {:<16} {}", lang, count);
        }
    }
    eprintln!("  \x1b[90mElapsed:\x1b[0m     {:.1}s", elapsed.as_secs_f32());
}

/// Run one harvest end to end.
///
/// The batch always goes to `out` as NDJSON, whether or not persistence is
/// enabled and before it is attempted, so a failed write never loses the
/// harvested data. Only pagination and persistence errors abort the run;
/// enrichment failures degrade individual records instead.
pub async fn run_harvest(
    source: &dyn HarvestSource,
    db: Option<Database>,
    query: &str,
    target: usize,
    config: &HarvestConfig,
    out: &mut dyn Write,
) -> Result<HarvestReport> {
    let started = std::time::Instant::now();

    eprintln!(
        "\x1b[36m..\x1b[0m Searching \"{}\" (target: {})",
        query, target
    );

    let results = paginate_search(source, query, target, config)
        .await
        .context("Harvest failed during search pagination")?;

    // Results without a usable identity are dropped here, before any
    // enrichment is spent on them. Counted and logged, never fatal.
    let mut dropped = 0;
    let valid: Vec<_> = results
        .into_iter()
        .filter(|repo| {
            if repo.is_valid() {
                true
            } else {
                dropped += 1;
                eprintln!(
                    "  \x1b[33m!\x1b[0m dropping unusable result (full_name: {:?})",
                    truncate_str(&repo.full_name, 40)
                );
                false
            }
        })
        .collect();

    if valid.is_empty() {
        eprintln!("\x1b[33m!\x1b[0m No usable results for this query");
        print_summary(&BatchStats::compute(&[]), dropped, 0, started.elapsed());
        return Ok(HarvestReport {
            harvested: 0,
            dropped,
            written: 0,
        });
    }

    eprintln!(
        "\x1b[36m..\x1b[0m Enriching {} repos ({} workers)",
        valid.len(),
        config.pool.max(1)
    );

    let batch = enrich_all(source, valid, config).await;
    let stats = BatchStats::compute(&batch);

    write_ndjson(out, &batch).context("Failed to write batch dump")?;

    let written = match db {
        Some(db) => {
            eprintln!(
                "\x1b[36m..\x1b[0m Writing {} repos to {}",
                batch.len(),
                db.path().display()
            );
            let (_db, written) = write_batch(db, batch, config.write_timeout)
                .await
                .context("Harvest failed during persistence")?;
            eprintln!("\x1b[32mok\x1b[0m Batch committed");
            written
        }
        None => {
            eprintln!("\x1b[90m--\x1b[0m Persistence disabled, batch not written");
            0
        }
    };

    print_summary(&stats, dropped, written, started.elapsed());

    Ok(HarvestReport {
        harvested: stats.total,
        dropped,
        written,
    })
}
