//! SQLite persistence: one durable row per repository, keyed by full name.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::enrich::Repository;

#[derive(Debug)]
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // Set busy timeout to handle concurrent access from multiple CLI instances
        // SQLite will retry for up to 30 seconds before returning SQLITE_BUSY
        conn.busy_timeout(Duration::from_secs(30))?;

        let db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database for testing
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS repos (
                full_name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                language TEXT,
                stars INTEGER NOT NULL DEFAULT 0,
                watchers INTEGER NOT NULL DEFAULT 0,
                forks INTEGER NOT NULL DEFAULT 0,
                open_issues INTEGER NOT NULL DEFAULT 0,
                fork INTEGER NOT NULL DEFAULT 0,
                archived INTEGER NOT NULL DEFAULT 0,
                disabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT,
                updated_at TEXT,
                pushed_at TEXT,
                homepage TEXT,
                license TEXT,
                topics TEXT NOT NULL DEFAULT '[]',
                languages TEXT NOT NULL DEFAULT '{}',
                readme TEXT,
                raw_json TEXT NOT NULL,
                last_ingested TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_repos_stars ON repos(stars DESC);
            CREATE INDEX IF NOT EXISTS idx_repos_language ON repos(language);
            ",
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    /// Persist one harvest batch in a single transaction.
    ///
    /// Insert-or-replace keyed on `full_name`: every column of an existing
    /// row takes the new record's value, even when that value is empty.
    /// Nothing is merged. The `last_ingested` stamp is taken once per batch
    /// at write time, and any failure rolls the whole batch back.
    pub fn upsert_batch(&self, repos: &[Repository]) -> Result<usize> {
        if repos.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339();

        self.conn.execute("BEGIN IMMEDIATE", [])?;

        match self.upsert_all(repos, &now) {
            Ok(written) => {
                self.conn.execute("COMMIT", [])?;
                Ok(written)
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    fn upsert_all(&self, repos: &[Repository], now: &str) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO repos (
                full_name, owner, name, description, language,
                stars, watchers, forks, open_issues,
                fork, archived, disabled,
                created_at, updated_at, pushed_at,
                homepage, license, topics, languages, readme,
                raw_json, last_ingested
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                      ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
            ON CONFLICT(full_name) DO UPDATE SET
                owner = excluded.owner,
                name = excluded.name,
                description = excluded.description,
                language = excluded.language,
                stars = excluded.stars,
                watchers = excluded.watchers,
                forks = excluded.forks,
                open_issues = excluded.open_issues,
                fork = excluded.fork,
                archived = excluded.archived,
                disabled = excluded.disabled,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                pushed_at = excluded.pushed_at,
                homepage = excluded.homepage,
                license = excluded.license,
                topics = excluded.topics,
                languages = excluded.languages,
                readme = excluded.readme,
                raw_json = excluded.raw_json,
                last_ingested = excluded.last_ingested",
        )?;

        for repo in repos {
            let topics_json =
                serde_json::to_string(&repo.topics).context("Failed to serialize topics")?;
            let languages_json =
                serde_json::to_string(&repo.languages).context("Failed to serialize languages")?;
            let raw_json =
                serde_json::to_string(repo).context("Failed to serialize record snapshot")?;

            stmt.execute(params![
                repo.full_name,
                repo.owner,
                repo.name,
                repo.description,
                repo.language,
                repo.stars as i64,
                repo.watchers as i64,
                repo.forks as i64,
                repo.open_issues as i64,
                repo.fork,
                repo.archived,
                repo.disabled,
                repo.created_at,
                repo.updated_at,
                repo.pushed_at,
                repo.homepage,
                repo.license,
                topics_json,
                languages_json,
                repo.readme,
                raw_json,
                now,
            ])?;
        }

        Ok(repos.len())
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM repos", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Aggregates over the whole store, for the `stats` subcommand.
    pub fn stats(&self) -> Result<StoreStats> {
        use rusqlite::OptionalExtension;

        let total = self.count()?;

        let total_stars: i64 =
            self.conn
                .query_row("SELECT COALESCE(SUM(stars), 0) FROM repos", [], |row| {
                    row.get(0)
                })?;

        let most_starred = self
            .conn
            .query_row(
                "SELECT full_name, stars FROM repos ORDER BY stars DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;

        let last_ingested: Option<String> =
            self.conn
                .query_row("SELECT MAX(last_ingested) FROM repos", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(language, 'unknown'), COUNT(*)
             FROM repos GROUP BY language ORDER BY COUNT(*) DESC, language",
        )?;
        let by_language = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StoreStats {
            total,
            by_language,
            total_stars: total_stars as u64,
            most_starred,
            last_ingested,
        })
    }

    /// Read one row back; tests use this to check replacement semantics.
    #[cfg(test)]
    pub fn get_repo(&self, full_name: &str) -> Result<Option<StoredRepo>> {
        use rusqlite::OptionalExtension;

        let row = self
            .conn
            .query_row(
                "SELECT full_name, description, language, stars, topics, languages,
                        readme, raw_json, last_ingested
                 FROM repos WHERE full_name = ?1",
                params![full_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((full_name, description, language, stars, topics, languages, readme, raw_json, last_ingested)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(StoredRepo {
            full_name,
            description,
            language,
            stars: stars as u64,
            topics: serde_json::from_str(&topics).context("Bad topics column")?,
            languages: serde_json::from_str(&languages).context("Bad languages column")?,
            readme,
            raw_json,
            last_ingested,
        }))
    }

    /// Direct SQL access for test setup.
    #[cfg(test)]
    pub fn exec_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

/// Aggregate numbers for the whole store.
#[derive(Debug)]
pub struct StoreStats {
    pub total: usize,
    pub by_language: Vec<(String, usize)>,
    pub total_stars: u64,
    pub most_starred: Option<(String, u64)>,
    pub last_ingested: Option<String>,
}

impl StoreStats {
    pub fn avg_stars(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_stars as f64 / self.total as f64
        }
    }
}

/// A stored row, as tests read it back.
#[cfg(test)]
#[derive(Debug)]
pub struct StoredRepo {
    pub full_name: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub stars: u64,
    pub topics: Vec<String>,
    pub languages: std::collections::BTreeMap<String, u64>,
    pub readme: Option<String>,
    pub raw_json: String,
    pub last_ingested: String,
}

/// Run the batch write under its deadline on the blocking pool.
///
/// SQLite work must stay off the async runtime, and a wedged write must not
/// hold the store's lock forever. An elapsed timeout only abandons the
/// `await`; the blocking task would keep writing, so the connection is
/// interrupted as well. The in-flight statement then fails with
/// SQLITE_INTERRUPT, the transaction rolls back, and the store keeps none
/// of the batch.
pub async fn write_batch(
    db: Database,
    repos: Vec<Repository>,
    deadline: Duration,
) -> Result<(Database, usize)> {
    let interrupt = db.conn.get_interrupt_handle();
    let write = tokio::task::spawn_blocking(move || {
        let written = db.upsert_batch(&repos)?;
        Ok::<_, anyhow::Error>((db, written))
    });

    match tokio::time::timeout(deadline, write).await {
        Ok(joined) => joined.map_err(|e| anyhow::anyhow!("Batch write task failed: {}", e))?,
        Err(_) => {
            interrupt.interrupt();
            anyhow::bail!("Batch write timed out after {}s", deadline.as_secs())
        }
    }
}
