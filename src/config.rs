use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

use crate::sanitize::DOC_CHAR_CAP;

/// Hard ceiling on a single harvest. The search API itself stops serving
/// results past this point, so anything larger is a mistake.
pub const MAX_COUNT: usize = 1000;

pub struct Config;

impl Config {
    /// Get the data directory path
    fn data_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "gh-harvest", "gh-harvest")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .context("Could not determine data directory")
    }

    /// Get the database file path
    pub fn db_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("repos.db"))
    }

    /// Get GitHub token from environment or gh CLI config
    pub fn github_token() -> Option<String> {
        // First try environment variable
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.is_empty() {
                return Some(token);
            }
        }

        // Try GH_TOKEN (used by gh CLI)
        if let Ok(token) = std::env::var("GH_TOKEN") {
            if !token.is_empty() {
                return Some(token);
            }
        }

        // Try to get from gh CLI config
        if let Ok(output) = std::process::Command::new("gh")
            .args(["auth", "token"])
            .output()
        {
            if output.status.success() {
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }

        None
    }
}

/// Tunables for one harvest run. Defaults mirror the long-standing
/// constants; the CLI overrides pool, page size, and page delay.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Ceiling on concurrently enriched repositories, across the whole run
    pub pool: usize,
    /// Results per search page (the API serves at most 100)
    pub page_size: usize,
    /// Courtesy pause between successive search pages
    pub page_delay: Duration,
    /// Deadline for one facet fetch
    pub facet_timeout: Duration,
    /// Deadline for one search page fetch
    pub page_timeout: Duration,
    /// Deadline for the whole batch write
    pub write_timeout: Duration,
    /// Character cap on the primary document
    pub doc_cap: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            pool: 5,
            page_size: 100,
            page_delay: Duration::from_millis(100),
            facet_timeout: Duration::from_secs(30),
            page_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(120),
            doc_cap: DOC_CHAR_CAP,
        }
    }
}
