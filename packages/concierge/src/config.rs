use anyhow::{Context, Result};
use controlflow::ResumeSettings;
use dotenvy::dotenv;
use std::env;

/// Default `RUST_LOG` directives when none are set.
pub const DEFAULT_LOG_FILTER: &str = "info,concierge=debug,concierge_core=debug,controlflow=debug";

/// Prefix of the journal tail's resume settings (`CONCIERGE_FEED_MIN_BACKOFF_MS`, ...).
pub const FEED_ENV_PREFIX: &str = "CONCIERGE_FEED";

/// Concierge configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ConciergeConfig {
    /// Backoff and restart budget of the journal tail.
    pub feed: ResumeSettings,
    /// Capacity of the dispatcher session's inbox.
    pub inbox_capacity: usize,
    /// Entries served per journal cursor before it expires.
    pub journal_cursor_limit: Option<usize>,
}

impl ConciergeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            feed: ResumeSettings::from_env(FEED_ENV_PREFIX)
                .context("Failed to load journal feed settings")?,
            inbox_capacity: env::var("CONCIERGE_INBOX_CAPACITY")
                .unwrap_or_else(|_| "1024".to_string())
                .parse()
                .context("CONCIERGE_INBOX_CAPACITY must be a valid number")?,
            journal_cursor_limit: env::var("CONCIERGE_JOURNAL_CURSOR_LIMIT")
                .ok()
                .map(|raw| raw.parse())
                .transpose()
                .context("CONCIERGE_JOURNAL_CURSOR_LIMIT must be a valid number")?,
        })
    }
}
