//! Settings for resumable sources, loadable from config files or the environment.
//!
//! [`ResumeSettings`] holds plain numbers so it can come from anywhere (serde,
//! env vars, CLI flags). Converting it into typed values validates it:
//!
//! ```ignore
//! let settings = ResumeSettings::from_env("THINGS_FEED")?;
//! let source = ResumableSource::builder(0u64)
//!     .settings(&settings)
//!     .resume(|offset| journal.read_from(offset))
//!     .next_seed(|last: Vec<Entry>| last.last().map_or(0, |e| e.seq + 1))
//!     .build()?;
//! ```

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::backoff::{BackoffPolicy, RestartBudget};
use crate::error::FlowError;

fn default_min_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    120_000
}

fn default_max_restarts() -> i64 {
    -1
}

fn default_recovery_period_ms() -> u64 {
    300_000
}

fn default_look_behind() -> i64 {
    1
}

/// Unvalidated resumable-source parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResumeSettings {
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Negative: unlimited. Zero: the first failure is terminal.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: i64,
    #[serde(default = "default_recovery_period_ms")]
    pub recovery_period_ms: u64,
    /// How many emitted elements to remember for seed recomputation.
    #[serde(default = "default_look_behind")]
    pub look_behind: i64,
}

impl Default for ResumeSettings {
    fn default() -> Self {
        Self {
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_restarts: default_max_restarts(),
            recovery_period_ms: default_recovery_period_ms(),
            look_behind: default_look_behind(),
        }
    }
}

impl ResumeSettings {
    /// Load settings from `<PREFIX>_MIN_BACKOFF_MS`, `<PREFIX>_MAX_BACKOFF_MS`,
    /// `<PREFIX>_MAX_RESTARTS`, `<PREFIX>_RECOVERY_PERIOD_MS` and
    /// `<PREFIX>_LOOK_BEHIND`.
    ///
    /// Unset variables fall back to defaults. A `.env` file is honored if present.
    pub fn from_env(prefix: &str) -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        Ok(Self {
            min_backoff_ms: var_or(prefix, "MIN_BACKOFF_MS", defaults.min_backoff_ms)?,
            max_backoff_ms: var_or(prefix, "MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            max_restarts: var_or(prefix, "MAX_RESTARTS", defaults.max_restarts)?,
            recovery_period_ms: var_or(
                prefix,
                "RECOVERY_PERIOD_MS",
                defaults.recovery_period_ms,
            )?,
            look_behind: var_or(prefix, "LOOK_BEHIND", defaults.look_behind)?,
        })
    }

    /// Validate into a [`BackoffPolicy`].
    pub fn policy(&self) -> Result<BackoffPolicy, FlowError> {
        BackoffPolicy::new(
            Duration::from_millis(self.min_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            RestartBudget::from_signed(self.max_restarts),
            Duration::from_millis(self.recovery_period_ms),
        )
    }

    /// Validate the look-behind size.
    pub fn look_behind(&self) -> Result<usize, FlowError> {
        usize::try_from(self.look_behind).map_err(|_| {
            FlowError::invalid(
                "look_behind",
                format!("must not be negative, got {}", self.look_behind),
            )
        })
    }
}

fn var_or<T>(prefix: &str, suffix: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let name = format!("{}_{}", prefix, suffix);
    match env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", name, raw)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e @ env::VarError::NotUnicode(_)) => {
            Err(e).with_context(|| format!("{} must be a valid number", name))
        }
    }
}
