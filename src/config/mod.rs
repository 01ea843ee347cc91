//! Typed configuration from environment variables.
//!
//! Loads once at startup. Every setting is optional; malformed values fail
//! fast so a misconfigured worker never starts. Sensitive values are wrapped
//! in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    /// `postgres://…` selects PostgreSQL; anything else is a SQLite file.
    pub backlog_url: SecretString,
    pub tables: Tables,
    pub uploads_dir: PathBuf,
    pub engine: EngineConfig,
    pub pipeline: PipelineConfig,
    pub workers: usize,
    pub worker_id: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Table names for the backlog and the results store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    pub backlog: String,
    pub results: String,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            backlog: "artifact_events".to_string(),
            results: "analysis_results".to_string(),
        }
    }
}

impl Tables {
    /// Table names are spliced into SQL, so only plain identifiers pass.
    pub fn validate(&self) -> Result<()> {
        for name in [&self.backlog, &self.results] {
            let valid = !name.is_empty()
                && name.len() <= 63
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(Error::Config(format!("invalid table name: {name:?}")));
            }
        }
        if self.backlog == self.results {
            return Err(Error::Config(
                "backlog and results tables must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Analysis engine endpoint and optional submission fields.
#[derive(Debug)]
pub struct EngineConfig {
    /// Base URL, e.g. `http://cape:8000/apiv2`.
    pub url: String,
    pub timeout: Duration,
    pub api_token: Option<SecretString>,
    pub tags: String,
    pub priority: String,
    pub machine: String,
    pub options: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000/apiv2".to_string(),
            timeout: Duration::from_secs(120),
            api_token: None,
            tags: String::new(),
            priority: String::new(),
            machine: String::new(),
            options: String::new(),
        }
    }
}

/// Claim, dedup and retry behaviour of a worker.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub poll_interval: Duration,
    /// Items claimed per loop iteration.
    pub batch: usize,
    /// Upper bound on directory entries examined by resolver scans.
    pub scan_recent: usize,
    /// `None` means dedup across all time.
    pub dedup_window: Option<chrono::Duration>,
    pub lease: chrono::Duration,
    /// `None` means retry forever.
    pub max_attempts: Option<u32>,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch: 10,
            scan_recent: 200,
            dedup_window: Some(chrono::Duration::minutes(60)),
            lease: chrono::Duration::minutes(10),
            max_attempts: Some(10),
            retry_backoff: Duration::ZERO,
            retry_backoff_max: Duration::from_secs(3600),
        }
    }
}

/// Upper bounds for duration settings.
pub const MAX_POLL_SECS: f64 = 3600.0;
pub const MAX_LEASE_MINUTES: i64 = 7 * 24 * 60;
pub const MAX_DEDUP_MINUTES: i64 = 10 * 366 * 24 * 60;
pub const MAX_BACKOFF_SECS: u64 = 30 * 24 * 3600;

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| var(name).filter(|v| !v.trim().is_empty());
        let text = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());

        let tables = Tables {
            backlog: text("BACKLOG_TABLE", "artifact_events"),
            results: text("RESULTS_TABLE", "analysis_results"),
        };
        tables.validate()?;

        let engine = EngineConfig {
            url: text("ENGINE_URL", "http://127.0.0.1:8000/apiv2"),
            timeout: Duration::from_secs(parse_var(&var, "ENGINE_TIMEOUT_SECS", 120u64)?),
            api_token: var("ENGINE_API_TOKEN").map(SecretString::from),
            tags: text("ENGINE_TAGS", ""),
            priority: text("ENGINE_PRIORITY", ""),
            machine: text("ENGINE_MACHINE", ""),
            options: text("ENGINE_OPTIONS", ""),
        };

        let poll_secs: f64 = parse_var(&var, "POLL_SECS", 2.0)?;
        if !(0.0..=MAX_POLL_SECS).contains(&poll_secs) {
            return Err(Error::Config(format!(
                "POLL_SECS must be between 0 and {MAX_POLL_SECS}, got {poll_secs}"
            )));
        }
        let poll_interval = Duration::try_from_secs_f64(poll_secs)
            .map_err(|e| Error::Config(format!("POLL_SECS={poll_secs}: {e}")))?;

        let dedup_minutes: i64 = parse_var(&var, "DEDUP_MINUTES", 60)?;
        let lease_minutes: i64 = parse_var(&var, "LEASE_MINUTES", 10)?;
        let max_attempts: u32 = parse_var(&var, "MAX_ATTEMPTS", 10)?;
        let backoff_secs: u64 = parse_var(&var, "RETRY_BACKOFF_SECS", 0)?;
        let backoff_max_secs: u64 = parse_var(&var, "RETRY_BACKOFF_MAX_SECS", 3600)?;

        let dedup_window = if dedup_minutes > 0 {
            Some(minutes(
                at_most(dedup_minutes, MAX_DEDUP_MINUTES, "DEDUP_MINUTES")?,
                "DEDUP_MINUTES",
            )?)
        } else {
            None
        };

        let pipeline = PipelineConfig {
            poll_interval,
            batch: positive(parse_var(&var, "BATCH", 10usize)?, "BATCH")?,
            scan_recent: parse_var(&var, "SCAN_RECENT", 200usize)?,
            dedup_window,
            lease: minutes(
                at_most(
                    positive(lease_minutes, "LEASE_MINUTES")?,
                    MAX_LEASE_MINUTES,
                    "LEASE_MINUTES",
                )?,
                "LEASE_MINUTES",
            )?,
            max_attempts: (max_attempts > 0).then_some(max_attempts),
            retry_backoff: Duration::from_secs(at_most(
                backoff_secs,
                MAX_BACKOFF_SECS,
                "RETRY_BACKOFF_SECS",
            )?),
            retry_backoff_max: Duration::from_secs(at_most(
                backoff_max_secs,
                MAX_BACKOFF_SECS,
                "RETRY_BACKOFF_MAX_SECS",
            )?),
        };

        let default_worker = format!(
            "{}-{}",
            var("HOSTNAME").unwrap_or_else(|| "forwarder".to_string()),
            std::process::id()
        );

        Ok(Self {
            backlog_url: SecretString::from(text("BACKLOG_URL", "sqlite:forwarder.db")),
            tables,
            uploads_dir: PathBuf::from(text("UPLOADS_DIR", "/var/lib/nodepot/uploads")),
            engine,
            pipeline,
            workers: positive(parse_var(&var, "WORKERS", 1usize)?, "WORKERS")?,
            worker_id: var("WORKER_ID").unwrap_or(default_worker),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: text("LOG_LEVEL", "info"),
        })
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn at_most<T: PartialOrd + std::fmt::Display>(value: T, max: T, name: &str) -> Result<T> {
    if value <= max {
        Ok(value)
    } else {
        Err(Error::Config(format!("{name} must be at most {max}, got {value}")))
    }
}

fn minutes(value: i64, name: &str) -> Result<chrono::Duration> {
    chrono::Duration::try_minutes(value)
        .ok_or_else(|| Error::Config(format!("{name}={value} is out of range")))
}

fn positive<T: PartialOrd + Default + std::fmt::Display>(value: T, name: &str) -> Result<T> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(Error::Config(format!("{name} must be positive, got {value}")))
    }
}
