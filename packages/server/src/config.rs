use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

use crate::kernel::jobs::{Backoff, QueueConfig};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub mode: Mode,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub queues: Vec<QueueConfig>,
    pub engine: EngineConfig,
}

/// Process mode flag. Only gates verbose error messages and logging defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Development,
    Production,
}

impl Mode {
    pub fn is_development(self) -> bool {
        matches!(self, Mode::Development)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

/// Recognized for a Redis-backed broker deployment. The bundled broker is
/// in-memory; these settings are parsed and logged but otherwise inert.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u32,
}

/// Engine-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on any computed retry delay.
    pub backoff_ceiling_ms: u64,
    /// Durable `active` records older than this are recovered on boot.
    pub stale_threshold_ms: u64,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_grace_ms: u64,
}

/// Built-in queue types with their default tuning. Every field can be
/// overridden per type via `{TYPE}_CONCURRENCY`, `{TYPE}_MAX_RETRIES`,
/// `{TYPE}_RETRY_DELAY`, `{TYPE}_BACKOFF`, `{TYPE}_KEEP_COMPLETED`,
/// `{TYPE}_KEEP_FAILED`, and `{TYPE}_TIMEOUT`.
const DEFAULT_QUEUES: &[(&str, usize, u32, u64, Backoff)] = &[
    ("email", 5, 3, 5_000, Backoff::Exponential),
    ("image", 3, 2, 10_000, Backoff::Exponential),
    ("file", 2, 3, 15_000, Backoff::Fixed),
    ("export", 2, 2, 30_000, Backoff::Fixed),
    ("api", 8, 5, 2_000, Backoff::Exponential),
    ("cleanup", 1, 1, 60_000, Backoff::Fixed),
];

const DEFAULT_KEEP_COMPLETED: u64 = 100;
const DEFAULT_KEEP_FAILED: u64 = 500;

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mode = match env::var("APP_ENV").as_deref() {
            Ok("production") => Mode::Production,
            _ => Mode::Development,
        };

        let queues = DEFAULT_QUEUES
            .iter()
            .map(|(name, concurrency, max_retries, retry_delay_ms, backoff)| {
                queue_from_env(name, *concurrency, *max_retries, *retry_delay_ms, *backoff)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            port: parsed_var("PORT")?.unwrap_or(3000),
            mode,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            database: DatabaseConfig {
                url: database_url()?,
                pool_size: parsed_var("DB_POOL_SIZE")?.unwrap_or(20),
            },
            redis: RedisConfig {
                host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: parsed_var("REDIS_PORT")?.unwrap_or(6379),
                password: env::var("REDIS_PASSWORD").ok(),
                db: parsed_var("REDIS_DB")?.unwrap_or(0),
            },
            queues,
            engine: EngineConfig {
                backoff_ceiling_ms: parsed_var("BACKOFF_CEILING_MS")?.unwrap_or(600_000),
                stale_threshold_ms: parsed_var("STALE_THRESHOLD_MS")?.unwrap_or(60_000),
                shutdown_grace_ms: parsed_var("SHUTDOWN_GRACE_MS")?.unwrap_or(30_000),
            },
        })
    }
}

/// Compose the Postgres connection URL. `DATABASE_URL` wins when set;
/// otherwise the URL is built from the discrete `DB_*` variables.
fn database_url() -> Result<String> {
    if let Ok(url) = env::var("DATABASE_URL") {
        return Ok(url);
    }

    let host = env::var("DB_HOST").context("DB_HOST (or DATABASE_URL) must be set")?;
    let port: u16 = parsed_var("DB_PORT")?.unwrap_or(5432);
    let name = env::var("DB_NAME").context("DB_NAME must be set")?;
    let user = env::var("DB_USER").context("DB_USER must be set")?;
    let password = env::var("DB_PASSWORD").unwrap_or_default();
    let ssl = env::var("DB_SSL")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let mut url = format!("postgres://{user}:{password}@{host}:{port}/{name}");
    if ssl {
        url.push_str("?sslmode=require");
    }
    Ok(url)
}

/// Build one queue's config from `{TYPE}_*` variables over the given defaults.
fn queue_from_env(
    name: &str,
    concurrency: usize,
    max_retries: u32,
    retry_delay_ms: u64,
    backoff: Backoff,
) -> Result<QueueConfig> {
    let prefix = name.to_uppercase();

    let backoff = match env::var(format!("{prefix}_BACKOFF")).as_deref() {
        Ok("fixed") => Backoff::Fixed,
        Ok("exponential") => Backoff::Exponential,
        Ok(other) => {
            anyhow::bail!("{prefix}_BACKOFF must be 'fixed' or 'exponential', got {other:?}")
        }
        Err(_) => backoff,
    };

    let concurrency = parsed_var(&format!("{prefix}_CONCURRENCY"))?.unwrap_or(concurrency);
    if concurrency < 1 {
        anyhow::bail!("{prefix}_CONCURRENCY must be at least 1");
    }

    Ok(QueueConfig {
        name: name.to_string(),
        concurrency,
        max_retries: parsed_var(&format!("{prefix}_MAX_RETRIES"))?.unwrap_or(max_retries),
        retry_delay_ms: parsed_var(&format!("{prefix}_RETRY_DELAY"))?.unwrap_or(retry_delay_ms),
        backoff,
        keep_completed: parsed_var(&format!("{prefix}_KEEP_COMPLETED"))?
            .unwrap_or(DEFAULT_KEEP_COMPLETED),
        keep_failed: parsed_var(&format!("{prefix}_KEEP_FAILED"))?.unwrap_or(DEFAULT_KEEP_FAILED),
        timeout_ms: parsed_var(&format!("{prefix}_TIMEOUT"))?,
    })
}

fn parsed_var<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => {
            let value = raw
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key} is invalid: {e}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses a unique variable prefix so parallel tests never race on
    // process environment.

    #[test]
    fn parsed_var_absent_is_none() {
        let value: Option<u16> = parsed_var("CONVEYOR_TEST_ABSENT").unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn parsed_var_reads_value() {
        env::set_var("CONVEYOR_TEST_PORT_A", "4242");
        let value: Option<u16> = parsed_var("CONVEYOR_TEST_PORT_A").unwrap();
        assert_eq!(value, Some(4242));
    }

    #[test]
    fn parsed_var_rejects_garbage() {
        env::set_var("CONVEYOR_TEST_PORT_B", "not-a-number");
        let value: Result<Option<u16>> = parsed_var("CONVEYOR_TEST_PORT_B");
        assert!(value.is_err());
    }

    #[test]
    fn queue_defaults_apply_without_env() {
        let q = queue_from_env("zzdefaults", 5, 3, 5_000, Backoff::Exponential).unwrap();
        assert_eq!(q.name, "zzdefaults");
        assert_eq!(q.concurrency, 5);
        assert_eq!(q.max_retries, 3);
        assert_eq!(q.retry_delay_ms, 5_000);
        assert_eq!(q.backoff, Backoff::Exponential);
        assert_eq!(q.keep_completed, DEFAULT_KEEP_COMPLETED);
        assert_eq!(q.keep_failed, DEFAULT_KEEP_FAILED);
        assert_eq!(q.timeout_ms, None);
    }

    #[test]
    fn queue_env_overrides_win() {
        env::set_var("ZZOVERRIDE_CONCURRENCY", "9");
        env::set_var("ZZOVERRIDE_BACKOFF", "fixed");
        env::set_var("ZZOVERRIDE_TIMEOUT", "1500");
        let q = queue_from_env("zzoverride", 2, 3, 5_000, Backoff::Exponential).unwrap();
        assert_eq!(q.concurrency, 9);
        assert_eq!(q.backoff, Backoff::Fixed);
        assert_eq!(q.timeout_ms, Some(1500));
    }

    #[test]
    fn queue_rejects_zero_concurrency() {
        env::set_var("ZZBADCONC_CONCURRENCY", "0");
        assert!(queue_from_env("zzbadconc", 2, 3, 5_000, Backoff::Fixed).is_err());
    }

    #[test]
    fn queue_rejects_unknown_backoff() {
        env::set_var("ZZBADBACKOFF_BACKOFF", "quadratic");
        assert!(queue_from_env("zzbadbackoff", 2, 3, 5_000, Backoff::Fixed).is_err());
    }
}
