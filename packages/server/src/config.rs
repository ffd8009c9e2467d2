//! Environment-driven configuration.

use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub max_concurrency: usize,
    pub lease_ttl: Duration,
    pub retry_max: i32,
    pub retry_backoff: Duration,
    pub starvation_threshold: Duration,
    pub worker_capabilities: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let port = env_parse("PORT", 8080)?;
        let max_concurrency = env_parse("MAX_CONCURRENCY", 8)?;
        let lease_ttl = Duration::from_secs(env_parse("LEASE_TTL_SECS", 30)?);
        let retry_max = env_parse("RETRY_MAX", 3)?;
        let retry_backoff = Duration::from_secs(env_parse("RETRY_BACKOFF_SECS", 2)?);
        let starvation_threshold =
            Duration::from_secs(env_parse("STARVATION_THRESHOLD_SECS", 300)?);
        let worker_capabilities = std::env::var("WORKER_CAPABILITIES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            database_url,
            port,
            max_concurrency,
            lease_ttl,
            retry_max,
            retry_backoff,
            starvation_threshold,
            worker_capabilities,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {key}")),
        Err(_) => Ok(default),
    }
}
