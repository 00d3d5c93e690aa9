use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::db::LocalStore;

#[derive(Debug, Clone)]
pub struct LikeConfig {
    pub server_url: String,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    /// `None` means `~/.waline_likes`.
    pub data_dir: Option<PathBuf>,
}

/// Re-read policy after a like/unlike, covering server propagation lag.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

impl LikeConfig {
    pub fn new(server_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            server_url: sanitize_base_url(server_url.into())?,
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            data_dir: None,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from `WALINE_*` variables supplied by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let server_url = lookup("WALINE_SERVER_URL").context("WALINE_SERVER_URL must be set")?;
        let mut config = Self::new(server_url)?;

        let cache = &mut config.cache;
        if let Some(secs) = parse_var::<u64>(&lookup, "WALINE_CACHE_TTL_SECS")? {
            cache.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WALINE_FRESH_TTL_SECS")? {
            cache.fresh_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WALINE_CACHE_SWEEP_SECS")? {
            cache.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "WALINE_RETRY_ATTEMPTS")? {
            config.retry.attempts = attempts.max(1);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "WALINE_RETRY_DELAY_MS")? {
            config.retry.delay = Duration::from_millis(ms);
        }
        config.data_dir = lookup("WALINE_DATA_DIR")
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from);
        Ok(config)
    }

    /// The configured data directory, falling back to the home directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => LocalStore::default_data_dir(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = lookup(key).filter(|raw| !raw.trim().is_empty()) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .with_context(|| format!("invalid value for {key}: {raw:?}"))
}

pub fn sanitize_base_url(mut base: String) -> Result<String> {
    if base.trim().is_empty() {
        return Err(anyhow!("server URL is empty"));
    }
    if !base.starts_with("http://") && !base.starts_with("https://") {
        base = format!("http://{base}");
    }
    while base.ends_with('/') {
        base.pop();
    }
    let _ = Url::parse(&base).context("invalid server URL")?;
    Ok(base)
}
