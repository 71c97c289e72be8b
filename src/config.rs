//! Process configuration read from the environment.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

pub const MIN_AUTOMATION_INTERVAL_SECS: u64 = 5;
pub const MAX_AUTOMATION_INTERVAL_SECS: u64 = 3600;

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub pool_size: usize,
    /// Connections reserved for session advisory locks, separate from
    /// `pool_size` so lock holders can always reach the work pool.
    pub lock_pool_size: usize,
    /// Longest wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: SecretString::from(url.into()),
            pool_size: 16,
            lock_pool_size: 8,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    pub fn url(&self) -> &str {
        self.url.expose_secret()
    }
}

/// Scheduler and monitor timings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Zone task cron expressions are evaluated in.
    pub timezone: Tz,
    pub automation_interval: Duration,
    pub lock_timeout: Duration,
    pub webhook_batch_size: usize,
    pub webhook_stuck_timeout: chrono::Duration,
    pub webhook_retention: chrono::Duration,
    pub system_update_script: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            automation_interval: Duration::from_secs(60),
            lock_timeout: Duration::from_millis(500),
            webhook_batch_size: 50,
            webhook_stuck_timeout: chrono::Duration::minutes(10),
            webhook_retention: chrono::Duration::hours(24 * 7),
            system_update_script: None,
        }
    }
}

/// Cross-node refresh fan-out.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub node_id: String,
    /// Postgres NOTIFY channel.
    pub channel: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            channel: "portal_refresh".to_string(),
        }
    }
}

/// Syncro API access. Unset base URL or key leaves the importer unconfigured.
#[derive(Debug, Clone)]
pub struct SyncroConfig {
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub rate_limit_per_minute: u32,
}

impl Default for SyncroConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            rate_limit_per_minute: 180,
        }
    }
}

impl SyncroConfig {
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some() && self.api_key.is_some()
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs against the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub scheduler: SchedulerConfig,
    pub refresh: RefreshConfig,
    pub syncro: SyncroConfig,
    pub http_bind: SocketAddr,
    /// Nodes sharing the module rate limits.
    pub cluster_nodes: NonZeroU32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: None,
            scheduler: SchedulerConfig::default(),
            refresh: RefreshConfig::default(),
            syncro: SyncroConfig::default(),
            http_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            cluster_nodes: NonZeroU32::MIN,
        }
    }
}

impl Config {
    /// Read settings from the process environment (after `.env` is loaded).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Config::default();

        let database = match get("DATABASE_URL") {
            Some(url) => {
                let base = DatabaseConfig::new(url);
                Some(DatabaseConfig {
                    pool_size: parse_or(&get, "DATABASE_POOL_SIZE", base.pool_size)?,
                    lock_pool_size: parse_or(&get, "DATABASE_LOCK_POOL_SIZE", base.lock_pool_size)?,
                    acquire_timeout: Duration::from_secs(parse_or(
                        &get,
                        "DATABASE_ACQUIRE_TIMEOUT_SECONDS",
                        base.acquire_timeout.as_secs(),
                    )?),
                    ..base
                })
            }
            None => None,
        };

        let timezone = match get("SCHEDULER_TIMEZONE") {
            Some(name) => name.parse::<Tz>().map_err(|e| ConfigError::Invalid {
                key: "SCHEDULER_TIMEZONE".to_string(),
                reason: e.to_string(),
            })?,
            None => defaults.scheduler.timezone,
        };

        let interval = parse_or(&get, "AUTOMATION_INTERVAL_SECONDS", 60u64)?;
        let scheduler = SchedulerConfig {
            timezone,
            automation_interval: clamp_automation_interval(interval),
            lock_timeout: Duration::from_millis(parse_or(&get, "LOCK_TIMEOUT_MS", 500u64)?),
            webhook_batch_size: parse_or(&get, "WEBHOOK_BATCH_SIZE", 50usize)?.max(1),
            webhook_stuck_timeout: chrono::Duration::seconds(parse_or(
                &get,
                "WEBHOOK_STUCK_TIMEOUT_SECONDS",
                600i64,
            )?),
            webhook_retention: chrono::Duration::hours(parse_or(
                &get,
                "WEBHOOK_RETENTION_HOURS",
                168i64,
            )?),
            system_update_script: get("SYSTEM_UPDATE_SCRIPT").map(PathBuf::from),
        };

        let refresh = RefreshConfig {
            node_id: get("NODE_ID").unwrap_or(defaults.refresh.node_id),
            channel: get("REFRESH_CHANNEL").unwrap_or(defaults.refresh.channel),
        };

        let syncro = SyncroConfig {
            base_url: get("SYNCRO_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            api_key: get("SYNCRO_API_KEY").map(SecretString::from),
            rate_limit_per_minute: parse_or(&get, "SYNCRO_RATE_LIMIT_PER_MINUTE", 180u32)?.max(1),
        };

        let http_bind = parse_or(&get, "HTTP_BIND", defaults.http_bind)?;
        let cluster_nodes = parse_or(&get, "CLUSTER_NODES", defaults.cluster_nodes)?;

        Ok(Self {
            database,
            scheduler,
            refresh,
            syncro,
            http_bind,
            cluster_nodes,
        })
    }
}

/// Keep the automation poll interval within 5 s ..= 1 h.
pub fn clamp_automation_interval(seconds: u64) -> Duration {
    Duration::from_secs(seconds.clamp(MIN_AUTOMATION_INTERVAL_SECS, MAX_AUTOMATION_INTERVAL_SECS))
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
