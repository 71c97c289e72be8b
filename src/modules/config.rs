//! Stored module configuration and settings accessors.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const DEFAULT_BACKOFF_SECONDS: i32 = 30;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// An integration module row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub slug: String,
    pub name: String,
    pub enabled: bool,
    pub settings: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl ModuleConfig {
    pub fn max_attempts(&self) -> i32 {
        self.int_setting("max_attempts")
            .map(|v| v.clamp(1, 100) as i32)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn backoff_seconds(&self) -> i32 {
        self.int_setting("backoff_seconds")
            .map(|v| v.clamp(0, 86_400) as i32)
            .unwrap_or(DEFAULT_BACKOFF_SECONDS)
    }

    pub fn timeout(&self) -> Duration {
        let secs = self
            .int_setting("timeout_seconds")
            .filter(|v| *v > 0)
            .map(|v| v as u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        Duration::from_secs(secs)
    }

    /// `None` means unlimited.
    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        self.int_setting("rate_limit_per_minute")
            .filter(|v| *v > 0)
            .map(|v| v.min(u32::MAX as i64) as u32)
    }

    /// A string setting, with blank values treated as absent.
    pub fn str_setting(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn int_setting(&self, key: &str) -> Option<i64> {
        match self.settings.get(key)? {
            serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Partial update applied by `update_module`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub settings: Option<serde_json::Value>,
}
