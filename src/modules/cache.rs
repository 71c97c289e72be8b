//! Short-lived cache of module configuration rows.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use super::config::ModuleConfig;
use crate::clock::Clock;
use crate::db::Database;
use crate::error::DatabaseError;

pub const DEFAULT_TTL_SECONDS: i64 = 30;

struct Snapshot {
    loaded_at: DateTime<Utc>,
    modules: HashMap<String, ModuleConfig>,
}

/// Loads every module row at once and serves lookups until the TTL lapses.
/// Reloads are serialized so concurrent misses hit the database once.
pub struct ModuleCache {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    snapshot: Mutex<Option<Snapshot>>,
}

impl ModuleCache {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(db, clock, Duration::seconds(DEFAULT_TTL_SECONDS))
    }

    pub fn with_ttl(db: Arc<dyn Database>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            db,
            clock,
            ttl,
            snapshot: Mutex::new(None),
        }
    }

    pub async fn get(&self, slug: &str) -> Result<Option<ModuleConfig>, DatabaseError> {
        let now = self.clock.now();
        let mut snapshot = self.snapshot.lock().await;

        let fresh = snapshot
            .as_ref()
            .is_some_and(|s| now - s.loaded_at < self.ttl);
        if !fresh {
            let modules = self.db.list_modules().await?;
            tracing::debug!(count = modules.len(), "Module configuration reloaded");
            *snapshot = Some(Snapshot {
                loaded_at: now,
                modules: modules.into_iter().map(|m| (m.slug.clone(), m)).collect(),
            });
        }

        Ok(snapshot
            .as_ref()
            .and_then(|s| s.modules.get(slug).cloned()))
    }

    /// Drop the snapshot so the next lookup reloads.
    pub async fn invalidate(&self) {
        *self.snapshot.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::memory::MemoryStore;
    use crate::modules::config::ModuleUpdate;
    use chrono::TimeZone;
    use serde_json::json;

    #[tokio::test]
    async fn test_updates_are_seen_after_ttl() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::new());
        let cache = ModuleCache::new(store.clone(), clock.clone());

        assert!(cache.get("smtp").await.unwrap().is_none());

        let update = ModuleUpdate {
            enabled: Some(true),
            settings: Some(json!({"host": "mail.local"})),
            ..Default::default()
        };
        store.upsert_module("smtp", &update, clock.now()).await.unwrap();

        // Still cached.
        assert!(cache.get("smtp").await.unwrap().is_none());

        clock.advance(Duration::seconds(31));
        let config = cache.get("smtp").await.unwrap().unwrap();
        assert!(config.enabled);

        cache.invalidate().await;
        assert!(cache.get("smtp").await.unwrap().is_some());
    }
}
