//! Per-module outbound rate limits.
//!
//! Limiters live in process memory, so each node enforces its own bucket.
//! With `nodes` set to the cluster size every node takes an equal share of
//! the configured quota and the cluster as a whole stays within it.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// One limiter per module slug, rebuilt when the configured quota changes.
pub struct ModuleLimiters {
    limiters: Mutex<HashMap<String, (u32, Arc<DefaultDirectRateLimiter>)>>,
    nodes: NonZeroU32,
}

impl Default for ModuleLimiters {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLimiters {
    pub fn new() -> Self {
        Self::with_node_share(NonZeroU32::MIN)
    }

    /// Enforce `1 / nodes` of each configured quota on this node.
    pub fn with_node_share(nodes: NonZeroU32) -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
            nodes,
        }
    }

    /// This node's slice of a cluster-wide quota, never below one call.
    pub fn node_quota(&self, per_minute: NonZeroU32) -> NonZeroU32 {
        NonZeroU32::new(per_minute.get() / self.nodes.get()).unwrap_or(NonZeroU32::MIN)
    }

    fn limiter(&self, slug: &str, per_minute: NonZeroU32) -> Arc<DefaultDirectRateLimiter> {
        let per_minute = self.node_quota(per_minute);
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        match limiters.get(slug) {
            Some((quota, limiter)) if *quota == per_minute.get() => Arc::clone(limiter),
            _ => {
                let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)));
                limiters.insert(slug.to_string(), (per_minute.get(), Arc::clone(&limiter)));
                limiter
            }
        }
    }

    /// Wait for a call slot. `None` means unlimited.
    pub async fn until_ready(&self, slug: &str, per_minute: Option<u32>) {
        let Some(per_minute) = per_minute.and_then(NonZeroU32::new) else {
            return;
        };
        let limiter = self.limiter(slug, per_minute);
        if limiter.check().is_err() {
            tracing::debug!(module = slug, per_minute = per_minute.get(), "Waiting for rate limit");
            limiter.until_ready().await;
        }
    }

    /// Whether a call could go out right now, consuming the slot if so.
    pub fn try_acquire(&self, slug: &str, per_minute: Option<u32>) -> bool {
        match per_minute.and_then(NonZeroU32::new) {
            Some(per_minute) => self.limiter(slug, per_minute).check().is_ok(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_is_enforced_per_module() {
        let limiters = ModuleLimiters::new();
        assert!(limiters.try_acquire("smtp", Some(2)));
        assert!(limiters.try_acquire("smtp", Some(2)));
        assert!(!limiters.try_acquire("smtp", Some(2)));
        // Other modules have their own budget.
        assert!(limiters.try_acquire("webhook", Some(2)));
    }

    #[test]
    fn test_unlimited_and_changed_quota() {
        let limiters = ModuleLimiters::new();
        for _ in 0..100 {
            assert!(limiters.try_acquire("webhook", None));
        }
        assert!(limiters.try_acquire("smtp", Some(1)));
        assert!(!limiters.try_acquire("smtp", Some(1)));
        // A new quota starts a fresh limiter.
        assert!(limiters.try_acquire("smtp", Some(5)));
    }

    #[test]
    fn test_nodes_split_the_cluster_quota() {
        let nodes = NonZeroU32::new(3).unwrap();
        let node_a = ModuleLimiters::with_node_share(nodes);
        let node_b = ModuleLimiters::with_node_share(nodes);

        let granted = (0..10)
            .filter(|_| node_a.try_acquire("webhook", Some(6)))
            .count()
            + (0..10)
                .filter(|_| node_b.try_acquire("webhook", Some(6)))
                .count();
        assert_eq!(granted, 4);

        let one = NonZeroU32::new(1).unwrap();
        assert_eq!(node_a.node_quota(one), one);
        assert_eq!(ModuleLimiters::new().node_quota(NonZeroU32::new(6).unwrap()).get(), 6);
    }

    #[tokio::test]
    async fn test_until_ready_returns_immediately_with_budget() {
        let limiters = ModuleLimiters::new();
        tokio::time::timeout(std::time::Duration::from_millis(100), limiters.until_ready("smtp", Some(60)))
            .await
            .unwrap();
    }
}
