//! Durable log of outbound side effects.
//!
//! Every webhook delivery, module call and vendor page request becomes a
//! [`WebhookEvent`]. The monitor owns its state machine:
//!
//! ```text
//! pending ──claim──▶ in_progress ──mark_completed──▶ succeeded
//!                         │
//!                         └─mark_failed─┬─(retries left)──▶ pending
//!                                       └─(exhausted)────▶ failed
//! failed | succeeded ──force_retry──▶ pending
//! ```
//!
//! Retry delays double per attempt: `backoff × 2^(attempt − 1)`.

pub mod delivery;
pub mod event;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

pub use delivery::{AttemptReport, HttpDelivery};
pub use event::{
    AttemptStatus, DeliveryMode, EventOutcome, EventStatus, Headers, NewAttempt, NewEvent,
    WebhookEvent, WebhookEventAttempt,
};

use crate::clock::Clock;
use crate::db::Database;
use crate::error::MonitorError;

/// Largest exponent applied to the backoff.
const MAX_BACKOFF_DOUBLINGS: i32 = 16;

/// Performs the side effect for claimed events whose name matches a prefix.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn deliver(&self, event: &WebhookEvent) -> AttemptReport;
}

/// Counts from one `process_pending` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Delay before the next attempt after `attempt_count` attempts.
pub fn retry_delay(backoff_seconds: i32, attempt_count: i32) -> Duration {
    let doublings = (attempt_count - 1).clamp(0, MAX_BACKOFF_DOUBLINGS);
    Duration::seconds(i64::from(backoff_seconds.max(0)) << doublings)
}

pub struct EventMonitor {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    handlers: RwLock<Vec<(String, Arc<dyn EventHandler>)>>,
    http: Arc<dyn EventHandler>,
}

impl EventMonitor {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self::with_http(db, clock, Arc::new(HttpDelivery::default()))
    }

    /// Use a custom fallback for `http(s)` targets.
    pub fn with_http(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        http: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            db,
            clock,
            handlers: RwLock::new(Vec::new()),
            http,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Route events whose name starts with `prefix` to `handler`.
    pub async fn register_handler(&self, prefix: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let prefix = prefix.into();
        let mut handlers = self.handlers.write().await;
        handlers.retain(|(p, _)| *p != prefix);
        tracing::debug!(prefix = %prefix, "Registered event handler");
        handlers.push((prefix, handler));
    }

    async fn handler_for(&self, event: &WebhookEvent) -> Option<Arc<dyn EventHandler>> {
        let handlers = self.handlers.read().await;
        let registered = handlers
            .iter()
            .filter(|(prefix, _)| event.name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| Arc::clone(handler));

        registered.or_else(|| {
            HttpDelivery::handles(&event.target_url).then(|| Arc::clone(&self.http))
        })
    }

    pub async fn create_event(&self, event: NewEvent) -> Result<WebhookEvent, MonitorError> {
        let created = self.db.insert_event(&event, self.now()).await?;
        tracing::debug!(
            event_id = created.id,
            name = %created.name,
            delivery = created.delivery.as_str(),
            "Webhook event created"
        );
        Ok(created)
    }

    pub async fn get_event(&self, id: i64) -> Result<Option<WebhookEvent>, MonitorError> {
        Ok(self.db.get_event(id).await?)
    }

    pub async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, MonitorError> {
        Ok(self.db.list_events(status, limit).await?)
    }

    pub async fn list_attempts(&self, event_id: i64) -> Result<Vec<WebhookEventAttempt>, MonitorError> {
        Ok(self.db.list_attempts(event_id).await?)
    }

    /// Claim up to `limit` due monitor-delivered events.
    pub async fn claim_due(&self, limit: usize) -> Result<Vec<WebhookEvent>, MonitorError> {
        Ok(self.db.claim_due_events(self.now(), limit).await?)
    }

    /// Claim one pending event for inline execution. Returns the attempt
    /// number the caller now owns.
    pub async fn begin_attempt(&self, event_id: i64) -> Result<i32, MonitorError> {
        if let Some(event) = self.db.claim_event(event_id, self.now()).await? {
            return Ok(event.attempt_count);
        }
        match self.db.get_event(event_id).await? {
            Some(event) => Err(MonitorError::Conflict {
                id: event_id,
                status: event.status,
            }),
            None => Err(MonitorError::NotFound(event_id)),
        }
    }

    pub async fn record_attempt(
        &self,
        attempt: NewAttempt,
    ) -> Result<WebhookEventAttempt, MonitorError> {
        Ok(self.db.insert_attempt(&attempt, self.now()).await?)
    }

    /// `None` when the event is no longer in progress at `attempt_number`.
    pub async fn mark_completed(
        &self,
        event_id: i64,
        attempt_number: i32,
        response_status: Option<i32>,
        response_body: Option<String>,
    ) -> Result<Option<WebhookEvent>, MonitorError> {
        let outcome = EventOutcome {
            status: EventStatus::Succeeded,
            next_attempt_at: None,
            last_error: None,
            response_status,
            response_body,
        };
        let updated = self
            .db
            .finish_event(event_id, attempt_number, &outcome, self.now())
            .await?;
        if updated.is_none() {
            tracing::warn!(event_id, attempt_number, "Stale completion ignored");
        }
        Ok(updated)
    }

    /// Schedule a retry or mark the event failed once its budget is spent.
    pub async fn mark_failed(
        &self,
        event_id: i64,
        attempt_number: i32,
        error: &str,
        response_status: Option<i32>,
        response_body: Option<String>,
    ) -> Result<Option<WebhookEvent>, MonitorError> {
        let Some(event) = self.db.get_event(event_id).await? else {
            return Err(MonitorError::NotFound(event_id));
        };
        if event.status != EventStatus::InProgress || event.attempt_count != attempt_number {
            tracing::warn!(event_id, attempt_number, status = %event.status, "Stale failure ignored");
            return Ok(None);
        }

        let now = self.now();
        let outcome = if event.retries_left() {
            EventOutcome {
                status: EventStatus::Pending,
                next_attempt_at: Some(now + retry_delay(event.backoff_seconds, event.attempt_count)),
                last_error: Some(error.to_string()),
                response_status,
                response_body,
            }
        } else {
            EventOutcome {
                status: EventStatus::Failed,
                next_attempt_at: None,
                last_error: Some(error.to_string()),
                response_status,
                response_body,
            }
        };

        let updated = self
            .db
            .finish_event(event_id, attempt_number, &outcome, now)
            .await?;
        if let Some(e) = &updated {
            tracing::info!(
                event_id,
                attempt = attempt_number,
                status = %e.status,
                error = %error,
                "Webhook attempt failed"
            );
        }
        Ok(updated)
    }

    /// Append the attempt and complete or fail the event from `report`.
    pub async fn complete_attempt(
        &self,
        event_id: i64,
        attempt_number: i32,
        report: &AttemptReport,
    ) -> Result<Option<WebhookEvent>, MonitorError> {
        let mut attempt = NewAttempt::new(event_id, attempt_number, report.status)
            .with_request(report.request_headers.clone(), report.request_body.clone())
            .with_response(
                report.response_status,
                report.response_headers.clone(),
                report.response_body.clone(),
            );
        attempt.error_message = report.error.clone();
        self.record_attempt(attempt).await?;

        if report.is_success() {
            self.mark_completed(
                event_id,
                attempt_number,
                report.response_status,
                report.response_body.clone(),
            )
            .await
        } else {
            let error = report.error.as_deref().unwrap_or("Attempt failed");
            self.mark_failed(
                event_id,
                attempt_number,
                error,
                report.response_status,
                report.response_body.clone(),
            )
            .await
        }
    }

    /// Requeue a finished event. `None` when it does not exist.
    pub async fn force_retry(&self, event_id: i64) -> Result<Option<WebhookEvent>, MonitorError> {
        if let Some(event) = self.db.requeue_event(event_id, self.now()).await? {
            tracing::info!(event_id, max_attempts = event.max_attempts, "Webhook event requeued");
            return Ok(Some(event));
        }
        match self.db.get_event(event_id).await? {
            Some(event) => Err(MonitorError::Conflict {
                id: event_id,
                status: event.status,
            }),
            None => Ok(None),
        }
    }

    /// Delete an event and its attempts. In-progress events are refused.
    pub async fn delete(&self, event_id: i64) -> Result<bool, MonitorError> {
        match self.db.get_event(event_id).await? {
            None => return Ok(false),
            Some(e) if e.status == EventStatus::InProgress => {
                return Err(MonitorError::Conflict {
                    id: event_id,
                    status: e.status,
                });
            }
            Some(_) => {}
        }

        if self.db.delete_event(event_id).await? {
            return Ok(true);
        }
        // Claimed between the read and the delete.
        match self.db.get_event(event_id).await? {
            Some(e) => Err(MonitorError::Conflict {
                id: event_id,
                status: e.status,
            }),
            None => Ok(false),
        }
    }

    /// Delete succeeded events not updated within `older_than`.
    pub async fn purge_completed(&self, older_than: Duration) -> Result<u64, MonitorError> {
        let cutoff = self.now() - older_than;
        let purged = self.db.purge_events(EventStatus::Succeeded, cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, "Purged completed webhook events");
        }
        Ok(purged)
    }

    /// Release claims older than `timeout`.
    pub async fn reap_stuck(&self, timeout: Duration) -> Result<u64, MonitorError> {
        let now = self.now();
        let reaped = self.db.reap_stuck_events(now - timeout, now).await?;
        if reaped > 0 {
            tracing::warn!(reaped, "Reset stuck webhook events");
        }
        Ok(reaped)
    }

    /// Claim a batch and deliver each event through its handler.
    pub async fn process_pending(&self, limit: usize) -> Result<ProcessSummary, MonitorError> {
        let events = self.claim_due(limit).await?;
        let mut summary = ProcessSummary {
            claimed: events.len(),
            ..Default::default()
        };

        for event in events {
            let report = match self.handler_for(&event).await {
                Some(handler) => handler.deliver(&event).await,
                None => AttemptReport::error(format!(
                    "No handler for event '{}' targeting {}",
                    event.name, event.target_url
                )),
            };

            match self.complete_attempt(event.id, event.attempt_count, &report).await {
                Ok(Some(updated)) => match updated.status {
                    EventStatus::Succeeded => summary.succeeded += 1,
                    EventStatus::Pending => summary.retried += 1,
                    EventStatus::Failed => summary.failed += 1,
                    EventStatus::InProgress => {}
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(event_id = event.id, error = %e, "Failed to record webhook attempt");
                }
            }
        }

        if summary.claimed > 0 {
            tracing::info!(
                claimed = summary.claimed,
                succeeded = summary.succeeded,
                retried = summary.retried,
                failed = summary.failed,
                "Processed pending webhook events"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::memory::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        monitor: EventMonitor,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let monitor = EventMonitor::with_http(store, clock.clone(), Arc::new(Scripted::new(vec![])));
        Fixture { clock, monitor }
    }

    /// Replays a fixed list of responses, then keeps failing.
    struct Scripted {
        responses: std::sync::Mutex<Vec<AttemptReport>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut responses: Vec<AttemptReport>) -> Self {
            responses.reverse();
            Self {
                responses: std::sync::Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EventHandler for Scripted {
        async fn deliver(&self, _event: &WebhookEvent) -> AttemptReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| AttemptReport::error("connection refused"))
        }
    }

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(30, 1), Duration::seconds(30));
        assert_eq!(retry_delay(30, 2), Duration::seconds(60));
        assert_eq!(retry_delay(30, 3), Duration::seconds(120));
        assert_eq!(retry_delay(0, 5), Duration::zero());
    }

    #[tokio::test]
    async fn test_backoff_then_terminal_failure() {
        let f = fixture();
        let handler = Arc::new(Scripted::new(vec![]));
        f.monitor.register_handler("hook.", handler.clone()).await;

        let event = f
            .monitor
            .create_event(NewEvent::new("hook.test", "https://x", json!({})).with_retry_policy(3, 30))
            .await
            .unwrap();
        let t0 = f.monitor.now();

        // Attempt 1 fails: retry in 30s.
        let summary = f.monitor.process_pending(10).await.unwrap();
        assert_eq!(summary.retried, 1);
        let e = f.monitor.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(e.status, EventStatus::Pending);
        assert_eq!(e.attempt_count, 1);
        assert_eq!(e.next_attempt_at, t0 + Duration::seconds(30));

        // Not yet due.
        assert_eq!(f.monitor.process_pending(10).await.unwrap().claimed, 0);

        // Attempt 2 fails: retry 60s later.
        f.clock.advance(Duration::seconds(30));
        f.monitor.process_pending(10).await.unwrap();
        let e = f.monitor.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(e.attempt_count, 2);
        assert_eq!(e.next_attempt_at, t0 + Duration::seconds(90));

        // Attempt 3 exhausts the budget.
        f.clock.advance(Duration::seconds(60));
        let summary = f.monitor.process_pending(10).await.unwrap();
        assert_eq!(summary.failed, 1);
        let e = f.monitor.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(e.status, EventStatus::Failed);
        assert_eq!(e.last_error.as_deref(), Some("connection refused"));

        let attempts = f.monitor.list_attempts(event.id).await.unwrap();
        let numbers: Vec<i32> = attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Error));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_third_attempt_succeeds_after_two_backoffs() {
        let f = fixture();
        let handler = Arc::new(Scripted::new(vec![
            AttemptReport::error("timeout"),
            AttemptReport::error("timeout"),
            AttemptReport::succeeded(Some(200), Some("ok".into())),
        ]));
        f.monitor.register_handler("hook.", handler.clone()).await;
        let event = f
            .monitor
            .create_event(NewEvent::new("hook.s6", "https://x", json!({})).with_retry_policy(3, 10))
            .await
            .unwrap();
        let t = f.monitor.now();

        f.monitor.process_pending(10).await.unwrap();
        let e = f.monitor.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(e.status, EventStatus::Pending);
        assert_eq!(e.next_attempt_at, t + Duration::seconds(10));

        f.clock.advance(Duration::seconds(10));
        f.monitor.process_pending(10).await.unwrap();
        let e = f.monitor.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(e.status, EventStatus::Pending);
        assert_eq!(e.next_attempt_at, t + Duration::seconds(30));

        f.clock.advance(Duration::seconds(20));
        let summary = f.monitor.process_pending(10).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        let e = f.monitor.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(e.status, EventStatus::Succeeded);
        assert_eq!(e.attempt_count, 3);
        assert_eq!(e.response_status, Some(200));

        let attempts = f.monitor.list_attempts(event.id).await.unwrap();
        let numbers: Vec<i32> = attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(attempts[2].status, AttemptStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_force_retry_extends_exhausted_budget() {
        let f = fixture();
        f.monitor
            .register_handler("hook.", Arc::new(Scripted::new(vec![])))
            .await;
        let event = f
            .monitor
            .create_event(NewEvent::new("hook.x", "https://x", json!({})).with_retry_policy(1, 30))
            .await
            .unwrap();
        f.monitor.process_pending(10).await.unwrap();
        assert_eq!(
            f.monitor.get_event(event.id).await.unwrap().unwrap().status,
            EventStatus::Failed
        );

        f.clock.advance(Duration::minutes(5));
        let retried = f.monitor.force_retry(event.id).await.unwrap().unwrap();
        assert_eq!(retried.status, EventStatus::Pending);
        assert_eq!(retried.max_attempts, 2);
        assert_eq!(retried.next_attempt_at, f.monitor.now());
        assert_eq!(f.monitor.list_attempts(event.id).await.unwrap().len(), 1);

        // Pending events cannot be force-retried again.
        assert!(matches!(
            f.monitor.force_retry(event.id).await,
            Err(MonitorError::Conflict { status: EventStatus::Pending, .. })
        ));
        assert!(f.monitor.force_retry(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_force_retry_conflicts_while_in_progress() {
        let f = fixture();
        let event = f
            .monitor
            .create_event(NewEvent::new("inline", "module://x", json!({})))
            .await
            .unwrap();
        let attempt = f.monitor.begin_attempt(event.id).await.unwrap();
        assert_eq!(attempt, 1);

        assert!(matches!(
            f.monitor.force_retry(event.id).await,
            Err(MonitorError::Conflict { status: EventStatus::InProgress, .. })
        ));
        assert!(matches!(
            f.monitor.delete(event.id).await,
            Err(MonitorError::Conflict { .. })
        ));
        assert!(matches!(
            f.monitor.begin_attempt(event.id).await,
            Err(MonitorError::Conflict { .. })
        ));
        assert!(matches!(
            f.monitor.begin_attempt(424242).await,
            Err(MonitorError::NotFound(424242))
        ));

        f.monitor
            .mark_completed(event.id, attempt, Some(200), None)
            .await
            .unwrap();
        assert!(f.monitor.delete(event.id).await.unwrap());
        assert!(!f.monitor.delete(event.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_transitions_are_ignored() {
        let f = fixture();
        let event = f
            .monitor
            .create_event(NewEvent::new("inline", "module://x", json!({})))
            .await
            .unwrap();
        let attempt = f.monitor.begin_attempt(event.id).await.unwrap();

        assert!(f.monitor.mark_completed(event.id, attempt + 1, None, None).await.unwrap().is_none());
        assert!(f.monitor.mark_completed(event.id, attempt, None, None).await.unwrap().is_some());
        assert!(
            f.monitor
                .mark_failed(event.id, attempt, "late", None, None)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            f.monitor.get_event(event.id).await.unwrap().unwrap().status,
            EventStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_longest_prefix_wins_and_http_fallback() {
        let f = fixture();
        let general = Arc::new(Scripted::new(vec![AttemptReport::rejected(500, None)]));
        let specific = Arc::new(Scripted::new(vec![AttemptReport::succeeded(Some(200), None)]));
        f.monitor.register_handler("module.", general.clone()).await;
        f.monitor.register_handler("module.smtp", specific.clone()).await;

        f.monitor
            .create_event(NewEvent::new("module.smtp", "smtp://mail", json!({})))
            .await
            .unwrap();
        let summary = f.monitor.process_pending(10).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(specific.calls.load(Ordering::SeqCst), 1);
        assert_eq!(general.calls.load(Ordering::SeqCst), 0);

        // Unknown name with a non-http target: recorded as an error attempt.
        let orphan = f
            .monitor
            .create_event(NewEvent::new("other", "ftp://x", json!({})).with_retry_policy(1, 0))
            .await
            .unwrap();
        f.monitor.process_pending(10).await.unwrap();
        let orphan = f.monitor.get_event(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, EventStatus::Failed);
        assert!(orphan.last_error.unwrap().starts_with("No handler"));
    }

    #[tokio::test]
    async fn test_tracker_events_are_never_claimed() {
        let f = fixture();
        f.monitor
            .create_event(NewEvent::new("syncro.tickets.page", "syncro://tickets?page=1", json!({})).tracked())
            .await
            .unwrap();
        assert!(f.monitor.claim_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_and_reap() {
        let f = fixture();
        let done = f
            .monitor
            .create_event(NewEvent::new("inline", "module://x", json!({})))
            .await
            .unwrap();
        let n = f.monitor.begin_attempt(done.id).await.unwrap();
        f.monitor.mark_completed(done.id, n, Some(200), None).await.unwrap();

        let stuck = f
            .monitor
            .create_event(NewEvent::new("hook.y", "https://y", json!({})))
            .await
            .unwrap();
        f.monitor.claim_due(10).await.unwrap();

        f.clock.advance(Duration::hours(2));
        assert_eq!(f.monitor.reap_stuck(Duration::minutes(10)).await.unwrap(), 1);
        let stuck = f.monitor.get_event(stuck.id).await.unwrap().unwrap();
        assert_eq!((stuck.status, stuck.attempt_count), (EventStatus::Pending, 0));

        assert_eq!(f.monitor.purge_completed(Duration::hours(3)).await.unwrap(), 0);
        assert_eq!(f.monitor.purge_completed(Duration::hours(1)).await.unwrap(), 1);
        assert!(f.monitor.get_event(done.id).await.unwrap().is_none());
    }
}
