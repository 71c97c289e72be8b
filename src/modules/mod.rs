//! Integration modules and the dispatcher that calls them.
//!
//! Every call goes through the monitor: the dispatcher creates a
//! `module.{slug}` event holding the prepared request, performs the call as
//! attempt 1 and records the outcome. Failed calls stay `pending` and are
//! replayed by `EventMonitor::process_pending`, which routes the `module.`
//! prefix back here.

pub mod builtin;
pub mod cache;
pub mod config;
pub mod limiter;
pub mod module;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

pub use cache::ModuleCache;
pub use config::{ModuleConfig, ModuleUpdate};
pub use limiter::ModuleLimiters;
pub use module::{Module, ModuleResponse, PreparedCall};

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{DispatchError, ModuleError, MonitorError};
use crate::monitor::{AttemptReport, EventHandler, EventMonitor, NewEvent, WebhookEvent};

/// Event name prefix for module calls.
pub const EVENT_PREFIX: &str = "module.";

/// How long a fresh module event is reserved for its inline first attempt.
/// Past this the monitor treats it as abandoned and delivers it.
fn inline_attempt_hold() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Succeeded,
    Failed,
    Skipped,
    Queued,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Queued => "queued",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResult {
    pub status: DispatchStatus,
    pub event_id: Option<i64>,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::Skipped,
            event_id: None,
            response: None,
            error: Some(reason.into()),
        }
    }

    pub fn failed(event_id: Option<i64>, error: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::Failed,
            event_id,
            response: None,
            error: Some(error.into()),
        }
    }

    pub fn queued(event_id: i64) -> Self {
        Self {
            status: DispatchStatus::Queued,
            event_id: Some(event_id),
            response: None,
            error: None,
        }
    }

    fn from_outcome(event_id: i64, outcome: Result<ModuleResponse, ModuleError>) -> Self {
        match outcome {
            Ok(response) => Self {
                status: DispatchStatus::Succeeded,
                event_id: Some(event_id),
                response: Some(response.body),
                error: None,
            },
            Err(ModuleError::Protocol { status, body }) => Self {
                status: DispatchStatus::Failed,
                event_id: Some(event_id),
                response: Some(serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body))),
                error: Some(format!("HTTP {status}")),
            },
            Err(e) => Self::failed(Some(event_id), e.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == DispatchStatus::Failed
    }
}

pub type CompletionCallback = Box<dyn FnOnce(DispatchResult) + Send + 'static>;

#[derive(Default)]
pub struct TriggerOptions {
    /// Return `queued` at once and finish in a spawned task.
    pub background: bool,
    /// Invoked with the final result; implies `background`.
    pub on_complete: Option<CompletionCallback>,
}

impl TriggerOptions {
    pub fn background() -> Self {
        Self {
            background: true,
            on_complete: None,
        }
    }

    pub fn on_complete(callback: impl FnOnce(DispatchResult) + Send + 'static) -> Self {
        Self {
            background: true,
            on_complete: Some(Box::new(callback)),
        }
    }
}

/// Map a call outcome onto the attempt log.
fn attempt_report(call: &PreparedCall, outcome: &Result<ModuleResponse, ModuleError>) -> AttemptReport {
    let report = match outcome {
        Ok(response) => AttemptReport::succeeded(
            response.status.map(i32::from),
            Some(response.body_text()),
        ),
        Err(ModuleError::Protocol { status, body }) => {
            AttemptReport::rejected(i32::from(*status), Some(body.clone()))
        }
        Err(e) => AttemptReport::error(e.to_string()),
    };
    report.with_request(call.headers.clone(), Some(call.body.to_string()))
}

pub struct ModuleDispatcher {
    modules: HashMap<String, Arc<dyn Module>>,
    cache: ModuleCache,
    limiters: ModuleLimiters,
    monitor: Arc<EventMonitor>,
}

impl ModuleDispatcher {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>, monitor: Arc<EventMonitor>) -> Self {
        Self {
            modules: HashMap::new(),
            cache: ModuleCache::new(db, clock),
            limiters: ModuleLimiters::new(),
            monitor,
        }
    }

    /// Share each module's quota across `nodes` dispatchers.
    pub fn with_cluster_nodes(mut self, nodes: std::num::NonZeroU32) -> Self {
        self.limiters = ModuleLimiters::with_node_share(nodes);
        self
    }

    pub fn with_module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.insert(module.slug().to_string(), module);
        self
    }

    pub fn with_modules(self, modules: impl IntoIterator<Item = Arc<dyn Module>>) -> Self {
        modules.into_iter().fold(self, Self::with_module)
    }

    /// Route failed module events from the monitor back to this dispatcher.
    pub async fn attach(self: &Arc<Self>) {
        self.monitor
            .register_handler(EVENT_PREFIX, Arc::clone(self) as Arc<dyn EventHandler>)
            .await;
    }

    pub fn module_slugs(&self) -> Vec<&str> {
        let mut slugs: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        slugs.sort_unstable();
        slugs
    }

    pub async fn invalidate_cache(&self) {
        self.cache.invalidate().await;
    }

    /// Resolve an enabled module and its settings.
    async fn resolve(&self, slug: &str) -> Result<(Arc<dyn Module>, ModuleConfig), ModuleError> {
        let missing = || ModuleError::ConfigurationMissing(slug.to_string());
        let module = self.modules.get(slug).cloned().ok_or_else(missing)?;
        match self.cache.get(slug).await {
            Ok(Some(config)) if config.enabled => Ok((module, config)),
            Ok(_) => Err(missing()),
            Err(e) => Err(ModuleError::Collaborator(format!("module configuration unavailable: {e}"))),
        }
    }

    /// Call a module through the monitor.
    pub async fn trigger(
        self: &Arc<Self>,
        slug: &str,
        payload: serde_json::Value,
        options: TriggerOptions,
    ) -> DispatchResult {
        let (module, config) = match self.resolve(slug).await {
            Ok(resolved) => resolved,
            Err(e @ ModuleError::ConfigurationMissing(_)) => {
                tracing::info!(module = slug, "Module skipped: {e}");
                return DispatchResult::skipped(e.to_string());
            }
            Err(e) => return DispatchResult::failed(None, e.to_string()),
        };

        let call = match module.prepare(&config, &payload) {
            Ok(call) => call,
            Err(e @ ModuleError::ConfigurationMissing(_)) => {
                tracing::info!(module = slug, "Module skipped: {e}");
                return DispatchResult::skipped(e.to_string());
            }
            Err(e) => {
                tracing::warn!(module = slug, error = %e, "Module payload rejected");
                return DispatchResult::failed(None, e.to_string());
            }
        };

        let event_id = match self.open_event(slug, &config, &call).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(module = slug, error = %e, "Failed to create module event");
                return DispatchResult::failed(None, e.to_string());
            }
        };

        if options.background || options.on_complete.is_some() {
            let this = Arc::clone(self);
            let on_complete = options.on_complete;
            tokio::spawn(async move {
                let result = this.perform(module, config, call, event_id).await;
                if let Some(callback) = on_complete {
                    callback(result);
                }
            });
            return DispatchResult::queued(event_id);
        }

        self.perform(module, config, call, event_id).await
    }

    async fn open_event(
        &self,
        slug: &str,
        config: &ModuleConfig,
        call: &PreparedCall,
    ) -> Result<i64, DispatchError> {
        let event = NewEvent::new(
            format!("{EVENT_PREFIX}{slug}"),
            call.target.clone(),
            call.body.clone(),
        )
        .with_headers(call.headers.clone())
        .with_retry_policy(config.max_attempts(), config.backoff_seconds())
        .held_for(inline_attempt_hold());
        Ok(self.monitor.create_event(event).await?.id)
    }

    /// Run attempt 1 inline and record it.
    async fn perform(
        &self,
        module: Arc<dyn Module>,
        config: ModuleConfig,
        call: PreparedCall,
        event_id: i64,
    ) -> DispatchResult {
        let attempt = match self.monitor.begin_attempt(event_id).await {
            Ok(n) => n,
            Err(MonitorError::Conflict { .. }) => {
                // The monitor claimed it first and will deliver it.
                return DispatchResult::queued(event_id);
            }
            Err(e) => return DispatchResult::failed(Some(event_id), e.to_string()),
        };

        let outcome = self.execute_call(module.as_ref(), &config, &call).await;
        let report = attempt_report(&call, &outcome);
        if let Err(e) = self.monitor.complete_attempt(event_id, attempt, &report).await {
            tracing::error!(event_id, error = %e, "Failed to record module attempt");
        }

        match &outcome {
            Ok(_) => tracing::info!(module = %config.slug, event_id, "Module call succeeded"),
            Err(e) => tracing::warn!(module = %config.slug, event_id, error = %e, "Module call failed"),
        }
        DispatchResult::from_outcome(event_id, outcome)
    }

    /// Rate limit, then execute under the module timeout.
    async fn execute_call(
        &self,
        module: &dyn Module,
        config: &ModuleConfig,
        call: &PreparedCall,
    ) -> Result<ModuleResponse, ModuleError> {
        self.limiters
            .until_ready(&config.slug, config.rate_limit_per_minute())
            .await;
        let timeout = config.timeout();
        match tokio::time::timeout(timeout, module.execute(config, call)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ModuleError::Timeout(timeout)),
        }
    }
}

#[async_trait]
impl EventHandler for ModuleDispatcher {
    /// Replay a stored module call.
    async fn deliver(&self, event: &WebhookEvent) -> AttemptReport {
        let slug = event.name.strip_prefix(EVENT_PREFIX).unwrap_or(&event.name);
        let call = PreparedCall {
            target: event.target_url.clone(),
            headers: event.headers.clone(),
            body: event.payload.clone(),
        };
        let outcome = match self.resolve(slug).await {
            Ok((module, config)) => self.execute_call(module.as_ref(), &config, &call).await,
            Err(e) => Err(e),
        };
        attempt_report(&call, &outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::memory::MemoryStore;
    use crate::monitor::{AttemptStatus, EventStatus};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls with HTTP 503, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Module for Flaky {
        fn slug(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "test module"
        }

        fn prepare(
            &self,
            _config: &ModuleConfig,
            payload: &serde_json::Value,
        ) -> Result<PreparedCall, ModuleError> {
            if payload.get("bad").is_some() {
                return Err(ModuleError::Validation("bad payload".into()));
            }
            Ok(PreparedCall::new("test://flaky", payload.clone()))
        }

        async fn execute(
            &self,
            _config: &ModuleConfig,
            _call: &PreparedCall,
        ) -> Result<ModuleResponse, ModuleError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ModuleError::Protocol {
                    status: 503,
                    body: r#"{"error":"busy"}"#.into(),
                })
            } else {
                Ok(ModuleResponse::http(200, json!({"ok": true})))
            }
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        monitor: Arc<EventMonitor>,
        dispatcher: Arc<ModuleDispatcher>,
    }

    async fn fixture(module: Flaky, enabled: bool) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_module(
                "flaky",
                &ModuleUpdate {
                    enabled: Some(enabled),
                    settings: Some(json!({"max_attempts": 2, "backoff_seconds": 10})),
                    ..Default::default()
                },
                clock.now(),
            )
            .await
            .unwrap();
        let monitor = Arc::new(EventMonitor::new(store.clone(), clock.clone()));
        let dispatcher = Arc::new(
            ModuleDispatcher::new(store.clone(), clock.clone(), monitor.clone())
                .with_module(Arc::new(module)),
        );
        dispatcher.attach().await;
        Fixture {
            clock,
            store,
            monitor,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_success_records_event_and_attempt() {
        let f = fixture(Flaky::new(0), true).await;
        let result = f
            .dispatcher
            .trigger("flaky", json!({"x": 1}), TriggerOptions::default())
            .await;
        assert_eq!(result.status, DispatchStatus::Succeeded);
        assert_eq!(result.response, Some(json!({"ok": true})));

        let event = f.monitor.get_event(result.event_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(event.name, "module.flaky");
        assert_eq!(event.status, EventStatus::Succeeded);
        assert_eq!(event.max_attempts, 2);
        let attempts = f.monitor.list_attempts(event.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_fresh_event_is_reserved_for_inline_attempt() {
        let f = fixture(Flaky::new(0), true).await;
        let (module, config) = f.dispatcher.resolve("flaky").await.unwrap();
        let call = module.prepare(&config, &json!({"x": 1})).unwrap();
        let event_id = f.dispatcher.open_event("flaky", &config, &call).await.unwrap();

        // A monitor pass between creation and the inline attempt finds nothing.
        let summary = f.monitor.process_pending(10).await.unwrap();
        assert_eq!(summary.claimed, 0);

        let result = f.dispatcher.perform(module, config, call, event_id).await;
        assert_eq!(result.status, DispatchStatus::Succeeded);
        let attempts = f.monitor.list_attempts(event_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_event_is_delivered_after_hold() {
        let f = fixture(Flaky::new(0), true).await;
        let (module, config) = f.dispatcher.resolve("flaky").await.unwrap();
        let call = module.prepare(&config, &json!({"x": 1})).unwrap();
        let event_id = f.dispatcher.open_event("flaky", &config, &call).await.unwrap();

        f.clock.advance(inline_attempt_hold());
        let summary = f.monitor.process_pending(10).await.unwrap();
        assert_eq!(summary.claimed, 1);
        let event = f.monitor.get_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failure_is_replayed_by_monitor() {
        let f = fixture(Flaky::new(1), true).await;
        let result = f
            .dispatcher
            .trigger("flaky", json!({"x": 1}), TriggerOptions::default())
            .await;
        assert_eq!(result.status, DispatchStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("HTTP 503"));
        assert_eq!(result.response, Some(json!({"error": "busy"})));

        let id = result.event_id.unwrap();
        let event = f.monitor.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.response_status, Some(503));

        f.clock.advance(chrono::Duration::seconds(10));
        let summary = f.monitor.process_pending(10).await.unwrap();
        assert_eq!(summary.succeeded, 1);

        let attempts = f.monitor.list_attempts(id).await.unwrap();
        assert_eq!(
            attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert_eq!(attempts[1].status, AttemptStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_disabled_or_unknown_module_is_skipped() {
        let f = fixture(Flaky::new(0), false).await;
        let result = f
            .dispatcher
            .trigger("flaky", json!({}), TriggerOptions::default())
            .await;
        assert_eq!(result.status, DispatchStatus::Skipped);

        let unknown = f
            .dispatcher
            .trigger("nope", json!({}), TriggerOptions::default())
            .await;
        assert_eq!(unknown.status, DispatchStatus::Skipped);
        assert!(f.store.list_events(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_creates_no_event() {
        let f = fixture(Flaky::new(0), true).await;
        let result = f
            .dispatcher
            .trigger("flaky", json!({"bad": true}), TriggerOptions::default())
            .await;
        assert_eq!(result.status, DispatchStatus::Failed);
        assert!(result.event_id.is_none());
        assert!(f.store.list_events(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_background_invokes_callback() {
        let f = fixture(Flaky::new(0), true).await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let result = f
            .dispatcher
            .trigger(
                "flaky",
                json!({}),
                TriggerOptions::on_complete(move |r| {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(r);
                    }
                }),
            )
            .await;
        assert_eq!(result.status, DispatchStatus::Queued);

        let finished = tokio::time::timeout(std::time::Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, DispatchStatus::Succeeded);
        assert_eq!(finished.event_id, result.event_id);
    }
}
