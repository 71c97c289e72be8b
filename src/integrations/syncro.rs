//! Syncro ticket import.
//!
//! Pages are fetched one at a time; each page request is a tracker event on
//! the monitor so failed pages show up in the attempt log next to module
//! calls. Tickets are mirrored through the [`TicketStore`] collaborator.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::collaborators::{
    CollaboratorError, CompanyDirectory, ExternalTicket, TicketStore, UpsertOutcome,
};
use crate::config::SyncroConfig;
use crate::error::ImportError;
use crate::monitor::{AttemptReport, EventMonitor, EventStatus, NewEvent};
use crate::refresh::{RefreshBus, RefreshRequest};

pub const PAGE_EVENT: &str = "syncro.tickets.page";
const PAGE_ATTEMPTS: i32 = 3;
const DEFAULT_PAGE_BACKOFF_SECS: i32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on a single `Retry-After` wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);
const MAX_RATE_LIMIT_WAITS: usize = 3;

/// A ticket as returned by `GET /tickets`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncroTicket {
    pub id: i64,
    #[serde(default)]
    pub number: Option<serde_json::Value>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub customer_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contact: Option<SyncroContact>,
    #[serde(default)]
    pub comments: Vec<SyncroComment>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncroContact {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncroComment {
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub page: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TicketPage {
    #[serde(default)]
    pub tickets: Vec<SyncroTicket>,
    #[serde(default)]
    pub meta: PageMeta,
}

impl TicketPage {
    /// Whether pages after `page` remain.
    fn has_more(&self, page: u32) -> bool {
        match self.meta.total_pages {
            Some(total) => page < total,
            None => !self.tickets.is_empty(),
        }
    }
}

impl SyncroTicket {
    fn to_external(&self, company_id: i64) -> ExternalTicket {
        let subject = self
            .subject
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Syncro ticket {}", self.id));
        ExternalTicket {
            external_reference: format!("syncro:{}", self.id),
            company_id,
            subject,
            description: self.comments.iter().find_map(|c| c.body.clone()),
            status: self.status.clone(),
            priority: self.priority.clone(),
            requester_email: self.contact.as_ref().and_then(|c| c.email.clone()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Where ticket pages come from.
#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn fetch_tickets_page(&self, page: u32) -> Result<TicketPage, ImportError>;
}

/// Rate-limited Syncro REST client.
pub struct SyncroClient {
    http: Client,
    base_url: String,
    api_key: SecretString,
    limiter: DefaultDirectRateLimiter,
}

impl SyncroClient {
    pub fn new(base_url: impl Into<String>, api_key: SecretString, per_minute: u32) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        let quota = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            limiter: RateLimiter::direct(Quota::per_minute(quota)),
        }
    }

    /// `None` when the base URL or key is missing.
    pub fn from_config(config: &SyncroConfig) -> Option<Self> {
        match (&config.base_url, &config.api_key) {
            (Some(base), Some(key)) => Some(Self::new(base.clone(), key.clone(), config.rate_limit_per_minute)),
            _ => None,
        }
    }

    pub fn tickets_url(&self, page: u32) -> String {
        format!("{}/tickets?page={page}", self.base_url)
    }
}

#[async_trait]
impl TicketSource for SyncroClient {
    async fn fetch_tickets_page(&self, page: u32) -> Result<TicketPage, ImportError> {
        let url = self.tickets_url(page);
        let mut waits = 0;
        loop {
            self.limiter.until_ready().await;
            let response = self
                .http
                .get(&url)
                .bearer_auth(self.api_key.expose_secret())
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| ImportError::Transport(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && waits < MAX_RATE_LIMIT_WAITS {
                let delay = retry_after(response.headers()).unwrap_or(Duration::from_secs(10));
                tracing::warn!(page, delay_secs = delay.as_secs(), "Syncro rate limit hit, waiting");
                tokio::time::sleep(delay).await;
                waits += 1;
                continue;
            }

            let body = response
                .text()
                .await
                .map_err(|e| ImportError::Transport(e.to_string()))?;
            if !status.is_success() {
                return Err(ImportError::Protocol {
                    status: status.as_u16(),
                    body,
                });
            }
            return serde_json::from_str(&body).map_err(|e| ImportError::Decode(e.to_string()));
        }
    }
}

/// Seconds form of `Retry-After`, capped.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Counts from one import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub pages: u32,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl ImportSummary {
    pub fn changed(&self) -> bool {
        self.created + self.updated > 0
    }
}

pub struct SyncroImporter {
    source: Option<Arc<dyn TicketSource>>,
    monitor: Arc<EventMonitor>,
    companies: Arc<dyn CompanyDirectory>,
    tickets: Arc<dyn TicketStore>,
    refresh: Arc<RefreshBus>,
    page_backoff_seconds: i32,
    max_pages: Option<u32>,
}

impl SyncroImporter {
    pub fn new(
        source: Option<Arc<dyn TicketSource>>,
        monitor: Arc<EventMonitor>,
        companies: Arc<dyn CompanyDirectory>,
        tickets: Arc<dyn TicketStore>,
        refresh: Arc<RefreshBus>,
    ) -> Self {
        Self {
            source,
            monitor,
            companies,
            tickets,
            refresh,
            page_backoff_seconds: DEFAULT_PAGE_BACKOFF_SECS,
            max_pages: None,
        }
    }

    pub fn with_page_backoff(mut self, seconds: i32) -> Self {
        self.page_backoff_seconds = seconds.max(0);
        self
    }

    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = Some(pages.max(1));
        self
    }

    pub fn is_configured(&self) -> bool {
        self.source.is_some()
    }

    /// Walk every ticket page and mirror the tickets.
    pub async fn import_tickets(&self) -> Result<ImportSummary, ImportError> {
        let Some(source) = &self.source else {
            return Err(ImportError::NotConfigured("Syncro API".to_string()));
        };

        let mut summary = ImportSummary::default();
        let mut page = 1;
        loop {
            let batch = self.fetch_page(source.as_ref(), page).await?;
            summary.pages += 1;
            summary.fetched += batch.tickets.len();

            for ticket in &batch.tickets {
                self.import_ticket(ticket, &mut summary).await?;
            }

            if !batch.has_more(page) || self.max_pages.is_some_and(|max| page >= max) {
                break;
            }
            page += 1;
        }

        tracing::info!(
            pages = summary.pages,
            fetched = summary.fetched,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            "Syncro ticket import finished"
        );

        if summary.changed() {
            self.refresh
                .broadcast_refresh(
                    RefreshRequest::topic("tickets")
                        .reason("syncro import")
                        .data(json!({ "created": summary.created, "updated": summary.updated })),
                )
                .await;
        }
        Ok(summary)
    }

    async fn import_ticket(
        &self,
        ticket: &SyncroTicket,
        summary: &mut ImportSummary,
    ) -> Result<(), ImportError> {
        let Some(customer_id) = ticket.customer_id else {
            summary.skipped += 1;
            return Ok(());
        };
        let company_id = match self.companies.company_for_syncro_customer(customer_id).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::debug!(ticket_id = ticket.id, customer_id, "No company for Syncro customer");
                summary.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(collaborator_error(e)),
        };

        match self
            .tickets
            .upsert_external_ticket(&ticket.to_external(company_id))
            .await
            .map_err(collaborator_error)?
        {
            UpsertOutcome::Created => summary.created += 1,
            UpsertOutcome::Updated => summary.updated += 1,
            UpsertOutcome::Unchanged => summary.unchanged += 1,
        }
        Ok(())
    }

    /// Fetch one page as a tracked event, retrying inline on the monitor's
    /// schedule until the event succeeds or fails for good.
    async fn fetch_page(&self, source: &dyn TicketSource, page: u32) -> Result<TicketPage, ImportError> {
        let event = self
            .monitor
            .create_event(
                NewEvent::new(
                    PAGE_EVENT,
                    format!("syncro://tickets?page={page}"),
                    json!({ "page": page }),
                )
                .with_retry_policy(PAGE_ATTEMPTS, self.page_backoff_seconds)
                .tracked(),
            )
            .await?;

        loop {
            let attempt = self.monitor.begin_attempt(event.id).await?;
            let (result, report) = match source.fetch_tickets_page(page).await {
                Ok(batch) => {
                    let body = json!({ "tickets": batch.tickets.len(), "meta": { "total_pages": batch.meta.total_pages } });
                    (Ok(batch), AttemptReport::succeeded(Some(200), Some(body.to_string())))
                }
                Err(ImportError::Protocol { status, body }) => {
                    let report = AttemptReport::rejected(i32::from(status), Some(body.clone()));
                    (Err(ImportError::Protocol { status, body }), report)
                }
                Err(e) => {
                    let report = AttemptReport::error(e.to_string());
                    (Err(e), report)
                }
            };

            let updated = self.monitor.complete_attempt(event.id, attempt, &report).await?;
            let error = match result {
                Ok(batch) => return Ok(batch),
                Err(e) => e,
            };

            match updated {
                Some(next) if next.status == EventStatus::Pending => {
                    let delay = (next.next_attempt_at - self.monitor.now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tracing::warn!(page, attempt, error = %error, delay_secs = delay.as_secs(), "Syncro page failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    return Err(ImportError::Exhausted {
                        attempts: attempt,
                        last_error: error.to_string(),
                    });
                }
            }
        }
    }
}

fn collaborator_error(error: CollaboratorError) -> ImportError {
    match error {
        CollaboratorError::NotConfigured(what) => ImportError::NotConfigured(what),
        other => ImportError::Collaborator(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::clock::ManualClock;
    use crate::db::memory::MemoryStore;
    use crate::monitor::AttemptStatus;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves scripted results per page; pages run out into empty pages.
    struct FakeSource {
        pages: Mutex<HashMap<u32, Vec<Result<TicketPage, ImportError>>>>,
    }

    impl FakeSource {
        fn new(pages: Vec<(u32, Vec<Result<TicketPage, ImportError>>)>) -> Self {
            Self {
                pages: Mutex::new(
                    pages
                        .into_iter()
                        .map(|(page, mut results)| {
                            results.reverse();
                            (page, results)
                        })
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl TicketSource for FakeSource {
        async fn fetch_tickets_page(&self, page: u32) -> Result<TicketPage, ImportError> {
            self.pages
                .lock()
                .unwrap()
                .get_mut(&page)
                .and_then(Vec::pop)
                .unwrap_or_else(|| Ok(TicketPage::default()))
        }
    }

    struct Directory;

    #[async_trait]
    impl CompanyDirectory for Directory {
        async fn company_for_syncro_customer(&self, customer_id: i64) -> Result<Option<i64>, CollaboratorError> {
            Ok((customer_id == 500).then_some(7))
        }
    }

    #[derive(Default)]
    struct Store {
        seen: Mutex<HashMap<String, ExternalTicket>>,
    }

    #[async_trait]
    impl TicketStore for Store {
        async fn upsert_external_ticket(&self, ticket: &ExternalTicket) -> Result<UpsertOutcome, CollaboratorError> {
            let mut seen = self.seen.lock().unwrap();
            Ok(match seen.insert(ticket.external_reference.clone(), ticket.clone()) {
                None => UpsertOutcome::Created,
                Some(old) if old == *ticket => UpsertOutcome::Unchanged,
                Some(_) => UpsertOutcome::Updated,
            })
        }
    }

    fn ticket(id: i64, customer_id: Option<i64>) -> SyncroTicket {
        serde_json::from_value(json!({
            "id": id,
            "subject": format!("Printer {id}"),
            "status": "New",
            "customer_id": customer_id,
            "contact": {"email": "user@example.com"},
            "comments": [{"body": "It is on fire"}]
        }))
        .unwrap()
    }

    fn page(tickets: Vec<SyncroTicket>, total_pages: u32) -> TicketPage {
        TicketPage {
            tickets,
            meta: PageMeta {
                total_pages: Some(total_pages),
                page: None,
            },
        }
    }

    fn importer(source: FakeSource, store: Arc<Store>) -> (SyncroImporter, Arc<EventMonitor>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()));
        let monitor = Arc::new(EventMonitor::new(Arc::new(MemoryStore::new()), clock.clone()));
        let importer = SyncroImporter::new(
            Some(Arc::new(source)),
            monitor.clone(),
            Arc::new(Directory),
            store,
            Arc::new(RefreshBus::new(clock, "test")),
        )
        .with_page_backoff(0);
        (importer, monitor)
    }

    #[tokio::test]
    async fn test_imports_all_pages_and_skips_unmapped() {
        let store = Arc::new(Store::default());
        let source = FakeSource::new(vec![
            (1, vec![Ok(page(vec![ticket(1, Some(500)), ticket(2, Some(999))], 2))]),
            (2, vec![Ok(page(vec![ticket(3, Some(500)), ticket(4, None)], 2))]),
        ]);
        let (importer, monitor) = importer(source, store.clone());

        let summary = importer.import_tickets().await.unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                pages: 2,
                fetched: 4,
                created: 2,
                updated: 0,
                unchanged: 0,
                skipped: 2,
            }
        );

        let stored = store.seen.lock().unwrap().get("syncro:1").cloned().unwrap();
        assert_eq!(stored.company_id, 7);
        assert_eq!(stored.description.as_deref(), Some("It is on fire"));
        assert_eq!(stored.requester_email.as_deref(), Some("user@example.com"));

        let events = monitor.list_events(Some(EventStatus::Succeeded), 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.name == PAGE_EVENT));
    }

    #[tokio::test]
    async fn test_failed_page_retries_inline() {
        let store = Arc::new(Store::default());
        let source = FakeSource::new(vec![(
            1,
            vec![
                Err(ImportError::Protocol {
                    status: 502,
                    body: "bad gateway".into(),
                }),
                Ok(page(vec![ticket(1, Some(500))], 1)),
            ],
        )]);
        let (importer, monitor) = importer(source, store);

        let summary = importer.import_tickets().await.unwrap();
        assert_eq!(summary.created, 1);

        let event = monitor.list_events(None, 10).await.unwrap().remove(0);
        assert_eq!(event.target_url, "syncro://tickets?page=1");
        assert_eq!(event.status, EventStatus::Succeeded);
        let attempts = monitor.list_attempts(event.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert_eq!(attempts[0].response_status, Some(502));
        assert_eq!(attempts[1].status, AttemptStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_attempts() {
        let failing = || Err(ImportError::Transport("connection reset".into()));
        let source = FakeSource::new(vec![(1, vec![failing(), failing(), failing()])]);
        let (importer, monitor) = importer(source, Arc::new(Store::default()));

        let err = importer.import_tickets().await.unwrap_err();
        assert!(matches!(err, ImportError::Exhausted { attempts: 3, .. }));
        let failed = monitor.list_events(Some(EventStatus::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_importer() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let importer = SyncroImporter::new(
            None,
            Arc::new(EventMonitor::new(Arc::new(MemoryStore::new()), clock.clone())),
            Arc::new(Directory),
            Arc::new(Store::default()),
            Arc::new(RefreshBus::new(clock, "test")),
        );
        assert!(matches!(
            importer.import_tickets().await,
            Err(ImportError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_retry_after_is_capped() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "30".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(30)));
        headers.insert(reqwest::header::RETRY_AFTER, "9999".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(MAX_RETRY_AFTER));
        headers.insert(reqwest::header::RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_tickets_url() {
        let client = SyncroClient::new("https://acme.syncromsp.com/api/v1/", SecretString::from("k"), 180);
        assert_eq!(client.tickets_url(3), "https://acme.syncromsp.com/api/v1/tickets?page=3");
    }
}
