//! Webhook event and attempt records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest response body kept on an event or attempt.
pub const BODY_PREVIEW_LIMIT: usize = 4096;

/// Request/response header map as stored in JSON columns.
pub type Headers = BTreeMap<String, String>;

/// Lifecycle state of a [`WebhookEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event status '{other}'")),
        }
    }
}

/// Who drives retries for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Claimed and replayed by `process_pending`.
    #[default]
    Monitor,
    /// Observed only; the creator performs and completes each attempt.
    Tracker,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Tracker => "tracker",
        }
    }
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monitor" => Ok(Self::Monitor),
            "tracker" => Ok(Self::Tracker),
            other => Err(format!("unknown delivery mode '{other}'")),
        }
    }
}

/// An outbound side effect and its retry state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub name: String,
    pub target_url: String,
    pub headers: Headers,
    pub payload: serde_json::Value,
    pub delivery: DeliveryMode,
    pub status: EventStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub backoff_seconds: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn retries_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Fields for creating an event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub name: String,
    pub target_url: String,
    pub payload: serde_json::Value,
    pub headers: Headers,
    pub max_attempts: i32,
    pub backoff_seconds: i32,
    pub delivery: DeliveryMode,
    /// Delay before the monitor may claim the event.
    pub hold: chrono::Duration,
}

impl NewEvent {
    pub fn new(
        name: impl Into<String>,
        target_url: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            target_url: target_url.into(),
            payload,
            headers: Headers::new(),
            max_attempts: 3,
            backoff_seconds: 30,
            delivery: DeliveryMode::Monitor,
            hold: chrono::Duration::zero(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_retry_policy(mut self, max_attempts: i32, backoff_seconds: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_seconds = backoff_seconds.max(0);
        self
    }

    /// Keep the event away from `claim_due` for `hold`; its creator is about
    /// to attempt it inline.
    pub fn held_for(mut self, hold: chrono::Duration) -> Self {
        self.hold = hold.max(chrono::Duration::zero());
        self
    }

    pub fn tracked(mut self) -> Self {
        self.delivery = DeliveryMode::Tracker;
        self
    }
}

/// Result recorded for a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// 2xx or equivalent success.
    Succeeded,
    /// The remote answered with an error status.
    Failed,
    /// The call never produced a response.
    Error,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown attempt status '{other}'")),
        }
    }
}

/// Append-only attempt log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEventAttempt {
    pub id: i64,
    pub event_id: i64,
    pub attempt_number: i32,
    pub status: AttemptStatus,
    pub response_status: Option<i32>,
    pub request_headers: Headers,
    pub request_body: Option<String>,
    pub response_headers: Headers,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Attempt about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttempt {
    pub event_id: i64,
    pub attempt_number: i32,
    pub status: AttemptStatus,
    pub response_status: Option<i32>,
    pub request_headers: Headers,
    pub request_body: Option<String>,
    pub response_headers: Headers,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
}

impl NewAttempt {
    pub fn new(event_id: i64, attempt_number: i32, status: AttemptStatus) -> Self {
        Self {
            event_id,
            attempt_number,
            status,
            response_status: None,
            request_headers: Headers::new(),
            request_body: None,
            response_headers: Headers::new(),
            response_body: None,
            error_message: None,
        }
    }

    pub fn with_request(mut self, headers: Headers, body: Option<String>) -> Self {
        self.request_headers = headers;
        self.request_body = body;
        self
    }

    pub fn with_response(
        mut self,
        status: Option<i32>,
        headers: Headers,
        body: Option<String>,
    ) -> Self {
        self.response_status = status;
        self.response_headers = headers;
        self.response_body = body.map(|b| crate::scheduler::task::truncate_chars(&b, BODY_PREVIEW_LIMIT));
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Terminal or retry transition applied to an in-progress event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventOutcome {
    pub status: EventStatus,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
}
