//! Scheduled task records and run history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest `details` / error text stored on a run row.
pub const DETAILS_LIMIT: usize = 2000;

/// A persisted cron-driven task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub cron: String,
    pub company_id: Option<i64>,
    /// Free text; a JSON object for `create_scheduled_ticket`.
    pub description: Option<String>,
    pub active: bool,
    pub max_retries: i32,
    pub retry_backoff_seconds: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub last_error: Option<String>,
}

/// Fields for inserting a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScheduledTask {
    pub name: String,
    pub command: String,
    pub cron: String,
    #[serde(default)]
    pub company_id: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub max_retries: i32,
    #[serde(default = "default_backoff")]
    pub retry_backoff_seconds: i32,
}

fn default_active() -> bool {
    true
}

fn default_backoff() -> i32 {
    60
}

impl NewScheduledTask {
    pub fn new(name: impl Into<String>, command: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cron: cron.into(),
            company_id: None,
            description: None,
            active: true,
            max_retries: 0,
            retry_backoff_seconds: default_backoff(),
        }
    }

    pub fn with_company(mut self, company_id: i64) -> Self {
        self.company_id = Some(company_id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_retries(mut self, max_retries: i32, backoff_seconds: i32) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_seconds = backoff_seconds;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Outcome of a task or automation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// A record of one task firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTaskRun {
    pub id: i64,
    pub task_id: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub details: Option<String>,
}

/// A run about to be recorded.
#[derive(Debug, Clone)]
pub struct NewTaskRun {
    pub task_id: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub details: Option<String>,
}

impl NewTaskRun {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0)
    }

    /// Error text mirrored onto the task's `last_error`.
    pub fn error(&self) -> Option<&str> {
        match self.status {
            RunStatus::Failed => self.details.as_deref(),
            _ => None,
        }
    }
}

/// Truncate on a character boundary.
pub fn truncate_details(text: &str) -> String {
    truncate_chars(text, DETAILS_LIMIT)
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(DETAILS_LIMIT + 10);
        let out = truncate_details(&long);
        assert_eq!(out.chars().count(), DETAILS_LIMIT);
        assert_eq!(truncate_details("short"), "short");
    }

    #[test]
    fn test_run_status_roundtrip() {
        for status in [RunStatus::Succeeded, RunStatus::Failed, RunStatus::Skipped] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("running".parse::<RunStatus>().is_err());
    }
}
