//! Persisted automation definitions and run records.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::filter::FilterExpr;
use crate::error::AutomationError;
use crate::scheduler::task::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationKind {
    Scheduled,
    Event,
}

impl AutomationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Event => "event",
        }
    }
}

impl std::str::FromStr for AutomationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "event" => Ok(Self::Event),
            other => Err(format!("unknown automation kind '{other}'")),
        }
    }
}

/// Fixed repeat interval used when no cron expression is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Hourly,
    Daily,
    Weekly,
    /// Thirty days, not a calendar month.
    Monthly,
}

impl Cadence {
    pub fn interval(&self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::days(7),
            Self::Monthly => Duration::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl std::str::FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!("unknown cadence '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Active,
    Inactive,
}

impl AutomationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl std::str::FromStr for AutomationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!("unknown automation status '{other}'")),
        }
    }
}

/// A stored automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub kind: AutomationKind,
    pub cadence: Option<Cadence>,
    pub cron_expression: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub run_once: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub trigger_event: Option<String>,
    pub trigger_filters: Option<FilterExpr>,
    pub action_module: Option<String>,
    pub action_payload: Option<serde_json::Value>,
    pub status: AutomationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Automation {
    pub fn is_active(&self) -> bool {
        self.status == AutomationStatus::Active
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active()
            && self.kind == AutomationKind::Scheduled
            && self.next_run_at.is_some_and(|at| at <= now)
    }

    /// Declared actions in execution order.
    ///
    /// `action_payload.actions` wins; otherwise the single
    /// `action_module`/`action_payload` pair is used.
    pub fn actions(&self) -> Vec<ActionSpec> {
        if let Some(list) = self
            .action_payload
            .as_ref()
            .and_then(|p| p.get("actions"))
            .and_then(|a| a.as_array())
        {
            return list
                .iter()
                .filter_map(|entry| {
                    let module = entry.get("module")?.as_str()?.trim();
                    (!module.is_empty()).then(|| ActionSpec {
                        module: module.to_string(),
                        payload: entry
                            .get("payload")
                            .cloned()
                            .unwrap_or_else(|| serde_json::json!({})),
                    })
                })
                .collect();
        }

        match self.action_module.as_deref().map(str::trim) {
            Some(module) if !module.is_empty() => vec![ActionSpec {
                module: module.to_string(),
                payload: self
                    .action_payload
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({})),
            }],
            _ => Vec::new(),
        }
    }
}

/// One module invocation declared by an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub module: String,
    pub payload: serde_json::Value,
}

/// Fields for creating an automation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAutomation {
    pub name: String,
    pub description: Option<String>,
    pub kind: AutomationKind,
    pub cadence: Option<Cadence>,
    pub cron_expression: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub run_once: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub trigger_event: Option<String>,
    pub trigger_filters: Option<FilterExpr>,
    pub action_module: Option<String>,
    pub action_payload: Option<serde_json::Value>,
    pub status: AutomationStatus,
}

impl NewAutomation {
    pub fn scheduled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            kind: AutomationKind::Scheduled,
            cadence: None,
            cron_expression: None,
            scheduled_time: None,
            run_once: false,
            next_run_at: None,
            trigger_event: None,
            trigger_filters: None,
            action_module: None,
            action_payload: None,
            status: AutomationStatus::Active,
        }
    }

    pub fn event(name: impl Into<String>, trigger_event: impl Into<String>) -> Self {
        Self {
            kind: AutomationKind::Event,
            trigger_event: Some(trigger_event.into()),
            ..Self::scheduled(name)
        }
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self
    }

    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = Some(cadence);
        self
    }

    pub fn once_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_once = true;
        self.scheduled_time = Some(at);
        self
    }

    pub fn with_next_run(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.trigger_filters = Some(filter);
        self
    }

    pub fn with_action(mut self, module: impl Into<String>, payload: serde_json::Value) -> Self {
        self.action_module = Some(module.into());
        self.action_payload = Some(payload);
        self
    }

    /// Multi-step form stored as `action_payload.actions`.
    pub fn with_actions(mut self, actions: Vec<ActionSpec>) -> Self {
        self.action_module = None;
        self.action_payload = Some(serde_json::json!({ "actions": actions }));
        self
    }

    pub fn inactive(mut self) -> Self {
        self.status = AutomationStatus::Inactive;
        self
    }
}

/// Parse a `scheduled_time` string. Offsets are honoured; naive values are
/// taken as UTC.
pub fn parse_scheduled_time(raw: &str) -> Result<DateTime<Utc>, AutomationError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(AutomationError::Validation(format!(
        "unrecognised scheduled_time '{raw}'"
    )))
}

/// A record of one automation execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRun {
    pub id: i64,
    pub automation_id: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub result_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAutomationRun {
    pub automation_id: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl NewAutomationRun {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample(payload: Option<serde_json::Value>, module: Option<&str>) -> Automation {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Automation {
            id: 1,
            name: "a".into(),
            description: None,
            kind: AutomationKind::Scheduled,
            cadence: None,
            cron_expression: None,
            scheduled_time: None,
            run_once: false,
            next_run_at: None,
            last_run_at: None,
            last_error: None,
            trigger_event: None,
            trigger_filters: None,
            action_module: module.map(str::to_string),
            action_payload: payload,
            status: AutomationStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_action_list_takes_precedence() {
        let automation = sample(
            Some(json!({"actions": [
                {"module": "webhook", "payload": {"url": "https://a"}},
                {"module": " "},
                {"module": "smtp"}
            ]})),
            Some("ignored"),
        );
        let actions = automation.actions();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].module, "webhook");
        assert_eq!(actions[1].payload, json!({}));
    }

    #[test]
    fn test_single_action_is_synthesized() {
        let automation = sample(Some(json!({"to": "x"})), Some("smtp"));
        assert_eq!(
            automation.actions(),
            vec![ActionSpec { module: "smtp".into(), payload: json!({"to": "x"}) }]
        );
        assert!(sample(None, None).actions().is_empty());
    }

    #[test]
    fn test_naive_scheduled_time_is_utc() {
        let expected = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        assert_eq!(parse_scheduled_time("2025-06-01T08:00:00").unwrap(), expected);
        assert_eq!(parse_scheduled_time("2025-06-01 08:00:00").unwrap(), expected);
        assert_eq!(parse_scheduled_time("2025-06-01T18:00:00+10:00").unwrap(), expected);
        assert!(parse_scheduled_time("tomorrow").is_err());
    }
}
