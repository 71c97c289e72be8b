//! Next-run computation for scheduled automations.

use chrono::{DateTime, Utc};

use super::model::{Automation, AutomationKind};
use crate::crontab;

/// When `automation` should next run, judged from `reference`.
///
/// One-shots run at their `scheduled_time` (even if already past) until they
/// have run once. Otherwise a valid cron expression wins over the cadence; an
/// invalid one is logged and ignored.
pub fn calculate_next_run(automation: &Automation, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if automation.kind != AutomationKind::Scheduled {
        return None;
    }

    if automation.run_once {
        if automation.last_run_at.is_some() {
            return None;
        }
        return automation.scheduled_time;
    }

    if let Some(expression) = automation
        .cron_expression
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        match crontab::next_after(expression, reference) {
            Ok(next) => return Some(next),
            Err(e) => tracing::warn!(
                automation_id = automation.id,
                cron = expression,
                error = %e,
                "Ignoring invalid automation cron expression"
            ),
        }
    }

    automation
        .cadence
        .map(|cadence| reference + cadence.interval())
}
