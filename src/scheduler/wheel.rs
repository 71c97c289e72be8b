//! In-process registry of jobs and their next fire instants.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use super::task::ScheduledTask;
use crate::crontab;
use crate::error::CronError;

/// Built-in jobs registered next to the task triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorJob {
    WebhookMonitor,
    WebhookCleanup,
    AutomationRunner,
}

impl MonitorJob {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebhookMonitor => "webhook-monitor",
            Self::WebhookCleanup => "webhook-cleanup",
            Self::AutomationRunner => "automation-runner",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum JobKey {
    Task(i64),
    Monitor(MonitorJob),
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task(id) => write!(f, "task:{id}"),
            Self::Monitor(job) => f.write_str(job.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Cron { expression: String, timezone: Tz },
    Interval { seconds: i64 },
}

impl Trigger {
    pub fn every(interval: std::time::Duration) -> Self {
        Self::Interval {
            seconds: i64::try_from(interval.as_secs()).unwrap_or(i64::MAX).max(1),
        }
    }

    /// First fire instant strictly after `reference`.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        match self {
            Self::Cron {
                expression,
                timezone,
            } => crontab::next_after_in(expression, reference, *timezone),
            Self::Interval { seconds } => Ok(reference + Duration::seconds(*seconds)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registration {
    pub key: JobKey,
    pub label: String,
    pub trigger: Trigger,
    pub next_fire: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct TimingWheel {
    entries: BTreeMap<JobKey, Registration>,
}

impl TimingWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &JobKey) -> Option<&Registration> {
        self.entries.get(key)
    }

    /// Register (or replace) a job firing first strictly after `now`.
    pub fn schedule(
        &mut self,
        key: JobKey,
        label: impl Into<String>,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CronError> {
        let next_fire = trigger.next_after(now)?;
        self.entries.insert(
            key,
            Registration {
                key,
                label: label.into(),
                trigger,
                next_fire,
            },
        );
        Ok(next_fire)
    }

    pub fn remove(&mut self, key: &JobKey) -> Option<Registration> {
        self.entries.remove(key)
    }

    /// Replace every task registration with `tasks`, keeping monitor jobs.
    ///
    /// A task whose expression and zone are unchanged keeps its pending fire
    /// instant; new or changed tasks fire strictly after `now`. Inactive tasks
    /// and invalid expressions are dropped. Returns the number of tasks
    /// registered.
    pub fn replace_tasks(&mut self, tasks: &[ScheduledTask], timezone: Tz, now: DateTime<Utc>) -> usize {
        let mut previous: HashMap<i64, Registration> = HashMap::new();
        self.entries.retain(|key, registration| match key {
            JobKey::Task(id) => {
                previous.insert(*id, registration.clone());
                false
            }
            JobKey::Monitor(_) => true,
        });

        let mut registered = 0;
        for task in tasks.iter().filter(|t| t.active) {
            let key = JobKey::Task(task.id);
            let trigger = Trigger::Cron {
                expression: task.cron.clone(),
                timezone,
            };

            let next_fire = match previous.remove(&task.id) {
                Some(old) if old.trigger == trigger => old.next_fire,
                _ => match trigger.next_after(now) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::warn!(task_id = task.id, cron = %task.cron, error = %e, "Task not scheduled");
                        continue;
                    }
                },
            };

            self.entries.insert(
                key,
                Registration {
                    key,
                    label: task.name.clone(),
                    trigger,
                    next_fire,
                },
            );
            registered += 1;
        }
        registered
    }

    /// Pop every job due at `now`, advancing each to its next fire instant
    /// after `now` so an instant is never handed out twice. Ordered by the
    /// instant they were due.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<Registration> {
        let mut due: Vec<Registration> = self
            .entries
            .values()
            .filter(|r| r.next_fire <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.next_fire, r.key));

        for fired in &due {
            let next = fired.trigger.next_after(now);
            match next {
                Ok(next_fire) => {
                    if let Some(entry) = self.entries.get_mut(&fired.key) {
                        entry.next_fire = next_fire;
                    }
                }
                Err(e) => {
                    tracing::warn!(job = %fired.key, error = %e, "Job has no further fire instant");
                    self.entries.remove(&fired.key);
                }
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|r| r.next_fire).min()
    }

    pub fn snapshot(&self) -> Vec<Registration> {
        let mut all: Vec<Registration> = self.entries.values().cloned().collect();
        all.sort_by_key(|r| (r.next_fire, r.key));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, s).unwrap()
    }

    fn task(id: i64, cron: &str) -> ScheduledTask {
        ScheduledTask {
            id,
            name: format!("task {id}"),
            command: "sync_staff".into(),
            cron: cron.into(),
            company_id: None,
            description: None,
            active: true,
            max_retries: 0,
            retry_backoff_seconds: 60,
            last_run_at: None,
            last_status: None,
            last_error: None,
        }
    }

    #[test]
    fn test_take_due_fires_once_per_instant() {
        let mut wheel = TimingWheel::new();
        wheel.replace_tasks(&[task(1, "*/5 * * * *")], Tz::UTC, at(9, 58, 0));
        assert_eq!(wheel.get(&JobKey::Task(1)).unwrap().next_fire, at(10, 0, 0));

        assert!(wheel.take_due(at(9, 59, 59)).is_empty());
        let due = wheel.take_due(at(10, 0, 0));
        assert_eq!(due.len(), 1);
        assert!(wheel.take_due(at(10, 0, 30)).is_empty());
        assert_eq!(wheel.next_deadline(), Some(at(10, 5, 0)));
    }

    #[test]
    fn test_refresh_keeps_unchanged_and_reschedules_changed() {
        let mut wheel = TimingWheel::new();
        wheel
            .schedule(
                JobKey::Monitor(MonitorJob::WebhookMonitor),
                "webhook-monitor",
                Trigger::every(std::time::Duration::from_secs(60)),
                at(9, 0, 0),
            )
            .unwrap();
        wheel.replace_tasks(&[task(1, "0 12 * * *"), task(2, "0 12 * * *")], Tz::UTC, at(9, 0, 0));

        let mut changed = task(2, "30 10 * * *");
        changed.name = "renamed".into();
        let mut inactive = task(3, "* * * * *");
        inactive.active = false;
        let registered = wheel.replace_tasks(
            &[task(1, "0 12 * * *"), changed, inactive, task(4, "not cron")],
            Tz::UTC,
            at(10, 45, 0),
        );

        assert_eq!(registered, 2);
        // Unchanged: pending instant kept.
        assert_eq!(wheel.get(&JobKey::Task(1)).unwrap().next_fire, at(12, 0, 0));
        // Changed: strictly after the refresh instant.
        assert_eq!(
            wheel.get(&JobKey::Task(2)).unwrap().next_fire,
            Utc.with_ymd_and_hms(2025, 3, 11, 10, 30, 0).unwrap()
        );
        assert!(wheel.get(&JobKey::Task(3)).is_none());
        assert!(wheel.get(&JobKey::Task(4)).is_none());
        assert!(wheel.get(&JobKey::Monitor(MonitorJob::WebhookMonitor)).is_some());
    }

    #[test]
    fn test_cron_in_configured_zone() {
        let mut wheel = TimingWheel::new();
        wheel.replace_tasks(&[task(1, "0 9 * * *")], chrono_tz::Australia::Brisbane, at(0, 0, 0));
        // 09:00 AEST is 23:00 UTC the previous day; next one is 2025-03-10 23:00 UTC.
        assert_eq!(wheel.get(&JobKey::Task(1)).unwrap().next_fire, at(23, 0, 0));
    }
}
