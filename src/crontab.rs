//! Classic five-field crontab evaluation.
//!
//! Expressions use the familiar `minute hour day-of-month month day-of-week`
//! layout with lists, ranges, steps and names. They are translated to the
//! seconds-first dialect of the `cron` crate:
//!
//! - a `0` seconds field is prepended;
//! - numeric weekdays are shifted (`0`/`7` = Sunday becomes `1`);
//! - when both day fields are restricted the classic OR rule applies, which is
//!   evaluated as two schedules and the earlier fire wins.
//!
//! Every result is strictly after the reference instant.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::CronError;

/// A parsed crontab expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    primary: ::cron::Schedule,
    /// Day-of-week half of an OR-ed day specification.
    alternate: Option<::cron::Schedule>,
}

impl CronSchedule {
    /// Parse a five-field expression (or one of the `@hourly` style macros).
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();
        let expanded = expand_macro(trimmed).unwrap_or(trimmed);

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);
        let dow = translate_weekdays(dow).map_err(|reason| invalid(expression, reason))?;
        let month = month.to_uppercase();

        let dom_restricted = !dom.starts_with('*');
        let dow_restricted = !dow.starts_with('*');

        let build = |dom: &str, dow: &str| {
            let spec = format!("0 {minute} {hour} {dom} {month} {dow}");
            ::cron::Schedule::from_str(&spec).map_err(|e| invalid(expression, e.to_string()))
        };

        let (primary, alternate) = if dom_restricted && dow_restricted {
            (build(dom, "*")?, Some(build("*", &dow)?))
        } else {
            (build(dom, &dow)?, None)
        };

        Ok(Self {
            expression: expression.to_string(),
            primary,
            alternate,
        })
    }

    /// The expression this schedule was parsed from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next fire strictly after `reference`, evaluated in the reference's zone.
    pub fn next_after<Z: TimeZone>(&self, reference: &DateTime<Z>) -> Option<DateTime<Z>> {
        let primary = self.primary.after(reference).next();
        let alternate = self
            .alternate
            .as_ref()
            .and_then(|schedule| schedule.after(reference).next());

        match (primary, alternate) {
            (Some(a), Some(b)) => Some(if b < a { b } else { a }),
            (a, b) => a.or(b),
        }
    }
}

/// Next firing instant of `expression` strictly after `reference` (UTC).
pub fn next_after(expression: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    let schedule = CronSchedule::parse(expression)?;
    schedule
        .next_after(&reference)
        .ok_or_else(|| CronError::NoUpcomingFire(expression.to_string()))
}

/// Like [`next_after`] but with the fields interpreted in `tz`.
pub fn next_after_in(
    expression: &str,
    reference: DateTime<Utc>,
    tz: Tz,
) -> Result<DateTime<Utc>, CronError> {
    let schedule = CronSchedule::parse(expression)?;
    schedule
        .next_after(&reference.with_timezone(&tz))
        .map(|fire| fire.with_timezone(&Utc))
        .ok_or_else(|| CronError::NoUpcomingFire(expression.to_string()))
}

/// Check an expression without evaluating it.
pub fn validate(expression: &str) -> Result<(), CronError> {
    CronSchedule::parse(expression).map(|_| ())
}

fn invalid(expression: &str, reason: impl Into<String>) -> CronError {
    CronError::InvalidExpression {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn expand_macro(expression: &str) -> Option<&'static str> {
    match expression.to_lowercase().as_str() {
        "@hourly" => Some("0 * * * *"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@monthly" => Some("0 0 1 * *"),
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        _ => None,
    }
}

/// Rewrite a crontab weekday field (0-7, Sunday = 0 or 7) into the `cron`
/// crate's numbering (1-7, Sunday = 1).
///
/// `*` and `*/N` are kept: both numberings start on Sunday so the selected
/// days are the same. Numeric ranges are expanded into explicit lists so a
/// range ending on `7` keeps meaning Sunday.
fn translate_weekdays(field: &str) -> Result<String, String> {
    let mut out: Vec<String> = Vec::new();

    for item in field.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err("empty day-of-week list item".to_string());
        }
        if item.starts_with('*') {
            out.push(item.to_string());
            continue;
        }

        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{step}'"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        if !base.chars().all(|c| c.is_ascii_digit() || c == '-') {
            // Named days (MON, MON-FRI) are understood by the cron crate.
            out.push(item.to_uppercase());
            continue;
        }

        let (start, end) = match base.split_once('-') {
            Some((start, end)) => (parse_weekday(start)?, parse_weekday(end)?),
            None => {
                let day = parse_weekday(base)?;
                (day, if step.is_some() { 7 } else { day })
            }
        };
        if start > end {
            return Err(format!("day-of-week range {start}-{end} is reversed"));
        }

        let step = step.unwrap_or(1) as usize;
        for day in (start..=end).step_by(step) {
            let translated = (day % 7 + 1).to_string();
            if !out.contains(&translated) {
                out.push(translated);
            }
        }
    }

    Ok(out.join(","))
}

fn parse_weekday(value: &str) -> Result<u32, String> {
    let day: u32 = value
        .parse()
        .map_err(|_| format!("invalid day-of-week '{value}'"))?;
    if day > 7 {
        return Err(format!("day-of-week {day} out of range 0-7"));
    }
    Ok(day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_every_fifteen_minutes() {
        let next = next_after("*/15 * * * *", utc(2025, 1, 1, 12, 0)).unwrap();
        assert_eq!(next, utc(2025, 1, 1, 12, 15));
    }

    #[test]
    fn test_result_is_strictly_after_reference() {
        let next = next_after("0 8 * * *", utc(2025, 1, 1, 8, 0)).unwrap();
        assert_eq!(next, utc(2025, 1, 2, 8, 0));
    }

    #[test]
    fn test_lists_and_ranges() {
        let next = next_after("5,35 9-17 * * *", utc(2025, 1, 1, 17, 40)).unwrap();
        assert_eq!(next, utc(2025, 1, 2, 9, 5));
    }

    #[test]
    fn test_sunday_as_zero_and_seven() {
        // 2025-01-01 is a Wednesday.
        let zero = next_after("0 6 * * 0", utc(2025, 1, 1, 0, 0)).unwrap();
        let seven = next_after("0 6 * * 7", utc(2025, 1, 1, 0, 0)).unwrap();
        assert_eq!(zero.weekday(), Weekday::Sun);
        assert_eq!(zero, seven);
        assert_eq!(zero, utc(2025, 1, 5, 6, 0));
    }

    #[test]
    fn test_weekday_range() {
        // Friday 2025-01-03 18:00 -> next weekday morning is Monday.
        let next = next_after("30 7 * * 1-5", utc(2025, 1, 3, 18, 0)).unwrap();
        assert_eq!(next, utc(2025, 1, 6, 7, 30));
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_named_weekdays() {
        let next = next_after("0 9 * * mon-fri", utc(2025, 1, 4, 12, 0)).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_day_fields_are_ored_when_both_restricted() {
        // The 15th or any Monday: from Wed 2025-01-01 the first Monday (6th) wins.
        let next = next_after("0 0 15 * 1", utc(2025, 1, 1, 0, 0)).unwrap();
        assert_eq!(next, utc(2025, 1, 6, 0, 0));

        // From Tue 2025-01-14 the 15th comes before the next Monday.
        let next = next_after("0 0 15 * 1", utc(2025, 1, 14, 0, 0)).unwrap();
        assert_eq!(next, utc(2025, 1, 15, 0, 0));
    }

    #[test]
    fn test_macros() {
        let next = next_after("@hourly", utc(2025, 1, 1, 12, 30)).unwrap();
        assert_eq!(next, utc(2025, 1, 1, 13, 0));
    }

    #[test]
    fn test_timezone_evaluation() {
        // 09:00 in Australia/Brisbane (UTC+10, no DST) is 23:00 UTC the day before.
        let next = next_after_in("0 9 * * *", utc(2025, 1, 1, 0, 0), chrono_tz::Australia::Brisbane)
            .unwrap();
        assert_eq!(next, utc(2025, 1, 1, 23, 0));
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            next_after("bad", utc(2025, 1, 1, 0, 0)),
            Err(CronError::InvalidExpression { .. })
        ));
        assert!(validate("* * * *").is_err());
        assert!(validate("61 * * * *").is_err());
        assert!(validate("0 0 * * 8").is_err());
        assert!(validate("*/15 * * * *").is_ok());
    }

    #[test]
    fn test_deterministic() {
        let reference = utc(2025, 3, 10, 4, 7);
        let a = next_after("17 */3 * * *", reference).unwrap();
        let b = next_after("17 */3 * * *", reference).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hour() % 3, 0);
    }
}
