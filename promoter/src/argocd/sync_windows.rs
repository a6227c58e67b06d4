//! Sync windows: AppProject rules that allow or deny syncs on a cron schedule.
//!
//! Schedules are standard five-field cron expressions (minute, hour, day of
//! month, month, day of week) evaluated in UTC. A window is active from each
//! scheduled start for its duration.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Datelike, DurationRound, NaiveDate, TimeDelta, Timelike, Utc};

use crate::argocd::types::{Application, SyncWindow};
use crate::core::duration::parse_duration;
use crate::core::glob::GlobList;

/// How far back to look for a window start. Every satisfiable schedule fires
/// within this span (February 29 can be eight years apart).
const MAX_LOOKBACK_DAYS: i64 = 8 * 366;

/// Parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<bool>,
    hours: Vec<bool>,
    days_of_month: Vec<bool>,
    months: Vec<bool>,
    days_of_week: Vec<bool>,
    day_of_month_restricted: bool,
    day_of_week_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
            bail!("cron schedule {expression:?} must have five fields");
        };
        let mut days_of_week = parse_field(day_of_week, 0, 7)
            .with_context(|| format!("day-of-week field of {expression:?}"))?;
        // 7 is another name for Sunday.
        if days_of_week[7] {
            days_of_week[0] = true;
        }
        days_of_week.truncate(7);

        Ok(Self {
            minutes: parse_field(minute, 0, 59).with_context(|| format!("minute field of {expression:?}"))?,
            hours: parse_field(hour, 0, 23).with_context(|| format!("hour field of {expression:?}"))?,
            days_of_month: parse_field(day_of_month, 1, 31)
                .with_context(|| format!("day-of-month field of {expression:?}"))?,
            months: parse_field(month, 1, 12).with_context(|| format!("month field of {expression:?}"))?,
            days_of_week,
            day_of_month_restricted: *day_of_month != "*",
            day_of_week_restricted: *day_of_week != "*",
        })
    }

    /// True when a window starts at the minute containing `at`.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.matches_day(at.date_naive())
            && self.minutes[at.minute() as usize]
            && self.hours[at.hour() as usize]
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let day_of_month = self.days_of_month[date.day() as usize];
        let day_of_week = self.days_of_week[date.weekday().num_days_from_sunday() as usize];
        // Cron ORs the two day fields when both are restricted.
        let day = match (self.day_of_month_restricted, self.day_of_week_restricted) {
            (true, true) => day_of_month || day_of_week,
            _ => day_of_month && day_of_week,
        };
        day && self.months[date.month() as usize]
    }

    /// The most recent start at or before `at`, no earlier than `earliest`.
    ///
    /// Walks back one day at a time and picks the latest matching minute of
    /// the first matching day, so the cost is bounded by the number of days
    /// between `earliest` and `at`.
    pub fn latest_start(&self, at: DateTime<Utc>, earliest: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = at.date_naive();
        let mut date = today;
        loop {
            if self.matches_day(date) {
                let (last_hour, last_minute) = if date == today {
                    (at.hour(), at.minute())
                } else {
                    (23, 59)
                };
                for hour in (0..=last_hour).rev().filter(|h| self.hours[*h as usize]) {
                    let minute_cap = if hour == last_hour { last_minute } else { 59 };
                    let Some(minute) = (0..=minute_cap).rev().find(|m| self.minutes[*m as usize]) else {
                        continue;
                    };
                    let start = date.and_hms_opt(hour, minute, 0)?.and_utc();
                    return (start >= earliest).then_some(start);
                }
            }
            if date.and_hms_opt(0, 0, 0)?.and_utc() <= earliest {
                return None;
            }
            date = date.pred_opt()?;
        }
    }
}

/// Parse one cron field into a lookup table indexed by value (`0..=max`).
fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<bool>> {
    let mut allowed = vec![false; max as usize + 1];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| anyhow!("invalid step {step:?}"))?;
                if step == 0 {
                    bail!("step must be positive");
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((start, end)) = range.split_once('-') {
            (parse_value(start, min, max)?, parse_value(end, min, max)?)
        } else {
            let start = parse_value(range, min, max)?;
            (start, if part.contains('/') { max } else { start })
        };
        if start > end {
            bail!("range {range:?} is reversed");
        }
        for value in (start..=end).step_by(step as usize) {
            allowed[value as usize] = true;
        }
    }
    Ok(allowed)
}

fn parse_value(raw: &str, min: u32, max: u32) -> Result<u32> {
    let value: u32 = raw.parse().map_err(|_| anyhow!("invalid value {raw:?}"))?;
    if value < min || value > max {
        bail!("value {value} is outside {min}-{max}");
    }
    Ok(value)
}

/// True when `window` is open at `now`.
pub fn is_active(window: &SyncWindow, now: DateTime<Utc>) -> Result<bool> {
    if !window.time_zone.is_empty() && !matches!(window.time_zone.as_str(), "UTC" | "Etc/UTC") {
        bail!(
            "sync window time zone {:?} is not supported; only UTC is",
            window.time_zone
        );
    }
    let schedule = CronSchedule::parse(&window.schedule)?;
    let duration = parse_duration(&window.duration)
        .with_context(|| format!("sync window duration {:?}", window.duration))?;
    let duration = TimeDelta::from_std(duration)
        .with_context(|| format!("sync window duration {:?} is too long", window.duration))?;

    if duration <= TimeDelta::zero() {
        return Ok(false);
    }

    let lookback = duration.min(TimeDelta::days(MAX_LOOKBACK_DAYS));
    let earliest = now.checked_sub_signed(lookback).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let Some(start) = schedule.latest_start(now.duration_trunc(TimeDelta::minutes(1))?, earliest) else {
        return Ok(false);
    };
    // An end past the representable range is still in the future.
    Ok(start.checked_add_signed(duration).is_none_or(|end| end > now))
}

/// True when `window` applies to `app`.
pub fn applies_to(window: &SyncWindow, app: &Application) -> Result<bool> {
    let destination = &app.spec.destination;
    let applications = GlobList::new(&window.applications).context("sync window applications")?;
    let namespaces = GlobList::new(&window.namespaces).context("sync window namespaces")?;
    let clusters = GlobList::new(&window.clusters).context("sync window clusters")?;
    Ok(applications.is_match(&app.metadata.name)
        || (!destination.namespace.is_empty() && namespaces.is_match(&destination.namespace))
        || (!destination.server.is_empty() && clusters.is_match(&destination.server))
        || (!destination.name.is_empty() && clusters.is_match(&destination.name)))
}

/// Whether a manual sync of `app` is allowed at `now` under `windows`.
///
/// - No applicable window: allowed.
/// - Active deny windows: allowed only if every one of them permits manual sync.
/// - An active allow window: allowed.
/// - Allow windows exist but none is active: allowed if any permits manual sync.
pub fn manual_sync_permitted(
    windows: &[SyncWindow],
    app: &Application,
    now: DateTime<Utc>,
) -> Result<bool> {
    let mut applicable = Vec::new();
    for window in windows {
        if applies_to(window, app)? {
            applicable.push(window);
        }
    }
    if applicable.is_empty() {
        return Ok(true);
    }

    let mut active_denies = Vec::new();
    let mut active_allows = Vec::new();
    let mut allows = Vec::new();
    for window in applicable {
        let active = is_active(window, now)?;
        match window.kind.as_str() {
            "deny" => {
                if active {
                    active_denies.push(window);
                }
            }
            "allow" => {
                allows.push(window);
                if active {
                    active_allows.push(window);
                }
            }
            other => bail!("unknown sync window kind {other:?}"),
        }
    }

    if !active_denies.is_empty() {
        return Ok(active_denies.iter().all(|w| w.manual_sync));
    }
    if !active_allows.is_empty() {
        return Ok(true);
    }
    if !allows.is_empty() {
        return Ok(allows.iter().any(|w| w.manual_sync));
    }
    Ok(true)
}
