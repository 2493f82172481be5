//! Time-windowed configuration overlays.
//!
//! A schedule applies a rate limit to matching keys while its window is
//! active: one-time windows, recurring cron windows, or event-driven
//! windows an operator toggles by hand. A background evaluator recomputes
//! the active set about once a second and publishes it as an immutable
//! snapshot; the resolver reads that snapshot without taking a lock.
//!
//! Cron expressions are evaluated in the schedule's own timezone, so
//! "03:00 every day" in `Europe/Berlin` keeps meaning Berlin's 3am through
//! DST shifts regardless of where the replica runs.

use crate::error::{Error, Result};
use crate::limits::RateLimitConfig;
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use globset::{Glob, GlobMatcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Active window length for a recurring schedule that does not carry an
/// explicit start/end pair.
const DEFAULT_RECURRING_WINDOW_MIN: i64 = 60;

/// Upper bound on cron fires examined per evaluation, a guard against
/// pathological expressions.
const MAX_CRON_PROBES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    OneTime,
    Recurring,
    EventDriven,
}

/// Gradual limit transitions at the edges of a window, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub ramp_up_min: u32,
    #[serde(default)]
    pub ramp_down_min: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub key_pattern: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub active_limits: RateLimitConfig,
    #[serde(default)]
    pub fallback_limits: Option<RateLimitConfig>,
    #[serde(default)]
    pub transition: Option<Transition>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Schedule {
    /// Creation-time validation; nothing invalid is ever stored.
    pub fn validate(&self) -> Result<()> {
        self.active_limits.validate()?;
        if let Some(fallback) = &self.fallback_limits {
            fallback.validate()?;
        }
        Tz::from_str(&self.timezone)
            .map_err(|_| Error::InvalidInput(format!("unknown timezone '{}'", self.timezone)))?;
        Glob::new(&self.key_pattern)
            .map_err(|e| Error::InvalidInput(format!("bad key pattern: {}", e)))?;

        match self.schedule_type {
            ScheduleType::Recurring => {
                let expr = self.cron.as_deref().ok_or_else(|| {
                    Error::InvalidInput("recurring schedule requires a cron expression".to_string())
                })?;
                cron::Schedule::from_str(expr)
                    .map_err(|e| Error::InvalidInput(format!("bad cron expression: {}", e)))?;
            }
            ScheduleType::OneTime | ScheduleType::EventDriven => {
                match (self.start_time, self.end_time) {
                    (Some(start), Some(end)) if start < end => {}
                    (Some(_), Some(_)) => {
                        return Err(Error::InvalidInput(
                            "start_time must precede end_time".to_string(),
                        ))
                    }
                    _ => {
                        return Err(Error::InvalidInput(
                            "one-time and event-driven schedules require start_time and end_time"
                                .to_string(),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    fn window_minutes(&self) -> i64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_minutes().max(1),
            _ => DEFAULT_RECURRING_WINDOW_MIN,
        }
    }

    /// When did the window containing `now` open, if one is open.
    fn activation(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.schedule_type {
            ScheduleType::OneTime | ScheduleType::EventDriven => {
                let (start, end) = (self.start_time?, self.end_time?);
                (start <= now && now < end).then_some(start)
            }
            ScheduleType::Recurring => {
                let expr = cron::Schedule::from_str(self.cron.as_deref()?).ok()?;
                let tz = Tz::from_str(&self.timezone).ok()?;
                let window = ChronoDuration::minutes(self.window_minutes());
                let now_tz = now.with_timezone(&tz);
                let lookback = now_tz - window;
                expr.after(&lookback)
                    .take(MAX_CRON_PROBES)
                    .take_while(|fire| *fire <= now_tz)
                    .last()
                    .map(|fire| fire.with_timezone(&Utc))
            }
        }
    }

    /// Limits in force at `now`, with ramp transitions applied.
    fn effective_limits(&self, opened: DateTime<Utc>, now: DateTime<Utc>) -> RateLimitConfig {
        let Some(transition) = self.transition else {
            return self.active_limits.clone();
        };
        let Some(fallback) = &self.fallback_limits else {
            return self.active_limits.clone();
        };

        let since_open = (now - opened).num_seconds().max(0);
        let window_secs = self.window_minutes() * 60;
        let until_close = (window_secs - since_open).max(0);

        let ramp_up_secs = i64::from(transition.ramp_up_min) * 60;
        let ramp_down_secs = i64::from(transition.ramp_down_min) * 60;

        if ramp_up_secs > 0 && since_open < ramp_up_secs {
            let progress = since_open as f64 / ramp_up_secs as f64;
            return lerp_limits(fallback, &self.active_limits, progress);
        }
        if ramp_down_secs > 0 && until_close < ramp_down_secs {
            let progress = until_close as f64 / ramp_down_secs as f64;
            return lerp_limits(fallback, &self.active_limits, progress);
        }
        self.active_limits.clone()
    }
}

fn lerp_limits(from: &RateLimitConfig, to: &RateLimitConfig, progress: f64) -> RateLimitConfig {
    let progress = progress.clamp(0.0, 1.0);
    let lerp = |a: u64, b: u64| -> u64 {
        let value = a as f64 + (b as f64 - a as f64) * progress;
        (value.round() as u64).max(1)
    };
    let mut limits = to.clone();
    limits.capacity = lerp(from.capacity, to.capacity);
    limits.refill_rate = lerp(from.refill_rate, to.refill_rate);
    limits
}

/// One entry of the published active-schedule index.
struct ActiveOverlay {
    schedule_id: Uuid,
    matcher: GlobMatcher,
    priority: i32,
    created_at: DateTime<Utc>,
    limits: RateLimitConfig,
}

/// Owns all schedules and publishes the currently active overlays.
pub struct ScheduleManager {
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    active: ArcSwap<Vec<ActiveOverlay>>,
    /// Fingerprint of the last published index, for transition detection.
    last_fingerprint: RwLock<Vec<(Uuid, u64)>>,
}

impl ScheduleManager {
    pub fn new() -> Self {
        Self {
            schedules: RwLock::new(HashMap::new()),
            active: ArcSwap::from_pointee(Vec::new()),
            last_fingerprint: RwLock::new(Vec::new()),
        }
    }

    pub fn create(&self, schedule: Schedule) -> Result<Uuid> {
        schedule.validate()?;
        let id = schedule.id;
        tracing::info!(schedule_id = %id, name = %schedule.name, "schedule created");
        self.schedules.write().insert(id, schedule);
        Ok(id)
    }

    pub fn update(&self, id: Uuid, schedule: Schedule) -> Result<()> {
        schedule.validate()?;
        let mut schedules = self.schedules.write();
        if !schedules.contains_key(&id) {
            return Err(Error::InvalidInput(format!("no schedule {}", id)));
        }
        schedules.insert(id, schedule);
        Ok(())
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.schedules.write().remove(&id).is_some()
    }

    pub fn get(&self, id: Uuid) -> Option<Schedule> {
        self.schedules.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<Schedule> {
        self.schedules.read().values().cloned().collect()
    }

    /// One evaluator tick: recomputes the active set at `now` and swaps the
    /// published index. Returns true when the set (or any ramped limit)
    /// changed, which the caller uses to invalidate the resolver cache.
    pub fn evaluate(&self, now: DateTime<Utc>) -> bool {
        let mut overlays = Vec::new();
        {
            let schedules = self.schedules.read();
            for schedule in schedules.values().filter(|s| s.enabled) {
                if let Some(opened) = schedule.activation(now) {
                    let limits = schedule.effective_limits(opened, now);
                    // pattern validated at create time; compile cannot fail here
                    if let Ok(glob) = Glob::new(&schedule.key_pattern) {
                        overlays.push(ActiveOverlay {
                            schedule_id: schedule.id,
                            matcher: glob.compile_matcher(),
                            priority: schedule.priority,
                            created_at: schedule.created_at,
                            limits,
                        });
                    }
                }
            }
        }

        let mut fingerprint: Vec<(Uuid, u64)> = overlays
            .iter()
            .map(|o| (o.schedule_id, o.limits.fingerprint()))
            .collect();
        fingerprint.sort();

        let changed = {
            let mut last = self.last_fingerprint.write();
            if *last == fingerprint {
                false
            } else {
                *last = fingerprint;
                true
            }
        };

        if changed {
            tracing::debug!(active = overlays.len(), "schedule transition");
        }
        self.active.store(Arc::new(overlays));
        changed
    }

    /// Highest-priority active overlay matching `key`, from the published
    /// snapshot. No I/O, no locks beyond the snapshot pointer load.
    pub fn active_for(&self, key: &str) -> Option<(Uuid, RateLimitConfig)> {
        let overlays = self.active.load();
        overlays
            .iter()
            .filter(|o| o.matcher.is_match(key))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|o| (o.schedule_id, o.limits.clone()))
    }

    pub fn active_count(&self) -> usize {
        self.active.load().len()
    }
}

impl Default for ScheduleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Algorithm;

    fn one_time(start: DateTime<Utc>, end: DateTime<Utc>) -> Schedule {
        Schedule {
            id: Uuid::new_v4(),
            name: "maintenance".to_string(),
            key_pattern: "api:*".to_string(),
            schedule_type: ScheduleType::OneTime,
            cron: None,
            timezone: "UTC".to_string(),
            start_time: Some(start),
            end_time: Some(end),
            priority: 0,
            enabled: true,
            active_limits: RateLimitConfig::new(5, 1, Algorithm::TokenBucket),
            fallback_limits: None,
            transition: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_one_time_requires_ordered_window() {
        let now = Utc::now();
        let mut schedule = one_time(now, now + ChronoDuration::hours(1));
        assert!(schedule.validate().is_ok());
        schedule.end_time = Some(now - ChronoDuration::hours(1));
        assert!(schedule.validate().is_err());
        schedule.end_time = None;
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_recurring_requires_parseable_cron() {
        let mut schedule = one_time(Utc::now(), Utc::now() + ChronoDuration::hours(1));
        schedule.schedule_type = ScheduleType::Recurring;
        schedule.cron = Some("not a cron".to_string());
        assert!(schedule.validate().is_err());
        // sec min hour dom month dow
        schedule.cron = Some("0 0 3 * * *".to_string());
        assert!(schedule.validate().is_ok());
        schedule.timezone = "Atlantis/Nowhere".to_string();
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_active_window_and_matching() {
        let manager = ScheduleManager::new();
        let now = Utc::now();
        let schedule = one_time(now - ChronoDuration::minutes(5), now + ChronoDuration::minutes(5));
        manager.create(schedule).unwrap();

        assert!(manager.evaluate(now));
        assert!(manager.active_for("api:checkout").is_some());
        assert!(manager.active_for("user:1").is_none());

        // after the window closes the overlay disappears
        assert!(manager.evaluate(now + ChronoDuration::minutes(10)));
        assert!(manager.active_for("api:checkout").is_none());
    }

    #[test]
    fn test_evaluate_reports_transitions_once() {
        let manager = ScheduleManager::new();
        let now = Utc::now();
        manager
            .create(one_time(
                now - ChronoDuration::minutes(1),
                now + ChronoDuration::minutes(9),
            ))
            .unwrap();

        assert!(manager.evaluate(now));
        // steady state: same active set, no transition
        assert!(!manager.evaluate(now + ChronoDuration::seconds(1)));
    }

    #[test]
    fn test_priority_breaks_overlapping_schedules() {
        let manager = ScheduleManager::new();
        let now = Utc::now();
        let mut low = one_time(now - ChronoDuration::minutes(1), now + ChronoDuration::minutes(9));
        low.priority = 1;
        let mut high = one_time(now - ChronoDuration::minutes(1), now + ChronoDuration::minutes(9));
        high.priority = 5;
        high.active_limits.capacity = 77;
        manager.create(low).unwrap();
        let high_id = manager.create(high).unwrap();

        manager.evaluate(now);
        let (winner, limits) = manager.active_for("api:x").unwrap();
        assert_eq!(winner, high_id);
        assert_eq!(limits.capacity, 77);
    }

    #[test]
    fn test_recurring_fires_within_window() {
        let manager = ScheduleManager::new();
        let mut schedule = one_time(Utc::now(), Utc::now() + ChronoDuration::hours(1));
        schedule.schedule_type = ScheduleType::Recurring;
        // every minute, so a fire always lies within the default window
        schedule.cron = Some("0 * * * * *".to_string());
        schedule.start_time = None;
        schedule.end_time = None;
        manager.create(schedule).unwrap();

        manager.evaluate(Utc::now());
        assert!(manager.active_for("api:x").is_some());
    }

    #[test]
    fn test_ramp_up_interpolates_from_fallback() {
        let now = Utc::now();
        let mut schedule = one_time(now, now + ChronoDuration::minutes(100));
        schedule.fallback_limits = Some(RateLimitConfig::new(100, 10, Algorithm::TokenBucket));
        schedule.active_limits = RateLimitConfig::new(200, 20, Algorithm::TokenBucket);
        schedule.transition = Some(Transition {
            ramp_up_min: 10,
            ramp_down_min: 0,
        });

        // halfway through the ramp: halfway between fallback and active
        let limits = schedule.effective_limits(now, now + ChronoDuration::minutes(5));
        assert_eq!(limits.capacity, 150);
        assert_eq!(limits.refill_rate, 15);

        // past the ramp: full active limits
        let limits = schedule.effective_limits(now, now + ChronoDuration::minutes(20));
        assert_eq!(limits.capacity, 200);
    }
}
