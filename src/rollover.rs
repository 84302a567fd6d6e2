//! Time-boxed file rotation for embedded backends
//!
//! A `RolloverPolicy` splits local time into periods (`count` × `unit`,
//! aligned within the enclosing unit) and names one database file per
//! period. The `RolloverScheduler` sleeps until the next boundary and asks
//! the controller to move to the new file; the controller drains everything
//! buffered into the old file first and keeps the old file if it cannot.

use crate::clock::Clock;
use crate::controller::ConnectionController;
use crate::error::{ConfigError, ControllerError};
use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Duration as ChronoDuration, Months, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Token in a file template replaced by the formatted period start
pub const PLACEHOLDER: &str = "{ts}";

/// Shortest delay the scheduler will sleep for
pub const MIN_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloverUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl RolloverUnit {
    pub fn default_format(&self) -> &'static str {
        match self {
            RolloverUnit::Minute => "%Y%m%d_%H%M",
            RolloverUnit::Hour => "%Y%m%d_%H",
            RolloverUnit::Day | RolloverUnit::Week => "%Y%m%d",
            RolloverUnit::Month => "%Y%m",
            RolloverUnit::Year => "%Y",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloverPolicy {
    #[serde(default = "default_count")]
    pub count: u32,
    pub unit: RolloverUnit,
    /// File path template, with or without `{ts}`
    pub template: String,
    /// strftime format for the period start; the unit's default when absent
    #[serde(default)]
    pub timestamp_format: Option<String>,
}

fn default_count() -> u32 {
    1
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn first_of_month(year: i32, month: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(midnight)
        .unwrap_or_default()
}

impl RolloverPolicy {
    pub fn new(count: u32, unit: RolloverUnit, template: impl Into<String>) -> Self {
        RolloverPolicy {
            count,
            unit,
            template: template.into(),
            timestamp_format: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.timestamp_format = Some(format.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count == 0 {
            return Err(ConfigError::InvalidRollover("count must be at least 1".into()));
        }
        if self.template.trim().is_empty() {
            return Err(ConfigError::InvalidRollover("empty file template".into()));
        }
        if StrftimeItems::new(self.format()).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidRollover(format!(
                "bad timestamp format '{}'",
                self.format()
            )));
        }
        Ok(())
    }

    pub fn format(&self) -> &str {
        self.timestamp_format
            .as_deref()
            .unwrap_or_else(|| self.unit.default_format())
    }

    /// Start of the period containing `t`
    pub fn period_start(&self, t: NaiveDateTime) -> NaiveDateTime {
        let n = self.count.max(1);
        let date = t.date();
        match self.unit {
            RolloverUnit::Minute => {
                let minute = t.minute() / n * n;
                midnight(date) + ChronoDuration::hours(t.hour() as i64) + ChronoDuration::minutes(minute as i64)
            }
            RolloverUnit::Hour => midnight(date) + ChronoDuration::hours((t.hour() / n * n) as i64),
            RolloverUnit::Day => {
                let day = (date.day0() / n * n) + 1;
                NaiveDate::from_ymd_opt(date.year(), date.month(), day)
                    .map(midnight)
                    .unwrap_or_else(|| midnight(date))
            }
            RolloverUnit::Week => {
                // Weeks count from Monday 1970-01-05
                let monday = date - ChronoDuration::days(date.weekday().num_days_from_monday() as i64);
                let epoch = NaiveDate::from_ymd_opt(1970, 1, 5).unwrap_or_default();
                let weeks = (monday - epoch).num_weeks();
                let aligned = weeks - weeks.rem_euclid(n as i64);
                midnight(epoch + ChronoDuration::weeks(aligned))
            }
            RolloverUnit::Month => first_of_month(date.year(), date.month0() / n * n + 1),
            RolloverUnit::Year => {
                let year = date.year() - date.year().rem_euclid(n as i32);
                first_of_month(year, 1)
            }
        }
    }

    /// First boundary strictly after `t`
    pub fn next_boundary(&self, t: NaiveDateTime) -> NaiveDateTime {
        let n = self.count.max(1);
        let start = self.period_start(t);
        let next = match self.unit {
            RolloverUnit::Minute => {
                let hour_end = start.with_minute(0).unwrap_or(start) + ChronoDuration::hours(1);
                (start + ChronoDuration::minutes(n as i64)).min(hour_end)
            }
            RolloverUnit::Hour => {
                let day_end = midnight(start.date()) + ChronoDuration::days(1);
                (start + ChronoDuration::hours(n as i64)).min(day_end)
            }
            RolloverUnit::Day => {
                let month_end = start
                    .checked_add_months(Months::new(1))
                    .map(|d| first_of_month(d.year(), d.month()))
                    .unwrap_or(start);
                (start + ChronoDuration::days(n as i64)).min(month_end)
            }
            RolloverUnit::Week => start + ChronoDuration::weeks(n as i64),
            RolloverUnit::Month => {
                let year_end = first_of_month(start.year() + 1, 1);
                start
                    .checked_add_months(Months::new(n))
                    .unwrap_or(year_end)
                    .min(year_end)
            }
            RolloverUnit::Year => start
                .checked_add_months(Months::new(12 * n))
                .unwrap_or(start),
        };
        if next > t {
            next
        } else {
            // Only reachable near the limits of the calendar
            t + ChronoDuration::minutes(1)
        }
    }

    /// File for the period containing `t`
    pub fn file_name(&self, t: NaiveDateTime) -> PathBuf {
        let stamp = self.period_start(t).format(self.format()).to_string();
        if self.template.contains(PLACEHOLDER) {
            return PathBuf::from(self.template.replace(PLACEHOLDER, &stamp));
        }
        let template = Path::new(&self.template);
        let name = match (template.file_stem(), template.extension()) {
            (Some(stem), Some(ext)) => format!(
                "{}_{}.{}",
                stem.to_string_lossy(),
                stamp,
                ext.to_string_lossy()
            ),
            (Some(stem), None) => format!("{}_{}", stem.to_string_lossy(), stamp),
            _ => stamp,
        };
        template.with_file_name(name)
    }
}

/// Drives rollover for one embedded backend
pub struct RolloverScheduler {
    policy: RolloverPolicy,
    controller: ConnectionController,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl RolloverScheduler {
    pub fn new(policy: RolloverPolicy, controller: ConnectionController, clock: Arc<dyn Clock>) -> Self {
        RolloverScheduler {
            policy,
            controller,
            clock,
            cancel: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> &RolloverPolicy {
        &self.policy
    }

    /// Move the backend to the file for the period containing `at`.
    pub async fn roll_over(&self, at: NaiveDateTime) -> Result<PathBuf, ControllerError> {
        let path = self.policy.file_name(at);
        self.controller.rollover_to(path.clone()).await?;
        Ok(path)
    }

    /// Roll over to the file for the current period
    pub async fn roll_over_now(&self) -> Result<PathBuf, ControllerError> {
        self.roll_over(self.clock.now().to_local()).await
    }

    /// Delay until the next boundary after `now`, skipping boundaries closer
    /// than `MIN_DELAY`. `None` means the policy cannot be scheduled.
    pub fn next_delay(&self, now: NaiveDateTime) -> Option<(NaiveDateTime, Duration)> {
        let mut boundary = self.policy.next_boundary(now);
        for _ in 0..2 {
            let delay = (boundary - now).to_std().unwrap_or_default();
            if delay >= MIN_DELAY {
                return Some((boundary, delay));
            }
            warn!(
                backend = %self.controller.id(),
                boundary = %boundary,
                "Rollover delay under one second, skipping this boundary"
            );
            boundary = self.policy.next_boundary(boundary);
        }
        None
    }

    /// Run the schedule on a background task until `cancel` is called
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = self.clock.now().to_local();
                let Some((boundary, delay)) = self.next_delay(now) else {
                    error!(
                        backend = %self.controller.id(),
                        "Rollover policy yields no usable boundary, scheduling stopped"
                    );
                    return;
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.roll_over(boundary).await {
                    Ok(path) => info!(
                        backend = %self.controller.id(),
                        file = %path.display(),
                        "Scheduled rollover complete"
                    ),
                    Err(e) => error!(
                        backend = %self.controller.id(),
                        error = %e,
                        "Scheduled rollover failed, old file stays active"
                    ),
                }
            }
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
