//! The single time window every source is queried with.
//!
//! Rolling ("now minus N*24h") and calendar-day ("N local days") windows only
//! differ in how they are constructed. Once built, the same value is handed to
//! every source so that the definition cannot vary per path.

use crate::error::AuditError;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;

const MAX_OFFSET_SECONDS: i32 = 86_399;

/// Half-open interval `[start, end)` plus the UTC offset used for day bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    utc_offset_seconds: i32,
}

impl TimeWindow {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        utc_offset_seconds: i32,
    ) -> Result<Self, AuditError> {
        if start >= end {
            return Err(AuditError::InvalidConfig(format!(
                "time window start {} is not before end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        if utc_offset_seconds.abs() > MAX_OFFSET_SECONDS {
            return Err(AuditError::InvalidConfig(format!(
                "utc offset {}s is out of range",
                utc_offset_seconds
            )));
        }
        Ok(Self {
            start,
            end,
            utc_offset_seconds,
        })
    }

    /// `now - days*24h .. now`.
    pub fn rolling_days(
        now: DateTime<Utc>,
        days: u32,
        utc_offset_seconds: i32,
    ) -> Result<Self, AuditError> {
        Self::new(
            now - Duration::hours(24 * i64::from(days)),
            now,
            utc_offset_seconds,
        )
    }

    /// Local midnight of `today - (days - 1)` up to the local midnight after `today`.
    pub fn calendar_days(
        today: NaiveDate,
        days: u32,
        utc_offset_seconds: i32,
    ) -> Result<Self, AuditError> {
        if days == 0 {
            return Err(AuditError::InvalidConfig(
                "calendar window needs at least one day".to_string(),
            ));
        }
        let first = today - Duration::days(i64::from(days) - 1);
        let after_last = today + Duration::days(1);
        Self::new(
            local_midnight(first, utc_offset_seconds)?,
            local_midnight(after_last, utc_offset_seconds)?,
            utc_offset_seconds,
        )
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn utc_offset_seconds(&self) -> i32 {
        self.utc_offset_seconds
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Calendar date of `ts` in the window's offset.
    pub fn day_key(&self, ts: DateTime<Utc>) -> NaiveDate {
        (ts.naive_utc() + Duration::seconds(i64::from(self.utc_offset_seconds))).date()
    }
}

fn local_midnight(date: NaiveDate, utc_offset_seconds: i32) -> Result<DateTime<Utc>, AuditError> {
    let naive = date.and_hms_opt(0, 0, 0).ok_or_else(|| {
        AuditError::InvalidConfig(format!("cannot build midnight for {}", date))
    })?;
    Ok(Utc.from_utc_datetime(&(naive - Duration::seconds(i64::from(utc_offset_seconds)))))
}
