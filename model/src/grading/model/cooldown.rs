//! Backing off from a model whose quota is used up.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::America::Los_Angeles;
use std::sync::{Mutex, PoisonError};

/// A window during which a model is not used.
///
/// Gemini quotas reset at midnight Pacific time, so by default a tripped cooldown lasts until the
/// next Pacific midnight. A fixed period can be configured instead.
#[derive(Debug, Default)]
pub struct Cooldown {
    period: Option<Duration>,
    until: Mutex<Option<DateTime<Utc>>>,
}

impl Cooldown {
    /// A cooldown lasting `seconds`, or until the quota resets if `seconds` is [`None`] or zero.
    pub fn new(seconds: Option<u64>) -> Self {
        Self {
            period: seconds
                .filter(|&secs| secs > 0)
                .and_then(|secs| Duration::try_seconds(secs.try_into().ok()?)),
            until: Default::default(),
        }
    }

    /// Are we cooling down?
    pub fn active(&self) -> bool {
        self.active_at(Utc::now())
    }

    /// Start cooling down. Returns the end of the cooldown.
    pub fn trip(&self) -> DateTime<Utc> {
        self.trip_at(Utc::now())
    }

    fn active_at(&self, now: DateTime<Utc>) -> bool {
        let mut until = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        match *until {
            Some(end) if now < end => true,
            Some(_) => {
                tracing::info!("cooldown expired");
                *until = None;
                false
            }
            None => false,
        }
    }

    fn trip_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let end = match self.period {
            Some(period) => now + period,
            None => next_pacific_midnight(now),
        };
        *self.until.lock().unwrap_or_else(PoisonError::into_inner) = Some(end);
        end
    }
}

/// The first midnight in the America/Los_Angeles time zone after `now`.
pub fn next_pacific_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_timezone(&Los_Angeles)
        .date_naive()
        .succ_opt()
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .and_then(|midnight| Los_Angeles.from_local_datetime(&midnight).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or_else(|| {
            tracing::warn!("unable to compute Pacific midnight after {now}, cooling down for 24h");
            now + Duration::hours(24)
        })
}

#[cfg(test)]
mod test {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_next_pacific_midnight() {
        // Daylight saving time: UTC-7.
        assert_eq!(
            next_pacific_midnight(utc("2024-07-01T12:00:00Z")),
            utc("2024-07-02T07:00:00Z")
        );
        // Standard time: UTC-8. 01:00 PST on the 15th.
        assert_eq!(
            next_pacific_midnight(utc("2024-01-15T09:00:00Z")),
            utc("2024-01-16T08:00:00Z")
        );
        // 23:30 PDT on the 1st is already the 2nd in UTC.
        assert_eq!(
            next_pacific_midnight(utc("2024-07-02T06:30:00Z")),
            utc("2024-07-02T07:00:00Z")
        );
    }

    #[test]
    fn test_fixed_period() {
        let cooldown = Cooldown::new(Some(60));
        let now = utc("2024-07-01T12:00:00Z");
        assert!(!cooldown.active_at(now));

        assert_eq!(cooldown.trip_at(now), utc("2024-07-01T12:01:00Z"));
        assert!(cooldown.active_at(utc("2024-07-01T12:00:30Z")));
        assert!(!cooldown.active_at(utc("2024-07-01T12:01:00Z")));
        // Once expired, the cooldown stays off.
        assert!(!cooldown.active_at(utc("2024-07-01T12:00:30Z")));
    }

    #[test]
    fn test_zero_period_waits_for_quota_reset() {
        let cooldown = Cooldown::new(Some(0));
        let end = cooldown.trip_at(utc("2024-01-15T09:00:00Z"));
        assert_eq!(end, utc("2024-01-16T08:00:00Z"));
    }
}
