//! Time source for redeploy annotations
//!
//! `SystemClock` delegates to `chrono::Utc::now()`. Tests use `MockClock` so
//! the value written into the pod template is known in advance.

use chrono::{DateTime, SecondsFormat, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// RFC 3339 in UTC, with as many sub-second digits as the instant needs
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_system_clock_returns_time() {
        // Anything after 2020 is plausible
        assert!(SystemClock.now().timestamp() > 1_577_836_800);
    }

    #[test]
    fn test_whole_second_timestamp_has_no_fraction() {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap());
        assert_eq!(format_timestamp(clock.now()), "2024-03-09T14:05:07Z");
    }

    #[test]
    fn test_timestamp_keeps_sub_second_digits() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
            + chrono::Duration::microseconds(1500);
        assert_eq!(format_timestamp(at), "2024-03-09T14:05:07.001500Z");
    }

    #[test]
    fn test_mock_clock_advance_changes_timestamp() {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap());
        let before = format_timestamp(clock.now());
        clock.advance(chrono::Duration::seconds(1));
        assert_ne!(format_timestamp(clock.now()), before);
        assert_eq!(format_timestamp(clock.now()), "2024-03-09T14:05:08Z");
    }
}
