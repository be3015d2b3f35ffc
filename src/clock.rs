use chrono::{DateTime, Utc};

/// Source of "now" for expiry, lease windows and recency decay.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::Clock;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Mutex;

    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn at(now: DateTime<Utc>) -> Self {
            ManualClock {
                now: Mutex::new(now),
            }
        }

        /// 2025-06-01T12:00:00Z
        pub fn fixed() -> Self {
            Self::at(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
        }

        pub fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }

        pub fn set(&self, to: DateTime<Utc>) {
            *self.now.lock().unwrap() = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            ManualClock::now(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[test]
    fn test_manual_clock_advances() {
        let clock = Arc::new(ManualClock::fixed());
        let start = clock.now();
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now() - start, Duration::hours(2));
        let shared: Arc<dyn Clock> = clock.clone();
        assert_eq!(shared.now(), clock.now());
    }
}
