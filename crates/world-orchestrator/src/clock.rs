use chrono::{DateTime, Utc};

/// Source of wall-clock time.
///
/// Every component reads "now" through this trait so that scheduling and
/// reset boundaries can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
