//! Wall-clock as an injectable capability, never called directly elsewhere in the core.

use parking_lot::RwLock;
use time::OffsetDateTime;

/// A source of wall-clock time.
///
/// The default implementation reads the OS clock; tests inject a [`FixedClock`] so that
/// time-window and usage-limit logic can be exercised deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    /// Day of week, `0` = Monday .. `6` = Sunday, matching the time restriction window encoding.
    fn day_of_week(&self) -> u8 {
        self.now().weekday().number_days_from_monday()
    }

    /// Minutes since local midnight.
    fn minute_of_day(&self) -> u32 {
        let t = self.now().time();
        u32::from(t.hour()) * 60 + u32::from(t.minute())
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock whose value is set explicitly. Used by tests and by the interactive "what would
/// happen at this time" check surface.
pub struct FixedClock(RwLock<OffsetDateTime>);

impl FixedClock {
    pub fn new(at: OffsetDateTime) -> Self {
        Self(RwLock::new(at))
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.0.write() = at;
    }

    pub fn advance(&self, delta: time::Duration) {
        let mut guard = self.0.write();
        *guard += delta;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.0.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn fixed_clock_reports_day_and_minute() {
        // Tuesday, 16:30
        let clock = FixedClock::new(datetime!(2024-01-02 16:30:00 UTC));
        assert_eq!(clock.day_of_week(), 1); // Monday=0 -> Tuesday=1
        assert_eq!(clock.minute_of_day(), 16 * 60 + 30);
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(datetime!(2024-01-02 00:00:00 UTC));
        clock.advance(time::Duration::minutes(90));
        assert_eq!(clock.minute_of_day(), 90);
    }
}
