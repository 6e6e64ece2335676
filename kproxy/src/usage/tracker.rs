//! Converts discrete HTTP request events into session-shaped "active time" and rolls the result
//! into the daily per-category counters, per §4.5.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use kproxy_task::{ShutdownSignal, Task};
use time::Duration;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::usage::store::{DailyKey, UsageSession, UsageStore};

/// Minutes credited to the daily counter only once a session's accumulated duration first
/// crosses `min_session_duration`; below that, activity is tracked but not yet persisted as a
/// counter increment.
fn seconds_to_credit(old_accumulated: u64, new_accumulated: u64, min_session_duration: StdDuration) -> u64 {
    let min_secs = min_session_duration.as_secs();
    if new_accumulated < min_secs {
        0
    } else if old_accumulated < min_secs {
        new_accumulated
    } else {
        new_accumulated.saturating_sub(old_accumulated)
    }
}

pub struct UsageTracker {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    inactivity_timeout: StdDuration,
    min_session_duration: StdDuration,
    retention_days: i64,
}

impl UsageTracker {
    pub fn new(
        store: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
        inactivity_timeout: StdDuration,
        min_session_duration: StdDuration,
        retention_days: i64,
    ) -> Self {
        Self {
            store,
            clock,
            inactivity_timeout,
            min_session_duration,
            retention_days,
        }
    }

    fn session_id(device: &str, category: &str) -> String {
        format!("{device}:{category}")
    }

    /// The per-(device, category) activity signal from the proxy request path. See §4.5.
    pub async fn record_activity(&self, device: &str, category: &str) {
        if let Err(error) = self.record_activity_inner(device, category).await {
            tracing::warn!(%device, %category, %error, "failed to record usage activity");
        }
    }

    async fn record_activity_inner(&self, device: &str, category: &str) -> Result<(), crate::error::StorageError> {
        let now = self.clock.now();
        let now_system = std::time::SystemTime::from(now);

        let existing = self.store.get_active_session_for(device, category).await?;

        let session = match existing {
            None => UsageSession {
                id: Self::session_id(device, category),
                device: device.to_owned(),
                category: category.to_owned(),
                start_time: now_system,
                last_activity_time: now_system,
                accumulated_seconds: 0,
                active: true,
            },
            Some(mut session) => {
                let last = time::OffsetDateTime::from(session.last_activity_time);
                let gap = now - last;

                if gap > Duration::seconds(i64::try_from(self.inactivity_timeout.as_secs()).unwrap_or(i64::MAX)) {
                    session.active = false;
                    self.store.upsert_session(session).await?;

                    UsageSession {
                        id: Self::session_id(device, category),
                        device: device.to_owned(),
                        category: category.to_owned(),
                        start_time: now_system,
                        last_activity_time: now_system,
                        accumulated_seconds: 0,
                        active: true,
                    }
                } else {
                    let gap_secs = u64::try_from(gap.whole_seconds().max(0)).unwrap_or(0);
                    let old_accumulated = session.accumulated_seconds;
                    let new_accumulated = old_accumulated.saturating_add(gap_secs);

                    let credit = seconds_to_credit(old_accumulated, new_accumulated, self.min_session_duration);
                    if credit > 0 {
                        let key = DailyKey {
                            date: now.date(),
                            device: device.to_owned(),
                            category: category.to_owned(),
                        };
                        self.store.increment_daily(&key, credit).await?;
                    }

                    session.accumulated_seconds = new_accumulated;
                    session.last_activity_time = now_system;
                    session
                }
            }
        };

        self.store.upsert_session(session).await
    }

    pub async fn today_minutes(&self, device: &str, category: &str) -> u32 {
        let key = DailyKey {
            date: self.clock.now().date(),
            device: device.to_owned(),
            category: category.to_owned(),
        };
        match self.store.get_daily(&key).await {
            Ok(Some(counter)) => u32::try_from(counter.total_seconds / 60).unwrap_or(u32::MAX),
            Ok(None) => 0,
            Err(error) => {
                // Fail-open for counters is deliberate: a storage blip should not block every
                // rate-limited category.
                tracing::warn!(%device, %category, %error, "failed to read usage counter, treating as zero");
                0
            }
        }
    }

    /// Runs the reset job once: marks every active session inactive and prunes daily counters
    /// older than the configured retention.
    pub async fn run_daily_reset(&self) -> Result<(), crate::error::StorageError> {
        let sessions = self.store.list_active_sessions().await?;
        for mut session in sessions {
            session.active = false;
            self.store.upsert_session(session).await?;
        }

        let cutoff = self.clock.now().date() - Duration::days(self.retention_days);
        self.store.delete_daily_before(cutoff).await?;
        Ok(())
    }
}

/// Polls roughly once a minute, firing the daily reset job the first time local wall-clock
/// crosses `daily_reset_minute` on a given day.
pub struct DailyResetTask {
    pub tracker: Arc<UsageTracker>,
    pub clock: Arc<dyn Clock>,
    pub daily_reset_minute: u32,
}

#[async_trait]
impl Task for DailyResetTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "usage-daily-reset";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let mut interval = tokio::time::interval(StdDuration::from_secs(60));
        let mut last_fired_day = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = self.clock.now();
                    let today = now.date();
                    let minute_of_day = u32::from(now.hour()) * 60 + u32::from(now.minute());

                    if minute_of_day >= self.daily_reset_minute && last_fired_day != Some(today) {
                        info!("running daily usage reset");
                        if let Err(error) = self.tracker.run_daily_reset().await {
                            tracing::error!(%error, "daily usage reset failed");
                        }
                        last_fired_day = Some(today);
                    } else {
                        debug!(minute_of_day, "daily reset poll, not due yet");
                    }
                }
                () = shutdown_signal.wait() => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::usage::store::InMemoryUsageStore;
    use time::macros::datetime;

    fn tracker(clock: Arc<FixedClock>) -> UsageTracker {
        UsageTracker::new(
            Arc::new(InMemoryUsageStore::new()),
            clock,
            StdDuration::from_secs(300),
            StdDuration::from_secs(60),
            90,
        )
    }

    #[tokio::test]
    async fn short_burst_below_minimum_is_not_counted() {
        let clock = Arc::new(FixedClock::new(datetime!(2024-01-02 10:00:00 UTC)));
        let t = tracker(Arc::clone(&clock));

        t.record_activity("dev1", "entertainment").await;
        clock.advance(time::Duration::seconds(30));
        t.record_activity("dev1", "entertainment").await;

        assert_eq!(t.today_minutes("dev1", "entertainment").await, 0);
    }

    #[tokio::test]
    async fn sustained_activity_crosses_minimum_and_counts() {
        let clock = Arc::new(FixedClock::new(datetime!(2024-01-02 10:00:00 UTC)));
        let t = tracker(Arc::clone(&clock));

        t.record_activity("dev1", "entertainment").await;
        for _ in 0..5 {
            clock.advance(time::Duration::seconds(30));
            t.record_activity("dev1", "entertainment").await;
        }
        // 5 gaps of 30s = 150s accumulated, min is 60s, so it should be counted (at least the
        // portion at/after the crossing point).
        assert!(t.today_minutes("dev1", "entertainment").await >= 1);
    }

    #[tokio::test]
    async fn gap_past_inactivity_timeout_opens_fresh_session() {
        let clock = Arc::new(FixedClock::new(datetime!(2024-01-02 10:00:00 UTC)));
        let t = tracker(Arc::clone(&clock));

        t.record_activity("dev1", "entertainment").await;
        clock.advance(time::Duration::seconds(400)); // past the 300s inactivity timeout
        t.record_activity("dev1", "entertainment").await;

        let session = t
            .store
            .get_active_session_for("dev1", "entertainment")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.accumulated_seconds, 0);
    }

    #[tokio::test]
    async fn daily_reset_closes_active_sessions() {
        let clock = Arc::new(FixedClock::new(datetime!(2024-01-02 10:00:00 UTC)));
        let t = tracker(Arc::clone(&clock));
        t.record_activity("dev1", "entertainment").await;

        t.run_daily_reset().await.unwrap();

        let active = t.store.list_active_sessions().await.unwrap();
        assert!(active.is_empty());
    }
}
