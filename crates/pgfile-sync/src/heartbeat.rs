//! Tick cadence for subscription checks and authorization refresh.

use std::time::Duration;

use tokio::time::Instant;

/// What a tick should do besides the unconditional flush and reap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatDue {
    /// Probe the channel subscription.
    pub check_listen: bool,
    /// Refresh the authorization session.
    pub refresh_auth: bool,
}

/// Scheduler state threaded through every tick. Both checks fire on the first tick.
#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    listen_check: Duration,
    auth_refresh: Duration,
    next_listen_check: Option<Instant>,
    next_auth_refresh: Option<Instant>,
}

impl HeartbeatSchedule {
    /// Build a schedule with the given intervals.
    #[must_use]
    pub const fn new(listen_check: Duration, auth_refresh: Duration) -> Self {
        Self {
            listen_check,
            auth_refresh,
            next_listen_check: None,
            next_auth_refresh: None,
        }
    }

    /// Advance to `now`, returning which periodic checks are due.
    pub fn tick(&mut self, now: Instant) -> HeartbeatDue {
        HeartbeatDue {
            check_listen: advance(&mut self.next_listen_check, now, self.listen_check),
            refresh_auth: advance(&mut self.next_auth_refresh, now, self.auth_refresh),
        }
    }
}

fn advance(next: &mut Option<Instant>, now: Instant, every: Duration) -> bool {
    if next.is_some_and(|at| now < at) {
        return false;
    }
    *next = Some(now + every);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_checks_fire_on_first_tick() {
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(30), Duration::from_secs(5));
        let due = schedule.tick(Instant::now());
        assert!(due.check_listen);
        assert!(due.refresh_auth);
    }

    #[test]
    fn checks_follow_their_own_cadence() {
        let start = Instant::now();
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(30), Duration::from_secs(5));
        schedule.tick(start);

        let mut listen_checks = 0;
        let mut auth_refreshes = 0;
        for second in 1..=60 {
            let due = schedule.tick(start + Duration::from_secs(second));
            listen_checks += u32::from(due.check_listen);
            auth_refreshes += u32::from(due.refresh_auth);
        }
        assert_eq!(listen_checks, 2);
        assert_eq!(auth_refreshes, 12);
    }

    #[test]
    fn late_tick_does_not_burst() {
        let start = Instant::now();
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(30), Duration::from_secs(5));
        schedule.tick(start);
        assert!(schedule.tick(start + Duration::from_secs(300)).refresh_auth);
        assert!(!schedule.tick(start + Duration::from_secs(301)).refresh_auth);
    }
}
