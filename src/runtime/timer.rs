//! Idle-connection timer queue.
//!
//! Entries are ordered by deadline, then by insertion, so several
//! connections may share a deadline. Entries carry the generation they were
//! created for; the caller drops them if the connection has moved on.

use crate::runtime::connection::{ConnRef, Connection};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Extra slack on top of three missed heartbeats.
const HEARTBEAT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<(Instant, u64), ConnRef>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, deadline: Instant, target: ConnRef) {
        self.seq += 1;
        self.entries.insert((deadline, self.seq), target);
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<ConnRef> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            expired.push(entry.remove());
        }
        expired
    }

    /// Drop every entry for slot `index`, whatever its generation.
    pub fn remove_connection(&mut self, index: usize) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, target| target.index != index);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What to do with a connection whose timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    Close,
    Recheck(Instant),
}

/// Decides the fate of a connection when its timer expires.
pub trait TimeoutPolicy: Send + Sync {
    fn on_timeout(&self, conn: &Connection, now: Instant) -> TimeoutAction;
}

/// Closes connections that stopped sending heartbeats.
#[derive(Debug, Clone)]
pub struct HeartbeatPolicy {
    pub wait: Duration,
    /// Close at the first check regardless of heartbeats.
    pub kick_on_timeout: bool,
}

impl HeartbeatPolicy {
    pub fn new(wait: Duration, kick_on_timeout: bool) -> Self {
        Self {
            wait,
            kick_on_timeout,
        }
    }

    /// Silence longer than this closes the connection.
    pub fn max_silence(&self) -> Duration {
        self.wait * 3 + HEARTBEAT_GRACE
    }

    pub fn decide(&self, last_ping: Instant, now: Instant) -> TimeoutAction {
        if self.kick_on_timeout {
            return TimeoutAction::Close;
        }
        if now.saturating_duration_since(last_ping) > self.max_silence() {
            return TimeoutAction::Close;
        }
        TimeoutAction::Recheck(now + self.wait)
    }
}

impl TimeoutPolicy for HeartbeatPolicy {
    fn on_timeout(&self, conn: &Connection, now: Instant) -> TimeoutAction {
        let last_ping = conn.session.lock().last_ping;
        self.decide(last_ping, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::pool::ConnectionPool;

    #[test]
    fn test_pop_expired_in_order() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        let a = ConnRef {
            index: 0,
            generation: 1,
        };
        let b = ConnRef {
            index: 1,
            generation: 1,
        };
        let c = ConnRef {
            index: 2,
            generation: 1,
        };
        timers.add(now + Duration::from_secs(5), c);
        timers.add(now, a);
        timers.add(now, b);

        assert_eq!(timers.pop_expired(now), vec![a, b]);
        assert_eq!(timers.len(), 1);
        assert!(timers.pop_expired(now).is_empty());
        assert_eq!(timers.pop_expired(now + Duration::from_secs(5)), vec![c]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_remove_connection() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        for generation in 1..=3 {
            timers.add(
                now,
                ConnRef {
                    index: 4,
                    generation,
                },
            );
        }
        timers.add(
            now,
            ConnRef {
                index: 5,
                generation: 1,
            },
        );

        assert_eq!(timers.remove_connection(4), 3);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_entry_for_recycled_connection_is_stale() {
        let pool = ConnectionPool::with_capacity(1, 100);
        let conn = pool.acquire();
        let target = conn.conn_ref();

        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.add(now, target);

        pool.schedule_recycle(&conn);

        let expired = timers.pop_expired(now);
        assert_eq!(expired, vec![target]);
        assert!(pool.resolve(expired[0]).is_none());
    }

    #[test]
    fn test_heartbeat_policy() {
        let wait = Duration::from_secs(20);
        let policy = HeartbeatPolicy::new(wait, false);
        let now = Instant::now();
        let last_ping = now;

        assert_eq!(policy.max_silence(), Duration::from_secs(70));
        assert_eq!(
            policy.decide(last_ping, now + Duration::from_secs(70)),
            TimeoutAction::Recheck(now + Duration::from_secs(90))
        );
        assert_eq!(
            policy.decide(last_ping, now + Duration::from_secs(71)),
            TimeoutAction::Close
        );
    }

    #[test]
    fn test_kick_on_timeout_closes_immediately() {
        let policy = HeartbeatPolicy::new(Duration::from_secs(20), true);
        let now = Instant::now();
        assert_eq!(policy.decide(now, now), TimeoutAction::Close);
    }
}
