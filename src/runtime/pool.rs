//! Connection pool.
//!
//! Slots are allocated up front and reused. Every slot is in exactly one of
//! three places: the free list, in use, or the delayed-recycle list. Closed
//! connections sit in the recycle list for a while so late events and queued
//! messages for the old socket go stale before the slot is reused.

use crate::runtime::connection::{ConnRef, Connection};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Active,
    Recycling,
}

struct PoolInner {
    slots: Vec<Arc<Connection>>,
    states: Vec<SlotState>,
    free: VecDeque<usize>,
    recycling: Vec<(usize, Instant)>,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub active: usize,
    pub recycling: usize,
    pub online: usize,
}

pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    online: AtomicUsize,
    max_packet_len: u16,
}

impl ConnectionPool {
    /// Pre-allocate `capacity` free slots.
    pub fn with_capacity(capacity: usize, max_packet_len: u16) -> Self {
        let slots = (0..capacity)
            .map(|index| Arc::new(Connection::new(index, max_packet_len)))
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                slots,
                states: vec![SlotState::Free; capacity],
                free: (0..capacity).collect(),
                recycling: Vec::new(),
            }),
            online: AtomicUsize::new(0),
            max_packet_len,
        }
    }

    /// Take a free slot, growing the pool when none is left.
    ///
    /// The returned connection has a fresh generation and no socket.
    pub fn acquire(&self) -> Arc<Connection> {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop_front() {
            Some(index) => index,
            None => {
                let index = inner.slots.len();
                inner
                    .slots
                    .push(Arc::new(Connection::new(index, self.max_packet_len)));
                inner.states.push(SlotState::Free);
                debug!(conn_id = index, "Connection pool grew");
                index
            }
        };

        let conn = Arc::clone(&inner.slots[index]);
        conn.reset(Instant::now());
        conn.bump_generation();
        inner.states[index] = SlotState::Active;
        conn
    }

    /// Return a slot straight to the free list, skipping the recycle delay.
    pub fn release(&self, conn: &Connection) {
        let mut inner = self.inner.lock();
        let index = conn.index();
        if inner.states[index] == SlotState::Free {
            return;
        }
        if inner.states[index] == SlotState::Recycling {
            inner.recycling.retain(|&(i, _)| i != index);
        }
        release_locked(&mut inner, conn);
    }

    /// Move an active connection to the recycle list.
    ///
    /// Returns `false` if it was not active; calling twice is harmless.
    pub fn schedule_recycle(&self, conn: &Connection) -> bool {
        let mut inner = self.inner.lock();
        let index = conn.index();
        if inner.states[index] != SlotState::Active {
            return false;
        }
        conn.bump_generation();
        inner.states[index] = SlotState::Recycling;
        inner.recycling.push((index, Instant::now()));
        drop(inner);

        let _ = self
            .online
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        true
    }

    /// Release recycled slots that have waited at least `min_wait`, or all of them when `force`.
    pub fn sweep(&self, now: Instant, min_wait: Duration, force: bool) -> usize {
        let mut inner = self.inner.lock();
        let due: Vec<usize> = inner
            .recycling
            .iter()
            .filter(|&&(_, since)| force || since + min_wait <= now)
            .map(|&(index, _)| index)
            .collect();
        if due.is_empty() {
            return 0;
        }

        inner.recycling.retain(|&(index, _)| !due.contains(&index));
        for &index in &due {
            let conn = Arc::clone(&inner.slots[index]);
            release_locked(&mut inner, &conn);
        }
        due.len()
    }

    /// Look up a connection if `target` still names its current incarnation.
    pub fn resolve(&self, target: ConnRef) -> Option<Arc<Connection>> {
        let inner = self.inner.lock();
        let conn = inner.slots.get(target.index)?;
        if inner.states[target.index] != SlotState::Active || conn.generation() != target.generation {
            return None;
        }
        Some(Arc::clone(conn))
    }

    /// Slot by index regardless of its state.
    pub fn get(&self, index: usize) -> Option<Arc<Connection>> {
        self.inner.lock().slots.get(index).cloned()
    }

    pub fn mark_online(&self) -> usize {
        self.online.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn online(&self) -> usize {
        self.online.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let free = inner.free.len();
        let recycling = inner.recycling.len();
        let total = inner.slots.len();
        PoolStats {
            total,
            free,
            active: total - free - recycling,
            recycling,
            online: self.online(),
        }
    }
}

fn release_locked(inner: &mut PoolInner, conn: &Connection) {
    conn.reset(Instant::now());
    conn.bump_generation();
    inner.states[conn.index()] = SlotState::Free;
    inner.free.push_back(conn.index());
}
