//! Business thread pool fed by the inbound message queue.

use crate::runtime::dispatch::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Saturation warnings are rate limited to one per interval.
const SATURATION_WARN_INTERVAL: Duration = Duration::from_secs(10);

struct State {
    queue: VecDeque<Message>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
    running: AtomicUsize,
    size: AtomicUsize,
    last_saturation_warn: Mutex<Option<Instant>>,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    shutdown: false,
                }),
                available: Condvar::new(),
                running: AtomicUsize::new(0),
                size: AtomicUsize::new(0),
                last_saturation_warn: Mutex::new(None),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `size` threads that run `handler` on each queued message.
    pub fn start<F>(&self, size: usize, handler: F) -> io::Result<()>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let mut handles = self.handles.lock();

        for id in 0..size {
            let shared = Arc::clone(&self.shared);
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("msg-worker-{id}"))
                .spawn(move || worker_loop(&shared, &*handler))?;
            handles.push(handle);
            self.shared.size.fetch_add(1, Ordering::AcqRel);
        }

        debug!(threads = size, "Thread pool started");
        Ok(())
    }

    /// Queue a message and wake one thread.
    pub fn push(&self, message: Message) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.queue.push_back(message);
        let backlog = state.queue.len();
        drop(state);
        self.shared.available.notify_one();

        let size = self.shared.size.load(Ordering::Acquire);
        if size > 0 && self.running() >= size {
            self.warn_saturated(backlog);
        }
    }

    fn warn_saturated(&self, backlog: usize) {
        let mut last = self.shared.last_saturation_warn.lock();
        let now = Instant::now();
        let due = match *last {
            Some(at) => now.duration_since(at) >= SATURATION_WARN_INTERVAL,
            None => true,
        };
        if due {
            *last = Some(now);
            warn!(
                threads = self.shared.size.load(Ordering::Acquire),
                backlog, "All business threads busy, consider adding more"
            );
        }
    }

    /// Stop and join every thread. Queued messages are dropped.
    pub fn stop_all(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.available.notify_all();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        let dropped = {
            let mut state = self.shared.state.lock();
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        debug!(dropped, "Thread pool stopped");
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(shared: &Shared, handler: &(dyn Fn(Message) + Send + Sync)) {
    loop {
        let message = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(message) = state.queue.pop_front() {
                    break message;
                }
                shared.available.wait(&mut state);
            }
        };

        shared.running.fetch_add(1, Ordering::AcqRel);
        handler(message);
        shared.running.fetch_sub(1, Ordering::AcqRel);
    }
}
