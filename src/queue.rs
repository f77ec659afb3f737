//! Bounded blocking frame queue
//!
//! Hands discrete units (encoded frames, raw sample blocks, images) from one
//! producer thread to one consumer thread. Consumers block on a condition
//! variable while the queue is empty; producers never spin. When the queue is
//! full the configured [`OverflowPolicy`] decides what happens.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// What a producer does when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued unit. The producer never blocks.
    #[default]
    DropOldest,
    /// Wait up to the timeout for room, then hand the unit back.
    Block(Duration),
}

/// Push outcome
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// Still full after the blocking timeout
    Full(T),
    /// The queue was closed
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

/// Pop outcome when nothing could be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    Timeout,
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-thread hand-off queue
pub struct FrameQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` units (minimum 1)
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a unit, applying the overflow policy when full
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }

        if state.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                OverflowPolicy::Block(timeout) => {
                    let deadline = Instant::now() + timeout;
                    while state.items.len() >= self.capacity && !state.closed {
                        if self.not_full.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                    if state.closed {
                        return Err(PushError::Closed(item));
                    }
                    if state.items.len() >= self.capacity {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Err(PushError::Full(item));
                    }
                }
            }
        }

        state.items.push_back(item);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until a unit is available. Returns `None` once closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Block for at most `timeout` waiting for a unit
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, PopError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(PopError::Closed);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return match state.items.pop_front() {
                    Some(item) => {
                        drop(state);
                        self.not_full.notify_one();
                        Ok(item)
                    }
                    None => Err(PopError::Timeout),
                };
            }
        }
    }

    /// Take a unit without waiting
    pub fn try_pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Close the queue and wake every waiter. Queued units can still be drained.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Reopen a closed queue, discarding anything left in it
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.closed = false;
    }

    /// Discard every queued unit
    pub fn clear(&self) {
        self.state.lock().items.clear();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Units accepted so far
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Units evicted or refused because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
