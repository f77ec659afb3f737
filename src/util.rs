//! Thread helpers shared by the pipelines and the server

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Join `handle` if it finishes within `timeout`.
///
/// A thread that is still running at the deadline is detached and `None` is
/// returned, so shutdown never waits on a stuck thread. A thread that
/// panicked also yields `None`.
pub fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(
                "Thread {:?} did not stop within {:?}, abandoning it",
                handle.thread().name().unwrap_or("<unnamed>"),
                timeout
            );
            return None;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }

    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!("Joined thread panicked");
            None
        }
    }
}
