//! Synchronization primitives.
//!
//! A timeline is a monotonically increasing 64-bit counter signalled as the
//! device retires work; waiting for a value blocks until every submission up
//! to that point has completed. Fences and binary semaphores are the
//! per-frame primitives the swapchain ring hands to submission.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct TimelineState {
    /// Highest value the device has retired.
    completed: u64,
    /// Highest value handed out to a submission.
    head: u64,
}

pub struct Timeline {
    state: Mutex<TimelineState>,
    cv: Condvar,
}

impl Timeline {
    pub fn new(initial: u64) -> Timeline {
        Timeline {
            state: Mutex::new(TimelineState {
                completed: initial,
                head: initial,
            }),
            cv: Condvar::new(),
        }
    }

    /// Reserves the next point on the timeline for a submission.
    pub fn allocate(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.head += 1;
        state.head
    }

    /// Latest value handed out to any submission.
    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().unwrap().completed
    }

    /// Marks `value` (and everything before it) as retired.
    pub fn signal(&self, value: u64) {
        let mut state = self.state.lock().unwrap();
        if value > state.completed {
            state.completed = value;
        }
        self.cv.notify_all();
    }

    pub fn is_complete(&self, value: u64) -> bool {
        self.state.lock().unwrap().completed >= value
    }

    /// Blocks until `value` is retired.
    pub fn wait(&self, value: u64) {
        let mut state = self.state.lock().unwrap();
        while state.completed < value {
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Blocks until `value` is retired or the timeout expires.
    /// Returns false on timeout.
    pub fn wait_timeout(&self, value: u64, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.completed < value {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, result) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = next;
            if result.timed_out() && state.completed < value {
                return false;
            }
        }
        true
    }

    /// Blocks until everything handed out so far has retired.
    pub fn drain(&self) {
        let target = self.head();
        self.wait(target);
    }
}

/// CPU-waitable fence gating reuse of per-frame resources.
pub struct Fence {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Fence {
    pub fn new(signaled: bool) -> Fence {
        Fence {
            signaled: Mutex::new(signaled),
            cv: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        *self.signaled.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cv.wait(signaled).unwrap();
        }
    }

    /// Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            let (next, result) = self.cv.wait_timeout(signaled, timeout).unwrap();
            signaled = next;
            if result.timed_out() {
                return *signaled;
            }
        }
        true
    }
}

/// Binary queue-to-queue semaphore. Signalled by one submission, consumed by
/// the next wait.
pub struct Semaphore {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Semaphore {
        Semaphore {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        *self.signaled.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap()
    }

    /// Consumes a pending signal, blocking until one arrives.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cv.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    /// Consumes a pending signal without blocking. Returns whether one was
    /// pending.
    pub fn try_consume(&self) -> bool {
        let mut signaled = self.signaled.lock().unwrap();
        let was = *signaled;
        *signaled = false;
        was
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn timeline_orders_signals() {
        let tl = Timeline::new(0);
        let a = tl.allocate();
        let b = tl.allocate();
        assert!(!tl.is_complete(a));
        tl.signal(b);
        // Signalling a later value retires everything before it.
        assert!(tl.is_complete(a));
        assert!(tl.is_complete(b));
    }

    #[test]
    fn timeline_wait_crosses_threads() {
        let tl = Arc::new(Timeline::new(0));
        let value = tl.allocate();
        let signaller = Arc::clone(&tl);
        let handle = thread::spawn(move || signaller.signal(value));
        tl.wait(value);
        handle.join().unwrap();
        assert!(tl.is_complete(value));
    }

    #[test]
    fn wait_timeout_expires() {
        let tl = Timeline::new(0);
        let v = tl.allocate();
        assert!(!tl.wait_timeout(v, Duration::from_millis(10)));
        tl.signal(v);
        assert!(tl.wait_timeout(v, Duration::from_millis(10)));
    }

    #[test]
    fn semaphore_consumes_on_wait() {
        let sem = Semaphore::new();
        sem.signal();
        assert!(sem.try_consume());
        assert!(!sem.try_consume());
    }

    #[test]
    fn fence_reset_cycle() {
        let fence = Fence::new(true);
        assert!(fence.is_signaled());
        fence.reset();
        assert!(!fence.is_signaled());
        fence.signal();
        fence.wait();
    }
}
