use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Converts a millisecond timeout to a wait deadline.
///
/// Negative means no deadline, zero means a non-blocking probe. Timeouts
/// too large to represent as a deadline degrade to no deadline.
pub(crate) fn wait_deadline(timeout_ms: i64) -> Option<Instant> {
    if timeout_ms < 0 {
        return None;
    }
    Instant::now().checked_add(Duration::from_millis(timeout_ms as u64))
}

/// Monotonic fence sequencing.
///
/// Fences are allocated starting at 1; 0 means "none" and is trivially
/// complete. A fence completes when the dispatcher has fully processed its
/// sentinel in the stream. The number of outstanding fences is bounded, so
/// allocation can block under pressure.
pub(crate) struct FenceTracker {
    inner: Mutex<FenceState>,
    cv: Condvar,
    // Mirror of the completed watermark for lock-free gate checks on the
    // dispatch path.
    completed: AtomicU32,
    max_pending: u32,
}

struct FenceState {
    next: u32,
    completed: u32,
}

impl FenceTracker {
    pub(crate) fn new(max_pending: u32) -> Self {
        Self {
            inner: Mutex::new(FenceState {
                next: 1,
                completed: 0,
            }),
            cv: Condvar::new(),
            completed: AtomicU32::new(0),
            max_pending,
        }
    }

    /// Allocates the next fence, blocking while the outstanding bound is
    /// reached.
    pub(crate) fn allocate(&self) -> u32 {
        let mut state = self.inner.lock();
        while (state.next - 1) - state.completed >= self.max_pending {
            self.cv.wait(&mut state);
        }

        let fence = state.next;
        state.next += 1;
        fence
    }

    /// The most recently allocated fence, 0 if none.
    pub(crate) fn current(&self) -> u32 {
        self.inner.lock().next - 1
    }

    /// The highest completed fence.
    pub(crate) fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    /// Marks a fence as processed, releasing waiters.
    pub(crate) fn complete(&self, fence: u32) {
        let mut state = self.inner.lock();
        if fence > state.completed {
            state.completed = fence;
            self.completed.store(fence, Ordering::Release);
            self.cv.notify_all();
        }
    }

    /// Blocks until the fence has been processed, or the timeout elapses.
    pub(crate) fn wait(&self, fence: u32, timeout_ms: i64) -> bool {
        if fence == 0 {
            return true;
        }

        let deadline = wait_deadline(timeout_ms);
        let mut state = self.inner.lock();
        loop {
            if state.completed >= fence {
                return true;
            }

            match deadline {
                None => self.cv.wait(&mut state),
                Some(deadline) => {
                    if self.cv.wait_until(&mut state, deadline).timed_out() {
                        return state.completed >= fence;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_allocation_is_monotonic() {
        let fences = FenceTracker::new(16);
        assert_eq!(fences.current(), 0);
        assert_eq!(fences.allocate(), 1);
        assert_eq!(fences.allocate(), 2);
        assert_eq!(fences.current(), 2);
    }

    #[test]
    fn test_fence_zero_is_trivially_complete() {
        let fences = FenceTracker::new(16);
        assert!(fences.wait(0, 0));
    }

    #[test]
    fn test_wait_timeout_and_completion() {
        let fences = FenceTracker::new(16);
        let f = fences.allocate();

        assert!(!fences.wait(f, 10));

        fences.complete(f);
        assert!(fences.wait(f, 0));
        assert_eq!(fences.completed(), f);
    }

    #[test]
    fn test_wait_released_by_other_thread() {
        let fences = Arc::new(FenceTracker::new(16));
        let f = fences.allocate();

        let waiter = {
            let fences = Arc::clone(&fences);
            thread::spawn(move || fences.wait(f, -1))
        };

        thread::sleep(Duration::from_millis(20));
        fences.complete(f);
        assert!(waiter.join().expect("waiter thread"));
    }

    #[test]
    fn test_allocation_blocks_at_bound() {
        let fences = Arc::new(FenceTracker::new(2));
        let a = fences.allocate();
        let _b = fences.allocate();

        let alloc = {
            let fences = Arc::clone(&fences);
            thread::spawn(move || fences.allocate())
        };

        // The third allocation must stay blocked until a completion.
        thread::sleep(Duration::from_millis(20));
        assert!(!alloc.is_finished());

        fences.complete(a);
        assert_eq!(alloc.join().expect("alloc thread"), 3);
    }

    #[test]
    fn test_completion_is_monotonic() {
        let fences = FenceTracker::new(16);
        let a = fences.allocate();
        let b = fences.allocate();

        fences.complete(b);
        fences.complete(a);
        assert_eq!(fences.completed(), b);
    }
}
