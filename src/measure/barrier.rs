//! Ticketed completion ordering for internally parallel measurements.
//!
//! A measurement that farms block work out to helper threads can release
//! its own mutex while the work runs, yet must apply results to its state
//! in block order. `OrderedBarrier` hands out monotonic tickets at queue
//! time; `sync` blocks a ticket holder until every earlier ticket has
//! released, and dropping a ticket releases it.

use std::collections::BTreeSet;

use parking_lot::{Condvar, Mutex};

/// Serializes completions in the order tickets were queued.
pub struct OrderedBarrier {
    inner: Mutex<BarrierState>,
    cv: Condvar,
}

struct BarrierState {
    /// Next ticket id to hand out.
    next: u64,
    /// All tickets below this id have released.
    head: u64,
    /// Released tickets at or above `head`.
    released: BTreeSet<u64>,
}

/// A queued position in the barrier. Released on drop.
pub struct OrderTicket<'a> {
    parent: &'a OrderedBarrier,
    id: u64,
    released: bool,
}

impl OrderedBarrier {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BarrierState {
                next: 0,
                head: 0,
                released: BTreeSet::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Takes the next ticket in queue order.
    pub fn queue(&self) -> OrderTicket<'_> {
        let mut state = self.inner.lock();
        let id = state.next;
        state.next += 1;

        OrderTicket {
            parent: self,
            id,
            released: false,
        }
    }

    /// Blocks until every queued ticket has released.
    pub fn wait_until_finished(&self) {
        let mut state = self.inner.lock();
        while state.head < state.next {
            self.cv.wait(&mut state);
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.inner.lock();
        state.released.insert(id);
        loop {
            let head = state.head;
            if !state.released.remove(&head) {
                break;
            }
            state.head += 1;
        }
        self.cv.notify_all();
    }
}

impl Default for OrderedBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderTicket<'_> {
    /// Blocks until all earlier tickets have released.
    pub fn sync(&self) {
        let mut state = self.parent.inner.lock();
        while state.head < self.id {
            self.parent.cv.wait(&mut state);
        }
    }

    /// Releases the ticket explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.parent.release(self.id);
        }
    }
}

impl Drop for OrderTicket<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// A measurement-local pipeline stage built on an `OrderedBarrier`.
///
/// Each internally parallel measurement owns one pipeline per stage of its
/// processing; queueing a ticket per block serializes state updates in
/// block order across the helper threads.
pub struct OrderedPipeline {
    stage: OrderedBarrier,
}

impl OrderedPipeline {
    pub fn new() -> Self {
        Self {
            stage: OrderedBarrier::new(),
        }
    }

    /// Takes the next ticket of this stage.
    pub fn queue(&self) -> OrderTicket<'_> {
        self.stage.queue()
    }

    /// Blocks until all queued work has released.
    pub fn wait_until_finished(&self) {
        self.stage.wait_until_finished()
    }
}

impl Default for OrderedPipeline {
    fn default() -> Self {
        Self::new()
    }
}
