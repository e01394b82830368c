use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::engine::EngineCore;
use crate::error::{Error, Result};
use crate::measure::{Measure, MeasureCtx};
use crate::stream::tag::Tag;

/// Dispatch-facing view of a measurement, held weakly by the engine table.
pub(crate) trait Dispatchable: Send + Sync {
    fn edits_stream(&self) -> bool;
    /// Delivers a block to a pure consumer.
    fn deliver(&self, tags: &[Tag], begin: i64, end: i64);
    /// Delivers a block to a stream editor. Returns true if the block was
    /// modified.
    fn deliver_edit(&self, tags: &mut Vec<Tag>, begin: i64, end: i64) -> bool;
}

/// Control operation applied to synchronized-group members by the
/// dispatcher on a block boundary.
#[derive(Debug, Clone)]
pub(crate) enum GroupOp {
    Start {
        fence: u32,
    },
    StartFor {
        fence: u32,
        duration: i64,
        clear_first: bool,
    },
    Stop,
    Clear,
}

/// Group-facing view of a measurement.
pub(crate) trait GroupMember: Send + Sync {
    fn member_id(&self) -> u64;
    fn apply(&self, op: &GroupOp);
    fn group_wait_finished(&self, deadline: Option<Instant>) -> Result<bool>;
    fn group_is_running(&self) -> bool;
}

/// The private state of a measurement: one mutex guarding lifecycle fields
/// and the measurement logic together. The public `Measurement` handle and
/// the engine's weak dispatch reference both point here.
pub(crate) struct Cell<M: Measure> {
    id: u64,
    core: Arc<EngineCore>,
    edits: bool,
    aborting: AtomicBool,
    cv: Condvar,
    inner: Mutex<CellInner<M>>,
}

struct CellInner<M> {
    running: bool,
    min_fence: u32,
    capture_duration: i64,
    /// Capture duration at which the measurement stops itself.
    capture_target: Option<i64>,
    pending_error: Option<Error>,
    detached: bool,
    channels: BTreeSet<i32>,
    virtuals: Vec<i32>,
    logic: M,
}

enum Gate {
    Skip,
    Run { eff_end: i64, finish: bool },
}

impl<M: Measure> Cell<M> {
    pub(crate) fn create(
        core: Arc<EngineCore>,
        logic: M,
        channels: BTreeSet<i32>,
        virtuals: Vec<i32>,
    ) -> Arc<Self> {
        let edits = logic.edits_stream();
        let id = core.next_measurement_id();

        let cell = Arc::new(Self {
            id,
            core: Arc::clone(&core),
            edits,
            aborting: AtomicBool::new(false),
            cv: Condvar::new(),
            inner: Mutex::new(CellInner {
                running: false,
                min_fence: 0,
                capture_duration: 0,
                capture_target: None,
                pending_error: None,
                detached: false,
                channels,
                virtuals,
                logic,
            }),
        });

        let dispatchable: Arc<dyn Dispatchable> = cell.clone();
        let weak: std::sync::Weak<dyn Dispatchable> = Arc::downgrade(&dispatchable);
        core.insert_measurement(id, weak);
        cell
    }

    pub(crate) fn start(&self, duration: Option<i64>, clear_first: bool) {
        // The fence is allocated before taking the cell mutex: allocation
        // may block at the outstanding-fence bound.
        let fence = self.core.alloc_fence();
        let mut inner = self.inner.lock();
        self.start_locked(&mut inner, fence, duration, clear_first);
    }

    fn start_locked(
        &self,
        inner: &mut CellInner<M>,
        fence: u32,
        duration: Option<i64>,
        clear_first: bool,
    ) {
        if inner.detached {
            return;
        }

        if clear_first {
            Self::clear_locked(inner);
        }

        self.aborting.store(false, Ordering::SeqCst);
        inner.pending_error = None;
        inner.min_fence = fence;
        inner.capture_target = duration.map(|d| inner.capture_duration + d);

        if !inner.running {
            inner.logic.on_start();
            inner.running = true;
            debug!(id = self.id, fence, "measurement started");
        }
    }

    pub(crate) fn stop(&self) {
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner);
    }

    fn stop_locked(&self, inner: &mut CellInner<M>) {
        if inner.running {
            inner.running = false;
            inner.logic.on_stop();
            self.cv.notify_all();
            debug!(id = self.id, capture = inner.capture_duration, "measurement stopped");
        }
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        Self::clear_locked(&mut inner);
    }

    fn clear_locked(inner: &mut CellInner<M>) {
        inner.capture_duration = 0;
        inner.pending_error = None;
        inner.logic.clear_impl();
    }

    /// Requests an abort. If no delivery is in flight the measurement stops
    /// right away; otherwise the in-flight `on_block` observes the flag via
    /// `check_abort` (or on return) and the dispatcher finishes the stop.
    pub(crate) fn abort(&self) {
        self.aborting.store(true, Ordering::SeqCst);

        if let Some(mut inner) = self.inner.try_lock() {
            if inner.running {
                self.fail_locked(&mut inner, Error::Aborted);
            }
        }
    }

    pub(crate) fn measurement_id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub(crate) fn capture_duration(&self) -> i64 {
        self.inner.lock().capture_duration
    }

    pub(crate) fn with_logic<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner.logic)
    }

    pub(crate) fn wait_finished(&self, deadline: Option<Instant>) -> Result<bool> {
        let mut inner = self.inner.lock();
        loop {
            // An abort requested while the stream is idle is finalized by
            // the waiter itself.
            if self.aborting.load(Ordering::Relaxed) && inner.running {
                self.fail_locked(&mut inner, Error::Aborted);
            }

            match inner.pending_error.take() {
                Some(Error::Aborted) => {
                    warn!(
                        id = self.id,
                        "measurement aborted; the most recent block may be partially applied",
                    );
                    return Ok(true);
                }
                Some(err) => return Err(err),
                None => {}
            }

            if !inner.running {
                return Ok(true);
            }

            if inner.capture_target.is_none() {
                error!(
                    id = self.id,
                    "wait_until_finished called on an unbounded running measurement",
                );
                return Ok(false);
            }

            match deadline {
                None => self.cv.wait(&mut inner),
                Some(deadline) => {
                    if self.cv.wait_until(&mut inner, deadline).timed_out() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Removes the measurement from dispatch and releases its channels.
    pub(crate) fn detach(&self) {
        self.core.remove_measurement(self.id);

        let mut inner = self.inner.lock();
        if inner.detached {
            return;
        }
        inner.detached = true;

        if inner.running {
            inner.running = false;
            inner.logic.on_stop();
        }

        let channels = std::mem::take(&mut inner.channels);
        let virtuals = std::mem::take(&mut inner.virtuals);
        self.cv.notify_all();
        // The channel toggle hook runs user code; release the cell mutex
        // before touching the registry.
        drop(inner);

        for ch in channels {
            if let Err(err) = self.core.unregister_channel(ch) {
                warn!(channel = ch, error = %err, "channel release on detach failed");
            }
        }
        for v in virtuals {
            self.core.release_virtual(v);
        }
    }

    fn gate_locked(&self, inner: &mut CellInner<M>, begin: i64, end: i64) -> Gate {
        if !inner.running {
            return Gate::Skip;
        }

        // First-delivery gate: configuration changes made before start()
        // are live once the start fence has been processed.
        if self.core.fence_completed() < inner.min_fence {
            return Gate::Skip;
        }

        let mut eff_end = end;
        let mut finish = false;
        if let Some(target) = inner.capture_target {
            let remaining = target - inner.capture_duration;
            if remaining <= end - begin {
                eff_end = begin + remaining.max(0);
                finish = true;
            }
        }

        inner.capture_duration += eff_end - begin;
        Gate::Run { eff_end, finish }
    }

    fn settle(&self, inner: &mut CellInner<M>, result: Result<()>, finish: bool) {
        if let Err(err) = result {
            self.fail_locked(inner, err);
            return;
        }

        // Catch aborts requested mid-block even if the logic never polled.
        if self.aborting.load(Ordering::Relaxed) {
            self.fail_locked(inner, Error::Aborted);
            return;
        }

        if finish {
            self.stop_locked(inner);
        }
    }

    fn fail_locked(&self, inner: &mut CellInner<M>, err: Error) {
        match &err {
            Error::Aborted => debug!(id = self.id, "abort observed"),
            other => {
                self.core.record_fault();
                warn!(id = self.id, error = %other, "measurement fault; measurement stopped");
            }
        }

        inner.pending_error = Some(err);
        if inner.running {
            inner.running = false;
            inner.logic.on_stop();
        }
        self.cv.notify_all();
    }
}

impl<M: Measure> Dispatchable for Cell<M> {
    fn edits_stream(&self) -> bool {
        self.edits
    }

    fn deliver(&self, tags: &[Tag], begin: i64, end: i64) {
        let mut inner = self.inner.lock();
        let Gate::Run { eff_end, finish } = self.gate_locked(&mut inner, begin, end) else {
            return;
        };

        let view = if eff_end < end {
            let cut = tags.partition_point(|t| t.time_ps < eff_end);
            &tags[..cut]
        } else {
            tags
        };

        let mut ctx = MeasureCtx::new(&self.aborting);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            inner.logic.on_block(&mut ctx, view, begin, eff_end)
        }))
        .unwrap_or_else(|payload| Err(panic_error(payload)));

        self.settle(&mut inner, outcome, finish);
    }

    fn deliver_edit(&self, tags: &mut Vec<Tag>, begin: i64, end: i64) -> bool {
        let mut inner = self.inner.lock();
        let Gate::Run { eff_end, finish } = self.gate_locked(&mut inner, begin, end) else {
            return false;
        };

        let mut ctx = MeasureCtx::new(&self.aborting);
        let outcome = if eff_end < end {
            // A bounded editor must not observe tags past its cutoff, but
            // downstream measurements still need them: split, edit, rejoin.
            let cut = tags.partition_point(|t| t.time_ps < eff_end);
            let mut tail = tags.split_off(cut);
            let r = panic::catch_unwind(AssertUnwindSafe(|| {
                inner.logic.edit_block(&mut ctx, tags, begin, eff_end)
            }))
            .unwrap_or_else(|payload| Err(panic_error(payload)));
            tags.append(&mut tail);
            r
        } else {
            panic::catch_unwind(AssertUnwindSafe(|| {
                inner.logic.edit_block(&mut ctx, tags, begin, end)
            }))
            .unwrap_or_else(|payload| Err(panic_error(payload)))
        };

        let edited = matches!(outcome, Ok(true));
        self.settle(&mut inner, outcome.map(|_| ()), finish);
        edited
    }
}

impl<M: Measure> GroupMember for Cell<M> {
    fn member_id(&self) -> u64 {
        self.id
    }

    fn apply(&self, op: &GroupOp) {
        let mut inner = self.inner.lock();
        if inner.detached {
            return;
        }

        match *op {
            GroupOp::Start { fence } => self.start_locked(&mut inner, fence, None, false),
            GroupOp::StartFor {
                fence,
                duration,
                clear_first,
            } => self.start_locked(&mut inner, fence, Some(duration), clear_first),
            GroupOp::Stop => self.stop_locked(&mut inner),
            GroupOp::Clear => Self::clear_locked(&mut inner),
        }
    }

    fn group_wait_finished(&self, deadline: Option<Instant>) -> Result<bool> {
        self.wait_finished(deadline)
    }

    fn group_is_running(&self) -> bool {
        self.is_running()
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> Error {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string());

    Error::fault(anyhow::anyhow!("panic in measurement callback: {msg}"))
}
