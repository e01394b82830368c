//! Measurement base machinery: the capability trait every measurement
//! implements, the lifecycle handle that owns it, and the host seam that
//! connects construction to an engine or a synchronized group.

pub mod barrier;
pub(crate) mod cell;
pub mod group;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::measure::cell::{Cell, GroupMember};
use crate::measure::group::SyncGroup;
use crate::stream::tag::Tag;

/// The capability interface of a measurement.
///
/// The dispatcher calls exactly one of `on_block` or `edit_block` per
/// delivered block, with the measurement's mutex held. Implementations may
/// freely read and write their own state but must not call back into the
/// engine's mutation API from inside the callback; schedule such work for
/// after the block instead.
///
/// Long per-block loops must poll `MeasureCtx::check_abort` so that
/// `abort` can cooperate at tag granularity.
pub trait Measure: Send + 'static {
    /// Processes one block of time-sorted tags covering `[begin, end)`.
    fn on_block(
        &mut self,
        ctx: &mut MeasureCtx<'_>,
        tags: &[Tag],
        begin: i64,
        end: i64,
    ) -> Result<()> {
        let _ = (ctx, tags, begin, end);
        Ok(())
    }

    /// Stream transforms implement this instead of `on_block` to rewrite
    /// the block in place before downstream measurements observe it.
    /// Returns true if the block was modified.
    fn edit_block(
        &mut self,
        ctx: &mut MeasureCtx<'_>,
        tags: &mut Vec<Tag>,
        begin: i64,
        end: i64,
    ) -> Result<bool> {
        self.on_block(ctx, &tags[..], begin, end)?;
        Ok(false)
    }

    /// Whether this measurement rewrites blocks. Editors run before pure
    /// consumers, in creation order.
    fn edits_stream(&self) -> bool {
        false
    }

    /// Resets internal result state. Guarded by the measurement mutex.
    fn clear_impl(&mut self) {}

    /// Called when the measurement is started. Guarded by the mutex.
    fn on_start(&mut self) {}

    /// Called when the measurement is stopped. Guarded by the mutex.
    fn on_stop(&mut self) {}
}

/// Per-delivery context handed to `on_block` and `edit_block`.
pub struct MeasureCtx<'a> {
    aborting: &'a AtomicBool,
}

impl<'a> MeasureCtx<'a> {
    pub(crate) fn new(aborting: &'a AtomicBool) -> Self {
        Self { aborting }
    }

    /// Raises the distinguished abort error if `abort` has been requested.
    /// Call this inside long loops.
    #[inline]
    pub fn check_abort(&self) -> Result<()> {
        if self.aborting.load(Ordering::Relaxed) {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Whether an abort has been requested, without raising.
    #[inline]
    pub fn abort_requested(&self) -> bool {
        self.aborting.load(Ordering::Relaxed)
    }
}

/// Where a measurement attaches at construction: the engine itself, or the
/// proxy of a synchronized group (in which case the measurement is adopted
/// into the group and does not start automatically).
#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) group: Option<&'a SyncGroup>,
}

impl<'a> From<&'a Engine> for Host<'a> {
    fn from(engine: &'a Engine) -> Self {
        Self {
            engine,
            group: None,
        }
    }
}

impl<'a> From<&'a SyncGroup> for Host<'a> {
    fn from(group: &'a SyncGroup) -> Self {
        group.tagger()
    }
}

/// Owning handle of an attached measurement.
///
/// The handle is the thin public surface; all mutable state lives behind
/// the per-measurement mutex inside the engine-registered cell. Dropping
/// the handle removes the measurement from dispatch and releases its
/// channels.
pub struct Measurement<M: Measure> {
    pub(crate) cell: Arc<Cell<M>>,
}

impl<M: Measure> Measurement<M> {
    /// Attaches a custom measurement to a host, registering the given
    /// channels. The measurement starts immediately unless the host is a
    /// synchronized group proxy.
    pub fn new<'a>(
        host: impl Into<Host<'a>>,
        logic: M,
        channels: impl IntoIterator<Item = i32>,
    ) -> Result<Self> {
        Self::attach(host.into(), logic, channels.into_iter().collect(), Vec::new())
    }

    pub(crate) fn attach(
        host: Host<'_>,
        logic: M,
        channels: BTreeSet<i32>,
        virtuals: Vec<i32>,
    ) -> Result<Self> {
        let core = Arc::clone(host.engine.core());

        let mut registered = Vec::with_capacity(channels.len());
        for &ch in &channels {
            match core.register_channel(ch) {
                Ok(()) => registered.push(ch),
                Err(err) => {
                    for &r in &registered {
                        let _ = core.unregister_channel(r);
                    }
                    for &v in &virtuals {
                        core.release_virtual(v);
                    }
                    return Err(err);
                }
            }
        }

        let cell = Cell::create(core, logic, channels, virtuals);

        if let Some(group) = host.group {
            let member: Arc<dyn GroupMember> = cell.clone();
            group.adopt(member);
        }

        let measurement = Self { cell };
        if host.group.is_none() {
            measurement.start();
        }

        Ok(measurement)
    }

    /// Arms dispatch and begins (or continues) data acquisition.
    ///
    /// Configuration changes made before this call are active in every
    /// block the measurement sees: delivery is gated on a freshly
    /// allocated fence.
    pub fn start(&self) {
        self.cell.start(None, false);
    }

    /// As `start`, plus an auto-stop after `duration_ps` of processed
    /// stream time. `clear_first` resets accumulated data beforehand.
    pub fn start_for(&self, duration_ps: i64, clear_first: bool) {
        self.cell.start(Some(duration_ps), clear_first);
    }

    /// Stops processing incoming tags. In-flight blocks complete first;
    /// idempotent. Result state remains readable.
    pub fn stop(&self) {
        self.cell.stop();
    }

    /// Zeros result state and the capture duration. Safe while running:
    /// the next dispatched block starts from a clean slate.
    pub fn clear(&self) {
        self.cell.clear();
    }

    /// Requests an immediate abort. The next `check_abort` poll inside
    /// `on_block` raises; the dispatcher treats it as a stop. The most
    /// recent block may end up partially applied.
    pub fn abort(&self) {
        self.cell.abort();
    }

    /// Whether the measurement is collecting data.
    pub fn is_running(&self) -> bool {
        self.cell.is_running()
    }

    /// Total stream time processed while running, in picoseconds.
    pub fn capture_duration(&self) -> i64 {
        self.cell.capture_duration()
    }

    /// Blocks until the measurement has finished.
    ///
    /// Returns `Ok(true)` once `running` has become false (including after
    /// an abort, which is logged as a warning), `Ok(false)` on timeout, and
    /// `Err` with the stored fault if `on_block` failed. Calling this on an
    /// unbounded running measurement logs an error and returns `Ok(false)`
    /// immediately.
    pub fn wait_until_finished(&self, timeout_ms: i64) -> Result<bool> {
        self.cell
            .wait_finished(crate::fence::wait_deadline(timeout_ms))
    }

    /// Runs a closure against the measurement logic under the per-instance
    /// mutex. This is how measurement types read out result state.
    pub fn with_logic<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        self.cell.with_logic(f)
    }
}

impl<M: Measure> Drop for Measurement<M> {
    fn drop(&mut self) {
        self.cell.detach();
    }
}
