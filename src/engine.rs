//! The tag distribution engine.
//!
//! `Engine` owns the live event stream: it tracks channel use, allocates
//! virtual channels and fences, registers measurements, and runs the
//! dispatch thread that fans ordered blocks out to them. Handles are cheap
//! clones; the engine stays alive while any handle, producer input, or
//! attached measurement exists.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channels::ChannelRegistry;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fence::FenceTracker;
use crate::measure::cell::Dispatchable;
use crate::runner::{self, StreamItem};
use crate::stream::source::StreamInput;
use crate::stream::tag::{Tag, CHANNEL_UNUSED};
use crate::telemetry::{EngineStats, StatsSnapshot};

/// Producer hook fired on channel enable (0 to 1) and disable (1 to 0)
/// transitions.
pub type ChannelToggleFn = Box<dyn Fn(i32, bool) + Send + Sync>;

/// Cheap-to-clone handle on the streaming engine.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Builds the engine and starts its dispatch thread.
    pub fn new(cfg: EngineConfig) -> Self {
        let (input_tx, input_rx) = crossbeam_channel::unbounded();

        let core = Arc::new(EngineCore {
            registry: ChannelRegistry::new(cfg.scheme, cfg.input_channels),
            fences: FenceTracker::new(cfg.max_pending_fences),
            stats: EngineStats::new(),
            input_tx,
            toggle: Mutex::new(None),
            table: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            runner: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            cfg,
        });

        let handle = runner::spawn(Arc::downgrade(&core), input_rx);
        *core.runner.lock() = Some(handle);

        info!(
            scheme = ?core.cfg.scheme,
            input_channels = core.cfg.input_channels,
            "engine started",
        );

        Engine { core }
    }

    /// The producer-side handle for pushing ordered blocks.
    pub fn input(&self) -> StreamInput {
        StreamInput::new(Arc::clone(&self.core))
    }

    /// Allocates a new fence and appends its sentinel to the stream, or
    /// with `alloc = false` returns the most recently allocated fence.
    ///
    /// Allocation may block while the outstanding-fence bound is reached.
    pub fn get_fence(&self, alloc: bool) -> u32 {
        if alloc {
            self.core.alloc_fence()
        } else {
            self.core.fences.current()
        }
    }

    /// Blocks until the dispatcher has fully processed the sentinel for
    /// `fence`. Negative timeout means infinite, zero probes.
    pub fn wait_for_fence(&self, fence: u32, timeout_ms: i64) -> bool {
        self.core.fences.wait(fence, timeout_ms)
    }

    /// Allocates a fence and waits for it: configuration changes issued
    /// before this call are reflected in every block delivered afterwards.
    pub fn sync(&self, timeout_ms: i64) -> bool {
        let fence = self.get_fence(true);
        self.wait_for_fence(fence, timeout_ms)
    }

    /// As `sync`, surfacing a timeout as `Error::FenceTimeout`.
    pub fn flush(&self, timeout_ms: i64) -> Result<()> {
        let fence = self.get_fence(true);
        if self.wait_for_fence(fence, timeout_ms) {
            Ok(())
        } else {
            Err(Error::FenceTimeout(fence))
        }
    }

    /// The falling channel for a rising channel and vice versa. Virtual
    /// channels have no inverted counterpart and yield `CHANNEL_UNUSED`.
    pub fn inverted_channel(&self, channel: i32) -> Result<i32> {
        self.core.registry.inverted(channel)
    }

    /// Compares a channel against the unused sentinel.
    pub fn is_unused_channel(&self, channel: i32) -> bool {
        channel == CHANNEL_UNUSED
    }

    /// Installs the producer hook observing channel enable and disable
    /// transitions.
    pub fn on_channel_toggle(&self, hook: ChannelToggleFn) {
        *self.core.toggle.lock() = Some(hook);
    }

    /// Point-in-time stream statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats_snapshot()
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.core.cfg
    }

    /// Stops the dispatch thread after draining queued items. Pending
    /// fence waits are released. Idempotent; also runs when the last
    /// handle drops.
    pub fn shutdown(&self) {
        if self.core.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.core.input_tx.send(StreamItem::Shutdown);

        let handle = self.core.runner.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("dispatch thread panicked");
            }
        }

        // Nothing will complete fences anymore; release all waiters.
        self.core.fences.complete(self.core.fences.current());

        info!("engine stopped");
    }

    pub(crate) fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Last handle gone: attached measurements and producer inputs hold
        // their own core references, so a nonzero remainder keeps the
        // stream alive for them.
        if Arc::strong_count(&self.core) == 1 {
            self.shutdown();
        }
    }
}

/// Shared engine state; everything the dispatch thread, the measurements
/// and the public handles touch.
pub(crate) struct EngineCore {
    cfg: EngineConfig,
    registry: ChannelRegistry,
    pub(crate) fences: FenceTracker,
    stats: EngineStats,
    input_tx: Sender<StreamItem>,
    toggle: Mutex<Option<ChannelToggleFn>>,
    table: Mutex<Vec<(u64, Weak<dyn Dispatchable>)>>,
    next_id: AtomicU64,
    runner: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl EngineCore {
    pub(crate) fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub(crate) fn send(&self, item: StreamItem) -> Result<()> {
        self.input_tx.send(item).map_err(|_| Error::Shutdown)
    }

    /// Allocates a fence and appends its sentinel to the stream. If the
    /// dispatcher is gone the fence completes immediately so waiters do
    /// not hang.
    pub(crate) fn alloc_fence(&self) -> u32 {
        let fence = self.fences.allocate();
        if self.input_tx.send(StreamItem::Fence(fence)).is_err() {
            self.fences.complete(fence);
        }
        fence
    }

    /// Allocates a fence without inserting a sentinel; the producer is
    /// expected to embed it in a later block.
    pub(crate) fn reserve_fence(&self) -> u32 {
        self.fences.allocate()
    }

    pub(crate) fn fence_completed(&self) -> u32 {
        self.fences.completed()
    }

    pub(crate) fn complete_fence(&self, fence: u32) {
        self.fences.complete(fence);
        self.stats.record_fence();
    }

    pub(crate) fn register_channel(&self, channel: i32) -> Result<()> {
        if self.registry.register(channel)? {
            debug!(channel, "channel enabled");
            if let Some(hook) = self.toggle.lock().as_ref() {
                hook(channel, true);
            }
        }
        Ok(())
    }

    pub(crate) fn unregister_channel(&self, channel: i32) -> Result<()> {
        if self.registry.unregister(channel)? {
            debug!(channel, "channel disabled");
            if let Some(hook) = self.toggle.lock().as_ref() {
                hook(channel, false);
            }
        }
        Ok(())
    }

    pub(crate) fn validate_channel(&self, channel: i32) -> Result<()> {
        self.registry.validate(channel)
    }

    pub(crate) fn alloc_virtual(&self) -> i32 {
        self.registry.alloc_virtual()
    }

    pub(crate) fn release_virtual(&self, channel: i32) {
        self.registry.release_virtual(channel);
    }

    pub(crate) fn next_measurement_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert_measurement(&self, id: u64, cell: Weak<dyn Dispatchable>) {
        self.table.lock().push((id, cell));
        debug!(id, "measurement registered");
    }

    pub(crate) fn remove_measurement(&self, id: u64) {
        self.table.lock().retain(|(mid, _)| *mid != id);
        debug!(id, "measurement removed");
    }

    /// Copies the live measurement list in creation order, pruning dead
    /// entries.
    pub(crate) fn measurement_snapshot(&self) -> Vec<Arc<dyn Dispatchable>> {
        let mut table = self.table.lock();
        table.retain(|(_, weak)| weak.strong_count() > 0);
        table
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub(crate) fn record_block(&self, tags: &[Tag]) {
        self.stats.record_block(tags);
    }

    pub(crate) fn record_fault(&self) {
        self.stats.record_fault();
    }

    pub(crate) fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
