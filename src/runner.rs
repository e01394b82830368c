//! The dispatch loop.
//!
//! One dedicated thread drains a single queue carrying everything that has
//! an ordering relation to the stream: tag blocks, fence sentinels, and
//! synchronized-group control operations. Because the loop processes items
//! strictly in queue order, a fence can never be skipped and a
//! synchronized operation lands exactly on a block boundary.
//!
//! Per block, stream-editing measurements run first, sequentially in
//! creation order, each free to rewrite the block in place. The settled
//! block then fans out to all pure consumers on scoped worker threads; the
//! scope join guarantees every consumer is done before the next item (in
//! particular the next fence sentinel) is taken up.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Receiver;
use tracing::{debug, info, trace};

use crate::engine::EngineCore;
use crate::measure::cell::{Dispatchable, GroupMember, GroupOp};
use crate::stream::block::TagBlock;

/// One entry of the dispatch queue.
pub(crate) enum StreamItem {
    /// An ordered block of tags from the producer.
    Block(TagBlock),
    /// An engine-inserted fence sentinel.
    Fence(u32),
    /// Synchronized-group control operations, applied between blocks.
    Sync(Vec<SyncAction>),
    /// Graceful shutdown; queued items ahead of it still dispatch.
    Shutdown,
}

pub(crate) struct SyncAction {
    pub(crate) member: Weak<dyn GroupMember>,
    pub(crate) op: GroupOp,
}

pub(crate) fn spawn(core: Weak<EngineCore>, rx: Receiver<StreamItem>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("tagflow-dispatch".into())
        .spawn(move || run(core, rx))
        .expect("spawning dispatch thread")
}

fn run(core: Weak<EngineCore>, rx: Receiver<StreamItem>) {
    let mut last_stats_log = Instant::now();
    let mut last_logged_blocks = 0u64;

    for item in rx.iter() {
        let Some(core) = core.upgrade() else {
            break;
        };

        match item {
            StreamItem::Block(mut block) => {
                block.debug_validate();
                dispatch_block(&core, &mut block);

                for fence in &block.fences {
                    core.complete_fence(*fence);
                }
            }

            StreamItem::Fence(fence) => {
                core.complete_fence(fence);
            }

            StreamItem::Sync(actions) => {
                for action in &actions {
                    if let Some(member) = action.member.upgrade() {
                        member.apply(&action.op);
                    }
                }
                trace!(count = actions.len(), "synchronized operations applied");
            }

            StreamItem::Shutdown => {
                debug!("dispatch shutdown requested");
                break;
            }
        }

        let interval = core.config().stats_log_interval;
        if !interval.is_zero() && last_stats_log.elapsed() >= interval {
            let snap = core.stats_snapshot();
            if snap.blocks > last_logged_blocks {
                info!(
                    blocks = snap.blocks,
                    time_tags = snap.total_time_tags(),
                    fences = snap.fences_completed,
                    faults = snap.faults,
                    "stream stats",
                );
                last_logged_blocks = snap.blocks;
            }
            last_stats_log = Instant::now();
        }
    }

    debug!("dispatch loop exited");
}

fn dispatch_block(core: &Arc<EngineCore>, block: &mut TagBlock) {
    core.record_block(&block.tags);

    // Snapshot of the live measurement list: it may mutate during dispatch.
    let cells = core.measurement_snapshot();
    if cells.is_empty() {
        return;
    }

    // Editors first, in creation order. A transform that publishes a
    // virtual channel was necessarily created before any consumer of that
    // channel, so creation order tops the declared dependency order.
    for cell in cells.iter().filter(|c| c.edits_stream()) {
        cell.deliver_edit(&mut block.tags, block.begin, block.end);
    }

    let consumers: Vec<&Arc<dyn Dispatchable>> =
        cells.iter().filter(|c| !c.edits_stream()).collect();

    match consumers.len() {
        0 => {}
        1 => consumers[0].deliver(&block.tags, block.begin, block.end),
        n => {
            let workers = core.config().workers().clamp(1, n);
            if workers == 1 {
                for cell in consumers {
                    cell.deliver(&block.tags, block.begin, block.end);
                }
            } else {
                let tags = &block.tags;
                let (begin, end) = (block.begin, block.end);
                let chunk_size = n.div_ceil(workers);
                thread::scope(|scope| {
                    for chunk in consumers.chunks(chunk_size) {
                        scope.spawn(move || {
                            for cell in chunk {
                                cell.deliver(tags, begin, end);
                            }
                        });
                    }
                });
            }
        }
    }
}
