use std::sync::Arc;

use tracing::debug;

use crate::engine::EngineCore;
use crate::error::Result;
use crate::runner::StreamItem;
use crate::stream::block::TagBlock;
use crate::stream::tag::Tag;

/// Producer-side handle for pushing ordered blocks into the engine.
///
/// Clones freely; hardware drivers, file replay and network clients all
/// feed the stream through this one seam. Returns `Error::Shutdown` once
/// the engine has stopped.
#[derive(Clone)]
pub struct StreamInput {
    core: Arc<EngineCore>,
}

impl StreamInput {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// Pushes one block into the stream.
    pub fn send(&self, block: TagBlock) -> Result<()> {
        block.debug_validate();
        self.core.send(StreamItem::Block(block))
    }

    /// Pushes a block built from raw parts.
    pub fn send_block(&self, tags: Vec<Tag>, begin: i64, end: i64) -> Result<()> {
        self.send(TagBlock::new(tags, begin, end))
    }

    /// Pushes an empty heartbeat block advancing stream time.
    pub fn heartbeat(&self, begin: i64, end: i64) -> Result<()> {
        self.send(TagBlock::heartbeat(begin, end))
    }

    /// Allocates a fence without inserting an engine-side sentinel. The
    /// producer must embed the returned fence in a later block; it
    /// completes when that block has been fully dispatched.
    ///
    /// May block while the outstanding-fence bound is reached.
    pub fn reserve_fence(&self) -> u32 {
        self.core.reserve_fence()
    }
}

/// Replays a recorded sequence of ordered blocks into the stream.
pub struct ReplaySource {
    blocks: Vec<TagBlock>,
}

impl ReplaySource {
    pub fn new(blocks: Vec<TagBlock>) -> Self {
        Self { blocks }
    }

    /// Pushes every recorded block, in order.
    pub fn feed(&self, input: &StreamInput) -> Result<()> {
        for block in &self.blocks {
            input.send(block.clone())?;
        }

        debug!(blocks = self.blocks.len(), "replay fed");
        Ok(())
    }
}
