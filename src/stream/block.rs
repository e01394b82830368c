use crate::stream::tag::{Tag, TagKind};

/// A contiguous run of time-sorted tags delivered together.
///
/// The producer guarantees that no tag in any later block carries
/// `time_ps < end`. Empty blocks are legal and serve as heartbeats.
/// `fences` lists fence sentinels embedded in this block by the producer;
/// they complete once the block has been fully dispatched.
#[derive(Debug, Clone)]
pub struct TagBlock {
    /// Time-sorted tags with `begin <= time_ps < end`.
    pub tags: Vec<Tag>,
    /// Inclusive start of the covered stream interval, in picoseconds.
    pub begin: i64,
    /// Exclusive end of the covered stream interval, in picoseconds.
    pub end: i64,
    /// Fence sentinels carried by this block.
    pub fences: Vec<u32>,
}

impl TagBlock {
    /// A block without embedded fence sentinels.
    pub fn new(tags: Vec<Tag>, begin: i64, end: i64) -> Self {
        Self {
            tags,
            begin,
            end,
            fences: Vec::new(),
        }
    }

    /// An empty heartbeat block advancing stream time.
    pub fn heartbeat(begin: i64, end: i64) -> Self {
        Self::new(Vec::new(), begin, end)
    }

    /// Attaches fence sentinels to the block.
    pub fn with_fences(mut self, fences: Vec<u32>) -> Self {
        self.fences = fences;
        self
    }

    /// Whether the tag run is sorted by time.
    pub fn is_time_sorted(&self) -> bool {
        self.tags.windows(2).all(|w| w[0].time_ps <= w[1].time_ps)
    }

    /// Debug-build validation of the block invariants.
    ///
    /// Producer-delivered tags must lie in `[begin, end)`; overflow begin
    /// and end markers must balance at block granularity.
    pub(crate) fn debug_validate(&self) {
        if cfg!(debug_assertions) {
            debug_assert!(self.begin <= self.end, "inverted block interval");
            debug_assert!(self.is_time_sorted(), "tags out of time order");

            let mut depth = 0i32;
            for tag in &self.tags {
                debug_assert!(
                    tag.time_ps >= self.begin && tag.time_ps < self.end,
                    "tag time {} outside [{}, {})",
                    tag.time_ps,
                    self.begin,
                    self.end,
                );

                match tag.kind {
                    TagKind::OverflowBegin => depth += 1,
                    TagKind::OverflowEnd => depth -= 1,
                    _ => {}
                }
            }
            debug_assert_eq!(depth, 0, "unbalanced overflow markers in block");
        }
    }
}
