use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::stream::tag::{Tag, TagKind, MAX_TAG_KIND};

/// Lock-free stream counters maintained by the dispatch loop.
///
/// Per-kind counts live in a plain atomic array; per-channel counts use a
/// concurrent map because virtual channels come and go at runtime.
pub(crate) struct EngineStats {
    blocks: AtomicU64,
    fences: AtomicU64,
    faults: AtomicU64,
    tags_by_kind: [AtomicU64; MAX_TAG_KIND + 1],
    tags_by_channel: DashMap<i32, u64>,
}

impl EngineStats {
    pub(crate) fn new() -> Self {
        Self {
            blocks: AtomicU64::new(0),
            fences: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            tags_by_kind: std::array::from_fn(|_| AtomicU64::new(0)),
            tags_by_channel: DashMap::new(),
        }
    }

    /// Accounts one dispatched block.
    pub(crate) fn record_block(&self, tags: &[Tag]) {
        self.blocks.fetch_add(1, Ordering::Relaxed);

        for tag in tags {
            if let Some(counter) = self.tags_by_kind.get(tag.kind as usize) {
                counter.fetch_add(1, Ordering::Relaxed);
            }

            if tag.kind == TagKind::TimeTag {
                *self.tags_by_channel.entry(tag.channel).or_default() += 1;
            }
        }
    }

    pub(crate) fn record_fence(&self) {
        self.fences.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters without resetting them.
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let mut tags_by_kind = Vec::new();
        for (i, counter) in self.tags_by_kind.iter().enumerate() {
            let v = counter.load(Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = TagKind::from_u8(i as u8) {
                    tags_by_kind.push((kind, v));
                }
            }
        }

        let mut tags_by_channel: Vec<(i32, u64)> = self
            .tags_by_channel
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        tags_by_channel.sort_unstable_by_key(|&(ch, _)| ch);

        StatsSnapshot {
            blocks: self.blocks.load(Ordering::Relaxed),
            fences_completed: self.fences.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            tags_by_kind,
            tags_by_channel,
        }
    }
}

/// Point-in-time view of the engine counters.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Blocks dispatched since engine start.
    pub blocks: u64,
    /// Fence sentinels completed.
    pub fences_completed: u64,
    /// Measurement faults observed.
    pub faults: u64,
    /// Nonzero tag counts per kind.
    pub tags_by_kind: Vec<(TagKind, u64)>,
    /// Edge event counts per channel, sorted by channel.
    pub tags_by_channel: Vec<(i32, u64)>,
}

impl StatsSnapshot {
    /// Total edge events seen across all channels.
    pub fn total_time_tags(&self) -> u64 {
        self.tags_by_kind
            .iter()
            .find(|(kind, _)| *kind == TagKind::TimeTag)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = EngineStats::new();
        stats.record_block(&[
            Tag::time_tag(10, 1),
            Tag::time_tag(20, 1),
            Tag::time_tag(30, 2),
            Tag::marker(TagKind::OverflowBegin, 40),
            Tag::marker(TagKind::OverflowEnd, 50),
        ]);
        stats.record_fence();

        let snap = stats.snapshot();
        assert_eq!(snap.blocks, 1);
        assert_eq!(snap.fences_completed, 1);
        assert_eq!(snap.total_time_tags(), 3);
        assert_eq!(snap.tags_by_channel, vec![(1, 2), (2, 1)]);
    }

    #[test]
    fn test_markers_not_counted_per_channel() {
        let stats = EngineStats::new();
        stats.record_block(&[Tag::missed(10, 3, 100)]);

        let snap = stats.snapshot();
        assert!(snap.tags_by_channel.is_empty());
        assert_eq!(snap.tags_by_kind, vec![(TagKind::MissedEvents, 1)]);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let stats = EngineStats::new();
        stats.record_block(&[Tag::time_tag(1, 1)]);
        let first = stats.snapshot();
        let second = stats.snapshot();
        assert_eq!(first.blocks, second.blocks);
        assert_eq!(first.total_time_tags(), second.total_time_tags());
    }
}
