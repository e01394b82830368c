//! Fan-in of several channels into one virtual channel.

use std::collections::HashMap;
use std::ops::Deref;

use crate::error::{Error, Result};
use crate::measure::{Host, Measure, MeasureCtx, Measurement};
use crate::stream::tag::{Tag, TagKind};
use crate::vchan::merge_emissions;

/// Combiner state: one output tag per input tag, with per-source counts
/// kept for telemetry.
pub struct CombinerState {
    index_of: HashMap<i32, usize>,
    counts: Vec<u64>,
    out: i32,
}

impl Measure for CombinerState {
    fn edit_block(
        &mut self,
        ctx: &mut MeasureCtx<'_>,
        tags: &mut Vec<Tag>,
        _begin: i64,
        _end: i64,
    ) -> Result<bool> {
        let mut emissions = Vec::new();

        for tag in tags.iter() {
            ctx.check_abort()?;

            if tag.kind == TagKind::TimeTag {
                if let Some(&i) = self.index_of.get(&tag.channel) {
                    self.counts[i] += 1;
                    emissions.push(Tag::time_tag(tag.time_ps, self.out));
                }
            }
        }

        if emissions.is_empty() {
            return Ok(false);
        }

        merge_emissions(tags, emissions);
        Ok(true)
    }

    fn edits_stream(&self) -> bool {
        true
    }

    fn clear_impl(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }
}

/// Combines channels into a virtual channel that ticks for each tick on
/// any input channel.
pub struct Combiner {
    m: Measurement<CombinerState>,
    channel: i32,
}

impl Combiner {
    pub fn new<'a>(host: impl Into<Host<'a>>, channels: Vec<i32>) -> Result<Self> {
        if channels.is_empty() {
            return Err(Error::InvalidArgument("channel list is empty"));
        }

        let host = host.into();
        let core = host.engine.core();
        for &ch in &channels {
            core.validate_channel(ch)?;
        }

        let out = core.alloc_virtual();
        let state = CombinerState {
            index_of: channels.iter().enumerate().map(|(i, &ch)| (ch, i)).collect(),
            counts: vec![0; channels.len()],
            out,
        };

        let m = Measurement::attach(host, state, channels.into_iter().collect(), vec![out])?;
        Ok(Self { m, channel: out })
    }

    /// The allocated virtual channel.
    pub fn get_channel(&self) -> i32 {
        self.channel
    }

    /// How many output ticks each input channel contributed.
    pub fn channel_counts(&self) -> Vec<u64> {
        self.m.with_logic(|s| s.counts.clone())
    }
}

impl Deref for Combiner {
    type Target = Measurement<CombinerState>;

    fn deref(&self) -> &Self::Target {
        &self.m
    }
}
