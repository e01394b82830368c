//! Retimed clones of input channels.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;

use tracing::warn;

use crate::error::{Error, Result};
use crate::measure::{Host, Measure, MeasureCtx, Measurement};
use crate::stream::tag::{Tag, TagKind};
use crate::vchan::merge_emissions;

/// Delayed-channel state: a first-in first-out queue of retimed tags that
/// have not yet reached their emission block.
pub struct DelayedState {
    out_of: HashMap<i32, i32>,
    delay: i64,
    pending: VecDeque<Tag>,
}

impl DelayedState {
    /// Changes the delay for all future tags.
    ///
    /// A strictly shorter delay flushes the queue: tags retimed under the
    /// old delay are dropped and never appear on the virtual channel. Equal
    /// or longer delays keep the queue intact.
    fn set_delay(&mut self, delay: i64) {
        if delay < self.delay && !self.pending.is_empty() {
            warn!(
                dropped = self.pending.len(),
                old_delay = self.delay,
                new_delay = delay,
                "delay reduced; queued tags dropped",
            );
            self.pending.clear();
        }
        self.delay = delay;
    }
}

impl Measure for DelayedState {
    fn edit_block(
        &mut self,
        ctx: &mut MeasureCtx<'_>,
        tags: &mut Vec<Tag>,
        _begin: i64,
        end: i64,
    ) -> Result<bool> {
        let mut emissions = Vec::new();

        // Queued tags whose emission time falls inside this block go first.
        while let Some(&front) = self.pending.front() {
            if front.time_ps >= end {
                break;
            }
            self.pending.pop_front();
            emissions.push(front);
        }

        let mut fresh = Vec::new();
        for tag in tags.iter() {
            ctx.check_abort()?;

            if tag.kind != TagKind::TimeTag {
                continue;
            }
            let Some(&out) = self.out_of.get(&tag.channel) else {
                continue;
            };

            let shifted = Tag::time_tag(tag.time_ps + self.delay, out);
            if shifted.time_ps < end {
                fresh.push(shifted);
            } else {
                self.pending.push_back(shifted);
            }
        }

        // Both emission runs are individually sorted; interleave them.
        if !fresh.is_empty() {
            emissions = merge_sorted(emissions, fresh);
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
        self.pending.clear();
    }
}

fn merge_sorted(a: Vec<Tag>, b: Vec<Tag>) -> Vec<Tag> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();

    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => {
                if x.time_ps <= y.time_ps {
                    merged.push(a.next().expect("peeked"));
                } else {
                    merged.push(b.next().expect("peeked"));
                }
            }
            (Some(_), None) => merged.extend(a.by_ref()),
            (None, Some(_)) => merged.extend(b.by_ref()),
            (None, None) => break,
        }
    }

    merged
}

/// Clones one or more input channels onto virtual channels with all
/// timestamps shifted by a delay.
pub struct DelayedChannel {
    m: Measurement<DelayedState>,
    channels: Vec<i32>,
}

impl DelayedChannel {
    /// Delays a single input channel.
    pub fn new<'a>(host: impl Into<Host<'a>>, input: i32, delay_ps: i64) -> Result<Self> {
        Self::new_multi(host, vec![input], delay_ps)
    }

    /// Delays several input channels at once, one virtual channel each.
    pub fn new_multi<'a>(
        host: impl Into<Host<'a>>,
        inputs: Vec<i32>,
        delay_ps: i64,
    ) -> Result<Self> {
        if inputs.is_empty() {
            return Err(Error::InvalidArgument("channel list is empty"));
        }

        let host = host.into();
        let core = host.engine.core();
        for &ch in &inputs {
            core.validate_channel(ch)?;
        }

        let outs: Vec<i32> = inputs.iter().map(|_| core.alloc_virtual()).collect();
        let state = DelayedState {
            out_of: inputs.iter().copied().zip(outs.iter().copied()).collect(),
            delay: delay_ps,
            pending: VecDeque::new(),
        };

        let m = Measurement::attach(host, state, inputs.into_iter().collect(), outs.clone())?;
        Ok(Self { m, channels: outs })
    }

    /// The first allocated virtual channel.
    pub fn get_channel(&self) -> i32 {
        self.channels[0]
    }

    /// All allocated virtual channels, in input order.
    pub fn get_channels(&self) -> Vec<i32> {
        self.channels.clone()
    }

    /// Changes the delay. Strictly shorter delays flush queued tags; see
    /// [`DelayedState::set_delay`].
    pub fn set_delay(&self, delay_ps: i64) {
        self.m.with_logic(|s| s.set_delay(delay_ps));
    }
}

impl Deref for DelayedChannel {
    type Target = Measurement<DelayedState>;

    fn deref(&self) -> &Self::Target {
        &self.m
    }
}
