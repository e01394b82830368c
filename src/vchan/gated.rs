//! An input channel gated by open and close channels.

use std::ops::Deref;

use crate::error::{Error, Result};
use crate::measure::{Host, Measure, MeasureCtx, Measurement};
use crate::stream::tag::{Tag, TagKind};
use crate::vchan::merge_emissions;

/// Initial state of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateState {
    #[default]
    Closed,
    Open,
}

/// Gated-channel state. The gate is edge sensitive: only transitions seen
/// on the open and close channels change it, never a level.
pub struct GatedState {
    input: i32,
    open_channel: i32,
    close_channel: i32,
    out: i32,
    initial: GateState,
    open: bool,
}

impl Measure for GatedState {
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

            if tag.kind != TagKind::TimeTag {
                continue;
            }

            if tag.channel == self.open_channel {
                self.open = true;
            } else if tag.channel == self.close_channel {
                self.open = false;
            } else if tag.channel == self.input && self.open {
                emissions.push(Tag::time_tag(tag.time_ps, self.out));
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
        self.open = self.initial == GateState::Open;
    }
}

/// Forwards an input channel onto a virtual channel only while the gate is
/// open.
pub struct GatedChannel {
    m: Measurement<GatedState>,
    channel: i32,
}

impl GatedChannel {
    pub fn new<'a>(
        host: impl Into<Host<'a>>,
        input: i32,
        open_channel: i32,
        close_channel: i32,
        initial: GateState,
    ) -> Result<Self> {
        if input == open_channel || input == close_channel || open_channel == close_channel {
            return Err(Error::InvalidArgument(
                "input, open and close channels must be distinct",
            ));
        }

        let host = host.into();
        let core = host.engine.core();
        for ch in [input, open_channel, close_channel] {
            core.validate_channel(ch)?;
        }

        let out = core.alloc_virtual();
        let state = GatedState {
            input,
            open_channel,
            close_channel,
            out,
            initial,
            open: initial == GateState::Open,
        };

        let m = Measurement::attach(
            host,
            state,
            [input, open_channel, close_channel].into_iter().collect(),
            vec![out],
        )?;

        Ok(Self { m, channel: out })
    }

    /// The allocated virtual channel.
    pub fn get_channel(&self) -> i32 {
        self.channel
    }
}

impl Deref for GatedChannel {
    type Target = Measurement<GatedState>;

    fn deref(&self) -> &Self::Target {
        &self.m
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    fn state(initial: GateState) -> GatedState {
        GatedState {
            input: 1,
            open_channel: 2,
            close_channel: 3,
            out: 9,
            initial,
            open: initial == GateState::Open,
        }
    }

    fn edit(s: &mut GatedState, tags: &mut Vec<Tag>) -> bool {
        let aborting = AtomicBool::new(false);
        let mut ctx = MeasureCtx::new(&aborting);
        s.edit_block(&mut ctx, tags, 0, 1_000).expect("edit")
    }

    #[test]
    fn test_gate_opens_and_closes() {
        let mut s = state(GateState::Closed);
        let mut tags = vec![
            Tag::time_tag(100, 1),
            Tag::time_tag(200, 2),
            Tag::time_tag(300, 1),
            Tag::time_tag(400, 3),
            Tag::time_tag(500, 1),
        ];

        assert!(edit(&mut s, &mut tags));
        let out: Vec<i64> = tags
            .iter()
            .filter(|t| t.channel == 9)
            .map(|t| t.time_ps)
            .collect();
        assert_eq!(out, vec![300]);
    }

    #[test]
    fn test_initially_open_gate() {
        let mut s = state(GateState::Open);
        let mut tags = vec![Tag::time_tag(100, 1), Tag::time_tag(200, 3), Tag::time_tag(300, 1)];

        assert!(edit(&mut s, &mut tags));
        let out: Vec<i64> = tags
            .iter()
            .filter(|t| t.channel == 9)
            .map(|t| t.time_ps)
            .collect();
        assert_eq!(out, vec![100]);
    }

    #[test]
    fn test_state_carries_across_blocks() {
        let mut s = state(GateState::Closed);
        let mut first = vec![Tag::time_tag(100, 2)];
        assert!(!edit(&mut s, &mut first));

        let mut second = vec![Tag::time_tag(1_100, 1)];
        assert!(edit(&mut s, &mut second));
        assert_eq!(second.iter().filter(|t| t.channel == 9).count(), 1);
    }

    #[test]
    fn test_clear_restores_initial_state() {
        let mut s = state(GateState::Closed);
        let mut tags = vec![Tag::time_tag(100, 2)];
        edit(&mut s, &mut tags);
        assert!(s.open);

        s.clear_impl();
        assert!(!s.open);
    }

    #[test]
    fn test_repeated_open_edges_are_idempotent() {
        let mut s = state(GateState::Closed);
        let mut tags = vec![
            Tag::time_tag(100, 2),
            Tag::time_tag(200, 2),
            Tag::time_tag(300, 1),
        ];
        assert!(edit(&mut s, &mut tags));
        assert_eq!(tags.iter().filter(|t| t.channel == 9).count(), 1);
    }
}
