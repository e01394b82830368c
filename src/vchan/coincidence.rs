//! Coincidence monitoring across channel groups.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;

use crate::error::{Error, Result};
use crate::measure::{Host, Measure, MeasureCtx, Measurement};
use crate::stream::tag::{Tag, TagKind};
use crate::vchan::merge_emissions;

/// Which timestamp the emitted coincidence tag carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampPolicy {
    /// Time of the tag completing the coincidence. Cheapest.
    #[default]
    Last,
    /// Integer mean of the covering tags, truncated toward zero.
    Average,
    /// Earliest time among the covering tags.
    First,
    /// Time of the first channel in the group as listed at construction.
    ListedFirst,
}

struct Group {
    channels: Vec<i32>,
    out: i32,
    last_seen: HashMap<i32, i64>,
}

impl Group {
    /// Handles a member tag. Returns the emission time if the group fires.
    ///
    /// A fire consumes the covering. A member tag arriving while some
    /// recorded member lies outside the window also spends the covering:
    /// the state clears and the incoming tag is not recorded, so re-firing
    /// needs fresh events on the group.
    fn feed(&mut self, channel: i32, time: i64, window: i64, policy: TimestampPolicy) -> Option<i64> {
        let mut complete = true;
        let mut stale = false;

        for &member in &self.channels {
            if member == channel {
                continue;
            }
            match self.last_seen.get(&member) {
                Some(&seen) if time - seen <= window => {}
                Some(_) => stale = true,
                None => complete = false,
            }
        }

        if stale {
            self.last_seen.clear();
            return None;
        }

        if !complete {
            self.last_seen.insert(channel, time);
            return None;
        }

        let emission = match policy {
            TimestampPolicy::Last => time,
            TimestampPolicy::First => self
                .channels
                .iter()
                .map(|m| if *m == channel { time } else { self.last_seen[m] })
                .min()
                .unwrap_or(time),
            TimestampPolicy::Average => {
                let sum: i64 = self
                    .channels
                    .iter()
                    .map(|m| if *m == channel { time } else { self.last_seen[m] })
                    .sum();
                sum / self.channels.len() as i64
            }
            TimestampPolicy::ListedFirst => {
                let first = self.channels[0];
                if first == channel {
                    time
                } else {
                    self.last_seen[&first]
                }
            }
        };

        self.last_seen.clear();
        Some(emission)
    }
}

/// Coincidences state: per-group last-seen bookkeeping over a shared
/// window.
pub struct CoincidencesState {
    groups: Vec<Group>,
    monitored: HashSet<i32>,
    window: i64,
    policy: TimestampPolicy,
}

impl Measure for CoincidencesState {
    fn edit_block(
        &mut self,
        ctx: &mut MeasureCtx<'_>,
        tags: &mut Vec<Tag>,
        _begin: i64,
        _end: i64,
    ) -> Result<bool> {
        let mut emissions = Vec::new();
        let (window, policy) = (self.window, self.policy);

        for tag in tags.iter() {
            ctx.check_abort()?;

            if tag.kind != TagKind::TimeTag || !self.monitored.contains(&tag.channel) {
                continue;
            }

            for group in &mut self.groups {
                if !group.channels.contains(&tag.channel) {
                    continue;
                }
                if let Some(time) = group.feed(tag.channel, tag.time_ps, window, policy) {
                    emissions.push(Tag::time_tag(time, group.out));
                }
            }
        }

        if emissions.is_empty() {
            return Ok(false);
        }

        // Policies other than Last can emit behind the trigger tag, so
        // successive emissions are not necessarily ordered.
        emissions.sort_by_key(|t| t.time_ps);
        merge_emissions(tags, emissions);
        Ok(true)
    }

    fn edits_stream(&self) -> bool {
        true
    }

    fn clear_impl(&mut self) {
        for group in &mut self.groups {
            group.last_seen.clear();
        }
    }
}

/// A coincidence monitor for many channel groups sharing one window.
pub struct Coincidences {
    m: Measurement<CoincidencesState>,
    channels: Vec<i32>,
}

impl Coincidences {
    pub fn new<'a>(
        host: impl Into<Host<'a>>,
        groups: Vec<Vec<i32>>,
        window_ps: i64,
        policy: TimestampPolicy,
    ) -> Result<Self> {
        if groups.is_empty() {
            return Err(Error::InvalidArgument("no coincidence groups given"));
        }
        if window_ps <= 0 {
            return Err(Error::InvalidArgument("coincidence window must be positive"));
        }
        for group in &groups {
            if group.is_empty() {
                return Err(Error::InvalidArgument("empty coincidence group"));
            }
            let distinct: HashSet<i32> = group.iter().copied().collect();
            if distinct.len() != group.len() {
                return Err(Error::InvalidArgument("duplicate channel in group"));
            }
        }

        let host = host.into();
        let core = host.engine.core();

        let monitored: HashSet<i32> = groups.iter().flatten().copied().collect();
        for &ch in &monitored {
            core.validate_channel(ch)?;
        }

        let mut outs = Vec::with_capacity(groups.len());
        let group_states: Vec<Group> = groups
            .into_iter()
            .map(|channels| {
                let out = core.alloc_virtual();
                outs.push(out);
                Group {
                    channels,
                    out,
                    last_seen: HashMap::new(),
                }
            })
            .collect();

        let state = CoincidencesState {
            groups: group_states,
            monitored: monitored.clone(),
            window: window_ps,
            policy,
        };

        let m = Measurement::attach(host, state, monitored.into_iter().collect(), outs.clone())?;
        Ok(Self { m, channels: outs })
    }

    /// The virtual channels, one per coincidence group, in group order.
    pub fn get_channels(&self) -> Vec<i32> {
        self.channels.clone()
    }

    /// Changes the coincidence window for future tags.
    pub fn set_coincidence_window(&self, window_ps: i64) {
        self.m.with_logic(|s| s.window = window_ps);
    }
}

impl Deref for Coincidences {
    type Target = Measurement<CoincidencesState>;

    fn deref(&self) -> &Self::Target {
        &self.m
    }
}

/// A coincidence monitor for a single channel group.
pub struct Coincidence {
    inner: Coincidences,
}

impl Coincidence {
    pub fn new<'a>(
        host: impl Into<Host<'a>>,
        channels: Vec<i32>,
        window_ps: i64,
        policy: TimestampPolicy,
    ) -> Result<Self> {
        Ok(Self {
            inner: Coincidences::new(host, vec![channels], window_ps, policy)?,
        })
    }

    /// The virtual channel carrying the coincidences.
    pub fn get_channel(&self) -> i32 {
        self.inner.channels[0]
    }
}

impl Deref for Coincidence {
    type Target = Coincidences;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
