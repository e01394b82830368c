use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::stream::tag::CHANNEL_UNUSED;

/// First identifier of the reserved virtual channel range.
pub const VIRTUAL_CHANNEL_BASE: i32 = 1 << 30;

/// Physical channel numbering scheme, fixed per producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberingScheme {
    /// Rising edges are `0..n`, falling edges `n..2n`.
    ZeroBased,
    /// Rising edges are `1..=n`, falling edges `-1..=-n`.
    OneBased,
}

/// Tracks which physical channels are in use, dedup-counted across
/// measurements, and allocates virtual channel identifiers for derived
/// streams.
///
/// The producer is asked to enable a physical channel only on the 0 to 1
/// transition of its use count and to disable it only on the 1 to 0
/// transition; the registry reports those transitions to its caller.
pub(crate) struct ChannelRegistry {
    scheme: NumberingScheme,
    inputs: i32,
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    use_counts: HashMap<i32, u32>,
    live_virtuals: HashSet<i32>,
    free_virtuals: Vec<i32>,
    next_virtual: i32,
}

impl ChannelRegistry {
    pub(crate) fn new(scheme: NumberingScheme, inputs: u32) -> Self {
        Self {
            scheme,
            inputs: inputs as i32,
            inner: Mutex::new(RegistryInner {
                use_counts: HashMap::new(),
                live_virtuals: HashSet::new(),
                free_virtuals: Vec::new(),
                next_virtual: VIRTUAL_CHANNEL_BASE,
            }),
        }
    }

    /// Whether the channel is a physical channel of the configured scheme.
    pub(crate) fn is_physical(&self, channel: i32) -> bool {
        match self.scheme {
            NumberingScheme::ZeroBased => (0..2 * self.inputs).contains(&channel),
            NumberingScheme::OneBased => {
                (1..=self.inputs).contains(&channel) || (-self.inputs..=-1).contains(&channel)
            }
        }
    }

    /// Whether the channel is in the virtual range.
    pub(crate) fn is_virtual(channel: i32) -> bool {
        channel >= VIRTUAL_CHANNEL_BASE
    }

    /// Validates that a channel is physical or a live virtual channel.
    pub(crate) fn validate(&self, channel: i32) -> Result<()> {
        if self.is_physical(channel) {
            return Ok(());
        }

        if Self::is_virtual(channel) && self.inner.lock().live_virtuals.contains(&channel) {
            return Ok(());
        }

        Err(Error::InvalidChannel(channel))
    }

    /// Increments the use count. Returns true on the 0 to 1 transition of a
    /// physical channel, meaning the producer must enable it.
    pub(crate) fn register(&self, channel: i32) -> Result<bool> {
        self.validate(channel)?;

        let mut inner = self.inner.lock();
        let count = inner.use_counts.entry(channel).or_insert(0);
        *count += 1;

        Ok(*count == 1 && self.is_physical(channel))
    }

    /// Decrements the use count. Returns true on the 1 to 0 transition of a
    /// physical channel, meaning the producer must disable it.
    pub(crate) fn unregister(&self, channel: i32) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(count) = inner.use_counts.get_mut(&channel) else {
            return Err(Error::NotRegistered(channel));
        };

        if *count == 0 {
            return Err(Error::NotRegistered(channel));
        }

        *count -= 1;
        if *count == 0 {
            inner.use_counts.remove(&channel);
            return Ok(self.is_physical(channel));
        }

        Ok(false)
    }

    /// Allocates an identifier from the reserved virtual range, recycling
    /// released ones.
    pub(crate) fn alloc_virtual(&self) -> i32 {
        let mut inner = self.inner.lock();
        let channel = inner.free_virtuals.pop().unwrap_or_else(|| {
            let ch = inner.next_virtual;
            inner.next_virtual += 1;
            ch
        });
        inner.live_virtuals.insert(channel);
        debug!(channel, "virtual channel allocated");
        channel
    }

    /// Releases a virtual channel back to the allocator.
    pub(crate) fn release_virtual(&self, channel: i32) {
        let mut inner = self.inner.lock();
        if inner.live_virtuals.remove(&channel) {
            inner.use_counts.remove(&channel);
            inner.free_virtuals.push(channel);
            debug!(channel, "virtual channel released");
        }
    }

    /// The falling channel id for a rising channel and vice versa.
    ///
    /// Virtual channels have no inverted counterpart; `CHANNEL_UNUSED` is
    /// returned for them. Out-of-scheme channels are an error.
    pub(crate) fn inverted(&self, channel: i32) -> Result<i32> {
        if Self::is_virtual(channel) {
            let live = self.inner.lock().live_virtuals.contains(&channel);
            return if live {
                Ok(CHANNEL_UNUSED)
            } else {
                Err(Error::InvalidChannel(channel))
            };
        }

        if !self.is_physical(channel) {
            return Err(Error::InvalidChannel(channel));
        }

        Ok(match self.scheme {
            NumberingScheme::ZeroBased => {
                if channel < self.inputs {
                    channel + self.inputs
                } else {
                    channel - self.inputs
                }
            }
            NumberingScheme::OneBased => -channel,
        })
    }

    /// Current use count of a channel, for tests and diagnostics.
    #[cfg(test)]
    fn use_count(&self, channel: i32) -> u32 {
        self.inner
            .lock()
            .use_counts
            .get(&channel)
            .copied()
            .unwrap_or(0)
    }
}
