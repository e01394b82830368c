use std::fmt;

/// Magic channel value meaning "no channel". Measurements either reject it
/// or substitute their default. Virtual channels never alias it.
pub const CHANNEL_UNUSED: i32 = -134_217_728;

/// TagKind identifies what a stream record represents.
///
/// Everything except `TimeTag` is a stream marker: markers carry stream
/// state (processing errors, overflow intervals, missed-event counts)
/// rather than an edge event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TagKind {
    /// A normal edge event on an input or virtual channel.
    TimeTag = 0,
    /// An error in the data processing; invalidates the global time.
    Error = 1,
    /// Start of an interval with incomplete data due to input pressure.
    OverflowBegin = 2,
    /// End of the interval; all events lost inside it have been accounted.
    OverflowEnd = 3,
    /// Synthetic record carrying the number of events lost per channel
    /// within an overflow interval. May repeat per interval and channel.
    MissedEvents = 4,
}

/// Maximum TagKind value, used for array sizing.
pub const MAX_TAG_KIND: usize = 4;

impl TagKind {
    /// Returns the canonical log label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimeTag => "time_tag",
            Self::Error => "error",
            Self::OverflowBegin => "overflow_begin",
            Self::OverflowEnd => "overflow_end",
            Self::MissedEvents => "missed_events",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::TimeTag),
            1 => Some(Self::Error),
            2 => Some(Self::OverflowBegin),
            3 => Some(Self::OverflowEnd),
            4 => Some(Self::MissedEvents),
            _ => None,
        }
    }

    /// Return all kinds in numeric order.
    pub fn all() -> &'static [Self] {
        &[
            Self::TimeTag,
            Self::Error,
            Self::OverflowBegin,
            Self::OverflowEnd,
            Self::MissedEvents,
        ]
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single record in the time-tag stream: an edge event on a channel at a
/// picosecond timestamp, or a stream marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// What this record represents.
    pub kind: TagKind,
    /// Events lost on `channel` inside the current overflow interval.
    /// Only meaningful for `MissedEvents` records.
    pub missed_events: u16,
    /// The channel number.
    pub channel: i32,
    /// Timestamp in picoseconds on the common timebase.
    pub time_ps: i64,
}

impl Tag {
    /// A normal edge event.
    pub fn time_tag(time_ps: i64, channel: i32) -> Self {
        Self {
            kind: TagKind::TimeTag,
            missed_events: 0,
            channel,
            time_ps,
        }
    }

    /// A stream marker without a missed-event count.
    pub fn marker(kind: TagKind, time_ps: i64) -> Self {
        Self {
            kind,
            missed_events: 0,
            channel: CHANNEL_UNUSED,
            time_ps,
        }
    }

    /// A missed-events record for `channel`.
    pub fn missed(time_ps: i64, channel: i32, missed_events: u16) -> Self {
        Self {
            kind: TagKind::MissedEvents,
            missed_events,
            channel,
            time_ps,
        }
    }
}
