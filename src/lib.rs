//! Host-side streaming runtime for single-photon time-tagging instruments.
//!
//! A producer (hardware driver, file replay, network client) pushes ordered
//! blocks of timestamped edge events through a [`StreamInput`]. The
//! [`Engine`] fans every block out to an arbitrary, dynamic set of
//! measurements, each with independent lifecycle and result state, while
//! fences connect configuration changes to known points in the stream.
//!
//! Measurements implement the [`Measure`] trait; stream transforms such as
//! [`Combiner`] or [`Coincidences`] additionally inject synthesized tags on
//! virtual channels that downstream measurements consume like physical
//! ones.

pub mod binning;
pub mod channels;
pub mod config;
pub mod counters;
pub mod engine;
pub mod error;
pub(crate) mod fence;
pub mod measure;
pub(crate) mod runner;
pub mod stream;
pub mod telemetry;
pub mod vchan;

pub use binning::{BinMode, FastBinner};
pub use channels::{NumberingScheme, VIRTUAL_CHANNEL_BASE};
pub use config::EngineConfig;
pub use counters::ring::{Counter, CounterData};
pub use engine::{ChannelToggleFn, Engine};
pub use error::{Error, Result};
pub use measure::barrier::{OrderTicket, OrderedBarrier, OrderedPipeline};
pub use measure::group::SyncGroup;
pub use measure::{Host, Measure, MeasureCtx, Measurement};
pub use stream::block::TagBlock;
pub use stream::source::{ReplaySource, StreamInput};
pub use stream::tag::{Tag, TagKind, CHANNEL_UNUSED};
pub use telemetry::StatsSnapshot;
pub use vchan::coincidence::{Coincidence, Coincidences, TimestampPolicy};
pub use vchan::combiner::Combiner;
pub use vchan::delayed::DelayedChannel;
pub use vchan::gated::{GateState, GatedChannel};
