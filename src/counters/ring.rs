//! Time trace of count rates: a circular buffer of per-channel bin counts.
//!
//! The live counter publishes a reference-counted snapshot of the most
//! recent completed bins on every rotation, so readers never wait on the
//! measurement mutex for plain data access. `get_data_object` additionally
//! supports atomic polling: with `remove` set, every completed bin is
//! returned exactly once across all calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::warn;

use crate::binning::FastBinner;
use crate::error::{Error, Result};
use crate::measure::{Host, Measure, MeasureCtx, Measurement};
use crate::stream::tag::{Tag, TagKind};

/// Picoseconds per second, the default normalization time scale.
const PS_PER_SECOND: i64 = 1_000_000_000_000;

/// One completed bin column.
struct Bin {
    index: u64,
    counts: Vec<i32>,
    overflow: bool,
}

/// Counter measurement state. Public only as the type parameter of its
/// `Measurement` handle; all access goes through [`Counter`].
pub struct CounterState {
    channels: Arc<[i32]>,
    index_of: HashMap<i32, usize>,
    binwidth: i64,
    n_values: usize,
    binner: FastBinner,

    /// Stream-time anchor of bin index 0; set by the first delivered block
    /// and reset by `clear`.
    origin: Option<i64>,
    /// Index of the currently integrating bin.
    next_bin_index: u64,
    open_counts: Vec<i32>,
    open_overflow: bool,

    completed: VecDeque<Bin>,
    /// First completed bin index not yet taken by a removing reader.
    read_cursor: u64,
    /// Unread bins evicted by ring pressure since the last removing read.
    dropped: u32,

    totals_live: Vec<u64>,
    totals_completed: Vec<u64>,

    in_overflow: bool,
    overflow_any: bool,

    slot: Arc<ArcSwapOption<CounterData>>,
}

impl CounterState {
    fn new(channels: Vec<i32>, binwidth: i64, n_values: usize) -> Self {
        let channels: Arc<[i32]> = channels.into();
        let index_of = channels
            .iter()
            .enumerate()
            .map(|(i, &ch)| (ch, i))
            .collect();
        let n_channels = channels.len();

        Self {
            channels,
            index_of,
            binwidth,
            n_values,
            binner: FastBinner::new(binwidth as u64, i64::MAX as u64),
            origin: None,
            next_bin_index: 0,
            open_counts: vec![0; n_channels],
            open_overflow: false,
            completed: VecDeque::with_capacity(n_values),
            read_cursor: 0,
            dropped: 0,
            totals_live: vec![0; n_channels],
            totals_completed: vec![0; n_channels],
            in_overflow: false,
            overflow_any: false,
            slot: Arc::new(ArcSwapOption::empty()),
        }
    }

    fn advance_to(&mut self, time: i64) {
        let Some(origin) = self.origin else {
            return;
        };

        let idx = self.binner.bin((time - origin) as u64);
        if idx > self.next_bin_index {
            self.rotate_to(idx);
        }
    }

    fn rotate_to(&mut self, target: u64) {
        let n = target - self.next_bin_index;
        let n_channels = self.channels.len();

        if n > self.n_values as u64 {
            // Bulk skip over an idle stretch: the open column and the
            // leading zero bins are all evicted before any reader could
            // take them, so only drop accounting and zero survivors remain.
            for (total, count) in self.totals_completed.iter_mut().zip(&self.open_counts) {
                *total += *count as u64;
            }

            let first_survivor = target - self.n_values as u64;
            let unread = first_survivor - self.read_cursor;
            self.dropped = self
                .dropped
                .saturating_add(u32::try_from(unread).unwrap_or(u32::MAX));
            self.read_cursor = first_survivor;

            self.completed.clear();
            for k in 0..self.n_values as u64 {
                self.completed.push_back(Bin {
                    index: first_survivor + k,
                    counts: vec![0; n_channels],
                    overflow: self.in_overflow,
                });
            }

            self.open_counts.iter_mut().for_each(|c| *c = 0);
            self.open_overflow = self.in_overflow;
            self.next_bin_index = target;
            return;
        }

        for _ in 0..n {
            let counts = std::mem::replace(&mut self.open_counts, vec![0; n_channels]);
            for (total, count) in self.totals_completed.iter_mut().zip(&counts) {
                *total += *count as u64;
            }

            self.completed.push_back(Bin {
                index: self.next_bin_index,
                counts,
                overflow: self.open_overflow,
            });
            self.next_bin_index += 1;
            self.open_overflow = self.in_overflow;

            if self.completed.len() > self.n_values {
                let evicted = self.completed.pop_front().expect("nonempty ring");
                if evicted.index >= self.read_cursor {
                    self.dropped = self.dropped.saturating_add(1);
                    self.read_cursor = evicted.index + 1;
                }
            }
        }
    }

    fn build_data(&self, bins: &[&Bin], dropped: u32) -> CounterData {
        let n_channels = self.channels.len();
        let size = bins.len();

        let mut counts = vec![0i32; n_channels * size];
        let mut overflow_mask = vec![false; size];
        let mut overflow = false;

        for (k, bin) in bins.iter().enumerate() {
            overflow_mask[k] = bin.overflow;
            overflow |= bin.overflow;
            for c in 0..n_channels {
                counts[c * size + k] = bin.counts[c];
            }
        }

        CounterData {
            channels: Arc::clone(&self.channels),
            binwidth: self.binwidth,
            size: size as u32,
            dropped_bins: dropped,
            overflow,
            first_index: bins.first().map(|b| b.index).unwrap_or(self.next_bin_index),
            origin_time: self.origin.unwrap_or(0),
            counts,
            overflow_mask,
            totals: self.totals_completed.clone(),
        }
    }

    fn publish(&self) {
        let bins: Vec<&Bin> = self.completed.iter().collect();
        self.slot.store(Some(Arc::new(self.build_data(&bins, self.dropped))));
    }

    fn take_snapshot(&mut self, remove: bool) -> CounterData {
        let bins: Vec<&Bin> = self
            .completed
            .iter()
            .filter(|b| b.index >= self.read_cursor)
            .collect();
        let data = self.build_data(&bins, self.dropped);

        if remove {
            self.read_cursor = self.next_bin_index;
            self.dropped = 0;
        }

        data
    }
}

impl Measure for CounterState {
    fn on_block(
        &mut self,
        ctx: &mut MeasureCtx<'_>,
        tags: &[Tag],
        begin: i64,
        end: i64,
    ) -> Result<()> {
        if self.origin.is_none() {
            self.origin = Some(begin);
        }
        let bins_before = self.next_bin_index;

        for tag in tags {
            ctx.check_abort()?;

            match tag.kind {
                TagKind::TimeTag => {
                    self.advance_to(tag.time_ps);
                    if let Some(&i) = self.index_of.get(&tag.channel) {
                        self.open_counts[i] += 1;
                        self.totals_live[i] += 1;
                    }
                }
                TagKind::OverflowBegin => {
                    self.advance_to(tag.time_ps);
                    self.in_overflow = true;
                    self.overflow_any = true;
                    self.open_overflow = true;
                }
                TagKind::OverflowEnd => {
                    self.advance_to(tag.time_ps);
                    self.in_overflow = false;
                }
                TagKind::MissedEvents => {
                    if let Some(&i) = self.index_of.get(&tag.channel) {
                        self.open_counts[i] += i32::from(tag.missed_events);
                        self.totals_live[i] += u64::from(tag.missed_events);
                    }
                }
                TagKind::Error => {
                    warn!("error marker in stream; bin marked invalid");
                    self.overflow_any = true;
                    self.open_overflow = true;
                }
            }
        }

        self.advance_to(end);

        if self.next_bin_index != bins_before {
            self.publish();
        }

        Ok(())
    }

    fn clear_impl(&mut self) {
        self.origin = None;
        self.next_bin_index = 0;
        self.open_counts.iter_mut().for_each(|c| *c = 0);
        self.open_overflow = self.in_overflow;
        self.completed.clear();
        self.read_cursor = 0;
        self.dropped = 0;
        self.totals_live.iter_mut().for_each(|t| *t = 0);
        self.totals_completed.iter_mut().for_each(|t| *t = 0);
        self.overflow_any = false;
        self.slot.store(None);
    }
}

/// A simple counter on one or more channels.
///
/// Counts tags per channel within consecutive `binwidth` intervals of
/// stream time and keeps the most recent `n_values` completed bins in a
/// circular buffer.
pub struct Counter {
    m: Measurement<CounterState>,
    slot: Arc<ArcSwapOption<CounterData>>,
    n_values: usize,
    n_channels: usize,
    binwidth: i64,
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("n_values", &self.n_values)
            .field("n_channels", &self.n_channels)
            .field("binwidth", &self.binwidth)
            .finish()
    }
}

impl Counter {
    /// Creates the counter attached to `host` and starts it, unless the
    /// host is a synchronized-group proxy.
    pub fn new<'a>(
        host: impl Into<Host<'a>>,
        channels: Vec<i32>,
        binwidth_ps: i64,
        n_values: usize,
    ) -> Result<Self> {
        if channels.is_empty() {
            return Err(Error::InvalidArgument("channel list is empty"));
        }
        if binwidth_ps <= 0 {
            return Err(Error::InvalidArgument("binwidth must be positive"));
        }
        if n_values == 0 {
            return Err(Error::InvalidArgument("n_values must be at least 1"));
        }
        let distinct: HashSet<i32> = channels.iter().copied().collect();
        if distinct.len() != channels.len() {
            return Err(Error::InvalidArgument("duplicate channel in list"));
        }

        let host = host.into();
        for &ch in &channels {
            host.engine.core().validate_channel(ch)?;
        }

        let state = CounterState::new(channels.clone(), binwidth_ps, n_values);
        let slot = Arc::clone(&state.slot);
        let n_channels = channels.len();

        let m = Measurement::attach(host, state, channels.into_iter().collect(), Vec::new())?;

        Ok(Self {
            m,
            slot,
            n_values,
            n_channels,
            binwidth: binwidth_ps,
        })
    }

    /// The current circular buffer, oldest bin first, zero-filled at the
    /// front while fewer than `n_values` bins have completed. Lock-free.
    pub fn get_data(&self) -> Vec<Vec<i32>> {
        match self.slot.load_full() {
            Some(data) => {
                let size = data.size as usize;
                let pad = self.n_values - size.min(self.n_values);
                (0..self.n_channels)
                    .map(|c| {
                        let mut row = vec![0i32; pad];
                        row.extend((0..size).map(|k| data.counts[c * size + k]));
                        row
                    })
                    .collect()
            }
            None => vec![vec![0; self.n_values]; self.n_channels],
        }
    }

    /// The count rate per bin in Hz. Bins that never completed or were in
    /// overflow are NaN. Lock-free.
    pub fn get_data_normalized(&self) -> Vec<Vec<f64>> {
        let scale = PS_PER_SECOND as f64 / self.binwidth as f64;
        match self.slot.load_full() {
            Some(data) => {
                let size = data.size as usize;
                let pad = self.n_values - size.min(self.n_values);
                (0..self.n_channels)
                    .map(|c| {
                        let mut row = vec![f64::NAN; pad];
                        row.extend((0..size).map(|k| {
                            if data.overflow_mask[k] {
                                f64::NAN
                            } else {
                                f64::from(data.counts[c * size + k]) * scale
                            }
                        }));
                        row
                    })
                    .collect()
            }
            None => vec![vec![f64::NAN; self.n_values]; self.n_channels],
        }
    }

    /// Relative bin start times in picoseconds, one per buffer position.
    pub fn get_index(&self) -> Vec<i64> {
        (0..self.n_values as i64).map(|k| k * self.binwidth).collect()
    }

    /// Total counts per channel since the last clear, including the
    /// currently integrating bin.
    pub fn get_data_total_counts(&self) -> Vec<u64> {
        self.m.with_logic(|s| s.totals_live.clone())
    }

    /// Atomically fetches the most recent completed bins that have not
    /// been removed before. With `remove` set, the internal read cursor
    /// advances so each bin is returned exactly once across all calls.
    ///
    /// Takes the measurement mutex only briefly.
    pub fn get_data_object(&self, remove: bool) -> CounterData {
        self.m.with_logic(|s| s.take_snapshot(remove))
    }
}

impl Deref for Counter {
    type Target = Measurement<CounterState>;

    fn deref(&self) -> &Self::Target {
        &self.m
    }
}

/// Reference-counted snapshot of completed counter bins.
///
/// Snapshots outlive the counter they came from; clients may hold them
/// across buffer rotations or after the measurement is gone.
pub struct CounterData {
    channels: Arc<[i32]>,
    binwidth: i64,
    size: u32,
    dropped_bins: u32,
    overflow: bool,
    first_index: u64,
    origin_time: i64,
    /// Channel-major `channels x size` counts.
    counts: Vec<i32>,
    overflow_mask: Vec<bool>,
    totals: Vec<u64>,
}

impl CounterData {
    /// Number of returned bins.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Completed bins evicted by ring pressure before a read could take
    /// them.
    pub fn dropped_bins(&self) -> u32 {
        self.dropped_bins
    }

    /// Whether any returned bin was inside an overflow interval.
    pub fn overflow(&self) -> bool {
        self.overflow
    }

    /// Counts per channel and bin, oldest bin first.
    pub fn get_data(&self) -> Vec<Vec<i32>> {
        let size = self.size as usize;
        (0..self.channels.len())
            .map(|c| (0..size).map(|k| self.counts[c * size + k]).collect())
            .collect()
    }

    /// Counts normalized to `time_scale` picoseconds; 1 s gives Hz.
    /// Overflow bins are NaN. A non-positive scale normalizes per bin.
    pub fn get_frequency(&self, time_scale_ps: i64) -> Vec<Vec<f64>> {
        let scale = if time_scale_ps > 0 {
            time_scale_ps as f64 / self.binwidth as f64
        } else {
            1.0
        };

        let size = self.size as usize;
        (0..self.channels.len())
            .map(|c| {
                (0..size)
                    .map(|k| {
                        if self.overflow_mask[k] {
                            f64::NAN
                        } else {
                            f64::from(self.counts[c * size + k]) * scale
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Average count rate per bin in Hz.
    pub fn get_data_normalized(&self) -> Vec<Vec<f64>> {
        self.get_frequency(PS_PER_SECOND)
    }

    /// Total counts per channel since the last clear, up to the most
    /// recent completed bin.
    pub fn get_data_total_counts(&self) -> Vec<u64> {
        self.totals.clone()
    }

    /// Bin start offsets relative to the measurement origin.
    pub fn get_index(&self) -> Vec<i64> {
        (0..u64::from(self.size))
            .map(|k| (self.first_index + k) as i64 * self.binwidth)
            .collect()
    }

    /// Absolute stream-time start of each bin.
    pub fn get_time(&self) -> Vec<i64> {
        (0..u64::from(self.size))
            .map(|k| self.origin_time + (self.first_index + k) as i64 * self.binwidth)
            .collect()
    }

    /// Per-bin overflow flags.
    pub fn get_overflow_mask(&self) -> Vec<bool> {
        self.overflow_mask.clone()
    }

    /// The configured channel list.
    pub fn get_channels(&self) -> Vec<i32> {
        self.channels.to_vec()
    }
}
