//! Constant-divisor binning for the histogram-class hot loops.
//!
//! Mapping a picosecond duration to a bin index is a division by a divisor
//! that is fixed for the lifetime of a measurement. `FastBinner` picks the
//! cheapest evaluation strategy once, at construction, for a declared input
//! range; the per-tag path is then a single match on the sealed variant,
//! which lowers to a jump table.

/// Evaluation strategy selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinMode {
    /// The divisor exceeds the maximum duration; every input maps to 0.
    ConstZero,
    /// Divisor 1; the duration is the bin index.
    Dividend,
    /// Power-of-two divisor; a right shift.
    PowerOfTwo,
    /// Fixed-point multiply with a 32-bit factor, product fits 64 bits.
    FixedPoint32,
    /// Fixed-point multiply taking the high 64 bits of a 128-bit product.
    FixedPoint64,
    /// Plain 32-bit division; both operands fit in 32 bits.
    Divide32,
    /// Fallback 64-bit division.
    Divide64,
}

/// Exact `duration / divisor` over `[0, max_duration]`, variant sealed at
/// construction time.
#[derive(Debug, Clone, Copy)]
pub struct FastBinner {
    divisor: u64,
    max_duration: u64,
    factor: u64,
    shift: u32,
    mode: BinMode,
}

impl FastBinner {
    /// Selects the cheapest variant that is exact for every duration in
    /// `[0, max_duration]`.
    ///
    /// The divisor must be nonzero.
    pub fn new(divisor: u64, max_duration: u64) -> Self {
        assert!(divisor > 0, "binning divisor must be nonzero");

        let mut binner = Self {
            divisor,
            max_duration,
            factor: 0,
            shift: 0,
            mode: BinMode::Divide64,
        };

        if divisor > max_duration {
            binner.mode = BinMode::ConstZero;
        } else if divisor == 1 {
            binner.mode = BinMode::Dividend;
        } else if divisor.is_power_of_two() {
            binner.shift = divisor.trailing_zeros();
            binner.mode = BinMode::PowerOfTwo;
        } else if let Some(factor) = fixed_point_factor(divisor, max_duration, 32) {
            binner.factor = factor;
            binner.mode = BinMode::FixedPoint32;
        } else if let Some(factor) = fixed_point_factor(divisor, max_duration, 64) {
            binner.factor = factor;
            binner.mode = BinMode::FixedPoint64;
        } else if divisor <= u64::from(u32::MAX) && max_duration <= u64::from(u32::MAX) {
            binner.mode = BinMode::Divide32;
        }

        binner
    }

    /// The sealed variant.
    pub fn mode(&self) -> BinMode {
        self.mode
    }

    /// The configured divisor.
    pub fn divisor(&self) -> u64 {
        self.divisor
    }

    /// Maps a duration to its bin index.
    #[inline]
    pub fn bin(&self, duration: u64) -> u64 {
        debug_assert!(duration <= self.max_duration, "duration outside range");

        let out = match self.mode {
            BinMode::ConstZero => 0,
            BinMode::Dividend => duration,
            BinMode::PowerOfTwo => duration >> self.shift,
            BinMode::FixedPoint32 => (duration * self.factor) >> 32,
            BinMode::FixedPoint64 => mul_high(duration, self.factor),
            BinMode::Divide32 => u64::from(duration as u32 / self.divisor as u32),
            BinMode::Divide64 => duration / self.divisor,
        };

        debug_assert_eq!(out, duration / self.divisor);
        out
    }
}

/// High 64 bits of the 128-bit product.
#[inline]
fn mul_high(a: u64, b: u64) -> u64 {
    ((u128::from(a) * u128::from(b)) >> 64) as u64
}

/// Fixed-point factor `floor(2^k / divisor) + 1` if it is exact over the
/// range and representable for the given variant, else None.
///
/// With `e = factor * divisor - 2^k`, the truncated multiply equals the
/// true quotient for every `x <= max_duration` iff `max_duration * e < 2^k`.
fn fixed_point_factor(divisor: u64, max_duration: u64, k: u32) -> Option<u64> {
    let one = 1u128 << k;
    let factor = one / u128::from(divisor) + 1;
    let error = factor * u128::from(divisor) - one;

    if u128::from(max_duration) * error >= one {
        return None;
    }

    if k == 32 {
        // The product must fit 64 bits and the factor 32 bits.
        if factor > u128::from(u32::MAX) {
            return None;
        }
        if u128::from(max_duration) * factor > u128::from(u64::MAX) {
            return None;
        }
    } else if factor > u128::from(u64::MAX) {
        return None;
    }

    Some(factor as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS_PER_SECOND: u64 = 1_000_000_000_000;

    #[test]
    fn test_mode_selection() {
        assert_eq!(FastBinner::new(1, PS_PER_SECOND).mode(), BinMode::Dividend);
        assert_eq!(
            FastBinner::new(1024, PS_PER_SECOND).mode(),
            BinMode::PowerOfTwo,
        );
        assert_eq!(
            FastBinner::new(1000, PS_PER_SECOND).mode(),
            BinMode::FixedPoint64,
        );
        assert_eq!(
            FastBinner::new(1_000_000_000_000_000, PS_PER_SECOND).mode(),
            BinMode::ConstZero,
        );
    }

    #[test]
    fn test_fixed_point_32_selected_for_small_ranges() {
        // Small range keeps the 32-bit fixed-point variant exact.
        let binner = FastBinner::new(1000, 1_000_000);
        assert_eq!(binner.mode(), BinMode::FixedPoint32);
    }

    #[test]
    fn test_near_32bit_boundary() {
        // A divisor just below 2^32 defeats the 32-bit fixed point but the
        // 64-bit factor stays exact over a 32-bit range.
        let divisor = (1u64 << 32) - 1;
        let max = (1u64 << 32) - 1;
        let binner = FastBinner::new(divisor, max);
        assert_eq!(binner.mode(), BinMode::FixedPoint64);
        assert_eq!(binner.bin(max), 1);
        assert_eq!(binner.bin(max - 1), 0);
    }

    #[test]
    fn test_exact_over_boundaries() {
        for divisor in [2u64, 3, 7, 10, 1000, 4096, 999_983] {
            for max in [divisor, divisor * 5, 1_000_000, PS_PER_SECOND] {
                let binner = FastBinner::new(divisor, max);
                // Check around every multiple of the divisor within a window
                // plus the range ends.
                let mut probes = vec![0, 1, max / 2, max - 1, max];
                for k in 1..=20u64 {
                    let edge = divisor.saturating_mul(k);
                    if edge <= max {
                        probes.push(edge - 1);
                        probes.push(edge);
                        if edge + 1 <= max {
                            probes.push(edge + 1);
                        }
                    }
                }
                for x in probes {
                    assert_eq!(
                        binner.bin(x),
                        x / divisor,
                        "divisor={divisor} max={max} x={x} mode={:?}",
                        binner.mode(),
                    );
                }
            }
        }
    }

    #[test]
    fn test_exhaustive_small_range() {
        for divisor in 1..=64u64 {
            let max = 10_000;
            let binner = FastBinner::new(divisor, max);
            for x in 0..=max {
                assert_eq!(binner.bin(x), x / divisor, "divisor={divisor} x={x}");
            }
        }
    }

    #[test]
    fn test_const_zero() {
        let binner = FastBinner::new(100, 99);
        assert_eq!(binner.mode(), BinMode::ConstZero);
        assert_eq!(binner.bin(0), 0);
        assert_eq!(binner.bin(99), 0);
    }

    #[test]
    fn test_huge_range_falls_back_to_divide64() {
        let binner = FastBinner::new(999_999_937, u64::MAX / 2);
        assert_eq!(binner.mode(), BinMode::Divide64);
        assert_eq!(binner.bin(u64::MAX / 2), (u64::MAX / 2) / 999_999_937);
    }

    #[test]
    #[should_panic(expected = "nonzero")]
    fn test_zero_divisor_panics() {
        let _ = FastBinner::new(0, 100);
    }
}
