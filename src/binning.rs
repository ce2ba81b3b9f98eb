//! UCSC binning-scheme arithmetic.
//!
//! The scheme tiles a reference of at most 2^29 bases with six levels of
//! bins: 1 bin spanning the whole reference, then 8, 64, 512, 4096, and
//! 32768 bins at successively finer powers-of-two spans down to the base
//! span of 16,384 bases (2^14).  Bin numbers are assigned level by level,
//! so a bin's reference range is computable from its number alone.
//!
//! ```text
//! Level  First bin  Count   Span per bin
//!   0        0          1   2^29
//!   1        1          8   2^26
//!   2        9         64   2^23
//!   3       73        512   2^20
//!   4      585       4096   2^17
//!   5     4681      32768   2^14
//! ```
//!
//! Bin numbers above the level-5 maximum (37448) are reserved; 37450 is
//! the metadata pseudo-bin used by the binning index.

use std::sync::Once;

use crate::error::{BamError, Result};

/// log2 of the finest bin span and of the linear-index window.
pub const WINDOW_SHIFT: u32 = 14;
/// Width of one linear-index window (16 KiB of reference positions).
pub const WINDOW_SIZE: u32 = 1 << WINDOW_SHIFT;
/// Exclusive upper bound on zero-based positions the scheme can cover.
pub const MAX_POSITION: u32 = 1 << 29;
/// Number of 16 KiB windows covering a maximal reference.
pub const MAX_WINDOW_COUNT: usize = (MAX_POSITION >> WINDOW_SHIFT) as usize;
/// First bin number of each level, coarsest first.
const LEVEL_STARTS: [u32; 6] = [0, 1, 9, 73, 585, 4681];
/// Largest real (data-carrying) bin number.
pub const MAX_BIN: u32 = LEVEL_STARTS[5] + (1 << 15) - 1; // 37448
/// The metadata pseudo-bin number.
pub const PSEUDO_BIN: u32 = 37450;

static OVERSIZE_WARNING: Once = Once::new();

/// Smallest bin fully containing the zero-based half-open interval
/// `[start, end)`.
///
/// An interval reaching past [`MAX_POSITION`] cannot be represented in the
/// record's 16-bit bin field; such records get bin 0 and a one-shot
/// process-wide warning.
pub fn region_to_bin(start: u32, end: u32) -> u16 {
    if end > MAX_POSITION {
        OVERSIZE_WARNING.call_once(|| {
            log::warn!(
                "alignment end {end} exceeds the binning scheme maximum {MAX_POSITION}; \
                 bin fields for such records are set to 0"
            );
        });
        return 0;
    }

    let end = end.saturating_sub(1); // inclusive
    if start >> 14 == end >> 14 {
        (LEVEL_STARTS[5] + (start >> 14)) as u16
    } else if start >> 17 == end >> 17 {
        (LEVEL_STARTS[4] + (start >> 17)) as u16
    } else if start >> 20 == end >> 20 {
        (LEVEL_STARTS[3] + (start >> 20)) as u16
    } else if start >> 23 == end >> 23 {
        (LEVEL_STARTS[2] + (start >> 23)) as u16
    } else if start >> 26 == end >> 26 {
        (LEVEL_STARTS[1] + (start >> 26)) as u16
    } else {
        0
    }
}

/// All bins that may contain records overlapping the zero-based half-open
/// interval `[start, end)` — one walk down the levels.
pub fn region_to_bins(start: u32, end: u32) -> Vec<u32> {
    let end = end.min(MAX_POSITION).saturating_sub(1); // inclusive, clamped
    let mut bins = Vec::with_capacity(16);
    bins.push(0);
    for (level, shift) in [(1usize, 26u32), (2, 23), (3, 20), (4, 17), (5, 14)] {
        let first = LEVEL_STARTS[level] + (start >> shift);
        let last = LEVEL_STARTS[level] + (end >> shift);
        for bin in first..=last {
            bins.push(bin);
        }
    }
    bins
}

/// The zero-based half-open reference range `[lo, hi)` a bin covers,
/// derived from the bin number alone.
pub fn bin_range(bin: u32) -> Result<(u32, u32)> {
    if bin > MAX_BIN {
        return Err(BamError::InvalidArgument(format!(
            "bin {bin} is outside the binning scheme (max {MAX_BIN})"
        )));
    }
    let level = LEVEL_STARTS.iter().rposition(|&s| bin >= s).unwrap_or(0);
    let span = MAX_POSITION >> (3 * level);
    let lo = (bin - LEVEL_STARTS[level]) * span;
    Ok((lo, lo + span))
}

/// Linear-index window containing a zero-based position.
#[inline]
pub fn position_to_window(pos: u32) -> usize {
    (pos >> WINDOW_SHIFT) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_to_bin_reference_values() {
        // Values from § 5.3 of the SAM specification's C reference code,
        // converted from the 1-based closed coordinates used there.
        assert_eq!(region_to_bin(7, 13), 4681);
        assert_eq!(region_to_bin(63_245_985, 63_245_986), 8541);
        // A span crossing a level-5 boundary climbs one level.
        assert_eq!(region_to_bin(16_000, 17_000), 585);
        // Whole-reference span lands in bin 0.
        assert_eq!(region_to_bin(0, MAX_POSITION), 0);
    }

    #[test]
    fn test_region_to_bin_oversized_reference() {
        assert_eq!(region_to_bin(0, MAX_POSITION + 1), 0);
    }

    #[test]
    fn test_region_to_bins_contains_owning_bin() {
        for (start, end) in [(0u32, 100u32), (100_000, 150_000), (1 << 20, (1 << 20) + 1)] {
            let bins = region_to_bins(start, end);
            assert!(bins.contains(&u32::from(region_to_bin(start, end))));
            assert!(bins.contains(&0));
        }
    }

    #[test]
    fn test_bin_range_round_trips_bin_number() {
        for bin in [0u32, 1, 8, 9, 72, 73, 584, 585, 4680, 4681, MAX_BIN] {
            let (lo, hi) = bin_range(bin).unwrap();
            assert!(hi > lo);
            assert_eq!(region_to_bin(lo, hi) as u32, bin);
        }
    }

    #[test]
    fn test_bin_range_rejects_pseudo_bin() {
        assert!(bin_range(PSEUDO_BIN).is_err());
    }

    #[test]
    fn test_window_arithmetic() {
        assert_eq!(position_to_window(0), 0);
        assert_eq!(position_to_window(WINDOW_SIZE - 1), 0);
        assert_eq!(position_to_window(WINDOW_SIZE), 1);
        assert_eq!(MAX_WINDOW_COUNT, 32768);
    }
}
