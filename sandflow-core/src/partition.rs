// Copyright 2025 Sandflow (https://github.com/sandflow)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Time partitioning for the wide-column schema.
//!
//! Every time-series row key begins with `t = timestamp_usec >> partition_bits`.
//! With the default 23 bits each partition spans 2^23 us (~8.4 s), so a purge
//! can drop whole partitions without row-level inspection.

/// Default shift applied to microsecond timestamps to derive the partition.
pub const DEFAULT_PARTITION_BITS: u32 = 23;

/// A coarse time bucket; the leading component of every time-series row key.
pub type TimePartition = u64;

/// Partition containing `timestamp_usec`.
#[inline]
pub fn partition_of(timestamp_usec: u64, partition_bits: u32) -> TimePartition {
    timestamp_usec >> partition_bits
}

/// First microsecond covered by partition `t`.
#[inline]
pub fn partition_start(t: TimePartition, partition_bits: u32) -> u64 {
    t << partition_bits
}

/// Inclusive partition range covering `[start_usec, end_usec]`.
///
/// An inverted input range yields an empty iterator rather than a panic;
/// the query planner treats that as "no partitions to scan".
pub fn partition_range(
    start_usec: u64,
    end_usec: u64,
    partition_bits: u32,
) -> impl Iterator<Item = TimePartition> {
    let lo = partition_of(start_usec, partition_bits);
    let hi = partition_of(end_usec, partition_bits);
    if start_usec > end_usec {
        // empty
        1..=0
    } else {
        lo..=hi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_width_is_2_pow_23_usec() {
        let t0 = partition_of(0, DEFAULT_PARTITION_BITS);
        let t1 = partition_of((1 << 23) - 1, DEFAULT_PARTITION_BITS);
        let t2 = partition_of(1 << 23, DEFAULT_PARTITION_BITS);
        assert_eq!(t0, t1);
        assert_eq!(t2, t0 + 1);
    }

    #[test]
    fn test_partition_start_round_trips() {
        let ts = 1_700_000_000_000_000u64;
        let t = partition_of(ts, DEFAULT_PARTITION_BITS);
        let start = partition_start(t, DEFAULT_PARTITION_BITS);
        assert!(start <= ts);
        assert!(ts - start < (1 << DEFAULT_PARTITION_BITS));
    }

    #[test]
    fn test_partition_range_covers_boundaries() {
        let start = 10u64 << DEFAULT_PARTITION_BITS;
        let end = (12u64 << DEFAULT_PARTITION_BITS) + 1;
        let parts: Vec<_> = partition_range(start, end, DEFAULT_PARTITION_BITS).collect();
        assert_eq!(parts, vec![10, 11, 12]);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let parts: Vec<_> = partition_range(100, 50, DEFAULT_PARTITION_BITS).collect();
        assert!(parts.is_empty());
    }

    #[test]
    fn test_configurable_bits() {
        // Same timestamp lands in different partitions under different widths.
        let ts = 1u64 << 30;
        assert_eq!(partition_of(ts, 23), 1 << 7);
        assert_eq!(partition_of(ts, 30), 1);
    }
}
