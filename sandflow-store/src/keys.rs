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

//! Composite key encoding.
//!
//! Keys are strings; parts are joined with the 0x1f unit separator, which
//! sorts below every printable character, so lexicographic order on the
//! joined key equals tuple order on the parts. Parts must not contain the
//! separator; producer-supplied strings are sanitized at ingest.

use sandflow_core::TimePartition;

/// Unit separator between key parts.
pub const KEY_SEP: char = '\u{001f}';

/// Join parts into one order-preserving key.
pub fn encode_parts(parts: &[&str]) -> String {
    parts.join(&KEY_SEP.to_string())
}

/// Split a key back into parts.
pub fn decode_parts(key: &str) -> Vec<&str> {
    key.split(KEY_SEP).collect()
}

/// Zero-padded partition bucket; 10 digits keeps lexicographic == numeric
/// for any microsecond epoch shifted by at least 16 bits.
pub fn fmt_t(t: TimePartition) -> String {
    format!("{:010}", t)
}

/// Zero-padded microsecond timestamp.
pub fn fmt_ts(timestamp_usec: u64) -> String {
    format!("{:020}", timestamp_usec)
}

/// Parse the leading partition bucket off a partition key.
pub fn parse_t(partition_key: &str) -> Option<TimePartition> {
    decode_parts(partition_key).first()?.parse().ok()
}

/// Upper bound for "every key starting with `prefix`".
pub fn prefix_upper_bound(prefix: &str) -> String {
    let mut end = prefix.to_string();
    end.push('\u{10ffff}');
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let key = encode_parts(&["0000000010", "h1", "abc"]);
        assert_eq!(decode_parts(&key), vec!["0000000010", "h1", "abc"]);
    }

    #[test]
    fn test_tuple_order_preserved() {
        // ("a", "z") < ("ab", "a") in tuple order; the separator sorts
        // below 'b' so the joined keys agree.
        let k1 = encode_parts(&["a", "z"]);
        let k2 = encode_parts(&["ab", "a"]);
        assert!(k1 < k2);
    }

    #[test]
    fn test_timestamp_order_is_lexicographic() {
        assert!(fmt_ts(999) < fmt_ts(1_000));
        assert!(fmt_t(9) < fmt_t(10));
    }

    #[test]
    fn test_parse_t() {
        let pk = encode_parts(&[&fmt_t(42), "vn1"]);
        assert_eq!(parse_t(&pk), Some(42));
        assert_eq!(parse_t("not-a-number"), None);
    }

    #[test]
    fn test_prefix_upper_bound_covers_prefixed_keys() {
        let prefix = "abc";
        let hi = prefix_upper_bound(prefix);
        assert!("abc" < hi.as_str());
        assert!("abcz" < hi.as_str());
        assert!("abd" > hi.as_str());
    }
}
