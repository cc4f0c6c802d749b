// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! "Network double": an IEEE-754 binary64 value encoded in network byte
//! order, per spec.md §4.1. We always use the explicit
//! sign/exponent/mantissa layout so the wire format is independent of the
//! platform's native float representation, and round-trips exactly.

use bytes::{Buf, BufMut};

pub const ENCODED_LEN: usize = 8;

/// Encodes `value` as 8 bytes, network byte order, matching IEEE-754
/// binary64 exactly (sign:1 | exponent:11 | mantissa:52).
pub fn encode(value: f64, buf: &mut impl BufMut) {
    buf.put_u64(value.to_bits());
}

/// Decodes a network double previously written by [`encode`].
pub fn decode(buf: &mut impl Buf) -> f64 {
    f64::from_bits(buf.get_u64())
}

/// Encodes a scaled probability in `[0, 1]` as a u32 per spec.md §4.1:
/// `encoded = round(p * (2^32 - 1))`.
pub fn encode_scaled_probability(p: f64) -> u32 {
    let p = p.clamp(0.0, 1.0);
    (p * (u32::MAX as f64)).round() as u32
}

/// Inverse of [`encode_scaled_probability`].
pub fn decode_scaled_probability(encoded: u32) -> f64 {
    encoded as f64 / u32::MAX as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn round_trips_arbitrary_doubles() {
        for v in [0.0, 1.0, -1.0, 3.5, f64::MIN_POSITIVE, 1e300, -1e-300] {
            let mut buf = BytesMut::new();
            encode(v, &mut buf);
            assert_eq!(buf.len(), ENCODED_LEN);
            let mut b = buf.freeze();
            assert_eq!(decode(&mut b), v);
        }
    }

    #[test]
    fn scaled_probability_round_trips_within_one_ulp() {
        for p in [0.0, 0.5, 1.0, 0.25, 0.999999] {
            let encoded = encode_scaled_probability(p);
            let decoded = decode_scaled_probability(encoded);
            assert!((decoded - p).abs() < 1e-8, "{p} -> {decoded}");
        }
    }

    #[test]
    fn scaled_probability_clamps() {
        assert_eq!(encode_scaled_probability(-1.0), 0);
        assert_eq!(encode_scaled_probability(2.0), u32::MAX);
    }
}
