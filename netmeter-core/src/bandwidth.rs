// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::ops::{Add, AddAssign, Sub, SubAssign};

/// Nine-tuple of transmitted/received/lost x bytes/packets/frames counters,
/// per spec.md §3 `BandwidthStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BandwidthStats {
    pub transmitted_bytes: u64,
    pub transmitted_packets: u64,
    pub transmitted_frames: u64,
    pub received_bytes: u64,
    pub received_packets: u64,
    pub received_frames: u64,
    pub lost_bytes: u64,
    pub lost_packets: u64,
    pub lost_frames: u64,
}

impl Add for BandwidthStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            transmitted_bytes: self.transmitted_bytes + rhs.transmitted_bytes,
            transmitted_packets: self.transmitted_packets + rhs.transmitted_packets,
            transmitted_frames: self.transmitted_frames + rhs.transmitted_frames,
            received_bytes: self.received_bytes + rhs.received_bytes,
            received_packets: self.received_packets + rhs.received_packets,
            received_frames: self.received_frames + rhs.received_frames,
            lost_bytes: self.lost_bytes + rhs.lost_bytes,
            lost_packets: self.lost_packets + rhs.lost_packets,
            lost_frames: self.lost_frames + rhs.lost_frames,
        }
    }
}

impl AddAssign for BandwidthStats {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for BandwidthStats {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            transmitted_bytes: self.transmitted_bytes.saturating_sub(rhs.transmitted_bytes),
            transmitted_packets: self.transmitted_packets.saturating_sub(rhs.transmitted_packets),
            transmitted_frames: self.transmitted_frames.saturating_sub(rhs.transmitted_frames),
            received_bytes: self.received_bytes.saturating_sub(rhs.received_bytes),
            received_packets: self.received_packets.saturating_sub(rhs.received_packets),
            received_frames: self.received_frames.saturating_sub(rhs.received_frames),
            lost_bytes: self.lost_bytes.saturating_sub(rhs.lost_bytes),
            lost_packets: self.lost_packets.saturating_sub(rhs.lost_packets),
            lost_frames: self.lost_frames.saturating_sub(rhs.lost_frames),
        }
    }
}

impl SubAssign for BandwidthStats {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_subtract_is_identity() {
        let a = BandwidthStats {
            transmitted_bytes: 100,
            transmitted_packets: 10,
            ..Default::default()
        };
        let b = BandwidthStats {
            transmitted_bytes: 50,
            transmitted_packets: 5,
            ..Default::default()
        };
        let sum = a + b;
        assert_eq!(sum - b, a);
    }
}
