// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Static per-flow configuration, per spec.md §3 `TrafficSpec`.

use crate::onoff::OnOffEvent;
use crate::randomvar::RandomVariable;
use std::time::Duration;
use strum_macros::{Display, EnumString};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Tcp = 1,
    Mptcp = 2,
    Udp = 3,
    Sctp = 4,
    Dccp = 5,
}

impl Protocol {
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Protocol::Tcp),
            2 => Some(Protocol::Mptcp),
            3 => Some(Protocol::Udp),
            4 => Some(Protocol::Sctp),
            5 => Some(Protocol::Dccp),
            _ => None,
        }
    }

    pub fn is_reliable_stream(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Mptcp | Protocol::Sctp)
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Dccp)
    }
}

/// One direction's frame-size and frame-rate random variables.
#[derive(Clone, Copy, Debug)]
pub struct DirectionSpec {
    pub frame_rate: RandomVariable,
    pub frame_size: RandomVariable,
}

impl DirectionSpec {
    pub fn disabled() -> Self {
        Self {
            frame_rate: RandomVariable::constant(0.0),
            frame_size: RandomVariable::constant(0.0),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.frame_size.is_zero_constant()
    }

    /// "Saturated" per spec.md §4.5.2: nonzero frame size, effectively zero
    /// rate ⇒ send as fast as possible. A static check against the
    /// configured rate, not a live draw, so a non-constant rate generator
    /// (e.g. `exp`) doesn't flip a flow in and out of saturated mode from
    /// one sender-loop iteration to the next.
    pub fn is_saturated(&self) -> bool {
        !self.frame_size.is_zero_constant() && self.frame_rate.is_zero_constant()
    }
}

#[derive(Clone, Debug)]
pub struct TrafficSpec {
    pub protocol: Protocol,
    pub description: String,

    pub outbound: DirectionSpec,
    pub inbound: DirectionSpec,

    pub max_msg_size: u16,
    pub defragment_timeout: Duration,

    pub ordered_mode: f64,
    pub reliable_mode: f64,
    pub retransmission_trials: u32,
    pub retransmission_trials_in_ms: bool,

    pub cmt: u8,
    pub ccid: u8,
    pub n_diff_ports: u16,

    pub on_off_events: Vec<OnOffEvent>,

    pub rcv_buffer_size: u32,
    pub snd_buffer_size: u32,

    pub path_mgr: String,
    pub congestion_control: String,

    pub no_delay: bool,
    pub debug: bool,
    pub v6only: bool,
}

impl Default for TrafficSpec {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            description: String::new(),
            outbound: DirectionSpec::disabled(),
            inbound: DirectionSpec::disabled(),
            max_msg_size: 16384,
            defragment_timeout: Duration::from_millis(5000),
            ordered_mode: 1.0,
            reliable_mode: 1.0,
            retransmission_trials: 0,
            retransmission_trials_in_ms: false,
            cmt: 0,
            ccid: 2,
            n_diff_ports: 0,
            on_off_events: Vec::new(),
            rcv_buffer_size: 0,
            snd_buffer_size: 0,
            path_mgr: String::new(),
            congestion_control: String::new(),
            no_delay: false,
            debug: false,
            v6only: false,
        }
    }
}

impl TrafficSpec {
    /// Swaps inbound/outbound, used when the passive side mirrors an
    /// `AddFlow` (spec.md §4.8.2: "inbound fields are swapped to outbound on
    /// this side").
    pub fn swapped(mut self) -> Self {
        core::mem::swap(&mut self.outbound, &mut self.inbound);
        self
    }
}
