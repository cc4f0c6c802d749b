// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Drives one passive-side process: binds the control and per-protocol data
//! listeners, then accepts connections forever, handing each control
//! connection to its own [`ControlAssociation`] thread (spec.md §4.8.2).

use crate::args::{Config, Role};
use netmeter_core::control::passive::{LocalFilePatterns, PassiveListeners};
use netmeter_core::error::Result;
use netmeter_core::trafficspec::Protocol;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

const STREAM_PROTOCOLS: [Protocol; 5] = [
    Protocol::Tcp,
    Protocol::Mptcp,
    Protocol::Udp,
    Protocol::Sctp,
    Protocol::Dccp,
];

pub fn run(config: &Config) -> Result<()> {
    let port = match &config.role {
        Role::Passive { port } => *port,
        Role::Active { .. } => unreachable!("passive_runner::run called with an active role"),
    };

    let local_addrs = resolve_local_addrs(&config.global.local_addrs);
    let listeners = Arc::new(PassiveListeners::bind(
        local_addrs,
        port,
        config.global.control_over_tcp,
        &STREAM_PROTOCOLS,
    )?);

    tracing::info!(
        control = listeners.ports.control,
        data = listeners.ports.data,
        mptcp = listeners.ports.mptcp,
        "passive side listening"
    );

    for &(protocol, _) in &listeners.streams {
        let listeners = Arc::clone(&listeners);
        std::thread::spawn(move || loop {
            if let Err(e) = listeners.accept_data(protocol) {
                tracing::warn!(?protocol, error = %e, "data accept failed");
            }
        });
    }

    let local = Arc::new(LocalFilePatterns {
        vector_pattern: config.vector_pattern.clone(),
        vector_compressed: config.vector_compressed,
        scalar_pattern: config.scalar_pattern.clone(),
        scalar_compressed: config.scalar_compressed,
    });

    loop {
        let mut association = match listeners.accept_control() {
            Ok(assoc) => assoc,
            Err(e) => {
                tracing::warn!(error = %e, "control accept failed");
                continue;
            }
        };
        let local = Arc::clone(&local);
        std::thread::spawn(move || association.run(&local));
    }
}

fn resolve_local_addrs(addrs: &[IpAddr]) -> Vec<SocketAddr> {
    if addrs.is_empty() {
        return vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)];
    }
    addrs.iter().map(|&ip| SocketAddr::new(ip, 0)).collect()
}
