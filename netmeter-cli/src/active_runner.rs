// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Drives one active-side measurement run end to end: connect, add/identify
//! every flow, start, wait out `-runtime` (or until Ctrl-C), then stop and
//! download results (spec.md §4.8.1).

use crate::args::{Config, Role};
use netmeter_core::control::active::{ActiveSession, StartConfig};
use netmeter_core::error::Result;
use netmeter_core::flow::FlowKey;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn run(config: &Config) -> Result<()> {
    let remote = match &config.role {
        Role::Active { remote } => *remote,
        Role::Passive { .. } => unreachable!("active_runner::run called with a passive role"),
    };

    let local_addrs = resolve_local_addrs(&config.global.local_addrs, remote.is_ipv6());
    let mut session = ActiveSession::connect(
        remote,
        config.global.control_over_tcp,
        local_addrs,
        config.global.v6only,
    )?;

    let measurement_id = new_measurement_id();
    let no_vectors = config.vector_pattern.is_empty();

    let mut flows = Vec::with_capacity(config.flows.len());
    for flow_arg in &config.flows {
        let key = FlowKey {
            measurement_id,
            flow_id: flow_arg.flow_id,
            stream_id: flow_arg.stream_id,
        };
        let flow = session.add_flow(key, flow_arg.traffic_spec.clone())?;
        session.identify_flow(&flow, config.vector_compressed, no_vectors)?;
        flow.init_vector_file(&config.vector_pattern, config.vector_compressed, no_vectors)?;
        flows.push(flow);
    }

    let start_cfg = StartConfig {
        active_node_name: config.global.active_node_name.clone(),
        passive_node_name: config.global.passive_node_name.clone(),
        config_path: config.config_path.clone(),
        vector_pattern: config.vector_pattern.clone(),
        vector_compressed: config.vector_compressed,
        scalar_pattern: config.scalar_pattern.clone(),
        scalar_compressed: config.scalar_compressed,
    };

    session.start(measurement_id, &start_cfg, &flows)?;
    tracing::info!(measurement_id, flows = flows.len(), "measurement started");

    match config.global.runtime {
        Some(runtime) => std::thread::sleep(runtime),
        None => {
            tracing::warn!("no -runtime given; running until Ctrl-C");
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
    }

    session.stop(measurement_id, &start_cfg, &flows)?;
    tracing::info!(measurement_id, "measurement stopped");
    Ok(())
}

fn resolve_local_addrs(addrs: &[IpAddr], remote_is_v6: bool) -> Vec<SocketAddr> {
    if addrs.is_empty() {
        let unspecified = if remote_is_v6 {
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        return vec![SocketAddr::new(unspecified, 0)];
    }
    addrs.iter().map(|&ip| SocketAddr::new(ip, 0)).collect()
}

/// A run-local MeasurementID; spec.md §3 only requires process-local
/// uniqueness, so the current microsecond time since the epoch suffices.
fn new_measurement_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
