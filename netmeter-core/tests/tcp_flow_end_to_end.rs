// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end active/passive run over TCP loopback, exercising the same
//! control-protocol path the CLI binary drives (spec.md §8 scenario S1):
//! connect, AddFlow, IdentifyFlow, Start, let the sender run briefly, Stop.

use netmeter_core::control::active::{ActiveSession, StartConfig};
use netmeter_core::control::passive::{LocalFilePatterns, PassiveListeners};
use netmeter_core::flow::FlowKey;
use netmeter_core::flowmanager::FLOW_MANAGER;
use netmeter_core::randomvar::RandomVariable;
use netmeter_core::trafficspec::{Protocol, TrafficSpec};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const DATA_PORT: u16 = 58_200;

#[test]
fn tcp_flow_end_to_end() {
    std::thread::spawn(|| {
        FLOW_MANAGER.run_receiver_loop(|_| {});
    });

    let loopback = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)];
    let listeners = Arc::new(
        PassiveListeners::bind(loopback, DATA_PORT, true, &[Protocol::Tcp]).expect("passive bind"),
    );

    {
        let listeners = Arc::clone(&listeners);
        std::thread::spawn(move || loop {
            if listeners.accept_data(Protocol::Tcp).is_err() {
                break;
            }
        });
    }

    let local = LocalFilePatterns {
        vector_pattern: String::new(),
        vector_compressed: false,
        scalar_pattern: String::new(),
        scalar_compressed: false,
    };
    {
        let listeners = Arc::clone(&listeners);
        std::thread::spawn(move || {
            let mut association = listeners.accept_control().expect("accept control");
            association.run(&local);
        });
    }

    let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DATA_PORT);
    let mut session = ActiveSession::connect(
        remote,
        true,
        vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)],
        false,
    )
    .expect("active connect");

    let mut spec = TrafficSpec {
        protocol: Protocol::Tcp,
        ..TrafficSpec::default()
    };
    spec.outbound.frame_rate = RandomVariable::constant(10.0);
    spec.outbound.frame_size = RandomVariable::constant(1024.0);

    let key = FlowKey {
        measurement_id: 1,
        flow_id: 1,
        stream_id: 0,
    };
    let flow = session.add_flow(key, spec).expect("add_flow");
    session.identify_flow(&flow, false, true).expect("identify_flow");

    let start_cfg = StartConfig {
        active_node_name: "active".to_string(),
        passive_node_name: "passive".to_string(),
        config_path: String::new(),
        vector_pattern: String::new(),
        vector_compressed: false,
        scalar_pattern: String::new(),
        scalar_compressed: false,
    };

    let flows = vec![Arc::clone(&flow)];
    session.start(1, &start_cfg, &flows).expect("start");

    std::thread::sleep(Duration::from_millis(1200));

    session.stop(1, &start_cfg, &flows).expect("stop");

    let stats = flow.current_bandwidth();
    assert!(stats.transmitted_bytes > 0, "flow should have transmitted data: {stats:?}");
    assert!(stats.transmitted_frames > 0, "flow should have transmitted frames: {stats:?}");
    assert_eq!(stats.lost_bytes, 0, "TCP loopback flow should not report loss: {stats:?}");
}
