// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! `Measurement::spawn_stats_thread` should periodically sample the
//! flows it's handed and stop cleanly once `stop_stats_thread` is called
//! (spec.md §4.4 "Emits one vector-file sample block if the scheduled
//! event has been reached").

use netmeter_core::cpu::SysinfoCpuSampler;
use netmeter_core::flow::{Flow, FlowKey};
use netmeter_core::measurement::Measurement;
use netmeter_core::trafficspec::TrafficSpec;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

fn scratch_path(name: &str) -> String {
    format!("{}/netmeter-test-{}-{}", std::env::temp_dir().display(), std::process::id(), name)
}

#[test]
fn periodic_vector_statistics_are_written_and_stoppable() {
    let pattern = scratch_path("vectors");
    let expected_file = format!("{pattern}-active");
    let _ = fs::remove_file(&expected_file);

    let measurement = Measurement::initialize(
        1,
        42,
        0,
        &pattern,
        false,
        "",
        false,
        true,
        Box::new(SysinfoCpuSampler::new()),
    )
    .expect("initialize");

    let key = FlowKey {
        measurement_id: 42,
        flow_id: 1,
        stream_id: 0,
    };
    let flow = Flow::new(key, TrafficSpec::default(), 1);
    let flows = vec![Arc::clone(&flow)];

    measurement.spawn_stats_thread(move || flows.clone());

    // DEFAULT_STATISTICS_INTERVAL is 1s; give the thread time for one tick.
    std::thread::sleep(Duration::from_millis(1300));
    measurement.stop_stats_thread();
    measurement.finish().expect("finish");

    let contents = fs::read_to_string(&expected_file).expect("vector file should exist");
    let lines: Vec<&str> = contents.lines().collect();
    assert!(lines.len() > 1, "expected at least a header and one sample row, got: {contents:?}");
    assert!(lines[0].starts_with("AbsTime"), "first line should be the header: {lines:?}");

    let _ = fs::remove_file(&expected_file);
}
