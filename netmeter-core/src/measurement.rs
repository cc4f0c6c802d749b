// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of one measurement: periodic statistics sampling, per-measurement
//! vector and scalar files, per spec.md §4.4.

use crate::bandwidth::BandwidthStats;
use crate::cpu::CpuSampler;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowKey};
use crate::outputfile::{self, write_line, OutputFile};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// `(control_socket, MeasurementID)` is the composite key spec.md §3
/// requires to be globally unique.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MeasurementKey {
    pub control_socket: i32,
    pub measurement_id: u64,
}

/// Default statistics-sampling interval, per spec.md §4.4.
pub const DEFAULT_STATISTICS_INTERVAL: Duration = Duration::from_secs(1);

struct MeasurementState {
    vector_file: Option<Box<dyn OutputFile>>,
    scalar_file: Option<Box<dyn OutputFile>>,
    next_statistics_event: u64,
    first_statistics_event: u64,
    /// Per-flow last-sampled snapshot, used to compute delta counters for
    /// each vector-file row.
    last_samples: HashMap<FlowKey, BandwidthStats>,
}

/// One measurement's lifecycle and statistics sinks.
pub struct Measurement {
    pub key: MeasurementKey,
    pub is_active_side: bool,
    pub interval: Duration,
    state: Mutex<MeasurementState>,
    cpu_sampler: Mutex<Box<dyn CpuSampler>>,
    cancel: AtomicBool,
    stats_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Measurement {
    /// `initialize` per spec.md §4.4. The active/passive suffix is chosen by
    /// whether a name pattern was supplied directly (an active-side-only
    /// concept; the passive side always receives empty patterns and builds
    /// its own local convention upstream in `control::passive`).
    pub fn initialize(
        control_socket: i32,
        measurement_id: u64,
        now: u64,
        vector_pattern: &str,
        vector_format_compressed: bool,
        scalar_pattern: &str,
        scalar_format_compressed: bool,
        is_active_side: bool,
        cpu_sampler: Box<dyn CpuSampler>,
    ) -> Result<Arc<Self>> {
        let side = if is_active_side { "active" } else { "passive" };

        let vector_path = side_suffixed_path(vector_pattern, side, vector_format_compressed);
        let scalar_path = side_suffixed_path(scalar_pattern, side, scalar_format_compressed);

        let mut vector_file = outputfile::open(&vector_path)?;
        if let Some(f) = vector_file.as_mut() {
            write_line(f.as_mut(), "AbsTime RelTime Interval\tFlowID Description Jitter\tAction\tAbsBytes AbsPackets AbsFrames\tRelBytes RelPackets RelFrames")?;
        }
        let scalar_file = outputfile::open(&scalar_path)?;

        Ok(Arc::new(Self {
            key: MeasurementKey {
                control_socket,
                measurement_id,
            },
            is_active_side,
            interval: DEFAULT_STATISTICS_INTERVAL,
            state: Mutex::new(MeasurementState {
                vector_file,
                scalar_file,
                next_statistics_event: now + DEFAULT_STATISTICS_INTERVAL.as_micros() as u64,
                first_statistics_event: now,
                last_samples: HashMap::new(),
            }),
            cpu_sampler: Mutex::new(cpu_sampler),
            cancel: AtomicBool::new(false),
            stats_handle: Mutex::new(None),
        }))
    }

    /// Spawns the background thread that drives `write_vector_statistics` on
    /// `self.interval`, per spec.md §4.4. `flows` is re-queried on every tick
    /// since flow membership for this measurement can change over its
    /// lifetime; callers pass a closure over the owning `FlowManager` rather
    /// than a fixed snapshot.
    pub fn spawn_stats_thread(self: &Arc<Self>, flows: impl Fn() -> Vec<Arc<Flow>> + Send + 'static) {
        let measurement = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while !measurement.cancel.load(Ordering::SeqCst) {
                std::thread::sleep(measurement.interval);
                if measurement.cancel.load(Ordering::SeqCst) {
                    break;
                }
                let now = crate::time::micro_time();
                if let Err(e) = measurement.write_vector_statistics(now, &flows()) {
                    tracing::warn!(error = %e, "vector statistics write failed");
                }
            }
        });
        *self.stats_handle.lock().unwrap() = Some(handle);
    }

    /// Stops and joins the stats thread, if one was spawned. Called before
    /// `write_scalar_statistics`/`finish` so the final scalar pass doesn't
    /// race a concurrent vector-file write.
    pub fn stop_stats_thread(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let handle = self.stats_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// `finish(close)`: closes/flushes both files.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(f) = state.vector_file.as_mut() {
            f.finish()?;
        }
        if let Some(f) = state.scalar_file.as_mut() {
            f.finish()?;
        }
        Ok(())
    }

    /// Emits one vector-file sample block if the scheduled event has been
    /// reached, per spec.md §4.4. Advances `NextStatisticsEvent`, catching
    /// up if the caller is running behind.
    pub fn write_vector_statistics(&self, now: u64, flows: &[Arc<Flow>]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if now < state.next_statistics_event {
            return Ok(());
        }

        let rel_time = now.saturating_sub(state.first_statistics_event);
        let interval_micros = self.interval.as_micros() as u64;

        let mut total_current = BandwidthStats::default();
        let mut total_delta = BandwidthStats::default();

        for flow in flows {
            if flow.key.measurement_id != self.key.measurement_id {
                continue;
            }
            let current = flow.current_bandwidth();
            let last = state.last_samples.get(&flow.key).copied().unwrap_or_default();
            let delta = current - last;

            if let Some(sink) = state.vector_file.as_mut() {
                let header = format!(
                    "{} {} {:.3}",
                    flow.key.flow_id,
                    flow.traffic_spec.description,
                    flow.last_jitter()
                );
                for (action, abs_bytes, abs_packets, abs_frames, rel_bytes, rel_packets, rel_frames) in
                    action_rows(&current, &delta)
                {
                    let line = format!(
                        "{now} {rel_time} {interval_micros}\t{header}\t{action}\t{abs_bytes} {abs_packets} {abs_frames}\t{rel_bytes} {rel_packets} {rel_frames}"
                    );
                    write_line(sink.as_mut(), &line)?;
                }
            }

            total_current += current;
            total_delta += delta;
            state.last_samples.insert(flow.key, current);
        }

        if let Some(sink) = state.vector_file.as_mut() {
            for (action, abs_bytes, abs_packets, abs_frames, rel_bytes, rel_packets, rel_frames) in
                action_rows(&total_current, &total_delta)
            {
                let line = format!(
                    "{now} {rel_time} {interval_micros}\t-1 total 0.000\t{action}\t{abs_bytes} {abs_packets} {abs_frames}\t{rel_bytes} {rel_packets} {rel_frames}"
                );
                write_line(sink.as_mut(), &line)?;
            }
        }

        state.next_statistics_event += interval_micros;
        if state.next_statistics_event <= now {
            // catch up: skip any elapsed intervals instead of spinning.
            let behind = now - state.next_statistics_event;
            state.next_statistics_event += (behind / interval_micros + 1) * interval_micros;
        }

        Ok(())
    }

    /// Emits the scalar block for this measurement's flows plus per-CPU
    /// utilization, per spec.md §4.4 and the `scalar "<object>" "<metric>"
    /// <value>` line format of §6.2.
    pub fn write_scalar_statistics(&self, flows: &[Arc<Flow>]) -> Result<()> {
        let side = if self.is_active_side { "active" } else { "passive" };
        let mut state = self.state.lock().unwrap();
        let mut total = BandwidthStats::default();

        for flow in flows {
            if flow.key.measurement_id != self.key.measurement_id {
                continue;
            }
            let stats = flow.current_bandwidth();
            total += stats;
            if let Some(sink) = state.scalar_file.as_mut() {
                let object = format!("netPerfMeter.{side}.flow[{}]", flow.key.flow_id);
                for (metric, value) in scalar_rows(&stats) {
                    write_line(sink.as_mut(), &format!("scalar \"{object}\" \"{metric}\" {value}"))?;
                }
            }
        }

        let sample = self.cpu_sampler.lock().unwrap().sample();
        if let Some(sink) = state.scalar_file.as_mut() {
            let object = format!("netPerfMeter.{side}.total");
            for (metric, value) in scalar_rows(&total) {
                write_line(sink.as_mut(), &format!("scalar \"{object}\" \"{metric}\" {value}"))?;
            }
            for (i, usage) in sample.per_core.iter().enumerate() {
                write_line(
                    sink.as_mut(),
                    &format!("scalar \"netPerfMeter.{side}.CPU[{i}]\" \"utilization\" {usage}"),
                )?;
            }
            write_line(
                sink.as_mut(),
                &format!("scalar \"netPerfMeter.{side}.totalCPU\" \"utilization\" {}", sample.total),
            )?;
        }

        Ok(())
    }
}

/// Sent/Received/Lost rows for a vector-file sample block, pairing each
/// action's bytes/packets/frames counters from the current and delta
/// snapshots, per spec.md §6.2's `AbsBytes AbsPackets AbsFrames`/`RelBytes
/// RelPackets RelFrames` columns.
fn action_rows(current: &BandwidthStats, delta: &BandwidthStats) -> [(&'static str, u64, u64, u64, u64, u64, u64); 3] {
    [
        (
            "Sent",
            current.transmitted_bytes,
            current.transmitted_packets,
            current.transmitted_frames,
            delta.transmitted_bytes,
            delta.transmitted_packets,
            delta.transmitted_frames,
        ),
        (
            "Received",
            current.received_bytes,
            current.received_packets,
            current.received_frames,
            delta.received_bytes,
            delta.received_packets,
            delta.received_frames,
        ),
        (
            "Lost",
            current.lost_bytes,
            current.lost_packets,
            current.lost_frames,
            delta.lost_bytes,
            delta.lost_packets,
            delta.lost_frames,
        ),
    ]
}

fn scalar_rows(stats: &BandwidthStats) -> [(&'static str, u64); 9] {
    [
        ("transmittedBytes", stats.transmitted_bytes),
        ("transmittedPackets", stats.transmitted_packets),
        ("transmittedFrames", stats.transmitted_frames),
        ("receivedBytes", stats.received_bytes),
        ("receivedPackets", stats.received_packets),
        ("receivedFrames", stats.received_frames),
        ("lostBytes", stats.lost_bytes),
        ("lostPackets", stats.lost_packets),
        ("lostFrames", stats.lost_frames),
    ]
}

fn side_suffixed_path(pattern: &str, side: &str, compressed: bool) -> String {
    if pattern.is_empty() {
        return String::new();
    }
    let mut path = format!("{pattern}-{side}");
    if compressed && !path.ends_with(".bz2") {
        path.push_str(".bz2");
    }
    path
}

/// Checked construction failure for `initialize` when the `(control_socket,
/// MeasurementID)` key already exists — kept here so `flowmanager` can reuse
/// the exact wording, per spec.md §4.4 invariant.
pub fn duplicate_measurement_error(key: MeasurementKey) -> Error {
    Error::config(format!(
        "measurement {} already exists on control socket {}",
        key.measurement_id, key.control_socket
    ))
}
