// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! One logical traffic stream: traffic spec, socket, sender thread, receive
//! statistics, and per-flow vector log, per spec.md §3 `Flow` and §4.5.

use crate::bandwidth::BandwidthStats;
use crate::datasocket::DataSocket;
use crate::defragmenter::Defragmenter;
use crate::error::Result;
use crate::onoff::Schedule;
use crate::outputfile::{self, write_line, OutputFile};
use crate::trafficspec::TrafficSpec;
use crate::wire::Data;
use crate::time::micro_time;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A flow's on/off output state, per spec.md §3.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowStatus {
    WaitingForStartup,
    On,
    Off,
}

/// (MeasurementID, FlowID, StreamID) — the natural key for a flow, used for
/// identify matching and control-message correlation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub measurement_id: u64,
    pub flow_id: u32,
    pub stream_id: u16,
}

/// Mutable per-flow state protected by one lock, per spec.md §5: "counter
/// updates are serialized by the per-flow lock; readers of
/// current-bandwidth use the same lock."
struct FlowState {
    input_status: FlowStatus,
    output_status: FlowStatus,
    socket: Option<DataSocket>,
    defragmenter: Defragmenter,
    schedule: Option<Schedule>,
    current: BandwidthStats,
    last: BandwidthStats,
    last_frame_id: u32,
    last_seq_number: u64,
    last_byte_seq_number: u64,
    previous_delay: Option<i64>,
    jitter: f64,
    first_transmission: Option<u64>,
    last_transmission: u64,
    first_reception: Option<u64>,
    last_reception: u64,
    vector_file: Option<Box<dyn OutputFile>>,
}

/// One logical traffic stream. Owned by the [`crate::flowmanager::FlowManager`];
/// a non-owning `(control_socket, MeasurementID)` key ties it to its
/// `Measurement` (spec.md §9: "Flow→Measurement as a non-owning lookup key").
pub struct Flow {
    pub key: FlowKey,
    pub traffic_spec: TrafficSpec,
    pub measurement_key: Mutex<Option<(i32, u64)>>,
    pub control_socket: i32,
    pub time_base: AtomicU64,
    pub next_frame_id: AtomicU32,
    cancel: AtomicBool,
    state: Mutex<FlowState>,
    sender_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Flow {
    pub fn new(key: FlowKey, traffic_spec: TrafficSpec, control_socket: i32) -> Arc<Self> {
        Arc::new(Self {
            key,
            traffic_spec,
            measurement_key: Mutex::new(None),
            control_socket,
            time_base: AtomicU64::new(0),
            next_frame_id: AtomicU32::new(0),
            cancel: AtomicBool::new(false),
            state: Mutex::new(FlowState {
                input_status: FlowStatus::WaitingForStartup,
                output_status: FlowStatus::WaitingForStartup,
                socket: None,
                defragmenter: Defragmenter::new(),
                schedule: None,
                current: BandwidthStats::default(),
                last: BandwidthStats::default(),
                last_frame_id: 0,
                last_seq_number: 0,
                last_byte_seq_number: 0,
                previous_delay: None,
                jitter: 0.0,
                first_transmission: None,
                last_transmission: 0,
                first_reception: None,
                last_reception: 0,
                vector_file: None,
            }),
            sender_handle: Mutex::new(None),
        })
    }

    pub fn attach_socket(&self, socket: DataSocket) {
        self.state.lock().unwrap().socket = Some(socket);
    }

    pub fn has_remote(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .socket
            .as_ref()
            .map(|s| s.remote().is_some())
            .unwrap_or(false)
    }

    /// The underlying descriptor, if a socket is currently attached. Used by
    /// the flow manager's receiver thread to build its poll set (spec.md
    /// §4.7.1) without needing to reach into `Flow`'s private state lock
    /// itself.
    pub fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use crate::reader::FramedSocket;
        self.state.lock().unwrap().socket.as_ref().map(|s| s.raw_fd())
    }

    /// Runs `f` with the flow's socket, if attached, under the flow's own
    /// lock. Used by the flow manager to drive a [`crate::reader::MessageReader`]
    /// receive without exposing the socket's lifetime beyond this call.
    pub fn with_socket<R>(&self, f: impl FnOnce(&DataSocket) -> R) -> Option<R> {
        let state = self.state.lock().unwrap();
        state.socket.as_ref().map(f)
    }

    pub fn current_bandwidth(&self) -> BandwidthStats {
        self.state.lock().unwrap().current
    }

    /// The exponentially-smoothed inter-packet delay jitter accumulated so
    /// far by [`Self::on_data_received`], in microseconds.
    pub fn last_jitter(&self) -> f64 {
        self.state.lock().unwrap().jitter
    }

    /// The path this flow's per-flow vector file was (or would be) opened
    /// at, following the same naming convention as [`Self::init_vector_file`].
    /// Used to re-open and stream the file back on `RemoveFlow`.
    pub fn vector_file_path(&self, pattern: &str, compress: bool) -> String {
        per_flow_vector_path(pattern, self.key, compress)
    }

    /// Initializes the per-flow vector file using the Identify header's
    /// compress/no-vectors flags (spec.md §4.7.2).
    pub fn init_vector_file(&self, pattern: &str, compress: bool, no_vectors: bool) -> Result<()> {
        if no_vectors || pattern.is_empty() {
            return Ok(());
        }
        let path = per_flow_vector_path(pattern, self.key, compress);
        let mut sink = outputfile::open(&path)?;
        if let Some(f) = sink.as_mut() {
            write_line(
                f.as_mut(),
                "AbsTime RelTime SeqNumber Delay PrevPacketDelayDiff Jitter",
            )?;
        }
        self.state.lock().unwrap().vector_file = sink;
        Ok(())
    }

    /// Called by the flow manager at `startMeasurement` time (spec.md
    /// §4.7.3): sets timebase, status, and materializes the on/off
    /// schedule.
    pub fn start(&self, now: u64) {
        self.time_base.store(now, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        state.input_status = FlowStatus::On;
        state.output_status = if self.traffic_spec.on_off_events.is_empty() {
            FlowStatus::On
        } else {
            FlowStatus::Off
        };
        let mut rng = rand::thread_rng();
        state.schedule = if self.traffic_spec.on_off_events.is_empty() {
            None
        } else {
            Some(Schedule::materialize(
                &self.traffic_spec.on_off_events,
                now,
                &mut rng,
            ))
        };
    }

    /// Stage 0 of `stopMeasurement` (spec.md §4.7.3): flips the flow off and
    /// shuts down the write side so the peer observes EOF.
    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if let Some(socket) = state.socket.as_ref() {
            let _ = socket.raw().shutdown(std::net::Shutdown::Write);
        }
    }

    /// Stage 1: joins the sender thread, logging the final state.
    pub fn join_sender(&self) {
        let handle = self.sender_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        tracing::info!(
            flow_id = self.key.flow_id,
            bandwidth = ?self.current_bandwidth(),
            "flow sender joined"
        );
        if let Some(sink) = self.state.lock().unwrap().vector_file.as_mut() {
            let _ = sink.finish();
        }
    }

    /// Spawns the dedicated sender thread described in spec.md §4.5.2, if
    /// the flow has an attached, remote-resolved socket.
    pub fn spawn_sender(self: &Arc<Self>) {
        if !self.has_remote() {
            return;
        }
        let flow = Arc::clone(self);
        let handle = std::thread::spawn(move || sender_loop(flow));
        *self.sender_handle.lock().unwrap() = Some(handle);
    }

    /// Processes one received data packet for this flow (spec.md §4.5.4),
    /// called by the flow manager's receiver thread once the message has
    /// been attributed to this flow.
    pub fn on_data_received(&self, now: u64, msg: &Data) {
        let mut state = self.state.lock().unwrap();

        let purge = state
            .defragmenter
            .purge(now, self.traffic_spec.defragment_timeout.as_micros() as u64);
        state.current.lost_frames += purge.lost_frames;
        state.current.lost_packets += purge.lost_packets;
        state.current.lost_bytes += purge.lost_bytes;

        state.defragmenter.add(
            now,
            msg.frame_id,
            msg.seq_number,
            msg.byte_seq_number,
            msg.payload.len() as u64,
            msg.frame_end,
        );

        if state.first_reception.is_none() {
            state.first_reception = Some(now);
        }
        state.last_reception = now;
        state.current.received_packets += 1;
        state.current.received_bytes += msg.payload.len() as u64;
        if msg.frame_end {
            state.current.received_frames += 1;
        }

        let delay = now as i64 - msg.timestamp_micros as i64;
        let delta_delay = match state.previous_delay {
            Some(prev) => {
                let d = (delay - prev).unsigned_abs() as f64;
                state.jitter += (d - state.jitter) / 16.0;
                d
            }
            None => 0.0,
        };
        state.previous_delay = Some(delay);
        let jitter = state.jitter;

        let rel_time = now.saturating_sub(self.time_base.load(Ordering::SeqCst));
        if let Some(sink) = state.vector_file.as_mut() {
            let line = format!(
                "{now} {rel_time} {} {delay} {delta_delay:.3} {jitter:.3}",
                msg.seq_number
            );
            let _ = write_line(sink.as_mut(), &line);
        }
    }
}

fn per_flow_vector_path(pattern: &str, key: FlowKey, compress: bool) -> String {
    let suffix = format!("-{:08x}-{:04x}", key.flow_id, key.stream_id);
    let mut path = format!("{pattern}{suffix}");
    if compress && !path.ends_with(".bz2") {
        path.push_str(".bz2");
    }
    path
}

/// The dedicated per-flow sender thread loop, per spec.md §4.5.2.
fn sender_loop(flow: Arc<Flow>) {
    let mut rng = rand::thread_rng();

    loop {
        if flow.cancel.load(Ordering::SeqCst) {
            break;
        }

        let now = micro_time();
        let (output_status, next_status_change) = {
            let mut state = flow.state.lock().unwrap();
            let next_change = match state.schedule.as_ref() {
                Some(s) if state.input_status != FlowStatus::WaitingForStartup => s.peek(),
                _ => None,
            };
            (state.output_status, next_change)
        };

        let saturated = flow.traffic_spec.outbound.is_saturated();
        let rate_driven = !flow.traffic_spec.outbound.is_disabled() && !saturated;

        let next_transmission = if saturated {
            Some(now)
        } else if rate_driven {
            let rate = flow.traffic_spec.outbound.frame_rate.draw(&mut rng).max(f64::EPSILON);
            let last_tx = flow.state.lock().unwrap().last_transmission;
            Some(last_tx + (1_000_000.0 / rate) as u64)
        } else {
            None
        };

        let sleep_until = [
            next_status_change,
            next_transmission,
            Some(now + 1_000_000),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(now + 1_000_000);

        if sleep_until > now {
            std::thread::sleep(Duration::from_micros((sleep_until - now).min(1_000_000)));
        }

        if flow.cancel.load(Ordering::SeqCst) {
            break;
        }

        let now = micro_time();
        if output_status == FlowStatus::On {
            // Saturated senders fire immediately and loop to produce
            // back-to-back frames; rate-driven senders send one frame per
            // wakeup, but if the loop fell behind schedule (long suspension,
            // slow sleep) they catch up by sending again immediately,
            // bounded to at most 1 second of backlog so a stalled process
            // can't burst unboundedly once it resumes.
            loop {
                match transmit_frame(&flow, &mut rng, micro_time()) {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => {
                        tracing::warn!(flow_id = flow.key.flow_id, error = %e, "transient send failure");
                    }
                    Err(e) => {
                        tracing::error!(flow_id = flow.key.flow_id, error = %e, "fatal send failure");
                        return;
                    }
                }
                if flow.cancel.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(deadline) = next_status_change {
                    if micro_time() >= deadline {
                        break;
                    }
                }
                if saturated {
                    continue;
                }
                if let Some(next) = next_transmission {
                    let behind = micro_time().saturating_sub(next);
                    if rate_driven && behind > 0 && behind < 1_000_000 {
                        continue;
                    }
                }
                break;
            }
        }

        let mut state = flow.state.lock().unwrap();
        if let Some(deadline) = state.schedule.as_ref().and_then(|s| s.peek()) {
            if micro_time() >= deadline {
                state.output_status = match state.output_status {
                    FlowStatus::On => FlowStatus::Off,
                    _ => FlowStatus::On,
                };
                if let Some(schedule) = state.schedule.as_mut() {
                    schedule.pop();
                }
            }
        }
    }
}

/// Transmits one frame, split into packets per spec.md §4.5.3.
fn transmit_frame(flow: &Arc<Flow>, rng: &mut impl rand::Rng, now: u64) -> Result<()> {
    let frame_size_draw = flow.traffic_spec.outbound.frame_size.draw(rng);
    let frame_size = if frame_size_draw <= 0.0 {
        flow.traffic_spec.max_msg_size as usize
    } else {
        frame_size_draw as usize
    };

    let frame_id = flow.next_frame_id.fetch_add(1, Ordering::SeqCst);
    let max_chunk = (flow.traffic_spec.max_msg_size as usize)
        .min(65536)
        .max(Data::HEADER_OVERHEAD + 1);

    let mut remaining = frame_size;
    let mut first = true;

    while remaining > 0 || first {
        let chunk_len = remaining.min(max_chunk.saturating_sub(Data::HEADER_OVERHEAD));
        let is_last = chunk_len >= remaining;

        let (seq_number, byte_seq_number) = {
            let mut state = flow.state.lock().unwrap();
            let seq = state.last_seq_number;
            let byte_seq = state.last_byte_seq_number;
            state.last_seq_number += 1;
            state.last_byte_seq_number += chunk_len as u64;
            if state.first_transmission.is_none() {
                state.first_transmission = Some(now);
            }
            state.last_transmission = now;
            (seq, byte_seq)
        };

        let payload = vec![0xABu8; chunk_len];
        let msg = Data {
            flow_id: flow.key.flow_id,
            measurement_id: flow.key.measurement_id,
            stream_id: flow.key.stream_id,
            frame_id,
            seq_number,
            byte_seq_number,
            timestamp_micros: now,
            frame_begin: first,
            frame_end: is_last,
            payload: payload.into(),
        };
        let encoded = msg.encode();

        {
            let state = flow.state.lock().unwrap();
            if let Some(socket) = state.socket.as_ref() {
                socket.send_message(
                    &encoded,
                    flow.traffic_spec.reliable_mode,
                    flow.traffic_spec.ordered_mode,
                    rng,
                )?;
            }
        }

        {
            let mut state = flow.state.lock().unwrap();
            state.current.transmitted_packets += 1;
            state.current.transmitted_bytes += chunk_len as u64;
            if is_last {
                state.current.transmitted_frames += 1;
            }
        }

        remaining = remaining.saturating_sub(chunk_len);
        first = false;
        if chunk_len == 0 {
            break;
        }
    }

    Ok(())
}
