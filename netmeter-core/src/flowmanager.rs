// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide registry of flows, measurements, and yet-unidentified
//! incoming sockets; single receiver thread that polls all of them, per
//! spec.md §4.7.

use crate::cpu::SysinfoCpuSampler;
use crate::datasocket::DataSocket;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowKey};
use crate::measurement::{Measurement, MeasurementKey};
use crate::reader::{MessageReader, ReceiveStatus};
use crate::time::micro_time;
use crate::trafficspec::Protocol;
use crate::wire::Message;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An accepted passive-side connection not yet matched to any flow, per
/// spec.md §3 `UnidentifiedSocket`.
pub struct UnidentifiedSocket {
    pub socket: DataSocket,
    pub protocol: Protocol,
}

/// Global singleton, per spec.md §9: "a lazily-initialized value behind an
/// interior-mutability lock works cleanly."
pub static FLOW_MANAGER: Lazy<FlowManager> = Lazy::new(FlowManager::new);

/// One received message's outcome, handed to the caller-supplied dispatch
/// closure so `control::passive` can implement the handler table of spec.md
/// §4.8.2 without this module knowing about control-message semantics.
pub enum ReceivedMessage {
    /// A `Data` message was attributed to a live flow and already applied
    /// (spec.md §4.5.4 runs here, centrally, as the spec requires).
    AppliedToFlow(FlowKey),
    /// Any other message type, decoded but not yet acted on, arriving on
    /// `fd` (a control socket or a not-yet-identified data socket).
    Control(RawFd, Message),
}

struct Registry {
    flows: Vec<Arc<Flow>>,
    unidentified: HashMap<RawFd, UnidentifiedSocket>,
    measurements: HashMap<MeasurementKey, Arc<Measurement>>,
}

/// Owns every flow, measurement, and unidentified socket in the process
/// behind one lock (spec.md §5: "within that lock, per-flow and
/// per-measurement locks may be acquired but not vice versa"). The framed
/// reader's per-socket state lives in its own lock since it's accessed on
/// the hot receive path independently of registry mutation.
pub struct FlowManager {
    registry: Mutex<Registry>,
    reader: Mutex<MessageReader>,
    cancel_receiver: AtomicBool,
}

impl FlowManager {
    fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                flows: Vec::new(),
                unidentified: HashMap::new(),
                measurements: HashMap::new(),
            }),
            reader: Mutex::new(MessageReader::new()),
            cancel_receiver: AtomicBool::new(false),
        }
    }

    pub fn add_flow(&self, flow: Arc<Flow>) {
        self.registry.lock().unwrap().flows.push(flow);
    }

    pub fn find_flow(&self, key: FlowKey) -> Option<Arc<Flow>> {
        self.registry.lock().unwrap().flows.iter().find(|f| f.key == key).cloned()
    }

    pub fn remove_flow(&self, key: FlowKey) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(pos) = registry.flows.iter().position(|f| f.key == key) {
            let flow = registry.flows.remove(pos);
            if let Some(fd) = flow.raw_fd() {
                self.reader.lock().unwrap().remove_socket(fd);
            }
        }
    }

    pub fn flows_snapshot(&self) -> Vec<Arc<Flow>> {
        self.registry.lock().unwrap().flows.clone()
    }

    /// Registers an accepted-but-unidentified socket (spec.md §3
    /// `UnidentifiedSocket`).
    pub fn register_unidentified(&self, fd: RawFd, socket: UnidentifiedSocket) {
        self.reader.lock().unwrap().add_socket(fd);
        self.registry.lock().unwrap().unidentified.insert(fd, socket);
    }

    /// Registers interest in a flow's just-attached socket (the active side
    /// does this right after connecting, before sending `IdentifyFlow`).
    pub fn register_flow_socket(&self, flow: &Arc<Flow>) {
        if let Some(fd) = flow.raw_fd() {
            self.reader.lock().unwrap().add_socket(fd);
        }
    }

    /// Socket identification, per spec.md §4.7.2: matches an incoming
    /// IdentifyFlow message on an unidentified socket to a flow with no
    /// remote address yet.
    pub fn handle_identify(
        &self,
        fd: RawFd,
        identify: crate::wire::IdentifyFlow,
        peer: Option<SocketAddr>,
    ) -> Result<Arc<Flow>> {
        let key = FlowKey {
            measurement_id: identify.measurement_id,
            flow_id: identify.flow_id,
            stream_id: identify.stream_id,
        };

        let (flow, unidentified) = {
            let mut registry = self.registry.lock().unwrap();
            let flow = registry
                .flows
                .iter()
                .find(|f| f.key == key && !f.has_remote())
                .cloned();
            let Some(flow) = flow else {
                return Err(Error::IdentifyMiss);
            };
            let unidentified = registry
                .unidentified
                .remove(&fd)
                .ok_or_else(|| Error::protocol("identify on socket with no unidentified entry"))?;
            (flow, unidentified)
        };

        let mut socket = unidentified.socket;
        if let Some(addr) = peer {
            socket.set_remote(addr);
        }
        flow.attach_socket(socket);
        Ok(flow)
    }

    /// `startMeasurement`, per spec.md §4.7.3.
    #[allow(clippy::too_many_arguments)]
    pub fn start_measurement(
        &self,
        control_socket: RawFd,
        measurement_id: u64,
        now: u64,
        vector_pattern: &str,
        vector_compressed: bool,
        scalar_pattern: &str,
        scalar_compressed: bool,
        is_active_side: bool,
    ) -> Result<Arc<Measurement>> {
        let key = MeasurementKey {
            control_socket,
            measurement_id,
        };
        {
            let registry = self.registry.lock().unwrap();
            if registry.measurements.contains_key(&key) {
                return Err(crate::measurement::duplicate_measurement_error(key));
            }
        }

        let measurement = Measurement::initialize(
            control_socket,
            measurement_id,
            now,
            vector_pattern,
            vector_compressed,
            scalar_pattern,
            scalar_compressed,
            is_active_side,
            Box::new(SysinfoCpuSampler::new()),
        )?;

        let mut registry = self.registry.lock().unwrap();
        registry.measurements.insert(key, Arc::clone(&measurement));

        let matching: Vec<Arc<Flow>> = registry
            .flows
            .iter()
            .filter(|f| f.key.measurement_id == measurement_id)
            .cloned()
            .collect();
        drop(registry);

        for flow in matching {
            *flow.measurement_key.lock().unwrap() = Some((control_socket, measurement_id));
            flow.start(now);
            flow.spawn_sender();
        }

        measurement.spawn_stats_thread(move || FLOW_MANAGER.flows_for_measurement(measurement_id));

        Ok(measurement)
    }

    /// Flows currently registered under `measurement_id`, across any control
    /// socket. Used by `Measurement`'s periodic stats thread, which only
    /// knows the `MeasurementID` half of its key.
    pub fn flows_for_measurement(&self, measurement_id: u64) -> Vec<Arc<Flow>> {
        self.registry
            .lock()
            .unwrap()
            .flows
            .iter()
            .filter(|f| f.key.measurement_id == measurement_id)
            .cloned()
            .collect()
    }

    /// `stopMeasurement`, per spec.md §4.7.3: two-stage teardown so every
    /// flow's sender can shut down in parallel rather than serially.
    pub fn stop_measurement(&self, control_socket: RawFd, measurement_id: u64) -> Result<()> {
        let key = MeasurementKey {
            control_socket,
            measurement_id,
        };
        let (measurement, matching_flows) = {
            let registry = self.registry.lock().unwrap();
            let measurement = registry
                .measurements
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::config("stopMeasurement: no such measurement"))?;
            let flows: Vec<_> = registry
                .flows
                .iter()
                .filter(|f| f.key.measurement_id == measurement_id)
                .cloned()
                .collect();
            (measurement, flows)
        };

        for flow in &matching_flows {
            flow.request_stop();
        }
        for flow in &matching_flows {
            flow.join_sender();
        }

        measurement.stop_stats_thread();
        measurement.write_scalar_statistics(&matching_flows)?;
        measurement.finish()?;
        Ok(())
    }

    pub fn measurement(&self, control_socket: RawFd, measurement_id: u64) -> Option<Arc<Measurement>> {
        self.registry
            .lock()
            .unwrap()
            .measurements
            .get(&MeasurementKey {
                control_socket,
                measurement_id,
            })
            .cloned()
    }

    /// Removes every measurement keyed to `control_socket`, cascading to
    /// destroy their flows (spec.md §4.8.2 control-association shutdown).
    /// spec.md §9 leaves the ordering between sender-thread quiescence and
    /// measurement destruction an open question; we resolve it by stopping
    /// each matching flow's sender before dropping the measurement entry
    /// (see DESIGN.md).
    pub fn purge_control_socket(&self, control_socket: RawFd) {
        let mut registry = self.registry.lock().unwrap();
        let doomed_flows: Vec<Arc<Flow>> = registry
            .flows
            .iter()
            .filter(|f| f.control_socket == control_socket)
            .cloned()
            .collect();
        let doomed_measurements: Vec<Arc<Measurement>> = registry
            .measurements
            .iter()
            .filter(|(k, _)| k.control_socket == control_socket)
            .map(|(_, m)| Arc::clone(m))
            .collect();
        registry.measurements.retain(|k, _| k.control_socket != control_socket);
        registry.flows.retain(|f| f.control_socket != control_socket);
        drop(registry);

        for flow in doomed_flows {
            flow.request_stop();
            flow.join_sender();
        }
        for measurement in doomed_measurements {
            measurement.stop_stats_thread();
        }
    }

    pub fn request_receiver_stop(&self) {
        self.cancel_receiver.store(true, Ordering::SeqCst);
    }

    /// The receiver thread loop, per spec.md §4.7.1. `dispatch` receives
    /// every non-`Data` message (control messages on data or control
    /// sockets); `Data` messages are applied directly to their flow here,
    /// since spec.md §4.5.4 centralizes receive handling in the manager.
    pub fn run_receiver_loop(&self, mut dispatch: impl FnMut(ReceivedMessage)) {
        loop {
            if self.cancel_receiver.load(Ordering::SeqCst) {
                break;
            }

            let pending: Vec<RawFd> = {
                let registry = self.registry.lock().unwrap();
                registry
                    .flows
                    .iter()
                    .filter_map(|f| f.raw_fd())
                    .chain(registry.unidentified.keys().copied())
                    .collect()
            };

            if pending.is_empty() {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }

            for fd in pending {
                self.poll_one(fd, &mut dispatch);
            }

            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn poll_one(&self, fd: RawFd, dispatch: &mut impl FnMut(ReceivedMessage)) {
        let flow = self.registry.lock().unwrap().flows.iter().find(|f| f.raw_fd() == Some(fd)).cloned();

        if let Some(flow) = flow {
            let received = flow.with_socket(|socket| self.reader.lock().unwrap().receive(socket));
            match received {
                Some(Ok(bytes)) => self.dispatch_flow_bytes(&flow, bytes, dispatch),
                Some(Err(ReceiveStatus::PartialRead)) => {}
                Some(Err(_)) => {
                    tracing::warn!(flow_id = flow.key.flow_id, "flow socket error, marking stopped");
                    flow.request_stop();
                }
                None => {}
            }
            return;
        }

        let disconnected = {
            let registry = self.registry.lock().unwrap();
            let socket_present = registry.unidentified.contains_key(&fd);
            if !socket_present {
                return;
            }
            // Borrow the socket only long enough to receive; the registry
            // lock is held for the duration since `UnidentifiedSocket` isn't
            // `Clone` and its fd can't change underneath us while a
            // receiver iteration is in flight.
            let socket = &registry.unidentified.get(&fd).unwrap().socket;
            self.reader.lock().unwrap().receive(socket)
        };

        match disconnected {
            Ok(bytes) => {
                if let Ok(msg) = Message::decode(bytes) {
                    if let Message::IdentifyFlow(identify) = &msg {
                        match self.handle_identify(fd, identify.clone(), None) {
                            Ok(flow) => self.reader.lock().unwrap().add_socket(flow.raw_fd().unwrap_or(fd)),
                            Err(e) => tracing::warn!(error = %e, "identify failed"),
                        }
                    } else {
                        dispatch(ReceivedMessage::Control(fd, msg));
                    }
                }
            }
            Err(ReceiveStatus::PartialRead) => {}
            Err(_) => {
                self.registry.lock().unwrap().unidentified.remove(&fd);
                self.reader.lock().unwrap().remove_socket(fd);
            }
        }
    }

    fn dispatch_flow_bytes(&self, flow: &Arc<Flow>, bytes: bytes::Bytes, dispatch: &mut impl FnMut(ReceivedMessage)) {
        match Message::decode(bytes) {
            Ok(Message::Data(data)) => {
                flow.on_data_received(micro_time(), &data);
                dispatch(ReceivedMessage::AppliedToFlow(flow.key));
            }
            Ok(other) => dispatch(ReceivedMessage::Control(flow.control_socket, other)),
            Err(e) => tracing::warn!(error = %e, "malformed message on flow socket"),
        }
    }
}
