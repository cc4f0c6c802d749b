// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Active-side control orchestration: sequential `AddFlow` / `IdentifyFlow`
//! / `Start` / `Stop` over one control association, per spec.md §4.8.1.

use super::{
    await_acknowledge, build_add_flow, build_identify_flow, connect_data_socket, recv_message_blocking,
    send_framed, Ports,
};
use crate::datasocket::DataSocket;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowKey};
use crate::flowmanager::FLOW_MANAGER;
use crate::outputfile;
use crate::reader::{FramedSocket, MessageReader};
use crate::socketcfg::{self, FlowSocketOptions};
use crate::time::micro_time;
use crate::trafficspec::{Protocol, TrafficSpec};
use crate::wire::Message;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Retry budget for identifying a flow over an unreliable transport
/// (spec.md §4.8.1: "retransmit up to 10 times with a 30-second ack timeout
/// per attempt").
const IDENTIFY_RETRIES_UNRELIABLE: u32 = 10;
const IDENTIFY_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters for the active side's `Start`, per spec.md §4.8.1.
pub struct StartConfig {
    pub active_node_name: String,
    pub passive_node_name: String,
    pub config_path: String,
    pub vector_pattern: String,
    pub vector_compressed: bool,
    pub scalar_pattern: String,
    pub scalar_compressed: bool,
}

/// One driven measurement run from the initiating node's side.
pub struct ActiveSession {
    control: DataSocket,
    reader: MessageReader,
    local_addrs: Vec<SocketAddr>,
    remote_host: SocketAddr,
    ports: Ports,
    v6only: bool,
}

impl ActiveSession {
    /// Connects the control channel, per spec.md §4.8.1/§6.3/§6.4. `remote`
    /// carries the passive side's data port `p`; the control port `p+1` is
    /// derived from it.
    pub fn connect(
        remote: SocketAddr,
        control_over_tcp: bool,
        local_addrs: Vec<SocketAddr>,
        v6only: bool,
    ) -> Result<Self> {
        let ports = Ports::from_base(remote.port());
        let control_protocol = if control_over_tcp { Protocol::Tcp } else { Protocol::Sctp };
        let control_addr = SocketAddr::new(remote.ip(), ports.control);

        let mut control = connect_data_socket(
            control_protocol,
            &local_addrs,
            control_addr,
            0,
            Duration::from_secs(10),
            v6only,
        )?;
        control.set_remote(control_addr);

        let mut reader = MessageReader::new();
        reader.add_socket(control.raw_fd());

        Ok(Self {
            control,
            reader,
            local_addrs,
            remote_host: remote,
            ports,
            v6only,
        })
    }

    fn send_control(&self, bytes: bytes::Bytes) -> Result<()> {
        send_framed(&self.control, &bytes)
    }

    fn await_ack(&mut self, flow_id: u32, measurement_id: u64, stream_id: u16, timeout: Option<Duration>) -> Result<()> {
        await_acknowledge(&self.control, &mut self.reader, flow_id, measurement_id, stream_id, timeout)
    }

    /// `AddFlow(flow)`, per spec.md §4.8.1: encode, send, await acknowledge,
    /// then register the local mirror `Flow` with the manager.
    pub fn add_flow(&mut self, key: FlowKey, spec: TrafficSpec) -> Result<Arc<Flow>> {
        let add_flow = build_add_flow(key, &spec);
        self.send_control(add_flow.encode())?;
        self.await_ack(key.flow_id, key.measurement_id, key.stream_id, Some(Duration::from_secs(30)))?;

        let flow = Flow::new(key, spec, self.control.raw_fd());
        FLOW_MANAGER.add_flow(Arc::clone(&flow));
        Ok(flow)
    }

    /// `IdentifyFlow(flow)`, per spec.md §4.8.1: connects the flow's data
    /// socket and sends (or retransmits, for unreliable transports) the
    /// Identify message.
    pub fn identify_flow(&mut self, flow: &Arc<Flow>, compress_vectors: bool, no_vectors: bool) -> Result<()> {
        let protocol = flow.traffic_spec.protocol;
        let data_port = self.ports.data_port(protocol);
        let remote = SocketAddr::new(self.remote_host.ip(), data_port);

        let data_socket = connect_data_socket(
            protocol,
            &self.local_addrs,
            remote,
            flow.key.stream_id,
            Duration::from_secs(10),
            self.v6only,
        )?;

        socketcfg::apply_flow_socket_options(
            data_socket.raw(),
            protocol,
            &FlowSocketOptions {
                snd_buffer_size: flow.traffic_spec.snd_buffer_size,
                rcv_buffer_size: flow.traffic_spec.rcv_buffer_size,
                cmt: flow.traffic_spec.cmt,
                ccid: flow.traffic_spec.ccid,
            },
        )?;

        flow.attach_socket(data_socket);
        FLOW_MANAGER.register_flow_socket(flow);

        let identify = build_identify_flow(flow.key, compress_vectors, no_vectors);
        let encoded = identify.encode();

        let attempts = if protocol.is_datagram() {
            IDENTIFY_RETRIES_UNRELIABLE
        } else {
            1
        };

        let mut last_err = None;
        for _ in 0..attempts {
            let sent = flow
                .with_socket(|s| super::send_framed(s, &encoded))
                .unwrap_or_else(|| Err(Error::protocol("flow socket vanished before identify")));
            if let Err(e) = sent {
                last_err = Some(e);
                continue;
            }
            match self.await_ack(flow.key.flow_id, flow.key.measurement_id, flow.key.stream_id, Some(IDENTIFY_ACK_TIMEOUT)) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::protocol("identify failed with no attempts made")))
    }

    /// `Start(measurementID, ...)`, per spec.md §4.8.1: optional config-file
    /// dump, local `startMeasurement`, then control-channel Start/ack.
    pub fn start(&mut self, measurement_id: u64, cfg: &StartConfig, flows: &[Arc<Flow>]) -> Result<()> {
        if !cfg.config_path.is_empty() {
            write_config_file(&cfg.config_path, cfg, flows)?;
        }

        FLOW_MANAGER.start_measurement(
            self.control.raw_fd(),
            measurement_id,
            micro_time(),
            &cfg.vector_pattern,
            cfg.vector_compressed,
            &cfg.scalar_pattern,
            cfg.scalar_compressed,
            true,
        )?;

        let start = crate::wire::Start {
            measurement_id,
            compress_vectors: cfg.vector_compressed,
            compress_scalars: cfg.scalar_compressed,
            no_vectors: cfg.vector_pattern.is_empty(),
            no_scalars: cfg.scalar_pattern.is_empty(),
        };
        self.send_control(start.encode())?;
        self.await_ack(0, measurement_id, 0, Some(Duration::from_secs(30)))
    }

    /// `Stop(measurementID)`, per spec.md §4.8.1: stop locally, write
    /// scalars, exchange Stop/ack, then download every remote result file
    /// and remove each flow on the passive side.
    pub fn stop(&mut self, measurement_id: u64, cfg: &StartConfig, flows: &[Arc<Flow>]) -> Result<()> {
        FLOW_MANAGER.stop_measurement(self.control.raw_fd(), measurement_id)?;

        let stop = crate::wire::Stop { measurement_id };
        self.send_control(stop.encode())?;
        self.await_ack(0, measurement_id, 0, Some(Duration::from_secs(30)))?;

        if !cfg.vector_pattern.is_empty() {
            self.download_results(&format!("{}-passive", cfg.vector_pattern))?;
        }
        if !cfg.scalar_pattern.is_empty() {
            self.download_results(&format!("{}-passive", cfg.scalar_pattern))?;
        }

        for flow in flows {
            // RemoveFlow must go out first: the passive side only starts
            // streaming this flow's vector file once it sees RemoveFlow.
            let remove = crate::wire::RemoveFlow {
                flow_id: flow.key.flow_id,
                measurement_id: flow.key.measurement_id,
                stream_id: flow.key.stream_id,
            };
            self.send_control(remove.encode())?;

            if !cfg.vector_pattern.is_empty() {
                let remote_path = flow.vector_file_path(&format!("{}-passive", cfg.vector_pattern), cfg.vector_compressed);
                self.download_results(&remote_path)?;
            }
        }

        Ok(())
    }

    /// Receives a `Results` message stream into a freshly created local
    /// file until EOF, per spec.md §4.8.1.
    fn download_results(&mut self, local_path: &str) -> Result<()> {
        let mut sink = match outputfile::open(local_path)? {
            Some(sink) => sink,
            None => return Ok(()),
        };
        loop {
            match recv_message_blocking(&self.control, &mut self.reader, Some(Duration::from_secs(30)))? {
                Message::Results(results) => {
                    sink.write(&results.data)?;
                    if results.eof {
                        break;
                    }
                }
                other => {
                    tracing::warn!(?other, "unexpected message while downloading results");
                }
            }
        }
        sink.finish()
    }
}

fn write_config_file(path: &str, cfg: &StartConfig, flows: &[Arc<Flow>]) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "# NetPerfMeter measurement configuration")?;
    writeln!(file, "active-node: {}", cfg.active_node_name)?;
    writeln!(file, "passive-node: {}", cfg.passive_node_name)?;
    for flow in flows {
        writeln!(
            file,
            "flow {} measurement {} stream {} protocol {} description \"{}\"",
            flow.key.flow_id,
            flow.key.measurement_id,
            flow.key.stream_id,
            flow.traffic_spec.protocol,
            flow.traffic_spec.description,
        )?;
    }
    Ok(())
}
