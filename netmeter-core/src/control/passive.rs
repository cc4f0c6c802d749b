// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Passive-side control dispatch, per spec.md §4.8.2. One [`ControlAssociation`]
//! runs per accepted control connection; each decoded message is handled by
//! [`ControlAssociation::dispatch`], driven by whatever accept/poll loop the
//! CLI's passive-mode entry point runs.

use super::{
    accept_blocking, connect_data_socket, listen_socket, recv_message_blocking, send_acknowledge,
    traffic_spec_from_add_flow, Ports,
};
use crate::datasocket::DataSocket;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowKey};
use crate::flowmanager::{UnidentifiedSocket, FLOW_MANAGER};
use crate::reader::MessageReader;
use crate::time::micro_time;
use crate::trafficspec::Protocol;
use crate::wire::{AddFlow, Message, RemoveFlow, Results, Start, Stop, RESULTS_MAX_PAYLOAD};
use socket2::Socket;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// File-naming convention the passive side uses for its own measurement
/// files, independent of whatever pattern the active side requested
/// (spec.md §4.8.2 "files named by local convention").
pub struct LocalFilePatterns {
    pub vector_pattern: String,
    pub vector_compressed: bool,
    pub scalar_pattern: String,
    pub scalar_compressed: bool,
}

/// Listening sockets for one passive-side process, per spec.md §4.6/§6.4.
pub struct PassiveListeners {
    pub control: Socket,
    pub streams: Vec<(Protocol, Socket)>,
    pub ports: Ports,
    pub local_addrs: Vec<SocketAddr>,
}

impl PassiveListeners {
    /// Binds the control listener plus one listener per requested stream
    /// data protocol at the ports derived from `data_port`.
    pub fn bind(
        local_addrs: Vec<SocketAddr>,
        data_port: u16,
        control_over_tcp: bool,
        stream_protocols: &[Protocol],
    ) -> Result<Self> {
        let ports = Ports::from_base(data_port);
        let control_protocol = if control_over_tcp { Protocol::Tcp } else { Protocol::Sctp };

        let control_addrs: Vec<SocketAddr> =
            local_addrs.iter().map(|a| SocketAddr::new(a.ip(), ports.control)).collect();
        let control = listen_socket(control_protocol, &control_addrs)?;

        let mut streams = Vec::new();
        for &protocol in stream_protocols {
            if protocol.is_datagram() {
                continue;
            }
            let port = ports.data_port(protocol);
            let addrs: Vec<SocketAddr> = local_addrs.iter().map(|a| SocketAddr::new(a.ip(), port)).collect();
            streams.push((protocol, listen_socket(protocol, &addrs)?));
        }

        Ok(Self {
            control,
            streams,
            ports,
            local_addrs,
        })
    }

    /// Accepts the next control connection, blocking until one arrives.
    pub fn accept_control(&self) -> Result<ControlAssociation> {
        let (socket, peer) = accept_blocking(&self.control, None)?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::socket_setup(format!("O_NONBLOCK failed: {e}")))?;
        let mut control = DataSocket::new(socket, Protocol::Tcp, 0);
        control.set_remote(peer);

        let mut reader = MessageReader::new();
        reader.add_socket(control.raw_fd());
        Ok(ControlAssociation { control, reader })
    }

    /// Accepts a pending stream-data connection (one registered as
    /// "unidentified" until an `IdentifyFlow` arrives, per spec.md §4.7.2).
    pub fn accept_data(&self, protocol: Protocol) -> Result<()> {
        let listener = self
            .streams
            .iter()
            .find(|(p, _)| *p == protocol)
            .map(|(_, s)| s)
            .ok_or_else(|| Error::config("no listener bound for protocol"))?;
        let (socket, peer) = accept_blocking(listener, None)?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::socket_setup(format!("O_NONBLOCK failed: {e}")))?;
        let mut data = DataSocket::new(socket, protocol, 0);
        data.set_remote(peer);
        let fd = data.raw_fd();
        FLOW_MANAGER.register_unidentified(fd, UnidentifiedSocket { socket: data, protocol });
        Ok(())
    }
}

/// One accepted control connection and the measurement-id/local-pattern
/// state needed to answer its message stream. Reads its own control socket
/// on a dedicated loop, kept separate from the [`FLOW_MANAGER`] receiver
/// thread, which only polls flow data sockets and yet-unidentified ones
/// (spec.md §4.7.1); control channels are driven one-per-association instead.
pub struct ControlAssociation {
    control: DataSocket,
    reader: MessageReader,
}

impl ControlAssociation {
    pub fn control_fd(&self) -> std::os::unix::io::RawFd {
        self.control.raw_fd()
    }

    fn ack(&self, flow_id: u32, measurement_id: u64, stream_id: u16, ok: bool) -> Result<()> {
        send_acknowledge(&self.control, flow_id, measurement_id, stream_id, ok)
    }

    /// Drives this association until the peer disconnects or a malformed
    /// message is received, dispatching every decoded message to
    /// [`Self::dispatch`]. Runs on its own thread, one per accepted control
    /// connection (spec.md §4.8.2).
    pub fn run(&mut self, local: &LocalFilePatterns) {
        loop {
            let msg = match recv_message_blocking(&self.control, &mut self.reader, None) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::info!(error = %e, "control association closed");
                    break;
                }
            };
            if let Err(e) = self.dispatch(msg, local) {
                tracing::warn!(error = %e, "control message handling failed");
            }
        }
        handle_association_shutdown(self.control_fd());
    }

    /// Handles one decoded control message, per spec.md §4.8.2's dispatch
    /// table. `local` supplies this process's own file-naming convention
    /// for `Start`/`Stop`.
    pub fn dispatch(&self, msg: Message, local: &LocalFilePatterns) -> Result<()> {
        match msg {
            Message::AddFlow(add_flow) => self.handle_add_flow(add_flow),
            Message::RemoveFlow(remove) => self.handle_remove_flow(remove, local),
            Message::Start(start) => self.handle_start(start, local),
            Message::Stop(stop) => self.handle_stop(stop, local),
            other => Err(Error::protocol(format!("unexpected control message {other:?}"))),
        }
    }

    fn handle_add_flow(&self, add_flow: AddFlow) -> Result<()> {
        let key = FlowKey {
            measurement_id: add_flow.measurement_id,
            flow_id: add_flow.flow_id,
            stream_id: add_flow.stream_id,
        };

        if FLOW_MANAGER.find_flow(key).is_some() {
            self.ack(key.flow_id, key.measurement_id, key.stream_id, false)?;
            return Err(Error::config("AddFlow: flow already exists"));
        }

        let spec = match traffic_spec_from_add_flow(&add_flow) {
            Ok(spec) => spec,
            Err(e) => {
                self.ack(key.flow_id, key.measurement_id, key.stream_id, false)?;
                return Err(e);
            }
        };

        let flow = Flow::new(key, spec, self.control.raw_fd());
        FLOW_MANAGER.add_flow(flow);
        self.ack(key.flow_id, key.measurement_id, key.stream_id, true)
    }

    /// Connects this process's outbound data socket for a mirrored flow.
    /// Used after `AddFlow` when the passive side must itself originate the
    /// data connection for transports the active side doesn't dial (kept
    /// as a narrow helper; most deployments have the active side dial both
    /// directions, per spec.md §4.8.1 `IdentifyFlow`).
    pub fn connect_mirror_data_socket(
        &self,
        flow: &Arc<Flow>,
        remote: SocketAddr,
        local_addrs: &[SocketAddr],
    ) -> Result<()> {
        let socket = connect_data_socket(
            flow.traffic_spec.protocol,
            local_addrs,
            remote,
            flow.key.stream_id,
            Duration::from_secs(10),
            flow.traffic_spec.v6only,
        )?;
        flow.attach_socket(socket);
        FLOW_MANAGER.register_flow_socket(flow);
        Ok(())
    }

    fn handle_remove_flow(&self, remove: RemoveFlow, local: &LocalFilePatterns) -> Result<()> {
        let key = FlowKey {
            measurement_id: remove.measurement_id,
            flow_id: remove.flow_id,
            stream_id: remove.stream_id,
        };
        let flow = FLOW_MANAGER
            .find_flow(key)
            .ok_or_else(|| Error::config("RemoveFlow: no such flow"))?;

        flow.join_sender();
        self.upload_flow_vector_file(&flow, local)?;
        FLOW_MANAGER.remove_flow(key);
        Ok(())
    }

    /// Flushes and streams back this flow's per-flow vector file, per
    /// spec.md §4.8.2: "flush its vector file; if non-empty, stream its
    /// contents back as Results messages... with a final EOF." `join_sender`
    /// has already closed the file by the time this runs; the path is
    /// reconstructed from the same naming convention `init_vector_file` used.
    fn upload_flow_vector_file(&self, flow: &Arc<Flow>, local: &LocalFilePatterns) -> Result<()> {
        if local.vector_pattern.is_empty() {
            return Ok(());
        }
        let path = flow.vector_file_path(&local.vector_pattern, local.vector_compressed);
        self.upload_file(&path)
    }

    fn handle_start(&self, start: Start, local: &LocalFilePatterns) -> Result<()> {
        FLOW_MANAGER.start_measurement(
            self.control.raw_fd(),
            start.measurement_id,
            micro_time(),
            &local.vector_pattern,
            local.vector_compressed,
            &local.scalar_pattern,
            local.scalar_compressed,
            false,
        )?;
        self.ack(0, start.measurement_id, 0, true)
    }

    fn handle_stop(&self, stop: Stop, local: &LocalFilePatterns) -> Result<()> {
        FLOW_MANAGER.stop_measurement(self.control.raw_fd(), stop.measurement_id)?;
        self.ack(0, stop.measurement_id, 0, true)?;

        if !local.vector_pattern.is_empty() {
            let path = format!("{}-passive", local.vector_pattern);
            self.upload_file(&path)?;
        }
        if !local.scalar_pattern.is_empty() {
            let path = format!("{}-passive", local.scalar_pattern);
            self.upload_file(&path)?;
        }
        Ok(())
    }

    /// Streams a local file back as a sequence of `Results` messages, per
    /// spec.md §4.8.2 "Result streaming".
    fn upload_file(&self, path: &str) -> Result<()> {
        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut buf = vec![0u8; RESULTS_MAX_PAYLOAD];
        loop {
            let n = file.read(&mut buf)?;
            let eof = n < buf.len();
            let results = Results {
                eof,
                data: bytes::Bytes::copy_from_slice(&buf[..n]),
            };
            let encoded = results.encode()?;
            if let Err(e) = super::send_framed(&self.control, &encoded) {
                tracing::error!(error = %e, "results upload failed, aborting association");
                return Err(e);
            }
            if eof {
                break;
            }
        }
        Ok(())
    }
}

/// Handles control-association shutdown (SCTP `COMM_LOST`/`SHUTDOWN_COMP`,
/// or a plain TCP disconnect), per spec.md §4.8.2: cascades to destroying
/// every measurement (and thus flow) keyed to this control socket.
pub fn handle_association_shutdown(control_fd: std::os::unix::io::RawFd) {
    FLOW_MANAGER.purge_control_socket(control_fd);
}
