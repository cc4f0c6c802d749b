// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control protocol orchestration, per spec.md §4.8. `active` drives the
//! measurement from the node that initiates it; `passive` answers control
//! messages dispatched by the [`crate::flowmanager::FlowManager`] receiver
//! thread.

pub mod active;
pub mod passive;

use crate::datasocket::DataSocket;
use crate::error::{Error, Result};
use crate::reader::{MessageReader, ReceiveStatus};
use crate::time::micro_time;
use crate::trafficspec::{Protocol, TrafficSpec};
use crate::wire::{self, AckStatus, Acknowledge, IdentifyFlow, Message};
use bytes::Bytes;
use socket2::{SockAddr, Socket};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// Ports derived from the passive side's data port `p`, per spec.md §6.4.
#[derive(Clone, Copy, Debug)]
pub struct Ports {
    pub control: u16,
    pub data: u16,
    pub mptcp: u16,
}

impl Ports {
    pub fn from_base(p: u16) -> Self {
        Self {
            control: p + 1,
            data: p,
            mptcp: p.saturating_sub(1),
        }
    }

    pub fn data_port(&self, protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Mptcp => self.mptcp,
            _ => self.data,
        }
    }
}

/// Reads messages off a connected [`DataSocket`] with a bounded wait,
/// polling the nonblocking socket at a short interval. `None` timeout means
/// wait forever (spec.md §4.8.1 `timeoutMs = ∞`).
pub fn recv_message_blocking(
    socket: &DataSocket,
    reader: &mut MessageReader,
    timeout: Option<Duration>,
) -> Result<Message> {
    let deadline = timeout.map(|t| micro_time() + t.as_micros() as u64);
    loop {
        match reader.receive(socket) {
            Ok(bytes) => return Message::decode(bytes),
            Err(ReceiveStatus::PartialRead) => {
                if let Some(deadline) = deadline {
                    if micro_time() >= deadline {
                        return Err(Error::AckTimeout(timeout.unwrap_or_default()));
                    }
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(ReceiveStatus::Notification) => return Err(Error::AssociationNotification),
            Err(_) => return Err(Error::protocol("control channel closed or malformed")),
        }
    }
}

/// Sends `bytes` on `socket`, framing it as a whole message in one go; the
/// control channel is always a reliable stream or SCTP association so a
/// short write here is always a real error, never backpressure to retry.
pub fn send_framed(socket: &DataSocket, bytes: &Bytes) -> Result<()> {
    let mut rng = rand::thread_rng();
    socket.send_message(bytes, 1.0, 1.0, &mut rng)
}

/// Reads one [`Acknowledge`] and validates its identifier triple, per
/// spec.md §4.8.1 `awaitAcknowledge`.
pub fn await_acknowledge(
    socket: &DataSocket,
    reader: &mut MessageReader,
    flow_id: u32,
    measurement_id: u64,
    stream_id: u16,
    timeout: Option<Duration>,
) -> Result<()> {
    match recv_message_blocking(socket, reader, timeout)? {
        Message::Acknowledge(ack) => {
            if ack.flow_id != flow_id || ack.measurement_id != measurement_id || ack.stream_id != stream_id {
                return Err(Error::AckMismatch {
                    exp_flow: flow_id,
                    exp_measurement: measurement_id,
                    exp_stream: stream_id,
                    got_flow: ack.flow_id,
                    got_measurement: ack.measurement_id,
                    got_stream: ack.stream_id,
                });
            }
            match ack.status {
                AckStatus::Okay => Ok(()),
                AckStatus::Error => Err(Error::AckFailed),
            }
        }
        _ => Err(Error::protocol("expected Acknowledge")),
    }
}

pub fn send_acknowledge(
    socket: &DataSocket,
    flow_id: u32,
    measurement_id: u64,
    stream_id: u16,
    ok: bool,
) -> Result<()> {
    let ack = Acknowledge {
        flow_id,
        measurement_id,
        stream_id,
        status: if ok { AckStatus::Okay } else { AckStatus::Error },
    };
    send_framed(socket, &ack.encode())
}

/// Connects a nonblocking stream socket, polling for write-readiness until
/// the TCP/SCTP handshake completes or `timeout` elapses.
pub fn connect_blocking(socket: &Socket, addr: SocketAddr, timeout: Duration) -> Result<()> {
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(Error::socket_setup(format!("connect() failed: {e}"))),
    }

    let fd = socket.as_raw_fd();
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as libc::c_int) };
    if ret == 0 {
        return Err(Error::socket_setup("connect() timed out"));
    }
    if ret < 0 {
        return Err(Error::socket_setup(format!(
            "poll() during connect failed: {}",
            io::Error::last_os_error()
        )));
    }

    match socket.take_error() {
        Ok(None) => Ok(()),
        Ok(Some(e)) => Err(Error::socket_setup(format!("connect() failed: {e}"))),
        Err(e) => Err(Error::socket_setup(format!("SO_ERROR read failed: {e}"))),
    }
}

/// Creates, connects (for stream transports), and wraps a fresh data
/// socket for one flow, per spec.md §4.6/§6.4.
pub fn connect_data_socket(
    protocol: Protocol,
    local_addrs: &[SocketAddr],
    remote: SocketAddr,
    stream_id: u16,
    connect_timeout: Duration,
    v6only: bool,
) -> Result<DataSocket> {
    let bound = crate::socketcfg::create_and_bind_socket(protocol, local_addrs, false, v6only)?;

    if protocol.is_reliable_stream() {
        connect_blocking(&bound.socket, remote, connect_timeout)?;
    }

    let mut data = DataSocket::new(bound.socket, protocol, stream_id);
    data.set_remote(remote);
    Ok(data)
}

/// Creates a listening socket for the control channel or a stream data
/// channel, per spec.md §4.6.
pub fn listen_socket(protocol: Protocol, local_addrs: &[SocketAddr]) -> Result<Socket> {
    Ok(crate::socketcfg::create_and_bind_socket(protocol, local_addrs, true, false)?.socket)
}

/// Accepts one connection off a nonblocking listening socket, blocking (via
/// `poll`) until one arrives.
pub fn accept_blocking(listener: &Socket, timeout: Option<Duration>) -> Result<(Socket, SocketAddr)> {
    let fd = listener.as_raw_fd();
    loop {
        match listener.accept() {
            Ok((socket, addr)) => {
                let addr = addr
                    .as_socket()
                    .ok_or_else(|| Error::protocol("accepted connection has non-IP peer address"))?;
                return Ok((socket, addr));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let mut pollfd = libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                };
                let wait_ms = timeout.map(|t| t.as_millis() as libc::c_int).unwrap_or(-1);
                let ret = unsafe { libc::poll(&mut pollfd, 1, wait_ms) };
                if ret == 0 {
                    return Err(Error::socket_setup("accept() timed out"));
                }
                if ret < 0 {
                    return Err(Error::socket_setup(format!(
                        "poll() during accept failed: {}",
                        io::Error::last_os_error()
                    )));
                }
            }
            Err(e) => return Err(Error::socket_setup(format!("accept() failed: {e}"))),
        }
    }
}

/// Builds the `AddFlow` wire message for `key`/`spec`, per spec.md §4.1/§4.8.1.
pub fn build_add_flow(key: crate::flow::FlowKey, spec: &TrafficSpec) -> wire::AddFlow {
    wire::AddFlow {
        flow_id: key.flow_id,
        measurement_id: key.measurement_id,
        stream_id: key.stream_id,
        protocol: spec.protocol.to_wire(),
        description: spec.description.clone(),
        ordered_mode: spec.ordered_mode,
        reliable_mode: spec.reliable_mode,
        retransmission_trials: wire::RetransmissionTrials {
            trials: spec.retransmission_trials,
            is_ms: spec.retransmission_trials_in_ms,
        },
        frame_rate: spec.outbound.frame_rate,
        frame_size: spec.outbound.frame_size,
        rcv_buffer_size: spec.rcv_buffer_size,
        snd_buffer_size: spec.snd_buffer_size,
        max_msg_size: spec.max_msg_size,
        cmt: spec.cmt,
        ccid: spec.ccid,
        n_diff_ports: spec.n_diff_ports,
        path_mgr: spec.path_mgr.clone(),
        congestion_control: spec.congestion_control.clone(),
        on_off_events: spec.on_off_events.clone(),
        debug: spec.debug,
        no_delay: spec.no_delay,
    }
}

/// Rebuilds a [`TrafficSpec`] from a decoded `AddFlow`, swapping in/out so
/// the passive side's mirror flow sends on what the active side receives
/// on, per spec.md §4.8.2.
pub fn traffic_spec_from_add_flow(add_flow: &wire::AddFlow) -> Result<TrafficSpec> {
    let protocol = Protocol::from_wire(add_flow.protocol)
        .ok_or_else(|| Error::protocol("unknown protocol in AddFlow"))?;
    let spec = TrafficSpec {
        protocol,
        description: add_flow.description.clone(),
        outbound: crate::trafficspec::DirectionSpec {
            frame_rate: crate::randomvar::RandomVariable::constant(0.0),
            frame_size: crate::randomvar::RandomVariable::constant(0.0),
        },
        inbound: crate::trafficspec::DirectionSpec {
            frame_rate: add_flow.frame_rate,
            frame_size: add_flow.frame_size,
        },
        max_msg_size: add_flow.max_msg_size,
        defragment_timeout: Duration::from_millis(5000),
        ordered_mode: add_flow.ordered_mode,
        reliable_mode: add_flow.reliable_mode,
        retransmission_trials: add_flow.retransmission_trials.trials,
        retransmission_trials_in_ms: add_flow.retransmission_trials.is_ms,
        cmt: add_flow.cmt,
        ccid: add_flow.ccid,
        n_diff_ports: add_flow.n_diff_ports,
        on_off_events: add_flow.on_off_events.clone(),
        rcv_buffer_size: add_flow.rcv_buffer_size,
        snd_buffer_size: add_flow.snd_buffer_size,
        path_mgr: add_flow.path_mgr.clone(),
        congestion_control: add_flow.congestion_control.clone(),
        no_delay: add_flow.no_delay,
        debug: add_flow.debug,
        v6only: false,
    }
    .swapped();
    Ok(spec)
}

/// Builds the `IdentifyFlow` wire message for a flow on `key`, per spec.md
/// §4.7.2/§4.8.1.
pub fn build_identify_flow(key: crate::flow::FlowKey, compress_vectors: bool, no_vectors: bool) -> IdentifyFlow {
    IdentifyFlow {
        flow_id: key.flow_id,
        measurement_id: key.measurement_id,
        stream_id: key.stream_id,
        compress_vectors,
        no_vectors,
    }
}

