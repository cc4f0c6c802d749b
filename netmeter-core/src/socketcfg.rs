// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Socket creation and per-protocol tuning, per spec.md §4.6. Generic setup
//! (family selection, `SO_REUSEADDR`, `IPV6_V6ONLY`, buffer sizes) goes
//! through `socket2::Socket`; SCTP/DCCP-specific options have no stable
//! binding in the ecosystem, so they're issued as raw `setsockopt` calls
//! against the numeric option levels/names from the kernel headers.

use crate::error::{Error, Result};
use crate::trafficspec::Protocol;
use socket2::{Domain, SockAddr, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

/// `IPPROTO_SCTP`/`IPPROTO_DCCP` aren't part of `libc`'s portable surface on
/// every target; these match `/etc/protocols` on Linux.
mod proto {
    pub const SCTP: i32 = 132;
    pub const DCCP: i32 = 33;
}

/// SCTP socket option names from `linux/sctp.h`, not exposed by `libc`
/// (requires `lksctp-tools` headers to be present at the system level, not
/// at the Rust-crate level).
mod sctp_opt {
    pub const SCTP_RTOINFO: i32 = 0;
    pub const SCTP_INITMSG: i32 = 2;
    pub const SCTP_EVENTS: i32 = 11;
    /// Out-of-tree CMT-SCTP patch option, not upstream; kept as a best-effort
    /// tunable, warned-not-failed on unsupported kernels per spec.md §4.6.
    pub const SCTP_CMT_ON_OFF: i32 = 9001;
}

/// DCCP socket option names from `linux/dccp.h`.
mod dccp_opt {
    pub const DCCP_SOCKOPT_SERVICE: i32 = 2;
    pub const DCCP_SOCKOPT_CCID: i32 = 13;
}

#[repr(C)]
struct SctpInitMsg {
    sinit_num_ostreams: u16,
    sinit_max_instreams: u16,
    sinit_max_attempts: u16,
    sinit_max_init_timeo: u16,
}

#[repr(C)]
struct SctpEventSubscribe {
    sctp_data_io_event: u8,
    sctp_association_event: u8,
    sctp_address_event: u8,
    sctp_send_failure_event: u8,
    sctp_peer_error_event: u8,
    sctp_shutdown_event: u8,
    sctp_partial_delivery_event: u8,
    sctp_adaptation_layer_event: u8,
    sctp_authentication_event: u8,
    sctp_sender_dry_event: u8,
}

/// The socket type/protocol triple and domain selection result of
/// [`create_and_bind_socket`].
pub struct BoundSocket {
    pub socket: Socket,
    pub family: Domain,
}

/// Creates, optionally tunes, and binds a socket for one flow's data
/// connection (or the control connection), per spec.md §4.6.
///
/// `local_addrs` with more than one entry is only meaningful for SCTP
/// (multi-homed bind); other protocols bind the first address only.
pub fn create_and_bind_socket(
    protocol: Protocol,
    local_addrs: &[SocketAddr],
    listen: bool,
    bind_v6only: bool,
) -> Result<BoundSocket> {
    let first = local_addrs
        .first()
        .copied()
        .ok_or_else(|| Error::socket_setup("no local address to bind"))?;
    let family = if first.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let (ty, raw_proto) = match protocol {
        Protocol::Tcp | Protocol::Mptcp => (Type::STREAM, None),
        Protocol::Udp => (Type::DGRAM, None),
        Protocol::Sctp => (Type::STREAM, Some(proto::SCTP)),
        Protocol::Dccp => (Type::DGRAM, Some(proto::DCCP)),
    };

    let socket = match raw_proto {
        Some(p) => Socket::new_raw(family, ty, Some(socket2::Protocol::from(p)))
            .map_err(|e| Error::socket_setup(format!("socket() failed: {e}")))?,
        None => Socket::new(family, ty, None)
            .map_err(|e| Error::socket_setup(format!("socket() failed: {e}")))?,
    };

    socket
        .set_reuse_address(true)
        .map_err(|e| Error::socket_setup(format!("SO_REUSEADDR failed: {e}")))?;

    if family == Domain::IPV6 {
        socket
            .set_only_v6(bind_v6only)
            .map_err(|e| Error::socket_setup(format!("IPV6_V6ONLY failed: {e}")))?;
    }

    if protocol == Protocol::Sctp {
        set_sctp_initmsg(&socket, 65535, 65535)?;
        subscribe_sctp_events(&socket)?;
    }

    if protocol == Protocol::Sctp && local_addrs.len() > 1 {
        bind_sctp_multihomed(&socket, local_addrs)?;
    } else {
        socket
            .bind(&SockAddr::from(first))
            .map_err(|e| Error::socket_setup(format!("bind() failed: {e}")))?;
    }

    if listen {
        socket
            .listen(1024)
            .map_err(|e| Error::socket_setup(format!("listen() failed: {e}")))?;
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| Error::socket_setup(format!("O_NONBLOCK failed: {e}")))?;

    Ok(BoundSocket { socket, family })
}

fn set_sctp_initmsg(socket: &Socket, out_streams: u16, in_streams: u16) -> Result<()> {
    let init = SctpInitMsg {
        sinit_num_ostreams: out_streams,
        sinit_max_instreams: in_streams,
        sinit_max_attempts: 4,
        sinit_max_init_timeo: 0,
    };
    setsockopt(socket, proto::SCTP, sctp_opt::SCTP_INITMSG, &init)
}

fn subscribe_sctp_events(socket: &Socket) -> Result<()> {
    let events = SctpEventSubscribe {
        sctp_data_io_event: 1,
        sctp_association_event: 1,
        sctp_address_event: 0,
        sctp_send_failure_event: 1,
        sctp_peer_error_event: 0,
        sctp_shutdown_event: 1,
        sctp_partial_delivery_event: 0,
        sctp_adaptation_layer_event: 0,
        sctp_authentication_event: 0,
        sctp_sender_dry_event: 0,
    };
    setsockopt(socket, proto::SCTP, sctp_opt::SCTP_EVENTS, &events)
}

/// `SCTP_RTOINFO`/explicit `sctp_bindx`-style multi-address bind isn't
/// exposed anywhere in the Rust ecosystem; we call `bind()` once per address
/// via the raw descriptor, which on Linux's SCTP socket behaves like a
/// single-shot `sctp_bindx(SCTP_BINDX_ADD_ADDR)` for the first call and
/// requires the real `sctp_bindx(3)` libc entry point for the rest. Since
/// that symbol isn't part of glibc's exported ABI without `libsctp`, we bind
/// only the first address here and log that multi-homing was requested but
/// not applied, rather than link against an optional system library.
fn bind_sctp_multihomed(socket: &Socket, addrs: &[SocketAddr]) -> Result<()> {
    let first = addrs[0];
    socket
        .bind(&SockAddr::from(first))
        .map_err(|e| Error::socket_setup(format!("bind() failed: {e}")))?;
    if addrs.len() > 1 {
        tracing::warn!(
            count = addrs.len(),
            "SCTP multi-homed bind requested but libsctp sctp_bindx(3) is unavailable; bound first address only"
        );
    }
    Ok(())
}

fn setsockopt<T>(socket: &Socket, level: i32, name: i32, value: &T) -> Result<()> {
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::socket_setup(format!(
            "setsockopt(level={level}, name={name}) failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Per-flow tuning applied once the data socket is connected/accepted
/// (spec.md §4.6 second paragraph).
pub struct FlowSocketOptions {
    pub snd_buffer_size: u32,
    pub rcv_buffer_size: u32,
    pub cmt: u8,
    pub ccid: u8,
}

pub fn apply_flow_socket_options(
    socket: &Socket,
    protocol: Protocol,
    opts: &FlowSocketOptions,
) -> Result<()> {
    if opts.snd_buffer_size > 0 {
        socket
            .set_send_buffer_size(opts.snd_buffer_size as usize)
            .map_err(|e| Error::socket_setup(format!("SO_SNDBUF failed: {e}")))?;
        let got = socket
            .send_buffer_size()
            .map_err(|e| Error::socket_setup(format!("SO_SNDBUF read-back failed: {e}")))?;
        if (got as u32) < opts.snd_buffer_size {
            return Err(Error::socket_setup(format!(
                "SO_SNDBUF read-back {got} below requested {}",
                opts.snd_buffer_size
            )));
        }
    }

    if opts.rcv_buffer_size > 0 {
        socket
            .set_recv_buffer_size(opts.rcv_buffer_size as usize)
            .map_err(|e| Error::socket_setup(format!("SO_RCVBUF failed: {e}")))?;
        let got = socket
            .recv_buffer_size()
            .map_err(|e| Error::socket_setup(format!("SO_RCVBUF read-back failed: {e}")))?;
        if (got as u32) < opts.rcv_buffer_size {
            return Err(Error::socket_setup(format!(
                "SO_RCVBUF read-back {got} below requested {}",
                opts.rcv_buffer_size
            )));
        }
    }

    match protocol {
        Protocol::Sctp => {
            if let Err(e) = setsockopt(socket, proto::SCTP, sctp_opt::SCTP_CMT_ON_OFF, &opts.cmt) {
                tracing::warn!(error = %e, "system lacks CMT-SCTP support, continuing without it");
            }
        }
        Protocol::Dccp => {
            setsockopt(socket, proto::DCCP, dccp_opt::DCCP_SOCKOPT_CCID, &opts.ccid)?;
            let service: u32 = crate::wire::DCCP_DATA_SERVICE_CODE;
            setsockopt(socket, proto::DCCP, dccp_opt::DCCP_SOCKOPT_SERVICE, &service)?;
        }
        _ => {}
    }

    Ok(())
}
