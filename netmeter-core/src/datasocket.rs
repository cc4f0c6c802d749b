// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Glues a real, non-blocking `socket2::Socket` into the transport-agnostic
//! [`crate::reader::FramedSocket`] contract, and provides the per-protocol
//! send path used by a flow's sender thread (spec.md §4.5.3).

use crate::error::{Error, Result};
use crate::reader::{FramedSocket, RawRecv, Transport};
use crate::trafficspec::Protocol;
use rand::Rng;
use socket2::{SockAddr, Socket};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// One data (or control) connection's socket plus enough protocol context
/// to frame sends and receives correctly.
pub struct DataSocket {
    socket: Socket,
    protocol: Protocol,
    stream_id: u16,
    remote: Option<SocketAddr>,
}

impl DataSocket {
    pub fn new(socket: Socket, protocol: Protocol, stream_id: u16) -> Self {
        Self {
            socket,
            protocol,
            stream_id,
            remote: None,
        }
    }

    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.remote = Some(addr);
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn raw(&self) -> &Socket {
        &self.socket
    }

    /// Sends one already-framed message, dispatching per spec.md §4.5.3.
    pub fn send_message(&self, bytes: &[u8], reliable: f64, ordered: f64, rng: &mut impl rand::Rng) -> Result<()> {
        match self.protocol {
            Protocol::Udp => {
                let remote = self
                    .remote
                    .ok_or_else(|| Error::protocol("UDP send with no remote address"))?;
                match self.socket.send_to(bytes, &SockAddr::from(remote)) {
                    Ok(_) => Ok(()),
                    Err(e) if is_transient(&e) => Err(Error::Transport(e)),
                    Err(e) => Err(Error::Transport(e)),
                }
            }
            Protocol::Tcp | Protocol::Mptcp | Protocol::Dccp => {
                send_all_plain(&self.socket, bytes)
            }
            Protocol::Sctp => self.send_sctp(bytes, reliable, ordered, rng),
        }
    }

    fn send_sctp(&self, bytes: &[u8], reliable: f64, ordered: f64, rng: &mut impl rand::Rng) -> Result<()> {
        let unordered = ordered < 1.0 && rng.gen::<f64>() > ordered;
        let pr_lifetime_ms = if reliable < 1.0 && rng.gen::<f64>() > reliable {
            Some(1u32)
        } else {
            None
        };
        sctp_sendmsg(
            &self.socket,
            bytes,
            self.stream_id,
            crate::wire::SCTP_PPID_DATA,
            unordered,
            pr_lifetime_ms,
        )
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionRefused
    )
}

fn send_all_plain(socket: &Socket, bytes: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < bytes.len() {
        match socket.send(&bytes[sent..]) {
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(Error::Transport(e)),
        }
    }
    Ok(())
}

/// `SCTP_SNDRCV`-ancillary `sendmsg`, setting PPID/stream/unordered/PR-SCTP
/// lifetime the way `sctp_send(3)` would. No crate in the ecosystem wraps
/// this; it goes through `libc::sendmsg` with a raw `cmsghdr`, matching how
/// the original tool called the lksctp userspace API directly.
fn sctp_sendmsg(
    socket: &Socket,
    bytes: &[u8],
    stream_id: u16,
    ppid: u32,
    unordered: bool,
    pr_lifetime_ms: Option<u32>,
) -> Result<()> {
    #[repr(C)]
    struct SctpSndRcvInfo {
        sinfo_stream: u16,
        sinfo_ssn: u16,
        sinfo_flags: u16,
        sinfo_ppid: u32,
        sinfo_context: u32,
        sinfo_timetolive: u32,
        sinfo_tsn: u32,
        sinfo_cumtsn: u32,
        sinfo_assoc_id: i32,
    }
    const SCTP_UNORDERED: u16 = 1;
    const SOL_SCTP: i32 = 132;
    const SCTP_SNDRCV: i32 = 10;

    let sinfo = SctpSndRcvInfo {
        sinfo_stream: stream_id,
        sinfo_ssn: 0,
        sinfo_flags: if unordered { SCTP_UNORDERED } else { 0 },
        sinfo_ppid: ppid.to_be(),
        sinfo_context: 0,
        sinfo_timetolive: pr_lifetime_ms.unwrap_or(0),
        sinfo_tsn: 0,
        sinfo_cumtsn: 0,
        sinfo_assoc_id: 0,
    };

    let cmsg_len = unsafe { libc::CMSG_SPACE(std::mem::size_of::<SctpSndRcvInfo>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_len];

    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(Error::socket_setup("CMSG_FIRSTHDR returned null"));
        }
        (*cmsg).cmsg_level = SOL_SCTP;
        (*cmsg).cmsg_type = SCTP_SNDRCV;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<SctpSndRcvInfo>() as u32) as _;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut SctpSndRcvInfo, sinfo);
    }

    let fd = socket.as_raw_fd();
    let ret = unsafe { libc::sendmsg(fd, &msg, 0) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if is_transient(&err) {
            return Err(Error::Transport(err));
        }
        return Err(Error::Transport(err));
    }
    Ok(())
}

/// `recvmsg` for an SCTP socket, reading the kernel's `MSG_EOR`/
/// `MSG_NOTIFICATION` flags out of `msg_flags` the way `sctp_recvmsg(3)`
/// would, since no safe wrapper for this exists in the ecosystem.
fn sctp_recvmsg(socket: &Socket, buf: &mut [u8]) -> io::Result<RawRecv> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; 256];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let fd = socket.as_raw_fd();
    let ret = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if ret == 0 {
        return Ok(RawRecv::Eof);
    }

    const MSG_NOTIFICATION: i32 = 0x8000;
    let notification = msg.msg_flags & MSG_NOTIFICATION != 0;
    let end_of_record = msg.msg_flags & libc::MSG_EOR != 0;

    Ok(RawRecv::Data {
        len: ret as usize,
        end_of_record,
        notification,
    })
}

impl FramedSocket for DataSocket {
    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn transport(&self) -> Transport {
        match self.protocol {
            Protocol::Udp | Protocol::Dccp => Transport::Datagram,
            Protocol::Tcp | Protocol::Mptcp | Protocol::Sctp => Transport::Stream,
        }
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<RawRecv> {
        if self.protocol == Protocol::Sctp {
            return sctp_recvmsg(&self.socket, buf);
        }

        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [std::mem::MaybeUninit<u8>]) };
        match self.socket.recv(uninit) {
            Ok(0) => Ok(RawRecv::Eof),
            Ok(len) => Ok(RawRecv::Data {
                len,
                // Non-SCTP streams have no end-of-record concept at all;
                // `enforces_end_of_record()` being `false` for them means
                // this value is never consulted.
                end_of_record: true,
                notification: false,
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RawRecv::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn enforces_end_of_record(&self) -> bool {
        self.protocol == Protocol::Sctp
    }
}
