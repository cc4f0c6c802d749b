// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Framed message receive over stream and datagram transports, per spec.md
//! §4.2. Hides partial reads, datagram framing, and SCTP
//! end-of-record/notification bookkeeping behind one state machine per
//! registered socket.

use crate::wire::HEADER_LEN;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

/// Whether a socket is framed by TLV `length` + stream boundary, or
/// delivers one whole message per `recv()` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Stream,
    Datagram,
}

/// One non-blocking receive attempt's outcome, as reported by the
/// transport-specific socket wrapper. `end_of_record` only affects framing
/// decisions when [`FramedSocket::enforces_end_of_record`] is `true`
/// (SCTP); other stream sockets may report any value here, it's ignored.
#[derive(Clone, Copy, Debug)]
pub enum RawRecv {
    Data {
        len: usize,
        end_of_record: bool,
        notification: bool,
    },
    WouldBlock,
    Eof,
}

/// A socket a [`MessageReader`] can poll. Implemented per transport in
/// `socketcfg`/`flow`.
pub trait FramedSocket {
    fn raw_fd(&self) -> RawFd;
    fn transport(&self) -> Transport;
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<RawRecv>;

    /// Only SCTP has a real end-of-record boundary; plain byte streams
    /// (TCP, MPTCP) have none; datagram transports don't call this path at
    /// all. Default `false` means `end_of_record` is ignored for framing
    /// decisions.
    fn enforces_end_of_record(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    WaitingForHeader,
    PartialRead,
    StreamError,
}

struct PerSocket {
    state: State,
    buffer: BytesMut,
    expected_len: Option<u16>,
    refcount: u32,
}

impl PerSocket {
    fn new() -> Self {
        Self {
            state: State::WaitingForHeader,
            buffer: BytesMut::with_capacity(4096),
            expected_len: None,
            refcount: 0,
        }
    }

    fn reset(&mut self) {
        self.state = State::WaitingForHeader;
        self.buffer.clear();
        self.expected_len = None;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReceiveStatus {
    /// Emits are handled by returning `Ok` bytes from `receive`; variants
    /// below describe the non-data outcomes.
    PartialRead,
    SocketError,
    StreamError,
    BadSocket,
    /// An SCTP notification (association change, shutdown event, ...)
    /// arrived in place of a framed message. The control layer treats this
    /// as grounds to tear the association down rather than wait for an
    /// eventual EOF that may never come.
    Notification,
}

const MAX_BUFFER_CAPACITY: usize = 65536 + HEADER_LEN;

/// Per-process table of framed-receive state, one entry per socket
/// descriptor, refcounted so multiple Flows sharing one SCTP association
/// socket can each register without tearing down the shared state early
/// (spec.md §4.2, §5, §9).
#[derive(Default)]
pub struct MessageReader {
    sockets: HashMap<RawFd, PerSocket>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self {
            sockets: HashMap::new(),
        }
    }

    /// Registers interest in `fd`, bumping its refcount.
    pub fn add_socket(&mut self, fd: RawFd) {
        let entry = self.sockets.entry(fd).or_insert_with(PerSocket::new);
        entry.refcount += 1;
    }

    /// Deregisters one reference to `fd`; the caller should close the
    /// descriptor once this returns `true` (last owner).
    pub fn remove_socket(&mut self, fd: RawFd) -> bool {
        if let Some(entry) = self.sockets.get_mut(&fd) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                self.sockets.remove(&fd);
                return true;
            }
        }
        false
    }

    /// Attempts to receive one full framed message from `socket`.
    pub fn receive(&mut self, socket: &dyn FramedSocket) -> Result<Bytes, ReceiveStatus> {
        let fd = socket.raw_fd();
        let transport = socket.transport();

        let entry = match self.sockets.get_mut(&fd) {
            Some(e) => e,
            None => return Err(ReceiveStatus::BadSocket),
        };

        if entry.state == State::StreamError && transport == Transport::Stream {
            return Err(ReceiveStatus::StreamError);
        }

        match transport {
            Transport::Datagram => Self::receive_datagram(entry, socket),
            Transport::Stream => Self::receive_stream(entry, socket),
        }
    }

    fn receive_datagram(
        entry: &mut PerSocket,
        socket: &dyn FramedSocket,
    ) -> Result<Bytes, ReceiveStatus> {
        let mut buf = [0u8; MAX_BUFFER_CAPACITY];
        match socket.try_recv(&mut buf) {
            Ok(RawRecv::Data {
                len,
                notification,
                ..
            }) => {
                if notification {
                    return Err(ReceiveStatus::Notification);
                }
                if len < HEADER_LEN {
                    return Err(ReceiveStatus::StreamError);
                }
                let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if declared != len {
                    return Err(ReceiveStatus::StreamError);
                }
                entry.reset();
                Ok(Bytes::copy_from_slice(&buf[..len]))
            }
            Ok(RawRecv::WouldBlock) => Err(ReceiveStatus::PartialRead),
            Ok(RawRecv::Eof) => Err(ReceiveStatus::SocketError),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Err(ReceiveStatus::PartialRead),
            Err(_) => Err(ReceiveStatus::SocketError),
        }
    }

    fn receive_stream(
        entry: &mut PerSocket,
        socket: &dyn FramedSocket,
    ) -> Result<Bytes, ReceiveStatus> {
        let enforces_eor = socket.enforces_end_of_record();
        loop {
            let target = entry.expected_len.map(|l| l as usize).unwrap_or(HEADER_LEN);

            if entry.buffer.len() >= target && entry.expected_len.is_some() {
                // everything we need is already buffered from a previous
                // call (can happen after a short final read).
                let full = entry.buffer.split_to(target).freeze();
                entry.reset();
                return Ok(full);
            }

            let mut chunk = vec![0u8; target - entry.buffer.len()];
            let recv = socket.try_recv(&mut chunk);

            match recv {
                Ok(RawRecv::WouldBlock) => return Err(ReceiveStatus::PartialRead),
                Ok(RawRecv::Eof) => return Err(ReceiveStatus::SocketError),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(ReceiveStatus::PartialRead)
                }
                Err(_) => return Err(ReceiveStatus::SocketError),
                Ok(RawRecv::Data {
                    len,
                    end_of_record,
                    notification,
                }) => {
                    if notification {
                        // Surfaced to the caller rather than skipped: the
                        // control layer needs to see this to tear an
                        // association down on COMM_LOST/SHUTDOWN_COMP.
                        return Err(ReceiveStatus::Notification);
                    }
                    if len == 0 {
                        return Err(ReceiveStatus::SocketError);
                    }
                    entry.buffer.extend_from_slice(&chunk[..len]);
                    entry.state = State::PartialRead;

                    if entry.expected_len.is_none() && entry.buffer.len() >= HEADER_LEN {
                        let declared = u16::from_be_bytes([
                            entry.buffer[2],
                            entry.buffer[3],
                        ]);
                        if (declared as usize) < HEADER_LEN
                            || (declared as usize) > MAX_BUFFER_CAPACITY
                        {
                            entry.state = State::StreamError;
                            return Err(ReceiveStatus::StreamError);
                        }
                        entry.expected_len = Some(declared);
                    }

                    let target = entry.expected_len.map(|l| l as usize).unwrap_or(usize::MAX);

                    if entry.buffer.len() >= target && entry.expected_len.is_some() {
                        if enforces_eor && !end_of_record {
                            // SCTP: a complete-length message must
                            // coincide with end-of-record.
                            continue;
                        }
                        let full = entry.buffer.split_to(target).freeze();
                        entry.reset();
                        return Ok(full);
                    }

                    if enforces_eor && end_of_record && entry.expected_len.is_some() {
                        // SCTP: end-of-record arrived before reaching the
                        // declared length: a framing error, unless it was
                        // a notification (handled above).
                        entry.state = State::StreamError;
                        return Err(ReceiveStatus::StreamError);
                    }
                    // otherwise loop for more bytes (would-block will exit)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Each queued event is served by exactly one `try_recv` call: either a
    /// chunk of bytes (never longer than the caller's buffer) or a forced
    /// would-block, letting tests control exactly how reads are split.
    enum Event {
        Data(Vec<u8>),
        WouldBlock,
    }

    struct FakeSocket {
        transport: Transport,
        events: RefCell<VecDeque<Event>>,
        sctp_like: bool,
    }

    impl FramedSocket for FakeSocket {
        fn raw_fd(&self) -> RawFd {
            1
        }

        fn transport(&self) -> Transport {
            self.transport
        }

        fn try_recv(&self, buf: &mut [u8]) -> io::Result<RawRecv> {
            let mut events = self.events.borrow_mut();
            match events.pop_front() {
                None | Some(Event::WouldBlock) => Ok(RawRecv::WouldBlock),
                Some(Event::Data(chunk)) => {
                    assert!(chunk.len() <= buf.len(), "test chunk larger than requested buffer");
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(RawRecv::Data {
                        len: chunk.len(),
                        end_of_record: true,
                        notification: false,
                    })
                }
            }
        }

        fn enforces_end_of_record(&self) -> bool {
            self.sctp_like
        }
    }

    #[test]
    fn reassembles_a_message_split_across_reads() {
        let mut header = vec![5u8, 0, 0, 10]; // type=Data, flags=0, length=10
        let payload = vec![1, 2, 3, 4, 5, 6];
        header.extend_from_slice(&payload);
        let full = header;

        let socket = FakeSocket {
            transport: Transport::Stream,
            events: RefCell::new(VecDeque::from(vec![
                Event::Data(full[..4].to_vec()),
                Event::WouldBlock,
                Event::Data(full[4..].to_vec()),
            ])),
            sctp_like: false,
        };

        let mut reader = MessageReader::new();
        reader.add_socket(socket.raw_fd());

        assert_eq!(reader.receive(&socket), Err(ReceiveStatus::PartialRead));
        let msg = reader.receive(&socket).unwrap();
        assert_eq!(msg.as_ref(), full.as_slice());
    }

    #[test]
    fn rejects_bogus_length() {
        let socket = FakeSocket {
            transport: Transport::Stream,
            events: RefCell::new(VecDeque::from(vec![Event::Data(vec![5u8, 0, 0, 2])])), // length < header size
            sctp_like: false,
        };
        let mut reader = MessageReader::new();
        reader.add_socket(socket.raw_fd());
        assert_eq!(reader.receive(&socket), Err(ReceiveStatus::StreamError));
    }

    #[test]
    fn datagram_validates_declared_length_matches_size() {
        let msg = vec![5u8, 0, 0, 6, 9, 9];
        let socket = FakeSocket {
            transport: Transport::Datagram,
            events: RefCell::new(VecDeque::from(vec![Event::Data(msg.clone())])),
            sctp_like: false,
        };
        let mut reader = MessageReader::new();
        reader.add_socket(socket.raw_fd());
        let out = reader.receive(&socket).unwrap();
        assert_eq!(out.as_ref(), msg.as_slice());
    }

    #[test]
    fn plain_stream_completes_without_end_of_record() {
        // Non-SCTP streams (TCP, MPTCP) have no end-of-record concept; the
        // FakeSocket here always reports `end_of_record: true`, but a
        // non-SCTP socket must still complete purely on reaching the
        // declared length and must not error on "premature" end-of-record.
        let msg = vec![5u8, 0, 0, 6, 9, 9];
        let socket = FakeSocket {
            transport: Transport::Stream,
            events: RefCell::new(VecDeque::from(vec![Event::Data(msg.clone())])),
            sctp_like: false,
        };
        let mut reader = MessageReader::new();
        reader.add_socket(socket.raw_fd());
        let out = reader.receive(&socket).unwrap();
        assert_eq!(out.as_ref(), msg.as_slice());
    }

    #[test]
    fn sctp_like_socket_rejects_premature_end_of_record() {
        // An SCTP association delivering end-of-record before the declared
        // TLV length is reached is a framing error.
        let socket = FakeSocket {
            transport: Transport::Stream,
            events: RefCell::new(VecDeque::from(vec![Event::Data(vec![5u8, 0, 0, 10, 1, 2])])),
            sctp_like: true,
        };
        let mut reader = MessageReader::new();
        reader.add_socket(socket.raw_fd());
        assert_eq!(reader.receive(&socket), Err(ReceiveStatus::StreamError));
    }

    #[test]
    fn refcounted_removal_only_closes_on_last_owner() {
        let mut reader = MessageReader::new();
        reader.add_socket(42);
        reader.add_socket(42);
        assert!(!reader.remove_socket(42));
        assert!(reader.remove_socket(42));
    }
}
