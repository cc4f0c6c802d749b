// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Every message shares this framing header: `{type:u8, flags:u8,
/// length:u16}`, per spec.md §4.1. `length` covers the header itself.
pub const HEADER_LEN: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Acknowledge = 1,
    AddFlow = 2,
    RemoveFlow = 3,
    IdentifyFlow = 4,
    Data = 5,
    Start = 6,
    Stop = 7,
    Results = 8,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Header {
    pub message_type_raw: u8,
    pub flags: u8,
    pub length: u16,
}

impl Header {
    pub fn new(message_type: MessageType, flags: u8, length: u16) -> Self {
        Self {
            message_type_raw: message_type.into(),
            flags,
            length,
        }
    }

    pub fn message_type(&self) -> Result<MessageType> {
        MessageType::try_from(self.message_type_raw)
            .map_err(|_| Error::protocol(format!("unknown message type {}", self.message_type_raw)))
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_type_raw);
        buf.put_u8(self.flags);
        buf.put_u16(self.length);
    }

    /// Parses a header out of the first [`HEADER_LEN`] bytes of `buf`
    /// without consuming more than that.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::protocol("short header"));
        }
        let message_type_raw = buf.get_u8();
        let flags = buf.get_u8();
        let length = buf.get_u16();
        Ok(Self {
            message_type_raw,
            flags,
            length,
        })
    }

    pub fn flag(&self, bit: u8) -> bool {
        self.flags & (1 << bit) != 0
    }

    pub fn set_flag(&mut self, bit: u8, value: bool) {
        if value {
            self.flags |= 1 << bit;
        } else {
            self.flags &= !(1 << bit);
        }
    }
}

/// Header flag bit positions shared across message types (spec.md §4.1).
pub mod flags {
    pub const DEBUG: u8 = 0;
    pub const NO_DELAY: u8 = 1;
    pub const REPEAT_ON_OFF: u8 = 2;

    pub const COMPRESS_VECTORS: u8 = 0;
    pub const NO_VECTORS: u8 = 1;

    pub const FRAME_BEGIN: u8 = 0;
    pub const FRAME_END: u8 = 1;

    pub const COMPRESS_SCALARS: u8 = 1;
    pub const NO_SCALARS: u8 = 3;

    pub const EOF: u8 = 0;
}

/// Writes `text` into a fixed-size, NUL-padded field. Truncates if too long.
pub fn put_fixed_str(buf: &mut impl BufMut, text: &str, len: usize) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(len);
    buf.put_slice(&bytes[..n]);
    for _ in n..len {
        buf.put_u8(0);
    }
}

/// Reads a fixed-size NUL-padded field back into a `String`, stopping at the
/// first NUL or the end of the field.
pub fn get_fixed_str(buf: &mut impl Buf, len: usize) -> Result<String> {
    if buf.remaining() < len {
        return Err(Error::protocol("short fixed string field"));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}
