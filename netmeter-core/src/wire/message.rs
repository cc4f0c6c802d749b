// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::header::{flags, get_fixed_str, put_fixed_str, Header, MessageType, HEADER_LEN};
use super::netdouble;
use crate::error::{Error, Result};
use crate::onoff::OnOffEvent;
use crate::randomvar::{GeneratorKind, RandomVariable};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const IDENTIFY_MAGIC_NUMBER: u64 = 0x4bcdf3aa303c6774;
pub const RESULTS_MAX_PAYLOAD: usize = 1400;
pub const DESCRIPTION_LEN: usize = 32;
pub const PATH_MGR_LEN: usize = 16;
pub const CONGESTION_CONTROL_LEN: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckStatus {
    Okay = 0,
    Error = 1,
}

impl AckStatus {
    fn from_u32(v: u32) -> Self {
        if v == 0 {
            AckStatus::Okay
        } else {
            AckStatus::Error
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Acknowledge {
    pub flow_id: u32,
    pub measurement_id: u64,
    pub stream_id: u16,
    pub status: AckStatus,
}

impl Acknowledge {
    pub fn encode(&self) -> Bytes {
        let length = HEADER_LEN + 4 + 8 + 2 + 2 + 4;
        let mut buf = BytesMut::with_capacity(length);
        Header::new(MessageType::Acknowledge, 0, length as u16).encode(&mut buf);
        buf.put_u32(self.flow_id);
        buf.put_u64(self.measurement_id);
        buf.put_u16(self.stream_id);
        buf.put_u16(0); // pad
        buf.put_u32(self.status as u32);
        buf.freeze()
    }

    pub fn decode(header: Header, mut body: impl Buf) -> Result<Self> {
        if body.remaining() < 4 + 8 + 2 + 2 + 4 {
            return Err(Error::protocol("short Acknowledge body"));
        }
        let flow_id = body.get_u32();
        let measurement_id = body.get_u64();
        let stream_id = body.get_u16();
        body.get_u16();
        let status = AckStatus::from_u32(body.get_u32());
        let _ = header;
        Ok(Self {
            flow_id,
            measurement_id,
            stream_id,
            status,
        })
    }
}

/// Decoded from/encoded to the `OrderedMode`/`ReliableMode` scaled-u32
/// fields (spec.md §4.1): a probability in `[0, 1]`.
pub type Probability = f64;

#[derive(Clone, Copy, Debug)]
pub struct RetransmissionTrials {
    pub trials: u32,
    pub is_ms: bool,
}

const RTX_MS_FLAG: u32 = 1 << 31;
/// Magic sentinel the original tool uses for "unlimited" retransmissions.
/// spec.md §9 Open Questions leaves the exact semantics of `0x7fffffff`
/// combined with the in-ms flag ambiguous; we resolve it (see DESIGN.md) by
/// treating the bare value `0x7fffffff`, regardless of the ms flag, as
/// "unlimited" rather than a literal millisecond count.
pub const RTX_UNLIMITED: u32 = 0x7fff_ffff;

impl RetransmissionTrials {
    pub fn encode(&self) -> u32 {
        let base = self.trials & !RTX_MS_FLAG;
        if self.is_ms {
            base | RTX_MS_FLAG
        } else {
            base
        }
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            trials: raw & !RTX_MS_FLAG,
            is_ms: raw & RTX_MS_FLAG != 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.trials == RTX_UNLIMITED
    }
}

#[derive(Clone, Debug)]
pub struct AddFlow {
    pub flow_id: u32,
    pub measurement_id: u64,
    pub stream_id: u16,
    pub protocol: u8,
    pub description: String,
    pub ordered_mode: Probability,
    pub reliable_mode: Probability,
    pub retransmission_trials: RetransmissionTrials,
    pub frame_rate: RandomVariable,
    pub frame_size: RandomVariable,
    pub rcv_buffer_size: u32,
    pub snd_buffer_size: u32,
    pub max_msg_size: u16,
    pub cmt: u8,
    pub ccid: u8,
    pub n_diff_ports: u16,
    pub path_mgr: String,
    pub congestion_control: String,
    pub on_off_events: Vec<OnOffEvent>,
    pub debug: bool,
    pub no_delay: bool,
}

impl AddFlow {
    pub fn encode(&self) -> Bytes {
        let fixed_len = HEADER_LEN
            + 4
            + 8
            + 2
            + 1
            + 1
            + DESCRIPTION_LEN
            + 4
            + 4
            + 4
            + (4 * netdouble::ENCODED_LEN)
            + (4 * netdouble::ENCODED_LEN)
            + 1
            + 1
            + 4
            + 4
            + 2
            + 1
            + 1
            + 2
            + PATH_MGR_LEN
            + CONGESTION_CONTROL_LEN
            + 2;
        let per_event = 1 + 1 + 2 + (4 * netdouble::ENCODED_LEN);
        let length = fixed_len + per_event * self.on_off_events.len();

        let mut buf = BytesMut::with_capacity(length);
        let mut flags = 0u8;
        if self.debug {
            flags |= 1 << self::flags::DEBUG;
        }
        if self.no_delay {
            flags |= 1 << self::flags::NO_DELAY;
        }
        if self.on_off_events.iter().any(|e| e.repeat) {
            flags |= 1 << self::flags::REPEAT_ON_OFF;
        }
        Header::new(MessageType::AddFlow, flags, length as u16).encode(&mut buf);

        buf.put_u32(self.flow_id);
        buf.put_u64(self.measurement_id);
        buf.put_u16(self.stream_id);
        buf.put_u8(self.protocol);
        buf.put_u8(0); // pad
        put_fixed_str(&mut buf, &self.description, DESCRIPTION_LEN);
        buf.put_u32(netdouble::encode_scaled_probability(self.ordered_mode));
        buf.put_u32(netdouble::encode_scaled_probability(self.reliable_mode));
        buf.put_u32(self.retransmission_trials.encode());

        encode_generator(&mut buf, &self.frame_rate);
        encode_generator(&mut buf, &self.frame_size);

        buf.put_u8(self.frame_rate.kind as u8);
        buf.put_u8(self.frame_size.kind as u8);

        buf.put_u32(self.rcv_buffer_size);
        buf.put_u32(self.snd_buffer_size);
        buf.put_u16(self.max_msg_size);
        buf.put_u8(self.cmt);
        buf.put_u8(self.ccid);
        buf.put_u16(self.n_diff_ports);
        put_fixed_str(&mut buf, &self.path_mgr, PATH_MGR_LEN);
        put_fixed_str(&mut buf, &self.congestion_control, CONGESTION_CONTROL_LEN);

        buf.put_u16(self.on_off_events.len() as u16);
        for event in &self.on_off_events {
            let mut event_flags = 0u8;
            if event.relative_time {
                event_flags |= 1;
            }
            buf.put_u8(event.value.kind as u8);
            buf.put_u8(event_flags);
            buf.put_u16(0);
            for v in event.value.values {
                netdouble::encode(v, &mut buf);
            }
        }

        buf.freeze()
    }

    pub fn decode(header: Header, mut body: impl Buf) -> Result<Self> {
        let need = 4 + 8 + 2 + 1 + 1 + DESCRIPTION_LEN + 4 + 4 + 4;
        if body.remaining() < need {
            return Err(Error::protocol("short AddFlow body"));
        }
        let flow_id = body.get_u32();
        let measurement_id = body.get_u64();
        let stream_id = body.get_u16();
        let protocol = body.get_u8();
        body.get_u8();
        let description = get_fixed_str(&mut body, DESCRIPTION_LEN)?;
        let ordered_mode = netdouble::decode_scaled_probability(body.get_u32());
        let reliable_mode = netdouble::decode_scaled_probability(body.get_u32());
        let retransmission_trials = RetransmissionTrials::decode(body.get_u32());

        let frame_rate_values = decode_four_doubles(&mut body)?;
        let frame_size_values = decode_four_doubles(&mut body)?;

        if body.remaining() < 2 {
            return Err(Error::protocol("short AddFlow rng kind fields"));
        }
        let frame_rate_kind = GeneratorKind::try_from(body.get_u8())
            .map_err(|_| Error::protocol("bad frame rate generator kind"))?;
        let frame_size_kind = GeneratorKind::try_from(body.get_u8())
            .map_err(|_| Error::protocol("bad frame size generator kind"))?;

        let need2 = 4 + 4 + 2 + 1 + 1 + 2 + PATH_MGR_LEN + CONGESTION_CONTROL_LEN + 2;
        if body.remaining() < need2 {
            return Err(Error::protocol("short AddFlow tail"));
        }
        let rcv_buffer_size = body.get_u32();
        let snd_buffer_size = body.get_u32();
        let max_msg_size = body.get_u16();
        let cmt = body.get_u8();
        let ccid = body.get_u8();
        let n_diff_ports = body.get_u16();
        let path_mgr = get_fixed_str(&mut body, PATH_MGR_LEN)?;
        let congestion_control = get_fixed_str(&mut body, CONGESTION_CONTROL_LEN)?;

        let count = body.get_u16();
        let mut on_off_events = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if body.remaining() < 1 + 1 + 2 + (4 * netdouble::ENCODED_LEN) {
                return Err(Error::protocol("short OnOffEvent entry"));
            }
            let kind = GeneratorKind::try_from(body.get_u8())
                .map_err(|_| Error::protocol("bad on/off generator kind"))?;
            let event_flags = body.get_u8();
            body.get_u16();
            let values = decode_four_doubles(&mut body)?;
            on_off_events.push(OnOffEvent {
                value: RandomVariable {
                    kind,
                    values,
                },
                relative_time: event_flags & 1 != 0,
                repeat: header.flag(self::flags::REPEAT_ON_OFF),
            });
        }

        Ok(Self {
            flow_id,
            measurement_id,
            stream_id,
            protocol,
            description,
            ordered_mode,
            reliable_mode,
            retransmission_trials,
            frame_rate: RandomVariable {
                kind: frame_rate_kind,
                values: frame_rate_values,
            },
            frame_size: RandomVariable {
                kind: frame_size_kind,
                values: frame_size_values,
            },
            rcv_buffer_size,
            snd_buffer_size,
            max_msg_size,
            cmt,
            ccid,
            n_diff_ports,
            path_mgr,
            congestion_control,
            on_off_events,
            debug: header.flag(self::flags::DEBUG),
            no_delay: header.flag(self::flags::NO_DELAY),
        })
    }
}

fn encode_generator(buf: &mut BytesMut, rv: &RandomVariable) {
    for v in rv.values {
        netdouble::encode(v, buf);
    }
}

fn decode_four_doubles(buf: &mut impl Buf) -> Result<[f64; 4]> {
    if buf.remaining() < 4 * netdouble::ENCODED_LEN {
        return Err(Error::protocol("short double array"));
    }
    let mut values = [0.0f64; 4];
    for v in values.iter_mut() {
        *v = netdouble::decode(buf);
    }
    Ok(values)
}

#[derive(Clone, Copy, Debug)]
pub struct RemoveFlow {
    pub flow_id: u32,
    pub measurement_id: u64,
    pub stream_id: u16,
}

impl RemoveFlow {
    pub fn encode(&self) -> Bytes {
        let length = HEADER_LEN + 4 + 8 + 2;
        let mut buf = BytesMut::with_capacity(length);
        Header::new(MessageType::RemoveFlow, 0, length as u16).encode(&mut buf);
        buf.put_u32(self.flow_id);
        buf.put_u64(self.measurement_id);
        buf.put_u16(self.stream_id);
        buf.freeze()
    }

    pub fn decode(mut body: impl Buf) -> Result<Self> {
        if body.remaining() < 4 + 8 + 2 {
            return Err(Error::protocol("short RemoveFlow body"));
        }
        Ok(Self {
            flow_id: body.get_u32(),
            measurement_id: body.get_u64(),
            stream_id: body.get_u16(),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IdentifyFlow {
    pub flow_id: u32,
    pub measurement_id: u64,
    pub stream_id: u16,
    pub compress_vectors: bool,
    pub no_vectors: bool,
}

impl IdentifyFlow {
    pub fn encode(&self) -> Bytes {
        let length = HEADER_LEN + 4 + 8 + 8 + 2;
        let mut buf = BytesMut::with_capacity(length);
        let mut flag_bits = 0u8;
        if self.compress_vectors {
            flag_bits |= 1 << flags::COMPRESS_VECTORS;
        }
        if self.no_vectors {
            flag_bits |= 1 << flags::NO_VECTORS;
        }
        Header::new(MessageType::IdentifyFlow, flag_bits, length as u16).encode(&mut buf);
        buf.put_u32(self.flow_id);
        buf.put_u64(IDENTIFY_MAGIC_NUMBER);
        buf.put_u64(self.measurement_id);
        buf.put_u16(self.stream_id);
        buf.freeze()
    }

    pub fn decode(header: Header, mut body: impl Buf) -> Result<Self> {
        if body.remaining() < 4 + 8 + 8 + 2 {
            return Err(Error::protocol("short IdentifyFlow body"));
        }
        let flow_id = body.get_u32();
        let magic = body.get_u64();
        if magic != IDENTIFY_MAGIC_NUMBER {
            return Err(Error::protocol("bad IdentifyFlow magic number"));
        }
        let measurement_id = body.get_u64();
        let stream_id = body.get_u16();
        Ok(Self {
            flow_id,
            measurement_id,
            stream_id,
            compress_vectors: header.flag(flags::COMPRESS_VECTORS),
            no_vectors: header.flag(flags::NO_VECTORS),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Data {
    pub flow_id: u32,
    pub measurement_id: u64,
    pub stream_id: u16,
    pub frame_id: u32,
    pub seq_number: u64,
    pub byte_seq_number: u64,
    pub timestamp_micros: u64,
    pub frame_begin: bool,
    pub frame_end: bool,
    pub payload: Bytes,
}

impl Data {
    pub const HEADER_OVERHEAD: usize =
        HEADER_LEN + 4 + 8 + 2 + 2 + 4 + 8 + 8 + 8;

    pub fn encode(&self) -> Bytes {
        let length = Self::HEADER_OVERHEAD + self.payload.len();
        let mut buf = BytesMut::with_capacity(length);
        let mut flag_bits = 0u8;
        if self.frame_begin {
            flag_bits |= 1 << flags::FRAME_BEGIN;
        }
        if self.frame_end {
            flag_bits |= 1 << flags::FRAME_END;
        }
        Header::new(MessageType::Data, flag_bits, length as u16).encode(&mut buf);
        buf.put_u32(self.flow_id);
        buf.put_u64(self.measurement_id);
        buf.put_u16(self.stream_id);
        buf.put_u16(0); // pad
        buf.put_u32(self.frame_id);
        buf.put_u64(self.seq_number);
        buf.put_u64(self.byte_seq_number);
        buf.put_u64(self.timestamp_micros);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(header: Header, mut body: Bytes) -> Result<Self> {
        if body.remaining() < 4 + 8 + 2 + 2 + 4 + 8 + 8 + 8 {
            return Err(Error::protocol("short Data body"));
        }
        let flow_id = body.get_u32();
        let measurement_id = body.get_u64();
        let stream_id = body.get_u16();
        body.get_u16();
        let frame_id = body.get_u32();
        let seq_number = body.get_u64();
        let byte_seq_number = body.get_u64();
        let timestamp_micros = body.get_u64();
        let payload = body;
        Ok(Self {
            flow_id,
            measurement_id,
            stream_id,
            frame_id,
            seq_number,
            byte_seq_number,
            timestamp_micros,
            frame_begin: header.flag(flags::FRAME_BEGIN),
            frame_end: header.flag(flags::FRAME_END),
            payload,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Start {
    pub measurement_id: u64,
    pub compress_vectors: bool,
    pub compress_scalars: bool,
    pub no_vectors: bool,
    pub no_scalars: bool,
}

impl Start {
    pub fn encode(&self) -> Bytes {
        let length = HEADER_LEN + 4 + 8;
        let mut buf = BytesMut::with_capacity(length);
        let mut flag_bits = 0u8;
        if self.compress_vectors {
            flag_bits |= 1 << flags::COMPRESS_VECTORS;
        }
        if self.compress_scalars {
            flag_bits |= 1 << flags::COMPRESS_SCALARS;
        }
        if self.no_vectors {
            flag_bits |= 1 << flags::NO_VECTORS;
        }
        if self.no_scalars {
            flag_bits |= 1 << flags::NO_SCALARS;
        }
        Header::new(MessageType::Start, flag_bits, length as u16).encode(&mut buf);
        buf.put_u32(0);
        buf.put_u64(self.measurement_id);
        buf.freeze()
    }

    pub fn decode(header: Header, mut body: impl Buf) -> Result<Self> {
        if body.remaining() < 4 + 8 {
            return Err(Error::protocol("short Start body"));
        }
        body.get_u32();
        let measurement_id = body.get_u64();
        Ok(Self {
            measurement_id,
            compress_vectors: header.flag(flags::COMPRESS_VECTORS),
            compress_scalars: header.flag(flags::COMPRESS_SCALARS),
            no_vectors: header.flag(flags::NO_VECTORS),
            no_scalars: header.flag(flags::NO_SCALARS),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Stop {
    pub measurement_id: u64,
}

impl Stop {
    pub fn encode(&self) -> Bytes {
        let length = HEADER_LEN + 4 + 8;
        let mut buf = BytesMut::with_capacity(length);
        Header::new(MessageType::Stop, 0, length as u16).encode(&mut buf);
        buf.put_u32(0);
        buf.put_u64(self.measurement_id);
        buf.freeze()
    }

    pub fn decode(mut body: impl Buf) -> Result<Self> {
        if body.remaining() < 4 + 8 {
            return Err(Error::protocol("short Stop body"));
        }
        body.get_u32();
        Ok(Self {
            measurement_id: body.get_u64(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Results {
    pub eof: bool,
    pub data: Bytes,
}

impl Results {
    pub fn encode(&self) -> Result<Bytes> {
        if self.data.len() > RESULTS_MAX_PAYLOAD {
            return Err(Error::protocol("Results payload exceeds 1400 bytes"));
        }
        let length = HEADER_LEN + self.data.len();
        let mut buf = BytesMut::with_capacity(length);
        let flag_bits = if self.eof { 1 << flags::EOF } else { 0 };
        Header::new(MessageType::Results, flag_bits, length as u16).encode(&mut buf);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn decode(header: Header, body: Bytes) -> Self {
        Self {
            eof: header.flag(flags::EOF),
            data: body,
        }
    }
}

/// A decoded application message, tagged by its wire type.
#[derive(Clone, Debug)]
pub enum Message {
    Acknowledge(Acknowledge),
    AddFlow(AddFlow),
    RemoveFlow(RemoveFlow),
    IdentifyFlow(IdentifyFlow),
    Data(Data),
    Start(Start),
    Stop(Stop),
    Results(Results),
}

impl Message {
    /// Decodes a full framed message (header + body) previously produced by
    /// the [`crate::reader::MessageReader`].
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        let header = Header::decode(&mut bytes)?;
        let message_type = header.message_type()?;
        match message_type {
            MessageType::Acknowledge => Ok(Message::Acknowledge(Acknowledge::decode(header, bytes)?)),
            MessageType::AddFlow => Ok(Message::AddFlow(AddFlow::decode(header, bytes)?)),
            MessageType::RemoveFlow => Ok(Message::RemoveFlow(RemoveFlow::decode(bytes)?)),
            MessageType::IdentifyFlow => Ok(Message::IdentifyFlow(IdentifyFlow::decode(header, bytes)?)),
            MessageType::Data => Ok(Message::Data(Data::decode(header, bytes)?)),
            MessageType::Start => Ok(Message::Start(Start::decode(header, bytes)?)),
            MessageType::Stop => Ok(Message::Stop(Stop::decode(bytes)?)),
            MessageType::Results => Ok(Message::Results(Results::decode(header, bytes))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_flow_round_trips_modulo_padding() {
        let original = AddFlow {
            flow_id: 7,
            measurement_id: 0xdead_beef_0000_0001,
            stream_id: 2,
            protocol: 1,
            description: "a test flow".to_string(),
            ordered_mode: 1.0,
            reliable_mode: 0.5,
            retransmission_trials: RetransmissionTrials {
                trials: 10,
                is_ms: false,
            },
            frame_rate: RandomVariable::constant(10.0),
            frame_size: RandomVariable::uniform(100.0, 200.0),
            rcv_buffer_size: 1 << 20,
            snd_buffer_size: 1 << 20,
            max_msg_size: 1500,
            cmt: 0,
            ccid: 2,
            n_diff_ports: 0,
            path_mgr: "default".to_string(),
            congestion_control: "reno".to_string(),
            on_off_events: vec![OnOffEvent {
                value: RandomVariable::constant(5.0),
                relative_time: true,
                repeat: false,
            }],
            debug: true,
            no_delay: false,
        };

        let encoded = original.encode();
        let decoded = match Message::decode(encoded).unwrap() {
            Message::AddFlow(a) => a,
            _ => panic!("wrong type"),
        };

        assert_eq!(decoded.flow_id, original.flow_id);
        assert_eq!(decoded.measurement_id, original.measurement_id);
        assert_eq!(decoded.stream_id, original.stream_id);
        assert_eq!(decoded.description, original.description);
        assert!((decoded.ordered_mode - original.ordered_mode).abs() < 1e-8);
        assert!((decoded.reliable_mode - original.reliable_mode).abs() < 1e-8);
        assert_eq!(decoded.frame_rate.values[0], original.frame_rate.values[0]);
        assert_eq!(decoded.frame_size.values, original.frame_size.values);
        assert_eq!(decoded.path_mgr, original.path_mgr);
        assert_eq!(decoded.congestion_control, original.congestion_control);
        assert_eq!(decoded.on_off_events.len(), 1);
        assert_eq!(decoded.debug, original.debug);
    }

    #[test]
    fn data_message_round_trips() {
        let original = Data {
            flow_id: 1,
            measurement_id: 2,
            stream_id: 0,
            frame_id: 9,
            seq_number: 100,
            byte_seq_number: 2048,
            timestamp_micros: 123_456,
            frame_begin: true,
            frame_end: false,
            payload: Bytes::from_static(b"hello world"),
        };
        let encoded = original.encode();
        let decoded = match Message::decode(encoded).unwrap() {
            Message::Data(d) => d,
            _ => panic!("wrong type"),
        };
        assert_eq!(decoded.frame_id, original.frame_id);
        assert_eq!(decoded.seq_number, original.seq_number);
        assert_eq!(decoded.byte_seq_number, original.byte_seq_number);
        assert_eq!(decoded.payload, original.payload);
        assert!(decoded.frame_begin);
        assert!(!decoded.frame_end);
    }

    #[test]
    fn identify_flow_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        Header::new(MessageType::IdentifyFlow, 0, (HEADER_LEN + 4 + 8 + 8 + 2) as u16)
            .encode(&mut buf);
        buf.put_u32(1);
        buf.put_u64(0xdead_beef); // wrong magic
        buf.put_u64(2);
        buf.put_u16(0);
        assert!(Message::decode(buf.freeze()).is_err());
    }

    #[test]
    fn results_rejects_oversized_payload() {
        let results = Results {
            eof: false,
            data: Bytes::from(vec![0u8; RESULTS_MAX_PAYLOAD + 1]),
        };
        assert!(results.encode().is_err());
    }

    #[test]
    fn retransmission_trials_roundtrip() {
        let rtx = RetransmissionTrials {
            trials: 12,
            is_ms: true,
        };
        let raw = rtx.encode();
        let back = RetransmissionTrials::decode(raw);
        assert_eq!(back.trials, 12);
        assert!(back.is_ms);
    }
}
