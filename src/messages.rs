//! Matter message framing and secure channel (PASE) payloads.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

use crate::tlv;

/// Session id of the unsecured session used by handshakes.
pub const UNSECURED_SESSION_ID: u16 = 0;

/// Offset of the little endian session id inside a message header.
pub const SESSION_ID_OFFSET: usize = 1;

pub const PROTOCOL_ID_SECURE_CHANNEL: u16 = 0;

pub mod opcode {
    pub const STANDALONE_ACK: u8 = 0x10;
    pub const PBKDF_PARAM_REQUEST: u8 = 0x20;
    pub const PBKDF_PARAM_RESPONSE: u8 = 0x21;
    pub const PASE_PAKE1: u8 = 0x22;
    pub const PASE_PAKE2: u8 = 0x23;
    pub const PASE_PAKE3: u8 = 0x24;
    pub const STATUS_REPORT: u8 = 0x40;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    None,
    Node(u64),
    Group(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub session_id: u16,
    pub security_flags: u8,
    pub message_counter: u32,
    pub source_node_id: Option<u64>,
    pub destination: Destination,
}

impl MessageHeader {
    const FLAG_SRC_PRESENT: u8 = 4;
    const DSIZ_MASK: u8 = 3;
    const DSIZ_64: u8 = 1;
    const DSIZ_16: u8 = 2;
    const VERSION_MASK: u8 = 0xf0;

    pub const SEC_FLAG_PRIVACY: u8 = 0x80;
    pub const SEC_FLAG_CONTROL: u8 = 0x40;
    pub const SEC_FLAG_EXTENSIONS: u8 = 0x20;
    pub const SESSION_TYPE_MASK: u8 = 0x03;
    pub const SESSION_TYPE_UNICAST: u8 = 0;

    pub fn unicast(session_id: u16, message_counter: u32) -> Self {
        Self {
            session_id,
            security_flags: Self::SESSION_TYPE_UNICAST,
            message_counter,
            source_node_id: None,
            destination: Destination::None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags: u8 = 0;
        if self.source_node_id.is_some() {
            flags |= Self::FLAG_SRC_PRESENT;
        }
        match self.destination {
            Destination::None => {}
            Destination::Node(_) => flags |= Self::DSIZ_64,
            Destination::Group(_) => flags |= Self::DSIZ_16,
        }
        let mut out = Vec::with_capacity(26);
        out.write_u8(flags)?;
        out.write_u16::<LittleEndian>(self.session_id)?;
        out.write_u8(self.security_flags)?;
        out.write_u32::<LittleEndian>(self.message_counter)?;
        if let Some(src) = self.source_node_id {
            out.write_u64::<LittleEndian>(src)?;
        }
        match self.destination {
            Destination::None => {}
            Destination::Node(n) => out.write_u64::<LittleEndian>(n)?,
            Destination::Group(g) => out.write_u16::<LittleEndian>(g)?,
        }
        Ok(out)
    }

    /// Decodes the header and returns it with its encoded length. The header bytes are
    /// the associated data of the encrypted payload that follows.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u8()?;
        if flags & Self::VERSION_MASK != 0 {
            anyhow::bail!("unsupported message version {}", flags >> 4);
        }
        let session_id = cursor.read_u16::<LittleEndian>()?;
        let security_flags = cursor.read_u8()?;
        let message_counter = cursor.read_u32::<LittleEndian>()?;
        let source_node_id = if flags & Self::FLAG_SRC_PRESENT != 0 {
            Some(cursor.read_u64::<LittleEndian>()?)
        } else {
            None
        };
        let destination = match flags & Self::DSIZ_MASK {
            0 => Destination::None,
            Self::DSIZ_64 => Destination::Node(cursor.read_u64::<LittleEndian>()?),
            Self::DSIZ_16 => Destination::Group(cursor.read_u16::<LittleEndian>()?),
            _ => anyhow::bail!("reserved destination size"),
        };
        if security_flags & Self::SEC_FLAG_EXTENSIONS != 0 {
            let len = cursor.read_u16::<LittleEndian>()? as u64;
            if cursor.position() + len > data.len() as u64 {
                anyhow::bail!("message extensions exceed datagram");
            }
            cursor.set_position(cursor.position() + len);
        }
        Ok((
            Self {
                session_id,
                security_flags,
                message_counter,
                source_node_id,
                destination,
            },
            cursor.position() as usize,
        ))
    }

    pub fn is_unicast(&self) -> bool {
        self.security_flags & Self::SESSION_TYPE_MASK == Self::SESSION_TYPE_UNICAST
    }
}

/// Reads the session id without decoding the rest of the header.
pub fn peek_session_id(data: &[u8]) -> Option<u16> {
    let raw = data.get(SESSION_ID_OFFSET..SESSION_ID_OFFSET + 2)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

/// Exchange layer header preceding every payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub exchange_flags: u8,
    pub opcode: u8,
    pub exchange_id: u16,
    pub vendor_id: Option<u16>,
    pub protocol_id: u16,
    pub ack_counter: Option<u32>,
}

impl ProtocolHeader {
    pub const FLAG_INITIATOR: u8 = 0x01;
    pub const FLAG_ACK: u8 = 0x02;
    pub const FLAG_RELIABILITY: u8 = 0x04;
    pub const FLAG_SECURED_EXTENSIONS: u8 = 0x08;
    pub const FLAG_VENDOR: u8 = 0x10;

    pub fn secure_channel(opcode: u8, exchange_id: u16, initiator: bool) -> Self {
        let mut exchange_flags = Self::FLAG_RELIABILITY;
        if initiator {
            exchange_flags |= Self::FLAG_INITIATOR;
        }
        Self {
            exchange_flags,
            opcode,
            exchange_id,
            vendor_id: None,
            protocol_id: PROTOCOL_ID_SECURE_CHANNEL,
            ack_counter: None,
        }
    }

    pub fn with_ack(mut self, ack_counter: Option<u32>) -> Self {
        self.ack_counter = ack_counter;
        self
    }

    pub fn is_initiator(&self) -> bool {
        self.exchange_flags & Self::FLAG_INITIATOR != 0
    }

    pub fn needs_ack(&self) -> bool {
        self.exchange_flags & Self::FLAG_RELIABILITY != 0
    }

    pub fn is_secure_channel(&self, opcode: u8) -> bool {
        self.vendor_id.is_none()
            && self.protocol_id == PROTOCOL_ID_SECURE_CHANNEL
            && self.opcode == opcode
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut flags = self.exchange_flags
            & !(Self::FLAG_ACK | Self::FLAG_VENDOR | Self::FLAG_SECURED_EXTENSIONS);
        if self.ack_counter.is_some() {
            flags |= Self::FLAG_ACK;
        }
        if self.vendor_id.is_some() {
            flags |= Self::FLAG_VENDOR;
        }
        out.write_u8(flags)?;
        out.write_u8(self.opcode)?;
        out.write_u16::<LittleEndian>(self.exchange_id)?;
        if let Some(vendor) = self.vendor_id {
            out.write_u16::<LittleEndian>(vendor)?;
        }
        out.write_u16::<LittleEndian>(self.protocol_id)?;
        if let Some(ack) = self.ack_counter {
            out.write_u32::<LittleEndian>(ack)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(data);
        let exchange_flags = cursor.read_u8()?;
        let opcode = cursor.read_u8()?;
        let exchange_id = cursor.read_u16::<LittleEndian>()?;
        let vendor_id = if exchange_flags & Self::FLAG_VENDOR != 0 {
            Some(cursor.read_u16::<LittleEndian>()?)
        } else {
            None
        };
        let protocol_id = cursor.read_u16::<LittleEndian>()?;
        let ack_counter = if exchange_flags & Self::FLAG_ACK != 0 {
            Some(cursor.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        if exchange_flags & Self::FLAG_SECURED_EXTENSIONS != 0 {
            let len = cursor.read_u16::<LittleEndian>()? as u64;
            if cursor.position() + len > data.len() as u64 {
                anyhow::bail!("secured extensions exceed payload");
            }
            cursor.set_position(cursor.position() + len);
        }
        Ok((
            Self {
                exchange_flags,
                opcode,
                exchange_id,
                vendor_id,
                protocol_id,
                ack_counter,
            },
            cursor.position() as usize,
        ))
    }
}

/// Exchange header plus application payload, the part of a message that gets encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub header: ProtocolHeader,
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + self.payload.len());
        self.header.encode(&mut out)?;
        out.write_all(&self.payload)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (header, len) = ProtocolHeader::decode(data)?;
        Ok(Self {
            header,
            payload: data[len..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralCode {
    Success = 0,
    Failure = 1,
    BadPrecondition = 2,
    OutOfRange = 3,
    BadRequest = 4,
    Unsupported = 5,
    Unexpected = 6,
    ResourceExhausted = 7,
    Busy = 8,
    Timeout = 9,
    Continue = 10,
    Aborted = 11,
    InvalidArgument = 12,
    NotFound = 13,
    AlreadyExists = 14,
    PermissionDenied = 15,
    DataLoss = 16,
    Unknown = 0xffff,
}

impl From<u16> for GeneralCode {
    fn from(value: u16) -> Self {
        match value {
            0 => GeneralCode::Success,
            1 => GeneralCode::Failure,
            2 => GeneralCode::BadPrecondition,
            3 => GeneralCode::OutOfRange,
            4 => GeneralCode::BadRequest,
            5 => GeneralCode::Unsupported,
            6 => GeneralCode::Unexpected,
            7 => GeneralCode::ResourceExhausted,
            8 => GeneralCode::Busy,
            9 => GeneralCode::Timeout,
            10 => GeneralCode::Continue,
            11 => GeneralCode::Aborted,
            12 => GeneralCode::InvalidArgument,
            13 => GeneralCode::NotFound,
            14 => GeneralCode::AlreadyExists,
            15 => GeneralCode::PermissionDenied,
            16 => GeneralCode::DataLoss,
            _ => GeneralCode::Unknown,
        }
    }
}

pub mod protocol_code {
    pub const SESSION_ESTABLISHMENT_SUCCESS: u16 = 0;
    pub const NO_SHARED_TRUST_ROOTS: u16 = 1;
    pub const INVALID_PARAMETER: u16 = 2;
    pub const CLOSE_SESSION: u16 = 3;
    pub const BUSY: u16 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub general_code: u16,
    pub protocol_id: u32,
    pub protocol_code: u16,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StatusReport: general_code={:?} protocol_id={} protocol_code={}",
            GeneralCode::from(self.general_code),
            self.protocol_id,
            self.protocol_code
        )
    }
}

impl StatusReport {
    pub fn session_established() -> Self {
        Self {
            general_code: GeneralCode::Success as u16,
            protocol_id: PROTOCOL_ID_SECURE_CHANNEL as u32,
            protocol_code: protocol_code::SESSION_ESTABLISHMENT_SUCCESS,
        }
    }

    /// The only failure a handshake ever reports to its peer, whatever went wrong.
    pub fn generic_failure() -> Self {
        Self {
            general_code: GeneralCode::Failure as u16,
            protocol_id: PROTOCOL_ID_SECURE_CHANNEL as u32,
            protocol_code: protocol_code::INVALID_PARAMETER,
        }
    }

    /// Sent when no session slot is free for a new handshake.
    pub fn busy() -> Self {
        Self {
            general_code: GeneralCode::Busy as u16,
            protocol_id: PROTOCOL_ID_SECURE_CHANNEL as u32,
            protocol_code: protocol_code::BUSY,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.general_code == 0 && self.protocol_id == 0 && self.protocol_code == 0
    }

    pub fn is_busy(&self) -> bool {
        self.protocol_id == PROTOCOL_ID_SECURE_CHANNEL as u32
            && self.protocol_code == protocol_code::BUSY
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8);
        out.write_u16::<LittleEndian>(self.general_code)?;
        out.write_u32::<LittleEndian>(self.protocol_id)?;
        out.write_u16::<LittleEndian>(self.protocol_code)?;
        Ok(out)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let general_code = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u32::<LittleEndian>()?;
        let protocol_code = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            general_code,
            protocol_id,
            protocol_code,
        })
    }
}

/// MRP session parameters exchanged during PASE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilityParams {
    /// Retransmission interval while the peer is idle, in ms.
    pub idle_retrans_ms: u32,
    /// Retransmission interval while the peer is active, in ms.
    pub active_retrans_ms: u32,
}

impl Default for ReliabilityParams {
    fn default() -> Self {
        Self {
            idle_retrans_ms: 500,
            active_retrans_ms: 300,
        }
    }
}

impl ReliabilityParams {
    fn write(&self, w: &mut tlv::TlvWriter, tag: u8) -> Result<()> {
        w.start_struct(tag)?;
        w.uint32(1, self.idle_retrans_ms)?;
        w.uint32(2, self.active_retrans_ms)?;
        w.end_container()?;
        Ok(())
    }

    fn read(t: &tlv::TlvElement, tag: u8) -> Option<Self> {
        if !t.contains(&[tag]) {
            return None;
        }
        let defaults = Self::default();
        Some(Self {
            idle_retrans_ms: t.get_u32(&[tag, 1]).unwrap_or(defaults.idle_retrans_ms),
            active_retrans_ms: t.get_u32(&[tag, 2]).unwrap_or(defaults.active_retrans_ms),
        })
    }
}

pub const RANDOM_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbkdfParamRequest {
    pub initiator_random: [u8; RANDOM_LEN],
    pub initiator_session_id: u16,
    pub passcode_id: u16,
    pub has_pbkdf_parameters: bool,
    pub session_params: Option<ReliabilityParams>,
}

impl PbkdfParamRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = tlv::TlvWriter::new();
        w.start_anon_struct()?;
        w.octet_string(1, &self.initiator_random)?;
        w.uint16(2, self.initiator_session_id)?;
        w.uint16(3, self.passcode_id)?;
        w.bool(4, self.has_pbkdf_parameters)?;
        if let Some(p) = &self.session_params {
            p.write(&mut w, 5)?;
        }
        w.end_container()?;
        Ok(w.data)
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let t = tlv::decode(payload)?;
        Ok(Self {
            initiator_random: fixed_random(&t, 1)?,
            initiator_session_id: t.get_u16(&[2]).context("initiator session id missing")?,
            passcode_id: t.get_u16(&[3]).context("passcode id missing")?,
            has_pbkdf_parameters: t.get_bool(&[4]).context("hasPBKDFParameters missing")?,
            session_params: ReliabilityParams::read(&t, 5),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbkdfParamResponse {
    pub initiator_random: [u8; RANDOM_LEN],
    pub responder_random: [u8; RANDOM_LEN],
    pub responder_session_id: u16,
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub session_params: Option<ReliabilityParams>,
}

impl PbkdfParamResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = tlv::TlvWriter::new();
        w.start_anon_struct()?;
        w.octet_string(1, &self.initiator_random)?;
        w.octet_string(2, &self.responder_random)?;
        w.uint16(3, self.responder_session_id)?;
        w.start_struct(4)?;
        w.uint32(1, self.iterations)?;
        w.octet_string(2, &self.salt)?;
        w.end_container()?;
        if let Some(p) = &self.session_params {
            p.write(&mut w, 5)?;
        }
        w.end_container()?;
        Ok(w.data)
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let t = tlv::decode(payload)?;
        Ok(Self {
            initiator_random: fixed_random(&t, 1)?,
            responder_random: fixed_random(&t, 2)?,
            responder_session_id: t.get_u16(&[3]).context("responder session id missing")?,
            iterations: t.get_u32(&[4, 1]).context("pbkdf iterations missing")?,
            salt: t.get_octet_string(&[4, 2]).context("pbkdf salt missing")?.to_vec(),
            session_params: ReliabilityParams::read(&t, 5),
        })
    }
}

fn fixed_random(t: &tlv::TlvElement, tag: u8) -> Result<[u8; RANDOM_LEN]> {
    let raw = t
        .get_octet_string(&[tag])
        .context(format!("random tag {} missing", tag))?;
    raw.try_into()
        .map_err(|_| anyhow::anyhow!("random tag {} has length {}", tag, raw.len()))
}

/// Pake1 carries pA, Pake3 carries cA. Both are a single octet string with tag 1.
pub fn encode_single_octet_string(value: &[u8]) -> Result<Vec<u8>> {
    let mut w = tlv::TlvWriter::new();
    w.start_anon_struct()?;
    w.octet_string(1, value)?;
    w.end_container()?;
    Ok(w.data)
}

pub fn parse_single_octet_string(payload: &[u8]) -> Result<Vec<u8>> {
    let t = tlv::decode(payload)?;
    Ok(t.get_octet_string(&[1]).context("tag 1 missing")?.to_vec())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pake2 {
    pub pb: Vec<u8>,
    pub cb: Vec<u8>,
}

impl Pake2 {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = tlv::TlvWriter::new();
        w.start_anon_struct()?;
        w.octet_string(1, &self.pb)?;
        w.octet_string(2, &self.cb)?;
        w.end_container()?;
        Ok(w.data)
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let t = tlv::decode(payload)?;
        Ok(Self {
            pb: t.get_octet_string(&[1]).context("pB missing")?.to_vec(),
            cb: t.get_octet_string(&[2]).context("cB missing")?.to_vec(),
        })
    }
}
