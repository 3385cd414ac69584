//! Subset of Matter TLV used by secure channel payloads.
//!
//! Only anonymous and context-specific tags are supported; that is all the PASE
//! messages carry.
//!
//! ```
//! # use matsess::tlv;
//! # fn main() -> std::io::Result<()> {
//! let mut w = tlv::TlvWriter::new();
//! w.start_anon_struct()?;
//! w.octet_string(1, &[1, 2, 3])?;
//! w.uint16(2, 0x1234)?;
//! w.end_container()?;
//! let decoded = tlv::decode(&w.data)?;
//! assert_eq!(decoded.get_u16(&[2]), Some(0x1234));
//! # Ok(())
//! # }
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Error, ErrorKind, Read, Result, Write};

const TYPE_INT_1: u8 = 0x00;
const TYPE_INT_2: u8 = 0x01;
const TYPE_INT_4: u8 = 0x02;
const TYPE_INT_8: u8 = 0x03;
const TYPE_UINT_1: u8 = 0x04;
const TYPE_UINT_2: u8 = 0x05;
const TYPE_UINT_4: u8 = 0x06;
const TYPE_UINT_8: u8 = 0x07;
const TYPE_BOOL_FALSE: u8 = 0x08;
const TYPE_BOOL_TRUE: u8 = 0x09;
const TYPE_UTF8_L1: u8 = 0x0c;
const TYPE_UTF8_L2: u8 = 0x0d;
const TYPE_OCTET_STRING_L1: u8 = 0x10;
const TYPE_OCTET_STRING_L2: u8 = 0x11;
const TYPE_NULL: u8 = 0x14;
const TYPE_STRUCT: u8 = 0x15;
const TYPE_ARRAY: u8 = 0x16;
const TYPE_LIST: u8 = 0x17;
const TYPE_END_CONTAINER: u8 = 0x18;

const TAG_ANONYMOUS: u8 = 0;
const TAG_CONTEXT: u8 = 1;
const CTRL_CTX_L1: u8 = TAG_CONTEXT << 5;

/// Maximum container nesting accepted by [decode].
const MAX_DEPTH: usize = 8;

/// Append-only TLV encoder. `data` holds the encoded bytes.
pub struct TlvWriter {
    pub data: Vec<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(256),
        }
    }

    pub fn start_anon_struct(&mut self) -> Result<()> {
        self.data.write_u8(TYPE_STRUCT)
    }

    pub fn start_struct(&mut self, tag: u8) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_STRUCT)?;
        self.data.write_u8(tag)
    }

    pub fn end_container(&mut self) -> Result<()> {
        self.data.write_u8(TYPE_END_CONTAINER)
    }

    pub fn octet_string(&mut self, tag: u8, value: &[u8]) -> Result<()> {
        if value.len() > u16::MAX as usize {
            return Err(Error::new(ErrorKind::InvalidInput, "octet string too long"));
        }
        if value.len() > 0xff {
            self.data.write_u8(CTRL_CTX_L1 | TYPE_OCTET_STRING_L2)?;
            self.data.write_u8(tag)?;
            self.data.write_u16::<LittleEndian>(value.len() as u16)?;
        } else {
            self.data.write_u8(CTRL_CTX_L1 | TYPE_OCTET_STRING_L1)?;
            self.data.write_u8(tag)?;
            self.data.write_u8(value.len() as u8)?;
        }
        self.data.write_all(value)
    }

    pub fn uint8(&mut self, tag: u8, value: u8) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_UINT_1)?;
        self.data.write_u8(tag)?;
        self.data.write_u8(value)
    }

    pub fn uint16(&mut self, tag: u8, value: u16) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_UINT_2)?;
        self.data.write_u8(tag)?;
        self.data.write_u16::<LittleEndian>(value)
    }

    pub fn uint32(&mut self, tag: u8, value: u32) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_UINT_4)?;
        self.data.write_u8(tag)?;
        self.data.write_u32::<LittleEndian>(value)
    }

    pub fn bool(&mut self, tag: u8, value: bool) -> Result<()> {
        let tp = if value { TYPE_BOOL_TRUE } else { TYPE_BOOL_FALSE };
        self.data.write_u8(CTRL_CTX_L1 | tp)?;
        self.data.write_u8(tag)
    }
}

impl Default for TlvWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TlvValue {
    UInt(u64),
    Int(i64),
    Bool(bool),
    String(String),
    OctetString(Vec<u8>),
    Container(Vec<TlvElement>),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlvElement {
    /// Context tag, 0 for anonymous elements.
    pub tag: u8,
    pub value: TlvValue,
}

impl TlvElement {
    /// Walks nested containers by context tag.
    pub fn get(&self, path: &[u8]) -> Option<&TlvValue> {
        match path.split_first() {
            None => Some(&self.value),
            Some((first, rest)) => match &self.value {
                TlvValue::Container(items) => items
                    .iter()
                    .find(|i| i.tag == *first)
                    .and_then(|i| i.get(rest)),
                _ => None,
            },
        }
    }

    pub fn get_uint(&self, path: &[u8]) -> Option<u64> {
        match self.get(path) {
            Some(TlvValue::UInt(v)) => Some(*v),
            Some(TlvValue::Int(v)) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn get_u16(&self, path: &[u8]) -> Option<u16> {
        self.get_uint(path).and_then(|v| u16::try_from(v).ok())
    }

    pub fn get_u32(&self, path: &[u8]) -> Option<u32> {
        self.get_uint(path).and_then(|v| u32::try_from(v).ok())
    }

    pub fn get_bool(&self, path: &[u8]) -> Option<bool> {
        match self.get(path) {
            Some(TlvValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_octet_string(&self, path: &[u8]) -> Option<&[u8]> {
        match self.get(path) {
            Some(TlvValue::OctetString(o)) => Some(o),
            _ => None,
        }
    }

    pub fn contains(&self, path: &[u8]) -> bool {
        self.get(path).is_some()
    }
}

fn invalid(msg: String) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

fn read_tag(tag_control: u8, cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    match tag_control {
        TAG_ANONYMOUS => Ok(0),
        TAG_CONTEXT => cursor.read_u8(),
        other => Err(invalid(format!("unsupported tag control {}", other))),
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len as u64 > remaining {
        return Err(invalid(format!("length {} exceeds remaining {}", len, remaining)));
    }
    let mut value = vec![0; len];
    cursor.read_exact(&mut value)?;
    Ok(value)
}

/// Decodes elements until end of input or end of the enclosing container.
/// Returns true when an end-of-container marker was consumed.
fn decode_into(
    cursor: &mut Cursor<&[u8]>,
    container: &mut Vec<TlvElement>,
    depth: usize,
) -> Result<bool> {
    if depth > MAX_DEPTH {
        return Err(invalid("tlv nesting too deep".to_owned()));
    }
    while cursor.position() < cursor.get_ref().len() as u64 {
        let control = cursor.read_u8()?;
        let tp = control & 0x1f;
        if tp == TYPE_END_CONTAINER {
            return Ok(true);
        }
        let tag = read_tag(control >> 5, cursor)?;
        let value = match tp {
            TYPE_INT_1 => TlvValue::Int(cursor.read_i8()? as i64),
            TYPE_INT_2 => TlvValue::Int(cursor.read_i16::<LittleEndian>()? as i64),
            TYPE_INT_4 => TlvValue::Int(cursor.read_i32::<LittleEndian>()? as i64),
            TYPE_INT_8 => TlvValue::Int(cursor.read_i64::<LittleEndian>()?),
            TYPE_UINT_1 => TlvValue::UInt(cursor.read_u8()? as u64),
            TYPE_UINT_2 => TlvValue::UInt(cursor.read_u16::<LittleEndian>()? as u64),
            TYPE_UINT_4 => TlvValue::UInt(cursor.read_u32::<LittleEndian>()? as u64),
            TYPE_UINT_8 => TlvValue::UInt(cursor.read_u64::<LittleEndian>()?),
            TYPE_BOOL_FALSE => TlvValue::Bool(false),
            TYPE_BOOL_TRUE => TlvValue::Bool(true),
            TYPE_NULL => TlvValue::Null,
            TYPE_UTF8_L1 | TYPE_UTF8_L2 => {
                let len = if tp == TYPE_UTF8_L1 {
                    cursor.read_u8()? as usize
                } else {
                    cursor.read_u16::<LittleEndian>()? as usize
                };
                let raw = read_bytes(cursor, len)?;
                TlvValue::String(String::from_utf8(raw).map_err(|e| invalid(e.to_string()))?)
            }
            TYPE_OCTET_STRING_L1 => {
                let len = cursor.read_u8()? as usize;
                TlvValue::OctetString(read_bytes(cursor, len)?)
            }
            TYPE_OCTET_STRING_L2 => {
                let len = cursor.read_u16::<LittleEndian>()? as usize;
                TlvValue::OctetString(read_bytes(cursor, len)?)
            }
            TYPE_STRUCT | TYPE_ARRAY | TYPE_LIST => {
                let mut inner = Vec::new();
                if !decode_into(cursor, &mut inner, depth + 1)? {
                    return Err(invalid("unterminated container".to_owned()));
                }
                TlvValue::Container(inner)
            }
            _ => return Err(invalid(format!("unknown tlv type 0x{:x}", tp))),
        };
        container.push(TlvElement { tag, value });
    }
    Ok(false)
}

/// Decodes a buffer. A single top level element is returned as is, multiple elements
/// are wrapped in an anonymous container.
pub fn decode(data: &[u8]) -> Result<TlvElement> {
    let mut cursor = Cursor::new(data);
    let mut top = Vec::new();
    if decode_into(&mut cursor, &mut top, 0)? {
        return Err(invalid("unexpected end of container".to_owned()));
    }
    match top.len() {
        0 => Err(invalid("no data found".to_owned())),
        1 => Ok(top.remove(0)),
        _ => Ok(TlvElement {
            tag: 0,
            value: TlvValue::Container(top),
        }),
    }
}
