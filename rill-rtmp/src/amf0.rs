//! AMF0 value codec for RTMP command and data messages.

use shared::buffer::{BytesReader, BytesWriter};
use shared::error::{Error, Result};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_LONG_STRING: u8 = 0x0C;

/// One AMF0 value. Objects keep insertion order, which RTMP peers rely on
/// for the `connect` response.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    EcmaArray(Vec<(String, Amf0Value)>),
    StrictArray(Vec<Amf0Value>),
    Null,
    Undefined,
}

impl Amf0Value {
    pub fn read(r: &mut BytesReader<'_>) -> Result<Amf0Value> {
        let marker = r
            .read_u8()
            .map_err(|_| Error::Amf0Decode("eof at marker".into()))?;
        match marker {
            MARKER_NUMBER => Ok(Amf0Value::Number(r.read_f64()?)),
            MARKER_BOOLEAN => Ok(Amf0Value::Boolean(r.read_u8()? != 0)),
            MARKER_STRING => Ok(Amf0Value::String(read_utf8(r)?)),
            MARKER_LONG_STRING => {
                let len = r.read_u32()? as usize;
                let raw = r.read_slice(len)?;
                Ok(Amf0Value::String(
                    String::from_utf8_lossy(raw).into_owned(),
                ))
            }
            MARKER_OBJECT => Ok(Amf0Value::Object(read_properties(r)?)),
            MARKER_ECMA_ARRAY => {
                let _count = r.read_u32()?;
                Ok(Amf0Value::EcmaArray(read_properties(r)?))
            }
            MARKER_STRICT_ARRAY => {
                let count = r.read_u32()? as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(Amf0Value::read(r)?);
                }
                Ok(Amf0Value::StrictArray(items))
            }
            MARKER_NULL => Ok(Amf0Value::Null),
            MARKER_UNDEFINED => Ok(Amf0Value::Undefined),
            m => Err(Error::Amf0Decode(format!("unsupported marker {m:#04x}"))),
        }
    }

    pub fn write(&self, w: &mut BytesWriter) {
        match self {
            Amf0Value::Number(v) => {
                w.write_u8(MARKER_NUMBER);
                w.write_f64(*v);
            }
            Amf0Value::Boolean(v) => {
                w.write_u8(MARKER_BOOLEAN);
                w.write_u8(*v as u8);
            }
            Amf0Value::String(s) => {
                if s.len() > u16::MAX as usize {
                    w.write_u8(MARKER_LONG_STRING);
                    w.write_u32(s.len() as u32);
                } else {
                    w.write_u8(MARKER_STRING);
                    w.write_u16(s.len() as u16);
                }
                w.write_slice(s.as_bytes());
            }
            Amf0Value::Object(props) => {
                w.write_u8(MARKER_OBJECT);
                write_properties(w, props);
            }
            Amf0Value::EcmaArray(props) => {
                w.write_u8(MARKER_ECMA_ARRAY);
                w.write_u32(props.len() as u32);
                write_properties(w, props);
            }
            Amf0Value::StrictArray(items) => {
                w.write_u8(MARKER_STRICT_ARRAY);
                w.write_u32(items.len() as u32);
                for item in items {
                    item.write(w);
                }
            }
            Amf0Value::Null => w.write_u8(MARKER_NULL),
            Amf0Value::Undefined => w.write_u8(MARKER_UNDEFINED),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Property lookup on objects and ecma arrays.
    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Amf0Value::Object(props) | Amf0Value::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }
}

fn read_utf8(r: &mut BytesReader<'_>) -> Result<String> {
    let len = r.read_u16()? as usize;
    let raw = r.read_slice(len)?;
    Ok(String::from_utf8_lossy(raw).into_owned())
}

fn read_properties(r: &mut BytesReader<'_>) -> Result<Vec<(String, Amf0Value)>> {
    let mut props = Vec::new();
    loop {
        let name = read_utf8(r)?;
        if name.is_empty() && r.peek_u8()? == MARKER_OBJECT_END {
            r.skip(1)?;
            return Ok(props);
        }
        props.push((name, Amf0Value::read(r)?));
    }
}

fn write_properties(w: &mut BytesWriter, props: &[(String, Amf0Value)]) {
    for (name, value) in props {
        w.write_u16(name.len() as u16);
        w.write_slice(name.as_bytes());
        value.write(w);
    }
    w.write_u16(0);
    w.write_u8(MARKER_OBJECT_END);
}

/// Reads consecutive AMF0 values until the buffer is exhausted, the shape
/// of command message bodies.
pub fn read_all(data: &[u8]) -> Result<Vec<Amf0Value>> {
    let mut r = BytesReader::new(data);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(Amf0Value::read(&mut r)?);
    }
    Ok(out)
}

/// Writes values back-to-back into one body.
pub fn write_all(values: &[Amf0Value]) -> bytes::Bytes {
    let mut w = BytesWriter::new();
    for v in values {
        v.write(&mut w);
    }
    w.freeze()
}
