//! Command record encoding.
//!
//! A record is `[command id: u32][payload length: u32][payload]`. The payload
//! is the command's arguments in table order, little-endian. Length-prefixed
//! arguments (`U32Slice`, `Bytes`) are followed by padding up to the next
//! 4-byte boundary. `Staged` arguments occupy no bytes.

use crate::command::{ArgKind, CommandId};
use crate::error::CodecError;
use crate::layout::{COMMAND_HEADER_BYTES, MAX_PAYLOAD_BYTES, RETVAL_VECTOR_MAX_BYTES};

#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    U32(u32),
    I32(i32),
    F32(f32),
    F64(f64),
    U64(u64),
    F32Array(Vec<f32>),
    U32Slice(Vec<u32>),
    Bytes(Vec<u8>),
    Staged,
}

impl Arg {
    fn matches(&self, kind: ArgKind) -> bool {
        matches!(
            (self, kind),
            (Arg::U32(_), ArgKind::U32)
                | (Arg::I32(_), ArgKind::I32)
                | (Arg::F32(_), ArgKind::F32)
                | (Arg::F64(_), ArgKind::F64)
                | (Arg::U64(_), ArgKind::U64)
                | (Arg::F32Array(_), ArgKind::F32Array(_))
                | (Arg::U32Slice(_), ArgKind::U32Slice)
                | (Arg::Bytes(_), ArgKind::Bytes)
                | (Arg::Staged, ArgKind::Staged)
        )
    }
}

/// A decoded command: identifier plus arguments in table order.
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub id: CommandId,
    pub args: Vec<Arg>,
}

macro_rules! scalar_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self, index: usize) -> Result<$ty, CodecError> {
            match self.args.get(index) {
                Some(Arg::$variant(value)) => Ok(*value),
                _ => Err(self.shape(index)),
            }
        }
    };
}

impl Call {
    pub fn new(id: CommandId, args: Vec<Arg>) -> Self {
        Self { id, args }
    }

    scalar_accessor!(u32, U32, u32);
    scalar_accessor!(i32, I32, i32);
    scalar_accessor!(f32, F32, f32);
    scalar_accessor!(f64, F64, f64);
    scalar_accessor!(u64, U64, u64);

    pub fn f32_array(&self, index: usize) -> Result<&[f32], CodecError> {
        match self.args.get(index) {
            Some(Arg::F32Array(values)) => Ok(values),
            _ => Err(self.shape(index)),
        }
    }

    pub fn u32_slice(&self, index: usize) -> Result<&[u32], CodecError> {
        match self.args.get(index) {
            Some(Arg::U32Slice(values)) => Ok(values),
            _ => Err(self.shape(index)),
        }
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8], CodecError> {
        match self.args.get(index) {
            Some(Arg::Bytes(bytes)) => Ok(bytes),
            _ => Err(self.shape(index)),
        }
    }

    fn shape(&self, index: usize) -> CodecError {
        CodecError::Shape {
            command: self.id.name(),
            index,
        }
    }

    /// Checks the arguments against the command's table row.
    pub fn validate(&self) -> Result<(), CodecError> {
        let kinds = self.id.args();
        if kinds.len() != self.args.len() {
            return Err(CodecError::Arity {
                command: self.id.name(),
                expected: kinds.len(),
                found: self.args.len(),
            });
        }
        for (index, (arg, kind)) in self.args.iter().zip(kinds).enumerate() {
            if !arg.matches(*kind) {
                return Err(self.shape(index));
            }
            if let (Arg::F32Array(values), ArgKind::F32Array(len)) = (arg, kind) {
                if values.len() != *len {
                    return Err(CodecError::ArrayLength {
                        command: self.id.name(),
                        index,
                        expected: *len,
                        found: values.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Encodes `call` into a complete record, header included.
pub fn encode_call(call: &Call) -> Result<Vec<u8>, CodecError> {
    call.validate()?;

    let mut out = Vec::with_capacity(COMMAND_HEADER_BYTES + 16);
    push_u32(&mut out, call.id.as_u32());
    push_u32(&mut out, 0);

    for arg in &call.args {
        match arg {
            Arg::U32(v) => push_u32(&mut out, *v),
            Arg::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Arg::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Arg::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Arg::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Arg::F32Array(values) => {
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            Arg::U32Slice(values) => {
                push_u32(&mut out, length_prefix(values.len())?);
                for v in values {
                    push_u32(&mut out, *v);
                }
            }
            Arg::Bytes(bytes) => {
                push_u32(&mut out, length_prefix(bytes.len())?);
                out.extend_from_slice(bytes);
                pad4(&mut out);
            }
            Arg::Staged => {}
        }
    }

    let payload_len = out.len() - COMMAND_HEADER_BYTES;
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(CodecError::Oversized {
            len: payload_len,
            max: MAX_PAYLOAD_BYTES,
        });
    }
    out[4..8].copy_from_slice(&(payload_len as u32).to_le_bytes());
    Ok(out)
}

fn length_prefix(len: usize) -> Result<u32, CodecError> {
    if len > MAX_PAYLOAD_BYTES {
        return Err(CodecError::Oversized {
            len,
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(len as u32)
}

/// Splits a record header into `(command id, payload length)`.
pub fn decode_header(header: [u8; COMMAND_HEADER_BYTES]) -> (u32, usize) {
    let id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (id, len as usize)
}

struct Reader<'a> {
    command: &'static str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let available = self.bytes.len() - self.pos;
        if len > available {
            return Err(CodecError::Truncated {
                command: self.command,
                needed: len,
                available,
            });
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }
}

/// Decodes a complete record, header included.
///
/// The record must be exactly `8 + payload length` bytes long.
pub fn decode_call(record: &[u8]) -> Result<Call, CodecError> {
    let header: [u8; COMMAND_HEADER_BYTES] = record
        .get(..COMMAND_HEADER_BYTES)
        .and_then(|header| header.try_into().ok())
        .ok_or(CodecError::Truncated {
            command: "record header",
            needed: COMMAND_HEADER_BYTES,
            available: record.len(),
        })?;
    let (raw_id, payload_len) = decode_header(header);
    let id = CommandId::from_u32(raw_id).ok_or(CodecError::UnknownCommand(raw_id))?;
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(CodecError::Oversized {
            len: payload_len,
            max: MAX_PAYLOAD_BYTES,
        });
    }

    let payload = &record[COMMAND_HEADER_BYTES..];
    if payload.len() < payload_len {
        return Err(CodecError::Truncated {
            command: id.name(),
            needed: payload_len,
            available: payload.len(),
        });
    }
    if payload.len() > payload_len {
        return Err(CodecError::TrailingBytes {
            command: id.name(),
            extra: payload.len() - payload_len,
        });
    }

    let mut reader = Reader {
        command: id.name(),
        bytes: payload,
        pos: 0,
    };
    let mut args = Vec::with_capacity(id.args().len());
    for kind in id.args() {
        let arg = match *kind {
            ArgKind::U32 => Arg::U32(reader.u32()?),
            ArgKind::I32 => Arg::I32(i32::from_le_bytes(reader.array()?)),
            ArgKind::F32 => Arg::F32(f32::from_le_bytes(reader.array()?)),
            ArgKind::F64 => Arg::F64(f64::from_le_bytes(reader.array()?)),
            ArgKind::U64 => Arg::U64(u64::from_le_bytes(reader.array()?)),
            ArgKind::F32Array(len) => {
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    values.push(f32::from_le_bytes(reader.array()?));
                }
                Arg::F32Array(values)
            }
            ArgKind::U32Slice => {
                let len = reader.u32()? as usize;
                let raw = reader.take(len.saturating_mul(4))?;
                Arg::U32Slice(
                    raw.chunks_exact(4)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
            }
            ArgKind::Bytes => {
                let len = reader.u32()? as usize;
                let bytes = reader.take(len)?.to_vec();
                reader.take(padded_len(len) - len)?;
                Arg::Bytes(bytes)
            }
            ArgKind::Staged => Arg::Staged,
        };
        args.push(arg);
    }

    let extra = payload.len() - reader.pos;
    if extra != 0 {
        return Err(CodecError::TrailingBytes {
            command: id.name(),
            extra,
        });
    }
    Ok(Call { id, args })
}

/// Fails with [`CodecError::VectorTooLarge`] if `len` does not fit the
/// vector return slot.
pub fn check_vector_len(len: usize) -> Result<(), CodecError> {
    if len > RETVAL_VECTOR_MAX_BYTES {
        return Err(CodecError::VectorTooLarge {
            len,
            max: RETVAL_VECTOR_MAX_BYTES,
        });
    }
    Ok(())
}

pub fn u32s_to_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i32s_to_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`u32s_to_bytes`]; a trailing partial word is ignored.
pub fn bytes_to_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn bytes_to_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn bytes_to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
