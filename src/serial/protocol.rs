//! Programmer wire format.
//!
//! Commands go out as raw `[opcode, params...]` with no length prefix; the
//! firmware knows each opcode's arity. Two frame kinds come back:
//!
//! - response: `'&'`, `length`, `payload[length]`, `checksum`
//! - alert: `'@'`, `code`
//!
//! The trailing byte of a response is an additive checksum (sum of the
//! payload modulo 256). It only catches gross corruption: reordered bytes
//! and compensating errors pass. The firmware defines it, so it stays.

use super::types::ResponseFrame;
use super::{Result, SerialError};

pub const RESPONSE_MARKER: u8 = b'&';
pub const ALERT_MARKER: u8 = b'@';

/// Bytes needed before a frame can be classified (marker + length/code).
pub const HEADER_SIZE: usize = 2;

/// Payload byte meaning "true" in boolean replies.
pub const RESPONSE_TRUE: u8 = 0x01;

/// An outbound command: opcode followed by its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    bytes: Vec<u8>,
}

impl Command {
    pub fn new(opcode: u8) -> Self {
        Self { bytes: vec![opcode] }
    }

    pub fn with_params(opcode: u8, params: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(params.len() + 1);
        bytes.push(opcode);
        bytes.extend_from_slice(params);
        Self { bytes }
    }

    pub fn param(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    /// Booleans travel as `0`/`1`.
    pub fn flag(self, value: bool) -> Self {
        self.param(u8::from(value))
    }

    pub fn params(mut self, values: &[u8]) -> Self {
        self.bytes.extend_from_slice(values);
        self
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.bytes)
    }
}

impl From<u8> for Command {
    fn from(opcode: u8) -> Self {
        Command::new(opcode)
    }
}

/// Classification of the first byte of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Response,
    Alert,
    Unknown,
}

pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(command: &Command) -> Vec<u8> {
        command.as_bytes().to_vec()
    }

    pub fn classify_header(byte: u8) -> HeaderKind {
        match byte {
            RESPONSE_MARKER => HeaderKind::Response,
            ALERT_MARKER => HeaderKind::Alert,
            _ => HeaderKind::Unknown,
        }
    }

    /// Sum of all payload bytes, truncated to 8 bits.
    pub fn checksum(payload: &[u8]) -> u8 {
        payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }

    pub fn validate(frame: &ResponseFrame) -> bool {
        frame.checksum == Self::checksum(&frame.payload)
    }

    /// Like [`FrameCodec::validate`] but reports both sums on mismatch.
    pub fn verify(frame: &ResponseFrame) -> Result<()> {
        let expected = Self::checksum(&frame.payload);
        if expected == frame.checksum {
            Ok(())
        } else {
            Err(SerialError::Integrity { expected, actual: frame.checksum })
        }
    }

    pub fn decode<T: FromPayload>(payload: &[u8]) -> Result<T> {
        T::from_payload(payload)
    }
}

/// Conversion from a response payload into a caller-requested type.
pub trait FromPayload: Sized {
    fn from_payload(payload: &[u8]) -> Result<Self>;
}

fn first_byte(payload: &[u8], type_name: &str) -> Result<u8> {
    payload
        .first()
        .copied()
        .ok_or_else(|| SerialError::Decode(format!("empty payload for {}", type_name)))
}

impl FromPayload for bool {
    fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(first_byte(payload, "bool")? == RESPONSE_TRUE)
    }
}

impl FromPayload for u8 {
    fn from_payload(payload: &[u8]) -> Result<Self> {
        first_byte(payload, "u8")
    }
}

impl FromPayload for i8 {
    fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(first_byte(payload, "i8")? as i8)
    }
}

macro_rules! impl_from_payload_le {
    ($($ty:ty),*) => {
        $(
            impl FromPayload for $ty {
                fn from_payload(payload: &[u8]) -> Result<Self> {
                    const SIZE: usize = std::mem::size_of::<$ty>();
                    let bytes: [u8; SIZE] = payload
                        .get(..SIZE)
                        .and_then(|b| b.try_into().ok())
                        .ok_or_else(|| SerialError::Decode(format!(
                            "{} needs {} bytes, payload has {}",
                            stringify!($ty),
                            SIZE,
                            payload.len()
                        )))?;
                    Ok(<$ty>::from_le_bytes(bytes))
                }
            }
        )*
    };
}

impl_from_payload_le!(u16, i16, u32, i32, u64, i64);

/// Each byte maps to one character; NULs are kept, callers trim.
impl FromPayload for String {
    fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(payload.iter().map(|&b| char::from(b)).collect())
    }
}

impl FromPayload for Vec<u8> {
    fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(payload.to_vec())
    }
}

/// For commands whose reply only acknowledges receipt.
impl FromPayload for () {
    fn from_payload(_payload: &[u8]) -> Result<Self> {
        Ok(())
    }
}
