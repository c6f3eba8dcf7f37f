//! Binary framing for audio on the streaming variant.
//!
//! | version | layout (big endian) |
//! |---|---|
//! | 1 | raw payload |
//! | 2 | `version u16, type u16, reserved u32, timestamp u32, payload_size u32`, payload |
//! | 3 | `type u8, reserved u8, payload_size u16`, payload |
//!
//! Type 0 is audio and type 1 is JSON.

use crate::error::ProtocolError;

pub const TYPE_AUDIO: u8 = 0;
pub const TYPE_JSON: u8 = 1;

const V2_HEADER: usize = 16;
const V3_HEADER: usize = 4;

/// Binary protocol version negotiated in the hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryVersion {
    V1,
    V2,
    V3,
}

impl TryFrom<u8> for BinaryVersion {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            other => Err(ProtocolError::InvalidFrame(format!(
                "unsupported binary protocol version {other}"
            ))),
        }
    }
}

impl BinaryVersion {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }
}

/// One decoded binary unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub kind: u8,
    /// Zero for versions without a timestamp.
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

/// Frame an audio payload.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidFrame`] if the payload does not fit the
/// version's size field.
pub fn encode_audio(
    version: BinaryVersion,
    timestamp: u32,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    match version {
        BinaryVersion::V1 => Ok(payload.to_vec()),
        BinaryVersion::V2 => {
            let size = u32::try_from(payload.len())
                .map_err(|_| ProtocolError::InvalidFrame("payload too large".into()))?;
            let mut out = Vec::with_capacity(V2_HEADER + payload.len());
            out.extend_from_slice(&2u16.to_be_bytes());
            out.extend_from_slice(&u16::from(TYPE_AUDIO).to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&timestamp.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(payload);
            Ok(out)
        }
        BinaryVersion::V3 => {
            let size = u16::try_from(payload.len()).map_err(|_| {
                ProtocolError::InvalidFrame(format!(
                    "payload of {} bytes exceeds v3 limit",
                    payload.len()
                ))
            })?;
            let mut out = Vec::with_capacity(V3_HEADER + payload.len());
            out.push(TYPE_AUDIO);
            out.push(0);
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(payload);
            Ok(out)
        }
    }
}

/// Parse one binary unit.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidFrame`] for short buffers, size fields
/// that overrun the buffer, or a v2 header with the wrong version.
pub fn decode(version: BinaryVersion, data: &[u8]) -> Result<BinaryFrame, ProtocolError> {
    match version {
        BinaryVersion::V1 => Ok(BinaryFrame {
            kind: TYPE_AUDIO,
            timestamp: 0,
            payload: data.to_vec(),
        }),
        BinaryVersion::V2 => {
            if data.len() < V2_HEADER {
                return Err(short(data.len(), V2_HEADER));
            }
            let header_version = u16::from_be_bytes([data[0], data[1]]);
            if header_version != 2 {
                return Err(ProtocolError::InvalidFrame(format!(
                    "v2 header carries version {header_version}"
                )));
            }
            let kind = u16::from_be_bytes([data[2], data[3]]);
            let timestamp = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
            let size = u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize;
            let payload = take_payload(data, V2_HEADER, size)?;
            Ok(BinaryFrame {
                kind: u8::try_from(kind).unwrap_or(u8::MAX),
                timestamp,
                payload,
            })
        }
        BinaryVersion::V3 => {
            if data.len() < V3_HEADER {
                return Err(short(data.len(), V3_HEADER));
            }
            let size = usize::from(u16::from_be_bytes([data[2], data[3]]));
            let payload = take_payload(data, V3_HEADER, size)?;
            Ok(BinaryFrame {
                kind: data[0],
                timestamp: 0,
                payload,
            })
        }
    }
}

fn take_payload(data: &[u8], header: usize, size: usize) -> Result<Vec<u8>, ProtocolError> {
    let end = header
        .checked_add(size)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            ProtocolError::InvalidFrame(format!(
                "payload size {size} exceeds {} available bytes",
                data.len() - header
            ))
        })?;
    Ok(data[header..end].to_vec())
}

fn short(got: usize, need: usize) -> ProtocolError {
    ProtocolError::InvalidFrame(format!("frame of {got} bytes shorter than {need}-byte header"))
}
