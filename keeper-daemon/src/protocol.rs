//! Wire protocol: length-prefixed frames, the key handshake and the small
//! control vocabulary spoken before a connection is bound to a service.
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! A connection goes through:
//!
//! 1. `Hello { protocol_version, key, client_info }` → `HelloAck` or
//!    `HelloNack` (then close). Nothing else is accepted before the key
//!    matches.
//! 2. JSON [`DaemonRequest`] frames answered by [`DaemonResponse`] frames:
//!    `ping`, `status`, `shutdown`, `open`.
//! 3. After a successful `open`, every frame is an opaque payload for the
//!    bound service. The daemon never looks inside.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::ProtocolError;

/// Maximum frame size once authenticated (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum frame size while unauthenticated (64 KiB).
pub const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 * 1024;

pub const PROTOCOL_VERSION: u32 = 1;

const LENGTH_PREFIX: usize = 4;

/// Codec for a fresh, unauthenticated connection.
pub fn handshake_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_PREFIX)
        .big_endian()
        .max_frame_length(MAX_HANDSHAKE_FRAME_SIZE)
        .new_codec()
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    Hello(Hello),
    HelloAck(HelloAck),
    HelloNack(HelloNack),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub key: String,
    #[serde(default)]
    pub client_info: String,
}

impl Hello {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            key: key.into(),
            client_info: format!("keeper/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub server_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloNack {
    pub reason: String,
}

pub fn server_info() -> String {
    format!("keeper-daemon/{}", env!("CARGO_PKG_VERSION"))
}

// ---------------------------------------------------------------------------
// Control requests
// ---------------------------------------------------------------------------

/// JSON control request sent after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    Ping,
    Status,
    Shutdown,
    /// Bind this connection to a service. The name is checked against the
    /// service table; unknown names close the connection.
    Open { service: String },
}

/// JSON control response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn into_data(self) -> Result<Value, ProtocolError> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(ProtocolError::Rejected(
                self.error
                    .unwrap_or_else(|| "unknown daemon error".to_string()),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking frame I/O (clients, probes)
// ---------------------------------------------------------------------------

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: payload.len(),
        max: MAX_FRAME_SIZE,
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame, rejecting length prefixes above `max` before allocating.
pub fn read_frame<R: Read>(reader: &mut R, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(err) => return Err(err.into()),
    }
    let size = u32::from_be_bytes(prefix) as usize;
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    let mut payload = vec![0u8; size];
    match reader.read_exact(&mut payload) {
        Ok(()) => Ok(payload),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::ConnectionClosed)
        }
        Err(err) => Err(err.into()),
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(message).map_err(ProtocolError::from)
}

pub fn decode<'a, T: Deserialize<'a>>(frame: &'a [u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(frame).map_err(ProtocolError::from)
}
