// ABOUTME: Length-prefixed binary framing for portal RPC messages.
// ABOUTME: Encodes call/reply/exception frames and the service-name multiplexing prefix.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::endpoint::{ServiceName, MULTIPLEX_SEPARATOR};
use crate::error::TransportError;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload accepted in either direction (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Fixed header: version, kind, seq, name length.
const HEADER_LEN: usize = 1 + 1 + 4 + 2;

/// Message type carried in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl TryFrom<u8> for MessageKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Call),
            2 => Ok(MessageKind::Reply),
            3 => Ok(MessageKind::Exception),
            4 => Ok(MessageKind::Oneway),
            other => Err(TransportError::Protocol(format!(
                "unknown message kind {}",
                other
            ))),
        }
    }
}

/// One framed message.
///
/// Payload layout (big-endian):
///
/// ```text
/// u8 version | u8 kind | u32 seq | u16 name_len | name (utf-8) | body
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub seq: u32,
    pub name: String,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, seq: u32, name: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            kind,
            seq,
            name: name.into(),
            body,
        }
    }

    /// Serialise the payload (without the length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let name = self.name.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| {
            TransportError::Protocol(format!("method name too long ({} bytes)", name.len()))
        })?;

        let total = HEADER_LEN + name.len() + self.body.len();
        if total > MAX_FRAME_LEN {
            return Err(TransportError::Protocol(format!(
                "frame too large: {} bytes (max {})",
                total, MAX_FRAME_LEN
            )));
        }

        let mut buf = Vec::with_capacity(total);
        buf.push(PROTOCOL_VERSION);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&name_len.to_be_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Parse a payload produced by [`Message::encode`].
    pub fn decode(payload: &[u8]) -> Result<Self, TransportError> {
        if payload.len() < HEADER_LEN {
            return Err(TransportError::Protocol(format!(
                "frame too short: {} bytes",
                payload.len()
            )));
        }
        if payload[0] != PROTOCOL_VERSION {
            return Err(TransportError::Protocol(format!(
                "unsupported protocol version {}",
                payload[0]
            )));
        }

        let kind = MessageKind::try_from(payload[1])?;
        let seq = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]);
        let name_len = u16::from_be_bytes([payload[6], payload[7]]) as usize;

        let rest = &payload[HEADER_LEN..];
        if rest.len() < name_len {
            return Err(TransportError::Protocol(
                "method name exceeds frame length".into(),
            ));
        }
        let name = std::str::from_utf8(&rest[..name_len])
            .map_err(|_| TransportError::Protocol("method name is not valid UTF-8".into()))?
            .to_string();

        Ok(Self {
            kind,
            seq,
            name,
            body: rest[name_len..].to_vec(),
        })
    }
}

/// Write one length-prefixed frame and flush it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let payload = message.encode()?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[first..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Message::decode(&payload).map(Some)
}

/// Method name as sent on the wire, prefixed with the service when present.
pub fn qualify(service: Option<&ServiceName>, method: &str) -> String {
    match service {
        Some(service) => format!("{}{}{}", service, MULTIPLEX_SEPARATOR, method),
        None => method.to_string(),
    }
}
