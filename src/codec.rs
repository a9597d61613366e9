//! Wire protocol codec.
//!
//! Frames are big-endian. Every message begins with a 1-byte type; the rest
//! is fixed-size except DATA, which carries a length-prefixed payload.
//!
//! ```text
//! OPEN           [100][senderId:u32][windowSize:u32][maxPacketSize:u32]
//! OPEN_CONFIRM   [101][recipientId:u32][senderId:u32][windowSize:u32][maxPacketSize:u32]
//! OPEN_FAILURE   [102][recipientId:u32]
//! WINDOW_ADJUST  [103][recipientId:u32][additionalBytes:u32]
//! DATA           [104][recipientId:u32][length:u32][data: length bytes]
//! EOF            [105][recipientId:u32]
//! CLOSE          [106][recipientId:u32]
//! ```
//!
//! Encoding is serialized by the caller (see [`crate::session::SessionShared`])
//! so concurrent senders never interleave frames. Decoding is driven
//! exclusively by the session's single reader task.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_DATA_FRAME_PAYLOAD;
use crate::error::{Error, Result};

/// Wire message type bytes.
pub mod msg_type {
    pub const OPEN: u8 = 100;
    pub const OPEN_CONFIRM: u8 = 101;
    pub const OPEN_FAILURE: u8 = 102;
    pub const WINDOW_ADJUST: u8 = 103;
    pub const DATA: u8 = 104;
    pub const EOF: u8 = 105;
    pub const CLOSE: u8 = 106;
}

/// A decoded (or to-be-encoded) wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Message {
    Open {
        sender_id: u32,
        window_size: u32,
        max_packet_size: u32,
    },
    OpenConfirm {
        recipient_id: u32,
        sender_id: u32,
        window_size: u32,
        max_packet_size: u32,
    },
    OpenFailure {
        recipient_id: u32,
    },
    WindowAdjust {
        recipient_id: u32,
        additional_bytes: u32,
    },
    Data {
        recipient_id: u32,
        payload: Bytes,
    },
    Eof {
        recipient_id: u32,
    },
    Close {
        recipient_id: u32,
    },
}

impl Message {
    /// The `recipientId` field, for every message type that carries one.
    /// OPEN has none (it hasn't been assigned a recipient yet).
    pub(crate) fn channel_id(&self) -> Option<u32> {
        match self {
            Message::Open { .. } => None,
            Message::OpenConfirm { recipient_id, .. }
            | Message::OpenFailure { recipient_id }
            | Message::WindowAdjust { recipient_id, .. }
            | Message::Data { recipient_id, .. }
            | Message::Eof { recipient_id }
            | Message::Close { recipient_id } => Some(*recipient_id),
        }
    }
}

/// Encode `msg` and write it to `writer` as one atomic frame.
///
/// Callers are responsible for serializing concurrent calls (see
/// [`crate::session::SessionShared::send`]) so frames from different
/// channels interleave only at frame boundaries.
pub(crate) async fn encode<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let mut buf = BytesMut::with_capacity(13);
    match msg {
        Message::Open {
            sender_id,
            window_size,
            max_packet_size,
        } => {
            buf.extend_from_slice(&[msg_type::OPEN]);
            put_u32(&mut buf, *sender_id);
            put_u32(&mut buf, *window_size);
            put_u32(&mut buf, *max_packet_size);
        }
        Message::OpenConfirm {
            recipient_id,
            sender_id,
            window_size,
            max_packet_size,
        } => {
            buf.extend_from_slice(&[msg_type::OPEN_CONFIRM]);
            put_u32(&mut buf, *recipient_id);
            put_u32(&mut buf, *sender_id);
            put_u32(&mut buf, *window_size);
            put_u32(&mut buf, *max_packet_size);
        }
        Message::OpenFailure { recipient_id } => {
            buf.extend_from_slice(&[msg_type::OPEN_FAILURE]);
            put_u32(&mut buf, *recipient_id);
        }
        Message::WindowAdjust {
            recipient_id,
            additional_bytes,
        } => {
            buf.extend_from_slice(&[msg_type::WINDOW_ADJUST]);
            put_u32(&mut buf, *recipient_id);
            put_u32(&mut buf, *additional_bytes);
        }
        Message::Data {
            recipient_id,
            payload,
        } => {
            buf.extend_from_slice(&[msg_type::DATA]);
            put_u32(&mut buf, *recipient_id);
            put_u32(&mut buf, payload.len() as u32);
            buf.extend_from_slice(payload);
        }
        Message::Eof { recipient_id } => {
            buf.extend_from_slice(&[msg_type::EOF]);
            put_u32(&mut buf, *recipient_id);
        }
        Message::Close { recipient_id } => {
            buf.extend_from_slice(&[msg_type::CLOSE]);
            put_u32(&mut buf, *recipient_id);
        }
    }
    writer.write_all(&buf).await?;
    Ok(())
}

fn put_u32(buf: &mut BytesMut, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Decode one message from `reader`, or detect a clean transport close.
///
/// Reads the 1-byte type, then the fixed-size body, then — for DATA only —
/// the variable-length payload whose size the fixed body just gave up.
/// Short reads are handled transparently by `AsyncReadExt::read_exact`
/// looping until the expected byte count is obtained or the transport
/// errors.
///
/// Returns `Ok(None)` only when the transport hits EOF exactly at a frame
/// boundary (zero bytes read for the type byte) — a graceful close, not a
/// protocol error. An EOF encountered mid-frame surfaces as `Error::Io`,
/// same as any other short read.
pub(crate) async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut type_buf = [0u8; 1];
    if reader.read(&mut type_buf).await? == 0 {
        return Ok(None);
    }
    let type_byte = type_buf[0];
    let msg = match type_byte {
        msg_type::OPEN => {
            let sender_id = reader.read_u32().await?;
            let window_size = reader.read_u32().await?;
            let max_packet_size = reader.read_u32().await?;
            Ok(Message::Open {
                sender_id,
                window_size,
                max_packet_size,
            })
        }
        msg_type::OPEN_CONFIRM => {
            let recipient_id = reader.read_u32().await?;
            let sender_id = reader.read_u32().await?;
            let window_size = reader.read_u32().await?;
            let max_packet_size = reader.read_u32().await?;
            Ok(Message::OpenConfirm {
                recipient_id,
                sender_id,
                window_size,
                max_packet_size,
            })
        }
        msg_type::OPEN_FAILURE => {
            let recipient_id = reader.read_u32().await?;
            Ok(Message::OpenFailure { recipient_id })
        }
        msg_type::WINDOW_ADJUST => {
            let recipient_id = reader.read_u32().await?;
            let additional_bytes = reader.read_u32().await?;
            Ok(Message::WindowAdjust {
                recipient_id,
                additional_bytes,
            })
        }
        msg_type::DATA => {
            let recipient_id = reader.read_u32().await?;
            let length = reader.read_u32().await?;
            if length > MAX_DATA_FRAME_PAYLOAD {
                return Err(Error::OversizedPayload(length));
            }
            let mut payload = vec![0u8; length as usize];
            reader.read_exact(&mut payload).await?;
            Ok(Message::Data {
                recipient_id,
                payload: Bytes::from(payload),
            })
        }
        msg_type::EOF => {
            let recipient_id = reader.read_u32().await?;
            Ok(Message::Eof { recipient_id })
        }
        msg_type::CLOSE => {
            let recipient_id = reader.read_u32().await?;
            Ok(Message::Close { recipient_id })
        }
        other => Err(Error::UnknownMessageType(other)),
    };
    Ok(Some(msg?))
}
