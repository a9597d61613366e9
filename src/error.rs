//! Crate-wide error type.
//!
//! Mirrors the `ChannelError` pattern used elsewhere in this codebase for
//! fallible public surfaces: a plain enum with a hand-written `Display` and
//! `std::error::Error` impl rather than a derive macro.

use std::fmt;
use std::io;

/// Everything that can go wrong opening, reading from, writing to, or
/// running a qmux session.
///
/// The `Io`, `UnknownMessageType`, `UnknownChannel`, `WindowViolation`,
/// `OversizedPayload`, and `WindowOverflow` variants are all terminal:
/// observing one of them tears down the whole session (see the crate's
/// module docs for why). `OpenRefused`, `SessionClosed`, and `ChannelClosed`
/// are per-operation errors that leave the rest of the session unaffected.
/// An invalid OPEN (e.g. an out-of-range `maxPacketSize`) is not represented
/// here at all — it's rejected with an OPEN_FAILURE reply on the wire, not a
/// local error, since the session that received it stays healthy.
#[derive(Debug)]
pub enum Error {
    /// The underlying transport returned an I/O error.
    Io(io::Error),
    /// The peer sent a frame whose type byte this implementation doesn't
    /// recognize.
    UnknownMessageType(u8),
    /// A channel-addressed frame named a `recipientId` with no matching
    /// local channel.
    UnknownChannel(u32),
    /// A DATA frame's length exceeded a codec-level sanity bound before any
    /// per-channel window could be consulted.
    OversizedPayload(u32),
    /// A DATA frame exceeded the receiving channel's window or advertised
    /// max payload.
    WindowViolation {
        /// The local channel ID the frame was addressed to.
        channel: u32,
        /// The payload length that violated the window or payload cap.
        length: u32,
    },
    /// A window's credit counter would have overflowed `u32`.
    WindowOverflow,
    /// The peer replied OPEN_FAILURE to an `open()` call.
    OpenRefused,
    /// The session has terminated; no further operations are possible.
    SessionClosed,
    /// The channel has already been locally closed.
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport error: {e}"),
            Self::UnknownMessageType(b) => write!(f, "unknown message type: 0x{b:02x}"),
            Self::UnknownChannel(id) => write!(f, "unknown channel id: {id}"),
            Self::OversizedPayload(len) => {
                write!(f, "data payload too large: {len} bytes")
            }
            Self::WindowViolation { channel, length } => write!(
                f,
                "channel {channel} received {length} bytes exceeding its window or max payload"
            ),
            Self::WindowOverflow => write!(f, "window credit overflowed u32"),
            Self::OpenRefused => write!(f, "peer refused channel open"),
            Self::SessionClosed => write!(f, "session is closed"),
            Self::ChannelClosed => write!(f, "channel is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
