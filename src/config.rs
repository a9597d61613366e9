//! Protocol constants.
//!
//! These are fixed parameters of the wire protocol, not runtime tunables —
//! see DESIGN.md for why the reference deployment hard-codes them rather
//! than exposing a builder.

/// Bytes of receive credit a freshly opened or accepted channel advertises.
pub const INITIAL_WINDOW: u32 = 64 * 32 * 1024; // 64 * 32 KiB = 2 MiB

/// Largest DATA payload this side will ever put in one frame, and the value
/// advertised as `maxPacketSize`/`maxIncomingPayload` on OPEN/OPEN_CONFIRM.
pub const MAX_PACKET_PAYLOAD: u32 = 32 * 1024; // 32 KiB

/// Smallest `maxPacketSize` this side will accept from a peer's OPEN.
pub const MIN_OPEN_PACKET_SIZE: u32 = 9;

/// Largest `maxPacketSize` this side will accept from a peer's OPEN.
pub const MAX_OPEN_PACKET_SIZE: u32 = 1 << 31;

/// Codec-level sanity cap on a single DATA frame's payload length, applied
/// before any per-channel window can be consulted. Generous relative to
/// [`MAX_PACKET_PAYLOAD`] so it never fires against a conformant peer; it
/// exists only to stop a malformed length field from driving an
/// unbounded allocation.
pub const MAX_DATA_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024; // 16 MiB

/// Depth of the per-channel control inbox (OPEN_CONFIRM / OPEN_FAILURE).
pub const CHANNEL_INBOX_CAPACITY: usize = 16;
