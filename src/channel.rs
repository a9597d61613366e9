//! Per-stream channel state and its public byte-stream surface.
//!
//! A channel is identified by a pair of IDs: `local_id` (chosen by this side)
//! and `remote_id` (learned from the peer). [`ChannelInner`] holds the shared
//! state that both the session's demux loop and the public [`Channel`]
//! handle touch; [`Channel`] additionally carries the poll-bridge scratch
//! state needed to implement [`AsyncRead`]/[`AsyncWrite`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::buffer::Buffer;
use crate::codec::Message;
use crate::config::{CHANNEL_INBOX_CAPACITY, MAX_PACKET_PAYLOAD};
use crate::error::{Error, Result};
use crate::session::SessionShared;
use crate::window::Window;

/// Which side initiated the open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This side called `open()`.
    Outbound,
    /// This side accepted a peer-initiated OPEN.
    Inbound,
}

/// A reply to a previously sent OPEN.
pub(crate) enum OpenReply {
    Confirm {
        remote_id: u32,
        window_size: u32,
        max_packet_size: u32,
    },
    Failure,
}

#[derive(Debug)]
struct CloseState {
    sent_close: bool,
    remote_sent_close: bool,
    /// Set once this channel has been handed to `finish_close`, so a local
    /// `close()` racing an inbound CLOSE can never both try to remove it
    /// (see the simultaneous-close tie-break in `on_close`/`Channel::close`).
    removed: bool,
}

/// Shared state for one channel, reachable from both the demux loop and the
/// public [`Channel`] handle. Never holds an owning reference back to the
/// session — only a [`Weak`] one — so Session → ChannelTable → ChannelInner
/// → Session never forms a reference cycle.
pub(crate) struct ChannelInner {
    local_id: u32,
    direction: Direction,
    remote_id: Mutex<Option<u32>>,
    max_remote_payload: Mutex<u32>,
    remote_window: Window,
    my_window: Window,
    max_incoming_payload: u32,
    pending: Buffer,
    inbox_tx: mpsc::Sender<OpenReply>,
    inbox_rx: AsyncMutex<mpsc::Receiver<OpenReply>>,
    sent_eof: AtomicBool,
    remote_sent_eof: AtomicBool,
    close: Mutex<CloseState>,
    session: Weak<SessionShared>,
}

impl fmt::Debug for ChannelInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelInner")
            .field("local_id", &self.local_id)
            .field("remote_id", &*self.remote_id.lock().expect("poisoned"))
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    pub(crate) fn new(
        local_id: u32,
        direction: Direction,
        session: Weak<SessionShared>,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_INBOX_CAPACITY);
        Arc::new(ChannelInner {
            local_id,
            direction,
            remote_id: Mutex::new(None),
            max_remote_payload: Mutex::new(MAX_PACKET_PAYLOAD),
            remote_window: Window::new(0),
            my_window: Window::new(crate::config::INITIAL_WINDOW),
            max_incoming_payload: MAX_PACKET_PAYLOAD,
            pending: Buffer::new(),
            inbox_tx,
            inbox_rx: AsyncMutex::new(inbox_rx),
            sent_eof: AtomicBool::new(false),
            remote_sent_eof: AtomicBool::new(false),
            close: Mutex::new(CloseState {
                sent_close: false,
                remote_sent_close: false,
                removed: false,
            }),
            session,
        })
    }

    pub(crate) fn local_id(&self) -> u32 {
        self.local_id
    }

    fn remote_id(&self) -> Option<u32> {
        *self.remote_id.lock().expect("poisoned")
    }

    /// Record the peer side of this channel, learned either from an
    /// OPEN_CONFIRM (we sent OPEN) or from the OPEN itself (we're
    /// accepting): the peer's ID, its advertised max payload, and the send
    /// credit it granted us.
    pub(crate) fn establish_remote(
        &self,
        remote_id: u32,
        window_size: u32,
        max_packet_size: u32,
    ) -> Result<()> {
        *self.remote_id.lock().expect("poisoned") = Some(remote_id);
        *self.max_remote_payload.lock().expect("poisoned") = max_packet_size;
        self.remote_window.add(window_size)
    }

    /// Deliver an OPEN_CONFIRM/OPEN_FAILURE to the waiting `open()` call.
    pub(crate) async fn deliver_open_reply(&self, reply: OpenReply) {
        let _ = self.inbox_tx.send(reply).await;
    }

    pub(crate) async fn wait_open_reply(&self) -> Option<OpenReply> {
        self.inbox_rx.lock().await.recv().await
    }

    /// Unblock every caller suspended on this channel (reader, writer,
    /// pending `open()`) with a terminal indication, without sending any
    /// more frames — called when the owning session tears down.
    pub(crate) async fn shutdown_for_session_close(&self) {
        self.my_window.close();
        self.remote_window.close();
        self.pending.eof();
        self.inbox_rx.lock().await.close();
    }

    /// Handle an inbound DATA frame: validate against the receive window and
    /// advertised max payload, debit the window, and deliver bytes.
    pub(crate) fn on_data(&self, payload: Bytes) -> Result<()> {
        let length = payload.len() as u32;
        if length > self.max_incoming_payload {
            return Err(Error::WindowViolation {
                channel: self.local_id,
                length,
            });
        }
        if !self.my_window.debit_checked(length) {
            return Err(Error::WindowViolation {
                channel: self.local_id,
                length,
            });
        }
        self.pending.write(payload);
        Ok(())
    }

    pub(crate) fn on_window_adjust(&self, additional: u32) -> Result<()> {
        self.remote_window.add(additional)
    }

    pub(crate) fn on_eof(&self) {
        self.remote_sent_eof.store(true, Ordering::SeqCst);
        self.pending.eof();
    }

    /// Whether the peer has sent EOF (half-closed its write direction).
    fn remote_eof(&self) -> bool {
        self.remote_sent_eof.load(Ordering::SeqCst)
    }

    /// Handle an inbound CLOSE: mark it, mirror our own CLOSE if we haven't
    /// sent one yet, and report whether the caller is the one that should
    /// remove this channel from the table (see `mark_removed_if_both_closed`
    /// for the simultaneous-close tie-break).
    pub(crate) async fn on_close(&self) -> bool {
        let should_send_close = {
            let mut state = self.close.lock().expect("poisoned");
            state.remote_sent_close = true;
            !state.sent_close
        };
        if should_send_close {
            let _ = self.send_close_frame().await;
            self.close.lock().expect("poisoned").sent_close = true;
        }
        self.pending.eof();
        self.remote_window.close();
        self.mark_removed_if_both_closed()
    }

    /// Atomically check whether both sides have now sent CLOSE and this
    /// channel hasn't already been handed off for removal; if so, claim
    /// removal (sets `removed`) and return `true`. A concurrent local
    /// `close()` and inbound CLOSE can both reach this point for the same
    /// channel — only one of them gets `true` back, so the channel is
    /// removed from the table exactly once.
    fn mark_removed_if_both_closed(&self) -> bool {
        let mut state = self.close.lock().expect("poisoned");
        if state.sent_close && state.remote_sent_close && !state.removed {
            state.removed = true;
            true
        } else {
            false
        }
    }

    async fn send_close_frame(&self) -> Result<()> {
        let session = self.session.upgrade().ok_or(Error::SessionClosed)?;
        let recipient_id = self.remote_id().ok_or(Error::SessionClosed)?;
        session.send(Message::Close { recipient_id }).await
    }

    fn max_remote_payload(&self) -> u32 {
        *self.max_remote_payload.lock().expect("poisoned")
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }
}

/// Read `src` fully, fragmenting into frames no larger than the peer's
/// advertised max payload and blocking on flow-control credit as needed.
async fn write_all(inner: &Arc<ChannelInner>, src: &[u8]) -> Result<usize> {
    if inner.close.lock().expect("poisoned").sent_close {
        return Err(Error::ChannelClosed);
    }
    let max_fragment = inner.max_remote_payload().max(1);
    let mut sent = 0;
    while sent < src.len() {
        let remaining = (src.len() - sent) as u32;
        let want = remaining.min(max_fragment);
        let granted = inner
            .remote_window
            .reserve(want)
            .await
            .ok_or(Error::SessionClosed)?;
        if granted == 0 {
            continue;
        }
        let session = inner.session.upgrade().ok_or(Error::SessionClosed)?;
        let recipient_id = inner.remote_id().ok_or(Error::SessionClosed)?;
        let chunk = Bytes::copy_from_slice(&src[sent..sent + granted as usize]);
        session
            .send(Message::Data {
                recipient_id,
                payload: chunk,
            })
            .await?;
        sent += granted as usize;
    }
    Ok(sent)
}

/// Read up to `want` bytes, blocking until at least one is available, then
/// emit the matching WINDOW_ADJUST.
async fn read_and_adjust(inner: &Arc<ChannelInner>, want: usize) -> Vec<u8> {
    let mut scratch = vec![0u8; want.max(1)];
    let n = inner.pending.read(&mut scratch).await;
    scratch.truncate(n);
    if n > 0 {
        let _ = inner.my_window.add(n as u32);
        if let (Some(session), Some(recipient_id)) = (inner.session.upgrade(), inner.remote_id()) {
            let _ = session
                .send(Message::WindowAdjust {
                    recipient_id,
                    additional_bytes: n as u32,
                })
                .await;
        }
    }
    scratch
}

type ReadFut = Pin<Box<dyn Future<Output = Vec<u8>> + Send>>;
type WriteFut = Pin<Box<dyn Future<Output = Result<usize>> + Send>>;

/// A single bidirectional byte stream multiplexed over a [`crate::Session`].
///
/// Implements both a plain `read`/`write`/`close_write`/`close` surface and
/// [`AsyncRead`]/[`AsyncWrite`] so a `Channel` can be handed to anything
/// generic over tokio's I/O traits.
pub struct Channel {
    inner: Arc<ChannelInner>,
    read_fut: Mutex<Option<ReadFut>>,
    write_fut: Mutex<Option<WriteFut>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(inner: Arc<ChannelInner>) -> Self {
        Channel {
            inner,
            read_fut: Mutex::new(None),
            write_fut: Mutex::new(None),
        }
    }

    /// This channel's local ID, stable for its lifetime.
    pub fn id(&self) -> u32 {
        self.inner.local_id()
    }

    /// Read up to `dst.len()` bytes, blocking until at least one byte is
    /// available. Returns `0` once the peer's data stream has hit EOF and
    /// every buffered byte has been drained.
    ///
    /// On a non-empty read, emits a WINDOW_ADJUST replenishing `my_window`
    /// by exactly the number of bytes just consumed.
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let bytes = read_and_adjust(&self.inner, dst.len()).await;
        dst[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Write all of `src`, fragmenting into frames no larger than the
    /// peer's advertised max payload and blocking on flow-control credit as
    /// needed. Returns once every byte has been sent.
    pub async fn write(&self, src: &[u8]) -> Result<usize> {
        write_all(&self.inner, src).await
    }

    /// Send EOF (half-close the write direction). Idempotent.
    pub async fn close_write(&self) -> Result<()> {
        if self.inner.sent_eof.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = self.inner.session.upgrade().ok_or(Error::SessionClosed)?;
        let recipient_id = self.inner.remote_id().ok_or(Error::SessionClosed)?;
        session.send(Message::Eof { recipient_id }).await
    }

    /// Send CLOSE and mark this side locally closed. Idempotent. The
    /// channel is only removed from the session's table once the peer's
    /// CLOSE has also been observed (see `ChannelInner::on_close` for the
    /// simultaneous-close tie-break).
    pub async fn close(&self) -> Result<()> {
        let already_sent = {
            let mut state = self.inner.close.lock().expect("poisoned");
            let was_sent = state.sent_close;
            state.sent_close = true;
            was_sent
        };
        if already_sent {
            return Ok(());
        }
        self.inner.remote_window.close();
        let Some(session) = self.inner.session.upgrade() else {
            return Ok(());
        };
        let Some(recipient_id) = self.inner.remote_id() else {
            return Ok(());
        };
        session.send(Message::Close { recipient_id }).await?;
        if self.inner.mark_removed_if_both_closed() {
            session.finish_close(self.inner.local_id()).await;
        }
        Ok(())
    }

    /// Which side initiated this channel's open.
    pub fn direction(&self) -> Direction {
        self.inner.direction()
    }

    /// Whether the peer has sent EOF on this channel. A subsequent `read`
    /// can still return buffered bytes before finally yielding `0`.
    pub fn is_remote_eof(&self) -> bool {
        self.inner.remote_eof()
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let mut slot = this.read_fut.lock().expect("poisoned");
        if slot.is_none() {
            let inner = this.inner.clone();
            let want = buf.remaining();
            *slot = Some(Box::pin(async move { read_and_adjust(&inner, want).await }));
        }
        let fut = slot.as_mut().expect("just inserted");
        match fut.as_mut().poll(cx) {
            Poll::Ready(bytes) => {
                *slot = None;
                buf.put_slice(&bytes);
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let mut slot = this.write_fut.lock().expect("poisoned");
        if slot.is_none() {
            let inner = this.inner.clone();
            let owned = buf.to_vec();
            *slot = Some(Box::pin(async move { write_all(&inner, &owned).await }));
        }
        let fut = slot.as_mut().expect("just inserted");
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                *slot = None;
                Poll::Ready(result.map_err(std::io::Error::other))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.inner.sent_eof.swap(true, Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let (Some(session), Some(recipient_id)) = (inner.session.upgrade(), inner.remote_id())
            {
                let _ = session.send(Message::Eof { recipient_id }).await;
            }
        });
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_inner(local_id: u32, direction: Direction) -> Arc<ChannelInner> {
        ChannelInner::new(local_id, direction, Weak::<SessionShared>::new())
    }

    #[test]
    fn on_data_rejects_payload_over_max_incoming() {
        let inner = detached_inner(0, Direction::Inbound);
        let huge = Bytes::from(vec![0u8; MAX_PACKET_PAYLOAD as usize + 1]);
        let err = inner.on_data(huge).unwrap_err();
        assert!(matches!(err, Error::WindowViolation { .. }));
    }

    #[test]
    fn on_data_rejects_payload_over_remaining_window() {
        let inner = ChannelInner::new(0, Direction::Inbound, Weak::<SessionShared>::new());
        // Drain the window down to a small remainder first.
        let big = crate::config::INITIAL_WINDOW - 10;
        assert!(inner.my_window.debit_checked(big));
        let err = inner.on_data(Bytes::from(vec![0u8; 20])).unwrap_err();
        assert!(matches!(err, Error::WindowViolation { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent_when_peer_never_responds() {
        let inner = detached_inner(0, Direction::Outbound);
        let channel = Channel::new(inner);
        // No session attached (Weak::new() never upgrades), so `close`
        // returns Ok without sending anything — still must not panic or
        // double-send on a second call.
        assert!(channel.close().await.is_ok());
        assert!(channel.close().await.is_ok());
    }
}
