//! Session: owns the transport, runs the demultiplex loop, and exposes
//! `open`/`accept`/`wait`/`close`.

use std::sync::{Arc, Mutex};

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelInner, Direction, OpenReply};
use crate::codec::{self, Message};
use crate::config::{
    INITIAL_WINDOW, MAX_OPEN_PACKET_SIZE, MAX_PACKET_PAYLOAD, MIN_OPEN_PACKET_SIZE,
};
use crate::error::{Error, Result};
use crate::table::ChannelTable;

const ACCEPT_QUEUE_CAPACITY: usize = 16;

/// Shared session state reachable from channels via a [`std::sync::Weak`]
/// handle.
pub(crate) struct SessionShared {
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    table: ChannelTable,
    accept_tx: mpsc::Sender<Channel>,
    accept_rx: AsyncMutex<mpsc::Receiver<Channel>>,
    terminal: Mutex<Option<Error>>,
    closed: Notify,
}

impl SessionShared {
    /// Encode and write `msg` as one atomic frame. Serializes concurrent
    /// senders so frames from different channels interleave only at frame
    /// boundaries.
    pub(crate) async fn send(&self, msg: Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        codec::encode(&mut *writer, &msg).await
    }

    /// Remove a fully (both-sides) closed channel from the table.
    pub(crate) async fn finish_close(&self, local_id: u32) {
        self.table.free(local_id);
        log::debug!("qmux: channel {local_id} fully closed, id reclaimed");
    }

    fn set_terminal_error(&self, err: Error) {
        let mut slot = self.terminal.lock().expect("poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Stop accepting and drain the inbound-channel queue, so a blocked or
    /// future `accept()` returns `None` instead of hanging forever.
    async fn close_accept(&self) {
        self.accept_rx.lock().await.close();
    }

    /// Shut down the transport's write half so the peer observes a clean
    /// close. Errors are logged, not propagated — the transport may already
    /// be gone by the time this runs.
    async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            log::debug!("qmux: error shutting down transport writer: {err}");
        }
    }
}

/// The runtime bound to one transport, multiplexing many [`Channel`]s.
///
/// Construction starts the demultiplex loop immediately; dropping a
/// `Session` does not stop that loop (it owns the transport and keeps
/// running until EOF or a protocol error) — call [`Session::close`] for an
/// orderly shutdown.
pub struct Session {
    shared: Arc<SessionShared>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap `transport` in a session and start its demultiplex loop.
    pub fn new<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = split(transport);
        Self::from_halves(read_half, write_half)
    }

    /// Like [`Session::new`] but for transports that already split into
    /// independent owned read/write halves (e.g. `TcpStream::into_split`).
    pub fn from_halves<R, W>(read_half: R, write_half: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let shared = Arc::new(SessionShared {
            writer: AsyncMutex::new(Box::new(write_half)),
            table: ChannelTable::new(),
            accept_tx,
            accept_rx: AsyncMutex::new(accept_rx),
            terminal: Mutex::new(None),
            closed: Notify::new(),
        });

        let loop_shared = shared.clone();
        let reader_handle = tokio::spawn(async move {
            demux_loop(loop_shared, read_half).await;
        });

        Session {
            shared,
            reader_handle: Mutex::new(Some(reader_handle)),
        }
    }

    /// Open an outbound channel: send OPEN and block for the peer's
    /// OPEN_CONFIRM or OPEN_FAILURE.
    pub async fn open(&self) -> Result<Channel> {
        if self.shared.terminal.lock().expect("poisoned").is_some() {
            return Err(Error::SessionClosed);
        }
        let local_id = self.shared.table.reserve();
        let weak = Arc::downgrade(&self.shared);
        let inner = ChannelInner::new(local_id, Direction::Outbound, weak);
        self.shared.table.install(local_id, inner.clone());

        self.shared
            .send(Message::Open {
                sender_id: local_id,
                window_size: INITIAL_WINDOW,
                max_packet_size: MAX_PACKET_PAYLOAD,
            })
            .await?;
        log::debug!("qmux: sent OPEN for local channel {local_id}");

        match inner.wait_open_reply().await {
            Some(OpenReply::Confirm {
                remote_id,
                window_size,
                max_packet_size,
            }) => {
                inner.establish_remote(remote_id, window_size, max_packet_size)?;
                log::debug!("qmux: channel {local_id} established (remote {remote_id})");
                Ok(Channel::new(inner))
            }
            Some(OpenReply::Failure) => {
                self.shared.table.free(local_id);
                Err(Error::OpenRefused)
            }
            None => {
                // The inbox closed because the session tore down while we
                // were waiting, not because the peer replied OPEN_FAILURE.
                self.shared.table.free(local_id);
                Err(Error::SessionClosed)
            }
        }
    }

    /// Block for the next peer-initiated channel. Returns an error once the
    /// session has closed and no more channels will ever arrive.
    pub async fn accept(&self) -> Result<Channel> {
        self.shared
            .accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::SessionClosed)
    }

    /// Block until the session has terminated, then return the terminal
    /// error — `Ok(())` if the transport closed cleanly or `close()` was
    /// called, `Err` if a protocol or I/O error tore the session down.
    pub async fn wait(&self) -> Result<()> {
        loop {
            // Register for the close notification before checking terminal
            // state, so a close that lands concurrently is never missed.
            let notified = self.shared.closed.notified();
            if let Some(result) = self.terminal_result() {
                return result;
            }
            notified.await;
        }
    }

    fn terminal_result(&self) -> Option<Result<()>> {
        let slot = self.shared.terminal.lock().expect("poisoned");
        slot.as_ref().map(|err| match err {
            Error::SessionClosed => Ok(()),
            other => Err(clone_terminal_error(other)),
        })
    }

    /// Close the session: drop every channel (unblocking their readers and
    /// writers) and stop the demultiplex loop. Idempotent.
    pub async fn close(&self) {
        self.shared.set_terminal_error(Error::SessionClosed);
        drop_all_channels(&self.shared).await;
        self.shared.close_accept().await;
        self.shared.shutdown_writer().await;
        self.shared.closed.notify_waiters();
        if let Some(handle) = self.reader_handle.lock().expect("poisoned").take() {
            handle.abort();
        }
    }
}

/// `Error` doesn't derive `Clone` (the underlying `io::Error` doesn't), so
/// `wait()` reconstructs an equivalent terminal error by kind for every
/// caller that awaits it.
fn clone_terminal_error(err: &Error) -> Error {
    match err {
        Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        Error::UnknownMessageType(b) => Error::UnknownMessageType(*b),
        Error::UnknownChannel(id) => Error::UnknownChannel(*id),
        Error::OversizedPayload(n) => Error::OversizedPayload(*n),
        Error::WindowViolation { channel, length } => Error::WindowViolation {
            channel: *channel,
            length: *length,
        },
        Error::WindowOverflow => Error::WindowOverflow,
        Error::OpenRefused => Error::OpenRefused,
        Error::SessionClosed => Error::SessionClosed,
        Error::ChannelClosed => Error::ChannelClosed,
    }
}

async fn drop_all_channels(shared: &Arc<SessionShared>) {
    for inner in shared.table.drain_occupied() {
        inner.shutdown_for_session_close().await;
    }
}

/// The sole reader of the transport. Demultiplexes frames to channels until
/// EOF or a protocol error, then tears the whole session down.
async fn demux_loop<R: AsyncRead + Unpin>(shared: Arc<SessionShared>, mut reader: R) {
    loop {
        let msg = match codec::decode(&mut reader).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                log::debug!("qmux: transport closed cleanly");
                shared.set_terminal_error(Error::SessionClosed);
                break;
            }
            Err(err) => {
                log::warn!("qmux: session terminating: {err}");
                shared.set_terminal_error(err);
                break;
            }
        };

        if let Err(err) = dispatch(&shared, msg).await {
            log::warn!("qmux: session terminating: {err}");
            shared.set_terminal_error(err);
            break;
        }
    }

    drop_all_channels(&shared).await;
    shared.close_accept().await;
    shared.shutdown_writer().await;
    shared.closed.notify_waiters();
}

async fn dispatch(shared: &Arc<SessionShared>, msg: Message) -> Result<()> {
    match msg {
        Message::Open {
            sender_id,
            window_size,
            max_packet_size,
        } => handle_open(shared, sender_id, window_size, max_packet_size).await,
        other => {
            let id = other
                .channel_id()
                .expect("every non-Open message carries a recipient id");
            let inner = shared.table.get(id).ok_or(Error::UnknownChannel(id))?;
            handle_channel_message(shared, inner, other).await
        }
    }
}

async fn handle_open(
    shared: &Arc<SessionShared>,
    sender_id: u32,
    window_size: u32,
    max_packet_size: u32,
) -> Result<()> {
    if !(MIN_OPEN_PACKET_SIZE..=MAX_OPEN_PACKET_SIZE).contains(&max_packet_size) {
        log::warn!(
            "qmux: rejecting OPEN from peer channel {sender_id}: invalid max packet size {max_packet_size}"
        );
        return shared
            .send(Message::OpenFailure {
                recipient_id: sender_id,
            })
            .await;
    }

    let local_id = shared.table.reserve();
    let weak = Arc::downgrade(shared);
    let inner = ChannelInner::new(local_id, Direction::Inbound, weak);
    inner.establish_remote(sender_id, window_size, max_packet_size)?;
    shared.table.install(local_id, inner.clone());

    let channel = Channel::new(inner);
    if shared.accept_tx.send(channel).await.is_err() {
        // Nobody is calling accept() anymore; free the slot we just took.
        shared.table.free(local_id);
        return Ok(());
    }

    log::debug!("qmux: accepted channel {local_id} (peer channel {sender_id})");
    shared
        .send(Message::OpenConfirm {
            recipient_id: sender_id,
            sender_id: local_id,
            window_size: INITIAL_WINDOW,
            max_packet_size: MAX_PACKET_PAYLOAD,
        })
        .await
}

async fn handle_channel_message(
    shared: &Arc<SessionShared>,
    inner: Arc<ChannelInner>,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::OpenConfirm {
            sender_id,
            window_size,
            max_packet_size,
            ..
        } => {
            inner
                .deliver_open_reply(OpenReply::Confirm {
                    remote_id: sender_id,
                    window_size,
                    max_packet_size,
                })
                .await;
            Ok(())
        }
        Message::OpenFailure { .. } => {
            inner.deliver_open_reply(OpenReply::Failure).await;
            Ok(())
        }
        Message::WindowAdjust {
            additional_bytes, ..
        } => inner.on_window_adjust(additional_bytes),
        Message::Data { payload, .. } => inner.on_data(payload),
        Message::Eof { .. } => {
            inner.on_eof();
            Ok(())
        }
        Message::Close { .. } => {
            let fully_closed = inner.on_close().await;
            if fully_closed {
                shared.finish_close(inner.local_id()).await;
            }
            Ok(())
        }
        Message::Open { .. } => unreachable!("OPEN is dispatched separately"),
    }
}
