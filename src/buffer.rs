//! Unbounded FIFO of byte chunks with EOF signaling.
//!
//! `write` appends a chunk and never blocks or drops data; `read` blocks
//! until at least one byte is available or the buffer has hit EOF and been
//! fully drained. No receive-side byte limit is enforced here — flow
//! control (the [`crate::window::Window`] on the owning channel) is the
//! sole backpressure mechanism.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::{Buf, Bytes};
use tokio::sync::Notify;

struct State {
    chunks: VecDeque<Bytes>,
    eof: bool,
}

/// See the module docs.
pub(crate) struct Buffer {
    state: Mutex<State>,
    notify: Notify,
}

impl Buffer {
    pub(crate) fn new() -> Self {
        Buffer {
            state: Mutex::new(State {
                chunks: VecDeque::new(),
                eof: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append `data` to the end of the FIFO. Never blocks.
    pub(crate) fn write(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock().expect("buffer mutex poisoned");
            state.chunks.push_back(data);
        }
        self.notify.notify_waiters();
    }

    /// Block until at least one byte is available, then copy as much as
    /// fits into `dst` (short reads are permitted) and return the count.
    /// Returns `0` once EOF has been signaled and every buffered byte has
    /// been drained.
    pub(crate) async fn read(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("buffer mutex poisoned");
                if !state.chunks.is_empty() {
                    return Self::drain_into(&mut state.chunks, dst);
                }
                if state.eof {
                    return 0;
                }
            }
            notified.await;
        }
    }

    fn drain_into(chunks: &mut VecDeque<Bytes>, dst: &mut [u8]) -> usize {
        let mut total = 0;
        while total < dst.len() {
            let Some(front) = chunks.front_mut() else {
                break;
            };
            let n = (dst.len() - total).min(front.len());
            dst[total..total + n].copy_from_slice(&front[..n]);
            front.advance(n);
            total += n;
            if front.is_empty() {
                chunks.pop_front();
            }
        }
        total
    }

    /// Signal EOF and wake every blocked reader.
    pub(crate) fn eof(&self) {
        {
            let mut state = self.state.lock().expect("buffer mutex poisoned");
            state.eof = true;
        }
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn read_returns_written_bytes_in_order() {
        let buf = Buffer::new();
        buf.write(Bytes::from_static(b"hello "));
        buf.write(Bytes::from_static(b"world"));

        let mut dst = [0u8; 32];
        let n = buf.read(&mut dst).await;
        assert_eq!(&dst[..n], b"hello world");
    }

    #[tokio::test]
    async fn short_reads_split_a_single_chunk_across_calls() {
        let buf = Buffer::new();
        buf.write(Bytes::from_static(b"abcdef"));

        let mut dst = [0u8; 3];
        assert_eq!(buf.read(&mut dst).await, 3);
        assert_eq!(&dst, b"abc");
        assert_eq!(buf.read(&mut dst).await, 3);
        assert_eq!(&dst, b"def");
    }

    #[tokio::test]
    async fn read_blocks_until_write_then_returns() {
        let buf = Arc::new(Buffer::new());
        let buf2 = buf.clone();
        let task = tokio::spawn(async move {
            let mut dst = [0u8; 8];
            let n = buf2.read(&mut dst).await;
            (dst, n)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        buf.write(Bytes::from_static(b"hi"));

        let (dst, n) = task.await.unwrap();
        assert_eq!(&dst[..n], b"hi");
    }

    #[tokio::test]
    async fn eof_on_empty_buffer_returns_zero() {
        let buf = Buffer::new();
        buf.eof();
        let mut dst = [0u8; 4];
        assert_eq!(buf.read(&mut dst).await, 0);
    }

    #[tokio::test]
    async fn eof_after_data_drains_remaining_bytes_first() {
        let buf = Buffer::new();
        buf.write(Bytes::from_static(b"x"));
        buf.eof();

        let mut dst = [0u8; 4];
        assert_eq!(buf.read(&mut dst).await, 1);
        assert_eq!(buf.read(&mut dst).await, 0);
    }
}
