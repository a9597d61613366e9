//! A single large write must fragment into MAX_PACKET_PAYLOAD-sized DATA
//! frames on the wire.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use qmux::Session;
use tokio::io::{AsyncWrite, DuplexStream, WriteHalf};

/// Forwards every write to the real transport while also recording the
/// exact bytes that crossed the wire, so the test can inspect frame
/// boundaries after the fact.
struct TeeWriter {
    inner: WriteHalf<DuplexStream>,
    log: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for TeeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.log.lock().unwrap().extend_from_slice(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Walks the wire-format byte stream, skipping every message by its fixed
/// length and collecting the length prefix of each DATA frame (type 104).
fn data_frame_lengths(bytes: &[u8]) -> Vec<u32> {
    fn fixed_len(t: u8) -> usize {
        match t {
            100 => 12, // OPEN
            101 => 16, // OPEN_CONFIRM
            102 => 4,  // OPEN_FAILURE
            103 => 8,  // WINDOW_ADJUST
            104 => 8,  // DATA (fixed header only, payload is separate)
            105 => 4,  // EOF
            106 => 4,  // CLOSE
            other => panic!("unexpected frame type in test harness: {other}"),
        }
    }

    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let t = bytes[i];
        i += 1;
        let fixed = fixed_len(t);
        if t == 104 {
            let length = u32::from_be_bytes(bytes[i + 4..i + 8].try_into().unwrap());
            i += fixed;
            i += length as usize;
            out.push(length);
        } else {
            i += fixed;
        }
    }
    out
}

#[tokio::test]
async fn writes_are_fragmented_at_max_packet_payload() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let log = Arc::new(Mutex::new(Vec::new()));
    let client = Session::from_halves(
        client_read,
        TeeWriter {
            inner: client_write,
            log: log.clone(),
        },
    );
    let server = Session::new(server_io);

    let payload = vec![0xABu8; 100_000];
    let payload_len = payload.len();

    let server_task = tokio::spawn(async move {
        let channel = server.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 8192];
        while received.len() < payload_len {
            let n = channel.read(&mut buf).await.unwrap();
            assert!(n > 0, "server read ended before all bytes arrived");
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    let channel = client.open().await.unwrap();
    channel.write(&payload).await.unwrap();

    let received = server_task.await.unwrap();
    assert_eq!(received, payload);

    let lengths = data_frame_lengths(&log.lock().unwrap());
    assert_eq!(lengths, vec![32_768, 32_768, 32_768, 1_696]);
}
