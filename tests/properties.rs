//! Property tests for the invariants that must hold regardless of the
//! particular interleaving of writes: order preservation per channel, and
//! id reuse only after a channel is fully and exclusively closed.

use std::time::Duration;

use proptest::prelude::*;
use qmux::Session;

async fn round_trip(chunks: Vec<Vec<u8>>) -> Vec<u8> {
    let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
    let client = Session::new(client_io);
    let server = Session::new(server_io);
    let total_len: usize = chunks.iter().map(Vec::len).sum();

    let server_task = tokio::spawn(async move {
        let channel = server.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while received.len() < total_len {
            let n = channel.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    let channel = client.open().await.unwrap();
    for chunk in &chunks {
        channel.write(chunk).await.unwrap();
    }
    channel.close_write().await.unwrap();

    server_task.await.unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Invariant 1: bytes written to a channel arrive in the same order,
    /// regardless of how they were chunked across individual write calls.
    #[test]
    fn data_written_to_a_channel_is_read_back_byte_identical(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..500), 1..20)
    ) {
        let expected: Vec<u8> = chunks.iter().flatten().copied().collect();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let received = rt.block_on(round_trip(chunks));
        prop_assert_eq!(received, expected);
    }
}

async fn open_close_cycle(cycles: usize) -> Result<(), TestCaseError> {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let client = Session::new(client_io);
    let server = Session::new(server_io);

    tokio::spawn(async move {
        loop {
            match server.accept().await {
                Ok(channel) => {
                    let _ = channel.close().await;
                }
                Err(_) => break,
            }
        }
    });

    let mut first_id = None;
    for _ in 0..cycles {
        let channel = client.open().await.unwrap();
        let id = channel.id();
        match first_id {
            Some(expected) => prop_assert_eq!(id, expected),
            None => first_id = Some(id),
        }
        channel.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Invariant 6: a channel id becomes available for reuse only once both
    /// sides have fully closed, and the first available id is always reused.
    #[test]
    fn local_ids_are_reused_after_full_close(cycles in 1usize..8) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(open_close_cycle(cycles))?;
    }
}
