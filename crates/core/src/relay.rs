// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

//! Bidirectional byte relay between two duplex streams.
//!
//! The relay polls both endpoints with a bounded wait so that a cancelled
//! token is observed even on an idle connection. Each chunk read from one
//! side is written in full to the other side before the next poll. Either
//! side reaching EOF or failing ends the whole relay; there is no half-close.
//! Both endpoints are shut down and dropped before returning.
//!
//! Delivery is best-effort: if the destination fails mid-write the chunk is
//! discarded and the relay ends. Failures are logged, never returned.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes read per poll from each endpoint
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound on a single readiness wait
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub chunk_size: usize,
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// Endpoint of a relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

/// Why a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The side returned a zero-length read
    Closed(Side),
    /// An I/O error occurred reading from or writing to the side
    Failed(Side),
    /// The cancellation token fired
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: RelayEnd,
}

/// Copy bytes between `a` and `b` until either side closes or fails, or `cancel` fires
pub async fn relay<A, B>(
    mut a: A,
    mut b: B,
    config: RelayConfig,
    cancel: &CancellationToken,
) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let chunk_size = config.chunk_size.max(1);
    let mut buf_a = vec![0u8; chunk_size];
    let mut buf_b = vec![0u8; chunk_size];
    let mut a_to_b: u64 = 0;
    let mut b_to_a: u64 = 0;

    let end = loop {
        if cancel.is_cancelled() {
            break RelayEnd::Cancelled;
        }

        // Unbiased: a side that is always readable must not starve the other
        tokio::select! {
            _ = cancel.cancelled() => break RelayEnd::Cancelled,

            read = a.read(&mut buf_a) => {
                match forward_chunk(read, &buf_a, &mut b, Side::A).await {
                    Ok(n) => a_to_b += n as u64,
                    Err(end) => break end,
                }
            }

            read = b.read(&mut buf_b) => {
                match forward_chunk(read, &buf_b, &mut a, Side::B).await {
                    Ok(n) => b_to_a += n as u64,
                    Err(end) => break end,
                }
            }

            // Idle poll: nothing readable within the interval
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    };

    // Close both endpoints together
    if let Err(e) = a.shutdown().await {
        debug!("Relay shutdown of side A failed: {}", e);
    }
    if let Err(e) = b.shutdown().await {
        debug!("Relay shutdown of side B failed: {}", e);
    }

    debug!(
        "Relay ended ({:?}): {} bytes A->B, {} bytes B->A",
        end, a_to_b, b_to_a
    );

    RelayStats {
        a_to_b,
        b_to_a,
        end,
    }
}

/// Write one freshly read chunk to the destination. Returns the chunk length,
/// or the reason the relay must stop.
async fn forward_chunk<W>(
    read: std::io::Result<usize>,
    buf: &[u8],
    dst: &mut W,
    src: Side,
) -> Result<usize, RelayEnd>
where
    W: AsyncWrite + Unpin,
{
    match read {
        Ok(0) => Err(RelayEnd::Closed(src)),
        Ok(n) => {
            if let Err(e) = dst.write_all(&buf[..n]).await {
                debug!("Relay write to side {:?} failed, dropping {} bytes: {}", src.peer(), n, e);
                return Err(RelayEnd::Failed(src.peer()));
            }
            Ok(n)
        }
        Err(e) => {
            debug!("Relay read from side {:?} failed: {}", src, e);
            Err(RelayEnd::Failed(src))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_relay_preserves_bytes_in_both_directions() {
        let (mut a_user, a_relay) = duplex(1024);
        let (mut b_user, b_relay) = duplex(1024);
        let cancel = CancellationToken::new();

        let relay_cancel = cancel.clone();
        let relay_task = tokio::spawn(async move {
            relay(a_relay, b_relay, RelayConfig::default(), &relay_cancel).await
        });

        // Larger than one chunk so the payload spans several polls
        let outbound = pattern(3 * CHUNK_SIZE + 17);
        let writer_payload = outbound.clone();
        let writer = tokio::spawn(async move {
            a_user.write_all(&writer_payload).await.unwrap();
            a_user
        });

        let mut received = vec![0u8; outbound.len()];
        b_user.read_exact(&mut received).await.unwrap();
        assert_eq!(received, outbound);

        let mut a_user = writer.await.unwrap();
        let inbound = b"reply from B".to_vec();
        b_user.write_all(&inbound).await.unwrap();
        let mut reply = vec![0u8; inbound.len()];
        a_user.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, inbound);

        drop(a_user);
        let stats = relay_task.await.unwrap();
        assert_eq!(stats.end, RelayEnd::Closed(Side::A));
        assert_eq!(stats.a_to_b, outbound.len() as u64);
        assert_eq!(stats.b_to_a, inbound.len() as u64);
    }

    #[tokio::test]
    async fn test_relay_closes_peer_when_one_side_closes() {
        let (a_user, a_relay) = duplex(64);
        let (mut b_user, b_relay) = duplex(64);
        let cancel = CancellationToken::new();

        let relay_task = tokio::spawn(async move {
            relay(a_relay, b_relay, RelayConfig::default(), &cancel).await
        });

        drop(a_user);

        let stats = tokio::time::timeout(POLL_INTERVAL * 2, relay_task)
            .await
            .expect("relay should end within one poll interval")
            .unwrap();
        assert_eq!(stats.end, RelayEnd::Closed(Side::A));

        // B observes EOF because the relay shut down and dropped its half
        let mut buf = [0u8; 8];
        let n = b_user.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_busy_side_does_not_starve_the_other() {
        let (a_user, a_relay) = duplex(64 * 1024);
        let (b_user, b_relay) = duplex(64 * 1024);
        let cancel = CancellationToken::new();

        let relay_cancel = cancel.clone();
        let relay_task = tokio::spawn(async move {
            relay(a_relay, b_relay, RelayConfig::default(), &relay_cancel).await
        });

        let (mut a_read, mut a_write) = tokio::io::split(a_user);
        let (mut b_read, mut b_write) = tokio::io::split(b_user);

        // A streams without pause; B's reader drains it
        let flood = tokio::spawn(async move {
            let chunk = pattern(CHUNK_SIZE);
            while a_write.write_all(&chunk).await.is_ok() {}
        });
        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            while matches!(b_read.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        b_write.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), a_read.read_exact(&mut reply))
            .await
            .expect("B -> A data should get through while A is busy")
            .unwrap();
        assert_eq!(&reply, b"pong");

        cancel.cancel();
        let stats = relay_task.await.unwrap();
        assert_eq!(stats.end, RelayEnd::Cancelled);
        assert_eq!(stats.b_to_a, 4);
        flood.abort();
        drain.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_relay_observes_cancellation() {
        let (_a_user, a_relay) = duplex(64);
        let (_b_user, b_relay) = duplex(64);
        let cancel = CancellationToken::new();

        let relay_cancel = cancel.clone();
        let relay_task = tokio::spawn(async move {
            relay(a_relay, b_relay, RelayConfig::default(), &relay_cancel).await
        });

        // Let a few idle polls elapse before cancelling
        tokio::time::sleep(POLL_INTERVAL * 3).await;
        assert!(!relay_task.is_finished());

        cancel.cancel();
        let stats = relay_task.await.unwrap();
        assert_eq!(stats.end, RelayEnd::Cancelled);
        assert_eq!(stats.a_to_b, 0);
        assert_eq!(stats.b_to_a, 0);
    }

    #[tokio::test]
    async fn test_small_chunk_size_still_delivers_everything() {
        let (mut a_user, a_relay) = duplex(16);
        let (mut b_user, b_relay) = duplex(16);
        let cancel = CancellationToken::new();
        let config = RelayConfig {
            chunk_size: 3,
            ..RelayConfig::default()
        };

        let relay_task =
            tokio::spawn(async move { relay(a_relay, b_relay, config, &cancel).await });

        let payload = pattern(200);
        let writer_payload = payload.clone();
        tokio::spawn(async move {
            b_user.write_all(&writer_payload).await.unwrap();
            b_user.shutdown().await.unwrap();
            // Keep B open until the relay has drained it
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut received = Vec::new();
        a_user.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        let stats = relay_task.await.unwrap();
        assert_eq!(stats.end, RelayEnd::Closed(Side::B));
        assert_eq!(stats.b_to_a, 200);
    }
}
