//! Bidirectional byte relay between two connections
//!
//! Two copy tasks, one per direction, share a cancellation token. When either
//! direction finishes (EOF, error or cancel) it shuts down its writer and
//! cancels the other, so a disconnect on one side tears down both.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from `a` to `b`
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`
    pub b_to_a: u64,
}

/// Relay bytes between `a` and `b` until either side closes or `cancel`
/// fires. Never returns an error; failures end the relay and are logged.
pub async fn bridge<A, B>(a: A, b: B, cancel: CancellationToken) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let cancel = cancel.child_token();

    let forward = tokio::spawn(pipe(a_read, b_write, cancel.clone(), "a->b"));
    let backward = tokio::spawn(pipe(b_read, a_write, cancel.clone(), "b->a"));

    let (a_to_b, b_to_a) = tokio::join!(forward, backward);
    RelayStats {
        a_to_b: a_to_b.unwrap_or(0),
        b_to_a: b_to_a.unwrap_or(0),
    }
}

async fn pipe<R, W>(mut reader: R, mut writer: W, cancel: CancellationToken, dir: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        _ = cancel.cancelled() => None,
        result = tokio::io::copy(&mut reader, &mut writer) => match result {
            Ok(n) => Some(n),
            Err(e) => {
                debug!(direction = dir, error = %e, "Relay direction failed");
                None
            }
        },
    };
    let _ = writer.shutdown().await;
    cancel.cancel();
    copied.unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn relays_both_directions_until_close() {
        let (client, a) = duplex(64);
        let (b, upstream) = duplex(64);
        let relay = tokio::spawn(bridge(a, b, CancellationToken::new()));

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut up_r, mut up_w) = tokio::io::split(upstream);

        client_w.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        up_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        up_w.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        client_w.shutdown().await.unwrap();
        let stats = relay.await.unwrap();
        assert_eq!(stats.a_to_b, 5);
    }

    #[tokio::test]
    async fn cancel_ends_both_directions() {
        let (_client, a) = duplex(64);
        let (b, _upstream) = duplex(64);
        let cancel = CancellationToken::new();
        let relay = tokio::spawn(bridge(a, b, cancel.clone()));
        cancel.cancel();
        let stats = tokio::time::timeout(std::time::Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, RelayStats::default());
    }
}
