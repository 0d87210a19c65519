//! Bidirectional byte splicing
//!
//! `Extend`, `Dial` and `External` all end the same way: two half-duplex
//! copies between two conduits until one side closes, with the close
//! propagated to the other. Each direction holds its own bounded buffer and
//! inherits the rate of the slower side.

use futures::future::Either;
use futures::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tracing::trace;

use crate::error::Result;

/// Per-direction copy buffer.
pub const SPLICE_BUFFER: usize = 64 * 1024;

/// Copy bytes in both directions between `a` and `b` until either side
/// closes, then close the other. Returns the byte count of the direction
/// that finished first.
pub async fn splice<A, B>(a: A, b: B) -> Result<u64>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (a_read, a_write) = a.split();
    let (b_read, b_write) = b.split();

    let forward = copy_then_close(a_read, b_write);
    let backward = copy_then_close(b_read, a_write);
    futures::pin_mut!(forward, backward);

    // Whichever direction ends first wins; dropping the loser releases the
    // remaining halves of both conduits, closing them.
    let copied = match futures::future::select(forward, backward).await {
        Either::Left((outcome, _)) => outcome?,
        Either::Right((outcome, _)) => outcome?,
    };
    trace!("splice finished after {copied} bytes");
    Ok(copied)
}

async fn copy_then_close<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let outcome = async {
        let mut buf = vec![0u8; SPLICE_BUFFER];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            writer.write_all(&buf[..n]).await?;
            writer.flush().await?;
            total += n as u64;
        }
    }
    .await;

    let _ = writer.close().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::io::AsyncWriteExt as _;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (mut left_app, left_net) = tokio::io::duplex(64 * 1024);
        let (mut right_app, right_net) = tokio::io::duplex(64 * 1024);

        let task = tokio::spawn(splice(left_net.compat(), right_net.compat()));

        left_app.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        right_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        right_app.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        left_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        drop(left_app);
        drop(right_app);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let (left_app, left_net) = tokio::io::duplex(1024);
        let (mut right_app, right_net) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(left_net.compat(), right_net.compat()));

        // Closing one side must surface as EOF on the other.
        drop(left_app);

        let mut buf = Vec::new();
        right_app.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_large_transfer() {
        let (mut left_app, left_net) = tokio::io::duplex(64 * 1024);
        let (mut right_app, right_net) = tokio::io::duplex(64 * 1024);

        tokio::spawn(splice(left_net.compat(), right_net.compat()));

        let payload = vec![0xA5u8; 1024 * 1024];
        let writer = tokio::spawn(async move {
            left_app.write_all(&payload).await.unwrap();
            left_app.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        right_app.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 1024 * 1024);
        assert!(received.iter().all(|&b| b == 0xA5));
        writer.await.unwrap();
    }
}
