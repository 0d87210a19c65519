//! Multiplexed sessions over arbitrary conduits
//!
//! Hidden-service binds and dials upgrade their conduit to a yamux session.
//! The connection object wants to be polled from one place, so a driver
//! task owns it: stream opens arrive as commands, inbound streams flow out
//! through a channel, and a watch flag flips when the session dies.

use std::collections::VecDeque;
use std::task::Poll;

use futures::future;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, trace};

pub use yamux::Mode;

use crate::conduit::BoxConduit;
use crate::error::{OnionError, Result};

enum Cmd {
    Open(oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>),
    Close,
}

/// One end of a multiplexed session.
pub struct MuxSession {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<yamux::Stream>>,
    done_rx: watch::Receiver<bool>,
}

impl MuxSession {
    /// Upgrade `conduit` to a session. `mode` decides stream-ID parity and
    /// must differ between the two ends of one conduit.
    pub fn new(conduit: BoxConduit, mode: Mode) -> Self {
        let connection = yamux::Connection::new(conduit, yamux::Config::default(), mode);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(drive(connection, cmd_rx, inbound_tx, done_tx));

        Self {
            cmd_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            done_rx,
        }
    }

    /// Open a new stream toward the other end.
    pub async fn open_stream(&self) -> Result<yamux::Stream> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Open(reply))
            .map_err(|_| OnionError::Upstream("mux session closed".to_string()))?;
        rx.await
            .map_err(|_| OnionError::Upstream("mux session closed".to_string()))?
            .map_err(|e| OnionError::Upstream(format!("mux open: {e}")))
    }

    /// Accept the next stream opened by the other end. `None` once the
    /// session is closed and drained.
    pub async fn accept(&self) -> Option<yamux::Stream> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Ask the driver to close the session.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Cmd::Close);
    }

    pub fn is_closed(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Resolve once the session has fully shut down (either end closing,
    /// or the conduit dying underneath it).
    pub async fn closed(&self) {
        let mut rx = self.done_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn drive(
    mut connection: yamux::Connection<BoxConduit>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    inbound_tx: mpsc::UnboundedSender<yamux::Stream>,
    done_tx: watch::Sender<bool>,
) {
    let mut pending_opens: VecDeque<
        oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>,
    > = VecDeque::new();
    let mut closing = false;

    let result = future::poll_fn(|cx| {
        loop {
            match cmd_rx.poll_recv(cx) {
                Poll::Ready(Some(Cmd::Open(reply))) => pending_opens.push_back(reply),
                Poll::Ready(Some(Cmd::Close)) | Poll::Ready(None) => {
                    closing = true;
                    break;
                }
                Poll::Pending => break,
            }
        }

        if closing {
            while let Some(reply) = pending_opens.pop_front() {
                let _ = reply.send(Err(yamux::ConnectionError::Closed));
            }
            return connection.poll_close(cx);
        }

        while !pending_opens.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(outcome) => {
                    let reply = pending_opens.pop_front().expect("checked nonempty");
                    let _ = reply.send(outcome);
                }
                Poll::Pending => break,
            }
        }

        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    trace!("mux: inbound stream");
                    // A gone receiver is fine; keep driving so opens work.
                    let _ = inbound_tx.send(stream);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    if let Err(e) = result {
        debug!("mux session ended: {e}");
    }
    let _ = done_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::boxed;
    use futures::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            MuxSession::new(boxed(a.compat()), Mode::Client),
            MuxSession::new(boxed(b.compat()), Mode::Server),
        )
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let (client, server) = session_pair();

        let (opened, accepted) = tokio::join!(client.open_stream(), server.accept());
        let mut opened = opened.unwrap();
        let mut accepted = accepted.unwrap();

        opened.write_all(b"ping").await.unwrap();
        opened.flush().await.unwrap();

        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_server_can_open_toward_client() {
        let (client, server) = session_pair();

        let (opened, accepted) = tokio::join!(server.open_stream(), client.accept());
        let mut opened = opened.unwrap();
        let mut accepted = accepted.unwrap();

        accepted.write_all(b"pong").await.unwrap();
        accepted.flush().await.unwrap();

        let mut buf = [0u8; 4];
        opened.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_multiple_streams() {
        let (client, server) = session_pair();

        for i in 0u8..4 {
            let (opened, accepted) = tokio::join!(client.open_stream(), server.accept());
            let mut opened = opened.unwrap();
            let mut accepted = accepted.unwrap();

            opened.write_all(&[i]).await.unwrap();
            opened.flush().await.unwrap();
            let mut buf = [0u8; 1];
            accepted.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[0], i);
        }
    }

    #[tokio::test]
    async fn test_close_resolves_waiters() {
        let (client, server) = session_pair();

        client.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), client.closed())
            .await
            .expect("close must resolve");

        // The far end observes the shutdown too.
        tokio::time::timeout(std::time::Duration::from_secs(5), server.closed())
            .await
            .expect("peer close must propagate");
        assert!(server.is_closed());
        assert!(server.accept().await.is_none());
    }
}
