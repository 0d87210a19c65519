//! HTTP CONNECT proxy over onion circuits
//!
//! Translates browser `CONNECT host:port` requests into circuit dials. A
//! fresh circuit is built per connection from the peer database. Targets
//! ending in `.libonion` are resolved as hidden services: the address is
//! looked up anonymously through the circuit, the circuit is extended to a
//! hosting relay, and the first hidden stream is spliced to the browser.
//! Anything else leaves the overlay through an exit tail.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::io::{AsyncRead, AsyncWrite};
use libp2p::{Multiaddr, PeerId};
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::io::AsyncReadExt as _;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info};

use onionp2p_database::{CircuitSpec, Database};
use onionp2p_onion::{boxed, peers, BoxConduit, HiddenConnection, Onion, OnionError};

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("target refused: {0}")]
    TargetRefused(String),

    #[error("no providers found for {0}")]
    NotFound(String),

    #[error("circuit failed: {0}")]
    Circuit(#[from] OnionError),

    #[error("peer selection failed: {0}")]
    Selection(#[from] onionp2p_database::DatabaseError),
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address the proxy listens on.
    pub listen_addr: SocketAddr,
    /// Number of relays per circuit.
    pub circuit_length: usize,
    /// Allow CONNECT to loopback and private-range targets.
    pub allow_private: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8118".parse().expect("valid hardcoded addr"),
            circuit_length: 3,
            allow_private: false,
        }
    }
}

/// HTTP CONNECT proxy over the overlay.
pub struct Proxy {
    onion: Arc<Onion>,
    database: Database,
    config: ProxyConfig,
}

impl Proxy {
    pub fn new(onion: Arc<Onion>, database: Database, config: ProxyConfig) -> Arc<Self> {
        Arc::new(Self {
            onion,
            database,
            config,
        })
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self: Arc<Self>) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("proxy listening on {}", listener.local_addr()?);

        loop {
            let (stream, remote) = listener.accept().await?;
            let proxy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.handle_connection(stream).await {
                    debug!("proxy connection from {remote} failed: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, mut client: TcpStream) -> Result<(), ProxyError> {
        let (host, port) = match read_connect_request(&mut client).await {
            Ok(target) => target,
            Err(e) => {
                let _ = respond(&mut client, "400 Bad Request").await;
                return Err(e);
            }
        };

        info!("CONNECT {host}:{port}");
        let tunnel = match self.connect_target(&host, port).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                let _ = respond(&mut client, "502 Bad Gateway").await;
                return Err(e);
            }
        };

        respond(&mut client, "200 Connection established").await?;
        onionp2p_onion::splice::splice(client.compat(), tunnel).await?;
        Ok(())
    }

    /// Resolve and connect a CONNECT target through a fresh circuit.
    async fn connect_target(&self, host: &str, port: u16) -> Result<BoxConduit, ProxyError> {
        if let Some(raw) = host.strip_suffix(peers::HIDDEN_DNS_SUFFIX) {
            let peer_id: PeerId = raw
                .parse()
                .map_err(|_| ProxyError::BadRequest(format!("bad hidden address: {host}")))?;
            return self.connect_hidden(peers::peer_id_to_cid(peer_id)).await;
        }

        if !self.config.allow_private {
            if let Ok(ip) = host.parse::<IpAddr>() {
                if is_private(&ip) {
                    return Err(ProxyError::TargetRefused(format!(
                        "private target {host} not allowed"
                    )));
                }
            }
        }

        let maddr = external_multiaddr(host, port)?;
        let circuit = self.build_circuit(true).await?;
        Ok(circuit.external(&maddr).await?)
    }

    async fn connect_hidden(&self, address: cid::Cid) -> Result<BoxConduit, ProxyError> {
        let mut circuit = self.build_circuit(false).await?;

        let mut candidates = circuit.hidden_dht(address).await?;
        candidates.shuffle(&mut rand::thread_rng());
        let candidate = candidates
            .first()
            .ok_or_else(|| ProxyError::NotFound(address.to_string()))?;

        // The hosting relay must be the tail to serve the dial.
        circuit.extend(candidate.peer_id).await?;

        let connection = circuit.dial(address).await?;
        let stream = connection.open().await?;
        Ok(boxed(HiddenStream {
            stream,
            _connection: connection,
        }))
    }

    async fn build_circuit(
        &self,
        exit_tail: bool,
    ) -> Result<onionp2p_onion::Circuit, ProxyError> {
        let candidates = self.database.circuit(&CircuitSpec {
            ignore: HashSet::new(),
            length: self.config.circuit_length,
            last_is_exit: exit_tail,
        })?;

        debug!("constructing circuit through {candidates:?}");
        Ok(self.onion.circuit(&candidates).await?)
    }
}

/// A hidden-service stream that keeps its parent session alive: dropping
/// the session would close the stream beneath us.
struct HiddenStream {
    stream: BoxConduit,
    _connection: HiddenConnection,
}

impl AsyncRead for HiddenStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for HiddenStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_close(cx)
    }
}

/// Read the request head and parse a `CONNECT host:port` line.
async fn read_connect_request(client: &mut TcpStream) -> Result<(String, u16), ProxyError> {
    const MAX_HEAD: usize = 8 * 1024;

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(ProxyError::BadRequest("request head too large".to_string()));
        }
        let n = client.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::BadRequest("client closed early".to_string()));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8(head)
        .map_err(|_| ProxyError::BadRequest("request head not utf-8".to_string()))?;
    let request_line = head
        .lines()
        .next()
        .ok_or_else(|| ProxyError::BadRequest("empty request".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    if method != "CONNECT" {
        return Err(ProxyError::BadRequest(format!(
            "method {method} not supported, CONNECT only"
        )));
    }

    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::BadRequest(format!("bad target: {target}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::BadRequest(format!("bad port in target: {target}")))?;

    Ok((host.trim_matches(['[', ']']).to_string(), port))
}

async fn respond(client: &mut TcpStream, status: &str) -> Result<(), ProxyError> {
    use tokio::io::AsyncWriteExt as _;
    client
        .write_all(format!("HTTP/1.1 {status}\r\n\r\n").as_bytes())
        .await?;
    Ok(())
}

fn external_multiaddr(host: &str, port: u16) -> Result<Multiaddr, ProxyError> {
    let maddr = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => format!("/ip4/{ip}/tcp/{port}"),
        Ok(IpAddr::V6(ip)) => format!("/ip6/{ip}/tcp/{port}"),
        Err(_) => format!("/dns4/{host}/tcp/{port}"),
    };
    maddr
        .parse()
        .map_err(|_| ProxyError::BadRequest(format!("bad target host: {host}")))
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_multiaddr_forms() {
        assert_eq!(
            external_multiaddr("93.184.216.34", 80).unwrap().to_string(),
            "/ip4/93.184.216.34/tcp/80"
        );
        assert_eq!(
            external_multiaddr("example.com", 443).unwrap().to_string(),
            "/dns4/example.com/tcp/443"
        );
        assert_eq!(
            external_multiaddr("::1", 8080).unwrap().to_string(),
            "/ip6/::1/tcp/8080"
        );
    }

    #[test]
    fn test_is_private() {
        assert!(is_private(&"127.0.0.1".parse().unwrap()));
        assert!(is_private(&"10.1.2.3".parse().unwrap()));
        assert!(is_private(&"192.168.0.1".parse().unwrap()));
        assert!(!is_private(&"93.184.216.34".parse().unwrap()));
    }
}
