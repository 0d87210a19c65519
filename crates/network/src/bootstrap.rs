//! Bootstrap address helpers
//!
//! Bootstrap hosts are configured as `/ip4/<IP>/tcp/<PORT>/p2p/<PEER_ID>`
//! multiaddrs. Splitting off the trailing `/p2p` component yields the peer
//! identity and the address to dial it at.

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};

/// Well-known public bootstrap nodes (the libp2p/IPFS defaults), used when
/// a node opts into `bootstrap.defaults`.
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
];

/// Parse bootstrap nodes from a list of multiaddr strings, dropping
/// anything malformed.
pub fn parse_bootstrap_nodes(addrs: &[String]) -> Vec<(PeerId, Multiaddr)> {
    addrs
        .iter()
        .filter_map(|addr| parse_bootstrap_addr(addr))
        .collect()
}

/// Parse a single bootstrap address.
///
/// The address must end in `/p2p/<PEER_ID>`; what remains after popping
/// that component is the dialable part.
pub fn parse_bootstrap_addr(addr_str: &str) -> Option<(PeerId, Multiaddr)> {
    let mut addr: Multiaddr = addr_str.parse().ok()?;
    match addr.pop() {
        Some(Protocol::P2p(peer_id)) => Some((peer_id, addr)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bootstrap_addr() {
        let peer = PeerId::random();
        let raw = format!("/ip4/192.0.2.10/tcp/4001/p2p/{peer}");

        let (parsed, dial_addr) = parse_bootstrap_addr(&raw).unwrap();
        assert_eq!(parsed, peer);
        assert_eq!(dial_addr.to_string(), "/ip4/192.0.2.10/tcp/4001");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_bootstrap_addr("garbage").is_none());
        // No trailing /p2p component
        assert!(parse_bootstrap_addr("/ip4/192.0.2.10/tcp/4001").is_none());
        assert!(parse_bootstrap_addr("").is_none());
    }

    #[test]
    fn test_parse_bootstrap_nodes_drops_malformed() {
        let peer = PeerId::random();
        let addrs = vec![
            format!("/ip4/192.0.2.10/tcp/4001/p2p/{peer}"),
            "not-a-multiaddr".to_string(),
        ];

        let peers = parse_bootstrap_nodes(&addrs);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, peer);
    }

    #[test]
    fn test_default_bootstrap_nodes_parse() {
        // The shipped defaults must all be well-formed.
        let addrs: Vec<String> = DEFAULT_BOOTSTRAP_NODES
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(parse_bootstrap_nodes(&addrs).len(), DEFAULT_BOOTSTRAP_NODES.len());
    }
}
