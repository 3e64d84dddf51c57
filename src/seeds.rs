//! # Seed Peers
//!
//! Built-in bootstrap peers and the merge with operator-supplied ones.
//!
//! A bootstrap address is a full multiaddress ending in `/p2p/<peer-id>`.
//! Several addresses may name the same peer; [`parse_peers`] and
//! [`effective_peers`] fold them into one [`BootstrapPeer`] per peer id so the
//! coordinator dials each peer once and counts it once toward the quorum.

use std::collections::HashMap;
use std::str::FromStr;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use crate::error::ConfigError;

/// Bumped whenever [`SEED_PEERS`] changes.
pub const SEED_SET_VERSION: u32 = 1;

/// Public bootstrap peers every node falls back on.
pub const SEED_PEERS: &[&str] = &[
    "/ip4/34.224.40.105/udp/4001/quic-v1/p2p/12D3KooWEftKAarKSc1bhQfgn5aoW5UnaSqCr9UMhRoqhsBA6MmX",
    "/ip4/54.235.11.104/udp/4001/quic-v1/p2p/12D3KooWEHmZunko2dupAR9J3Ydo3yN8aW7oZWkAxv5zsNL7UPRH",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// A peer id plus every multiaddress known to reach it.
///
/// Addresses keep their `/p2p/<peer-id>` suffix, which is what `/dnsaddr`
/// resolution filters on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl BootstrapPeer {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    fn merge(&mut self, addrs: impl IntoIterator<Item = Multiaddr>) {
        for addr in addrs {
            if !self.addrs.contains(&addr) {
                self.addrs.push(addr);
            }
        }
    }
}

/// Parse one `.../p2p/<peer-id>` multiaddress.
pub fn parse_bootstrap_addr(addr: &str) -> Result<BootstrapPeer, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBootstrapAddr {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let multiaddr = Multiaddr::from_str(addr.trim()).map_err(|e| invalid(&e.to_string()))?;
    match multiaddr.iter().last() {
        Some(Protocol::P2p(peer_id)) => Ok(BootstrapPeer::new(peer_id, vec![multiaddr])),
        _ => Err(invalid("address must end in /p2p/<peer-id>")),
    }
}

/// Parse a list of bootstrap multiaddresses, merging entries that share a
/// peer id. The first invalid entry fails the whole list.
pub fn parse_peers<I, S>(addrs: I) -> Result<Vec<BootstrapPeer>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let parsed = addrs
        .into_iter()
        .map(|addr| parse_bootstrap_addr(addr.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(dedupe(parsed))
}

/// The built-in seed set.
pub fn seed_peers() -> Vec<BootstrapPeer> {
    // SEED_PEERS is covered by `builtin_seeds_parse`; an entry that fails to
    // parse is skipped rather than taking the node down.
    let parsed = SEED_PEERS
        .iter()
        .filter_map(|addr| parse_bootstrap_addr(addr).ok())
        .collect();
    dedupe(parsed)
}

/// Union of user peers and seed peers, unique by peer id.
///
/// User peers come first; duplicates keep the position of their first
/// occurrence and gain the addresses of later ones.
pub fn effective_peers(user: &[BootstrapPeer], seeds: &[BootstrapPeer]) -> Vec<BootstrapPeer> {
    dedupe(user.iter().chain(seeds).cloned().collect())
}

fn dedupe(peers: Vec<BootstrapPeer>) -> Vec<BootstrapPeer> {
    let mut index: HashMap<PeerId, usize> = HashMap::with_capacity(peers.len());
    let mut out: Vec<BootstrapPeer> = Vec::with_capacity(peers.len());
    for peer in peers {
        match index.get(&peer.peer_id) {
            Some(&i) => out[i].merge(peer.addrs),
            None => {
                index.insert(peer.peer_id, out.len());
                out.push(peer);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn peer_addr(peer: &PeerId, port: u16) -> String {
        format!("/ip4/10.0.0.1/tcp/{port}/p2p/{peer}")
    }

    #[test]
    fn builtin_seeds_parse() {
        let seeds = seed_peers();
        assert_eq!(seeds.len(), SEED_PEERS.len());

        let ids: HashSet<_> = seeds.iter().map(|p| p.peer_id).collect();
        assert_eq!(ids.len(), SEED_PEERS.len(), "seed peer ids must be unique");
    }

    #[test]
    fn dnsaddr_seeds_keep_full_address() {
        let seeds = seed_peers();
        let dns = seeds
            .iter()
            .find(|p| p.peer_id.to_base58() == "QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN")
            .unwrap();
        assert_eq!(dns.addrs.len(), 1);
        assert!(dns.addrs[0].to_string().starts_with("/dnsaddr/bootstrap.libp2p.io/p2p/"));
    }

    #[test]
    fn address_without_peer_id_is_rejected() {
        let err = parse_bootstrap_addr("/ip4/127.0.0.1/tcp/4001").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBootstrapAddr { .. }));

        let err = parse_bootstrap_addr("not a multiaddr").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBootstrapAddr { .. }));
    }

    #[test]
    fn parse_merges_addresses_of_one_peer() {
        let peer = PeerId::random();
        let peers = parse_peers([peer_addr(&peer, 1), peer_addr(&peer, 2), peer_addr(&peer, 1)]).unwrap();

        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addrs.len(), 2);
    }

    #[test]
    fn parse_fails_on_first_invalid_entry() {
        let peer = PeerId::random();
        assert!(parse_peers([peer_addr(&peer, 1), "/ip4/1.2.3.4/tcp/1".to_string()]).is_err());
    }

    #[test]
    fn effective_set_is_unique_by_peer_id() {
        let shared = PeerId::random();
        let user = parse_peers([peer_addr(&shared, 1), peer_addr(&PeerId::random(), 2)]).unwrap();
        let seeds = parse_peers([peer_addr(&PeerId::random(), 3), peer_addr(&shared, 4)]).unwrap();

        let merged = effective_peers(&user, &seeds);

        assert_eq!(merged.len(), 3);
        let ids: HashSet<_> = merged.iter().map(|p| p.peer_id).collect();
        assert_eq!(ids.len(), merged.len());

        let shared_entry = merged.iter().find(|p| p.peer_id == shared).unwrap();
        assert_eq!(shared_entry.addrs.len(), 2);
    }

    #[test]
    fn effective_set_lists_user_peers_first() {
        let user = parse_peers([peer_addr(&PeerId::random(), 1)]).unwrap();
        let merged = effective_peers(&user, &seed_peers());

        assert_eq!(merged[0], user[0]);
        assert_eq!(merged.len(), SEED_PEERS.len() + 1);
    }

    #[test]
    fn empty_inputs_give_empty_set() {
        assert!(effective_peers(&[], &[]).is_empty());
    }
}
