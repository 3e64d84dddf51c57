//! Composed libp2p behaviour of the host swarm.
//!
//! | Field | Role |
//! |-------|------|
//! | `relay_client` | circuit reservations when AutoNAT reports us private |
//! | `autonat` | reachability probing, plus a rate-limited probe server |
//! | `dcutr` | hole punching over relayed connections |
//! | `identify` | learns listen addresses and protocols (relay discovery) |
//! | `ping` | keeps connections observed alive |
//! | `kad` | Kademlia, dormant until routing is activated |

use std::time::Duration;

use libp2p::swarm::NetworkBehaviour;
use libp2p::{StreamProtocol, autonat, dcutr, identify, identity, kad, ping, relay};

use crate::routing::Datastore;

pub(crate) const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/ipfs/kad/1.0.0");

pub(crate) const IDENTIFY_PROTOCOL_VERSION: &str = "/ipfs/0.1.0";

/// Protocol a peer must advertise to be used as a circuit relay.
pub(crate) const RELAY_HOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/hop";

const KAD_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// SECURITY: AutoNAT server budget. Dial-backs cost us outbound connections,
/// so probing is capped globally and per peer.
const AUTONAT_GLOBAL_PROBES: usize = 30;
const AUTONAT_PER_PEER_PROBES: usize = 3;
const AUTONAT_THROTTLE_PERIOD: Duration = Duration::from_secs(60);

#[derive(NetworkBehaviour)]
pub(crate) struct NodeBehaviour {
    pub(crate) relay_client: relay::client::Behaviour,
    pub(crate) autonat: autonat::Behaviour,
    pub(crate) dcutr: dcutr::Behaviour,
    pub(crate) identify: identify::Behaviour,
    pub(crate) ping: ping::Behaviour,
    pub(crate) kad: kad::Behaviour<Datastore>,
}

impl NodeBehaviour {
    pub(crate) fn new(key: &identity::Keypair, relay_client: relay::client::Behaviour, store: Datastore) -> Self {
        let peer_id = key.public().to_peer_id();

        let autonat = autonat::Behaviour::new(
            peer_id,
            autonat::Config {
                throttle_clients_global_max: AUTONAT_GLOBAL_PROBES,
                throttle_clients_peer_max: AUTONAT_PER_PEER_PROBES,
                throttle_clients_period: AUTONAT_THROTTLE_PERIOD,
                ..Default::default()
            },
        );

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL_VERSION.to_string(),
            key.public(),
        ));

        // Manual inserts keep the routing table empty until the coordinator
        // adds peers; client mode keeps us out of other peers' tables.
        let mut kad_config = kad::Config::new(KAD_PROTOCOL);
        kad_config.set_query_timeout(KAD_QUERY_TIMEOUT);
        kad_config.set_kbucket_inserts(kad::BucketInserts::Manual);
        let mut kad = kad::Behaviour::with_config(peer_id, store, kad_config);
        kad.set_mode(Some(kad::Mode::Client));

        Self {
            relay_client,
            autonat,
            dcutr: dcutr::Behaviour::new(peer_id),
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
            kad,
        }
    }
}
