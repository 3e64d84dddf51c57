//! # nodeboot - Node Repository and Network Bootstrap
//!
//! nodeboot takes a node from an on-disk repository (possibly empty) to a
//! live libp2p host connected to a minimum quorum of peers:
//!
//! - **Repository**: idempotent creation of `<repo>/config` holding the node
//!   identity and settings
//! - **Host**: TCP/QUIC swarm with Noise/Yamux, connection watermarks,
//!   AutoNAT, AutoRelay and DCUtR hole punching
//! - **Bootstrap**: Kademlia routing table seeded by dialing config and
//!   built-in seed peers until a threshold of live connections is met
//!
//! ## Architecture
//!
//! The host uses the **Actor Pattern**: a single task owns the libp2p swarm
//! and every other component talks to it through a cloneable [`Host`] handle.
//! The pipeline itself is sequential; only the per-peer dials of a bootstrap
//! round run concurrently.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | `create` / `create_with` startup pipeline |
//! | `repo` | Repository directory, writability probe, config I/O |
//! | `config` | Serde model of the config file |
//! | `identity` | Ed25519 keypairs, peer ids, key protection |
//! | `seeds` | Built-in seed peers and peer-set merging |
//! | `connmgr` | Low/high watermark connection trimming |
//! | `host` | Swarm construction and the host actor |
//! | `behaviour` | Composed libp2p network behaviour |
//! | `routing` | Record store, routing table, routed host |
//! | `bootstrap` | Quorum-driven dial rounds and maintenance |
//! | `protocols` | Trait seams (`Dialer`) |
//! | `error` | Error taxonomy per pipeline stage |

mod behaviour;
mod bootstrap;
mod config;
mod connmgr;
mod error;
mod host;
mod identity;
mod node;
mod protocols;
pub mod repo;
mod routing;
pub mod seeds;

pub use bootstrap::{
    BootstrapCoordinator, BootstrapOutcome, BootstrapPolicy, DEFAULT_BOOTSTRAP_PERIOD,
    DEFAULT_CONNECTION_TIMEOUT, DEFAULT_MIN_PEER_THRESHOLD, bootstrap,
};
pub use config::{Addresses, CONFIG_FILENAME, ConnMgrConfig, NodeSettings, RepositoryConfig, SwarmConfig};
pub use connmgr::{ConnectionLimits, DEFAULT_GRACE_PERIOD, DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER};
pub use error::{
    BootstrapError, ConfigError, DialFailure, Error, HostError, IdentityError, InitError, RepoError,
};
pub use host::{BOOTSTRAP_PROTECTION_TAG, DEFAULT_LISTEN_ADDRS, Host, HostOptions, NatStatus, build_host};
pub use identity::{IdentityRecord, KeyAlgorithm, KeyProtector, Keypair, Unprotected};
pub use node::{NodeOptions, create, create_with};
pub use protocols::Dialer;
pub use routing::{Datastore, RoutedHost, RoutingTable};
pub use seeds::BootstrapPeer;
