//! # Repository Config
//!
//! Serde model of `<repo>/config`. Field names follow the IPFS/kubo layout
//! (PascalCase) so the file stays readable by existing tooling:
//!
//! ```json
//! {
//!   "Identity": { "PeerID": "12D3KooW...", "PrivKey": "CAESQ..." },
//!   "Bootstrap": ["/dnsaddr/bootstrap.libp2p.io/p2p/Qm..."],
//!   "Addresses": { "Swarm": ["/ip4/0.0.0.0/tcp/0"] },
//!   "Swarm": { "ConnMgr": { "LowWater": 10, "HighWater": 100, "GracePeriod": "20s" } },
//!   "Node": { "KeyAlgorithm": "ed25519" }
//! }
//! ```
//!
//! Everything except `Identity` has a default, so a config written by an
//! older version (or by hand) with only an identity still loads.

use std::str::FromStr;
use std::time::Duration;

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

use crate::connmgr::{ConnectionLimits, DEFAULT_GRACE_PERIOD, DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER};
use crate::error::{ConfigError, IdentityError};
use crate::host::DEFAULT_LISTEN_ADDRS;
use crate::identity::{IdentityRecord, KeyAlgorithm, KeyProtector};
use crate::seeds::{self, BootstrapPeer};

/// File name of the config inside the repository root.
pub const CONFIG_FILENAME: &str = "config";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RepositoryConfig {
    pub identity: IdentityRecord,

    /// Operator-supplied bootstrap peers, each ending in `/p2p/<peer-id>`.
    #[serde(default)]
    pub bootstrap: Vec<String>,

    #[serde(default)]
    pub addresses: Addresses,

    #[serde(default)]
    pub swarm: SwarmConfig,

    #[serde(default)]
    pub node: NodeSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Addresses {
    pub swarm: Vec<String>,
}

impl Default for Addresses {
    fn default() -> Self {
        Self {
            swarm: DEFAULT_LISTEN_ADDRS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(rename = "ConnMgr", default)]
    pub conn_mgr: ConnMgrConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnMgrConfig {
    pub low_water: usize,
    pub high_water: usize,
    /// Duration string such as `"20s"`.
    pub grace_period: String,
}

impl Default for ConnMgrConfig {
    fn default() -> Self {
        Self {
            low_water: DEFAULT_LOW_WATER,
            high_water: DEFAULT_HIGH_WATER,
            grace_period: format!("{}s", DEFAULT_GRACE_PERIOD.as_secs()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeSettings {
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,
}

impl RepositoryConfig {
    /// Default config around an existing identity.
    pub fn init_with_identity(identity: IdentityRecord) -> Self {
        Self {
            identity,
            bootstrap: Vec::new(),
            addresses: Addresses::default(),
            swarm: SwarmConfig::default(),
            node: NodeSettings::default(),
        }
    }

    /// Default config with a freshly generated identity.
    pub fn generate(protector: &dyn KeyProtector) -> Result<Self, IdentityError> {
        let algorithm = KeyAlgorithm::default();
        let mut config = Self::init_with_identity(IdentityRecord::generate(algorithm, protector)?);
        config.node.key_algorithm = algorithm;
        Ok(config)
    }

    pub fn bootstrap_peers(&self) -> Result<Vec<BootstrapPeer>, ConfigError> {
        seeds::parse_peers(&self.bootstrap)
    }

    pub fn listen_addrs(&self) -> Result<Vec<Multiaddr>, ConfigError> {
        self.addresses
            .swarm
            .iter()
            .map(|addr| {
                Multiaddr::from_str(addr).map_err(|e| ConfigError::InvalidListenAddr {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    pub fn connection_limits(&self) -> Result<ConnectionLimits, ConfigError> {
        let mgr = &self.swarm.conn_mgr;
        ConnectionLimits::new(mgr.low_water, mgr.high_water, parse_duration(&mgr.grace_period)?)
    }
}

/// Parse `"<n>ms"`, `"<n>s"`, `"<n>m"` or `"<n>h"`.
fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(value.to_string());
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (digits, unit) = value.split_at(split);
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n.checked_mul(60).ok_or_else(invalid)?)),
        "h" => Ok(Duration::from_secs(n.checked_mul(3600).ok_or_else(invalid)?)),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use libp2p::PeerId;

    use super::*;
    use crate::identity::Unprotected;

    fn config() -> RepositoryConfig {
        RepositoryConfig::generate(&Unprotected).unwrap()
    }

    #[test]
    fn default_config_uses_kubo_field_names() {
        let json = serde_json::to_value(config()).unwrap();

        assert!(json["Identity"]["PeerID"].is_string());
        assert!(json["Identity"]["PrivKey"].is_string());
        assert!(json["Bootstrap"].as_array().unwrap().is_empty());
        assert_eq!(json["Addresses"]["Swarm"].as_array().unwrap().len(), DEFAULT_LISTEN_ADDRS.len());
        assert_eq!(json["Swarm"]["ConnMgr"]["LowWater"], 10);
        assert_eq!(json["Swarm"]["ConnMgr"]["HighWater"], 100);
        assert_eq!(json["Swarm"]["ConnMgr"]["GracePeriod"], "20s");
        assert_eq!(json["Node"]["KeyAlgorithm"], "ed25519");
    }

    #[test]
    fn identity_only_config_loads_with_defaults() {
        let full = config();
        let json = serde_json::json!({
            "Identity": {
                "PeerID": full.identity.peer_id,
                "PrivKey": full.identity.private_key,
            }
        });

        let parsed: RepositoryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, RepositoryConfig::init_with_identity(full.identity));
    }

    #[test]
    fn missing_identity_is_malformed() {
        assert!(serde_json::from_str::<RepositoryConfig>(r#"{"Bootstrap": []}"#).is_err());
    }

    #[test]
    fn bootstrap_peers_are_parsed_and_merged() {
        let peer = PeerId::random();
        let mut config = config();
        config.bootstrap = vec![
            format!("/ip4/10.0.0.1/tcp/4001/p2p/{peer}"),
            format!("/ip4/10.0.0.1/udp/4001/quic-v1/p2p/{peer}"),
        ];

        let peers = config.bootstrap_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, peer);
        assert_eq!(peers[0].addrs.len(), 2);
    }

    #[test]
    fn invalid_bootstrap_entry_is_reported() {
        let mut config = config();
        config.bootstrap = vec!["/ip4/10.0.0.1/tcp/4001".to_string()];

        assert!(matches!(
            config.bootstrap_peers(),
            Err(ConfigError::InvalidBootstrapAddr { .. })
        ));
    }

    #[test]
    fn listen_addrs_round_trip_defaults() {
        let addrs = config().listen_addrs().unwrap();
        assert_eq!(addrs.len(), DEFAULT_LISTEN_ADDRS.len());

        let mut bad = config();
        bad.addresses.swarm.push("garbage".to_string());
        assert!(matches!(bad.listen_addrs(), Err(ConfigError::InvalidListenAddr { .. })));
    }

    #[test]
    fn connection_limits_from_config() {
        let mut config = config();
        assert_eq!(config.connection_limits().unwrap(), ConnectionLimits::default());

        config.swarm.conn_mgr.grace_period = "1m".to_string();
        assert_eq!(config.connection_limits().unwrap().grace_period, Duration::from_secs(60));

        config.swarm.conn_mgr.low_water = 500;
        assert!(matches!(
            config.connection_limits(),
            Err(ConfigError::InvalidConnectionLimits { .. })
        ));
    }

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("20s").unwrap(), Duration::from_secs(20));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("20").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(matches!(
            parse_duration("9999999999999999h"),
            Err(ConfigError::InvalidDuration(_))
        ));
        assert!(parse_duration("999999999999999999m").is_err());
    }
}
