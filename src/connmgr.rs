//! # Connection Manager
//!
//! Watermark-based connection trimming, owned by the host actor.
//!
//! The host may hold up to `high` simultaneous connections. Once that is
//! exceeded, the manager picks connections to close until `low` remain,
//! never touching:
//!
//! - connections younger than the grace period,
//! - connections to protected peers (e.g. bootstrap peers).
//!
//! The manager only decides; the host actor is the only component that
//! actually closes connections.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use libp2p::PeerId;
use libp2p::swarm::ConnectionId;

use crate::error::ConfigError;

pub const DEFAULT_LOW_WATER: usize = 10;
pub const DEFAULT_HIGH_WATER: usize = 100;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(20);

/// Minimum spacing between two trims, so a burst of inbound connections
/// does not trigger a trim per connection.
pub const TRIM_SILENCE_PERIOD: Duration = Duration::from_secs(10);

/// Low/high watermark pair governing simultaneous connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub low: usize,
    pub high: usize,
    pub grace_period: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_WATER,
            high: DEFAULT_HIGH_WATER,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl ConnectionLimits {
    pub fn new(low: usize, high: usize, grace_period: Duration) -> Result<Self, ConfigError> {
        if high == 0 || low > high {
            return Err(ConfigError::InvalidConnectionLimits { low, high });
        }
        Ok(Self { low, high, grace_period })
    }
}

#[derive(Debug)]
struct TrackedConnection {
    peer: PeerId,
    opened: Instant,
}

#[derive(Debug)]
pub(crate) struct ConnManager {
    limits: ConnectionLimits,
    connections: HashMap<ConnectionId, TrackedConnection>,
    protected: HashMap<PeerId, HashSet<String>>,
    last_trim: Option<Instant>,
}

impl ConnManager {
    pub(crate) fn new(limits: ConnectionLimits) -> Self {
        Self {
            limits,
            connections: HashMap::new(),
            protected: HashMap::new(),
            last_trim: None,
        }
    }

    pub(crate) fn connected(&mut self, peer: PeerId, id: ConnectionId, now: Instant) {
        self.connections.insert(id, TrackedConnection { peer, opened: now });
    }

    /// Forget a connection. Unknown ids (already trimmed) are ignored.
    pub(crate) fn disconnected(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn is_over_capacity(&self) -> bool {
        self.connections.len() > self.limits.high
    }

    pub(crate) fn protect(&mut self, peer: PeerId, tag: &str) {
        self.protected.entry(peer).or_default().insert(tag.to_string());
    }

    /// Remove one protection tag. Returns whether the peer is still protected.
    pub(crate) fn unprotect(&mut self, peer: &PeerId, tag: &str) -> bool {
        let Some(tags) = self.protected.get_mut(peer) else {
            return false;
        };
        tags.remove(tag);
        if tags.is_empty() {
            self.protected.remove(peer);
            return false;
        }
        true
    }

    pub(crate) fn is_protected(&self, peer: &PeerId) -> bool {
        self.protected.contains_key(peer)
    }

    /// Pick connections to close, youngest eligible first, until `low` remain.
    ///
    /// Returned connections are no longer tracked; their close events are
    /// ignored by [`disconnected`](Self::disconnected).
    pub(crate) fn trim(&mut self, now: Instant) -> Vec<ConnectionId> {
        if !self.is_over_capacity() {
            return Vec::new();
        }
        if let Some(last) = self.last_trim
            && now.saturating_duration_since(last) < TRIM_SILENCE_PERIOD
        {
            return Vec::new();
        }
        self.last_trim = Some(now);

        let mut candidates: Vec<(ConnectionId, Instant)> = self
            .connections
            .iter()
            .filter(|(_, conn)| !self.is_protected(&conn.peer))
            .filter(|(_, conn)| now.saturating_duration_since(conn.opened) >= self.limits.grace_period)
            .map(|(id, conn)| (*id, conn.opened))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let excess = self.connections.len().saturating_sub(self.limits.low);
        let victims: Vec<ConnectionId> = candidates
            .into_iter()
            .take(excess)
            .map(|(id, _)| id)
            .collect();

        for id in &victims {
            self.connections.remove(id);
        }
        victims
    }
}
