//! # Bootstrap
//!
//! Drives a freshly built host to a minimum number of live peer connections.
//!
//! ## Quorum Rule
//!
//! Every bootstrap peer is dialed in its own task (bounded by a semaphore,
//! each dial under its own timeout). The round ends as soon as one of:
//!
//! - live successes reach `min_peer_threshold` → success,
//! - live successes plus outstanding dials can no longer reach it → failure,
//! - the cancellation token fires → [`BootstrapError::Cancelled`].
//!
//! Outstanding dials are aborted and awaited before the round returns, so
//! nothing keeps dialing on behalf of a finished round. The result depends
//! only on how many dials succeed, not on their completion order.
//!
//! ## After Bootstrap
//!
//! [`bootstrap`] seeds the routing table with the connected peers, protects
//! them from connection trimming, kicks off a Kademlia bootstrap query and
//! starts a maintenance task that redials when the node drops below quorum.

use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, debug, info, warn};

use crate::connmgr::DEFAULT_HIGH_WATER;
use crate::error::{BootstrapError, DialFailure};
use crate::host::{BOOTSTRAP_PROTECTION_TAG, Host};
use crate::protocols::Dialer;
use crate::routing::{RoutedHost, RoutingTable};
use crate::seeds::BootstrapPeer;

pub const DEFAULT_MIN_PEER_THRESHOLD: usize = 2;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BOOTSTRAP_PERIOD: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPolicy {
    /// Live connections required before bootstrap counts as done.
    pub min_peer_threshold: usize,
    /// Upper bound on a single dial.
    pub connection_timeout: Duration,
    /// Dials in flight at once. Clamped to the host's high watermark.
    pub max_parallel_dials: usize,
    /// Interval of the maintenance check after bootstrap.
    pub period: Duration,
}

impl Default for BootstrapPolicy {
    fn default() -> Self {
        Self {
            min_peer_threshold: DEFAULT_MIN_PEER_THRESHOLD,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_parallel_dials: DEFAULT_HIGH_WATER,
            period: DEFAULT_BOOTSTRAP_PERIOD,
        }
    }
}

impl BootstrapPolicy {
    pub fn with_min_peer_threshold(mut self, threshold: usize) -> Self {
        self.min_peer_threshold = threshold;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_max_parallel_dials(mut self, max: usize) -> Self {
        self.max_parallel_dials = max;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }
}

/// Result of a successful dial round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapOutcome {
    /// Peers with a live connection when the round ended, in completion order.
    pub connected: Vec<PeerId>,
    /// Dials that had finished (either way) when the round ended.
    pub completed: usize,
}

/// Runs dial rounds against a set of bootstrap peers.
pub struct BootstrapCoordinator<D: Dialer> {
    dialer: Arc<D>,
    policy: BootstrapPolicy,
    in_flight_limit: usize,
}

impl<D: Dialer> BootstrapCoordinator<D> {
    pub fn new(dialer: Arc<D>, policy: BootstrapPolicy) -> Self {
        let in_flight_limit = policy.max_parallel_dials.max(1);
        Self {
            dialer,
            policy,
            in_flight_limit,
        }
    }

    /// Cap dials in flight at `limit` (e.g. the connection high watermark).
    pub fn with_in_flight_limit(mut self, limit: usize) -> Self {
        self.in_flight_limit = self.policy.max_parallel_dials.min(limit).max(1);
        self
    }

    pub fn policy(&self) -> &BootstrapPolicy {
        &self.policy
    }

    /// Dial `peers` until the threshold is met, cannot be met, or `cancel` fires.
    ///
    /// `peers` is expected to be unique by peer id.
    pub async fn connect(
        &self,
        peers: &[BootstrapPeer],
        cancel: &CancellationToken,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let required = self.policy.min_peer_threshold;
        if required == 0 {
            return Ok(BootstrapOutcome {
                connected: Vec::new(),
                completed: 0,
            });
        }
        if peers.len() < required {
            warn!(
                available = peers.len(),
                required,
                "not enough bootstrap peers to reach threshold"
            );
            return Err(BootstrapError::Unreachable {
                available: peers.len(),
                required,
            });
        }

        debug!(
            peers = peers.len(),
            required,
            in_flight = self.in_flight_limit,
            "starting bootstrap dial round"
        );

        let permits = Arc::new(Semaphore::new(self.in_flight_limit));
        let mut tasks = JoinSet::new();
        for peer in peers.iter().cloned() {
            let dialer = self.dialer.clone();
            let permits = permits.clone();
            let timeout = self.policy.connection_timeout;
            tasks.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return (peer.peer_id, Err(DialFailure::HostClosed));
                    };
                    let result = match tokio::time::timeout(timeout, dialer.dial(&peer)).await {
                        Ok(result) => result,
                        Err(_) => Err(DialFailure::Timeout),
                    };
                    (peer.peer_id, result)
                }
                .in_current_span()
                .with_current_subscriber(),
            );
        }

        let mut connected: Vec<PeerId> = Vec::new();
        let mut completed = 0usize;
        let result = loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break Err(BootstrapError::Cancelled {
                        achieved: connected.len(),
                        required,
                    });
                }
                joined = tasks.join_next() => joined,
            };

            match joined {
                None => {
                    break Err(BootstrapError::ThresholdNotMet {
                        achieved: connected.len(),
                        required,
                    });
                }
                Some(Ok((peer, Ok(())))) => {
                    completed += 1;
                    debug!(peer = %peer, "bootstrap peer connected");
                    connected.push(peer);
                }
                Some(Ok((peer, Err(e)))) => {
                    completed += 1;
                    debug!(peer = %peer, error = %e, "bootstrap dial failed");
                }
                Some(Err(e)) => {
                    completed += 1;
                    warn!(error = %e, "bootstrap dial task failed");
                }
            }

            if connected.len() >= required {
                let mut live = Vec::with_capacity(connected.len());
                for peer in connected.drain(..) {
                    if self.dialer.is_live(&peer).await {
                        live.push(peer);
                    } else {
                        debug!(peer = %peer, "bootstrap connection already gone");
                    }
                }
                connected = live;
            }

            if connected.len() >= required {
                break Ok(BootstrapOutcome {
                    connected: connected.clone(),
                    completed,
                });
            }
            if connected.len() + tasks.len() < required {
                break Err(BootstrapError::ThresholdNotMet {
                    achieved: connected.len(),
                    required,
                });
            }
        };

        tasks.shutdown().await;

        match &result {
            Ok(outcome) => info!(
                connected = outcome.connected.len(),
                required,
                "bootstrap threshold met"
            ),
            Err(e) => warn!(error = %e, "bootstrap round failed"),
        }
        result
    }
}

// ============================================================================
// Host Bootstrap
// ============================================================================

/// Bootstrap `host` against `peers` and hand back the routed host.
///
/// On failure the host is closed before the error is returned.
pub async fn bootstrap(
    host: Host,
    peers: Vec<BootstrapPeer>,
    policy: &BootstrapPolicy,
    cancel: &CancellationToken,
) -> Result<RoutedHost, BootstrapError> {
    match bootstrap_host(&host, &peers, policy, cancel).await {
        Ok(routing) => {
            let maintenance_cancel = cancel.child_token();
            let task = spawn_maintenance(
                host.clone(),
                routing.clone(),
                peers,
                policy.clone(),
                maintenance_cancel.clone(),
            );
            Ok(RoutedHost::wrap(host, routing).with_maintenance(maintenance_cancel, task))
        }
        Err(e) => {
            host.close().await;
            Err(e)
        }
    }
}

async fn bootstrap_host(
    host: &Host,
    peers: &[BootstrapPeer],
    policy: &BootstrapPolicy,
    cancel: &CancellationToken,
) -> Result<RoutingTable, BootstrapError> {
    let routing = RoutingTable::attach(host).await?;

    let coordinator =
        BootstrapCoordinator::new(Arc::new(host.clone()), policy.clone()).with_in_flight_limit(host.limits().high);
    let outcome = coordinator.connect(peers, cancel).await?;

    adopt_peers(host, &routing, peers, &outcome.connected).await?;

    if let Err(e) = routing.bootstrap().await {
        warn!(error = %e, "kademlia bootstrap not started");
    }
    Ok(routing)
}

/// Seed the routing table with connected bootstrap peers and protect them.
async fn adopt_peers(
    host: &Host,
    routing: &RoutingTable,
    peers: &[BootstrapPeer],
    connected: &[PeerId],
) -> Result<(), BootstrapError> {
    for peer in peers.iter().filter(|p| connected.contains(&p.peer_id)) {
        routing.add_peer(peer).await?;
        host.protect(peer.peer_id, BOOTSTRAP_PROTECTION_TAG).await?;
    }
    Ok(())
}

/// Every `policy.period`, redial bootstrap peers while below quorum.
fn spawn_maintenance(
    host: Host,
    routing: RoutingTable,
    peers: Vec<BootstrapPeer>,
    policy: BootstrapPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let task = async move {
        let mut interval = tokio::time::interval(policy.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Ok(connected) = host.connected_peers().await else {
                break;
            };
            let required = policy.min_peer_threshold;
            if connected.len() >= required {
                continue;
            }

            let missing: Vec<BootstrapPeer> = peers
                .iter()
                .filter(|p| !connected.contains(&p.peer_id))
                .cloned()
                .collect();
            let needed = required - connected.len();
            info!(
                connected = connected.len(),
                required,
                candidates = missing.len(),
                "below peer threshold, redialing bootstrap peers"
            );

            let round = BootstrapCoordinator::new(
                Arc::new(host.clone()),
                policy.clone().with_min_peer_threshold(needed),
            )
            .with_in_flight_limit(host.limits().high);
            match round.connect(&missing, &cancel).await {
                Ok(outcome) => {
                    if let Err(e) = adopt_peers(&host, &routing, &missing, &outcome.connected).await {
                        debug!(error = %e, "stopping bootstrap maintenance");
                        break;
                    }
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => debug!(error = %e, "maintenance round did not restore quorum"),
            }
        }
        debug!("bootstrap maintenance stopped");
    };
    tokio::spawn(task.in_current_span().with_current_subscriber())
}
