//! # Network Host
//!
//! [`build_host`] turns a [`Keypair`] into a running libp2p swarm and returns a
//! [`Host`] handle to it.
//!
//! ## Architecture
//!
//! The swarm is owned by a `HostActor` task; [`Host`] is a cheap-to-clone
//! handle that talks to it over an mpsc channel (request/reply over oneshot).
//! The actor is the only place connections are opened or closed:
//!
//! - dial requests resolve when the swarm reports the connection established
//!   or failed,
//! - the connection manager is consulted on a timer and its victims closed,
//! - AutoNAT status changes drive relay reservations (AutoRelay),
//! - identify results feed a bounded address book and relay candidates.
//!
//! The actor stops on [`Host::close`] or once every handle is dropped.
//!
//! ## Transports
//!
//! TCP and QUIC, with `/dns*` resolution, Noise security and Yamux muxing on
//! TCP. The relay client transport is layered on top for `/p2p-circuit`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::ControlFlow;
use std::str::FromStr;
use std::time::{Duration, Instant};

use futures::StreamExt;
use libp2p::core::ConnectedPoint;
use libp2p::core::transport::ListenerId;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{Multiaddr, PeerId, Swarm, SwarmBuilder, autonat, identify, kad, noise, relay, tcp, yamux};
use tokio::sync::{mpsc, oneshot};
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, debug, info, trace, warn};

use crate::behaviour::{KAD_PROTOCOL, NodeBehaviour, NodeBehaviourEvent, RELAY_HOP_PROTOCOL};
use crate::connmgr::{ConnManager, ConnectionLimits};
use crate::error::{DialFailure, HostError};
use crate::identity::Keypair;
use crate::protocols::Dialer;
use crate::routing::Datastore;
use crate::seeds::BootstrapPeer;

/// Listen set used when the repository does not name one.
pub const DEFAULT_LISTEN_ADDRS: &[&str] = &[
    "/ip4/0.0.0.0/tcp/0",
    "/ip4/0.0.0.0/udp/0/quic-v1",
    "/ip6/::/tcp/0",
    "/ip6/::/udp/0/quic-v1",
];

/// How long [`build_host`] waits for listeners to report.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

const COMMAND_CHANNEL_CAPACITY: usize = 256;

const TRIM_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Circuit reservations held at once while private.
const MAX_RELAY_RESERVATIONS: usize = 2;

/// SECURITY: identify lets any peer push addresses at us; cap what we keep.
const MAX_ADDRESS_BOOK_PEERS: usize = 4096;
const MAX_ADDRS_PER_PEER: usize = 16;

/// Tag applied by [`Host::protect`] callers for bootstrap peers.
pub const BOOTSTRAP_PROTECTION_TAG: &str = "bootstrap";

#[derive(Clone, Debug)]
pub struct HostOptions {
    pub limits: ConnectionLimits,
    pub listen_addrs: Vec<Multiaddr>,
    pub idle_connection_timeout: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            limits: ConnectionLimits::default(),
            listen_addrs: DEFAULT_LISTEN_ADDRS
                .iter()
                .filter_map(|addr| Multiaddr::from_str(addr).ok())
                .collect(),
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
        }
    }
}

impl HostOptions {
    /// Loopback TCP only; for tests and local clusters.
    pub fn local_only() -> Self {
        Self {
            listen_addrs: vec![Multiaddr::from_str("/ip4/127.0.0.1/tcp/0").expect("static multiaddr")],
            ..Self::default()
        }
    }

    pub fn with_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_listen_addrs(mut self, listen_addrs: Vec<Multiaddr>) -> Self {
        self.listen_addrs = listen_addrs;
        self
    }
}

/// Reachability as seen through AutoNAT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NatStatus {
    Unknown,
    /// Dial-backs succeeded on this address.
    Public(Multiaddr),
    /// Not dialable; `relays` are the peers currently holding our reservations.
    Private { relays: Vec<PeerId> },
}

impl NatStatus {
    pub fn is_private(&self) -> bool {
        matches!(self, NatStatus::Private { .. })
    }
}

// ============================================================================
// Host Construction
// ============================================================================

/// Build the swarm, bind listeners and start the host actor.
///
/// Returns once every listener reported an address or a failure (bounded by
/// [`LISTEN_TIMEOUT`]). At least one listener must bind.
pub async fn build_host(keypair: &Keypair, options: &HostOptions) -> Result<Host, HostError> {
    if options.listen_addrs.is_empty() {
        return Err(HostError::NoListenAddrs);
    }

    let key = keypair.to_libp2p();
    let peer_id = key.public().to_peer_id();
    let datastore = Datastore::new(peer_id);
    let store = datastore.clone();

    let mut swarm = SwarmBuilder::with_existing_identity(key)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| HostError::Transport(e.to_string()))?
        .with_quic()
        .with_dns()
        .map_err(|e| HostError::Transport(e.to_string()))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| HostError::Transport(e.to_string()))?
        .with_behaviour(|key, relay_client| NodeBehaviour::new(key, relay_client, store))
        .map_err(|e| HostError::Behaviour(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(options.idle_connection_timeout))
        .build();

    let bound = bind_listeners(&mut swarm, &options.listen_addrs).await?;
    info!(
        peer_id = %peer_id,
        listen_addrs = ?bound,
        "host listening"
    );

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let actor = HostActor::new(swarm, options.limits, cmd_rx);
    tokio::spawn(actor.run().in_current_span().with_current_subscriber());

    Ok(Host {
        peer_id,
        limits: options.limits,
        datastore,
        cmd_tx,
    })
}

async fn bind_listeners(
    swarm: &mut Swarm<NodeBehaviour>,
    addrs: &[Multiaddr],
) -> Result<Vec<Multiaddr>, HostError> {
    let mut waiting: HashSet<ListenerId> = HashSet::new();
    for addr in addrs {
        match swarm.listen_on(addr.clone()) {
            Ok(id) => {
                waiting.insert(id);
            }
            Err(e) => warn!(addr = %addr, error = %e, "cannot listen"),
        }
    }

    let mut bound = Vec::new();
    let wait = async {
        while !waiting.is_empty() {
            match swarm.select_next_some().await {
                SwarmEvent::NewListenAddr { listener_id, address } => {
                    if waiting.remove(&listener_id) {
                        bound.push(address);
                    }
                }
                SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
                    if waiting.remove(&listener_id) {
                        warn!(?reason, "listener closed before binding");
                    }
                }
                SwarmEvent::ListenerError { listener_id, error } => {
                    if waiting.remove(&listener_id) {
                        warn!(error = %error, "listener failed before binding");
                    }
                }
                other => trace!(event = ?other, "ignoring event during listener setup"),
            }
        }
    };
    let timed_out = tokio::time::timeout(LISTEN_TIMEOUT, wait).await.is_err();

    if bound.is_empty() {
        if timed_out {
            return Err(HostError::ListenTimeout(LISTEN_TIMEOUT));
        }
        return Err(HostError::Listen {
            addrs: addrs.iter().map(|a| a.to_string()).collect(),
        });
    }
    if timed_out {
        warn!(pending = waiting.len(), "some listeners did not report in time");
    }
    Ok(bound)
}

// ============================================================================
// Host Handle
// ============================================================================

pub(crate) enum Command {
    ListenAddrs(oneshot::Sender<Vec<Multiaddr>>),
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
    IsConnected(PeerId, oneshot::Sender<bool>),
    Dial(BootstrapPeer, oneshot::Sender<Result<(), DialFailure>>),
    ReapDials,
    OutstandingDials(oneshot::Sender<usize>),
    AddAddresses(PeerId, Vec<Multiaddr>),
    KnownAddresses(PeerId, oneshot::Sender<Vec<Multiaddr>>),
    NatStatus(oneshot::Sender<NatStatus>),
    Protect(PeerId, String),
    Unprotect(PeerId, String),

    // Routing
    ActivateRouting(oneshot::Sender<()>),
    AddRoutingAddresses(PeerId, Vec<Multiaddr>),
    BootstrapRouting(oneshot::Sender<Result<(), HostError>>),
    FindClosest(PeerId, oneshot::Sender<Vec<Multiaddr>>),
    RoutingTableSize(oneshot::Sender<usize>),

    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running host. Clones share the same swarm.
#[derive(Clone)]
pub struct Host {
    peer_id: PeerId,
    limits: ConnectionLimits,
    datastore: Datastore,
    cmd_tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("peer_id", &self.peer_id)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// Record store shared with the Kademlia behaviour.
    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    /// Send a request and wait for the actor's reply.
    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HostError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Closed)
    }

    pub(crate) async fn send(&self, command: Command) -> Result<(), HostError> {
        self.cmd_tx.send(command).await.map_err(|_| HostError::Closed)
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, HostError> {
        self.request(Command::ListenAddrs).await
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, HostError> {
        self.request(Command::ConnectedPeers).await
    }

    pub async fn is_connected(&self, peer: &PeerId) -> Result<bool, HostError> {
        let peer = *peer;
        self.request(|tx| Command::IsConnected(peer, tx)).await
    }

    /// Open a connection to `peer`, resolving once it is established.
    ///
    /// Succeeds immediately when a connection already exists. No timeout is
    /// applied here; callers bound the wait.
    ///
    /// Dropping the returned future before it resolves aborts the underlying
    /// dial; a connection that lands afterwards is closed again.
    pub async fn dial(&self, peer: &BootstrapPeer) -> Result<(), DialFailure> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Dial(peer.clone(), tx)).await.is_err() {
            return Err(DialFailure::HostClosed);
        }
        let guard = ReapOnDrop {
            cmd_tx: Some(&self.cmd_tx),
        };
        let result = rx.await.unwrap_or(Err(DialFailure::HostClosed));
        guard.disarm();
        result
    }

    /// Dials the actor has started that have neither connected nor failed,
    /// including abandoned ones still being torn down.
    pub async fn outstanding_dials(&self) -> Result<usize, HostError> {
        self.request(Command::OutstandingDials).await
    }

    /// Remember addresses for `peer` without dialing.
    pub async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), HostError> {
        self.send(Command::AddAddresses(peer, addrs)).await
    }

    /// Addresses in the local address book, without any `/p2p` suffix.
    pub async fn known_addresses(&self, peer: &PeerId) -> Result<Vec<Multiaddr>, HostError> {
        let peer = *peer;
        self.request(|tx| Command::KnownAddresses(peer, tx)).await
    }

    pub async fn nat_status(&self) -> Result<NatStatus, HostError> {
        self.request(Command::NatStatus).await
    }

    /// Exempt `peer` from connection trimming until every tag is removed.
    pub async fn protect(&self, peer: PeerId, tag: &str) -> Result<(), HostError> {
        self.send(Command::Protect(peer, tag.to_string())).await
    }

    pub async fn unprotect(&self, peer: PeerId, tag: &str) -> Result<(), HostError> {
        self.send(Command::Unprotect(peer, tag.to_string())).await
    }

    /// Stop the actor, closing all listeners and connections.
    ///
    /// Calling it on an already closed host is a no-op.
    pub async fn close(&self) {
        if self.request(Command::Shutdown).await.is_err() {
            trace!(peer_id = %self.peer_id, "host already closed");
        }
    }
}

/// Asks the actor to reap dials whose caller went away.
struct ReapOnDrop<'a> {
    cmd_tx: Option<&'a mpsc::Sender<Command>>,
}

impl ReapOnDrop<'_> {
    fn disarm(mut self) {
        self.cmd_tx = None;
    }
}

impl Drop for ReapOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(cmd_tx) = self.cmd_tx {
            // A full queue is fine: the trim tick reaps as well.
            let _ = cmd_tx.try_send(Command::ReapDials);
        }
    }
}

#[async_trait::async_trait]
impl Dialer for Host {
    async fn dial(&self, peer: &BootstrapPeer) -> Result<(), DialFailure> {
        Host::dial(self, peer).await
    }

    async fn is_live(&self, peer: &PeerId) -> bool {
        self.is_connected(peer).await.unwrap_or(false)
    }
}

// ============================================================================
// Address Book
// ============================================================================

/// Bounded per-peer address cache, evicting the oldest peer when full.
#[derive(Debug, Default)]
struct AddressBook {
    addrs: HashMap<PeerId, Vec<Multiaddr>>,
    order: VecDeque<PeerId>,
}

impl AddressBook {
    fn add(&mut self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) {
        if !self.addrs.contains_key(&peer) {
            if self.order.len() >= MAX_ADDRESS_BOOK_PEERS
                && let Some(oldest) = self.order.pop_front()
            {
                self.addrs.remove(&oldest);
            }
            self.order.push_back(peer);
        }
        let entry = self.addrs.entry(peer).or_default();
        for addr in addrs {
            let addr = without_peer_id(addr);
            if addr.is_empty() || entry.contains(&addr) {
                continue;
            }
            if entry.len() >= MAX_ADDRS_PER_PEER {
                break;
            }
            entry.push(addr);
        }
    }

    fn get(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.addrs.get(peer).cloned().unwrap_or_default()
    }
}

fn without_peer_id(mut addr: Multiaddr) -> Multiaddr {
    if let Some(Protocol::P2p(_)) = addr.iter().last() {
        addr.pop();
    }
    addr
}

// ============================================================================
// Host Actor
// ============================================================================

struct HostActor {
    swarm: Swarm<NodeBehaviour>,
    connmgr: ConnManager,
    cmd_rx: mpsc::Receiver<Command>,
    address_book: AddressBook,
    pending_dials: HashMap<ConnectionId, (PeerId, oneshot::Sender<Result<(), DialFailure>>)>,
    /// Dials whose caller is gone but whose libp2p attempt has not ended yet.
    abandoned_dials: HashSet<ConnectionId>,
    pending_lookups: HashMap<kad::QueryId, (PeerId, oneshot::Sender<Vec<Multiaddr>>)>,
    routing_active: bool,
    relay_candidates: HashSet<PeerId>,
    relay_listeners: HashMap<PeerId, ListenerId>,
}

impl HostActor {
    fn new(swarm: Swarm<NodeBehaviour>, limits: ConnectionLimits, cmd_rx: mpsc::Receiver<Command>) -> Self {
        Self {
            swarm,
            connmgr: ConnManager::new(limits),
            cmd_rx,
            address_book: AddressBook::default(),
            pending_dials: HashMap::new(),
            abandoned_dials: HashSet::new(),
            pending_lookups: HashMap::new(),
            routing_active: false,
            relay_candidates: HashSet::new(),
            relay_listeners: HashMap::new(),
        }
    }

    async fn run(mut self) {
        let mut trim_interval = tokio::time::interval(TRIM_CHECK_INTERVAL);
        trim_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let ControlFlow::Break(reply) = self.handle_command(cmd) {
                        shutdown_reply = Some(reply);
                        break;
                    }
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                _ = trim_interval.tick() => {
                    self.reap_dials();
                    self.trim_connections();
                }
            }
        }

        let peer_id = *self.swarm.local_peer_id();
        for (_, (_, reply)) in self.pending_dials.drain() {
            let _ = reply.send(Err(DialFailure::HostClosed));
        }
        drop(self.swarm);
        info!(peer_id = %peer_id, "host stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Returns `Break` with the reply channel on shutdown.
    fn handle_command(&mut self, cmd: Command) -> ControlFlow<oneshot::Sender<()>> {
        match cmd {
            Command::ListenAddrs(reply) => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            Command::ConnectedPeers(reply) => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
            Command::IsConnected(peer, reply) => {
                let _ = reply.send(self.swarm.is_connected(&peer));
            }
            Command::Dial(peer, reply) => self.handle_dial(peer, reply),
            Command::ReapDials => self.reap_dials(),
            Command::OutstandingDials(reply) => {
                let _ = reply.send(self.pending_dials.len() + self.abandoned_dials.len());
            }
            Command::AddAddresses(peer, addrs) => {
                self.address_book.add(peer, addrs);
            }
            Command::KnownAddresses(peer, reply) => {
                let _ = reply.send(self.address_book.get(&peer));
            }
            Command::NatStatus(reply) => {
                let _ = reply.send(self.nat_status());
            }
            Command::Protect(peer, tag) => {
                self.connmgr.protect(peer, &tag);
            }
            Command::Unprotect(peer, tag) => {
                self.connmgr.unprotect(&peer, &tag);
            }
            Command::ActivateRouting(reply) => {
                if !self.routing_active {
                    self.routing_active = true;
                    self.swarm.behaviour_mut().kad.set_mode(None);
                    debug!("kademlia routing activated");
                }
                let _ = reply.send(());
            }
            Command::AddRoutingAddresses(peer, addrs) => {
                for addr in addrs {
                    let addr = without_peer_id(addr);
                    self.swarm.behaviour_mut().kad.add_address(&peer, addr);
                }
            }
            Command::BootstrapRouting(reply) => {
                let result = match self.swarm.behaviour_mut().kad.bootstrap() {
                    Ok(query) => {
                        debug!(?query, "kademlia bootstrap started");
                        Ok(())
                    }
                    Err(_) => Err(HostError::NoRoutingPeers),
                };
                let _ = reply.send(result);
            }
            Command::FindClosest(peer, reply) => {
                let in_table = self.swarm.behaviour_mut().kad.kbuckets().find_map(|bucket| {
                    bucket
                        .iter()
                        .find(|entry| entry.node.key.preimage() == &peer)
                        .map(|entry| entry.node.value.iter().cloned().collect::<Vec<_>>())
                });
                if let Some(addrs) = in_table {
                    let _ = reply.send(addrs);
                    return ControlFlow::Continue(());
                }
                let query = self.swarm.behaviour_mut().kad.get_closest_peers(peer);
                self.pending_lookups.insert(query, (peer, reply));
            }
            Command::RoutingTableSize(reply) => {
                let size = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .kbuckets()
                    .map(|bucket| bucket.num_entries())
                    .sum();
                let _ = reply.send(size);
            }
            Command::Shutdown(reply) => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    fn handle_dial(&mut self, peer: BootstrapPeer, reply: oneshot::Sender<Result<(), DialFailure>>) {
        if self.swarm.is_connected(&peer.peer_id) {
            let _ = reply.send(Ok(()));
            return;
        }
        self.address_book.add(peer.peer_id, peer.addrs.iter().cloned());

        let opts = DialOpts::peer_id(peer.peer_id)
            .condition(PeerCondition::Always)
            .addresses(peer.addrs)
            .build();
        let connection_id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(connection_id, (peer.peer_id, reply));
            }
            Err(e) => {
                debug!(peer = %peer.peer_id, error = %e, "dial rejected");
                let _ = reply.send(Err(DialFailure::Transport(e.to_string())));
            }
        }
    }

    /// Abort dials nobody waits for any more.
    fn reap_dials(&mut self) {
        let abandoned: Vec<ConnectionId> = self
            .pending_dials
            .iter()
            .filter(|(_, (_, reply))| reply.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in abandoned {
            let Some((peer, _)) = self.pending_dials.remove(&id) else {
                continue;
            };
            self.abandoned_dials.insert(id);
            let still_wanted = self.pending_dials.values().any(|(p, _)| *p == peer);
            if !still_wanted && !self.swarm.is_connected(&peer) {
                debug!(peer = %peer, "aborting abandoned dial");
                // Aborts every pending connection to `peer`.
                let _ = self.swarm.disconnect_peer_id(peer);
            }
        }
    }

    fn nat_status(&self) -> NatStatus {
        match self.swarm.behaviour().autonat.nat_status() {
            autonat::NatStatus::Public(addr) => NatStatus::Public(addr),
            autonat::NatStatus::Private => NatStatus::Private {
                relays: self.relay_listeners.keys().copied().collect(),
            },
            autonat::NatStatus::Unknown => NatStatus::Unknown,
        }
    }

    fn trim_connections(&mut self) {
        let victims = self.connmgr.trim(Instant::now());
        if victims.is_empty() {
            return;
        }
        debug!(count = victims.len(), remaining = self.connmgr.len(), "trimming connections");
        for id in victims {
            self.swarm.close_connection(id);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                self.connmgr.connected(peer_id, connection_id, Instant::now());
                if let ConnectedPoint::Dialer { address, .. } = &endpoint {
                    self.address_book.add(peer_id, [address.clone()]);
                }
                let abandoned = match self.pending_dials.remove(&connection_id) {
                    Some((_, reply)) => reply.send(Ok(())).is_err(),
                    None => self.abandoned_dials.remove(&connection_id),
                };
                if abandoned {
                    debug!(peer = %peer_id, "closing connection of abandoned dial");
                    self.swarm.close_connection(connection_id);
                } else if matches!(endpoint, ConnectedPoint::Dialer { .. }) {
                    debug!(peer = %peer_id, "dial succeeded");
                }
                if self.connmgr.is_over_capacity() {
                    self.trim_connections();
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                if let Some((peer, reply)) = self.pending_dials.remove(&connection_id) {
                    debug!(peer = %peer, error = %error, "dial failed");
                    let _ = reply.send(Err(DialFailure::Transport(error.to_string())));
                } else if self.abandoned_dials.remove(&connection_id) {
                    trace!(peer = ?peer_id, "abandoned dial ended");
                } else {
                    trace!(peer = ?peer_id, error = %error, "outgoing connection failed");
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                num_established,
                ..
            } => {
                self.connmgr.disconnected(connection_id);
                if num_established == 0 {
                    self.relay_candidates.remove(&peer_id);
                    if let Some(listener) = self.relay_listeners.remove(&peer_id) {
                        info!(relay = %peer_id, "relay disconnected, dropping reservation");
                        self.swarm.remove_listener(listener);
                        self.reserve_relays();
                    }
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "listening");
            }
            SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
                self.relay_listeners.retain(|_, id| *id != listener_id);
                debug!(?reason, "listener closed");
            }
            SwarmEvent::ExternalAddrConfirmed { address } => {
                info!(addr = %address, "external address confirmed");
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            other => trace!(event = ?other, "swarm event"),
        }
    }

    fn handle_behaviour_event(&mut self, event: NodeBehaviourEvent) {
        match event {
            NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                self.handle_identify(peer_id, info);
            }
            NodeBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                info!(?old, ?new, "NAT status changed");
                match new {
                    autonat::NatStatus::Private => self.reserve_relays(),
                    autonat::NatStatus::Public(_) => self.release_relays(),
                    autonat::NatStatus::Unknown => {}
                }
            }
            NodeBehaviourEvent::RelayClient(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                renewal,
                ..
            }) => {
                if !renewal {
                    info!(relay = %relay_peer_id, "relay reservation accepted");
                }
            }
            NodeBehaviourEvent::Dcutr(event) => {
                match event.result {
                    Ok(_) => info!(peer = %event.remote_peer_id, "hole punch succeeded"),
                    Err(e) => debug!(peer = %event.remote_peer_id, error = %e, "hole punch failed"),
                }
            }
            NodeBehaviourEvent::Kad(event) => self.handle_kad_event(event),
            other => trace!(event = ?other, "behaviour event"),
        }
    }

    fn handle_identify(&mut self, peer: PeerId, info: identify::Info) {
        self.address_book.add(peer, info.listen_addrs.iter().cloned());

        let supports = |name: &str| info.protocols.iter().any(|p| p.as_ref() == name);
        if self.routing_active && supports(KAD_PROTOCOL.as_ref()) {
            for addr in &info.listen_addrs {
                self.swarm.behaviour_mut().kad.add_address(&peer, without_peer_id(addr.clone()));
            }
        }
        if supports(RELAY_HOP_PROTOCOL) && self.relay_candidates.insert(peer) {
            debug!(relay = %peer, "relay candidate discovered");
            if self.nat_status().is_private() {
                self.reserve_relays();
            }
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed { id, result, .. } => match result {
                kad::QueryResult::GetClosestPeers(result) => {
                    let Some((target, reply)) = self.pending_lookups.remove(&id) else {
                        return;
                    };
                    let peers = match result {
                        Ok(ok) => ok.peers,
                        Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
                    };
                    let found: Vec<Multiaddr> = peers
                        .into_iter()
                        .filter(|p| p.peer_id == target)
                        .flat_map(|p| p.addrs)
                        .collect();
                    self.address_book.add(target, found);
                    let _ = reply.send(self.address_book.get(&target));
                }
                kad::QueryResult::Bootstrap(Ok(ok)) => {
                    trace!(peer = %ok.peer, remaining = ?ok.num_remaining, "kademlia bootstrap step");
                }
                kad::QueryResult::Bootstrap(Err(e)) => {
                    debug!(error = %e, "kademlia bootstrap query failed");
                }
                other => trace!(result = ?other, "kademlia query progressed"),
            },
            kad::Event::RoutingUpdated { peer, addresses, .. } => {
                self.address_book.add(peer, addresses.into_vec());
            }
            kad::Event::RoutablePeer { peer, address } => {
                if self.routing_active {
                    self.swarm.behaviour_mut().kad.add_address(&peer, address);
                }
            }
            other => trace!(event = ?other, "kademlia event"),
        }
    }

    /// Listen through relay candidates until the reservation budget is used.
    fn reserve_relays(&mut self) {
        let candidates: Vec<PeerId> = self
            .relay_candidates
            .iter()
            .filter(|peer| !self.relay_listeners.contains_key(peer))
            .copied()
            .collect();

        for relay in candidates {
            if self.relay_listeners.len() >= MAX_RELAY_RESERVATIONS {
                break;
            }
            let base = self.address_book.get(&relay).into_iter().next().unwrap_or_else(Multiaddr::empty);
            let circuit = base.with(Protocol::P2p(relay)).with(Protocol::P2pCircuit);
            match self.swarm.listen_on(circuit.clone()) {
                Ok(listener) => {
                    info!(relay = %relay, addr = %circuit, "requesting relay reservation");
                    self.relay_listeners.insert(relay, listener);
                }
                Err(e) => debug!(relay = %relay, error = %e, "cannot listen via relay"),
            }
        }
    }

    fn release_relays(&mut self) {
        for (relay, listener) in self.relay_listeners.drain() {
            debug!(relay = %relay, "releasing relay reservation");
            self.swarm.remove_listener(listener);
        }
    }
}
