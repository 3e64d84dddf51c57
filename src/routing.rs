//! # Routing
//!
//! - [`Datastore`]: the Kademlia record store, shared between the swarm and
//!   external readers behind a mutex.
//! - [`RoutingTable`]: handle over the host's Kademlia behaviour. Attaching it
//!   switches the behaviour from dormant client mode to active.
//! - [`RoutedHost`]: a [`Host`] plus its [`RoutingTable`], the artifact a
//!   successful bootstrap hands to the caller.

use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libp2p::kad::store::{MemoryStore, RecordStore};
use libp2p::kad::{ProviderRecord, Record, RecordKey};
use libp2p::{Multiaddr, PeerId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DialFailure, HostError};
use crate::host::{Command, Host};
use crate::seeds::BootstrapPeer;

// ============================================================================
// Datastore
// ============================================================================

/// Mutex-guarded in-memory record store.
///
/// Clones share the same store. Iterators returned through [`RecordStore`]
/// are snapshots, so no lock is held while the behaviour walks them.
#[derive(Clone)]
pub struct Datastore {
    inner: Arc<Mutex<MemoryStore>>,
}

impl Datastore {
    pub fn new(local_peer_id: PeerId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStore::new(local_peer_id))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_record(&self, key: &RecordKey) -> Option<Record> {
        self.lock().get(key).map(Cow::into_owned)
    }

    pub fn put_record(&self, record: Record) -> Result<(), libp2p::kad::store::Error> {
        self.lock().put(record)
    }

    pub fn len(&self) -> usize {
        self.lock().records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore").field("records", &self.len()).finish()
    }
}

impl RecordStore for Datastore {
    type RecordsIter<'a> = std::vec::IntoIter<Cow<'a, Record>>;
    type ProvidedIter<'a> = std::vec::IntoIter<Cow<'a, ProviderRecord>>;

    fn get(&self, k: &RecordKey) -> Option<Cow<'_, Record>> {
        self.get_record(k).map(Cow::Owned)
    }

    fn put(&mut self, r: Record) -> libp2p::kad::store::Result<()> {
        self.lock().put(r)
    }

    fn remove(&mut self, k: &RecordKey) {
        self.lock().remove(k);
    }

    fn records(&self) -> Self::RecordsIter<'_> {
        let records: Vec<_> = self.lock().records().map(|r| Cow::Owned(r.into_owned())).collect();
        records.into_iter()
    }

    fn add_provider(&mut self, record: ProviderRecord) -> libp2p::kad::store::Result<()> {
        self.lock().add_provider(record)
    }

    fn providers(&self, key: &RecordKey) -> Vec<ProviderRecord> {
        self.lock().providers(key)
    }

    fn provided(&self) -> Self::ProvidedIter<'_> {
        let provided: Vec<_> = self.lock().provided().map(|r| Cow::Owned(r.into_owned())).collect();
        provided.into_iter()
    }

    fn remove_provider(&mut self, k: &RecordKey, p: &PeerId) {
        self.lock().remove_provider(k, p);
    }
}

// ============================================================================
// Routing Table
// ============================================================================

/// Kademlia routing table of a host.
#[derive(Clone, Debug)]
pub struct RoutingTable {
    host: Host,
}

impl RoutingTable {
    /// Activate Kademlia on `host` and return a handle to it.
    pub async fn attach(host: &Host) -> Result<Self, HostError> {
        host.request(Command::ActivateRouting).await?;
        debug!(peer_id = %host.peer_id(), "routing table attached");
        Ok(Self { host: host.clone() })
    }

    pub async fn add_peer(&self, peer: &BootstrapPeer) -> Result<(), HostError> {
        self.host
            .send(Command::AddRoutingAddresses(peer.peer_id, peer.addrs.clone()))
            .await
    }

    /// Start a Kademlia bootstrap query. Fails if the table is empty.
    pub async fn bootstrap(&self) -> Result<(), HostError> {
        self.host.request(Command::BootstrapRouting).await?
    }

    /// Addresses of `peer` from the k-buckets, or from a closest-peers query
    /// when the table does not hold it.
    pub async fn find_peer(&self, peer: PeerId) -> Result<Vec<Multiaddr>, HostError> {
        self.host.request(|tx| Command::FindClosest(peer, tx)).await
    }

    /// Number of peers in the k-buckets.
    pub async fn size(&self) -> Result<usize, HostError> {
        self.host.request(Command::RoutingTableSize).await
    }

    pub fn datastore(&self) -> &Datastore {
        self.host.datastore()
    }
}

// ============================================================================
// Routed Host
// ============================================================================

/// A bootstrapped host with an active routing table.
///
/// Owns the background maintenance task; [`close`](Self::close) stops it
/// together with the host. Dropping a `RoutedHost` stops maintenance but
/// leaves other [`Host`] clones working.
#[derive(Debug)]
pub struct RoutedHost {
    host: Host,
    routing: RoutingTable,
    maintenance: Option<(CancellationToken, JoinHandle<()>)>,
}

impl RoutedHost {
    pub fn wrap(host: Host, routing: RoutingTable) -> Self {
        Self {
            host,
            routing,
            maintenance: None,
        }
    }

    pub(crate) fn with_maintenance(mut self, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        self.maintenance = Some((cancel, task));
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.peer_id()
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn datastore(&self) -> &Datastore {
        self.host.datastore()
    }

    /// Addresses for `peer`: address book first, then a routing query.
    pub async fn find_peer(&self, peer: PeerId) -> Result<Vec<Multiaddr>, HostError> {
        let known = self.host.known_addresses(&peer).await?;
        if !known.is_empty() {
            return Ok(known);
        }
        self.routing.find_peer(peer).await
    }

    /// Find `peer` and connect to it.
    pub async fn connect(&self, peer: PeerId) -> Result<(), DialFailure> {
        let addrs = match self.find_peer(peer).await {
            Ok(addrs) => addrs,
            Err(_) => return Err(DialFailure::HostClosed),
        };
        if addrs.is_empty() {
            return Err(DialFailure::Transport(format!("no known addresses for {peer}")));
        }
        self.host.dial(&BootstrapPeer::new(peer, addrs)).await
    }

    /// Stop maintenance and shut the host down.
    pub async fn close(mut self) {
        if let Some((cancel, task)) = self.maintenance.take() {
            cancel.cancel();
            let _ = task.await;
        }
        self.host.close().await;
    }
}

impl Drop for RoutedHost {
    fn drop(&mut self) {
        if let Some((cancel, _)) = &self.maintenance {
            cancel.cancel();
        }
    }
}
