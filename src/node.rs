//! # Node Startup
//!
//! [`create`] runs the whole startup pipeline for one repository:
//!
//! ```text
//! Uninitialized ──► RepoReady ──► HostConstructed ──► Bootstrapping ──► Ready
//!       │               │                │                  │
//!       └───────────────┴────────────────┴──────────────────┴──► Failed
//! ```
//!
//! 1. initialize (or load) the repository and decode the identity,
//! 2. build the host with the config's listen addresses and connection limits,
//! 3. bootstrap against config peers merged with the seed set.
//!
//! ## Quick Start
//!
//! ```ignore
//! let cancel = CancellationToken::new();
//! let node = nodeboot::create(&cancel, Path::new("/var/lib/node")).await?;
//! println!("peer id: {}", node.peer_id());
//! node.close().await;
//! ```
//!
//! All log events are emitted inside a `node` span. [`NodeOptions::with_log`]
//! routes them (including those of the host actor and dial tasks) to a
//! specific subscriber instead of the global one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libp2p::Multiaddr;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, Span, info, info_span, warn};

use crate::bootstrap::{BootstrapPolicy, bootstrap};
use crate::error::Error;
use crate::host::{HostOptions, build_host};
use crate::identity::{KeyProtector, Unprotected};
use crate::repo;
use crate::routing::RoutedHost;
use crate::seeds::{self, BootstrapPeer};

/// Everything [`create_with`] can be told beyond the repository path.
#[derive(Clone)]
pub struct NodeOptions {
    pub root: PathBuf,
    /// Replaces the built-in seed set when set.
    pub seeds: Option<Vec<BootstrapPeer>>,
    /// Peers merged with the config's `Bootstrap` list, not persisted.
    pub extra_peers: Vec<BootstrapPeer>,
    pub policy: BootstrapPolicy,
    /// Overrides the config's `Addresses.Swarm` when set.
    pub listen_addrs: Option<Vec<Multiaddr>>,
    pub key_protector: Arc<dyn KeyProtector>,
    pub log: Option<Dispatch>,
}

impl NodeOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seeds: None,
            extra_peers: Vec::new(),
            policy: BootstrapPolicy::default(),
            listen_addrs: None,
            key_protector: Arc::new(Unprotected),
            log: None,
        }
    }

    pub fn with_seeds(mut self, seeds: Vec<BootstrapPeer>) -> Self {
        self.seeds = Some(seeds);
        self
    }

    pub fn with_extra_peers(mut self, peers: Vec<BootstrapPeer>) -> Self {
        self.extra_peers = peers;
        self
    }

    pub fn with_policy(mut self, policy: BootstrapPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_listen_addrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.listen_addrs = Some(addrs);
        self
    }

    pub fn with_key_protector(mut self, protector: Arc<dyn KeyProtector>) -> Self {
        self.key_protector = protector;
        self
    }

    pub fn with_log(mut self, dispatch: Dispatch) -> Self {
        self.log = Some(dispatch);
        self
    }
}

impl std::fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeOptions")
            .field("root", &self.root)
            .field("seeds", &self.seeds.as_ref().map(Vec::len))
            .field("extra_peers", &self.extra_peers.len())
            .field("policy", &self.policy)
            .field("listen_addrs", &self.listen_addrs)
            .finish_non_exhaustive()
    }
}

/// Start a node from `root` with default options.
pub async fn create(cancel: &CancellationToken, root: &Path) -> Result<RoutedHost, Error> {
    create_with(cancel, NodeOptions::new(root)).await
}

pub async fn create_with(cancel: &CancellationToken, mut options: NodeOptions) -> Result<RoutedHost, Error> {
    match options.log.take() {
        Some(dispatch) => {
            let span = tracing::dispatcher::with_default(&dispatch, || node_span(&options.root));
            run_pipeline(cancel, options)
                .instrument(span)
                .with_subscriber(dispatch)
                .await
        }
        None => {
            let span = node_span(&options.root);
            run_pipeline(cancel, options).instrument(span).await
        }
    }
}

fn node_span(root: &Path) -> Span {
    info_span!("node", root = %root.display())
}

async fn run_pipeline(cancel: &CancellationToken, options: NodeOptions) -> Result<RoutedHost, Error> {
    let mut state = StateTracker::new();
    let result = pipeline(cancel, options, &mut state).await;
    match &result {
        Ok(node) => {
            state.advance(NodeState::Ready);
            info!(peer_id = %node.peer_id(), "node ready");
        }
        Err(e) => {
            state.advance(NodeState::Failed);
            warn!(error = %e, "node startup failed");
        }
    }
    result
}

async fn pipeline(
    cancel: &CancellationToken,
    options: NodeOptions,
    state: &mut StateTracker,
) -> Result<RoutedHost, Error> {
    let protector = options.key_protector.as_ref();
    let config = repo::initialize_with(&options.root, protector)?;
    let keypair = config.identity.decode_private_key(protector)?;
    state.advance(NodeState::RepoReady);

    let mut user_peers = config.bootstrap_peers()?;
    user_peers.extend(options.extra_peers);
    let seed_set = options.seeds.unwrap_or_else(seeds::seed_peers);
    let peers = seeds::effective_peers(&user_peers, &seed_set);

    let host_options = HostOptions {
        limits: config.connection_limits()?,
        listen_addrs: match options.listen_addrs {
            Some(addrs) => addrs,
            None => config.listen_addrs()?,
        },
        ..HostOptions::default()
    };
    let host = build_host(&keypair, &host_options).await?;
    state.advance(NodeState::HostConstructed);
    info!(peer_id = %host.peer_id(), "host constructed");

    state.advance(NodeState::Bootstrapping);
    info!(peers = peers.len(), required = options.policy.min_peer_threshold, "bootstrapping");
    Ok(bootstrap(host, peers, &options.policy, cancel).await?)
}

// ============================================================================
// Node State
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeState {
    Uninitialized,
    RepoReady,
    HostConstructed,
    Bootstrapping,
    Ready,
    Failed,
}

impl NodeState {
    fn is_terminal(self) -> bool {
        matches!(self, NodeState::Ready | NodeState::Failed)
    }

    fn can_advance_to(self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Uninitialized, RepoReady)
            | (RepoReady, HostConstructed)
            | (HostConstructed, Bootstrapping)
            | (Bootstrapping, Ready) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// One-directional state log for a single startup.
#[derive(Debug)]
struct StateTracker {
    state: NodeState,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: NodeState::Uninitialized,
        }
    }

    fn advance(&mut self, next: NodeState) {
        if !self.state.can_advance_to(next) {
            warn!(from = ?self.state, to = ?next, "ignoring invalid node state transition");
            return;
        }
        info!(from = ?self.state, to = ?next, "node state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_allowed() {
        let mut tracker = StateTracker::new();
        for next in [
            NodeState::RepoReady,
            NodeState::HostConstructed,
            NodeState::Bootstrapping,
            NodeState::Ready,
        ] {
            tracker.advance(next);
            assert_eq!(tracker.state, next);
        }
    }

    #[test]
    fn transitions_never_go_backwards() {
        let mut tracker = StateTracker::new();
        tracker.advance(NodeState::RepoReady);
        tracker.advance(NodeState::Uninitialized);
        assert_eq!(tracker.state, NodeState::RepoReady);

        tracker.advance(NodeState::Bootstrapping);
        assert_eq!(tracker.state, NodeState::RepoReady, "states cannot be skipped");
    }

    #[test]
    fn failure_is_reachable_from_any_live_state() {
        for from in [
            NodeState::Uninitialized,
            NodeState::RepoReady,
            NodeState::HostConstructed,
            NodeState::Bootstrapping,
        ] {
            assert!(from.can_advance_to(NodeState::Failed));
        }
        assert!(!NodeState::Ready.can_advance_to(NodeState::Failed));
        assert!(!NodeState::Failed.can_advance_to(NodeState::Ready));
    }

    #[tokio::test]
    async fn invalid_bootstrap_entry_fails_before_host_is_built() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = repo::initialize(dir.path()).unwrap();
        config.bootstrap = vec!["/ip4/127.0.0.1/tcp/1".to_string()];
        repo::save(dir.path(), &config).unwrap();

        let err = create(&CancellationToken::new(), dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "unexpected error {err:?}");
    }

    #[tokio::test]
    async fn malformed_config_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(repo::config_path(dir.path()), b"{ not json").unwrap();

        let err = create(&CancellationToken::new(), dir.path()).await.unwrap_err();
        assert!(
            matches!(err, Error::Config(crate::error::ConfigError::Malformed { .. })),
            "unexpected error {err:?}"
        );
    }

    #[test]
    fn init_errors_surface_by_stage() {
        use crate::error::{ConfigError, IdentityError, InitError};

        let missing = InitError::Config(ConfigError::Missing { path: "x".into() });
        assert!(matches!(Error::from(missing), Error::Config(ConfigError::Missing { .. })));

        let identity = InitError::Identity(IdentityError::Encode("boom".into()));
        assert!(matches!(Error::from(identity), Error::Identity(_)));

        let write = InitError::Write {
            path: "x".into(),
            source: std::io::Error::other("disk full"),
        };
        assert!(matches!(Error::from(write), Error::Init(InitError::Write { .. })));
    }

    #[tokio::test]
    async fn empty_peer_set_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let options = NodeOptions::new(dir.path())
            .with_seeds(Vec::new())
            .with_listen_addrs(HostOptions::local_only().listen_addrs);

        let err = create_with(&CancellationToken::new(), options).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Bootstrap(crate::error::BootstrapError::Unreachable { available: 0, .. })
        ));
        assert!(repo::is_initialized(dir.path()), "repository is kept after a failed bootstrap");
    }
}
