//! # Error Taxonomy
//!
//! Each pipeline stage returns its own error type so callers can tell a
//! repository problem from a network one without string matching:
//!
//! | Stage | Error |
//! |-------|-------|
//! | writability probe | [`RepoError`] |
//! | repository initialization | [`InitError`] |
//! | config load / parse | [`ConfigError`] |
//! | key generation / decoding | [`IdentityError`] |
//! | host construction and handle calls | [`HostError`] |
//! | peer quorum | [`BootstrapError`] |
//!
//! [`Error`] is what [`crate::create`] surfaces. Nothing in the library aborts
//! the process; the binary decides what to do with a failed startup.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use libp2p::PeerId;
use thiserror::Error;

/// Top-level failure of the node startup pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// The repository could not be created or written.
    #[error("repository initialization failed")]
    Init(#[source] InitError),

    #[error("invalid repository config")]
    Config(#[from] ConfigError),

    #[error("node identity is unusable")]
    Identity(#[from] IdentityError),

    #[error("network host construction failed")]
    Host(#[from] HostError),

    #[error("bootstrap failed")]
    Bootstrap(#[from] BootstrapError),
}

/// Config and identity failures raised while initializing surface as their
/// own stage, not as [`Error::Init`].
impl From<InitError> for Error {
    fn from(err: InitError) -> Self {
        match err {
            InitError::Config(e) => Error::Config(e),
            InitError::Identity(e) => Error::Identity(e),
            other => Error::Init(other),
        }
    }
}

/// Outcome of probing a repository root for write access.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{} is not writeable by the current user", .path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unexpected error while checking writeability of {}", .path.display())]
    Unexpected {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to serialize config for {}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write config file {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file at {} (repository not initialized)", .path.display())]
    Missing { path: PathBuf },

    #[error("cannot read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("config file {} is malformed", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid bootstrap address '{addr}': {reason}")]
    InvalidBootstrapAddr { addr: String, reason: String },

    #[error("invalid listen address '{addr}': {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    #[error("invalid duration '{0}' (expected e.g. \"20s\", \"500ms\" or \"2m\")")]
    InvalidDuration(String),

    #[error("invalid connection limits: low water {low} must be <= high water {high} and high water > 0")]
    InvalidConnectionLimits { low: usize, high: usize },
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("private key could not be decoded: {0}")]
    Decode(String),

    #[error("private key could not be encoded: {0}")]
    Encode(String),

    #[error("stored key uses {found}, expected {expected}")]
    AlgorithmMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("invalid peer id '{0}'")]
    InvalidPeerId(String),

    #[error("private key belongs to {actual}, config claims {expected}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    /// The key protector refused to open the stored key (wrong or missing passphrase).
    #[error("key protector rejected the stored key: {0}")]
    Protector(String),
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("transport setup failed: {0}")]
    Transport(String),

    #[error("behaviour setup failed: {0}")]
    Behaviour(String),

    #[error("no listen addresses configured")]
    NoListenAddrs,

    #[error("could not listen on any of {addrs:?}")]
    Listen { addrs: Vec<String> },

    #[error("listeners did not report an address within {0:?}")]
    ListenTimeout(Duration),

    #[error("routing table has no known peers")]
    NoRoutingPeers,

    #[error("host has been shut down")]
    Closed,
}

/// Why a single dial attempt did not produce a connection.
///
/// Dial failures are never escalated on their own; the coordinator only
/// reports the aggregate as a [`BootstrapError`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DialFailure {
    #[error("dial timed out")]
    Timeout,

    #[error("{0}")]
    Transport(String),

    #[error("host has been shut down")]
    HostClosed,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Not enough distinct peers exist to ever meet the threshold; no dial was attempted.
    #[error("only {available} distinct bootstrap peers known, {required} required")]
    Unreachable { available: usize, required: usize },

    #[error("connected to {achieved} bootstrap peers, {required} required")]
    ThresholdNotMet { achieved: usize, required: usize },

    #[error("bootstrap cancelled after connecting to {achieved} of {required} required peers")]
    Cancelled { achieved: usize, required: usize },

    #[error(transparent)]
    Host(#[from] HostError),
}

impl BootstrapError {
    /// True for the cancellation flavour, as opposed to an unmet threshold.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
