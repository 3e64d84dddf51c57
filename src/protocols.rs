//! Trait seams between the bootstrap logic and the network host.
//!
//! | Trait | Implemented by | Used by |
//! |-------|----------------|---------|
//! | [`Dialer`] | [`crate::Host`] | [`crate::BootstrapCoordinator`] |
//!
//! The coordinator only needs "connect to this peer" and "is that connection
//! still up", so it depends on this trait rather than on the host itself.
//! Tests drive it with scripted dialers.

use async_trait::async_trait;
use libp2p::PeerId;

use crate::error::DialFailure;
use crate::seeds::BootstrapPeer;

#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect to `peer` through any of its addresses.
    ///
    /// Resolves once a connection is established or the attempt failed;
    /// timeouts are applied by the caller.
    async fn dial(&self, peer: &BootstrapPeer) -> Result<(), DialFailure>;

    /// Whether a connection to `peer` is currently open.
    async fn is_live(&self, peer: &PeerId) -> bool;
}
