//! Integration tests for the Host public API.
//!
//! Hosts listen on loopback TCP only, so these tests never leave the machine.

use std::time::Duration;

use libp2p::multiaddr::Protocol;
use libp2p::PeerId;
use nodeboot::{
    BootstrapPeer, ConnectionLimits, DialFailure, Host, HostError, HostOptions, Keypair, NatStatus,
    RoutingTable, build_host,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn local_host() -> Host {
    build_host(&Keypair::generate(), &HostOptions::local_only())
        .await
        .expect("build_host failed")
}

/// The host's listen addresses as a dialable bootstrap peer.
async fn as_peer(host: &Host) -> BootstrapPeer {
    let addrs = host
        .listen_addrs()
        .await
        .expect("listen_addrs failed")
        .into_iter()
        .map(|addr| addr.with(Protocol::P2p(host.peer_id())))
        .collect();
    BootstrapPeer::new(host.peer_id(), addrs)
}

#[tokio::test]
async fn host_identity_matches_keypair() {
    let keypair = Keypair::generate();
    let host = build_host(&keypair, &HostOptions::local_only())
        .await
        .expect("build_host failed");

    assert_eq!(host.peer_id(), keypair.peer_id());
    assert_eq!(host.limits(), ConnectionLimits::default());
    assert!(host.datastore().is_empty());

    host.close().await;
}

#[tokio::test]
async fn fixed_key_gives_same_peer_id_across_hosts() {
    let first = build_host(&Keypair::from_secret_key_bytes(&[7; 32]), &HostOptions::local_only())
        .await
        .expect("first build_host failed");
    let first_id = first.peer_id();
    first.close().await;

    let second = build_host(&Keypair::from_secret_key_bytes(&[7; 32]), &HostOptions::local_only())
        .await
        .expect("second build_host failed");
    assert_eq!(second.peer_id(), first_id);

    second.close().await;
}

#[tokio::test]
async fn host_reports_bound_loopback_address() {
    let host = local_host().await;

    let addrs = host.listen_addrs().await.expect("listen_addrs failed");
    assert!(!addrs.is_empty());
    for addr in addrs {
        let port = addr.iter().find_map(|p| match p {
            Protocol::Tcp(port) => Some(port),
            _ => None,
        });
        assert!(port.is_some_and(|p| p > 0), "expected a bound tcp port in {addr}");
    }

    host.close().await;
}

#[tokio::test]
async fn unbindable_address_is_a_listen_error() {
    let options = HostOptions::local_only().with_listen_addrs(vec!["/ip4/203.0.113.7/tcp/0".parse().unwrap()]);

    let err = build_host(&Keypair::generate(), &options).await.unwrap_err();
    assert!(
        matches!(err, HostError::Listen { .. } | HostError::ListenTimeout(_)),
        "unexpected error {err:?}"
    );
}

#[tokio::test]
async fn dial_connects_two_hosts() {
    let a = local_host().await;
    let b = local_host().await;
    let b_peer = as_peer(&b).await;

    timeout(TEST_TIMEOUT, a.dial(&b_peer))
        .await
        .expect("dial timed out")
        .expect("dial failed");

    assert!(a.is_connected(&b.peer_id()).await.unwrap());
    assert!(a.connected_peers().await.unwrap().contains(&b.peer_id()));
    assert_eq!(a.outstanding_dials().await.unwrap(), 0);

    let a_id = a.peer_id();
    timeout(TEST_TIMEOUT, async {
        while !b.is_connected(&a_id).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("listener side never saw the connection");

    // A second dial reuses the open connection.
    timeout(Duration::from_secs(2), a.dial(&b_peer))
        .await
        .expect("redial timed out")
        .expect("redial failed");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn dialed_addresses_enter_address_book() {
    let a = local_host().await;
    let b = local_host().await;
    let b_peer = as_peer(&b).await;

    a.dial(&b_peer).await.expect("dial failed");

    let known = a.known_addresses(&b.peer_id()).await.unwrap();
    let listen = b.listen_addrs().await.unwrap();
    assert!(known.iter().any(|addr| listen.contains(addr)), "known {known:?}, listen {listen:?}");

    let stranger = PeerId::random();
    a.add_addresses(stranger, vec!["/ip4/10.1.2.3/tcp/4001".parse().unwrap()])
        .await
        .unwrap();
    assert_eq!(a.known_addresses(&stranger).await.unwrap().len(), 1);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn dial_to_closed_port_fails() {
    let a = local_host().await;
    let b = local_host().await;
    let peer = BootstrapPeer::new(b.peer_id(), vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()]);
    b.close().await;

    let result = timeout(TEST_TIMEOUT, a.dial(&peer)).await.expect("dial timed out");
    assert!(matches!(result, Err(DialFailure::Transport(_))), "unexpected {result:?}");
    assert!(!a.is_connected(&peer.peer_id).await.unwrap());

    a.close().await;
}

async fn wait_for_no_outstanding_dials(host: &Host, within: Duration) {
    timeout(within, async {
        while host.outstanding_dials().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("dial still outstanding");
}

#[tokio::test]
async fn timed_out_dial_is_aborted() {
    let host = local_host().await;
    // Non-routable; a real attempt would hang far longer than the wait below.
    let peer_id = PeerId::random();
    let peer = BootstrapPeer::new(peer_id, vec!["/ip4/10.255.255.1/tcp/4001".parse().unwrap()]);

    // Some sandboxes reject the route outright; either way nothing may linger.
    let _ = timeout(Duration::from_millis(200), host.dial(&peer)).await;

    wait_for_no_outstanding_dials(&host, Duration::from_secs(3)).await;
    assert!(!host.is_connected(&peer_id).await.unwrap());

    host.close().await;
}

#[tokio::test]
async fn abandoned_dial_never_leaves_a_connection() {
    let a = local_host().await;
    let b = local_host().await;
    let b_peer = as_peer(&b).await;

    // The dial command is queued, then the caller gives up immediately.
    let _ = timeout(Duration::ZERO, a.dial(&b_peer)).await;

    wait_for_no_outstanding_dials(&a, TEST_TIMEOUT).await;
    timeout(TEST_TIMEOUT, async {
        while a.is_connected(&b.peer_id()).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection of abandoned dial was kept");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!a.is_connected(&b.peer_id()).await.unwrap());
    assert_eq!(a.outstanding_dials().await.unwrap(), 0);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn closed_host_rejects_requests() {
    let a = local_host().await;
    let b = local_host().await;
    let b_peer = as_peer(&b).await;

    a.close().await;

    assert_eq!(a.dial(&b_peer).await, Err(DialFailure::HostClosed));
    assert!(matches!(a.connected_peers().await, Err(HostError::Closed)));
    assert!(matches!(a.protect(b.peer_id(), "test").await, Err(HostError::Closed)));

    b.close().await;
}

#[tokio::test]
async fn protection_survives_round_trip() {
    let host = local_host().await;
    let peer = PeerId::random();

    host.protect(peer, "bootstrap").await.unwrap();
    host.unprotect(peer, "bootstrap").await.unwrap();
    assert_eq!(host.nat_status().await.unwrap(), NatStatus::Unknown);

    host.close().await;
}

#[tokio::test]
async fn routing_table_starts_empty_and_accepts_peers() {
    let a = local_host().await;
    let b = local_host().await;

    let routing = RoutingTable::attach(&a).await.expect("attach failed");
    assert_eq!(routing.size().await.unwrap(), 0);
    assert!(matches!(routing.bootstrap().await, Err(HostError::NoRoutingPeers)));

    routing.add_peer(&as_peer(&b).await).await.unwrap();
    assert_eq!(routing.size().await.unwrap(), 1);
    assert!(routing.bootstrap().await.is_ok());

    a.close().await;
    b.close().await;
}
