//! Local queues and framed connections

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::mock_helpers::MockPeer;
use common::test_timeout;
use pipehub::config::HubConfig;
use pipehub::error::{PipehubError, TransportError};
use pipehub::message::frame::MAX_PAYLOAD_SIZE;
use pipehub::transport::local::LocalQueue;
use pipehub::transport::tcp::TcpConnection;
use pipehub::transport::{AlwaysAlive, Transport};
use pipehub::{Id, MessageFactory, MessageType, Payload};

#[test]
fn test_dead_peer_is_reported_as_gone() {
    let mut peer = MockPeer::new();
    peer.expect_is_alive().return_const(false);
    let settings = HubConfig::default().transport.queue_settings();
    let (mut a, _b) = LocalQueue::pair_with_liveness(settings, Arc::new(peer), Arc::new(AlwaysAlive));

    assert!(matches!(
        a.receive_timeout(test_timeout()),
        Err(PipehubError::Transport(TransportError::PeerGone))
    ));
    assert!(!a.is_alive());
}

#[test]
fn test_live_peer_times_out() {
    let mut peer = MockPeer::new();
    peer.expect_is_alive().return_const(true);
    let settings = HubConfig::default().transport.queue_settings();
    let (mut a, _b) = LocalQueue::pair_with_liveness(settings, Arc::new(peer), Arc::new(AlwaysAlive));

    assert!(matches!(
        a.receive_timeout(Duration::from_millis(20)),
        Err(PipehubError::Transport(TransportError::Timeout(_)))
    ));
    assert_eq!(a.stats().timeouts, 1);
}

#[test]
fn test_queue_preserves_order() {
    let (mut a, mut b) = LocalQueue::pair(Default::default());
    let f = MessageFactory::new(Id(3), 0);
    for ty in [Payload::Busy, Payload::Idle, Payload::Barrier] {
        a.send(f.make(ty)).unwrap();
    }
    let got: Vec<MessageType> = (0..3)
        .map(|_| b.receive().unwrap().message_type())
        .collect();
    assert_eq!(got, vec![MessageType::Busy, MessageType::Idle, MessageType::Barrier]);
}

#[tokio::test]
async fn test_connection_over_in_memory_pipe() {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (lr, lw) = tokio::io::split(left);
    let (rr, rw) = tokio::io::split(right);
    let (a, _ta) = TcpConnection::from_halves(lr, lw, MAX_PAYLOAD_SIZE);
    let (b, _tb) = TcpConnection::from_halves(rr, rw, MAX_PAYLOAD_SIZE);

    let f = MessageFactory::new(Id::UI, 0);
    a.send(f.make(Payload::Ping { ch: b'x' })).await.unwrap();
    a.send(f.make(Payload::Quit)).await.unwrap();

    let first = b.recv().await.unwrap();
    assert_eq!(first.payload, Payload::Ping { ch: b'x' });
    assert_eq!(b.recv().await.unwrap().message_type(), MessageType::Quit);
    assert!(a.is_open());
}
