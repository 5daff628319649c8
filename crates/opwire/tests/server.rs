//! Server lifecycle: start/stop, sweep, broadcast and build validation.

mod common;

use std::time::Duration;

use common::{eventually, next_event, ping_pong_server, pong_client, recv, Ping, Pong, PING};
use opwire::prelude::*;
use opwire::registry::RegistrationError;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_start_reports_ephemeral_port() {
    let server = ping_pong_server().build().unwrap();
    let mut events = server.subscribe();
    assert!(!server.is_running());

    let addr = server.start().await.unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(server.local_addr(), Some(addr));
    assert!(server.is_running());

    let event = next_event(&mut events, |e| matches!(e, Event::ServerStarted { .. })).await;
    assert!(matches!(event, Event::ServerStarted { local_addr } if local_addr == addr));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let server = ping_pong_server().build().unwrap();
    server.start().await.unwrap();
    assert!(matches!(
        server.start().await,
        Err(OpwireError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn test_stop_without_start_is_rejected() {
    let server = ping_pong_server().build().unwrap();
    assert!(matches!(
        server.stop(Reason::ServerStopped).await,
        Err(OpwireError::NotStarted)
    ));
}

#[tokio::test]
async fn test_bind_conflict_fails_start() {
    let first = ping_pong_server().build().unwrap();
    let addr = first.start().await.unwrap();

    let second = ping_pong_server()
        .bind("127.0.0.1", addr.port())
        .build()
        .unwrap();
    let mut events = second.subscribe();
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, OpwireError::StartFailed { .. }));
    next_event(&mut events, |e| matches!(e, Event::ServerError { .. })).await;
    assert!(!second.is_running());
}

#[tokio::test]
async fn test_stop_disconnects_clients() {
    let server = ping_pong_server().build().unwrap();
    let mut events = server.subscribe();
    let addr = server.start().await.unwrap();

    let (tx, _pongs) = mpsc::unbounded_channel();
    let client = pong_client(addr.port(), tx).build().unwrap();
    let mut client_events = client.subscribe();
    client.connect().await.unwrap();
    next_event(&mut events, |e| matches!(e, Event::ClientConnected { .. })).await;

    server.stop(Reason::ServerStopped).await.unwrap();
    let event = next_event(&mut events, |e| matches!(e, Event::Disconnected { .. })).await;
    assert!(matches!(
        event,
        Event::Disconnected {
            reason: Reason::ServerStopped,
            ..
        }
    ));
    next_event(&mut events, |e| {
        matches!(
            e,
            Event::ServerStopped {
                reason: Reason::ServerStopped
            }
        )
    })
    .await;
    assert_eq!(server.connection_count(), 0);
    assert!(!server.is_running());

    let event = next_event(&mut client_events, |e| matches!(e, Event::Disconnected { .. })).await;
    assert!(matches!(
        event,
        Event::Disconnected {
            reason: Reason::ConnectionClosed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_server_restarts_after_stop() {
    let server = ping_pong_server().build().unwrap();
    server.start().await.unwrap();
    server.stop(Reason::ServerStopped).await.unwrap();

    let addr = server.start().await.unwrap();
    let (tx, mut pongs) = mpsc::unbounded_channel();
    let client = pong_client(addr.port(), tx).build().unwrap();
    client.connect().await.unwrap();
    client.send(&Ping { timestamp: 1 }).unwrap();
    assert_eq!(recv(&mut pongs).await, 2);
}

#[tokio::test]
async fn test_idle_connections_time_out() {
    let server = ping_pong_server()
        .connection_timeout_secs(1)
        .sweep_interval(Duration::from_millis(100))
        .build()
        .unwrap();
    let mut events = server.subscribe();
    let addr = server.start().await.unwrap();

    let (tx, _pongs) = mpsc::unbounded_channel();
    let client = pong_client(addr.port(), tx).build().unwrap();
    client.connect().await.unwrap();

    let event = next_event(&mut events, |e| matches!(e, Event::Disconnected { .. })).await;
    assert!(matches!(
        event,
        Event::Disconnected {
            reason: Reason::Timeout,
            ..
        }
    ));
    eventually(|| server.connection_count() == 0).await;
}

#[tokio::test]
async fn test_zero_timeout_keeps_idle_connections() {
    let server = ping_pong_server()
        .connection_timeout_secs(0)
        .sweep_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let addr = server.start().await.unwrap();

    let (tx, _pongs) = mpsc::unbounded_channel();
    let client = pong_client(addr.port(), tx).build().unwrap();
    client.connect().await.unwrap();
    eventually(|| server.connection_count() == 1).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connection_count(), 1);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let server = ping_pong_server().build().unwrap();
    let addr = server.start().await.unwrap();

    let (tx_a, mut pongs_a) = mpsc::unbounded_channel();
    let (tx_b, mut pongs_b) = mpsc::unbounded_channel();
    let client_a = pong_client(addr.port(), tx_a).build().unwrap();
    let client_b = pong_client(addr.port(), tx_b).build().unwrap();
    client_a.connect().await.unwrap();
    client_b.connect().await.unwrap();
    eventually(|| server.connection_count() == 2).await;

    assert_eq!(server.broadcast(&Pong { timestamp: 77 }, false), 2);
    assert_eq!(recv(&mut pongs_a).await, 77);
    assert_eq!(recv(&mut pongs_b).await, 77);
}

#[tokio::test]
async fn test_broadcast_of_unknown_type_sends_nothing() {
    let server = ping_pong_server().build().unwrap();
    let mut events = server.subscribe();
    let addr = server.start().await.unwrap();

    let (tx, _pongs) = mpsc::unbounded_channel();
    let client = pong_client(addr.port(), tx).build().unwrap();
    client.connect().await.unwrap();
    eventually(|| server.connection_count() == 1).await;

    // Ping only travels client → server.
    assert_eq!(server.broadcast(&Ping { timestamp: 1 }, false), 0);
    next_event(&mut events, |e| {
        matches!(e, Event::UnknownPacketSendAttempted { .. })
    })
    .await;
}

#[tokio::test]
async fn test_connection_lookup() {
    let server = ping_pong_server().build().unwrap();
    let mut events = server.subscribe();
    let addr = server.start().await.unwrap();

    let (tx, _pongs) = mpsc::unbounded_channel();
    let client = pong_client(addr.port(), tx).build().unwrap();
    client.connect().await.unwrap();

    let event = next_event(&mut events, |e| matches!(e, Event::ClientConnected { .. })).await;
    let Event::ClientConnected { connection, peer } = event else {
        unreachable!();
    };
    let found = server.connection(connection).unwrap();
    assert_eq!(found.id(), connection);
    assert_eq!(found.peer_addr(), peer);
    assert!(found.is_open());
    assert_eq!(server.connections().len(), 1);
}

#[test]
fn test_build_requires_every_handler() {
    let err = Server::builder()
        .packet::<Ping>(PING, Direction::ClientToServer)
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        OpwireError::Registration(RegistrationError::MissingHandler(PING))
    ));
}

#[test]
fn test_build_validates_address() {
    let err = ping_pong_server().bind("localhost", 80).build().unwrap_err();
    assert!(matches!(err, OpwireError::InvalidHost(_)));

    let err = ping_pong_server().bind("127.0.0.1", 65535).build().unwrap_err();
    assert!(matches!(err, OpwireError::InvalidPort(65535)));
}
