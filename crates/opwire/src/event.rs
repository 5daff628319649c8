//! Lifecycle and traffic notifications.
//!
//! Every server and client owns a `tokio::sync::broadcast` channel of
//! [`Event`]s. Emitting never blocks and never fails: with no subscriber
//! the event is dropped, and a lagging subscriber skips ahead.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use opwire_protocol::Opcode;
use opwire_registry::HandlerError;
use opwire_transport::ConnectionId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::OpwireError;

/// Why a connection or server went down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    /// No specific reason was given.
    #[default]
    Unknown,
    /// The connection was idle longer than the configured timeout.
    Timeout,
    /// The peer closed the socket.
    ConnectionClosed,
    /// The server is shutting down.
    ServerStopped,
    /// A frame could not be decrypted or decoded.
    InvalidPacket,
    /// The client asked to disconnect.
    ClientDisconnected,
    /// The application requested something the connection cannot do.
    InvalidOperation,
    /// Writing a frame failed.
    PacketTransmissionError,
    /// The outbound queue was unusable.
    PacketSendQueueError,
    /// The inbound queue was unusable.
    PacketReceiveQueueError,
    /// Reading from the socket failed.
    NetworkStreamReadError,
    /// The connection is open but its read pump is gone.
    CanNotProcess,
    /// An encrypted frame arrived with no provider in scope.
    EncryptionProviderNotFound,
    /// The peers disagree on the protocol version.
    VersionMismatch,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Unknown => "unknown",
            Reason::Timeout => "timeout",
            Reason::ConnectionClosed => "connection closed",
            Reason::ServerStopped => "server stopped",
            Reason::InvalidPacket => "invalid packet",
            Reason::ClientDisconnected => "client disconnected",
            Reason::InvalidOperation => "invalid operation",
            Reason::PacketTransmissionError => "packet transmission error",
            Reason::PacketSendQueueError => "packet send queue error",
            Reason::PacketReceiveQueueError => "packet receive queue error",
            Reason::NetworkStreamReadError => "network stream read error",
            Reason::CanNotProcess => "cannot process",
            Reason::EncryptionProviderNotFound => "encryption provider not found",
            Reason::VersionMismatch => "version mismatch",
        };
        f.write_str(s)
    }
}

/// Which per-connection queue a packet entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueDirection {
    /// Decoded and waiting for dispatch.
    Incoming,
    /// Encoded and waiting to be written.
    Outgoing,
}

/// A notification from a server, client or connection.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection's pumps are running.
    Connected {
        connection: ConnectionId,
        peer: SocketAddr,
    },
    /// A connection finished closing.
    Disconnected {
        connection: ConnectionId,
        reason: Reason,
    },
    /// A connection hit an error. `reason` names the cause. Errors on the
    /// send path drop the packet and leave the connection up; a
    /// [`Event::Disconnected`] follows when the error is fatal.
    ConnectionError {
        connection: ConnectionId,
        error: Arc<OpwireError>,
        reason: Reason,
    },
    /// A handler returned an error or panicked.
    HandlerError {
        connection: ConnectionId,
        opcode: Opcode,
        error: Arc<HandlerError>,
    },
    /// A frame arrived with an opcode this side cannot decode. The frame
    /// is skipped and reading continues.
    UnknownPacketReceived {
        connection: ConnectionId,
        opcode: Opcode,
        encrypted: bool,
        length: usize,
        body: Arc<[u8]>,
    },
    /// `send` was called with a type that has no outbound opcode.
    UnknownPacketSendAttempted {
        connection: ConnectionId,
        packet_type: &'static str,
        encrypted: bool,
    },
    /// A decoded packet had no handler.
    MessageHandlerNotFound {
        connection: ConnectionId,
        opcode: Opcode,
        encrypted: bool,
    },
    /// A packet entered one of the connection queues.
    PacketQueued {
        connection: ConnectionId,
        opcode: Opcode,
        encrypted: bool,
        direction: QueueDirection,
    },
    /// A handler completed successfully.
    PacketReceived {
        connection: ConnectionId,
        opcode: Opcode,
        encrypted: bool,
    },
    /// The server is accepting connections.
    ServerStarted { local_addr: SocketAddr },
    /// The server stopped and every connection was closed.
    ServerStopped { reason: Reason },
    /// The server failed to bind or accept.
    ServerError { error: Arc<OpwireError> },
    /// The server accepted a new connection. Look it up with
    /// [`Server::connection`](crate::Server::connection).
    ClientConnected {
        connection: ConnectionId,
        peer: SocketAddr,
    },
}

impl Event {
    /// The connection this event is about, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Event::Connected { connection, .. }
            | Event::Disconnected { connection, .. }
            | Event::ConnectionError { connection, .. }
            | Event::HandlerError { connection, .. }
            | Event::UnknownPacketReceived { connection, .. }
            | Event::UnknownPacketSendAttempted { connection, .. }
            | Event::MessageHandlerNotFound { connection, .. }
            | Event::PacketQueued { connection, .. }
            | Event::PacketReceived { connection, .. }
            | Event::ClientConnected { connection, .. } => Some(*connection),
            Event::ServerStarted { .. } | Event::ServerStopped { .. } | Event::ServerError { .. } => {
                None
            }
        }
    }
}

/// Sending half of the event channel, shared by a server or client and
/// all of its connections.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<Event>,
}

impl EventSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_default_is_unknown() {
        assert_eq!(Reason::default(), Reason::Unknown);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(Reason::Timeout.to_string(), "timeout");
        assert_eq!(Reason::ServerStopped.to_string(), "server stopped");
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let sink = EventSink::new(4);
        sink.emit(Event::ServerStopped {
            reason: Reason::Unknown,
        });
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let sink = EventSink::new(4);
        let mut rx = sink.subscribe();
        for reason in [Reason::Timeout, Reason::InvalidPacket] {
            sink.emit(Event::Disconnected {
                connection: ConnectionId::new(1),
                reason,
            });
        }

        for expected in [Reason::Timeout, Reason::InvalidPacket] {
            match rx.recv().await.unwrap() {
                Event::Disconnected { reason, connection } => {
                    assert_eq!(reason, expected);
                    assert_eq!(connection, ConnectionId::new(1));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_client_connected_names_its_connection() {
        let id = ConnectionId::new(42);
        let event = Event::ClientConnected {
            connection: id,
            peer: "127.0.0.1:9000".parse().unwrap(),
        };
        assert_eq!(event.connection_id(), Some(id));
    }

    #[test]
    fn test_server_events_have_no_connection() {
        let event = Event::ServerStopped {
            reason: Reason::ServerStopped,
        };
        assert_eq!(event.connection_id(), None);
    }
}
