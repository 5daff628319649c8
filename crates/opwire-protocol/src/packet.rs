//! Packet traits, opcodes, and routing directions.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CodecError, PacketReader, PacketWriter};

/// Numeric identifier that ties a wire frame to a packet type.
pub type Opcode = i32;

/// Which side of a connection a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The side that initiates the socket.
    Client,
    /// The side that accepts it.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Who is allowed to send a packet type.
///
/// Client-sent and server-sent catalogs are independent, so the same opcode
/// may be used by one `ClientToServer` and one `ServerToClient` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by clients, received by servers.
    ClientToServer,
    /// Sent by servers, received by clients.
    ServerToClient,
    /// Sent and received by both sides.
    Bidirectional,
}

impl Direction {
    /// Returns `true` if a peer in `role` receives this packet.
    pub fn is_inbound_for(self, role: Role) -> bool {
        matches!(
            (self, role),
            (Direction::Bidirectional, _)
                | (Direction::ClientToServer, Role::Server)
                | (Direction::ServerToClient, Role::Client)
        )
    }

    /// Returns `true` if a peer in `role` sends this packet.
    pub fn is_outbound_for(self, role: Role) -> bool {
        matches!(
            (self, role),
            (Direction::Bidirectional, _)
                | (Direction::ClientToServer, Role::Client)
                | (Direction::ServerToClient, Role::Server)
        )
    }
}

/// A packet that can fill itself in from a packet body.
///
/// The registry creates a `Default` instance for the incoming opcode and
/// then calls `read` on it.
pub trait Readable {
    /// Reads every field, in the same order [`Writeable::write`] wrote them.
    ///
    /// # Errors
    /// Propagates any [`CodecError`] from the reader.
    fn read(&mut self, reader: &mut PacketReader<'_>) -> Result<(), CodecError>;
}

/// A packet that can serialize itself into a packet body.
pub trait Writeable {
    /// Writes every field.
    fn write(&self, writer: &mut PacketWriter);
}

/// A message that travels between peers.
///
/// There is nothing to implement: any `Readable + Writeable + Debug` type
/// that is `Send + Sync + 'static` is a packet through the blanket impl
/// below. The extra methods exist so the runtime can route packets as
/// `Box<dyn Packet>` and still recover the concrete type for handlers.
///
/// ```rust
/// use opwire_protocol::{CodecError, Packet, PacketReader, PacketWriter, Readable, Writeable};
///
/// #[derive(Debug, Default, PartialEq)]
/// struct Ping {
///     timestamp: i64,
/// }
///
/// impl Readable for Ping {
///     fn read(&mut self, r: &mut PacketReader<'_>) -> Result<(), CodecError> {
///         self.timestamp = r.read_i64()?;
///         Ok(())
///     }
/// }
///
/// impl Writeable for Ping {
///     fn write(&self, w: &mut PacketWriter) {
///         w.write_i64(self.timestamp);
///     }
/// }
///
/// let boxed: Box<dyn Packet> = Box::new(Ping { timestamp: 5 });
/// assert!(boxed.as_any().is::<Ping>());
/// ```
pub trait Packet: Readable + Writeable + Any + Send + Sync + fmt::Debug {
    /// Borrows the packet as [`Any`] for type checks.
    fn as_any(&self) -> &dyn Any;

    /// Converts the boxed packet into `Box<dyn Any>` for downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    /// The Rust type name, for diagnostics.
    fn type_name(&self) -> &'static str;
}

impl<T> Packet for T
where
    T: Readable + Writeable + Any + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_to_server_routing() {
        let d = Direction::ClientToServer;
        assert!(d.is_inbound_for(Role::Server));
        assert!(!d.is_inbound_for(Role::Client));
        assert!(d.is_outbound_for(Role::Client));
        assert!(!d.is_outbound_for(Role::Server));
    }

    #[test]
    fn test_server_to_client_routing() {
        let d = Direction::ServerToClient;
        assert!(d.is_inbound_for(Role::Client));
        assert!(d.is_outbound_for(Role::Server));
        assert!(!d.is_inbound_for(Role::Server));
    }

    #[test]
    fn test_bidirectional_is_both_ways() {
        for role in [Role::Client, Role::Server] {
            assert!(Direction::Bidirectional.is_inbound_for(role));
            assert!(Direction::Bidirectional.is_outbound_for(role));
        }
    }
}
