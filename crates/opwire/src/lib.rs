//! # opwire
//!
//! Bidirectional, length-prefixed TCP messaging with typed packets.
//!
//! Two peers exchange packets identified by `i32` opcodes. Each side
//! declares which packet types travel in which [`Direction`], registers an
//! async handler for every packet it can receive, and the runtime takes
//! care of framing, decoding, dispatch order and graceful shutdown.
//!
//! ## Layers
//!
//! | crate              | concern                                      |
//! |--------------------|----------------------------------------------|
//! | `opwire-protocol`  | binary codec, packet traits, frame header    |
//! | `opwire-transport` | TCP sockets, async frame I/O                 |
//! | `opwire-registry`  | opcode tables, handlers, service scopes      |
//! | `opwire`           | connections, server, client, events          |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use opwire::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct Ping {
//!     timestamp: i64,
//! }
//!
//! impl Readable for Ping {
//!     fn read(&mut self, r: &mut PacketReader<'_>) -> Result<(), CodecError> {
//!         self.timestamp = r.read_i64()?;
//!         Ok(())
//!     }
//! }
//!
//! impl Writeable for Ping {
//!     fn write(&self, w: &mut PacketWriter) {
//!         w.write_i64(self.timestamp);
//!     }
//! }
//!
//! # async fn run() -> Result<(), OpwireError> {
//! let server = Server::builder()
//!     .bind("127.0.0.1", 7777)
//!     .packet::<Ping>(1, Direction::Bidirectional)
//!     .handler(1, |conn: Connection, ping: Ping, _services: ServiceScope| async move {
//!         conn.send(&Ping { timestamp: ping.timestamp + 1 });
//!         Ok::<_, HandlerError>(())
//!     })
//!     .build()?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod event;
mod server;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ConnectionConfig, DrainTimeout, ServerConfig, MAX_PORT};
pub use connection::{Connection, ConnectionState};
pub use error::OpwireError;
pub use event::{Event, QueueDirection, Reason};
pub use server::{Server, ServerBuilder};

// Re-export sub-crates for direct access.
pub use opwire_protocol as protocol;
pub use opwire_registry as registry;
pub use opwire_transport as transport;

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set, so tests and
/// binaries may both call it.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Common imports for opwire users.
pub mod prelude {
    pub use crate::{
        Client, ClientBuilder, ClientConfig, Connection, ConnectionConfig, ConnectionState,
        DrainTimeout, Event, OpwireError, QueueDirection, Reason, Server, ServerBuilder,
        ServerConfig,
    };
    pub use opwire_protocol::{
        BinaryCodec, Codec, CodecError, Decimal, Decode, Direction, Encode, EncryptionError,
        EncryptionProvider, Opcode, Packet, PacketReader, PacketWriter, Readable, Role, Writeable,
    };
    pub use opwire_registry::{
        HandlerError, Lifetime, ServiceCollection, ServiceContainer, ServiceScope,
    };
    pub use opwire_transport::ConnectionId;
}
