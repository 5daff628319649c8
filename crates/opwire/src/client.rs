//! `Client` builder, connect and retry.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use opwire_protocol::{BinaryCodec, Codec, Direction, EncryptionProvider, Opcode, Packet, Role};
use opwire_registry::{
    HandlerError, PacketRegistry, RegistryBuilder, ServiceCollection, ServiceContainer, ServiceScope,
};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{ClientConfig, DrainTimeout};
use crate::connection::{ConnectionParts, ConnectionState};
use crate::event::{Event, EventSink, Reason};
use crate::{Connection, OpwireError};

/// Builder for configuring a [`Client`].
///
/// Mirrors [`ServerBuilder`](crate::ServerBuilder), registering packets for
/// the client role.
pub struct ClientBuilder {
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    registry: RegistryBuilder<Connection>,
    services: ServiceCollection,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            codec: Arc::new(BinaryCodec),
            registry: RegistryBuilder::new(Role::Client),
            services: ServiceCollection::new(),
        }
    }

    /// Sets the server address.
    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn drain_timeout(mut self, timeout: DrainTimeout) -> Self {
        self.config.connection.drain_timeout = timeout;
        self
    }

    /// Replaces the default [`BinaryCodec`].
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Declares a packet type. See [`RegistryBuilder::register_packet`].
    pub fn packet<T: Packet + Default>(mut self, opcode: Opcode, direction: Direction) -> Self {
        self.registry = self.registry.register_packet::<T>(opcode, direction);
        self
    }

    /// Registers the handler for an inbound opcode.
    pub fn handler<T, F, Fut>(mut self, opcode: Opcode, handler: F) -> Self
    where
        T: Packet,
        F: Fn(Connection, T, ServiceScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.registry = self.registry.register_handler(opcode, handler);
        self
    }

    /// Adds service registrations.
    pub fn services(mut self, configure: impl FnOnce(&mut ServiceCollection)) -> Self {
        configure(&mut self.services);
        self
    }

    /// Registers the provider used for encrypted frames.
    pub fn encryption(mut self, provider: Arc<dyn EncryptionProvider>) -> Self {
        self.services.add_instance(provider);
        self
    }

    /// Validates the configuration and registry.
    ///
    /// # Errors
    /// [`OpwireError::InvalidHost`] or [`OpwireError::InvalidPort`] for a
    /// bad address, [`OpwireError::Registration`] for an invalid registry.
    pub fn build(self) -> Result<Client, OpwireError> {
        let config = self.config.validated();
        let server_addr = config.server_addr()?;
        let registry = self.registry.build()?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                server_addr,
                registry: Arc::new(registry),
                codec: self.codec,
                services: self.services.build(),
                events: EventSink::new(config.event_capacity),
                config,
                connection: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientInner {
    config: ClientConfig,
    server_addr: SocketAddr,
    registry: Arc<PacketRegistry<Connection>>,
    codec: Arc<dyn Codec>,
    services: ServiceContainer,
    events: EventSink,
    connection: Mutex<Option<Connection>>,
    /// Serializes `connect` calls.
    connecting: tokio::sync::Mutex<()>,
}

/// The dialing side: at most one live [`Connection`] at a time.
///
/// Cheap to clone. After the connection closes, `connect` may be
/// called again.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a new builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Opens a connection to the configured server.
    ///
    /// # Errors
    /// [`OpwireError::AlreadyConnected`] if a connection is still live,
    /// [`OpwireError::Transport`] if the socket cannot be opened.
    pub async fn connect(&self) -> Result<Connection, OpwireError> {
        let _connecting = self.inner.connecting.lock().await;
        if self.live_connection().is_some() {
            return Err(OpwireError::AlreadyConnected);
        }

        let addr = self.inner.server_addr.to_string();
        let stream = opwire_transport::connect(&addr).await?;
        Ok(self.adopt(stream))
    }

    /// Like [`connect`](Self::connect), retrying after `delay` on failure.
    ///
    /// `max_attempts == 0` retries forever.
    ///
    /// # Errors
    /// [`OpwireError::ConnectionFailed`] once `max_attempts` attempts have
    /// failed, [`OpwireError::AlreadyConnected`] as for `connect`.
    pub async fn connect_with_retry(
        &self,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<Connection, OpwireError> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match self.connect().await {
                Ok(connection) => {
                    if attempt > 1 {
                        info!(attempt, addr = %self.inner.server_addr, "connected after retry");
                    }
                    return Ok(connection);
                }
                Err(OpwireError::Transport(source)) => {
                    warn!(
                        attempt,
                        max_attempts,
                        addr = %self.inner.server_addr,
                        error = %source,
                        "connection attempt failed"
                    );
                    if max_attempts != 0 && attempt >= max_attempts {
                        return Err(OpwireError::ConnectionFailed {
                            addr: self.inner.server_addr.to_string(),
                            attempts: attempt,
                            source,
                        });
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Queues `packet` on the live connection.
    ///
    /// # Errors
    /// [`OpwireError::NotConnected`] without a live connection. Failures
    /// after that point are reported as events.
    pub fn send<P: Packet>(&self, packet: &P) -> Result<(), OpwireError> {
        let connection = self.live_connection().ok_or(OpwireError::NotConnected)?;
        connection.send(packet);
        Ok(())
    }

    /// Encrypted variant of [`send`](Self::send).
    ///
    /// # Errors
    /// [`OpwireError::NotConnected`] without a live connection.
    pub fn send_encrypted<P: Packet>(&self, packet: &P) -> Result<(), OpwireError> {
        let connection = self.live_connection().ok_or(OpwireError::NotConnected)?;
        connection.send_encrypted(packet);
        Ok(())
    }

    /// Drains and closes the live connection.
    ///
    /// # Errors
    /// [`OpwireError::NotConnected`] without a live connection.
    pub async fn disconnect(&self, reason: Reason) -> Result<(), OpwireError> {
        let connection = self.live_connection().ok_or(OpwireError::NotConnected)?;
        connection.disconnect(reason).await;
        Ok(())
    }

    /// The most recent connection, live or not.
    pub fn connection(&self) -> Option<Connection> {
        lock(&self.inner.connection).clone()
    }

    /// `true` while the connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|connection| connection.is_open())
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &PacketRegistry<Connection> {
        &self.inner.registry
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn live_connection(&self) -> Option<Connection> {
        self.connection()
            .filter(|connection| connection.state() != ConnectionState::Closed)
    }

    fn adopt(&self, stream: TcpStream) -> Connection {
        let peer = stream.peer_addr().unwrap_or(self.inner.server_addr);
        let (reader, writer) = stream.into_split();
        let connection = Connection::spawn(
            reader,
            writer,
            peer,
            ConnectionParts {
                registry: Arc::clone(&self.inner.registry),
                codec: Arc::clone(&self.inner.codec),
                scope: self.inner.services.begin_scope(),
                events: self.inner.events.clone(),
                config: self.inner.config.connection.clone(),
                closed_tx: None,
            },
        );
        *lock(&self.inner.connection) = Some(connection.clone());
        connection
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_addr", &self.inner.server_addr)
            .field("connection", &self.connection())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
