//! `Server` builder, accept loop and timeout sweep.
//!
//! This is the entry point for hosting peers. It ties the layers
//! together: transport → frame → registry → connection pumps.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures_util::future::join_all;
use opwire_protocol::{BinaryCodec, Codec, Direction, EncryptionProvider, Opcode, Packet, Role};
use opwire_registry::{
    HandlerError, PacketRegistry, RegistryBuilder, ServiceCollection, ServiceContainer, ServiceScope,
};
use opwire_transport::{ConnectionId, TcpTransport};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{DrainTimeout, ServerConfig};
use crate::connection::{signalled, ConnectionParts, ConnectionState};
use crate::event::{Event, EventSink, Reason};
use crate::{Connection, OpwireError};

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Builder for configuring a [`Server`].
///
/// # Example
///
/// ```rust,ignore
/// use opwire::prelude::*;
///
/// let server = Server::builder()
///     .bind("0.0.0.0", 7777)
///     .packet::<Ping>(1, Direction::ClientToServer)
///     .packet::<Pong>(2, Direction::ServerToClient)
///     .handler(1, |conn: Connection, ping: Ping, _services: ServiceScope| async move {
///         conn.send(&Pong { timestamp: ping.timestamp + 1 });
///         Ok(())
///     })
///     .build()?;
/// let addr = server.start().await?;
/// ```
pub struct ServerBuilder {
    config: ServerConfig,
    codec: Arc<dyn Codec>,
    registry: RegistryBuilder<Connection>,
    services: ServiceCollection,
}

impl ServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            codec: Arc::new(BinaryCodec),
            registry: RegistryBuilder::new(Role::Server),
            services: ServiceCollection::new(),
        }
    }

    /// Sets the address to listen on. Port `0` picks an ephemeral port.
    pub fn bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Idle seconds before the sweep disconnects a connection. `0` disables.
    pub fn connection_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connection_timeout_secs = secs;
        self
    }

    /// How often the timeout sweep runs.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Drain policy for disconnecting connections.
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
    pub fn build(self) -> Result<Server, OpwireError> {
        let config = self.config.validated();
        let bind_addr = config.bind_addr()?;
        let registry = self.registry.build()?;

        Ok(Server {
            inner: Arc::new(ServerInner {
                bind_addr,
                registry: Arc::new(registry),
                codec: self.codec,
                services: self.services.build(),
                events: EventSink::new(config.event_capacity),
                config,
                connections: RwLock::new(HashMap::new()),
                running: Mutex::new(None),
                local_addr: RwLock::new(None),
            }),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    config: ServerConfig,
    bind_addr: SocketAddr,
    registry: Arc<PacketRegistry<Connection>>,
    codec: Arc<dyn Codec>,
    services: ServiceContainer,
    events: EventSink,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    running: Mutex<Option<Running>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

/// Background tasks of a started server.
struct Running {
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

/// A TCP server hosting many [`Connection`]s.
///
/// Cheap to clone; clones control the same server. A stopped server can
/// be started again.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Creates a new builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Returns the bound address, which carries the real port when the
    /// server was configured with port `0`.
    ///
    /// # Errors
    /// [`OpwireError::AlreadyStarted`] while running,
    /// [`OpwireError::StartFailed`] if the listener cannot be bound.
    pub async fn start(&self) -> Result<SocketAddr, OpwireError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(OpwireError::AlreadyStarted);
        }

        let addr = self.inner.bind_addr.to_string();
        let transport = match TcpTransport::bind(&addr).await {
            Ok(transport) => transport,
            Err(source) => {
                let source = Arc::new(source);
                self.inner.events.emit(Event::ServerError {
                    error: Arc::new(OpwireError::StartFailed {
                        addr: addr.clone(),
                        source: Arc::clone(&source),
                    }),
                });
                return Err(OpwireError::StartFailed { addr, source });
            }
        };
        let local_addr = transport.local_addr()?;

        let (shutdown, _) = watch::channel(false);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let accept = tokio::spawn(self.clone().accept_loop(
            transport,
            shutdown.subscribe(),
            closed_tx,
            closed_rx,
        ));
        let sweep = tokio::spawn(self.clone().sweep_loop(shutdown.subscribe()));
        *running = Some(Running {
            shutdown,
            accept,
            sweep,
        });
        *write(&self.inner.local_addr) = Some(local_addr);

        info!(%local_addr, "server started");
        self.inner.events.emit(Event::ServerStarted { local_addr });
        Ok(local_addr)
    }

    /// Stops accepting, disconnects every connection with `reason` and
    /// releases the listener.
    ///
    /// # Errors
    /// [`OpwireError::NotStarted`] if the server is not running.
    pub async fn stop(&self, reason: Reason) -> Result<(), OpwireError> {
        let mut running = self.inner.running.lock().await;
        let Some(Running {
            shutdown,
            accept,
            sweep,
        }) = running.take()
        else {
            return Err(OpwireError::NotStarted);
        };

        shutdown.send_replace(true);
        let _ = accept.await;
        let _ = sweep.await;
        *write(&self.inner.local_addr) = None;

        let connections: Vec<Connection> = write(&self.inner.connections)
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        info!(count = connections.len(), %reason, "server stopping");
        join_all(
            connections
                .iter()
                .map(|connection| connection.disconnect(reason)),
        )
        .await;

        self.inner.events.emit(Event::ServerStopped { reason });
        info!(%reason, "server stopped");
        Ok(())
    }

    /// Sends `packet` to every live connection.
    ///
    /// The body is serialized once and shared; encryption, when asked
    /// for, is applied per connection. Returns how many connections
    /// queued the packet.
    pub fn broadcast<P: Packet>(&self, packet: &P, encrypted: bool) -> usize {
        let connections = self.connections();
        let Some(opcode) = self.inner.registry.get_opcode(packet) else {
            warn!(packet = packet.type_name(), "broadcast of a packet type with no outbound opcode");
            for connection in &connections {
                self.inner.events.emit(Event::UnknownPacketSendAttempted {
                    connection: connection.id(),
                    packet_type: packet.type_name(),
                    encrypted,
                });
            }
            return 0;
        };

        let body: Arc<[u8]> = match self.inner.codec.encode(packet) {
            Ok(body) => body.into(),
            Err(e) => {
                warn!(opcode, error = %e, "broadcast encode failed");
                self.inner.events.emit(Event::ServerError {
                    error: Arc::new(e.into()),
                });
                return 0;
            }
        };

        connections
            .iter()
            .filter(|connection| connection.enqueue_encoded(opcode, encrypted, Arc::clone(&body)))
            .count()
    }

    /// Snapshot of the tracked connections.
    pub fn connections(&self) -> Vec<Connection> {
        read(&self.inner.connections).values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        read(&self.inner.connections).len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        read(&self.inner.connections).get(&id).cloned()
    }

    /// `true` between a successful `start` and the matching `stop`.
    pub fn is_running(&self) -> bool {
        read(&self.inner.local_addr).is_some()
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *read(&self.inner.local_addr)
    }

    /// Subscribes to server and connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &PacketRegistry<Connection> {
        &self.inner.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    async fn accept_loop(
        self,
        transport: TcpTransport,
        mut shutdown: watch::Receiver<bool>,
        closed_tx: mpsc::UnboundedSender<ConnectionId>,
        mut closed_rx: mpsc::UnboundedReceiver<ConnectionId>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break,
                Some(id) = closed_rx.recv() => {
                    if write(&self.inner.connections).remove(&id).is_some() {
                        debug!(connection = %id, "reaped closed connection");
                    }
                }
                accepted = transport.accept() => match accepted {
                    Ok((stream, peer)) => self.adopt(stream, peer, &closed_tx),
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        self.inner.events.emit(Event::ServerError {
                            error: Arc::new(e.into()),
                        });
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        debug!("accept loop stopped");
    }

    fn adopt(&self, stream: TcpStream, peer: SocketAddr, closed_tx: &mpsc::UnboundedSender<ConnectionId>) {
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
                closed_tx: Some(closed_tx.clone()),
            },
        );
        write(&self.inner.connections).insert(connection.id(), connection.clone());
        self.inner.events.emit(Event::ClientConnected {
            connection: connection.id(),
            peer,
        });
    }

    async fn sweep_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break,
                _ = ticker.tick() => self.sweep(),
            }
        }
        debug!("sweep loop stopped");
    }

    /// One pass over the connection map.
    fn sweep(&self) {
        let timeout = self.inner.config.connection_timeout();
        let mut closed = Vec::new();

        for connection in self.connections() {
            match connection.state() {
                ConnectionState::Closed => closed.push(connection.id()),
                ConnectionState::Open if !connection.pumps_alive() => {
                    warn!(connection = %connection.id(), "connection pump gone, disconnecting");
                    connection.spawn_disconnect(Reason::CanNotProcess);
                }
                ConnectionState::Open => {
                    let idle = connection.idle_for();
                    if timeout.is_some_and(|timeout| idle > timeout) {
                        info!(
                            connection = %connection.id(),
                            idle_ms = idle.as_millis() as u64,
                            "connection timed out"
                        );
                        connection.spawn_disconnect(Reason::Timeout);
                    }
                }
                ConnectionState::Connecting | ConnectionState::Draining => {}
            }
        }

        if !closed.is_empty() {
            let mut connections = write(&self.inner.connections);
            for id in closed {
                connections.remove(&id);
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_addr", &self.inner.bind_addr)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
