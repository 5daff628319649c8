//! One live peer: three pumps over a split byte stream.
//!
//! ```text
//!              ┌──────────── read loop ────────────┐
//!  socket ───→ │ frame → decrypt → decode → queue  │ ───→ inbound queue
//!              └───────────────────────────────────┘            │
//!                                                               ▼
//!              ┌────────── dispatch loop ──────────┐
//!              │ pop → invoke handler → event      │
//!              └───────────────────────────────────┘
//!
//!  send() ───→ outbound queue ───→ ┌─── flush loop ───┐ ───→ socket
//!                                  │ pop → write frame │
//!                                  └───────────────────┘
//! ```
//!
//! Both queues are unbounded FIFO channels, so ordering holds per
//! connection. A slow peer or slow handlers grow the queues without limit.
//!
//! # Shutdown
//!
//! `disconnect` moves the connection to `Draining`, stops the read loop,
//! waits for queued inbound work per [`DrainTimeout`], then closes:
//! outbound frames already queued get one bounded flush, the service
//! scope is disposed and `Disconnected` is emitted.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use opwire_protocol::{Codec, EncryptionProvider, Frame, Opcode, Packet};
use opwire_registry::{PacketRegistry, ServiceScope};
use opwire_transport::{ConnectionId, FrameReader, FrameWriter, TransportError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectionConfig, DrainTimeout};
use crate::event::{Event, EventSink, QueueDirection, Reason};
use crate::OpwireError;

const DRAIN_POLL: Duration = Duration::from_millis(10);

tokio::task_local! {
    /// Set while a connection's dispatch loop is running one of its handlers.
    static DISPATCHING: ConnectionId;
}

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Pumps are being spawned.
    Connecting = 0,
    /// Reading, dispatching and writing.
    Open = 1,
    /// Reading has stopped; queued inbound work is finishing.
    Draining = 2,
    /// Everything has stopped.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// An encoded frame waiting for the flush loop.
#[derive(Debug)]
struct PendingOutbound {
    opcode: Opcode,
    encrypted: bool,
    body: Arc<[u8]>,
}

/// A decoded packet waiting for the dispatch loop.
#[derive(Debug)]
struct PendingInbound {
    opcode: Opcode,
    encrypted: bool,
    packet: Box<dyn Packet>,
}

struct Tasks {
    read: JoinHandle<()>,
    flush: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

/// Everything a connection borrows from its owning server or client.
pub(crate) struct ConnectionParts {
    pub(crate) registry: Arc<PacketRegistry<Connection>>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) scope: ServiceScope,
    pub(crate) events: EventSink,
    pub(crate) config: ConnectionConfig,
    /// Receives this connection's id once it is closed.
    pub(crate) closed_tx: Option<mpsc::UnboundedSender<ConnectionId>>,
}

struct Inner {
    id: ConnectionId,
    peer: SocketAddr,
    connected_at: SystemTime,
    started: Instant,
    /// Milliseconds after `started` at which the last frame arrived.
    last_activity_ms: AtomicU64,
    state: AtomicU8,
    registry: Arc<PacketRegistry<Connection>>,
    codec: Arc<dyn Codec>,
    scope: ServiceScope,
    events: EventSink,
    config: ConnectionConfig,
    outbound_tx: mpsc::UnboundedSender<PendingOutbound>,
    pending_inbound: AtomicUsize,
    pending_outbound: AtomicUsize,
    running_handler: AtomicBool,
    stop_reading: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    tasks: Mutex<Option<Tasks>>,
    closed_tx: Option<mpsc::UnboundedSender<ConnectionId>>,
}

/// Handle to one connected peer.
///
/// Cheap to clone; every clone drives the same connection. Handlers
/// receive one as their first argument and use it to reply.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Starts the three pumps over `reader`/`writer` and returns the handle.
    pub(crate) fn spawn<R, W>(reader: R, writer: W, peer: SocketAddr, parts: ConnectionParts) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let frame_config = parts.config.frame_config();

        let connection = Connection {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                peer,
                connected_at: SystemTime::now(),
                started: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                registry: parts.registry,
                codec: parts.codec,
                scope: parts.scope,
                events: parts.events,
                config: parts.config,
                outbound_tx,
                pending_inbound: AtomicUsize::new(0),
                pending_outbound: AtomicUsize::new(0),
                running_handler: AtomicBool::new(false),
                stop_reading: watch::Sender::new(false),
                shutdown: watch::Sender::new(false),
                closed: watch::Sender::new(false),
                tasks: Mutex::new(None),
                closed_tx: parts.closed_tx,
            }),
        };

        // Held while spawning so a fast close cannot miss the handles.
        let mut tasks = lock(&connection.inner.tasks);
        let _ = connection.inner.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        info!(connection = %connection.id(), %peer, "connection opened");
        connection.emit(Event::Connected {
            connection: connection.id(),
            peer,
        });

        *tasks = Some(Tasks {
            read: tokio::spawn(
                connection
                    .clone()
                    .read_loop(FrameReader::new(reader, frame_config), inbound_tx),
            ),
            flush: tokio::spawn(
                connection
                    .clone()
                    .flush_loop(FrameWriter::new(writer, frame_config), outbound_rx),
            ),
            dispatch: tokio::spawn(connection.clone().dispatch_loop(inbound_rx)),
        });
        drop(tasks);

        connection
    }

    // -----------------------------------------------------------------------
    // Pumps
    // -----------------------------------------------------------------------

    async fn read_loop<R: AsyncRead + Unpin>(
        self,
        mut frames: FrameReader<R>,
        inbound: mpsc::UnboundedSender<PendingInbound>,
    ) {
        let mut stop = self.inner.stop_reading.subscribe();
        loop {
            let frame = tokio::select! {
                biased;
                _ = signalled(&mut stop) => break,
                frame = frames.read_frame() => frame,
            };

            match frame {
                Ok(Some(frame)) => {
                    if let Err(reason) = self.accept_frame(frame, &inbound) {
                        self.spawn_disconnect(reason);
                        break;
                    }
                }
                Ok(None) => {
                    debug!(connection = %self.id(), "peer closed the stream");
                    self.spawn_disconnect(Reason::ConnectionClosed);
                    break;
                }
                Err(e) => {
                    let reason = match e {
                        TransportError::FrameTooLarge { .. } | TransportError::Header(_) => {
                            Reason::InvalidPacket
                        }
                        _ => Reason::NetworkStreamReadError,
                    };
                    self.report(e.into(), reason);
                    self.spawn_disconnect(reason);
                    break;
                }
            }
        }
        trace!(connection = %self.id(), "read loop stopped");
    }

    /// Decodes one frame and queues it for dispatch. An `Err` carries the
    /// reason the connection must be torn down with.
    fn accept_frame(
        &self,
        frame: Frame,
        inbound: &mpsc::UnboundedSender<PendingInbound>,
    ) -> Result<(), Reason> {
        self.touch();
        let Frame {
            opcode,
            encrypted,
            body,
        } = frame;

        let Some(mut packet) = self.inner.registry.get_message(opcode) else {
            debug!(connection = %self.id(), opcode, len = body.len(), "unknown opcode, skipping frame");
            self.emit(Event::UnknownPacketReceived {
                connection: self.id(),
                opcode,
                encrypted,
                length: body.len(),
                body: body.into(),
            });
            return Ok(());
        };

        let body = if encrypted {
            let Some(provider) = self.encryption() else {
                let reason = Reason::EncryptionProviderNotFound;
                self.report(OpwireError::EncryptionProviderNotFound { opcode }, reason);
                return Err(reason);
            };
            match provider.decrypt(&body) {
                Ok(plain) => plain,
                Err(e) => {
                    self.report(e.into(), Reason::InvalidPacket);
                    return Err(Reason::InvalidPacket);
                }
            }
        } else {
            body
        };

        if let Err(e) = self.inner.codec.decode(&mut *packet, &body) {
            self.report(e.into(), Reason::InvalidPacket);
            return Err(Reason::InvalidPacket);
        }

        self.inner.pending_inbound.fetch_add(1, Ordering::SeqCst);
        if inbound
            .send(PendingInbound {
                opcode,
                encrypted,
                packet,
            })
            .is_err()
        {
            self.inner.pending_inbound.fetch_sub(1, Ordering::SeqCst);
            return Err(Reason::PacketReceiveQueueError);
        }
        self.emit(Event::PacketQueued {
            connection: self.id(),
            opcode,
            encrypted,
            direction: QueueDirection::Incoming,
        });
        Ok(())
    }

    async fn flush_loop<W: AsyncWrite + Unpin>(
        self,
        mut frames: FrameWriter<W>,
        mut outbound: mpsc::UnboundedReceiver<PendingOutbound>,
    ) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let pending = tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break,
                pending = outbound.recv() => match pending {
                    Some(pending) => pending,
                    None => break,
                },
            };
            if let Err(e) = self.write_pending(&mut frames, pending).await {
                self.report(e.into(), Reason::PacketTransmissionError);
                self.spawn_disconnect(Reason::PacketTransmissionError);
                return;
            }
        }

        // Best-effort final flush of what was queued before close.
        while let Ok(pending) = outbound.try_recv() {
            if let Err(e) = self.write_pending(&mut frames, pending).await {
                debug!(connection = %self.id(), error = %e, "final flush failed");
                return;
            }
        }
        if let Err(e) = frames.shutdown().await {
            trace!(connection = %self.id(), error = %e, "write shutdown failed");
        }
        trace!(connection = %self.id(), "flush loop stopped");
    }

    async fn write_pending<W: AsyncWrite + Unpin>(
        &self,
        frames: &mut FrameWriter<W>,
        pending: PendingOutbound,
    ) -> Result<(), TransportError> {
        self.inner.pending_outbound.fetch_sub(1, Ordering::SeqCst);
        frames
            .write_frame(pending.opcode, pending.encrypted, &pending.body)
            .await
    }

    async fn dispatch_loop(self, mut inbound: mpsc::UnboundedReceiver<PendingInbound>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let PendingInbound {
                opcode,
                encrypted,
                packet,
            } = tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break,
                next = inbound.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            // Flag first so a drain never sees an idle gap mid-packet.
            self.inner.running_handler.store(true, Ordering::SeqCst);
            self.inner.pending_inbound.fetch_sub(1, Ordering::SeqCst);

            if self.inner.registry.try_get_handler(opcode).is_none() {
                warn!(connection = %self.id(), opcode, "no handler for packet");
                self.emit(Event::MessageHandlerNotFound {
                    connection: self.id(),
                    opcode,
                    encrypted,
                });
            } else {
                let registry = Arc::clone(&self.inner.registry);
                let result = DISPATCHING
                    .scope(
                        self.id(),
                        registry.invoke_handler(opcode, self.clone(), packet, &self.inner.scope),
                    )
                    .await;
                match result {
                    Ok(()) => self.emit(Event::PacketReceived {
                        connection: self.id(),
                        opcode,
                        encrypted,
                    }),
                    Err(e) => {
                        warn!(connection = %self.id(), opcode, error = %e, "handler failed");
                        self.emit(Event::HandlerError {
                            connection: self.id(),
                            opcode,
                            error: Arc::new(e),
                        });
                    }
                }
            }

            self.inner.running_handler.store(false, Ordering::SeqCst);
        }
        trace!(connection = %self.id(), "dispatch loop stopped");
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queues `packet` for sending. Never blocks.
    ///
    /// Returns `false` if nothing was queued: the type has no outbound
    /// opcode for this role (an `UnknownPacketSendAttempted` event is
    /// emitted), encoding failed, or the connection is closed.
    pub fn send<P: Packet>(&self, packet: &P) -> bool {
        self.enqueue(packet, false)
    }

    /// Like [`send`](Self::send), but encrypts the body with the
    /// `Arc<dyn EncryptionProvider>` registered in the service container.
    ///
    /// Without a provider the send is aborted and a `ConnectionError`
    /// event is emitted; the connection stays up.
    pub fn send_encrypted<P: Packet>(&self, packet: &P) -> bool {
        self.enqueue(packet, true)
    }

    fn enqueue(&self, packet: &dyn Packet, encrypted: bool) -> bool {
        let Some(opcode) = self.inner.registry.get_opcode(packet) else {
            warn!(
                connection = %self.id(),
                packet = packet.type_name(),
                "send of a packet type with no outbound opcode"
            );
            self.emit(Event::UnknownPacketSendAttempted {
                connection: self.id(),
                packet_type: packet.type_name(),
                encrypted,
            });
            return false;
        };

        match self.inner.codec.encode(packet) {
            Ok(body) => self.enqueue_encoded(opcode, encrypted, body.into()),
            Err(e) => {
                self.report(e.into(), Reason::Unknown);
                false
            }
        }
    }

    /// Queues an already encoded body. Broadcasts share one `body`
    /// across connections; encryption happens here, per connection.
    pub(crate) fn enqueue_encoded(&self, opcode: Opcode, encrypted: bool, body: Arc<[u8]>) -> bool {
        if self.state() == ConnectionState::Closed {
            debug!(connection = %self.id(), opcode, "dropping send on closed connection");
            return false;
        }

        let body: Arc<[u8]> = if encrypted {
            let Some(provider) = self.encryption() else {
                self.report(
                    OpwireError::EncryptionProviderNotFound { opcode },
                    Reason::EncryptionProviderNotFound,
                );
                return false;
            };
            match provider.encrypt(&body) {
                Ok(cipher) => cipher.into(),
                Err(e) => {
                    self.report(e.into(), Reason::Unknown);
                    return false;
                }
            }
        } else {
            body
        };

        let max = self.inner.config.max_frame_body;
        if body.len() > max {
            self.report(
                TransportError::FrameTooLarge {
                    len: body.len(),
                    max,
                }
                .into(),
                Reason::Unknown,
            );
            return false;
        }

        self.inner.pending_outbound.fetch_add(1, Ordering::SeqCst);
        let pending = PendingOutbound {
            opcode,
            encrypted,
            body,
        };
        if self.inner.outbound_tx.send(pending).is_err() {
            self.inner.pending_outbound.fetch_sub(1, Ordering::SeqCst);
            let reason = Reason::PacketSendQueueError;
            self.report(
                TransportError::ConnectionClosed("outbound queue closed".into()).into(),
                reason,
            );
            self.spawn_disconnect(reason);
            return false;
        }

        self.emit(Event::PacketQueued {
            connection: self.id(),
            opcode,
            encrypted,
            direction: QueueDirection::Outgoing,
        });
        true
    }

    // -----------------------------------------------------------------------
    // Disconnect
    // -----------------------------------------------------------------------

    /// Drains and closes the connection.
    ///
    /// Only the first call drives the shutdown; later calls return at once.
    /// Use [`closed`](Self::closed) to wait for the end regardless of who
    /// started it.
    ///
    /// Called from one of this connection's own handlers, the shutdown is
    /// moved to a separate task and this returns immediately, since the
    /// drain would otherwise wait on the very handler that called it.
    pub async fn disconnect(&self, reason: Reason) {
        let inside_own_handler = DISPATCHING
            .try_with(|id| *id == self.id())
            .unwrap_or(false);
        if inside_own_handler {
            self.spawn_disconnect(reason);
            return;
        }
        self.shutdown(reason).await;
    }

    /// Runs [`disconnect`](Self::disconnect) on a new task.
    pub(crate) fn spawn_disconnect(&self, reason: Reason) {
        let connection = self.clone();
        tokio::spawn(async move { connection.shutdown(reason).await });
    }

    async fn shutdown(&self, reason: Reason) {
        let draining = self.inner.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
            match ConnectionState::from_u8(state) {
                ConnectionState::Connecting | ConnectionState::Open => {
                    Some(ConnectionState::Draining as u8)
                }
                ConnectionState::Draining | ConnectionState::Closed => None,
            }
        });
        if draining.is_err() {
            return;
        }

        debug!(connection = %self.id(), %reason, "draining");
        self.inner.stop_reading.send_replace(true);
        self.drain().await;
        self.close(reason).await;
    }

    async fn drain(&self) {
        let deadline = match self.inner.config.drain_timeout {
            DrainTimeout::Immediate => return,
            DrainTimeout::Bounded(limit) => Some(Instant::now() + limit),
            DrainTimeout::Unbounded => None,
        };

        while self.pending_inbound() > 0 || self.is_running_handler() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(
                    connection = %self.id(),
                    pending = self.pending_inbound(),
                    "drain timed out, dropping queued packets"
                );
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    async fn close(&self, reason: Reason) {
        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        let tasks = lock(&self.inner.tasks).take();
        if let Some(Tasks {
            read,
            mut flush,
            dispatch,
        }) = tasks
        {
            read.abort();
            dispatch.abort();
            let window = self.inner.config.close_flush_timeout();
            if tokio::time::timeout(window, &mut flush).await.is_err() {
                debug!(connection = %self.id(), "final flush timed out");
                flush.abort();
            }
        }
        self.inner.running_handler.store(false, Ordering::SeqCst);
        self.inner.scope.dispose();

        info!(connection = %self.id(), %reason, "connection closed");
        self.emit(Event::Disconnected {
            connection: self.id(),
            reason,
        });
        if let Some(closed_tx) = &self.inner.closed_tx {
            let _ = closed_tx.send(self.id());
        }
        self.inner.closed.send_replace(true);
    }

    /// Resolves once the connection reaches [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        signalled(&mut self.inner.closed.subscribe()).await;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Process-unique id.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Wall-clock time the connection was opened.
    pub fn connected_at(&self) -> SystemTime {
        self.inner.connected_at
    }

    /// Wall-clock time the last frame was received, or `connected_at`
    /// if none has arrived yet.
    pub fn last_activity(&self) -> SystemTime {
        self.inner.connected_at + Duration::from_millis(self.last_activity_ms())
    }

    /// Time since the last frame was received.
    pub fn idle_for(&self) -> Duration {
        self.inner
            .started
            .elapsed()
            .saturating_sub(Duration::from_millis(self.last_activity_ms()))
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Packets decoded but not yet handed to a handler.
    pub fn pending_inbound(&self) -> usize {
        self.inner.pending_inbound.load(Ordering::SeqCst)
    }

    /// Frames queued but not yet written.
    pub fn pending_outbound(&self) -> usize {
        self.inner.pending_outbound.load(Ordering::SeqCst)
    }

    /// `true` while a handler for this connection is executing.
    pub fn is_running_handler(&self) -> bool {
        self.inner.running_handler.load(Ordering::SeqCst)
    }

    /// The connection-lifetime service scope.
    pub fn services(&self) -> &ServiceScope {
        &self.inner.scope
    }

    /// `false` once the read or dispatch pump has exited, for whatever
    /// reason.
    pub(crate) fn pumps_alive(&self) -> bool {
        lock(&self.inner.tasks)
            .as_ref()
            .is_some_and(|tasks| !tasks.read.is_finished() && !tasks.dispatch.is_finished())
    }

    fn last_activity_ms(&self) -> u64 {
        self.inner.last_activity_ms.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        let elapsed = self.inner.started.elapsed().as_millis();
        self.inner
            .last_activity_ms
            .store(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn encryption(&self) -> Option<Arc<dyn EncryptionProvider>> {
        self.inner.scope.resolve::<Arc<dyn EncryptionProvider>>()
    }

    fn emit(&self, event: Event) {
        self.inner.events.emit(event);
    }

    fn report(&self, error: OpwireError, reason: Reason) {
        warn!(connection = %self.id(), error = %error, %reason, "connection error");
        self.emit(Event::ConnectionError {
            connection: self.id(),
            error: Arc::new(error),
            reason,
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves once the flag is `true`, or its sender is gone.
pub(crate) async fn signalled(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
