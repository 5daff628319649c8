//! Opcode dispatch tables, built once and frozen.
//!
//! A [`PacketRegistry`] answers three questions for one [`Role`]:
//!
//! | question                                  | table                |
//! |-------------------------------------------|----------------------|
//! | which packet does an inbound opcode carry? | opcode → factory     |
//! | which opcode does an outbound type use?    | `TypeId` → opcode    |
//! | who handles an inbound opcode?             | opcode → handler     |
//!
//! All registration goes through [`RegistryBuilder`]. `build()` validates
//! the tables and consumes the builder, so a registry can be built once
//! and never modified afterwards. After that the registry is plain
//! `HashMap`s behind an `Arc`: every connection pump reads it
//! concurrently without locking.
//!
//! The registry is generic over the session type `S` that handlers
//! receive (a connection handle in practice), which keeps this crate
//! independent of the connection runtime.

use std::any::{type_name, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use opwire_protocol::{Direction, Opcode, Packet, Role};

use crate::{HandlerError, RegistrationError, ServiceScope};

/// Type-erased async packet handler.
///
/// Receives the session, the decoded packet (as `Box<dyn Packet>`) and a
/// per-invocation service scope.
pub type Handler<S> = Arc<dyn Fn(S, Box<dyn Packet>, ServiceScope) -> HandlerFuture + Send + Sync>;

/// The future a [`Handler`] returns.
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

type Factory = fn() -> Box<dyn Packet>;

fn new_packet<T: Packet + Default>() -> Box<dyn Packet> {
    Box::new(T::default())
}

#[derive(Clone, Copy)]
struct PacketEntry {
    opcode: Opcode,
    direction: Direction,
    type_id: TypeId,
    type_name: &'static str,
    factory: Factory,
}

struct HandlerEntry<S> {
    opcode: Opcode,
    packet_type: TypeId,
    type_name: &'static str,
    handler: Handler<S>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects packet and handler registrations for one role.
///
/// # Example
///
/// ```rust,ignore
/// let registry = RegistryBuilder::new(Role::Server)
///     .register_packet::<Ping>(1, Direction::ClientToServer)
///     .register_packet::<Pong>(2, Direction::ServerToClient)
///     .register_handler(1, |conn: Connection, ping: Ping, _services| async move {
///         conn.send(&Pong { timestamp: ping.timestamp + 1 });
///         Ok(())
///     })
///     .build()?;
/// ```
pub struct RegistryBuilder<S> {
    role: Role,
    packets: Vec<PacketEntry>,
    handlers: Vec<HandlerEntry<S>>,
}

impl<S: Send + 'static> RegistryBuilder<S> {
    /// Starts an empty registry for `role`.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            packets: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// The role this registry is being built for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Declares packet type `T` with its opcode and direction.
    ///
    /// Whether `T` becomes receivable, sendable or both depends on the
    /// direction relative to this builder's role.
    pub fn register_packet<T: Packet + Default>(mut self, opcode: Opcode, direction: Direction) -> Self {
        self.packets.push(PacketEntry {
            opcode,
            direction,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            factory: new_packet::<T>,
        });
        self
    }

    /// Registers the handler for inbound `opcode`.
    ///
    /// The handler receives the session, the packet already downcast to
    /// `T`, and a fresh child [`ServiceScope`] that is disposed once the
    /// returned future completes.
    pub fn register_handler<T, F, Fut>(mut self, opcode: Opcode, handler: F) -> Self
    where
        T: Packet,
        F: Fn(S, T, ServiceScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let erased: Handler<S> = Arc::new(
            move |session: S, packet: Box<dyn Packet>, scope: ServiceScope| -> HandlerFuture {
                let found = packet.type_name();
                match packet.into_any().downcast::<T>() {
                    Ok(packet) => handler(session, *packet, scope).boxed(),
                    Err(_) => future::ready(Err(HandlerError::PacketTypeMismatch {
                        opcode,
                        expected: type_name::<T>(),
                        found,
                    }))
                    .boxed(),
                }
            },
        );
        self.handlers.push(HandlerEntry {
            opcode,
            packet_type: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            handler: erased,
        });
        self
    }

    /// Validates the registrations and freezes them.
    ///
    /// # Errors
    /// - [`RegistrationError::DuplicatePacketType`] if a type is declared twice.
    /// - [`RegistrationError::DuplicateOpcode`] if two inbound (or two
    ///   outbound) types share an opcode.
    /// - [`RegistrationError::DuplicateHandler`] if two handlers share an opcode.
    /// - [`RegistrationError::MissingHandler`] if a receivable opcode has no handler.
    /// - [`RegistrationError::HandlerTypeMismatch`] if a handler's packet
    ///   type differs from the type registered for its opcode.
    ///
    /// Opcodes are checked in ascending order, so the same registrations
    /// always produce the same error.
    pub fn build(self) -> Result<PacketRegistry<S>, RegistrationError> {
        let role = self.role;

        let mut seen_types: HashMap<TypeId, &'static str> = HashMap::new();
        let mut factories: BTreeMap<Opcode, PacketEntry> = BTreeMap::new();
        let mut outbound: BTreeMap<Opcode, PacketEntry> = BTreeMap::new();

        for entry in self.packets {
            if seen_types.insert(entry.type_id, entry.type_name).is_some() {
                return Err(RegistrationError::DuplicatePacketType(entry.type_name));
            }
            if entry.direction.is_inbound_for(role) {
                claim(&mut factories, entry)?;
            }
            if entry.direction.is_outbound_for(role) {
                claim(&mut outbound, entry)?;
            }
        }

        let mut handlers: BTreeMap<Opcode, HandlerEntry<S>> = BTreeMap::new();
        for entry in self.handlers {
            if handlers.contains_key(&entry.opcode) {
                return Err(RegistrationError::DuplicateHandler(entry.opcode));
            }
            handlers.insert(entry.opcode, entry);
        }

        for (opcode, packet) in &factories {
            let Some(handler) = handlers.get(opcode) else {
                return Err(RegistrationError::MissingHandler(*opcode));
            };
            if handler.packet_type != packet.type_id {
                return Err(RegistrationError::HandlerTypeMismatch {
                    opcode: *opcode,
                    expected: handler.type_name,
                    found: packet.type_name,
                });
            }
        }

        for (opcode, handler) in &handlers {
            if !factories.contains_key(opcode) {
                tracing::warn!(
                    %role,
                    opcode,
                    packet = handler.type_name,
                    "handler registered for an opcode this role never receives"
                );
            }
        }

        let registry = PacketRegistry {
            role,
            factories: factories.into_iter().collect(),
            opcodes: outbound
                .into_values()
                .map(|entry| (entry.type_id, entry.opcode))
                .collect(),
            handlers: handlers
                .into_iter()
                .map(|(opcode, entry)| (opcode, entry.handler))
                .collect(),
        };
        tracing::debug!(
            %role,
            inbound = registry.inbound_count(),
            outbound = registry.outbound_count(),
            handlers = registry.handler_count(),
            "packet registry built"
        );
        Ok(registry)
    }
}

impl<S> fmt::Debug for RegistryBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("role", &self.role)
            .field("packets", &self.packets.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

fn claim(
    table: &mut BTreeMap<Opcode, PacketEntry>,
    entry: PacketEntry,
) -> Result<(), RegistrationError> {
    if let Some(existing) = table.get(&entry.opcode) {
        return Err(RegistrationError::DuplicateOpcode {
            opcode: entry.opcode,
            existing: existing.type_name,
            duplicate: entry.type_name,
        });
    }
    table.insert(entry.opcode, entry);
    Ok(())
}

// ---------------------------------------------------------------------------
// Frozen registry
// ---------------------------------------------------------------------------

/// Immutable opcode tables for one role.
pub struct PacketRegistry<S> {
    role: Role,
    factories: HashMap<Opcode, PacketEntry>,
    opcodes: HashMap<TypeId, Opcode>,
    handlers: HashMap<Opcode, Handler<S>>,
}

impl<S: Send + 'static> PacketRegistry<S> {
    /// Shorthand for [`RegistryBuilder::new`].
    pub fn builder(role: Role) -> RegistryBuilder<S> {
        RegistryBuilder::new(role)
    }

    /// The role these tables were built for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Creates an empty packet for an inbound opcode, ready to be decoded.
    pub fn get_message(&self, opcode: Opcode) -> Option<Box<dyn Packet>> {
        self.factories.get(&opcode).map(|entry| (entry.factory)())
    }

    /// Looks up the outbound opcode for a packet's concrete type.
    pub fn get_opcode(&self, packet: &dyn Packet) -> Option<Opcode> {
        self.opcodes.get(&packet.as_any().type_id()).copied()
    }

    /// Looks up the outbound opcode for type `T`.
    pub fn opcode_of<T: Packet>(&self) -> Option<Opcode> {
        self.opcodes.get(&TypeId::of::<T>()).copied()
    }

    /// Returns the handler for an inbound opcode.
    pub fn try_get_handler(&self, opcode: Opcode) -> Option<Handler<S>> {
        self.handlers.get(&opcode).cloned()
    }

    /// Returns `true` if this role can decode `opcode`.
    pub fn is_receivable(&self, opcode: Opcode) -> bool {
        self.factories.contains_key(&opcode)
    }

    /// Number of receivable opcodes.
    pub fn inbound_count(&self) -> usize {
        self.factories.len()
    }

    /// Number of sendable packet types.
    pub fn outbound_count(&self) -> usize {
        self.opcodes.len()
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Runs the handler for `opcode` in a child of `services`.
    ///
    /// Errors returned by the handler, and panics raised while building or
    /// polling its future, are handed back to the caller; nothing is
    /// swallowed here.
    ///
    /// # Errors
    /// [`HandlerError::NotFound`] if no handler is registered, otherwise
    /// whatever the handler produced.
    pub async fn invoke_handler(
        &self,
        opcode: Opcode,
        session: S,
        packet: Box<dyn Packet>,
        services: &ServiceScope,
    ) -> Result<(), HandlerError> {
        let handler = self
            .try_get_handler(opcode)
            .ok_or(HandlerError::NotFound(opcode))?;

        let scope = services.begin_scope();
        let child = scope.clone();
        // Handlers may panic before handing back a future, so the call
        // itself runs inside the guard.
        let call = future::lazy(move |_| handler(session, packet, child)).flatten();
        let result = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        };
        scope.dispose();
        result
    }
}

impl<S> fmt::Debug for PacketRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRegistry")
            .field("role", &self.role)
            .field("inbound", &self.factories.len())
            .field("outbound", &self.opcodes.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
