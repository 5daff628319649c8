//! Error types for the registry layer.

use opwire_protocol::Opcode;

/// Startup errors raised by [`RegistryBuilder::build`](crate::RegistryBuilder::build).
///
/// All of these mean the registration code is wrong. None of them can be
/// recovered at runtime, so `build` refuses to produce a partial registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// A receivable opcode has a factory but no handler.
    #[error("no handler registered for receivable opcode {0}")]
    MissingHandler(Opcode),

    /// Two handlers claim the same opcode.
    #[error("more than one handler registered for opcode {0}")]
    DuplicateHandler(Opcode),

    /// Two packet types share an opcode in the same direction.
    #[error("opcode {opcode} is used by both {existing} and {duplicate}")]
    DuplicateOpcode {
        /// The contested opcode.
        opcode: Opcode,
        /// Type registered first.
        existing: &'static str,
        /// Type that collided with it.
        duplicate: &'static str,
    },

    /// The same packet type was registered more than once.
    #[error("packet type {0} registered more than once")]
    DuplicatePacketType(&'static str),

    /// A handler expects a different packet type than the opcode decodes to.
    #[error("handler for opcode {opcode} expects {expected}, but the opcode decodes to {found}")]
    HandlerTypeMismatch {
        /// The opcode in question.
        opcode: Opcode,
        /// Packet type in the handler signature.
        expected: &'static str,
        /// Packet type registered for the opcode.
        found: &'static str,
    },
}

/// Failure reported by an application handler.
///
/// Handlers return `Result<(), HandlerError>`. Any error or panic is caught
/// per packet by the dispatch loop, reported, and the next packet is
/// processed as usual.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler returned an application error.
    #[error("handler failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// A required service could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// No handler exists for the opcode.
    #[error("no handler registered for opcode {0}")]
    NotFound(Opcode),

    /// The routed packet was not of the type the handler expects.
    #[error("handler for opcode {opcode} expected {expected}, got {found}")]
    PacketTypeMismatch {
        /// The opcode being dispatched.
        opcode: Opcode,
        /// Type the handler expects.
        expected: &'static str,
        /// Type that arrived.
        found: &'static str,
    },
}

impl HandlerError {
    /// Wraps any error type.
    pub fn new(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Failed(Box::new(error))
    }

    /// Creates an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Failed(message.into())
    }
}

/// Errors from the service container.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Nothing is registered for the requested type.
    #[error("service {0} is not registered")]
    NotRegistered(&'static str),

    /// The scope was disposed before the call.
    #[error("service scope has been disposed")]
    Disposed,
}
