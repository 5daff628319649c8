//! Unified error type for the opwire facade.

use std::sync::Arc;

use opwire_protocol::{CodecError, EncryptionError, Opcode};
use opwire_registry::{HandlerError, RegistrationError};
use opwire_transport::TransportError;

/// Top-level error that wraps every sub-crate error.
///
/// Sub-crate errors convert through `#[from]`, so `?` works across layer
/// boundaries. The remaining variants belong to the server and client
/// lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum OpwireError {
    /// Socket, framing, bind or connect failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A packet body could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The packet registry failed validation.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// A packet handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The encryption provider rejected a body.
    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    /// An encrypted frame was sent or received without a provider in scope.
    #[error("no encryption provider registered (opcode {opcode})")]
    EncryptionProviderNotFound {
        /// Opcode of the frame that needed the provider.
        opcode: Opcode,
    },

    /// Every connection attempt failed.
    #[error("failed to connect to {addr} after {attempts} attempt(s): {source}")]
    ConnectionFailed {
        /// Address that was dialed.
        addr: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last failure.
        #[source]
        source: TransportError,
    },

    /// The configured port is outside the allowed range.
    #[error("invalid port {0}")]
    InvalidPort(u16),

    /// The configured host is not an IP address.
    #[error("invalid host {0:?}: expected an IP address")]
    InvalidHost(String),

    /// `start` was called on a running server.
    #[error("server already started")]
    AlreadyStarted,

    /// `stop` was called on a server that is not running.
    #[error("server not started")]
    NotStarted,

    /// The listener could not be bound.
    #[error("server failed to start on {addr}: {source}")]
    StartFailed {
        /// Address the server tried to bind.
        addr: String,
        /// Underlying bind error, shared with the `ServerError` event.
        #[source]
        source: Arc<TransportError>,
    },

    /// `connect` was called while a connection is still live.
    #[error("client already connected")]
    AlreadyConnected,

    /// The client has no live connection.
    #[error("client not connected")]
    NotConnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let opwire_err: OpwireError = err.into();
        assert!(matches!(opwire_err, OpwireError::Transport(_)));
        assert!(opwire_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_codec_error() {
        let err = CodecError::InvalidBool(7);
        let opwire_err: OpwireError = err.into();
        assert!(matches!(opwire_err, OpwireError::Codec(_)));
    }

    #[test]
    fn test_from_registration_error() {
        let err = RegistrationError::MissingHandler(3);
        let opwire_err: OpwireError = err.into();
        assert!(matches!(
            opwire_err,
            OpwireError::Registration(RegistrationError::MissingHandler(3))
        ));
    }

    #[test]
    fn test_from_handler_error() {
        let opwire_err: OpwireError = HandlerError::msg("boom").into();
        assert!(matches!(opwire_err, OpwireError::Handler(_)));
        assert!(opwire_err.to_string().contains("boom"));
    }

    #[test]
    fn test_connection_failed_keeps_source() {
        let err = OpwireError::ConnectionFailed {
            addr: "127.0.0.1:1".into(),
            attempts: 3,
            source: TransportError::ConnectionClosed("refused".into()),
        };
        assert!(err.to_string().contains("3 attempt"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
