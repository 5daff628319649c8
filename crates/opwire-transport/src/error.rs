use opwire_protocol::CodecError;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the stream in the middle of a frame.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Writing to the socket failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Reading from the socket failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        /// Address that was requested.
        addr: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Accepting an incoming socket failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Opening an outgoing socket failed.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// Address that was dialed.
        addr: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A frame body exceeded the configured limit.
    #[error("frame body of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Body length announced or attempted.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The frame header was malformed.
    #[error("malformed frame header: {0}")]
    Header(#[from] CodecError),

    /// Any other socket-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
