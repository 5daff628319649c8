//! TCP listener and connector.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::TransportError;

/// A bound TCP listener that hands out accepted sockets.
#[derive(Debug)]
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds a new listener to `addr` (e.g. `"127.0.0.1:0"`).
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::BindFailed {
                addr: addr.to_string(),
                source,
            })?;
        tracing::info!(addr, "tcp transport listening");
        Ok(Self { listener })
    }

    /// Returns the address the listener is actually bound to.
    ///
    /// Useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for the next incoming socket.
    ///
    /// Nagle's algorithm is disabled on every accepted socket; frames are
    /// written whole, so batching only adds latency.
    ///
    /// Cancel safe: dropping the future never loses a connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(%addr, error = %e, "failed to set TCP_NODELAY");
        }
        tracing::debug!(%addr, "accepted tcp connection");
        Ok((stream, addr))
    }
}

/// Opens a TCP connection to `addr`.
pub async fn connect(addr: &str) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::ConnectFailed {
            addr: addr.to_string(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(addr, error = %e, "failed to set TCP_NODELAY");
    }
    tracing::debug!(addr, "tcp connection established");
    Ok(stream)
}
