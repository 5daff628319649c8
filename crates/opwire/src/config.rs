//! Server, client and connection configuration.
//!
//! Every config derives serde with `#[serde(default)]`, so a partial
//! document (JSON, TOML, environment-driven) fills in the rest from
//! [`Default`]. Call `validated()` before use; it clamps out-of-range
//! values and logs what it changed.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use opwire_transport::FrameConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::OpwireError;

/// Highest port either side may use.
pub const MAX_PORT: u16 = 65534;

// ---------------------------------------------------------------------------
// Drain timeout
// ---------------------------------------------------------------------------

/// How long a disconnect waits for in-flight inbound work.
///
/// Serialized as whole seconds: `0` is [`Immediate`](Self::Immediate), a
/// negative number is [`Unbounded`](Self::Unbounded), anything else is
/// [`Bounded`](Self::Bounded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum DrainTimeout {
    /// Close without waiting.
    Immediate,
    /// Wait up to the given duration.
    Bounded(Duration),
    /// Wait until the inbound queue is empty and no handler is running.
    Unbounded,
}

impl DrainTimeout {
    /// Maps whole seconds onto a drain policy.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            0 => Self::Immediate,
            s if s < 0 => Self::Unbounded,
            s => Self::Bounded(Duration::from_secs(s.unsigned_abs())),
        }
    }
}

impl Default for DrainTimeout {
    fn default() -> Self {
        Self::Bounded(Duration::from_secs(30))
    }
}

impl From<i64> for DrainTimeout {
    fn from(secs: i64) -> Self {
        Self::from_secs(secs)
    }
}

impl From<DrainTimeout> for i64 {
    fn from(timeout: DrainTimeout) -> Self {
        match timeout {
            DrainTimeout::Immediate => 0,
            DrainTimeout::Unbounded => -1,
            DrainTimeout::Bounded(d) => i64::try_from(d.as_secs().max(1)).unwrap_or(i64::MAX),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Per-connection settings shared by servers and clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Wait policy for in-flight inbound work on disconnect.
    pub drain_timeout: DrainTimeout,
    /// Largest frame body accepted or sent, in bytes. Default: 16 MiB.
    pub max_frame_body: usize,
    /// Time allowed to flush already-queued outbound frames on close, in
    /// milliseconds. Default: 5000.
    pub close_flush_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            drain_timeout: DrainTimeout::default(),
            max_frame_body: FrameConfig::DEFAULT_MAX_BODY_LEN,
            close_flush_timeout_ms: 5_000,
        }
    }
}

impl ConnectionConfig {
    /// Clamps out-of-range values.
    pub fn validated(mut self) -> Self {
        let max = i32::MAX as usize;
        if self.max_frame_body == 0 {
            warn!(
                default = FrameConfig::DEFAULT_MAX_BODY_LEN,
                "max_frame_body of 0 would reject every frame, using default"
            );
            self.max_frame_body = FrameConfig::DEFAULT_MAX_BODY_LEN;
        } else if self.max_frame_body > max {
            warn!(
                requested = self.max_frame_body,
                max, "max_frame_body exceeds the wire limit, clamping"
            );
            self.max_frame_body = max;
        }
        self
    }

    /// Final flush window on close.
    pub fn close_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.close_flush_timeout_ms)
    }

    pub(crate) fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_body_len: self.max_frame_body,
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Settings for a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to listen on.
    pub host: String,
    /// Port to listen on, `0` for an ephemeral port.
    pub port: u16,
    /// Idle time after which the sweep disconnects a connection with
    /// [`Reason::Timeout`](crate::Reason::Timeout). `0` disables it.
    pub connection_timeout_secs: u64,
    /// Period of the timeout sweep, in milliseconds. Default: 10000.
    pub sweep_interval_ms: u64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Settings applied to every accepted connection.
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            connection_timeout_secs: 30,
            sweep_interval_ms: 10_000,
            event_capacity: 1024,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Smallest accepted sweep period.
    pub const MIN_SWEEP_INTERVAL_MS: u64 = 10;

    /// Clamps out-of-range values.
    pub fn validated(mut self) -> Self {
        if self.sweep_interval_ms < Self::MIN_SWEEP_INTERVAL_MS {
            warn!(
                requested = self.sweep_interval_ms,
                min = Self::MIN_SWEEP_INTERVAL_MS,
                "sweep_interval_ms below minimum, clamping"
            );
            self.sweep_interval_ms = Self::MIN_SWEEP_INTERVAL_MS;
        }
        if self.event_capacity == 0 {
            warn!("event_capacity of 0 is not allowed, using 1");
            self.event_capacity = 1;
        }
        self.connection = self.connection.validated();
        self
    }

    /// Period of the timeout sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Idle timeout, or `None` when disabled.
    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_secs > 0).then(|| Duration::from_secs(self.connection_timeout_secs))
    }

    /// Resolves the listen address.
    ///
    /// # Errors
    /// [`OpwireError::InvalidHost`] if `host` is not an IP address,
    /// [`OpwireError::InvalidPort`] if `port` is above [`MAX_PORT`].
    pub fn bind_addr(&self) -> Result<SocketAddr, OpwireError> {
        socket_addr(&self.host, self.port, 0)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Settings for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server IP address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Settings for the client's connection.
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            event_capacity: 1024,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Clamps out-of-range values.
    pub fn validated(mut self) -> Self {
        if self.event_capacity == 0 {
            warn!("event_capacity of 0 is not allowed, using 1");
            self.event_capacity = 1;
        }
        self.connection = self.connection.validated();
        self
    }

    /// Resolves the server address.
    ///
    /// # Errors
    /// [`OpwireError::InvalidHost`] if `host` is not an IP address,
    /// [`OpwireError::InvalidPort`] unless `port` is in `1..=65534`.
    pub fn server_addr(&self) -> Result<SocketAddr, OpwireError> {
        socket_addr(&self.host, self.port, 1)
    }
}

fn socket_addr(host: &str, port: u16, min_port: u16) -> Result<SocketAddr, OpwireError> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| OpwireError::InvalidHost(host.to_string()))?;
    if !(min_port..=MAX_PORT).contains(&port) {
        return Err(OpwireError::InvalidPort(port));
    }
    Ok(SocketAddr::new(ip, port))
}
