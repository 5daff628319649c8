//! Packet registry and service scopes for opwire.
//!
//! - [`RegistryBuilder`] collects `register_packet` / `register_handler`
//!   calls and validates them into an immutable [`PacketRegistry`].
//! - [`ServiceCollection`] → [`ServiceContainer`] → [`ServiceScope`]
//!   supply handlers with singleton, scoped and transient services.
//!
//! # Errors
//!
//! [`RegistrationError`] is a startup error: a registry that fails to
//! build never runs. [`HandlerError`] is a runtime error raised by
//! application handlers and reported per packet.

mod error;
mod registry;
mod services;

pub use error::{HandlerError, RegistrationError, ResolveError};
pub use registry::{Handler, HandlerFuture, PacketRegistry, RegistryBuilder};
pub use services::{Lifetime, ServiceCollection, ServiceContainer, ServiceScope};
