//! Registry build validation and handler dispatch.

use std::sync::{Arc, Mutex};

use opwire_protocol::{CodecError, Direction, PacketReader, PacketWriter, Readable, Role, Writeable};
use opwire_registry::{
    HandlerError, PacketRegistry, RegistrationError, RegistryBuilder, ServiceCollection,
    ServiceContainer, ServiceScope,
};

// =========================================================================
// Test packets and session
// =========================================================================

macro_rules! timestamp_packet {
    ($name:ident) => {
        #[derive(Debug, Default, Clone, PartialEq)]
        struct $name {
            timestamp: i64,
        }

        impl Readable for $name {
            fn read(&mut self, r: &mut PacketReader<'_>) -> Result<(), CodecError> {
                self.timestamp = r.read_i64()?;
                Ok(())
            }
        }

        impl Writeable for $name {
            fn write(&self, w: &mut PacketWriter) {
                w.write_i64(self.timestamp);
            }
        }
    };
}

timestamp_packet!(Ping);
timestamp_packet!(Pong);
timestamp_packet!(Hello);

const PING: i32 = 1;
const PONG: i32 = 2;
const HELLO: i32 = 3;

/// Stand-in for a connection: records what handlers saw.
type Log = Arc<Mutex<Vec<i64>>>;

async fn record_ping(log: Log, ping: Ping, _services: ServiceScope) -> Result<(), HandlerError> {
    log.lock().unwrap().push(ping.timestamp);
    Ok(())
}

async fn record_hello(log: Log, hello: Hello, _services: ServiceScope) -> Result<(), HandlerError> {
    log.lock().unwrap().push(-hello.timestamp);
    Ok(())
}

fn server_builder() -> RegistryBuilder<Log> {
    RegistryBuilder::new(Role::Server)
        .register_packet::<Ping>(PING, Direction::ClientToServer)
        .register_packet::<Pong>(PONG, Direction::ServerToClient)
}

// =========================================================================
// Build validation
// =========================================================================

#[test]
fn test_missing_handler_fails_build() {
    let err = server_builder().build().unwrap_err();
    assert_eq!(err, RegistrationError::MissingHandler(PING));
}

#[test]
fn test_duplicate_handler_fails_build() {
    let err = server_builder()
        .register_handler(PING, record_ping)
        .register_handler(PING, record_ping)
        .build()
        .unwrap_err();
    assert_eq!(err, RegistrationError::DuplicateHandler(PING));
}

#[test]
fn test_duplicate_outbound_opcode_is_rejected() {
    let err = RegistryBuilder::<Log>::new(Role::Server)
        .register_packet::<Pong>(PONG, Direction::ServerToClient)
        .register_packet::<Hello>(PONG, Direction::ServerToClient)
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        RegistrationError::DuplicateOpcode { opcode: PONG, .. }
    ));
}

#[test]
fn test_duplicate_inbound_opcode_is_rejected() {
    let err = RegistryBuilder::<Log>::new(Role::Server)
        .register_packet::<Ping>(PING, Direction::ClientToServer)
        .register_packet::<Hello>(PING, Direction::Bidirectional)
        .register_handler(PING, record_ping)
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        RegistrationError::DuplicateOpcode { opcode: PING, .. }
    ));
}

#[test]
fn test_same_opcode_in_opposite_directions_is_fine() {
    // Client-sent and server-sent catalogs are independent.
    let registry = RegistryBuilder::<Log>::new(Role::Server)
        .register_packet::<Ping>(7, Direction::ClientToServer)
        .register_packet::<Pong>(7, Direction::ServerToClient)
        .register_handler(7, record_ping)
        .build()
        .unwrap();
    assert!(registry.is_receivable(7));
    assert_eq!(registry.opcode_of::<Pong>(), Some(7));
    assert_eq!(registry.opcode_of::<Ping>(), None);
}

#[test]
fn test_duplicate_packet_type_is_rejected() {
    let err = RegistryBuilder::<Log>::new(Role::Client)
        .register_packet::<Ping>(1, Direction::ClientToServer)
        .register_packet::<Ping>(2, Direction::ClientToServer)
        .build()
        .unwrap_err();
    assert!(matches!(err, RegistrationError::DuplicatePacketType(_)));
}

#[test]
fn test_handler_type_mismatch_is_rejected() {
    let err = server_builder()
        .register_handler(PING, record_hello)
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        RegistrationError::HandlerTypeMismatch { opcode: PING, .. }
    ));
}

#[test]
fn test_missing_handler_reports_lowest_opcode() {
    let err = RegistryBuilder::<Log>::new(Role::Server)
        .register_packet::<Hello>(30, Direction::ClientToServer)
        .register_packet::<Ping>(10, Direction::ClientToServer)
        .build()
        .unwrap_err();
    assert_eq!(err, RegistrationError::MissingHandler(10));
}

#[test]
fn test_handler_for_unreceived_opcode_is_allowed() {
    let registry = server_builder()
        .register_handler(PING, record_ping)
        .register_handler(99, record_hello)
        .build()
        .unwrap();
    assert_eq!(registry.handler_count(), 2);
}

// =========================================================================
// Lookups
// =========================================================================

#[test]
fn test_roles_split_inbound_and_outbound() {
    let server = server_builder().register_handler(PING, record_ping).build().unwrap();
    assert!(server.get_message(PING).is_some());
    assert!(server.get_message(PONG).is_none());
    assert_eq!(server.get_opcode(&Pong::default()), Some(PONG));
    assert_eq!(server.get_opcode(&Ping::default()), None);

    let client = RegistryBuilder::<Log>::new(Role::Client)
        .register_packet::<Ping>(PING, Direction::ClientToServer)
        .register_packet::<Pong>(PONG, Direction::ServerToClient)
        .register_handler(PONG, |_log: Log, _pong: Pong, _services: ServiceScope| async {
            Ok::<_, HandlerError>(())
        })
        .build()
        .unwrap();
    assert!(client.get_message(PONG).is_some());
    assert_eq!(client.get_opcode(&Ping::default()), Some(PING));
    assert_eq!(client.role(), Role::Client);
}

#[test]
fn test_bidirectional_packet_is_both_ways() {
    let registry = RegistryBuilder::<Log>::new(Role::Client)
        .register_packet::<Hello>(HELLO, Direction::Bidirectional)
        .register_handler(HELLO, record_hello)
        .build()
        .unwrap();
    assert_eq!(registry.inbound_count(), 1);
    assert_eq!(registry.outbound_count(), 1);
    assert_eq!(registry.opcode_of::<Hello>(), Some(HELLO));
}

#[test]
fn test_get_message_returns_fresh_default() {
    let registry = server_builder().register_handler(PING, record_ping).build().unwrap();
    let packet = registry.get_message(PING).unwrap();
    let ping = packet.into_any().downcast::<Ping>().unwrap();
    assert_eq!(*ping, Ping::default());
}

// =========================================================================
// Dispatch
// =========================================================================

fn ping_registry() -> PacketRegistry<Log> {
    server_builder()
        .register_handler(PING, record_ping)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_invoke_handler_passes_typed_packet() {
    let registry = ping_registry();
    let log = Log::default();
    let services = ServiceContainer::empty().begin_scope();

    registry
        .invoke_handler(PING, log.clone(), Box::new(Ping { timestamp: 42 }), &services)
        .await
        .unwrap();
    assert_eq!(*log.lock().unwrap(), vec![42]);
}

#[tokio::test]
async fn test_invoke_unknown_opcode() {
    let registry = ping_registry();
    let services = ServiceContainer::empty().begin_scope();
    let err = registry
        .invoke_handler(55, Log::default(), Box::new(Ping::default()), &services)
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::NotFound(55)));
}

#[tokio::test]
async fn test_handler_errors_propagate() {
    let registry = server_builder()
        .register_handler(PING, |_log: Log, _ping: Ping, _services: ServiceScope| async {
            Err::<(), _>(HandlerError::msg("nope"))
        })
        .build()
        .unwrap();
    let services = ServiceContainer::empty().begin_scope();

    let err = registry
        .invoke_handler(PING, Log::default(), Box::new(Ping::default()), &services)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nope"));
}

#[tokio::test]
async fn test_handler_panics_become_errors() {
    let registry = server_builder()
        .register_handler(PING, |_log: Log, ping: Ping, _services: ServiceScope| async move {
            if ping.timestamp < 0 {
                panic!("negative timestamp");
            }
            Ok::<_, HandlerError>(())
        })
        .build()
        .unwrap();
    let services = ServiceContainer::empty().begin_scope();

    let err = registry
        .invoke_handler(PING, Log::default(), Box::new(Ping { timestamp: -1 }), &services)
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::Panicked(ref msg) if msg == "negative timestamp"));
}

#[tokio::test]
async fn test_panic_before_future_is_caught() {
    let seen: Arc<Mutex<Vec<ServiceScope>>> = Arc::default();
    let captured = Arc::clone(&seen);
    let registry = server_builder()
        .register_handler(PING, move |log: Log, ping: Ping, scope: ServiceScope| {
            captured.lock().unwrap().push(scope);
            if ping.timestamp < 0 {
                panic!("rejected before polling");
            }
            log.lock().unwrap().push(ping.timestamp);
            std::future::ready(Ok::<_, HandlerError>(()))
        })
        .build()
        .unwrap();
    let services = ServiceContainer::empty().begin_scope();
    let log = Log::default();

    let err = registry
        .invoke_handler(PING, Arc::clone(&log), Box::new(Ping { timestamp: -1 }), &services)
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::Panicked(ref msg) if msg == "rejected before polling"));

    registry
        .invoke_handler(PING, Arc::clone(&log), Box::new(Ping { timestamp: 9 }), &services)
        .await
        .unwrap();
    assert_eq!(*log.lock().unwrap(), vec![9]);

    let scopes = seen.lock().unwrap();
    assert_eq!(scopes.len(), 2);
    assert!(scopes.iter().all(ServiceScope::is_disposed));
    assert!(!services.is_disposed());
}

#[tokio::test]
async fn test_wrong_packet_type_is_reported() {
    let registry = ping_registry();
    let services = ServiceContainer::empty().begin_scope();
    let err = registry
        .invoke_handler(PING, Log::default(), Box::new(Hello::default()), &services)
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::PacketTypeMismatch { opcode: PING, .. }));
}

#[tokio::test]
async fn test_handlers_get_disposed_child_scopes() {
    let mut services = ServiceCollection::new();
    services.add_scoped(|_: &ServiceScope| Arc::new(Mutex::new(0u32)));
    let connection_scope = services.build().begin_scope();

    let seen: Arc<Mutex<Vec<ServiceScope>>> = Arc::default();
    let captured = Arc::clone(&seen);
    let registry = server_builder()
        .register_handler(PING, move |_log: Log, _ping: Ping, scope: ServiceScope| {
            let captured = Arc::clone(&captured);
            async move {
                let counter = match scope.require::<Arc<Mutex<u32>>>() {
                    Ok(counter) => counter,
                    Err(err) => return Err(HandlerError::from(err)),
                };
                *counter.lock().unwrap() += 1;
                captured.lock().unwrap().push(scope);
                Ok(())
            }
        })
        .build()
        .unwrap();

    for _ in 0..2 {
        registry
            .invoke_handler(PING, Log::default(), Box::new(Ping::default()), &connection_scope)
            .await
            .unwrap();
    }

    let scopes = seen.lock().unwrap();
    assert_eq!(scopes.len(), 2);
    assert!(scopes.iter().all(ServiceScope::is_disposed));
    assert!(!connection_scope.is_disposed());
}
