//! Shared packets, providers and helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use opwire::prelude::*;
use tokio::sync::{broadcast, mpsc};

pub const PING: Opcode = 1;
pub const PONG: Opcode = 2;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Ping {
    pub timestamp: i64,
}

impl Readable for Ping {
    fn read(&mut self, r: &mut PacketReader<'_>) -> Result<(), CodecError> {
        self.timestamp = r.read_i64()?;
        Ok(())
    }
}

impl Writeable for Ping {
    fn write(&self, w: &mut PacketWriter) {
        w.write_i64(self.timestamp);
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Pong {
    pub timestamp: i64,
}

impl Readable for Pong {
    fn read(&mut self, r: &mut PacketReader<'_>) -> Result<(), CodecError> {
        self.timestamp = r.read_i64()?;
        Ok(())
    }
}

impl Writeable for Pong {
    fn write(&self, w: &mut PacketWriter) {
        w.write_i64(self.timestamp);
    }
}

/// Toy cipher: XOR every byte with a key.
pub struct XorCipher(pub u8);

impl EncryptionProvider for XorCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Ok(plain.iter().map(|b| b ^ self.0).collect())
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        self.encrypt(cipher)
    }
}

pub fn xor_provider() -> Arc<dyn EncryptionProvider> {
    Arc::new(XorCipher(0x5A))
}

/// A server on an ephemeral port that answers `Ping{t}` with `Pong{t + 1}`,
/// encrypted when the ping was.
pub fn ping_pong_server() -> ServerBuilder {
    Server::builder()
        .bind("127.0.0.1", 0)
        .packet::<Ping>(PING, Direction::ClientToServer)
        .packet::<Pong>(PONG, Direction::ServerToClient)
        .handler(PING, |conn: Connection, ping: Ping, _services: ServiceScope| async move {
            conn.send(&Pong {
                timestamp: ping.timestamp + 1,
            });
            Ok::<_, HandlerError>(())
        })
}

/// A client whose pong handler forwards timestamps into `pongs`.
pub fn pong_client(port: u16, pongs: mpsc::UnboundedSender<i64>) -> ClientBuilder {
    Client::builder()
        .address("127.0.0.1", port)
        .packet::<Ping>(PING, Direction::ClientToServer)
        .packet::<Pong>(PONG, Direction::ServerToClient)
        .handler(PONG, move |_conn: Connection, pong: Pong, _services: ServiceScope| {
            let pongs = pongs.clone();
            async move {
                let _ = pongs.send(pong.timestamp);
                Ok::<_, HandlerError>(())
            }
        })
}

/// Waits up to five seconds for an event matching `predicate`.
pub async fn next_event(
    rx: &mut broadcast::Receiver<Event>,
    mut predicate: impl FnMut(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not received in time")
}

/// Waits up to five seconds for a value on `rx`.
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("value not received in time")
        .expect("channel closed")
}

/// Polls `condition` every 10 ms for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
