use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::protocol::{read_message, write_message, HandoverMessage};
use crate::error::{FleetError, Result};

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Request/response client for a sibling scheduler's control listener.
///
/// Requests are serialized over one connection; each waits for its response
/// for at most the configured timeout.
pub struct HandoverClient {
    addr: SocketAddr,
    timeout: Duration,
    connection: Mutex<Connection>,
}

impl HandoverClient {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FleetError::HandoverTimeout(timeout))?
            .map_err(|e| FleetError::Handover(format!("failed to connect to {}: {}", addr, e)))?;
        let (read_half, write_half) = stream.into_split();
        tracing::debug!(addr = %addr, "Connected to handover peer");
        Ok(Self {
            addr,
            timeout,
            connection: Mutex::new(Connection {
                reader: BufReader::new(read_half),
                writer: write_half,
            }),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send `message` and wait for the peer to acknowledge it.
    pub async fn request(&self, message: HandoverMessage) -> Result<()> {
        let mut connection = self.connection.lock().await;
        let exchange = async {
            write_message(&mut connection.writer, &message).await?;
            read_message(&mut connection.reader).await
        };
        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| FleetError::HandoverTimeout(self.timeout))??;

        match response {
            Some(HandoverMessage::Ack) => Ok(()),
            Some(HandoverMessage::Error { message: reason }) => Err(FleetError::Handover(format!(
                "peer rejected {:?}: {}",
                message, reason
            ))),
            Some(other) => Err(FleetError::Handover(format!(
                "unexpected response {:?}",
                other
            ))),
            None => Err(FleetError::Handover("peer closed the connection".to_string())),
        }
    }

    pub async fn allocate_device(&self, serial: &str) -> Result<()> {
        self.request(HandoverMessage::AllocateDevice {
            serial: serial.to_string(),
        })
        .await
    }

    pub async fn free_device(&self, serial: &str) -> Result<()> {
        self.request(HandoverMessage::FreeDevice {
            serial: serial.to_string(),
        })
        .await
    }
}
