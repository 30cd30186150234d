use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::protocol::{read_message, write_message, HandoverMessage};

/// Answers requests arriving on the control listener.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, message: HandoverMessage) -> HandoverMessage;
}

/// Bound control listener.
pub struct ControlServer {
    listener: TcpListener,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires. Dropping out of this call
    /// releases the listening socket.
    pub async fn serve(self, handler: Arc<dyn ControlHandler>, cancel: CancellationToken) {
        let addr = self.listener.local_addr().ok();
        tracing::info!(addr = ?addr, "Control listener started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "Control connection accepted");
                        tokio::spawn(handle_connection(stream, handler.clone(), cancel.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept control connection");
                    }
                },
            }
        }
        tracing::info!(addr = ?addr, "Control listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<dyn ControlHandler>,
    cancel: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = read_message(&mut reader) => message,
        };
        let response = match message {
            Ok(Some(message)) => {
                tracing::debug!(message = ?message, "Control request");
                handler.handle(message).await
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed control request");
                HandoverMessage::error(e.to_string())
            }
        };
        if let Err(e) = write_message(&mut write_half, &response).await {
            tracing::warn!(error = %e, "Failed to write control response");
            break;
        }
    }
}
