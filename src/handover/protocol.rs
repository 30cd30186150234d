use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{FleetError, Result};

/// Messages exchanged between two schedulers during a handover.
///
/// Each request gets exactly one response, [`Ack`](Self::Ack) or
/// [`Error`](Self::Error). Messages are JSON objects, one per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandoverMessage {
    /// Ask the receiver to hand its devices over to a scheduler listening on `port`.
    StartHandover { port: u16 },
    /// The sender still holds this device.
    AllocateDevice { serial: String },
    /// The sender released this device.
    FreeDevice { serial: String },
    /// All held devices have been reported.
    HandoverInitComplete,
    /// The sender has fully shut down.
    HandoverComplete,
    Ack,
    Error { message: String },
}

impl HandoverMessage {
    pub fn error(message: impl Into<String>) -> Self {
        HandoverMessage::Error {
            message: message.into(),
        }
    }
}

pub async fn write_message<W>(writer: &mut W, message: &HandoverMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. Returns `None` when the peer closed the connection.
pub async fn read_message<R>(reader: &mut BufReader<R>) -> Result<Option<HandoverMessage>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(line.trim_end()).map_err(FleetError::from)?;
    Ok(Some(message))
}
