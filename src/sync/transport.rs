//! Transport seam between the sync client and the remote authority.
//!
//! `TcpConnector` speaks newline-delimited JSON over a TCP stream and performs
//! the hello/welcome handshake before handing out a session.

use crate::domain::errors::CoreError;
use crate::sync::protocol::{ClientToRemote, RemoteToClient, PROTOCOL_VERSION};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// An open, handshaken conversation with the remote.
#[async_trait]
pub trait RemoteSession: Send {
    async fn send(&mut self, message: &ClientToRemote) -> Result<(), CoreError>;

    /// Next message from the remote; `None` once the remote hung up.
    ///
    /// Must be cancel safe: a dropped call may not lose a partly read message.
    async fn recv(&mut self) -> Result<Option<RemoteToClient>, CoreError>;
}

/// Opens sessions. The hello message carries the caller's identity.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, hello: &ClientToRemote) -> Result<Box<dyn RemoteSession>, CoreError>;
}

/// Production connector for `host:port` remotes.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, hello: &ClientToRemote) -> Result<Box<dyn RemoteSession>, CoreError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| CoreError::transport(format!("connect to {} timed out", self.address)))?
            .map_err(|e| CoreError::transport(format!("connect to {}: {}", self.address, e)))?;

        let (reader, writer) = stream.into_split();
        let mut session = TcpSession {
            reader: BufReader::new(reader),
            writer,
            partial: Vec::new(),
        };

        session.send(hello).await?;
        match session.recv().await? {
            Some(RemoteToClient::Welcome {
                protocol_version,
                server_version,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(CoreError::ProtocolMismatch {
                        expected: PROTOCOL_VERSION,
                        actual: protocol_version,
                    });
                }
                tracing::info!(address = %self.address, %server_version, "connected to remote");
            }
            Some(RemoteToClient::Error { code, message }) => {
                return Err(CoreError::RemoteRejected { code, message });
            }
            Some(other) => {
                return Err(CoreError::transport(format!(
                    "expected welcome, got {:?}",
                    other
                )));
            }
            None => return Err(CoreError::transport("remote closed during handshake")),
        }

        Ok(Box::new(session))
    }
}

struct TcpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Bytes of a line whose newline has not arrived yet.
    partial: Vec<u8>,
}

#[async_trait]
impl RemoteSession for TcpSession {
    async fn send(&mut self, message: &ClientToRemote) -> Result<(), CoreError> {
        let json = serde_json::to_string(message)
            .map_err(|e| CoreError::schema(format!("encode message: {}", e)))?;
        self.writer
            .write_all(format!("{}\n", json).as_bytes())
            .await
            .map_err(|e| CoreError::transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<RemoteToClient>, CoreError> {
        loop {
            let read = self
                .reader
                .read_until(b'\n', &mut self.partial)
                .await
                .map_err(|e| CoreError::transport(e.to_string()))?;
            if read == 0 && self.partial.is_empty() {
                return Ok(None);
            }

            let line = std::mem::take(&mut self.partial);
            let text = std::str::from_utf8(&line)
                .map_err(|e| CoreError::transport(format!("undecodable message: {}", e)))?
                .trim();
            if text.is_empty() {
                continue;
            }
            return serde_json::from_str(text)
                .map(Some)
                .map_err(|e| CoreError::transport(format!("undecodable message: {}", e)));
        }
    }
}
