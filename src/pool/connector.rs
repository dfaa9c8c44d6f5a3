//! Backend capability interface
//!
//! The pool never speaks a backend protocol itself. Everything it needs from
//! a backend goes through [`Connector`]: open a connection, probe it, and
//! tear it down. Connectors key whatever they hold per connection by the
//! connection id handed to `connect`. [`TcpConnector`] is the stock
//! implementation; it keeps one socket per connection and only checks that
//! the socket is still open, which is enough for every
//! [`BackendType`](super::BackendType).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::connection::{Connection, ConnectionId, Endpoint};

/// Backend-specific failure while connecting or probing
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend refused connection: {0}")]
    Refused(String),
}

/// Create, probe and destroy connections for one kind of backend
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the backend resource for connection `connection_id`
    async fn connect(&self, connection_id: &str, endpoint: &Endpoint) -> Result<(), ConnectorError>;

    /// Lightweight liveness check of an existing connection
    async fn probe(&self, connection: &Connection) -> Result<(), ConnectorError>;

    /// Release backend resources held by a connection
    async fn disconnect(&self, _connection: &Connection) {}
}

/// Connector that holds one TCP socket per pooled connection
///
/// A probe never writes; it only checks the held socket for a pending error
/// or an orderly close by the peer. Unsolicited bytes from the backend are
/// discarded.
#[derive(Debug, Default)]
pub struct TcpConnector {
    streams: Mutex<HashMap<ConnectionId, TcpStream>>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sockets currently held
    pub fn open_streams(&self) -> usize {
        self.streams.lock().len()
    }

    fn check_stream(stream: &TcpStream) -> Result<(), ConnectorError> {
        if let Some(err) = stream.take_error()? {
            return Err(err.into());
        }
        let mut buf = [0u8; 1];
        match stream.try_read(&mut buf) {
            Ok(0) => Err(ConnectorError::Refused("peer closed the connection".to_string())),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, connection_id: &str, endpoint: &Endpoint) -> Result<(), ConnectorError> {
        let addr = endpoint.address();
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr = %addr, backend = %endpoint.backend_type, connection_id = %connection_id, "TCP handshake completed");

        self.streams.lock().insert(connection_id.to_string(), stream);
        Ok(())
    }

    async fn probe(&self, connection: &Connection) -> Result<(), ConnectorError> {
        let streams = self.streams.lock();
        match streams.get(&connection.id) {
            Some(stream) => Self::check_stream(stream),
            None => Err(ConnectorError::Refused(format!("no socket held for {}", connection.id))),
        }
    }

    async fn disconnect(&self, connection: &Connection) {
        let stream = self.streams.lock().remove(&connection.id);
        if let Some(mut stream) = stream {
            if let Err(e) = stream.shutdown().await {
                debug!(connection_id = %connection.id, error = %e, "Socket shutdown failed");
            }
        }
    }
}

/// Run a connector future under a deadline
pub(crate) async fn with_timeout<F>(limit: Duration, fut: F) -> Result<(), ConnectorError>
where
    F: std::future::Future<Output = Result<(), ConnectorError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::Timeout(limit)),
    }
}
