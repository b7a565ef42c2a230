use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::error::{Result, RuntimeError};
use crate::handle::{Handle, HandleAllocator, HandleKind};

/// Live TCP stream. Reads and writes lock their own half, so a blocked read
/// never holds up a write on the same connection.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl Connection {
    fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        // chat-style traffic is small writes
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Connection {
            peer,
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            closed: watch::channel(false).0,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[derive(Debug)]
pub struct Listener {
    local: SocketAddr,
    inner: TcpListener,
    closed: watch::Sender<bool>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// Resolves once `closed` has been set. Checks the current value first.
async fn closed_signal(closed: &watch::Sender<bool>) {
    let mut rx = closed.subscribe();
    let _ = rx.wait_for(|closed| *closed).await;
}

/// `":port"` means every interface when listening and loopback when
/// connecting.
pub fn normalize_address(address: &str, default_host: &str) -> String {
    let address = address.trim();
    match address.strip_prefix(':') {
        Some(port) => format!("{}:{}", default_host, port),
        None => address.to_string(),
    }
}

/// Aggregate outcome of a best-effort broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct NetRegistry {
    allocator: Arc<HandleAllocator>,
    connections: RwLock<HashMap<Handle, Arc<Connection>>>,
    listeners: RwLock<HashMap<Handle, Arc<Listener>>>,
}

impl NetRegistry {
    pub fn new(allocator: Arc<HandleAllocator>) -> Self {
        NetRegistry {
            allocator,
            connections: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    fn connection(&self, handle: Handle) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .get(&handle)
            .cloned()
            .ok_or(RuntimeError::NotFound(handle))
    }

    fn listener(&self, handle: Handle) -> Result<Arc<Listener>> {
        self.listeners
            .read()
            .get(&handle)
            .cloned()
            .ok_or(RuntimeError::NotFound(handle))
    }

    fn register_connection(&self, stream: TcpStream) -> Result<Handle> {
        let conn = Connection::new(stream)?;
        let peer = conn.peer;
        let handle = self.allocator.issue(HandleKind::Connection);
        self.connections.write().insert(handle, Arc::new(conn));
        tracing::debug!(conn = %handle, %peer, "connection registered");
        Ok(handle)
    }

    pub async fn listen(&self, address: &str) -> Result<Handle> {
        let address = normalize_address(address, "0.0.0.0");
        let inner = TcpListener::bind(&address).await?;
        let local = inner.local_addr()?;

        let handle = self.allocator.issue(HandleKind::Listener);
        let listener = Listener {
            local,
            inner,
            closed: watch::channel(false).0,
        };
        self.listeners.write().insert(handle, Arc::new(listener));
        tracing::debug!(listener = %handle, %local, "listening");
        Ok(handle)
    }

    pub async fn connect(&self, address: &str) -> Result<Handle> {
        let address = normalize_address(address, "127.0.0.1");
        let stream = TcpStream::connect(&address).await?;
        self.register_connection(stream)
    }

    /// Wait for the next inbound connection. Closing the listener meanwhile
    /// fails the wait with `Closed`.
    pub async fn accept(&self, listener: Handle) -> Result<Handle> {
        let entry = self.listener(listener)?;
        let stream = tokio::select! {
            biased;
            _ = closed_signal(&entry.closed) => return Err(RuntimeError::Closed(listener)),
            accepted = entry.inner.accept() => accepted?.0,
        };
        self.register_connection(stream)
    }

    /// Read up to `buf.len()` bytes. End of stream is reported as an I/O
    /// error, like any other transport failure.
    pub async fn read(&self, conn: Handle, buf: &mut [u8]) -> Result<usize> {
        let entry = self.connection(conn)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = entry.reader.lock().await;
        let n = tokio::select! {
            biased;
            _ = closed_signal(&entry.closed) => return Err(RuntimeError::Closed(conn)),
            read = reader.read(buf) => read?,
        };
        if n == 0 {
            return Err(RuntimeError::eof());
        }
        Ok(n)
    }

    /// Write all of `buf`; returns the number of bytes written.
    pub async fn write(&self, conn: Handle, buf: &[u8]) -> Result<usize> {
        let entry = self.connection(conn)?;
        Self::write_to(conn, &entry, buf).await
    }

    async fn write_to(conn: Handle, entry: &Connection, buf: &[u8]) -> Result<usize> {
        let mut writer = entry.writer.lock().await;
        tokio::select! {
            biased;
            _ = closed_signal(&entry.closed) => Err(RuntimeError::Closed(conn)),
            written = writer.write_all(buf) => {
                written?;
                Ok(buf.len())
            }
        }
    }

    /// Write `buf` to every open connection except `exclude`. Failures on
    /// individual connections are logged and counted, never returned.
    pub async fn broadcast(&self, buf: &[u8], exclude: Option<Handle>) -> BroadcastReport {
        let targets: Vec<(Handle, Arc<Connection>)> = self
            .connections
            .read()
            .iter()
            .filter(|(handle, _)| Some(**handle) != exclude)
            .map(|(handle, conn)| (*handle, conn.clone()))
            .collect();

        let writes = targets
            .iter()
            .map(|(handle, conn)| Self::write_to(*handle, conn, buf));
        let outcomes = join_all(writes).await;

        let mut report = BroadcastReport::default();
        for ((handle, _), outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(conn = %handle, error = %e, "broadcast write failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn close_connection(&self, conn: Handle) -> Result<()> {
        let entry = self
            .connections
            .write()
            .remove(&conn)
            .ok_or(RuntimeError::NotFound(conn))?;
        // wakes blocked readers/writers; the socket goes with the last Arc
        entry.closed.send_replace(true);
        tracing::debug!(%conn, peer = %entry.peer, "connection closed");
        Ok(())
    }

    pub fn close_listener(&self, listener: Handle) -> Result<()> {
        let entry = self
            .listeners
            .write()
            .remove(&listener)
            .ok_or(RuntimeError::NotFound(listener))?;
        entry.closed.send_replace(true);
        tracing::debug!(%listener, local = %entry.local, "listener closed");
        Ok(())
    }

    pub fn local_addr(&self, listener: Handle) -> Result<SocketAddr> {
        Ok(self.listener(listener)?.local_addr())
    }

    pub fn peer_addr(&self, conn: Handle) -> Result<SocketAddr> {
        Ok(self.connection(conn)?.peer_addr())
    }

    pub fn connection_handles(&self) -> Vec<Handle> {
        self.connections.read().keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Close every listener and connection. Used at runtime teardown.
    pub fn close_all(&self) {
        let listeners: Vec<Handle> = self.listeners.read().keys().copied().collect();
        for listener in listeners {
            let _ = self.close_listener(listener);
        }
        for conn in self.connection_handles() {
            let _ = self.close_connection(conn);
        }
    }
}
