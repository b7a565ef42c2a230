use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::channel::ChannelRegistry;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::handle::{Handle, HandleAllocator, HandleKind};
use crate::net::{BroadcastReport, NetRegistry};
use crate::payload::OpaquePtr;
use crate::task::TaskRegistry;

/// Snapshot of live registry entries.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    pub handles_issued: u64,
    pub tasks: usize,
    pub pending_tasks: usize,
    pub channels: usize,
    pub byte_channels: usize,
    pub listeners: usize,
    pub connections: usize,
}

/// Whether the current thread belongs to some tokio runtime, in which case
/// a runtime must not be shut down from it.
pub fn in_runtime_context() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

/// One runtime instance: a tokio runtime plus every registry, all sharing a
/// single handle allocator.
///
/// The blocking methods park the calling thread and must not be called from
/// inside async code running on this runtime's workers. Threads running
/// launched tasks are fine.
pub struct Runtime {
    config: RuntimeConfig,
    tokio: tokio::runtime::Runtime,
    allocator: Arc<HandleAllocator>,
    tasks: TaskRegistry<OpaquePtr>,
    channels: ChannelRegistry<OpaquePtr>,
    byte_channels: ChannelRegistry<Vec<u8>>,
    net: NetRegistry,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder
            .enable_all()
            .thread_name(config.thread_name.clone())
            .max_blocking_threads(config.max_blocking_threads);
        if let Some(workers) = config.worker_threads {
            builder.worker_threads(workers);
        }
        let tokio = builder.build()?;

        let allocator = Arc::new(HandleAllocator::new());
        let tasks = TaskRegistry::new(
            allocator.clone(),
            tokio.handle().clone(),
            config.max_outstanding_tasks,
        );
        let channels = ChannelRegistry::new(HandleKind::Channel, allocator.clone());
        let byte_channels = ChannelRegistry::new(HandleKind::ByteChannel, allocator.clone());
        let net = NetRegistry::new(allocator.clone());

        tracing::info!(
            workers = ?config.worker_threads,
            max_blocking = config.max_blocking_threads,
            max_outstanding = ?config.max_outstanding_tasks,
            "runtime started"
        );

        Ok(Runtime {
            config,
            tokio,
            allocator,
            tasks,
            channels,
            byte_channels,
            net,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(RuntimeConfig::default())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tokio_handle(&self) -> &tokio::runtime::Handle {
        self.tokio.handle()
    }

    pub fn tasks(&self) -> &TaskRegistry<OpaquePtr> {
        &self.tasks
    }

    pub fn channels(&self) -> &ChannelRegistry<OpaquePtr> {
        &self.channels
    }

    pub fn byte_channels(&self) -> &ChannelRegistry<Vec<u8>> {
        &self.byte_channels
    }

    pub fn net(&self) -> &NetRegistry {
        &self.net
    }

    /// Drive `future` to completion on this runtime from a blocking caller.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.tokio.handle().block_on(future)
    }

    pub fn listen(&self, address: &str) -> Result<Handle> {
        self.block_on(self.net.listen(address))
    }

    pub fn connect(&self, address: &str) -> Result<Handle> {
        self.block_on(self.net.connect(address))
    }

    pub fn accept(&self, listener: Handle) -> Result<Handle> {
        self.block_on(self.net.accept(listener))
    }

    pub fn read(&self, conn: Handle, buf: &mut [u8]) -> Result<usize> {
        self.block_on(self.net.read(conn, buf))
    }

    pub fn write(&self, conn: Handle, buf: &[u8]) -> Result<usize> {
        self.block_on(self.net.write(conn, buf))
    }

    pub fn broadcast(&self, buf: &[u8], exclude: Option<Handle>) -> BroadcastReport {
        self.block_on(self.net.broadcast(buf, exclude))
    }

    pub fn close_connection(&self, conn: Handle) -> Result<()> {
        self.net.close_connection(conn)
    }

    pub fn close_listener(&self, listener: Handle) -> Result<()> {
        self.net.close_listener(listener)
    }

    pub fn local_addr(&self, listener: Handle) -> Result<SocketAddr> {
        self.net.local_addr(listener)
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            handles_issued: self.allocator.issued(),
            tasks: self.tasks.len(),
            pending_tasks: self.tasks.pending(),
            channels: self.channels.len(),
            byte_channels: self.byte_channels.len(),
            listeners: self.net.listener_count(),
            connections: self.net.connection_count(),
        }
    }

    /// Close every channel and socket, then stop the workers. Launched
    /// functions still running on the blocking pool are given
    /// `shutdown_timeout` to return and are abandoned after that.
    pub fn shutdown(self) {
        let timeout = self.config.shutdown_timeout();
        self.shutdown_within(timeout);
    }

    fn shutdown_within(self, timeout: Duration) {
        let channels = self.channels.close_all() + self.byte_channels.close_all();
        self.net.close_all();
        tracing::info!(channels, stats = ?self.stats(), "runtime shutting down");
        self.tokio.shutdown_timeout(timeout);
    }
}
