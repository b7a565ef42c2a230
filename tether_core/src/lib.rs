pub mod channel;
pub mod config;
pub mod error;
pub mod handle;
pub mod logging;
pub mod net;
pub mod payload;
pub mod runtime;
pub mod task;

pub use channel::{Channel, ChannelRegistry};
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use handle::{Handle, HandleAllocator, HandleKind};
pub use logging::init_logging;
pub use net::{BroadcastReport, NetRegistry};
pub use payload::OpaquePtr;
pub use runtime::{Runtime, RuntimeStats};
pub use task::{TaskRegistry, TaskStatus, TaskWait};
