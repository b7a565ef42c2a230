//! Status codes returned across the C boundary, and the mapping from
//! [`RuntimeError`] to each family's codes.

use libc::c_int;
use tether_core::RuntimeError;

pub mod task {
    use libc::c_int;

    pub const OK: c_int = 0;
    pub const RUNNING: c_int = -1;
    pub const TIMED_OUT: c_int = -1;
    pub const INVALID: c_int = -2;
}

pub mod channel {
    use libc::c_int;

    pub const OK: c_int = 0;
    pub const WOULD_BLOCK: c_int = -1;
    pub const CLOSED: c_int = -2;
    pub const INVALID: c_int = -3;
    /// Byte channels only: the message did not fit and was cut short.
    pub const TRUNCATED: c_int = -4;
}

pub mod net {
    use libc::c_int;

    pub const OK: c_int = 0;
    pub const ERR: c_int = 1;
    pub const NOT_FOUND: c_int = 2;
    pub const BAD_ARGUMENT: c_int = 3;
}

/// Conversion of a runtime error into a family's status code.
pub trait StatusCode {
    fn task_code(&self) -> c_int;
    fn channel_code(&self) -> c_int;
    fn net_code(&self) -> c_int;
}

impl StatusCode for RuntimeError {
    fn task_code(&self) -> c_int {
        match self {
            RuntimeError::Timeout(_) => task::TIMED_OUT,
            _ => task::INVALID,
        }
    }

    fn channel_code(&self) -> c_int {
        match self {
            RuntimeError::WouldBlock => channel::WOULD_BLOCK,
            RuntimeError::Closed(_) => channel::CLOSED,
            _ => channel::INVALID,
        }
    }

    fn net_code(&self) -> c_int {
        match self {
            RuntimeError::NotFound(_) | RuntimeError::InvalidHandle { .. } => net::NOT_FOUND,
            RuntimeError::Config(_) => net::BAD_ARGUMENT,
            _ => net::ERR,
        }
    }
}
