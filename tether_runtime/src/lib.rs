//! C ABI for the Tether runtime.
//!
//! Every entry point takes the runtime it operates on as its first argument,
//! obtained from [`tether_runtime_new`], [`tether_runtime_from_toml`] or
//! [`tether_runtime_global`]. Handles cross the boundary as plain `uint64_t`;
//! `0` never names anything. Outcomes come back as status codes (see
//! [`status`]); nothing unwinds into the caller.
//!
//! All blocking calls park the calling OS thread. They may be made from any
//! foreign thread and from functions launched as tasks.

use std::ffi::CStr;
use std::ptr;
use std::sync::OnceLock;

use libc::{c_char, c_int};
use tether_core::{Runtime, RuntimeConfig};

pub mod channel;
pub mod net;
pub mod status;
pub mod task;

pub use tether_core;

/// Run `$body` with `$rt` resolved to `&Runtime`, or evaluate `$fail` when the
/// runtime pointer is null. A panic inside `$body` is an invariant violation
/// (for instance an exhausted handle space) and ends the process rather than
/// unwinding into foreign frames.
#[macro_export]
macro_rules! with_runtime {
    ($rt:expr, $fail:expr, |$runtime:ident| $body:expr) => {{
        // SAFETY: callers pass a pointer from tether_runtime_new/global, or null.
        match unsafe { $rt.as_ref() } {
            None => $fail,
            Some($runtime) => {
                match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $body)) {
                    Ok(value) => value,
                    Err(_) => {
                        ::tracing::error!("invariant violation inside tether call, aborting");
                        ::std::process::abort()
                    }
                }
            }
        }
    }};
}

static GLOBAL_RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

fn into_raw(runtime: tether_core::Result<Runtime>) -> *mut Runtime {
    match runtime {
        Ok(runtime) => Box::into_raw(Box::new(runtime)),
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            ptr::null_mut()
        }
    }
}

/// Install a stderr log subscriber honouring `RUST_LOG` (default `info`).
/// Returns 1 if installed, 0 if one was already present.
#[no_mangle]
pub extern "C" fn tether_init_logging() -> c_int {
    tether_core::init_logging("info") as c_int
}

/// New runtime configured from `TETHER_*` environment variables. Null on
/// failure. Release it with [`tether_runtime_free`].
#[no_mangle]
pub extern "C" fn tether_runtime_new() -> *mut Runtime {
    into_raw(RuntimeConfig::from_env().and_then(Runtime::new))
}

/// New runtime configured from a TOML file. Null on failure.
///
/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tether_runtime_from_toml(path: *const c_char) -> *mut Runtime {
    if path.is_null() {
        return ptr::null_mut();
    }
    let path = match CStr::from_ptr(path).to_str() {
        Ok(path) => path,
        Err(_) => return ptr::null_mut(),
    };
    into_raw(RuntimeConfig::from_toml_file(path).and_then(Runtime::new))
}

/// Process-wide runtime created on first use from the environment. It is
/// never torn down. Null if it could not be started.
#[no_mangle]
pub extern "C" fn tether_runtime_global() -> *const Runtime {
    GLOBAL_RUNTIME
        .get_or_init(|| match RuntimeConfig::from_env().and_then(Runtime::new) {
            Ok(runtime) => Some(runtime),
            Err(e) => {
                tracing::error!(error = %e, "failed to start global runtime");
                None
            }
        })
        .as_ref()
        .map_or(ptr::null(), |runtime| runtime as *const Runtime)
}

/// Close every channel and socket and stop the runtime. Returns 0, or 1 if
/// called from one of the runtime's own threads (the runtime is then left
/// running, since it cannot stop itself).
///
/// # Safety
/// `rt` must come from [`tether_runtime_new`] or [`tether_runtime_from_toml`]
/// and must not be used afterwards. Null is ignored.
#[no_mangle]
pub unsafe extern "C" fn tether_runtime_free(rt: *mut Runtime) -> c_int {
    if rt.is_null() {
        return 0;
    }
    if tether_core::runtime::in_runtime_context() {
        tracing::error!("tether_runtime_free called from a runtime thread; ignored");
        return 1;
    }
    Box::from_raw(rt).shutdown();
    0
}

/// Counts of live registry entries.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TetherStats {
    pub handles_issued: u64,
    pub tasks: u64,
    pub pending_tasks: u64,
    pub channels: u64,
    pub byte_channels: u64,
    pub listeners: u64,
    pub connections: u64,
}

/// Fill `out` with a snapshot of the runtime's registries. Returns 0, or -1
/// for a null argument.
///
/// # Safety
/// `out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_runtime_stats(rt: *const Runtime, out: *mut TetherStats) -> c_int {
    if out.is_null() {
        return -1;
    }
    with_runtime!(rt, -1, |runtime| {
        let stats = runtime.stats();
        *out = TetherStats {
            handles_issued: stats.handles_issued,
            tasks: stats.tasks as u64,
            pending_tasks: stats.pending_tasks as u64,
            channels: stats.channels as u64,
            byte_channels: stats.byte_channels as u64,
            listeners: stats.listeners as u64,
            connections: stats.connections as u64,
        };
        0
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use tether_core::{Runtime, RuntimeConfig};

    /// Owned runtime pointer, freed on drop.
    pub struct TestRuntime(pub *mut Runtime);

    impl TestRuntime {
        pub fn new() -> Self {
            let config = RuntimeConfig {
                worker_threads: Some(2),
                ..RuntimeConfig::default()
            };
            TestRuntime(Box::into_raw(Box::new(Runtime::new(config).unwrap())))
        }

        pub fn ptr(&self) -> *const Runtime {
            self.0
        }
    }

    impl Drop for TestRuntime {
        fn drop(&mut self) {
            unsafe {
                super::tether_runtime_free(self.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::io::Write;

    #[test]
    fn null_runtime_is_rejected() {
        let mut stats = TetherStats::default();
        assert_eq!(unsafe { tether_runtime_stats(ptr::null(), &mut stats) }, -1);
        assert_eq!(unsafe { tether_runtime_free(ptr::null_mut()) }, 0);
    }

    #[test]
    fn runtime_from_toml_file() {
        let path = std::env::temp_dir().join(format!("tether-config-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "worker_threads = 1\nthread_name = \"toml-worker\"").unwrap();
        drop(file);

        let c_path = CString::new(path.to_str().unwrap()).unwrap();
        let rt = unsafe { tether_runtime_from_toml(c_path.as_ptr()) };
        assert!(!rt.is_null());
        assert_eq!(unsafe { (*rt).config().thread_name.as_str() }, "toml-worker");
        assert_eq!(unsafe { tether_runtime_free(rt) }, 0);
        std::fs::remove_file(path).unwrap();

        let missing = CString::new("/definitely/not/here.toml").unwrap();
        assert!(unsafe { tether_runtime_from_toml(missing.as_ptr()) }.is_null());
    }

    #[test]
    fn global_runtime_is_shared() {
        let first = tether_runtime_global();
        assert!(!first.is_null());
        assert_eq!(first, tether_runtime_global());
    }

    #[test]
    fn stats_reflect_registry_contents() {
        let rt = testing::TestRuntime::new();
        let chan = unsafe { channel::tether_channel_create(rt.ptr(), 1) };
        assert_ne!(chan, 0);

        let mut stats = TetherStats::default();
        assert_eq!(unsafe { tether_runtime_stats(rt.ptr(), &mut stats) }, 0);
        assert_eq!(stats.channels, 1);
        assert_eq!(stats.handles_issued, 1);
    }
}
