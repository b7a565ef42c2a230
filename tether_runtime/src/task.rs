//! Task launch, polling and waiting.

use std::time::Duration;

use libc::{c_int, c_void};
use tether_core::{Handle, HandleKind, OpaquePtr, Runtime, TaskStatus};

use crate::status::{self, StatusCode};

pub type PtrFn = extern "C" fn(*mut c_void) -> *mut c_void;
pub type VoidFn = extern "C" fn(*mut c_void);

fn task_handle(raw: u64) -> Option<Handle> {
    Handle::from_raw_kind(raw, HandleKind::Task)
}

/// Store `value` through `out` when both exist.
unsafe fn write_result(out: *mut *mut c_void, value: Option<OpaquePtr>) {
    if let (Some(value), false) = (value, out.is_null()) {
        *out = value.as_ptr();
    }
}

/// Run `func(arg)` concurrently and keep its return value. Returns the task
/// handle, or 0 if `func` is null.
///
/// # Safety
/// `func` must be safe to call with `arg` from another thread.
#[no_mangle]
pub unsafe extern "C" fn tether_task_launch(
    rt: *const Runtime,
    func: Option<PtrFn>,
    arg: *mut c_void,
) -> u64 {
    let Some(func) = func else {
        return 0;
    };
    let arg = OpaquePtr::new(arg);
    crate::with_runtime!(rt, 0, |runtime| {
        runtime
            .tasks()
            .launch_with_result(move || OpaquePtr::new(func(arg.as_ptr())))
            .raw()
    })
}

/// Run `func(arg)` concurrently, recording only that it finished.
///
/// # Safety
/// `func` must be safe to call with `arg` from another thread.
#[no_mangle]
pub unsafe extern "C" fn tether_task_launch_void(
    rt: *const Runtime,
    func: Option<VoidFn>,
    arg: *mut c_void,
) -> u64 {
    let Some(func) = func else {
        return 0;
    };
    let arg = OpaquePtr::new(arg);
    crate::with_runtime!(rt, 0, |runtime| {
        runtime.tasks().launch_detached(move || func(arg.as_ptr())).raw()
    })
}

/// 0 and `*result` set when done, -1 while running, -2 for an unknown handle.
/// Never blocks.
///
/// # Safety
/// `result` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_task_poll(
    rt: *const Runtime,
    handle: u64,
    result: *mut *mut c_void,
) -> c_int {
    let Some(handle) = task_handle(handle) else {
        return status::task::INVALID;
    };
    crate::with_runtime!(rt, status::task::INVALID, |runtime| {
        match runtime.tasks().poll(handle) {
            Ok(TaskStatus::Completed(value)) => {
                write_result(result, value);
                status::task::OK
            }
            Ok(TaskStatus::Running) => status::task::RUNNING,
            Err(e) => e.task_code(),
        }
    })
}

/// Block until the task finishes. 0 and `*result` set, or -2 for an unknown
/// handle.
///
/// # Safety
/// `result` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_task_await(
    rt: *const Runtime,
    handle: u64,
    result: *mut *mut c_void,
) -> c_int {
    let Some(handle) = task_handle(handle) else {
        return status::task::INVALID;
    };
    crate::with_runtime!(rt, status::task::INVALID, |runtime| {
        match runtime.tasks().wait(handle) {
            Ok(value) => {
                write_result(result, value);
                status::task::OK
            }
            Err(e) => e.task_code(),
        }
    })
}

/// Block for at most `timeout_ms` (negative counts as 0). 0 and `*result`
/// set, -1 on timeout, -2 for an unknown handle.
///
/// # Safety
/// `result` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_task_await_timeout(
    rt: *const Runtime,
    handle: u64,
    timeout_ms: i64,
    result: *mut *mut c_void,
) -> c_int {
    let Some(handle) = task_handle(handle) else {
        return status::task::INVALID;
    };
    let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
    crate::with_runtime!(rt, status::task::INVALID, |runtime| {
        match runtime.tasks().wait_timeout(handle, timeout) {
            Ok(value) => {
                write_result(result, value);
                status::task::OK
            }
            Err(e) => e.task_code(),
        }
    })
}

/// Forget the task record. Unknown handles are ignored.
///
/// # Safety
/// `rt` must be null or a live runtime.
#[no_mangle]
pub unsafe extern "C" fn tether_task_cleanup(rt: *const Runtime, handle: u64) {
    let Some(handle) = task_handle(handle) else {
        return;
    };
    crate::with_runtime!(rt, (), |runtime| {
        runtime.tasks().cleanup(handle);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRuntime;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    extern "C" fn double(arg: *mut c_void) -> *mut c_void {
        (arg as usize * 2) as *mut c_void
    }

    extern "C" fn slow_identity(arg: *mut c_void) -> *mut c_void {
        thread::sleep(Duration::from_millis(200));
        arg
    }

    static VOID_CALLS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn bump(arg: *mut c_void) {
        VOID_CALLS.fetch_add(arg as usize, Ordering::SeqCst);
    }

    #[test]
    fn launch_then_await_matches_direct_call() {
        let rt = TestRuntime::new();
        unsafe {
            let handle = tether_task_launch(rt.ptr(), Some(double), 21 as *mut c_void);
            assert_ne!(handle, 0);

            let mut result = ptr::null_mut();
            assert_eq!(tether_task_await(rt.ptr(), handle, &mut result), status::task::OK);
            assert_eq!(result, double(21 as *mut c_void));
        }
    }

    #[test]
    fn poll_lifecycle() {
        let rt = TestRuntime::new();
        unsafe {
            let handle = tether_task_launch(rt.ptr(), Some(slow_identity), 7 as *mut c_void);
            let mut result = ptr::null_mut();
            assert_eq!(tether_task_poll(rt.ptr(), handle, &mut result), status::task::RUNNING);
            assert!(result.is_null());

            assert_eq!(
                tether_task_await_timeout(rt.ptr(), handle, 10, &mut result),
                status::task::TIMED_OUT
            );
            assert_eq!(
                tether_task_await_timeout(rt.ptr(), handle, 5_000, &mut result),
                status::task::OK
            );
            assert_eq!(result as usize, 7);

            result = ptr::null_mut();
            assert_eq!(tether_task_poll(rt.ptr(), handle, &mut result), status::task::OK);
            assert_eq!(result as usize, 7);

            tether_task_cleanup(rt.ptr(), handle);
            assert_eq!(tether_task_poll(rt.ptr(), handle, &mut result), status::task::INVALID);
            // cleanup twice is harmless
            tether_task_cleanup(rt.ptr(), handle);
        }
    }

    #[test]
    fn void_launch_reports_completion_only() {
        let rt = TestRuntime::new();
        unsafe {
            let handle = tether_task_launch_void(rt.ptr(), Some(bump), 3 as *mut c_void);
            let mut result = ptr::null_mut();
            assert_eq!(tether_task_await(rt.ptr(), handle, &mut result), status::task::OK);
            assert!(result.is_null());
            assert!(VOID_CALLS.load(Ordering::SeqCst) >= 3);
        }
    }

    #[test]
    fn unknown_and_foreign_handles_are_invalid() {
        let rt = TestRuntime::new();
        unsafe {
            let mut result = ptr::null_mut();
            assert_eq!(tether_task_poll(rt.ptr(), 0, &mut result), status::task::INVALID);
            assert_eq!(tether_task_await(rt.ptr(), 12345, &mut result), status::task::INVALID);
            assert_eq!(
                tether_task_await_timeout(rt.ptr(), u64::MAX, 1, &mut result),
                status::task::INVALID
            );

            let chan = crate::channel::tether_channel_create(rt.ptr(), 1);
            assert_eq!(tether_task_await(rt.ptr(), chan, &mut result), status::task::INVALID);
        }
    }

    #[test]
    fn null_function_yields_no_handle() {
        let rt = TestRuntime::new();
        unsafe {
            assert_eq!(tether_task_launch(rt.ptr(), None, ptr::null_mut()), 0);
            assert_eq!(tether_task_launch_void(rt.ptr(), None, ptr::null_mut()), 0);
        }
    }
}
