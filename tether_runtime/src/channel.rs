//! Pointer channels and byte-copying channels.
//!
//! Pointer channels carry the caller's address verbatim; the runtime never
//! reads or frees what it points to. Byte channels copy the message in on
//! send and out on receive, so the caller's buffers can be reused at once.

use std::slice;

use libc::{c_int, c_void};
use tether_core::{Handle, HandleKind, OpaquePtr, Runtime, RuntimeError};

use crate::status::{self, StatusCode};

fn channel_handle(raw: u64) -> Option<Handle> {
    Handle::from_raw_kind(raw, HandleKind::Channel)
}

fn byte_channel_handle(raw: u64) -> Option<Handle> {
    Handle::from_raw_kind(raw, HandleKind::ByteChannel)
}

fn channel_outcome<T>(outcome: Result<T, RuntimeError>, store: impl FnOnce(T)) -> c_int {
    match outcome {
        Ok(value) => {
            store(value);
            status::channel::OK
        }
        Err(e) => e.channel_code(),
    }
}

/// New pointer channel. Capacity 0 is a rendezvous. Returns 0 for a
/// negative capacity.
///
/// # Safety
/// `rt` must be null or a live runtime.
#[no_mangle]
pub unsafe extern "C" fn tether_channel_create(rt: *const Runtime, capacity: c_int) -> u64 {
    let Ok(capacity) = usize::try_from(capacity) else {
        return 0;
    };
    crate::with_runtime!(rt, 0, |runtime| runtime.channels().create(capacity).raw())
}

/// Blocks while full. 0, -2 if closed, -3 for an unknown handle.
///
/// # Safety
/// `rt` must be null or a live runtime. `value` is not dereferenced.
#[no_mangle]
pub unsafe extern "C" fn tether_channel_send(rt: *const Runtime, handle: u64, value: *mut c_void) -> c_int {
    let Some(handle) = channel_handle(handle) else {
        return status::channel::INVALID;
    };
    crate::with_runtime!(rt, status::channel::INVALID, |runtime| {
        channel_outcome(runtime.channels().send(handle, OpaquePtr::new(value)), |_| ())
    })
}

/// Blocks while empty and open. 0 and `*out` set, -2 once closed and
/// drained, -3 for an unknown handle.
///
/// # Safety
/// `out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_channel_recv(rt: *const Runtime, handle: u64, out: *mut *mut c_void) -> c_int {
    let Some(handle) = channel_handle(handle) else {
        return status::channel::INVALID;
    };
    crate::with_runtime!(rt, status::channel::INVALID, |runtime| {
        channel_outcome(runtime.channels().recv(handle), |value| {
            if !out.is_null() {
                *out = value.as_ptr();
            }
        })
    })
}

/// Never blocks. 0 and `*out` set, -1 if empty, -2 once closed and drained,
/// -3 for an unknown handle.
///
/// # Safety
/// `out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_channel_try_recv(
    rt: *const Runtime,
    handle: u64,
    out: *mut *mut c_void,
) -> c_int {
    let Some(handle) = channel_handle(handle) else {
        return status::channel::INVALID;
    };
    crate::with_runtime!(rt, status::channel::INVALID, |runtime| {
        channel_outcome(runtime.channels().try_recv(handle), |value| {
            if !out.is_null() {
                *out = value.as_ptr();
            }
        })
    })
}

/// Close the channel. Values already buffered can still be received.
/// Closing twice is a no-op.
///
/// # Safety
/// `rt` must be null or a live runtime.
#[no_mangle]
pub unsafe extern "C" fn tether_channel_close(rt: *const Runtime, handle: u64) {
    let Some(handle) = channel_handle(handle) else {
        return;
    };
    crate::with_runtime!(rt, (), |runtime| {
        runtime.channels().close(handle);
    })
}

/// New byte channel. Returns 0 for a negative capacity.
///
/// # Safety
/// `rt` must be null or a live runtime.
#[no_mangle]
pub unsafe extern "C" fn tether_bytes_channel_create(rt: *const Runtime, capacity: c_int) -> u64 {
    let Ok(capacity) = usize::try_from(capacity) else {
        return 0;
    };
    crate::with_runtime!(rt, 0, |runtime| runtime.byte_channels().create(capacity).raw())
}

/// Copy `len` bytes from `buf` into the channel. Same codes as
/// [`tether_channel_send`]; a null `buf` is only accepted with `len` 0.
///
/// # Safety
/// `buf` must be valid for `len` bytes of reads.
#[no_mangle]
pub unsafe extern "C" fn tether_bytes_channel_send(
    rt: *const Runtime,
    handle: u64,
    buf: *const u8,
    len: usize,
) -> c_int {
    let Some(handle) = byte_channel_handle(handle) else {
        return status::channel::INVALID;
    };
    let message = match (buf.is_null(), len) {
        (_, 0) => Vec::new(),
        (true, _) => return status::channel::INVALID,
        (false, len) => slice::from_raw_parts(buf, len).to_vec(),
    };
    crate::with_runtime!(rt, status::channel::INVALID, |runtime| {
        channel_outcome(runtime.byte_channels().send(handle, message), |_| ())
    })
}

/// Copy a received message into `buf` (at most `cap` bytes) and store its
/// full length in `*out_len`. Returns -4 when the message was longer than
/// `cap`; the remainder is dropped.
unsafe fn copy_message(message: Vec<u8>, buf: *mut u8, cap: usize, out_len: *mut usize) -> c_int {
    if !out_len.is_null() {
        *out_len = message.len();
    }
    let n = message.len().min(cap);
    if n > 0 && !buf.is_null() {
        buf.copy_from_nonoverlapping(message.as_ptr(), n);
    }
    if message.len() > cap {
        status::channel::TRUNCATED
    } else {
        status::channel::OK
    }
}

/// Blocking receive into `buf`. Codes as [`tether_channel_recv`], plus -4
/// for a truncated message.
///
/// # Safety
/// `buf` must be valid for `cap` bytes of writes; `out_len` null or valid.
#[no_mangle]
pub unsafe extern "C" fn tether_bytes_channel_recv(
    rt: *const Runtime,
    handle: u64,
    buf: *mut u8,
    cap: usize,
    out_len: *mut usize,
) -> c_int {
    let Some(handle) = byte_channel_handle(handle) else {
        return status::channel::INVALID;
    };
    crate::with_runtime!(rt, status::channel::INVALID, |runtime| {
        match runtime.byte_channels().recv(handle) {
            Ok(message) => copy_message(message, buf, cap, out_len),
            Err(e) => e.channel_code(),
        }
    })
}

/// Non-blocking receive into `buf`. Codes as [`tether_channel_try_recv`],
/// plus -4 for a truncated message.
///
/// # Safety
/// `buf` must be valid for `cap` bytes of writes; `out_len` null or valid.
#[no_mangle]
pub unsafe extern "C" fn tether_bytes_channel_try_recv(
    rt: *const Runtime,
    handle: u64,
    buf: *mut u8,
    cap: usize,
    out_len: *mut usize,
) -> c_int {
    let Some(handle) = byte_channel_handle(handle) else {
        return status::channel::INVALID;
    };
    crate::with_runtime!(rt, status::channel::INVALID, |runtime| {
        match runtime.byte_channels().try_recv(handle) {
            Ok(message) => copy_message(message, buf, cap, out_len),
            Err(e) => e.channel_code(),
        }
    })
}

/// # Safety
/// `rt` must be null or a live runtime.
#[no_mangle]
pub unsafe extern "C" fn tether_bytes_channel_close(rt: *const Runtime, handle: u64) {
    let Some(handle) = byte_channel_handle(handle) else {
        return;
    };
    crate::with_runtime!(rt, (), |runtime| {
        runtime.byte_channels().close(handle);
    })
}
