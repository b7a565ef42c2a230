//! TCP listeners and connections.
//!
//! Codes: 0 success, 1 I/O failure (including end of stream and a handle
//! closed while the call was blocked), 2 unknown handle, 3 bad argument.

use std::ffi::CStr;
use std::slice;

use libc::{c_char, c_int};
use tether_core::{Handle, HandleKind, Runtime};

use crate::status::{self, StatusCode};

fn resolve(raw: u64, kind: HandleKind) -> Result<Handle, c_int> {
    Handle::from_raw_kind(raw, kind).ok_or(status::net::NOT_FOUND)
}

unsafe fn address<'a>(address: *const c_char) -> Result<&'a str, c_int> {
    if address.is_null() {
        return Err(status::net::BAD_ARGUMENT);
    }
    CStr::from_ptr(address)
        .to_str()
        .map_err(|_| status::net::BAD_ARGUMENT)
}

/// Usable buffer length, or `None` for a negative length or a null buffer
/// with a non-zero length.
fn buffer_len<T>(buf: *const T, len: c_int) -> Option<usize> {
    let len = usize::try_from(len).ok()?;
    (len == 0 || !buf.is_null()).then_some(len)
}

macro_rules! try_code {
    ($e:expr) => {
        match $e {
            Ok(value) => value,
            Err(code) => return code,
        }
    };
}

/// Bind a listener on `"host:port"` or `":port"` (all interfaces) and store
/// its handle in `*out`.
///
/// # Safety
/// `addr` must be null or NUL-terminated; `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_tcp_listen(rt: *const Runtime, addr: *const c_char, out: *mut u64) -> c_int {
    if out.is_null() {
        return status::net::BAD_ARGUMENT;
    }
    let addr = try_code!(address(addr));
    crate::with_runtime!(rt, status::net::BAD_ARGUMENT, |runtime| {
        match runtime.listen(addr) {
            Ok(handle) => {
                *out = handle.raw();
                status::net::OK
            }
            Err(e) => e.net_code(),
        }
    })
}

/// Connect to `"host:port"` or `":port"` (loopback) and store the connection
/// handle in `*out`.
///
/// # Safety
/// `addr` must be null or NUL-terminated; `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_tcp_connect(rt: *const Runtime, addr: *const c_char, out: *mut u64) -> c_int {
    if out.is_null() {
        return status::net::BAD_ARGUMENT;
    }
    let addr = try_code!(address(addr));
    crate::with_runtime!(rt, status::net::BAD_ARGUMENT, |runtime| {
        match runtime.connect(addr) {
            Ok(handle) => {
                *out = handle.raw();
                status::net::OK
            }
            Err(e) => e.net_code(),
        }
    })
}

/// Block until a peer connects and store its connection handle in `*out`.
///
/// # Safety
/// `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_tcp_accept(rt: *const Runtime, listener: u64, out: *mut u64) -> c_int {
    if out.is_null() {
        return status::net::BAD_ARGUMENT;
    }
    let listener = try_code!(resolve(listener, HandleKind::Listener));
    crate::with_runtime!(rt, status::net::BAD_ARGUMENT, |runtime| {
        match runtime.accept(listener) {
            Ok(conn) => {
                *out = conn.raw();
                status::net::OK
            }
            Err(e) => e.net_code(),
        }
    })
}

/// Read up to `len` bytes. `*n` receives the count. A zero `len` returns 0
/// at once with `*n` set to 0; otherwise the count is never 0 on success,
/// since end of stream is reported as 1.
///
/// # Safety
/// `buf` must be valid for `len` bytes of writes; `n` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_tcp_read(
    rt: *const Runtime,
    conn: u64,
    buf: *mut u8,
    len: c_int,
    n: *mut c_int,
) -> c_int {
    let Some(len) = buffer_len(buf, len) else {
        return status::net::BAD_ARGUMENT;
    };
    if n.is_null() {
        return status::net::BAD_ARGUMENT;
    }
    let conn = try_code!(resolve(conn, HandleKind::Connection));
    crate::with_runtime!(rt, status::net::BAD_ARGUMENT, |runtime| {
        let buf: &mut [u8] = if len == 0 { &mut [] } else { slice::from_raw_parts_mut(buf, len) };
        match runtime.read(conn, buf) {
            Ok(count) => {
                *n = count as c_int;
                status::net::OK
            }
            Err(e) => {
                *n = 0;
                e.net_code()
            }
        }
    })
}

/// Write all `len` bytes. `*n` receives `len` on success.
///
/// # Safety
/// `buf` must be valid for `len` bytes of reads; `n` null or valid.
#[no_mangle]
pub unsafe extern "C" fn tether_tcp_write(
    rt: *const Runtime,
    conn: u64,
    buf: *const u8,
    len: c_int,
    n: *mut c_int,
) -> c_int {
    let Some(len) = buffer_len(buf, len) else {
        return status::net::BAD_ARGUMENT;
    };
    let conn = try_code!(resolve(conn, HandleKind::Connection));
    crate::with_runtime!(rt, status::net::BAD_ARGUMENT, |runtime| {
        let buf: &[u8] = if len == 0 { &[] } else { slice::from_raw_parts(buf, len) };
        let (code, written) = match runtime.write(conn, buf) {
            Ok(count) => (status::net::OK, count as c_int),
            Err(e) => (e.net_code(), 0),
        };
        if !n.is_null() {
            *n = written;
        }
        code
    })
}

/// Best-effort write of `buf` to every open connection except `exclude`
/// (0 excludes nothing). Per-connection failures are only counted; the call
/// itself succeeds unless its arguments are bad.
///
/// # Safety
/// `buf` must be valid for `len` bytes of reads; `delivered` and `failed`
/// null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_tcp_broadcast(
    rt: *const Runtime,
    buf: *const u8,
    len: c_int,
    exclude: u64,
    delivered: *mut c_int,
    failed: *mut c_int,
) -> c_int {
    let Some(len) = buffer_len(buf, len) else {
        return status::net::BAD_ARGUMENT;
    };
    let exclude = Handle::from_raw(exclude);
    crate::with_runtime!(rt, status::net::BAD_ARGUMENT, |runtime| {
        let buf: &[u8] = if len == 0 { &[] } else { slice::from_raw_parts(buf, len) };
        let report = runtime.broadcast(buf, exclude);
        if !delivered.is_null() {
            *delivered = report.delivered as c_int;
        }
        if !failed.is_null() {
            *failed = report.failed as c_int;
        }
        status::net::OK
    })
}

/// Close a connection, waking any call blocked on it.
///
/// # Safety
/// `rt` must be null or a live runtime.
#[no_mangle]
pub unsafe extern "C" fn tether_tcp_conn_close(rt: *const Runtime, conn: u64) -> c_int {
    let conn = try_code!(resolve(conn, HandleKind::Connection));
    crate::with_runtime!(rt, status::net::BAD_ARGUMENT, |runtime| {
        match runtime.close_connection(conn) {
            Ok(()) => status::net::OK,
            Err(e) => e.net_code(),
        }
    })
}

/// Stop listening, waking any blocked accept.
///
/// # Safety
/// `rt` must be null or a live runtime.
#[no_mangle]
pub unsafe extern "C" fn tether_tcp_listener_close(rt: *const Runtime, listener: u64) -> c_int {
    let listener = try_code!(resolve(listener, HandleKind::Listener));
    crate::with_runtime!(rt, status::net::BAD_ARGUMENT, |runtime| {
        match runtime.close_listener(listener) {
            Ok(()) => status::net::OK,
            Err(e) => e.net_code(),
        }
    })
}

/// Port a listener is bound to, useful after listening on port 0.
///
/// # Safety
/// `port` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tether_tcp_local_port(rt: *const Runtime, listener: u64, port: *mut u16) -> c_int {
    if port.is_null() {
        return status::net::BAD_ARGUMENT;
    }
    let listener = try_code!(resolve(listener, HandleKind::Listener));
    crate::with_runtime!(rt, status::net::BAD_ARGUMENT, |runtime| {
        match runtime.local_addr(listener) {
            Ok(addr) => {
                *port = addr.port();
                status::net::OK
            }
            Err(e) => e.net_code(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRuntime;
    use std::ffi::CString;
    use std::ptr;
    use std::thread;

    #[derive(Clone, Copy)]
    struct SendPtr(*const Runtime);
    unsafe impl Send for SendPtr {}

    unsafe fn listen_any(rt: *const Runtime) -> (u64, u16) {
        let addr = CString::new("127.0.0.1:0").unwrap();
        let mut listener = 0;
        assert_eq!(tether_tcp_listen(rt, addr.as_ptr(), &mut listener), status::net::OK);
        let mut port = 0;
        assert_eq!(tether_tcp_local_port(rt, listener, &mut port), status::net::OK);
        (listener, port)
    }

    unsafe fn connect(rt: *const Runtime, port: u16) -> u64 {
        let addr = CString::new(format!(":{}", port)).unwrap();
        let mut conn = 0;
        assert_eq!(tether_tcp_connect(rt, addr.as_ptr(), &mut conn), status::net::OK);
        conn
    }

    unsafe fn read_exact(rt: *const Runtime, conn: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut got = 0;
        while got < len {
            let mut n = 0;
            let code = tether_tcp_read(rt, conn, out[got..].as_mut_ptr(), (len - got) as c_int, &mut n);
            assert_eq!(code, status::net::OK);
            got += n as usize;
        }
        out
    }

    #[test]
    fn accept_connect_and_exchange_bytes() {
        let rt = TestRuntime::new();
        let shared = SendPtr(rt.ptr());
        unsafe {
            let (listener, port) = listen_any(rt.ptr());
            assert_ne!(port, 0);

            let server = thread::spawn(move || {
                let shared = shared;
                let mut conn = 0;
                assert_eq!(tether_tcp_accept(shared.0, listener, &mut conn), status::net::OK);
                let msg = read_exact(shared.0, conn, 4);
                let mut n = 0;
                assert_eq!(tether_tcp_write(shared.0, conn, msg.as_ptr(), 4, &mut n), status::net::OK);
                assert_eq!(n, 4);
                conn
            });

            let client = connect(rt.ptr(), port);
            let mut n = 0;
            assert_eq!(tether_tcp_write(rt.ptr(), client, b"ping".as_ptr(), 4, &mut n), status::net::OK);
            assert_eq!(read_exact(rt.ptr(), client, 4), b"ping");

            // zero-length read returns at once
            n = -1;
            assert_eq!(tether_tcp_read(rt.ptr(), client, ptr::null_mut(), 0, &mut n), status::net::OK);
            assert_eq!(n, 0);

            let accepted = server.join().unwrap();
            assert_eq!(tether_tcp_conn_close(rt.ptr(), accepted), status::net::OK);

            // peer gone: end of stream is an error
            let mut buf = [0u8; 8];
            assert_eq!(
                tether_tcp_read(rt.ptr(), client, buf.as_mut_ptr(), buf.len() as c_int, &mut n),
                status::net::ERR
            );
            assert_eq!(n, 0);

            assert_eq!(tether_tcp_conn_close(rt.ptr(), client), status::net::OK);
            assert_eq!(tether_tcp_conn_close(rt.ptr(), client), status::net::NOT_FOUND);
            assert_eq!(tether_tcp_listener_close(rt.ptr(), listener), status::net::OK);
        }
    }

    #[test]
    fn broadcast_skips_the_excluded_connection() {
        let rt = TestRuntime::new();
        // clients live on their own runtime so they are not broadcast targets
        let peers = TestRuntime::new();
        let shared = SendPtr(rt.ptr());
        unsafe {
            let (listener, port) = listen_any(rt.ptr());
            let acceptor = thread::spawn(move || {
                let shared = shared;
                let mut accepted = Vec::new();
                for _ in 0..3 {
                    let mut conn = 0;
                    assert_eq!(tether_tcp_accept(shared.0, listener, &mut conn), status::net::OK);
                    accepted.push(conn);
                }
                accepted
            });
            let clients: Vec<u64> = (0..3).map(|_| connect(peers.ptr(), port)).collect();
            let accepted = acceptor.join().unwrap();

            let (mut delivered, mut failed) = (-1, -1);
            let code = tether_tcp_broadcast(rt.ptr(), b"hi".as_ptr(), 2, accepted[0], &mut delivered, &mut failed);
            assert_eq!(code, status::net::OK);
            assert_eq!((delivered, failed), (2, 0));

            // the excluded peer's first bytes are this direct write, not the broadcast
            let mut n = 0;
            assert_eq!(tether_tcp_write(rt.ptr(), accepted[0], b"no".as_ptr(), 2, &mut n), status::net::OK);
            let mut received: Vec<Vec<u8>> = clients.iter().map(|c| read_exact(peers.ptr(), *c, 2)).collect();
            received.sort();
            assert_eq!(received, vec![b"hi".to_vec(), b"hi".to_vec(), b"no".to_vec()]);
        }
    }

    #[test]
    fn bad_arguments_and_unknown_handles() {
        let rt = TestRuntime::new();
        unsafe {
            let mut out = 0u64;
            assert_eq!(tether_tcp_listen(rt.ptr(), ptr::null(), &mut out), status::net::BAD_ARGUMENT);
            let addr = CString::new("127.0.0.1:0").unwrap();
            assert_eq!(tether_tcp_listen(rt.ptr(), addr.as_ptr(), ptr::null_mut()), status::net::BAD_ARGUMENT);

            let unparsable = CString::new("not an address").unwrap();
            assert_eq!(tether_tcp_connect(rt.ptr(), unparsable.as_ptr(), &mut out), status::net::ERR);

            let mut buf = [0u8; 4];
            let mut n = 0;
            assert_eq!(tether_tcp_read(rt.ptr(), 77, buf.as_mut_ptr(), 4, &mut n), status::net::NOT_FOUND);
            assert_eq!(tether_tcp_read(rt.ptr(), 77, buf.as_mut_ptr(), -1, &mut n), status::net::BAD_ARGUMENT);
            assert_eq!(tether_tcp_write(rt.ptr(), 77, ptr::null(), 4, &mut n), status::net::BAD_ARGUMENT);
            assert_eq!(tether_tcp_accept(rt.ptr(), 0, &mut out), status::net::NOT_FOUND);

            // a channel handle is not a connection
            let chan = crate::channel::tether_channel_create(rt.ptr(), 1);
            assert_eq!(tether_tcp_write(rt.ptr(), chan, buf.as_ptr(), 4, &mut n), status::net::NOT_FOUND);

            let (mut delivered, mut failed) = (-1, -1);
            assert_eq!(
                tether_tcp_broadcast(rt.ptr(), buf.as_ptr(), 4, 0, &mut delivered, &mut failed),
                status::net::OK
            );
            assert_eq!((delivered, failed), (0, 0));
        }
    }

    #[test]
    fn closing_a_listener_wakes_accept() {
        let rt = TestRuntime::new();
        let shared = SendPtr(rt.ptr());
        unsafe {
            let (listener, _) = listen_any(rt.ptr());
            let acceptor = thread::spawn(move || {
                let shared = shared;
                let mut conn = 0;
                tether_tcp_accept(shared.0, listener, &mut conn)
            });
            thread::sleep(std::time::Duration::from_millis(50));
            assert_eq!(tether_tcp_listener_close(rt.ptr(), listener), status::net::OK);
            assert_eq!(acceptor.join().unwrap(), status::net::ERR);
        }
    }
}
