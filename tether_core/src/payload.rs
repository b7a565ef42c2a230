use std::ffi::c_void;
use std::ptr;

/// A foreign pointer carried through task results and channels.
///
/// The runtime stores and forwards the address and nothing else: it never
/// reads through it, never frees it, and never checks it. Keeping the
/// pointee alive until the receiving side is done with it is the caller's
/// job. Callers that cannot promise that should use the byte channels, which
/// copy the data in and out.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaquePtr(*mut c_void);

// The address is only ever copied around, never dereferenced on our side.
unsafe impl Send for OpaquePtr {}
unsafe impl Sync for OpaquePtr {}

impl OpaquePtr {
    pub const NULL: OpaquePtr = OpaquePtr(ptr::null_mut());

    pub fn new(ptr: *mut c_void) -> Self {
        OpaquePtr(ptr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for OpaquePtr {
    fn default() -> Self {
        OpaquePtr::NULL
    }
}

impl From<*mut c_void> for OpaquePtr {
    fn from(ptr: *mut c_void) -> Self {
        OpaquePtr(ptr)
    }
}
