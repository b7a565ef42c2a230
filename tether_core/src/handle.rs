use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Registry family a handle belongs to. Stored in the top byte of the raw value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Task = 1,
    Channel = 2,
    ByteChannel = 3,
    Listener = 4,
    Connection = 5,
}

impl HandleKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(HandleKind::Task),
            2 => Some(HandleKind::Channel),
            3 => Some(HandleKind::ByteChannel),
            4 => Some(HandleKind::Listener),
            5 => Some(HandleKind::Connection),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HandleKind::Task => "task",
            HandleKind::Channel => "channel",
            HandleKind::ByteChannel => "byte channel",
            HandleKind::Listener => "listener",
            HandleKind::Connection => "connection",
        }
    }
}

/// Opaque identifier for a registry entry.
///
/// The raw value packs the owning [`HandleKind`] into the top 8 bits and the
/// allocator sequence into the low 56 bits, so a task handle can never be
/// mistaken for a channel handle. The raw value is never zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU64);

impl Handle {
    const KIND_SHIFT: u32 = 56;
    pub const SEQUENCE_MASK: u64 = (1 << Self::KIND_SHIFT) - 1;

    fn tagged(kind: HandleKind, sequence: u64) -> Self {
        debug_assert!(sequence != 0 && sequence <= Self::SEQUENCE_MASK);
        let raw = ((kind as u64) << Self::KIND_SHIFT) | sequence;
        // kind tag is never zero, so neither is raw
        Handle(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Rebuild a handle from a value that crossed the boundary. Returns `None`
    /// for `0`, unknown kind tags and empty sequences.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let handle = Handle(NonZeroU64::new(raw)?);
        if handle.kind().is_none() || handle.sequence() == 0 {
            return None;
        }
        Some(handle)
    }

    /// Like [`Handle::from_raw`] but also checks the registry family.
    pub fn from_raw_kind(raw: u64, kind: HandleKind) -> Option<Self> {
        Self::from_raw(raw).filter(|h| h.kind() == Some(kind))
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }

    pub fn kind(self) -> Option<HandleKind> {
        HandleKind::from_tag((self.0.get() >> Self::KIND_SHIFT) as u8)
    }

    pub fn sequence(self) -> u64 {
        self.0.get() & Self::SEQUENCE_MASK
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "Handle({}#{})", kind.name(), self.sequence()),
            None => write!(f, "Handle({:#x})", self.raw()),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{} #{}", kind.name(), self.sequence()),
            None => write!(f, "{:#x}", self.raw()),
        }
    }
}

/// Monotonic sequence source shared by every registry of one runtime.
#[derive(Debug, Default)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        HandleAllocator {
            next: AtomicU64::new(0),
        }
    }

    /// Next sequence number. The first call returns `1`.
    ///
    /// # Panics
    /// When the 56-bit sequence space is exhausted. Reusing a value would
    /// break handle uniqueness, so there is no recovery.
    pub fn allocate(&self) -> u64 {
        let sequence = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if sequence == 0 || sequence > Handle::SEQUENCE_MASK {
            panic!("handle space exhausted");
        }
        sequence
    }

    pub fn issue(&self, kind: HandleKind) -> Handle {
        Handle::tagged(kind, self.allocate())
    }

    /// Number of sequence values handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_sequence_is_one() {
        let alloc = HandleAllocator::new();
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.issued(), 2);
    }

    #[test]
    fn concurrent_allocations_are_distinct_and_nonzero() {
        let alloc = Arc::new(HandleAllocator::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                thread::spawn(move || (0..1000).map(|_| alloc.issue(HandleKind::Task)).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for handle in worker.join().unwrap() {
                assert_ne!(handle.raw(), 0);
                assert!(seen.insert(handle), "duplicate handle {:?}", handle);
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn kind_tag_survives_round_trip() {
        let alloc = HandleAllocator::new();
        let chan = alloc.issue(HandleKind::Channel);
        let raw = chan.raw();

        assert_eq!(Handle::from_raw(raw), Some(chan));
        assert_eq!(Handle::from_raw_kind(raw, HandleKind::Channel), Some(chan));
        assert_eq!(Handle::from_raw_kind(raw, HandleKind::Task), None);
        assert_eq!(chan.sequence(), 1);
    }

    #[test]
    fn rejects_garbage_raw_values() {
        assert_eq!(Handle::from_raw(0), None);
        assert_eq!(Handle::from_raw(1), None); // no kind tag
        assert_eq!(Handle::from_raw(0xFF << 56 | 1), None);
        assert_eq!(Handle::from_raw(1 << 56), None); // empty sequence
    }

    #[test]
    #[should_panic(expected = "handle space exhausted")]
    fn exhaustion_is_fatal() {
        let alloc = HandleAllocator {
            next: AtomicU64::new(Handle::SEQUENCE_MASK),
        };
        alloc.allocate();
    }
}
