use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RuntimeError};
use crate::handle::{Handle, HandleAllocator, HandleKind};

#[derive(Debug)]
struct ChannelState<T> {
    queue: VecDeque<T>,
    closed: bool,
    sent: u64,
    received: u64,
}

/// Bounded FIFO queue shared by any number of senders and receivers.
///
/// Capacity 0 is a rendezvous: the queue holds the single value in flight and
/// its sender stays blocked until a receiver has taken it.
#[derive(Debug)]
pub struct Channel<T> {
    capacity: usize,
    state: Mutex<ChannelState<T>>,
    items: Condvar,
    space: Condvar,
}

/// Why a channel operation did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFailure {
    Empty,
    Closed,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        Channel {
            capacity,
            state: Mutex::new(ChannelState {
                // grows on demand; capacity is only an upper bound
                queue: VecDeque::new(),
                closed: false,
                sent: 0,
                received: 0,
            }),
            items: Condvar::new(),
            space: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closed with nothing left to hand out.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.queue.is_empty()
    }

    /// Blocks while the queue is full. Gives the value back if the channel is
    /// or becomes closed before there is room for it.
    pub fn send(&self, value: T) -> std::result::Result<(), T> {
        let slots = self.capacity.max(1);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(value);
            }
            if state.queue.len() < slots {
                break;
            }
            self.space.wait(&mut state);
        }

        state.queue.push_back(value);
        state.sent += 1;
        let ticket = state.sent;
        self.items.notify_one();

        if self.capacity == 0 {
            // Value is buffered either way; a close here leaves it drainable.
            while state.received < ticket && !state.closed {
                self.space.wait(&mut state);
            }
        }
        Ok(())
    }

    pub fn recv(&self) -> std::result::Result<T, ChannelFailure> {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = state.queue.pop_front() {
                state.received += 1;
                self.signal_space();
                return Ok(value);
            }
            if state.closed {
                return Err(ChannelFailure::Closed);
            }
            self.items.wait(&mut state);
        }
    }

    pub fn try_recv(&self) -> std::result::Result<T, ChannelFailure> {
        let mut state = self.state.lock();
        if let Some(value) = state.queue.pop_front() {
            state.received += 1;
            self.signal_space();
            return Ok(value);
        }
        if state.closed {
            Err(ChannelFailure::Closed)
        } else {
            Err(ChannelFailure::Empty)
        }
    }

    fn signal_space(&self) {
        if self.capacity == 0 {
            // rendezvous senders each wait for their own ticket
            self.space.notify_all();
        } else {
            self.space.notify_one();
        }
    }

    /// Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        drop(state);

        self.items.notify_all();
        self.space.notify_all();
        true
    }
}

/// Channels keyed by handle.
///
/// The table lock only guards map lookups and moves; every blocking send or
/// receive happens on a cloned `Arc<Channel>` after the lock is released.
/// A closed channel stays resolvable until its buffered values are drained,
/// then it is retired. A retired handle is not remembered: any handle of this
/// registry's kind that was issued but is no longer open reports `Closed`.
#[derive(Debug)]
pub struct ChannelRegistry<T> {
    kind: HandleKind,
    allocator: Arc<HandleAllocator>,
    open: Mutex<HashMap<Handle, Arc<Channel<T>>>>,
}

impl<T: Send> ChannelRegistry<T> {
    pub fn new(kind: HandleKind, allocator: Arc<HandleAllocator>) -> Self {
        ChannelRegistry {
            kind,
            allocator,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn create(&self, capacity: usize) -> Handle {
        let handle = self.allocator.issue(self.kind);
        self.open.lock().insert(handle, Arc::new(Channel::new(capacity)));
        tracing::debug!(channel = %handle, capacity, "channel created");
        handle
    }

    fn lookup(&self, handle: Handle) -> Result<Arc<Channel<T>>> {
        if let Some(channel) = self.open.lock().get(&handle) {
            return Ok(channel.clone());
        }
        if self.was_issued(handle) {
            return Err(RuntimeError::Closed(handle));
        }
        Err(RuntimeError::invalid(self.kind, handle.raw()))
    }

    /// Whether `handle` could have come from this registry's `create`.
    fn was_issued(&self, handle: Handle) -> bool {
        handle.kind() == Some(self.kind) && handle.sequence() <= self.allocator.issued()
    }

    fn retire_if_drained(&self, handle: Handle, channel: &Channel<T>) {
        if !channel.is_drained() {
            return;
        }
        if self.open.lock().remove(&handle).is_some() {
            tracing::debug!(channel = %handle, "channel retired");
        }
    }

    pub fn send(&self, handle: Handle, value: T) -> Result<()> {
        let channel = self.lookup(handle)?;
        channel.send(value).map_err(|_| RuntimeError::Closed(handle))?;
        tracing::trace!(channel = %handle, "sent");
        Ok(())
    }

    pub fn recv(&self, handle: Handle) -> Result<T> {
        let channel = self.lookup(handle)?;
        let outcome = channel.recv();
        self.retire_if_drained(handle, &channel);
        outcome.map_err(|_| RuntimeError::Closed(handle))
    }

    pub fn try_recv(&self, handle: Handle) -> Result<T> {
        let channel = self.lookup(handle)?;
        let outcome = channel.try_recv();
        self.retire_if_drained(handle, &channel);
        outcome.map_err(|failure| match failure {
            ChannelFailure::Empty => RuntimeError::WouldBlock,
            ChannelFailure::Closed => RuntimeError::Closed(handle),
        })
    }

    /// Close and release everyone blocked on the channel. Buffered values
    /// stay receivable. Closing twice, or closing an unknown handle, is a
    /// no-op; returns whether this call did the closing.
    pub fn close(&self, handle: Handle) -> bool {
        let mut open = self.open.lock();
        let Some(channel) = open.get(&handle).cloned() else {
            return false;
        };
        let closed = channel.close();
        if channel.is_empty() {
            open.remove(&handle);
        }
        drop(open);

        if closed {
            tracing::debug!(channel = %handle, "channel closed");
        }
        closed
    }

    /// Close every open channel. Used at runtime teardown.
    pub fn close_all(&self) -> usize {
        let handles: Vec<Handle> = self.open.lock().keys().copied().collect();
        handles.into_iter().filter(|h| self.close(*h)).count()
    }

    /// Channels that are open or still draining.
    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
