use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Semaphore;

use crate::error::{Result, RuntimeError};
use crate::handle::{Handle, HandleAllocator, HandleKind};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskState {
    Pending = 0,
    Completed = 1,
}

impl From<u8> for TaskState {
    fn from(value: u8) -> Self {
        match value {
            0 => TaskState::Pending,
            _ => TaskState::Completed,
        }
    }
}

/// Outcome of a non-blocking poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus<T> {
    Running,
    /// `None` for fire-and-forget tasks and for tasks whose work panicked.
    Completed(Option<T>),
}

#[derive(Debug)]
struct TaskSlot<T> {
    result: Option<T>,
    wakers: Vec<Waker>,
}

/// Record for one launched unit of work.
///
/// `state` is the lock-free fast path for polling; the result and the waiter
/// list live behind `slot`, and the state only flips to `Completed` while
/// `slot` is held, after the result is in place.
#[derive(Debug)]
pub struct TaskEntry<T> {
    expects_result: bool,
    state: AtomicU8,
    slot: Mutex<TaskSlot<T>>,
    done: Condvar,
}

impl<T: Clone> TaskEntry<T> {
    fn new(expects_result: bool) -> Self {
        TaskEntry {
            expects_result,
            state: AtomicU8::new(TaskState::Pending as u8),
            slot: Mutex::new(TaskSlot {
                result: None,
                wakers: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        TaskState::from(self.state.load(Ordering::Acquire))
    }

    pub fn expects_result(&self) -> bool {
        self.expects_result
    }

    /// Store the result and fire the completion signal. Returns `false` if
    /// the task had already completed; the signal fires at most once.
    pub fn complete(&self, value: Option<T>) -> bool {
        let wakers = {
            let mut slot = self.slot.lock();
            if self.state() == TaskState::Completed {
                return false;
            }
            if self.expects_result {
                slot.result = value;
            }
            self.state.store(TaskState::Completed as u8, Ordering::Release);
            std::mem::take(&mut slot.wakers)
        };

        self.done.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn try_poll(&self) -> TaskStatus<T> {
        if self.state() == TaskState::Pending {
            return TaskStatus::Running;
        }
        TaskStatus::Completed(self.slot.lock().result.clone())
    }

    pub fn wait(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        while self.state() == TaskState::Pending {
            self.done.wait(&mut slot);
        }
        slot.result.clone()
    }

    /// Block until completion or `timeout`. The state is re-checked under the
    /// lock after the deadline, so a completion that lands before it is
    /// reported as completed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.slot.lock();
        loop {
            if self.state() == TaskState::Completed {
                return Ok(slot.result.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut slot, deadline).timed_out() {
                        if self.state() == TaskState::Completed {
                            return Ok(slot.result.clone());
                        }
                        return Err(RuntimeError::Timeout(timeout));
                    }
                }
                // deadline past Instant's range, same as no timeout
                None => self.done.wait(&mut slot),
            }
        }
    }

    fn register_waker(&self, waker: &Waker) -> Option<Option<T>> {
        if let TaskStatus::Completed(result) = self.try_poll() {
            return Some(result);
        }

        let mut slot = self.slot.lock();
        // Check again under lock
        if self.state() == TaskState::Completed {
            return Some(slot.result.clone());
        }
        if !slot.wakers.iter().any(|w| w.will_wake(waker)) {
            slot.wakers.push(waker.clone());
        }
        None
    }
}

/// Future resolving when a task completes. Lets async code await a task
/// without parking a thread.
pub struct TaskWait<T> {
    entry: Arc<TaskEntry<T>>,
}

impl<T: Clone> Future for TaskWait<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.entry.register_waker(cx.waker()) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

/// Launches work concurrently and tracks it by handle.
///
/// Records are only removed by [`TaskRegistry::cleanup`]; a caller that never
/// cleans up keeps the record around so it can still be polled late.
pub struct TaskRegistry<T> {
    allocator: Arc<HandleAllocator>,
    tasks: DashMap<Handle, Arc<TaskEntry<T>>>,
    runtime: TokioHandle,
    permits: Option<Arc<Semaphore>>,
}

impl<T> TaskRegistry<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(
        allocator: Arc<HandleAllocator>,
        runtime: TokioHandle,
        max_outstanding: Option<usize>,
    ) -> Self {
        TaskRegistry {
            allocator,
            tasks: DashMap::new(),
            runtime,
            permits: max_outstanding.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    fn register(&self, expects_result: bool) -> (Handle, Arc<TaskEntry<T>>) {
        let handle = self.allocator.issue(HandleKind::Task);
        let entry = Arc::new(TaskEntry::new(expects_result));
        self.tasks.insert(handle, entry.clone());
        (handle, entry)
    }

    /// Run `job` on the blocking pool. The handle is returned before the job
    /// necessarily starts; with an outstanding-task limit configured the job
    /// waits in line for a permit.
    fn launch_blocking<F>(&self, expects_result: bool, job: F) -> Handle
    where
        F: FnOnce() -> Option<T> + Send + 'static,
    {
        let (handle, entry) = self.register(expects_result);
        let permits = self.permits.clone();

        self.runtime.spawn(async move {
            let _permit = match permits {
                Some(permits) => permits.acquire_owned().await.ok(),
                None => None,
            };

            let value = match tokio::task::spawn_blocking(job).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::error!(task = %handle, error = %e, "task body failed");
                    None
                }
            };
            entry.complete(value);
            tracing::trace!(task = %handle, "task completed");
        });

        tracing::debug!(task = %handle, expects_result, "task launched");
        handle
    }

    pub fn launch_with_result<F>(&self, job: F) -> Handle
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.launch_blocking(true, move || Some(job()))
    }

    /// Fire-and-forget launch; only completion is recorded.
    pub fn launch_detached<F>(&self, job: F) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        self.launch_blocking(false, move || {
            job();
            None
        })
    }

    /// Track a Rust future as a task. It runs on the async workers and does
    /// not count against the outstanding-task limit.
    pub fn spawn_future<Fut>(&self, future: Fut) -> Handle
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let (handle, entry) = self.register(true);
        let inner = self.runtime.spawn(future);

        self.runtime.spawn(async move {
            let value = match inner.await {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::error!(task = %handle, error = %e, "task future failed");
                    None
                }
            };
            entry.complete(value);
        });

        tracing::debug!(task = %handle, "future launched");
        handle
    }

    fn entry(&self, handle: Handle) -> Result<Arc<TaskEntry<T>>> {
        // clone out so no shard lock is held while the caller blocks
        self.tasks
            .get(&handle)
            .map(|e| e.value().clone())
            .ok_or_else(|| RuntimeError::invalid(HandleKind::Task, handle.raw()))
    }

    pub fn poll(&self, handle: Handle) -> Result<TaskStatus<T>> {
        Ok(self.entry(handle)?.try_poll())
    }

    pub fn wait(&self, handle: Handle) -> Result<Option<T>> {
        Ok(self.entry(handle)?.wait())
    }

    pub fn wait_timeout(&self, handle: Handle, timeout: Duration) -> Result<Option<T>> {
        self.entry(handle)?.wait_timeout(timeout)
    }

    pub fn wait_async(&self, handle: Handle) -> Result<TaskWait<T>> {
        Ok(TaskWait {
            entry: self.entry(handle)?,
        })
    }

    /// Drop the record whatever its state. Unknown handles are ignored.
    /// Returns whether a record was removed.
    pub fn cleanup(&self, handle: Handle) -> bool {
        let removed = self.tasks.remove(&handle).is_some();
        if removed {
            tracing::debug!(task = %handle, "task cleaned up");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.tasks
            .iter()
            .filter(|e| e.value().state() == TaskState::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    fn fixture() -> (tokio::runtime::Runtime, TaskRegistry<u64>) {
        fixture_with_limit(None)
    }

    fn fixture_with_limit(limit: Option<usize>) -> (tokio::runtime::Runtime, TaskRegistry<u64>) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let registry = TaskRegistry::new(Arc::new(HandleAllocator::new()), rt.handle().clone(), limit);
        (rt, registry)
    }

    #[test]
    fn await_returns_computed_value() {
        let (_rt, tasks) = fixture();
        let arg = 21;
        let handle = tasks.launch_with_result(move || arg * 2);
        assert_eq!(tasks.wait(handle).unwrap(), Some(42));
        // still retrievable until cleanup
        assert_eq!(tasks.poll(handle).unwrap(), TaskStatus::Completed(Some(42)));
    }

    #[test]
    fn poll_reports_running_then_completed() {
        let (_rt, tasks) = fixture();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let handle = tasks.launch_with_result(move || {
            release_rx.recv().unwrap();
            7
        });

        assert_eq!(tasks.poll(handle).unwrap(), TaskStatus::Running);
        release_tx.send(()).unwrap();
        assert_eq!(tasks.wait(handle).unwrap(), Some(7));
        assert_eq!(tasks.poll(handle).unwrap(), TaskStatus::Completed(Some(7)));
    }

    #[test]
    fn unknown_handles_are_invalid() {
        let (_rt, tasks) = fixture();
        let foreign = HandleAllocator::new().issue(HandleKind::Channel);
        assert!(tasks.poll(foreign).unwrap_err().is_invalid_handle());
        assert!(tasks.wait(foreign).unwrap_err().is_invalid_handle());
        assert!(tasks
            .wait_timeout(foreign, Duration::from_millis(5))
            .unwrap_err()
            .is_invalid_handle());
    }

    #[test]
    fn detached_task_records_only_completion() {
        let (_rt, tasks) = fixture();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let handle = tasks.launch_detached(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(tasks.wait(handle).unwrap(), None);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(tasks.poll(handle).unwrap(), TaskStatus::Completed(None));
    }

    #[test]
    fn wait_timeout_expires_then_completes() {
        let (_rt, tasks) = fixture();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let handle = tasks.launch_with_result(move || {
            release_rx.recv().unwrap();
            1
        });

        let started = Instant::now();
        let err = tasks.wait_timeout(handle, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));

        release_tx.send(()).unwrap();
        assert_eq!(tasks.wait_timeout(handle, Duration::from_secs(5)).unwrap(), Some(1));
    }

    #[test]
    fn completion_before_deadline_is_never_a_timeout() {
        let entry = TaskEntry::<u64>::new(true);
        assert!(entry.complete(Some(5)));
        assert_eq!(entry.wait_timeout(Duration::ZERO).unwrap(), Some(5));
    }

    #[test]
    fn completion_signal_fires_once() {
        let entry = TaskEntry::<u64>::new(true);
        assert!(entry.complete(Some(1)));
        assert!(!entry.complete(Some(2)));
        assert_eq!(entry.wait(), Some(1));
    }

    #[test]
    fn completion_is_visible_to_every_waiter() {
        let entry = Arc::new(TaskEntry::<u64>::new(true));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let entry = entry.clone();
                thread::spawn(move || entry.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        entry.complete(Some(99));
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Some(99));
        }
    }

    #[test]
    fn cleanup_removes_in_any_state() {
        let (_rt, tasks) = fixture();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let running = tasks.launch_detached(move || {
            let _ = release_rx.recv();
        });
        let done = tasks.launch_with_result(|| 3);
        tasks.wait(done).unwrap();

        assert!(tasks.cleanup(running));
        assert!(tasks.cleanup(done));
        assert!(!tasks.cleanup(done));
        assert!(tasks.poll(running).unwrap_err().is_invalid_handle());
        assert!(tasks.is_empty());
        drop(release_tx);
    }

    #[test]
    fn panicking_task_completes_without_result() {
        let (_rt, tasks) = fixture();
        let handle = tasks.launch_with_result(|| panic!("boom"));
        assert_eq!(tasks.wait(handle).unwrap(), None);
    }

    #[test]
    fn outstanding_limit_queues_excess_launches() {
        let (_rt, tasks) = fixture_with_limit(Some(1));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let first = tasks.launch_with_result(move || {
            release_rx.recv().unwrap();
            1
        });
        let second = tasks.launch_with_result(|| 2);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(tasks.poll(second).unwrap(), TaskStatus::Running);
        assert_eq!(tasks.pending(), 2);

        release_tx.send(()).unwrap();
        assert_eq!(tasks.wait(first).unwrap(), Some(1));
        assert_eq!(tasks.wait(second).unwrap(), Some(2));
    }

    #[test]
    fn futures_can_be_awaited_from_async_code() {
        let (rt, tasks) = fixture();
        let handle = tasks.spawn_future(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            11
        });
        let wait = tasks.wait_async(handle).unwrap();
        assert_eq!(rt.block_on(wait), Some(11));
        assert_eq!(tasks.wait(handle).unwrap(), Some(11));
    }

    #[test]
    fn many_tasks_run_concurrently() {
        let (_rt, tasks) = fixture();
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16u64)
            .map(|i| {
                let barrier = barrier.clone();
                tasks.launch_with_result(move || {
                    // deadlocks unless all sixteen are running at once
                    barrier.wait();
                    i
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(tasks.wait_timeout(handle, Duration::from_secs(5)).unwrap(), Some(i as u64));
        }
    }
}
