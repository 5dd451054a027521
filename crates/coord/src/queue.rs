use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lock::{ExclusiveLock, LockClosedError, SerialLock, SerialPermit};

/// Error returned when acquiring through a closed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("priority lock queue is closed")]
pub struct QueueClosedError;

/// Tuning for the queue worker loop.
#[derive(Debug, Clone)]
pub struct QueueSpec {
	pub(crate) poll_interval: Duration,
	pub(crate) monitor_interval: Option<Duration>,
	pub(crate) serial_priority: i32,
}

impl QueueSpec {
	/// Sets the release-poll interval.
	///
	/// # Panics
	///
	/// Panics if `interval` is zero.
	#[must_use]
	pub fn poll_interval(mut self, interval: Duration) -> Self {
		assert!(!interval.is_zero(), "poll interval must be > 0");
		self.poll_interval = interval;
		self
	}

	/// Enables periodic status logging at the given interval.
	///
	/// # Panics
	///
	/// Panics if `interval` is zero.
	#[must_use]
	pub fn monitor_interval(mut self, interval: Duration) -> Self {
		assert!(!interval.is_zero(), "monitor interval must be > 0");
		self.monitor_interval = Some(interval);
		self
	}

	/// Sets the priority used for [`SerialLock`] grants.
	#[must_use]
	pub fn serial_priority(mut self, priority: i32) -> Self {
		self.serial_priority = priority;
		self
	}
}

impl Default for QueueSpec {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_millis(1),
			monitor_interval: None,
			serial_priority: 0,
		}
	}
}

type GrantFn = Box<dyn FnOnce() + Send>;

/// One queued grant request. Lower `priority` wins; `seq` keeps equal
/// priorities in submission order.
struct Pending {
	priority: i32,
	seq: u64,
	grant: GrantFn,
}

impl Pending {
	fn key(&self) -> (i32, u64) {
		(self.priority, self.seq)
	}
}

impl PartialEq for Pending {
	fn eq(&self, other: &Self) -> bool {
		self.key() == other.key()
	}
}

impl Eq for Pending {}

impl PartialOrd for Pending {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}

impl Ord for Pending {
	// Reversed so the max-heap pops the lowest (priority, seq) first.
	fn cmp(&self, other: &Self) -> CmpOrdering {
		other.key().cmp(&self.key())
	}
}

struct QueueState {
	heap: BinaryHeap<Pending>,
	closed: bool,
}

struct Shared {
	lock: ExclusiveLock,
	state: Mutex<QueueState>,
	wake: Notify,
	seq: AtomicU64,
}

impl Shared {
	fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn emit_status(&self) {
		let queued = self.lock_state().heap.len();
		tracing::debug!(queued, locked = self.lock.is_locked(), "lock_queue.status");
	}
}

/// Mutual-exclusion wrapper that grants access in priority order rather than
/// FIFO.
///
/// A single worker task, spawned at construction and owned by this structure,
/// continuously pulls the lowest-priority-value pending request, invokes its
/// grant callback (which performs the physical [`ExclusiveLock`] acquisition
/// on the caller's behalf), then polls at
/// [`QueueSpec::poll_interval`] until the lock is observed unlocked before
/// pulling the next request. The grantee, not the worker, releases the lock.
///
/// Known liveness debt inherited from the design: a grant that acquires the
/// lock and never releases it starves every later request regardless of
/// priority.
pub struct PriorityLockQueue {
	shared: Arc<Shared>,
	cancel: CancellationToken,
	worker: Mutex<Option<JoinHandle<()>>>,
	serial_priority: i32,
}

impl PriorityLockQueue {
	/// Creates a queue over `lock` with default tuning and spawns the worker.
	///
	/// Must be called from within a tokio runtime.
	pub fn new(lock: ExclusiveLock) -> Self {
		Self::with_spec(lock, QueueSpec::default())
	}

	/// Creates a queue with explicit tuning.
	pub fn with_spec(lock: ExclusiveLock, spec: QueueSpec) -> Self {
		let shared = Arc::new(Shared {
			lock,
			state: Mutex::new(QueueState {
				heap: BinaryHeap::new(),
				closed: false,
			}),
			wake: Notify::new(),
			seq: AtomicU64::new(0),
		});
		let cancel = CancellationToken::new();
		let worker = tokio::spawn(worker_loop(
			Arc::clone(&shared),
			cancel.child_token(),
			spec.poll_interval,
			spec.monitor_interval,
		));
		Self {
			shared,
			cancel,
			worker: Mutex::new(Some(worker)),
			serial_priority: spec.serial_priority,
		}
	}

	/// Queues a grant request. Lower priority values are served first; equal
	/// priorities are served strictly in submission order.
	///
	/// The callback runs on the worker task once the request is dequeued; it
	/// is expected to take the underlying lock via the granted path. After
	/// [`Self::close`], entries are dropped without being invoked.
	pub fn submit(&self, priority: i32, grant: impl FnOnce() + Send + 'static) {
		let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
		{
			let mut state = self.shared.lock_state();
			if state.closed {
				tracing::debug!(priority, "lock_queue.submit_after_close");
				return;
			}
			state.heap.push(Pending {
				priority,
				seq,
				grant: Box::new(grant),
			});
		}
		tracing::trace!(priority, seq, "lock_queue.submit");
		self.shared.wake.notify_one();
	}

	/// Acquires the lock at the given priority, suspending until granted.
	///
	/// The returned permit releases the lock on drop. Cancelling the caller
	/// before the grant leaves the lock free: the grant observes the
	/// abandoned receiver and declines to acquire. Cancelling after the grant
	/// releases through the permit's drop. Holding is never interrupted.
	pub async fn acquire(&self, priority: i32) -> Result<QueuePermit, QueueClosedError> {
		let (tx, rx) = oneshot::channel();
		let shared = Arc::clone(&self.shared);
		self.submit(priority, move || {
			if tx.is_closed() {
				// Caller cancelled before the grant; leave the lock free.
				return;
			}
			shared.lock.acquire_granted();
			let permit = QueuePermit { shared };
			// A send that loses the race to cancellation drops the permit,
			// which releases the lock.
			let _ = tx.send(permit);
		});
		rx.await.map_err(|_| QueueClosedError)
	}

	/// Direct access to the underlying primitive lock for callers that have
	/// already been granted access.
	pub fn lock(&self) -> &ExclusiveLock {
		&self.shared.lock
	}

	/// Stops the worker and abandons still-queued requests.
	///
	/// Abandoned callbacks are never invoked and receive no notification;
	/// waiting [`Self::acquire`] callers get [`QueueClosedError`]. A held
	/// grant is unaffected and still releases normally. Idempotent.
	pub async fn close(&self) {
		let abandoned = {
			let mut state = self.shared.lock_state();
			state.closed = true;
			let abandoned = state.heap.len();
			state.heap.clear();
			abandoned
		};
		if abandoned > 0 {
			tracing::debug!(abandoned, "lock_queue.abandon");
		}
		self.cancel.cancel();
		self.shared.wake.notify_waiters();

		let handle = {
			let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
			worker.take()
		};
		if let Some(handle) = handle {
			let _ = handle.await;
			tracing::debug!("lock_queue.closed");
		}
	}
}

impl Drop for PriorityLockQueue {
	fn drop(&mut self) {
		let mut state = self.shared.lock_state();
		state.closed = true;
		state.heap.clear();
		drop(state);
		self.cancel.cancel();
		self.shared.wake.notify_waiters();
	}
}

impl std::fmt::Debug for PriorityLockQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PriorityLockQueue")
			.field("queued", &self.shared.lock_state().heap.len())
			.field("locked", &self.shared.lock.is_locked())
			.finish_non_exhaustive()
	}
}

#[async_trait]
impl SerialLock for PriorityLockQueue {
	async fn acquire(&self) -> Result<SerialPermit, LockClosedError> {
		let permit = PriorityLockQueue::acquire(self, self.serial_priority)
			.await
			.map_err(|_| LockClosedError)?;
		Ok(SerialPermit::new(permit))
	}
}

/// Drop-releasing grant of the queue's exclusive lock.
pub struct QueuePermit {
	shared: Arc<Shared>,
}

impl Drop for QueuePermit {
	fn drop(&mut self) {
		self.shared.lock.release();
		tracing::trace!("lock_queue.release");
	}
}

impl std::fmt::Debug for QueuePermit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("QueuePermit").finish_non_exhaustive()
	}
}

async fn worker_loop(shared: Arc<Shared>, cancel: CancellationToken, poll: Duration, monitor: Option<Duration>) {
	let mut status = monitor.map(tokio::time::interval);
	loop {
		// Take the lowest-priority pending grant, or wait for one.
		let pending = loop {
			// Register the notification future before checking the heap to
			// avoid a lost wakeup between the check and the await.
			let notified = shared.wake.notified();
			{
				let mut state = shared.lock_state();
				if let Some(entry) = state.heap.pop() {
					break entry;
				}
				if state.closed {
					return;
				}
			}
			tokio::select! {
				_ = notified => {}
				_ = cancel.cancelled() => return,
				_ = status_tick(&mut status) => shared.emit_status(),
			}
		};

		let Pending { priority, seq, grant } = pending;
		tracing::trace!(priority, seq, "lock_queue.grant");
		if std::panic::catch_unwind(AssertUnwindSafe(grant)).is_err() {
			tracing::warn!(priority, seq, "lock_queue.grant_panicked");
		}

		// The grantee, not this loop, releases the lock; poll until it does
		// so no new grant is issued while exclusion is held.
		while shared.lock.is_locked() {
			tokio::select! {
				_ = tokio::time::sleep(poll) => {}
				_ = cancel.cancelled() => return,
				_ = status_tick(&mut status) => shared.emit_status(),
			}
		}
	}
}

async fn status_tick(interval: &mut Option<tokio::time::Interval>) {
	match interval {
		Some(interval) => {
			interval.tick().await;
		}
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	async fn wait_for_grants(log: &Arc<Mutex<Vec<i32>>>, expected: usize) {
		tokio::time::timeout(Duration::from_secs(2), async {
			loop {
				if log.lock().unwrap().len() >= expected {
					return;
				}
				tokio::time::sleep(Duration::from_millis(2)).await;
			}
		})
		.await
		.expect("grants should be served");
	}

	// ── Priority ordering ──

	#[tokio::test]
	async fn priority_zero_preempts_queued_ones() {
		let queue = PriorityLockQueue::new(ExclusiveLock::new());
		let held = queue.acquire(0).await.expect("initial grant");

		// Submitted while the lock is held, so all three are queued together.
		let log = Arc::new(Mutex::new(Vec::new()));
		for priority in [1, 1, 0] {
			let log = Arc::clone(&log);
			queue.submit(priority, move || log.lock().unwrap().push(priority));
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(log.lock().unwrap().is_empty(), "no grant while the lock is held");

		drop(held);
		wait_for_grants(&log, 3).await;
		assert_eq!(*log.lock().unwrap(), vec![0, 1, 1]);
		queue.close().await;
	}

	#[tokio::test]
	async fn equal_priorities_serve_in_submission_order() {
		let queue = PriorityLockQueue::new(ExclusiveLock::new());
		let held = queue.acquire(0).await.expect("initial grant");

		let log = Arc::new(Mutex::new(Vec::new()));
		for seq in 0..5 {
			let log = Arc::clone(&log);
			queue.submit(7, move || log.lock().unwrap().push(seq));
		}

		drop(held);
		wait_for_grants(&log, 5).await;
		assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
		queue.close().await;
	}

	// ── Exclusion and liveness ──

	#[tokio::test]
	async fn holding_is_never_interrupted() {
		let queue = Arc::new(PriorityLockQueue::new(ExclusiveLock::new()));
		let held = queue.acquire(5).await.expect("low-priority grant");

		let contender = Arc::clone(&queue);
		let urgent = tokio::spawn(async move { contender.acquire(0).await });

		// Higher priority preempts the queue, not the holder.
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!urgent.is_finished());
		assert!(queue.lock().is_locked());

		drop(held);
		let permit = tokio::time::timeout(Duration::from_millis(500), urgent)
			.await
			.expect("urgent caller should be granted after release")
			.unwrap()
			.expect("queue is open");
		drop(permit);
		queue.close().await;
	}

	#[tokio::test]
	async fn panicking_grant_does_not_wedge_the_worker() {
		let queue = PriorityLockQueue::new(ExclusiveLock::new());
		queue.submit(0, || panic!("grant exploded"));

		let permit = tokio::time::timeout(Duration::from_millis(500), queue.acquire(1))
			.await
			.expect("worker should survive the panic")
			.expect("queue is open");
		drop(permit);
		queue.close().await;
	}

	#[tokio::test]
	async fn cancelled_acquire_before_grant_leaves_lock_free() {
		let queue = Arc::new(PriorityLockQueue::new(ExclusiveLock::new()));
		let held = queue.acquire(0).await.expect("initial grant");

		let contender = Arc::clone(&queue);
		let abandoned = tokio::spawn(async move {
			let _permit = contender.acquire(1).await;
			std::future::pending::<()>().await;
		});
		tokio::time::sleep(Duration::from_millis(10)).await;
		abandoned.abort();
		let _ = abandoned.await;

		// The abandoned entry's grant declines to acquire, so a later caller
		// still gets the lock.
		drop(held);
		let permit = tokio::time::timeout(Duration::from_millis(500), queue.acquire(2))
			.await
			.expect("lock should not leak to the aborted caller")
			.expect("queue is open");
		drop(permit);
		queue.close().await;
	}

	// ── Shutdown ──

	#[tokio::test]
	async fn close_abandons_queued_requests() {
		let queue = Arc::new(PriorityLockQueue::new(ExclusiveLock::new()));
		let held = queue.acquire(0).await.expect("initial grant");

		let invoked = Arc::new(Mutex::new(false));
		{
			let invoked = Arc::clone(&invoked);
			queue.submit(1, move || *invoked.lock().unwrap() = true);
		}
		let contender = Arc::clone(&queue);
		let waiter = tokio::spawn(async move { contender.acquire(1).await });
		tokio::time::sleep(Duration::from_millis(10)).await;

		queue.close().await;
		assert_eq!(waiter.await.unwrap().unwrap_err(), QueueClosedError);
		assert!(!*invoked.lock().unwrap(), "abandoned grant must not run");

		// The held grant still releases normally after close.
		drop(held);
		assert!(!queue.lock().is_locked());
	}

	#[tokio::test]
	async fn acquire_after_close_returns_closed() {
		let queue = PriorityLockQueue::new(ExclusiveLock::new());
		queue.close().await;
		assert_eq!(queue.acquire(0).await.unwrap_err(), QueueClosedError);
		// close is idempotent.
		queue.close().await;
	}

	// ── Model-based ordering stress (deterministic xorshift) ──

	/// Deterministic pseudo-random number generator for reproducible stress
	/// tests.
	struct Xorshift64(u64);

	impl Xorshift64 {
		fn next(&mut self) -> u64 {
			let mut x = self.0;
			x ^= x << 13;
			x ^= x >> 7;
			x ^= x << 17;
			self.0 = x;
			x
		}
	}

	#[tokio::test]
	async fn stress_service_order_matches_stable_sort() {
		const OPS: usize = 500;
		let queue = PriorityLockQueue::new(ExclusiveLock::new());
		let held = queue.acquire(0).await.expect("initial grant");

		let log = Arc::new(Mutex::new(Vec::new()));
		let mut rng = Xorshift64(0xDEAD_BEEF);
		let mut model = Vec::with_capacity(OPS);
		for seq in 0..OPS {
			let priority = (rng.next() % 5) as i32;
			model.push((priority, seq));
			let log = Arc::clone(&log);
			queue.submit(priority, move || log.lock().unwrap().push((priority, seq)));
		}
		// Grants must come out in stable (priority, submission) order.
		model.sort_by_key(|&(priority, seq)| (priority, seq));

		drop(held);
		tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				if log.lock().unwrap().len() == OPS {
					return;
				}
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.expect("all grants should be served");
		assert_eq!(*log.lock().unwrap(), model);
		queue.close().await;
	}
}
