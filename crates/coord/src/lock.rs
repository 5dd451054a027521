use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Error returned when acquiring through a shut-down serial lock provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("serial lock provider is closed")]
pub struct LockClosedError;

/// The primitive exclusive lock: the single source of mutual exclusion for
/// shared node state.
///
/// Re-entrant-unsafe. `acquire` and `release` are split so the
/// [`PriorityLockQueue`](crate::queue::PriorityLockQueue) worker can acquire
/// on a grantee's behalf while the grantee releases once its protected
/// section finishes.
#[derive(Debug)]
pub struct ExclusiveLock {
	permits: Semaphore,
}

impl ExclusiveLock {
	/// Creates an unlocked exclusive lock.
	pub fn new() -> Self {
		Self { permits: Semaphore::new(1) }
	}

	/// Acquires the lock directly, suspending until it is free.
	pub async fn acquire(&self) {
		let permit = self.permits.acquire().await.expect("exclusive lock semaphore is never closed");
		permit.forget();
	}

	/// Acquires the lock on behalf of a queue grant.
	///
	/// Invariant: only called while the lock is unlocked — the queue worker
	/// polls for release before issuing the next grant.
	pub(crate) fn acquire_granted(&self) {
		match self.permits.try_acquire() {
			Ok(permit) => permit.forget(),
			Err(_) => unreachable!("grant issued while the exclusive lock is held"),
		}
	}

	/// Releases the lock.
	///
	/// # Panics
	///
	/// Panics if the lock is not currently held.
	pub fn release(&self) {
		assert!(self.is_locked(), "release of an unlocked exclusive lock");
		self.permits.add_permits(1);
	}

	/// Returns whether the lock is currently held.
	pub fn is_locked(&self) -> bool {
		self.permits.available_permits() == 0
	}
}

impl Default for ExclusiveLock {
	fn default() -> Self {
		Self::new()
	}
}

/// Scoped grant of serialized exclusive access. Releases on drop, so
/// cancellation and error returns run the same cleanup as normal exits.
pub struct SerialPermit {
	_grant: Box<dyn Send>,
}

impl SerialPermit {
	pub(crate) fn new(grant: impl Send + 'static) -> Self {
		Self { _grant: Box::new(grant) }
	}
}

impl std::fmt::Debug for SerialPermit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SerialPermit").finish_non_exhaustive()
	}
}

/// Async mutual-exclusion seam consumed by
/// [`ActionScope`](crate::scope::ActionScope).
///
/// Production scopes are serialized through the priority lock queue; tests
/// may supply any exclusive provider.
#[async_trait]
pub trait SerialLock: Send + Sync {
	/// Suspends until exclusive access is granted.
	async fn acquire(&self) -> Result<SerialPermit, LockClosedError>;
}
