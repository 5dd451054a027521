use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Error returned when the gate has no free slot.
///
/// Admission is refused immediately, without blocking; the caller must back
/// off or drop the request. The gate never retries on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("admission gate is full")]
pub struct GateFullError;

/// Point-in-time gate diagnostics.
///
/// Values are sampled independently and may be mutually inconsistent under
/// concurrent traffic; observability only, never used for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
	/// Free slots (admitted callers may still be waiting or active).
	pub available: usize,
	/// Callers currently holding the inner resource.
	pub active: usize,
	/// Admitted callers queued behind the active ones.
	pub waiting: usize,
	/// Configured active capacity.
	pub active_limit: usize,
	/// Configured waiting capacity.
	pub waiting_limit: usize,
}

/// Bounded admission limiter that rejects rather than queues beyond capacity.
///
/// At most `active_limit` callers hold the inner resource concurrently and at
/// most `waiting_limit` more sit queued behind them. A caller beyond that
/// fails with [`GateFullError`] without suspending — the property that
/// distinguishes this from an ordinary semaphore, which would block.
///
/// Each admitted caller owns exactly one slot for the lifetime of its
/// [`GateGuard`]; the slot is restored unconditionally on drop, so error and
/// cancellation paths cannot leak capacity.
#[derive(Debug)]
pub struct AdmissionGate {
	inner: Arc<Semaphore>,
	available: AtomicUsize,
	active_limit: usize,
	waiting_limit: usize,
	holders: Mutex<HashMap<&'static str, usize>>,
}

impl AdmissionGate {
	/// Creates a gate admitting `active_limit` concurrent holders plus
	/// `waiting_limit` queued callers.
	///
	/// # Panics
	///
	/// Panics if `active_limit` is zero. A zero `waiting_limit` is valid and
	/// degenerates to try-acquire semantics on the inner resource.
	pub fn new(active_limit: usize, waiting_limit: usize) -> Self {
		assert!(active_limit > 0, "gate active limit must be > 0");
		Self {
			inner: Arc::new(Semaphore::new(active_limit)),
			available: AtomicUsize::new(active_limit + waiting_limit),
			active_limit,
			waiting_limit,
			holders: Mutex::new(HashMap::new()),
		}
	}

	/// Admits the caller, suspending only while the inner resource is at
	/// capacity.
	///
	/// Fails immediately with [`GateFullError`] when no slot is free. Errors
	/// raised by the guarded body propagate to the caller after the slot is
	/// released by the guard's drop.
	pub async fn acquire(&self) -> Result<GateGuard<'_>, GateFullError> {
		self.admit(None).await
	}

	/// [`Self::acquire`] with a logical caller label.
	///
	/// Re-entrant acquisition under the same label is permitted but logged as
	/// a diagnostic anomaly.
	pub async fn acquire_labeled(&self, label: &'static str) -> Result<GateGuard<'_>, GateFullError> {
		self.admit(Some(label)).await
	}

	async fn admit(&self, label: Option<&'static str>) -> Result<GateGuard<'_>, GateFullError> {
		// checked_sub keeps the counter non-negative under concurrent
		// acquirers; the check and the decrement are one atomic step.
		if self
			.available
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
			.is_err()
		{
			tracing::trace!(label = label.unwrap_or("-"), "gate.reject");
			return Err(GateFullError);
		}

		// The reservation restores the slot on drop, covering cancellation
		// while parked on the inner semaphore.
		let slot = SlotReservation { gate: self, label };
		if let Some(label) = label {
			self.note_admission(label);
		}

		let permit = Arc::clone(&self.inner)
			.acquire_owned()
			.await
			.expect("gate semaphore is never closed");
		tracing::trace!(
			label = label.unwrap_or("-"),
			available = self.available.load(Ordering::Acquire),
			"gate.admit"
		);
		Ok(GateGuard { _permit: permit, _slot: slot })
	}

	fn note_admission(&self, label: &'static str) {
		let mut holders = self.holders.lock().unwrap_or_else(PoisonError::into_inner);
		let depth = holders.entry(label).or_insert(0);
		if *depth > 0 {
			tracing::warn!(label, depth = *depth, "gate.reentrant_acquire");
		}
		*depth += 1;
	}

	fn note_release(&self, label: &'static str) {
		let mut holders = self.holders.lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(depth) = holders.get_mut(label) {
			*depth -= 1;
			if *depth == 0 {
				holders.remove(label);
			}
		}
	}

	/// Samples current gate state for diagnostics.
	pub fn snapshot(&self) -> GateSnapshot {
		let available = self.available.load(Ordering::Acquire);
		let active = self.active_limit - self.inner.available_permits();
		let outstanding = (self.active_limit + self.waiting_limit).saturating_sub(available);
		GateSnapshot {
			available,
			active,
			waiting: outstanding.saturating_sub(active),
			active_limit: self.active_limit,
			waiting_limit: self.waiting_limit,
		}
	}
}

/// One admitted caller's slot. Restores `available` unconditionally on drop.
struct SlotReservation<'g> {
	gate: &'g AdmissionGate,
	label: Option<&'static str>,
}

impl Drop for SlotReservation<'_> {
	fn drop(&mut self) {
		if let Some(label) = self.label {
			self.gate.note_release(label);
		}
		self.gate.available.fetch_add(1, Ordering::AcqRel);
		tracing::trace!(label = self.label.unwrap_or("-"), "gate.release");
	}
}

/// Scoped admission through an [`AdmissionGate`].
///
/// Dropping the guard releases the inner resource and the admission slot, on
/// success, failure, and cancellation alike.
pub struct GateGuard<'g> {
	_permit: OwnedSemaphorePermit,
	_slot: SlotReservation<'g>,
}

impl std::fmt::Debug for GateGuard<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("GateGuard").finish_non_exhaustive()
	}
}
