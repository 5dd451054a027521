use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::lock::{LockClosedError, SerialLock, SerialPermit};

/// Capability bound for a scope's mutable payload: cloneable for checkout
/// value semantics, serializable so collaborators can persist it elsewhere.
pub trait SideEffects: Clone + Send + Serialize + DeserializeOwned + 'static {
	/// Serializes the container.
	fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
		postcard::to_allocvec(self)
	}

	/// Rebuilds a container from [`SideEffects::to_bytes`] output.
	fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
		postcard::from_bytes(bytes)
	}
}

impl<T> SideEffects for T where T: Clone + Send + Serialize + DeserializeOwned + 'static {}

/// Error returned when registering a callback from inside a running callback.
///
/// A programmer error: it indicates an invariant violation in caller code and
/// is surfaced immediately, never swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("callback cannot be registered from inside another callback")]
pub struct CallbackRegistrationError;

/// Error returned when reading scope results too early or after a failed
/// close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotReadyError {
	/// The scope has not closed yet.
	#[error("action scope is still open")]
	StillOpen,
	/// The scope closed without committing; there is no readable result.
	#[error("action scope closed without committing")]
	Failed,
}

/// Error returned when entering a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CheckoutError {
	/// The scope has already closed.
	#[error("action scope is already closed")]
	AlreadyClosed,
	/// Another checkout is active; the serial provider is not exclusive.
	#[error("a checkout is already active on this scope")]
	CheckoutActive,
	/// The serial lock provider has shut down.
	#[error(transparent)]
	Lock(#[from] LockClosedError),
}

/// Error type carried by scope callbacks. Caller business-logic errors
/// propagate through close unchanged.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by [`ActionScope::close`].
#[derive(Debug, Error)]
pub enum CloseError {
	/// The scope was already closed (every repeat close reports this).
	#[error("action scope is already closed")]
	AlreadyClosed,
	/// The close-time checkout could not be entered.
	#[error(transparent)]
	Checkout(#[from] CheckoutError),
	/// The stored callback failed; no side effects were committed.
	#[error("scope callback failed: {0}")]
	Callback(#[source] CallbackError),
}

/// Deferred callback held in a checkout's single slot.
///
/// Invoked at most once, at scope close, with the close-time checkout state.
pub type ScopeCallback<S, C> = Arc<
	dyn for<'a> Fn(&'a mut CheckoutState<S, C>) -> Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send + 'a>>
		+ Send
		+ Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopePhase {
	Open,
	InCheckout,
	Closed,
}

struct ScopeInner<S: SideEffects, C> {
	side_effects: S,
	callback: Option<ScopeCallback<S, C>>,
	phase: ScopePhase,
}

/// Working state owned by the active checkout: a clone of the scope's
/// committed container plus the callback slot.
pub struct CheckoutState<S: SideEffects, C> {
	side_effects: S,
	callback: Option<ScopeCallback<S, C>>,
	callbacks_allowed: bool,
	config: Option<Arc<C>>,
}

impl<S: SideEffects, C> CheckoutState<S, C> {
	/// The working side-effect container.
	pub fn side_effects(&self) -> &S {
		&self.side_effects
	}

	/// Mutable access to the working container. Mutations become visible to
	/// the parent only on [`Checkout::commit`].
	pub fn side_effects_mut(&mut self) -> &mut S {
		&mut self.side_effects
	}

	/// The scope's immutable config, when one was supplied.
	pub fn config(&self) -> Option<&C> {
		self.config.as_deref()
	}

	/// Registers the deferred callback.
	///
	/// One slot only: re-registration overwrites the previously stored
	/// callback. Fails while a callback is itself executing (the close-time
	/// checkout).
	pub fn add_callback(&mut self, callback: ScopeCallback<S, C>) -> Result<(), CallbackRegistrationError> {
		if !self.callbacks_allowed {
			return Err(CallbackRegistrationError);
		}
		self.callback = Some(callback);
		Ok(())
	}
}

/// Top-level transactional unit owning a side-effect container and serving
/// checkouts of it.
///
/// Exactly one checkout is active at a time; the supplied [`SerialLock`]
/// (typically the priority lock queue) serializes checkouts across all
/// concurrent scopes sharing it, so only one logical writer is ever active
/// system-wide. Mutations commit checkout-by-checkout and the stored callback
/// runs at close; a failed checkout discards its clone and leaves the
/// last-committed state intact.
pub struct ActionScope<S: SideEffects, C = ()> {
	serial: Arc<dyn SerialLock>,
	config: Option<Arc<C>>,
	inner: Mutex<ScopeInner<S, C>>,
	close_started: AtomicBool,
	final_effects: OnceLock<S>,
}

impl<S: SideEffects, C> ActionScope<S, C> {
	/// Creates an open scope over `initial`.
	///
	/// `config` is optional and immutable for the scope's life; checkouts
	/// that don't need one see `None` rather than a sentinel value.
	pub fn new(initial: S, config: Option<C>, serial: Arc<dyn SerialLock>) -> Self {
		Self {
			serial,
			config: config.map(Arc::new),
			inner: Mutex::new(ScopeInner {
				side_effects: initial,
				callback: None,
				phase: ScopePhase::Open,
			}),
			close_started: AtomicBool::new(false),
			final_effects: OnceLock::new(),
		}
	}

	fn lock_inner(&self) -> MutexGuard<'_, ScopeInner<S, C>> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Enters a checkout: acquires the serial permit and clones the committed
	/// container into an exclusively owned working copy.
	///
	/// The checkout commits explicitly via [`Checkout::commit`]; dropping it
	/// on any other path — error return, panic, cancellation — discards the
	/// clone and leaves the parent untouched.
	pub async fn checkout(&self) -> Result<Checkout<'_, S, C>, CheckoutError> {
		self.checkout_with(true).await
	}

	async fn checkout_with(&self, callbacks_allowed: bool) -> Result<Checkout<'_, S, C>, CheckoutError> {
		let permit = self.serial.acquire().await?;
		// Only the close-time checkout (callbacks disallowed) may enter once
		// close has started.
		if callbacks_allowed && self.close_started.load(Ordering::Acquire) {
			return Err(CheckoutError::AlreadyClosed);
		}
		let state = {
			let mut inner = self.lock_inner();
			match inner.phase {
				ScopePhase::Closed => return Err(CheckoutError::AlreadyClosed),
				ScopePhase::InCheckout => return Err(CheckoutError::CheckoutActive),
				ScopePhase::Open => {}
			}
			inner.phase = ScopePhase::InCheckout;
			CheckoutState {
				side_effects: inner.side_effects.clone(),
				callback: inner.callback.clone(),
				callbacks_allowed,
				config: self.config.clone(),
			}
		};
		tracing::trace!(callbacks_allowed, "scope.checkout");
		Ok(Checkout {
			scope: self,
			state: Some(state),
			_permit: permit,
		})
	}

	/// Closes the scope: one final checkout with callback registration
	/// disabled, the stored callback (if any), then the freeze of the final
	/// container.
	///
	/// If the final checkout or the callback fails the scope is failed: the
	/// error propagates, no side effects are committed, and
	/// [`Self::side_effects`] reports [`NotReadyError::Failed`]. A repeat
	/// close always returns [`CloseError::AlreadyClosed`].
	pub async fn close(&self) -> Result<(), CloseError> {
		if self.close_started.swap(true, Ordering::AcqRel) {
			return Err(CloseError::AlreadyClosed);
		}

		let result = self.run_close().await;
		self.lock_inner().phase = ScopePhase::Closed;
		match result {
			Ok(final_state) => {
				let _ = self.final_effects.set(final_state);
				tracing::debug!("scope.closed");
				Ok(())
			}
			Err(err) => {
				tracing::debug!(error = %err, "scope.close_failed");
				Err(err)
			}
		}
	}

	async fn run_close(&self) -> Result<S, CloseError> {
		let mut checkout = self.checkout_with(false).await?;
		let callback = checkout.state_mut().callback.take();
		if let Some(callback) = callback {
			// A failing callback drops the checkout, discarding its clone.
			callback(checkout.state_mut()).await.map_err(CloseError::Callback)?;
		}
		let Some(state) = checkout.state.take() else {
			unreachable!("checkout state is present until taken here")
		};
		Ok(state.side_effects)
	}

	/// The frozen side-effect container, readable only after a committed
	/// close.
	pub fn side_effects(&self) -> Result<&S, NotReadyError> {
		if let Some(side_effects) = self.final_effects.get() {
			return Ok(side_effects);
		}
		match self.lock_inner().phase {
			ScopePhase::Closed => Err(NotReadyError::Failed),
			_ => Err(NotReadyError::StillOpen),
		}
	}
}

impl<S: SideEffects + std::fmt::Debug, C> std::fmt::Debug for ActionScope<S, C> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ActionScope")
			.field("phase", &self.lock_inner().phase)
			.field("final_effects", &self.final_effects.get())
			.finish_non_exhaustive()
	}
}

/// One exclusive, cloned working copy of a scope's container.
///
/// Holds the serial permit for its whole lifetime, so no other checkout in
/// the system is active concurrently.
pub struct Checkout<'scope, S: SideEffects, C> {
	scope: &'scope ActionScope<S, C>,
	state: Option<CheckoutState<S, C>>,
	_permit: SerialPermit,
}

impl<S: SideEffects, C> Checkout<'_, S, C> {
	fn state_mut(&mut self) -> &mut CheckoutState<S, C> {
		match self.state.as_mut() {
			Some(state) => state,
			None => unreachable!("checkout state is taken only on commit"),
		}
	}

	/// Commits the working container and callback slot back to the scope,
	/// making the mutations visible to the next checkout.
	pub fn commit(mut self) {
		let Some(state) = self.state.take() else { return };
		let mut inner = self.scope.lock_inner();
		inner.side_effects = state.side_effects;
		inner.callback = state.callback;
		inner.phase = ScopePhase::Open;
		drop(inner);
		tracing::trace!("scope.commit");
	}
}

impl<S: SideEffects, C> std::fmt::Debug for Checkout<'_, S, C> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Checkout").finish_non_exhaustive()
	}
}

impl<S: SideEffects, C> std::ops::Deref for Checkout<'_, S, C> {
	type Target = CheckoutState<S, C>;

	fn deref(&self) -> &Self::Target {
		match self.state.as_ref() {
			Some(state) => state,
			None => unreachable!("checkout state is taken only on commit"),
		}
	}
}

impl<S: SideEffects, C> std::ops::DerefMut for Checkout<'_, S, C> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.state_mut()
	}
}

impl<S: SideEffects, C> Drop for Checkout<'_, S, C> {
	fn drop(&mut self) {
		// Reached with state still present only when the checkout was not
		// committed: discard the clone, parent untouched.
		if self.state.take().is_some() {
			let mut inner = self.scope.lock_inner();
			if inner.phase == ScopePhase::InCheckout {
				inner.phase = ScopePhase::Open;
			}
			drop(inner);
			tracing::trace!("scope.discard");
		}
	}
}
