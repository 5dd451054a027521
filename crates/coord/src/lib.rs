//! Coordination kernel for serializing mutations to shared node state.
//!
//! Three primitives compose bottom-up:
//!
//! - [`AdmissionGate`] bounds how many callers may be active or waiting on a
//!   downstream resource, rejecting excess callers immediately instead of
//!   queueing them indefinitely.
//! - [`PriorityLockQueue`] serializes access to one exclusive resource,
//!   granting waiters in priority order (lower value first) rather than FIFO.
//! - [`ActionScope`] scopes side effects transactionally: each checkout owns
//!   a clone of the container, commits on success, discards on failure, and
//!   may defer one callback to scope close.
//!
//! A caller first passes the gate (reject fast under overload), opens a scope
//! for its logical operation, and performs checkouts serialized through the
//! lock queue, so exactly one logical writer is active system-wide while many
//! readers and queued writers coexist.

pub mod gate;
pub mod lock;
pub mod queue;
pub mod scope;


pub use gate::{AdmissionGate, GateFullError, GateGuard, GateSnapshot};
pub use lock::{ExclusiveLock, LockClosedError, SerialLock, SerialPermit};
pub use queue::{PriorityLockQueue, QueueClosedError, QueuePermit, QueueSpec};
pub use scope::{
	ActionScope, CallbackError, CallbackRegistrationError, Checkout, CheckoutError, CheckoutState, CloseError,
	NotReadyError, ScopeCallback, SideEffects,
};
