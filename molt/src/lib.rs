//! Molt: user-space RCU for lock-free data structures
//!
//! Molt implements a two-phase, quiescent-state based reclamation scheme.
//! Readers bracket their accesses in cheap critical sections; writers
//! unlink objects and hand them to [`finalize`], which defers destruction
//! until every reader that could still observe the object has moved on.
//!
//! # Key pieces
//!
//! - **Critical sections**: [`enter_cs`] / [`exit_cs`] / [`in_cs`], or the
//!   RAII [`CsGuard`]. Re-entrant; a per-thread counter tracks nesting.
//! - **Grace periods**: [`sync`] blocks until every registered reader has
//!   been observed quiescent or in the new phase at least once.
//! - **Deferred destruction**: objects embed a [`FinNode`] header and are
//!   queued on a per-thread list; the list is drained after a grace period
//!   once it crosses a threshold.
//! - **Slot encoding**: [`SlotValue`] packs container payloads into single
//!   machine words, either inline (small integrals) or behind a heap
//!   wrapper, with the `FREE` / `DELT` / `XBIT` sentinel scheme the
//!   containers build their state machines on.
//!
//! # Example
//!
//! ```rust,ignore
//! use molt::{CsGuard, finalize};
//!
//! let _g = CsGuard::new();
//! // Pointers loaded here stay valid until the guard drops.
//! ```

#![warn(missing_docs)]

mod guard;
mod lock;
mod pair;
mod reclaim;
mod retired;
mod slot;

pub use guard::CsGuard;
pub use lock::LwLock;
pub use pair::{WordPair, HAS_DCAS};
pub use reclaim::{
    atfork, enter_cs, exit_cs, finalize, flush_finalizers, in_cs, sync, xrand, AtFork,
};
pub use retired::{destroy_now, drop_boxed, DestroyFn, FinNode};
pub use slot::{SlotValue, SlotWrapper};

/// Library version as a `(major, minor)` pair.
pub fn library_version() -> (u32, u32) {
    (0, 1)
}
