//! Per-global completion flags.
//!
//! Every lazily-initialized global owns exactly one [`OnceFlag`]. The flag is
//! identified by a [`FlagId`], a small integer assigned when the global is
//! declared. Both the in-process registry and the shared-memory slot table are
//! keyed by that handle rather than by the flag's address, so two images that
//! map the flag at different addresses still agree on which slot it owns.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::fatal;

/// Stable handle naming one lazily-initialized global.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FlagId(u32);

impl FlagId {
   /// Creates a handle from its raw index.
   #[inline]
   #[must_use]
   pub const fn new(index: u32) -> Self {
      Self(index)
   }

   /// Returns the raw index of this handle.
   #[inline]
   #[must_use]
   pub const fn index(self) -> u32 {
      self.0
   }
}

impl fmt::Display for FlagId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

/// Boolean cell recording whether a global's initializer has completed.
///
/// The only transition is `false -> true`, performed by the executor that
/// won the race for this flag. Reading it never blocks.
pub struct OnceFlag {
   id: FlagId,
   done: AtomicBool,
}

impl OnceFlag {
   /// Creates an uninitialized flag for the global named by `id`.
   #[inline]
   #[must_use]
   pub const fn new(id: FlagId) -> Self {
      Self {
         id,
         done: AtomicBool::new(false),
      }
   }

   /// Creates a flag that is already set.
   #[inline]
   #[must_use]
   pub const fn done(id: FlagId) -> Self {
      Self {
         id,
         done: AtomicBool::new(true),
      }
   }

   /// Handle of the global this flag belongs to.
   #[inline]
   pub const fn id(&self) -> FlagId {
      self.id
   }

   /// Fast-path check. `Acquire` pairs with the `Release` store in [`OnceFlag::mark_done`]
   /// so a `true` result also publishes the initializer's writes.
   #[inline]
   pub fn is_done(&self) -> bool {
      self.done.load(Ordering::Acquire)
   }

   /// Sets the flag. Only the executor holding the claim for this flag calls this.
   #[inline]
   pub(crate) fn mark_done(&self) {
      self.done.store(true, Ordering::Release);
   }
}

impl fmt::Debug for OnceFlag {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("OnceFlag")
         .field("id", &self.id)
         .field("done", &self.is_done())
         .finish()
   }
}

/// Post-condition shared by every initialization path: once control returns
/// to the caller the flag must be set. Anything else means the global would be
/// read uninitialized, so the process is terminated.
#[inline]
pub fn ensure_done(flag: &OnceFlag) {
   if !flag.is_done() {
      fatal::abort(&format!("flag {} still unset after initialization", flag.id));
   }
}
