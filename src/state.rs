//! Internal suspension and resumption primitives.
//!
//! A racer that loses to an in-flight initializer registers a [`Waiter`] and
//! blocks on it. Threads park through `parking_lot_core`, keyed on the address
//! of their own [`Wakeup`] cell; tokio tasks await a oneshot channel. The
//! winner consumes each waiter exactly once via [`Waiter::resume`].

#[cfg(feature = "async-tokio")]
use core::future::Future;
#[cfg(feature = "async-tokio")]
use core::sync::atomic::AtomicU64;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

/// Identity of whoever started an initialization, used for reentrancy checks.
///
/// A blocking caller is identified by its thread. An async caller gets a fresh
/// token per call, and the winner's initializer runs inside a task-local scope
/// carrying that token, so only calls made from within the initializer's own
/// call stack inherit it. Two futures for the same flag joined in one task are
/// therefore distinct initiators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Initiator {
   Thread(ThreadId),
   #[cfg(feature = "async-tokio")]
   Scope(u64),
}

#[cfg(feature = "async-tokio")]
tokio::task_local! {
   static SCOPE: Initiator;
}

impl Initiator {
   /// Identity for a blocking call: the enclosing initializer scope if there
   /// is one, else the current thread.
   #[inline]
   pub(crate) fn current() -> Self {
      Self::enclosing().unwrap_or_else(|| Self::Thread(thread::current().id()))
   }

   #[cfg(feature = "async-tokio")]
   #[inline]
   fn enclosing() -> Option<Self> {
      SCOPE.try_with(|scope| *scope).ok()
   }

   #[cfg(not(feature = "async-tokio"))]
   #[inline]
   fn enclosing() -> Option<Self> {
      None
   }
}

#[cfg(feature = "async-tokio")]
impl Initiator {
   /// Identity for an async call: the enclosing initializer scope if there is
   /// one, else a token nobody else holds.
   pub(crate) fn for_call() -> Self {
      static NEXT: AtomicU64 = AtomicU64::new(1);
      Self::enclosing().unwrap_or_else(|| Self::Scope(NEXT.fetch_add(1, Ordering::Relaxed)))
   }

   /// Runs `fut` with `self` as the enclosing initiator.
   pub(crate) async fn scope<Fut: Future>(self, fut: Fut) -> Fut::Output {
      SCOPE.scope(self, fut).await
   }
}

/// One-shot wake-up cell a parked thread waits on.
pub(crate) struct Wakeup(AtomicBool);

impl Wakeup {
   pub(crate) fn new() -> Arc<Self> {
      Arc::new(Self(AtomicBool::new(false)))
   }

   #[inline]
   fn key(&self) -> usize {
      self as *const Self as usize
   }

   #[inline]
   fn is_set(&self) -> bool {
      self.0.load(Ordering::Acquire)
   }

   /// Blocks the calling thread until [`Wakeup::wake`] has been called.
   pub(crate) fn wait(&self) {
      while !self.is_set() {
         // SAFETY: The key is the address of `self`, which stays alive (behind an
         // `Arc`) for as long as either side can touch it.
         unsafe {
            // park() re-checks the condition under the bucket lock before sleeping,
            // so a wake that lands in between is never lost.
            let _ = parking_lot_core::park(
               self.key(),
               || !self.is_set(),
               || {},
               |_, _| {},
               DEFAULT_PARK_TOKEN,
               None,
            );
         }
      }
   }

   fn wake(&self) {
      self.0.store(true, Ordering::Release);
      // SAFETY: See `wait`; the same key is used on both sides.
      unsafe {
         parking_lot_core::unpark_one(self.key(), |_| DEFAULT_UNPARK_TOKEN);
      }
   }
}

/// A suspended racer waiting for an initializer to finish.
pub(crate) enum Waiter {
   Thread(Arc<Wakeup>),
   #[cfg(feature = "async-tokio")]
   Task(tokio::sync::oneshot::Sender<()>),
}

impl Waiter {
   /// Hands control back to the waiter. The waiter may have given up (a dropped
   /// future), in which case this is a no-op.
   pub(crate) fn resume(self) {
      match self {
         Self::Thread(wakeup) => wakeup.wake(),
         #[cfg(feature = "async-tokio")]
         Self::Task(tx) => {
            let _ = tx.send(());
         }
      }
   }
}
