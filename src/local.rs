//! In-process once-initialization.
//!
//! A spinlock-guarded registry holds one [`Operation`] per flag that is being
//! initialized right now. The first racer to reach the lock inserts the
//! operation and runs the initializer outside the lock; later racers append
//! themselves to the operation's FIFO waiter list and suspend until the
//! winner finishes. The lock is held only for O(1) bookkeeping, never across
//! the initializer or a suspension.

use std::collections::VecDeque;
#[cfg(feature = "async-tokio")]
use std::future::Future;
use std::sync::Arc;

use spin::Mutex;

use crate::error::{fatal, OnceError};
use crate::flag::{ensure_done, FlagId, OnceFlag};
use crate::state::{Initiator, Waiter, Wakeup};

/// Bookkeeping for one in-flight initialization.
struct Operation {
   flag: FlagId,
   initiator: Initiator,
   waiters: VecDeque<Waiter>,
}

/// Outcome of the locked registry check.
enum Entry<'a> {
   /// Somebody finished between the fast-path check and the lock.
   Done,
   /// Registered as a waiter; suspend now.
   Waiting,
   /// Won the race; run the initializer, then drop the completion.
   Won(Completion<'a>),
}

/// Registry of in-flight initializations for one process.
pub struct LocalOnceExecutor {
   registry: Mutex<Vec<Operation>>,
}

impl LocalOnceExecutor {
   /// Creates an executor with an empty registry.
   #[must_use]
   pub const fn new() -> Self {
      Self {
         registry: Mutex::new(Vec::new()),
      }
   }

   /// Runs `f` if `flag` is unset, exactly once across all racing threads.
   ///
   /// Threads that lose the race park until the winner's initializer returns
   /// (or unwinds). Returns [`OnceError::Reentrant`] if `f` itself ends up
   /// calling back into this flag.
   ///
   /// Inside an async runtime prefer [`execute_async`](Self::execute_async);
   /// this call blocks the worker thread while waiting.
   pub fn execute<F>(&self, flag: &OnceFlag, f: F) -> Result<(), OnceError>
   where
      F: FnOnce(),
   {
      if flag.is_done() {
         return Ok(());
      }
      let mut wakeup = None;
      let entry = self.enter(flag, Initiator::current(), || {
         let cell = Wakeup::new();
         wakeup = Some(Arc::clone(&cell));
         Waiter::Thread(cell)
      })?;
      match entry {
         Entry::Done => {}
         Entry::Waiting => {
            if let Some(wakeup) = wakeup {
               wakeup.wait();
            }
         }
         Entry::Won(completion) => {
            f();
            completion.finish();
         }
      }
      ensure_done(flag);
      Ok(())
   }

   /// Async flavour of [`execute`](Self::execute) for tokio tasks.
   ///
   /// Losing tasks are suspended on a oneshot channel and resumed in the order
   /// they registered. Reentrancy is tracked per call rather than per task:
   /// only calls made from inside the initializer itself are reentrant, so two
   /// futures for one flag polled by the same task simply race.
   ///
   /// Dropping the winner's future before the initializer completes counts as
   /// the initializer having raised: the flag is set and waiters are released.
   #[cfg(feature = "async-tokio")]
   pub async fn execute_async<F, Fut>(&self, flag: &OnceFlag, f: F) -> Result<(), OnceError>
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = ()>,
   {
      if flag.is_done() {
         return Ok(());
      }
      let initiator = Initiator::for_call();
      let mut resumed = None;
      let entry = self.enter(flag, initiator, || {
         let (tx, rx) = tokio::sync::oneshot::channel();
         resumed = Some(rx);
         Waiter::Task(tx)
      })?;
      match entry {
         Entry::Done => {}
         Entry::Waiting => {
            if let Some(rx) = resumed {
               // A closed channel can only mean the operation vanished; the
               // post-condition below turns that into an abort.
               let _ = rx.await;
            }
         }
         Entry::Won(completion) => {
            initiator.scope(async move { f().await }).await;
            completion.finish();
         }
      }
      ensure_done(flag);
      Ok(())
   }

   /// Number of racers currently suspended on `id`.
   pub fn pending_waiters(&self, id: FlagId) -> usize {
      self
         .registry
         .lock()
         .iter()
         .find(|op| op.flag == id)
         .map_or(0, |op| op.waiters.len())
   }

   /// Number of initializations currently running.
   pub fn in_flight(&self) -> usize {
      self.registry.lock().len()
   }

   /// The locked part of the protocol: re-check the flag, then either join an
   /// existing operation or start a new one.
   fn enter<'a>(
      &'a self,
      flag: &'a OnceFlag,
      initiator: Initiator,
      make_waiter: impl FnOnce() -> Waiter,
   ) -> Result<Entry<'a>, OnceError> {
      let mut registry = self.registry.lock();

      if flag.is_done() {
         return Ok(Entry::Done);
      }

      if let Some(op) = registry.iter_mut().find(|op| op.flag == flag.id()) {
         if op.initiator == initiator {
            drop(registry);
            log::debug!("[once] reentrant initialization of {}", flag.id());
            return Err(OnceError::Reentrant(flag.id()));
         }
         op.waiters.push_back(make_waiter());
         log::debug!(
            "[once] {:?} waits on {} ({} queued)",
            initiator,
            flag.id(),
            op.waiters.len()
         );
         return Ok(Entry::Waiting);
      }

      registry.push(Operation {
         flag: flag.id(),
         initiator,
         waiters: VecDeque::new(),
      });
      log::debug!("[once] {:?} initializes {}", initiator, flag.id());
      Ok(Entry::Won(Completion {
         executor: self,
         flag,
      }))
   }
}

impl Default for LocalOnceExecutor {
   fn default() -> Self {
      Self::new()
   }
}

/// Held by the winner while its initializer runs.
///
/// Dropping it (normally or during unwinding) sets the flag, retires the
/// operation and resumes every waiter in FIFO order.
struct Completion<'a> {
   executor: &'a LocalOnceExecutor,
   flag: &'a OnceFlag,
}

impl Completion<'_> {
   #[inline]
   fn finish(self) {
      drop(self);
   }
}

impl Drop for Completion<'_> {
   fn drop(&mut self) {
      let id = self.flag.id();
      let waiters = {
         let mut registry = self.executor.registry.lock();
         self.flag.mark_done();
         match registry.iter().position(|op| op.flag == id) {
            Some(index) => registry.swap_remove(index).waiters,
            None => fatal::abort("in-flight operation missing from registry"),
         }
      };
      if !waiters.is_empty() {
         log::debug!("[once] {} done, resuming {} waiter(s)", id, waiters.len());
      }
      for waiter in waiters {
         waiter.resume();
      }
   }
}
