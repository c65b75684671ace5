//! The entry point used by lazily-initialized globals.
//!
//! A [`OnceContext`] decides once, when it is built, whether initialization
//! is coordinated only inside this process or across images through shared
//! memory. Every later call dispatches on that cached decision.

#[cfg(feature = "async-tokio")]
use std::future::Future;
use std::sync::OnceLock;

use crate::caps::Capabilities;
use crate::config::OnceConfig;
use crate::error::{fatal, OnceError, RegionResult};
use crate::flag::{FlagId, OnceFlag};
use crate::local::LocalOnceExecutor;
use crate::shared::SharedOnceExecutor;

/// Strategy fixed at construction.
enum Strategy {
   Local(LocalOnceExecutor),
   Shared(SharedOnceExecutor),
}

/// Process-wide once-initialization context.
pub struct OnceContext {
   capabilities: Capabilities,
   strategy: Strategy,
}

impl OnceContext {
   /// A context that only coordinates threads and tasks of this process.
   #[must_use]
   pub const fn local() -> Self {
      Self {
         capabilities: Capabilities::BUILD,
         strategy: Strategy::Local(LocalOnceExecutor::new()),
      }
   }

   /// Builds a context for `capabilities`.
   ///
   /// With [`Capabilities::CROSS_IMAGE`] this joins (or creates) the shared
   /// slot table described by `config`.
   ///
   /// # Errors
   ///
   /// Returns the region error if the shared table cannot be set up; callers
   /// may fall back to [`OnceContext::local`] or abort startup.
   pub fn new(capabilities: Capabilities, config: &OnceConfig) -> RegionResult<Self> {
      let strategy = if capabilities.cross_image() {
         Strategy::Shared(SharedOnceExecutor::attach(config)?)
      } else {
         Strategy::Local(LocalOnceExecutor::new())
      };
      log::debug!(
         "[once] context ready: {:?}, shared={}",
         capabilities,
         matches!(strategy, Strategy::Shared(_))
      );
      Ok(Self {
         capabilities,
         strategy,
      })
   }

   /// The context used by globals declared without an explicit one.
   ///
   /// Built on first use from [`Capabilities::BUILD`] and
   /// [`OnceConfig::from_env`]. A build that claims cross-image support but
   /// cannot set up the shared table cannot guarantee run-once semantics, so
   /// that failure terminates the process.
   pub fn global() -> &'static Self {
      static GLOBAL: OnceLock<OnceContext> = OnceLock::new();
      GLOBAL.get_or_init(|| {
         match Self::new(Capabilities::BUILD, &OnceConfig::from_env()) {
            Ok(context) => context,
            Err(e) => fatal::abort(&format!("cannot set up shared once table: {e}")),
         }
      })
   }

   /// Capabilities this context was built with.
   #[inline]
   pub fn capabilities(&self) -> Capabilities {
      self.capabilities
   }

   /// Whether calls go through the shared slot table.
   #[inline]
   pub fn is_shared(&self) -> bool {
      matches!(self.strategy, Strategy::Shared(_))
   }

   /// The shared executor, if this context uses one.
   pub fn shared(&self) -> Option<&SharedOnceExecutor> {
      match &self.strategy {
         Strategy::Shared(shared) => Some(shared),
         Strategy::Local(_) => None,
      }
   }

   /// Ensures `f` has run exactly once for `flag` before returning.
   ///
   /// The lock-free fast path is a single load of the flag. On return the
   /// flag is set, except when [`OnceError::Reentrant`] is reported.
   #[inline]
   pub fn execute<F>(&self, flag: &OnceFlag, f: F) -> Result<(), OnceError>
   where
      F: FnOnce(),
   {
      if flag.is_done() {
         return Ok(());
      }
      match &self.strategy {
         Strategy::Local(local) => local.execute(flag, f),
         Strategy::Shared(shared) => shared.execute(flag, f),
      }
   }

   /// Async flavour of [`execute`](Self::execute) for tokio tasks.
   #[cfg(feature = "async-tokio")]
   pub async fn execute_async<F, Fut>(&self, flag: &OnceFlag, f: F) -> Result<(), OnceError>
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = ()>,
   {
      if flag.is_done() {
         return Ok(());
      }
      match &self.strategy {
         Strategy::Local(local) => local.execute_async(flag, f).await,
         Strategy::Shared(shared) => shared.execute_async(flag, f).await,
      }
   }

   /// Racers currently suspended on `id`. Always zero on the shared path,
   /// where losers poll instead of queueing.
   pub fn pending_waiters(&self, id: FlagId) -> usize {
      match &self.strategy {
         Strategy::Local(local) => local.pending_waiters(id),
         Strategy::Shared(_) => 0,
      }
   }

   /// Initializations currently running in this process (local path only).
   pub fn in_flight(&self) -> usize {
      match &self.strategy {
         Strategy::Local(local) => local.in_flight(),
         Strategy::Shared(_) => 0,
      }
   }
}

impl Default for OnceContext {
   fn default() -> Self {
      Self::local()
   }
}
