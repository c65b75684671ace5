//! Run-once latches for lazily-initialized globals.
//!
//! Each lazily-initialized global owns a [`OnceFlag`]. Code reading the
//! global checks the flag first (a single atomic load) and only on a miss
//! calls [`OnceContext::execute`], which guarantees that the initializer runs
//! exactly once even when many threads or tasks race on the first access.
//!
//! Two strategies sit behind the context, chosen once from the build's
//! [`Capabilities`]:
//!
//! - [`LocalOnceExecutor`]: a spinlock-guarded registry of in-flight
//!   initializations. Losers suspend (park the thread, or await in a tokio
//!   task) and are resumed in FIFO order when the winner finishes. An
//!   initializer that depends on itself is reported as
//!   [`OnceError::Reentrant`] instead of deadlocking.
//! - [`SharedOnceExecutor`]: a slot table in a [`SharedMemoryRegion`] with an
//!   `idle -> running -> done` protocol, for separately loaded images (or
//!   processes) that share neither a registry nor a scheduler. Losers poll.
//!
//! If a flag is still unset once the protocol finishes, the global would be
//! read uninitialized; the process is terminated instead.
//!
//! # Examples
//!
//! ```rust
//! use once_latch::{FlagId, LazyGlobal, OnceContext, OnceFlag};
//!
//! static GREETING: LazyGlobal<String> = LazyGlobal::new(FlagId::new(0));
//! assert_eq!(GREETING.get_or_init(|| "hello".to_string()), "hello");
//!
//! let context = OnceContext::local();
//! let flag = OnceFlag::new(FlagId::new(1));
//! let mut runs = 0;
//! context.execute(&flag, || runs += 1).unwrap();
//! context.execute(&flag, || runs += 1).unwrap();
//! assert_eq!(runs, 1);
//! ```

/// Build capability flags.
mod caps;

/// Runtime configuration.
mod config;

/// Entry point choosing between the local and shared strategy.
mod context;

/// Error types and the fatal-abort path.
mod error;

/// Per-global completion flags.
mod flag;

/// Lazily-initialized global values.
mod lazy;

/// In-process once-initialization.
mod local;

/// Named shared-memory regions.
mod region;

/// Cross-image once-initialization.
mod shared;

/// Internal suspension primitives.
mod state;

pub use caps::Capabilities;
pub use config::{
   OnceConfig, DEFAULT_POLL_SPINS, DEFAULT_REGION_TAG, DEFAULT_SLOT_COUNT, ENV_POLL_SPINS,
   ENV_REGION_TAG, ENV_SLOTS,
};
pub use context::OnceContext;
pub use error::fatal::FATAL_MESSAGE;
pub use error::{OnceError, RegionError, RegionResult};
pub use flag::{ensure_done, FlagId, OnceFlag};
pub use lazy::LazyGlobal;
pub use local::LocalOnceExecutor;
pub use region::{cleanup_stale_regions, SharedMemoryRegion};
pub use shared::{SharedOnceExecutor, SLOT_DONE, SLOT_IDLE, SLOT_RUNNING};
