//! Error types and the fatal-abort path.

use std::fmt;
use std::io;

use crate::flag::FlagId;

/// Reportable failures of `execute` and of lazy-global access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceError {
   /// The initializer of this flag transitively tried to initialize the same
   /// flag from its own call stack. The flag stays unset.
   Reentrant(FlagId),
   /// A lazy global was accessed through a different context than the one
   /// its initialization is bound to. Separate contexts do not exclude each
   /// other, so the access is refused.
   ForeignContext(FlagId),
}

impl fmt::Display for OnceError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Reentrant(id) => write!(
            f,
            "recursive initialization of lazy global {id}: its initializer depends on itself"
         ),
         Self::ForeignContext(id) => write!(
            f,
            "lazy global {id} is bound to another once-context and cannot be initialized through this one"
         ),
      }
   }
}

impl std::error::Error for OnceError {}

/// Errors raised while setting up the shared-memory region.
#[derive(Debug)]
pub enum RegionError {
   /// Region name is not a valid POSIX shm name
   InvalidName(String),

   /// Backing object could not be created or sized
   Create(io::Error),

   /// Backing object exists but could not be opened
   Open(io::Error),

   /// Mapping into the address space failed
   Mmap(io::Error),

   /// The per-tag creation lock could not be taken
   Lock(io::Error),

   /// Requested size cannot hold the header and slot table
   TooSmall { size: usize, required: usize },

   /// Shared memory is not available on this target
   Unsupported,
}

impl fmt::Display for RegionError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::InvalidName(name) => write!(f, "Invalid region name: {name}"),
         Self::Create(e) => write!(f, "Shared region creation failed: {e}"),
         Self::Open(e) => write!(f, "Shared region open failed: {e}"),
         Self::Mmap(e) => write!(f, "Memory mapping failed: {e}"),
         Self::Lock(e) => write!(f, "Shared region lock failed: {e}"),
         Self::TooSmall { size, required } => {
            write!(f, "Region too small: {size} bytes, need at least {required}")
         }
         Self::Unsupported => write!(f, "Shared memory is not supported on this platform"),
      }
   }
}

impl std::error::Error for RegionError {
   fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
      match self {
         Self::Create(e) | Self::Open(e) | Self::Mmap(e) | Self::Lock(e) => Some(e),
         _ => None,
      }
   }
}

/// Result type for region operations.
pub type RegionResult<T> = std::result::Result<T, RegionError>;

/// Unrecoverable invariant violations.
pub(crate) mod fatal {
   use std::io::Write;

   /// The single line written to stderr before the process aborts.
   pub const FATAL_MESSAGE: &str =
      "FATAL: lazy global initialization did not complete; aborting";

   /// Reports `reason` and terminates the process. Never unwinds.
   #[cold]
   #[inline(never)]
   pub fn abort(reason: &str) -> ! {
      log::error!("[once] invariant violated: {reason}");
      let mut stderr = std::io::stderr().lock();
      let _ = writeln!(stderr, "{FATAL_MESSAGE}");
      let _ = stderr.flush();
      std::process::abort()
   }
}
