//! Cross-image once-initialization over a shared slot table.
//!
//! Participants that do not share a registry or a scheduler (separately
//! loaded images, or separate processes) coordinate through one `u32` slot
//! per [`FlagId`] in a [`SharedMemoryRegion`]:
//!
//! ```text
//! word 0        reserved next-free-slot counter (written at creation only)
//! word 1 + id   slot for FlagId(id): 0 = idle, 1 = running, 2 = done
//! ```
//!
//! Exactly one participant moves a slot `0 -> 1` (a single compare-exchange on
//! the shared word) and later `1 -> 2`. Everyone else polls, yielding between
//! checks, since there is no shared wake-up channel across images.

use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};
#[cfg(feature = "async-tokio")]
use std::future::Future;
use std::thread;
use std::time::Duration;

use spin::Mutex;

use crate::config::{is_valid_tag, OnceConfig};
use crate::error::{fatal, OnceError, RegionError, RegionResult};
use crate::flag::{ensure_done, FlagId, OnceFlag};
use crate::region::SharedMemoryRegion;
use crate::state::Initiator;

/// Words reserved at the start of the region before the slot table.
const HEADER_WORDS: usize = 1;

/// Slot has never been claimed.
pub const SLOT_IDLE: u32 = 0;
/// Some participant is running the initializer.
pub const SLOT_RUNNING: u32 = 1;
/// The initializer has completed.
pub const SLOT_DONE: u32 = 2;

/// Sleep used once a poller has yielded `poll_spins` times in a row.
const POLL_SLEEP: Duration = Duration::from_micros(200);

/// Result of trying to claim a slot.
enum Claim<'a> {
   Won(SlotGuard<'a>),
   Lost,
}

/// Once-executor backed by a shared-memory slot table.
pub struct SharedOnceExecutor {
   region: SharedMemoryRegion,
   slot_count: u32,
   poll_spins: u32,
   /// Claims held by this process, for reentrancy detection.
   claims: Mutex<Vec<(FlagId, Initiator)>>,
}

impl SharedOnceExecutor {
   /// Bytes needed for the header plus `slot_count` slots.
   #[must_use]
   pub const fn region_size(slot_count: u32) -> usize {
      (HEADER_WORDS + slot_count as usize) * mem::size_of::<AtomicU32>()
   }

   /// Joins the slot table named by `config`, creating it if no live
   /// participant has one yet.
   ///
   /// # Errors
   ///
   /// Fails if the tag is invalid or the region cannot be created or mapped.
   pub fn attach(config: &OnceConfig) -> RegionResult<Self> {
      if !is_valid_tag(&config.region_tag) {
         return Err(RegionError::InvalidName(config.region_tag.clone()));
      }
      let size = Self::region_size(config.slot_count);
      let region = SharedMemoryRegion::open_or_create(&config.region_tag, size)?;
      Self::with_region(region, config)
   }

   /// Wraps an already mapped region.
   ///
   /// # Errors
   ///
   /// Fails if the region cannot hold `config.slot_count` slots.
   pub fn with_region(region: SharedMemoryRegion, config: &OnceConfig) -> RegionResult<Self> {
      let required = Self::region_size(config.slot_count);
      if region.size() < required {
         return Err(RegionError::TooSmall {
            size: region.size(),
            required,
         });
      }
      let executor = Self {
         region,
         slot_count: config.slot_count,
         poll_spins: config.poll_spins,
         claims: Mutex::new(Vec::new()),
      };
      if executor.region.is_owner() {
         executor.header().store(HEADER_WORDS as u32, Ordering::Release);
      }
      Ok(executor)
   }

   /// The region backing this executor.
   #[inline]
   pub fn region(&self) -> &SharedMemoryRegion {
      &self.region
   }

   /// Current state of the slot for `id`, or `None` if `id` is outside the table.
   pub fn slot_state(&self, id: FlagId) -> Option<u32> {
      self.slot(id).map(|slot| slot.load(Ordering::Acquire))
   }

   /// Runs `f` if `flag` is unset, exactly once across every participant
   /// mapping this slot table.
   ///
   /// Losers poll the slot, yielding the thread between checks, until the
   /// winner marks it done.
   pub fn execute<F>(&self, flag: &OnceFlag, f: F) -> Result<(), OnceError>
   where
      F: FnOnce(),
   {
      if flag.is_done() {
         return Ok(());
      }
      let slot = self.slot_or_abort(flag.id());
      match self.claim(flag, slot, Initiator::current())? {
         Claim::Won(guard) => {
            f();
            guard.finish();
         }
         Claim::Lost => {
            let mut polls = 0u32;
            while slot.load(Ordering::Acquire) == SLOT_RUNNING {
               if polls < self.poll_spins {
                  polls += 1;
                  thread::yield_now();
               } else {
                  thread::sleep(POLL_SLEEP);
               }
            }
            self.observe_done(flag, slot);
         }
      }
      ensure_done(flag);
      Ok(())
   }

   /// Async flavour of [`execute`](Self::execute); losers yield to the tokio
   /// scheduler between polls.
   #[cfg(feature = "async-tokio")]
   pub async fn execute_async<F, Fut>(&self, flag: &OnceFlag, f: F) -> Result<(), OnceError>
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = ()>,
   {
      if flag.is_done() {
         return Ok(());
      }
      let slot = self.slot_or_abort(flag.id());
      let initiator = Initiator::for_call();
      match self.claim(flag, slot, initiator)? {
         Claim::Won(guard) => {
            initiator.scope(async move { f().await }).await;
            guard.finish();
         }
         Claim::Lost => {
            while slot.load(Ordering::Acquire) == SLOT_RUNNING {
               tokio::task::yield_now().await;
            }
            self.observe_done(flag, slot);
         }
      }
      ensure_done(flag);
      Ok(())
   }

   /// Claims the slot for the current initiator, or reports reentrancy.
   fn claim<'a>(
      &'a self,
      flag: &'a OnceFlag,
      slot: &'a AtomicU32,
      initiator: Initiator,
   ) -> Result<Claim<'a>, OnceError> {
      let mut claims = self.claims.lock();
      if claims
         .iter()
         .any(|&(id, owner)| id == flag.id() && owner == initiator)
      {
         drop(claims);
         log::debug!("[once] reentrant initialization of {} (shared)", flag.id());
         return Err(OnceError::Reentrant(flag.id()));
      }
      match slot.compare_exchange(SLOT_IDLE, SLOT_RUNNING, Ordering::AcqRel, Ordering::Acquire) {
         Ok(_) => {
            claims.push((flag.id(), initiator));
            log::debug!("[once] {:?} claimed shared slot {}", initiator, flag.id());
            Ok(Claim::Won(SlotGuard {
               executor: self,
               flag,
               slot,
            }))
         }
         Err(state) => {
            log::debug!("[once] {:?} polls shared slot {} (state {state})", initiator, flag.id());
            Ok(Claim::Lost)
         }
      }
   }

   /// After polling: the slot must be done, then the local flag follows it.
   fn observe_done(&self, flag: &OnceFlag, slot: &AtomicU32) {
      let state = slot.load(Ordering::Acquire);
      if state != SLOT_DONE {
         fatal::abort(&format!("shared slot {} ended in state {state}", flag.id()));
      }
      flag.mark_done();
   }

   fn slot_or_abort(&self, id: FlagId) -> &AtomicU32 {
      match self.slot(id) {
         Some(slot) => slot,
         None => fatal::abort(&format!(
            "flag {id} outside shared slot table of {} slots",
            self.slot_count
         )),
      }
   }

   fn header(&self) -> &AtomicU32 {
      // SAFETY: The region is page aligned and at least `region_size(slot_count)` bytes.
      unsafe { &*self.region.as_ptr().cast::<AtomicU32>() }
   }

   fn slot(&self, id: FlagId) -> Option<&AtomicU32> {
      if id.index() >= self.slot_count {
         return None;
      }
      let word = HEADER_WORDS + id.index() as usize;
      // SAFETY: `word` is below `HEADER_WORDS + slot_count`, which `with_region`
      // checked against the mapping size; the base is page aligned.
      Some(unsafe { &*self.region.as_ptr().cast::<AtomicU32>().add(word) })
   }
}

/// Held by the participant that moved a slot to running.
///
/// Dropping it, also while unwinding, marks the slot done, sets the local
/// flag and releases the local claim.
struct SlotGuard<'a> {
   executor: &'a SharedOnceExecutor,
   flag: &'a OnceFlag,
   slot: &'a AtomicU32,
}

impl SlotGuard<'_> {
   #[inline]
   fn finish(self) {
      drop(self);
   }
}

impl Drop for SlotGuard<'_> {
   fn drop(&mut self) {
      let id = self.flag.id();
      let mut claims = self.executor.claims.lock();
      self.slot.store(SLOT_DONE, Ordering::Release);
      self.flag.mark_done();
      claims.retain(|&(claimed, _)| claimed != id);
   }
}
