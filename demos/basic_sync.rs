//! Threads racing on first access to a lazy global, and what a global whose
//! initializer depends on itself looks like.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use once_latch::{FlagId, LazyGlobal, OnceContext, OnceError};

static RUNS: AtomicUsize = AtomicUsize::new(0);
static SETTINGS: LazyGlobal<Vec<(&str, u32)>> = LazyGlobal::new(FlagId::new(0));
static CYCLIC: LazyGlobal<u32> = LazyGlobal::new(FlagId::new(1));
static CONTEXT: OnceContext = OnceContext::local();

fn settings() -> &'static [(&'static str, u32)] {
   SETTINGS
      .get_or_init_in(&CONTEXT, || {
         RUNS.fetch_add(1, Ordering::Relaxed);
         println!("[{:?}] loading settings", thread::current().id());
         thread::sleep(Duration::from_millis(50));
         vec![("workers", 4), ("retries", 3)]
      })
      .map(Vec::as_slice)
      .unwrap()
}

fn cyclic() -> Result<&'static u32, OnceError> {
   CYCLIC.get_or_init_in(&CONTEXT, || match cyclic() {
      Ok(v) => v + 1,
      Err(e) => {
         println!("inner access refused: {e}");
         0
      }
   })
}

fn main() {
   let barrier = Barrier::new(6);
   thread::scope(|s| {
      for _ in 0..5 {
         s.spawn(|| {
            barrier.wait();
            println!("[{:?}] sees {} settings", thread::current().id(), settings().len());
         });
      }
      barrier.wait();
      while CONTEXT.in_flight() == 1 {
         println!("waiting on settings: {}", CONTEXT.pending_waiters(SETTINGS.id()));
         thread::sleep(Duration::from_millis(10));
      }
   });
   assert_eq!(RUNS.load(Ordering::Relaxed), 1);

   assert_eq!(cyclic(), Ok(&0));
   println!("cyclic global settled at {}", cyclic().unwrap_or(&0));
}
