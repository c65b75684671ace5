#![cfg(target_os = "linux")]

use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_latch::{
   Capabilities, FlagId, OnceConfig, OnceContext, OnceFlag, RegionError, SharedMemoryRegion,
   SharedOnceExecutor, SLOT_DONE, SLOT_IDLE, SLOT_RUNNING,
};

fn unique_config(label: &str) -> OnceConfig {
   let ts = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap()
      .as_nanos();
   OnceConfig::default()
      .with_region_tag(format!("once_it_{label}_{ts}"))
      .with_slot_count(64)
}

/// Two executors over the same region stand in for two independently loaded images.
fn two_images(label: &str) -> (OnceConfig, Arc<SharedOnceExecutor>, Arc<SharedOnceExecutor>) {
   let config = unique_config(label);
   let first = SharedOnceExecutor::attach(&config).expect("create region");
   let second = SharedOnceExecutor::attach(&config).expect("open region");
   assert!(first.region().is_owner());
   assert!(!second.region().is_owner());
   (config, Arc::new(first), Arc::new(second))
}

#[test]
fn test_images_racing_on_one_slot_initialize_once() {
   let (_config, first, second) = two_images("race");
   let id = FlagId::new(7);
   // Each image has its own flag for the same global.
   let flags = [Arc::new(OnceFlag::new(id)), Arc::new(OnceFlag::new(id))];
   let counter = Arc::new(AtomicUsize::new(0));
   let barrier = Arc::new(Barrier::new(8));

   let threads: Vec<_> = (0..8)
      .map(|i| {
         let executor = Arc::clone(if i % 2 == 0 { &first } else { &second });
         let flag = Arc::clone(&flags[i % 2]);
         let counter = Arc::clone(&counter);
         let barrier = Arc::clone(&barrier);
         thread::spawn(move || {
            barrier.wait();
            executor
               .execute(&flag, || {
                  counter.fetch_add(1, Ordering::SeqCst);
                  thread::sleep(Duration::from_millis(20));
               })
               .unwrap();
            assert!(flag.is_done());
         })
      })
      .collect();

   for handle in threads {
      handle.join().unwrap();
   }
   assert_eq!(counter.load(Ordering::SeqCst), 1);
   assert_eq!(first.slot_state(id), Some(SLOT_DONE));
   assert_eq!(second.slot_state(id), Some(SLOT_DONE));
   assert!(flags.iter().all(|flag| flag.is_done()));
}

#[test]
fn test_loser_sees_running_then_done() {
   let (_config, first, second) = two_images("observe");
   let id = FlagId::new(3);
   let (entered_tx, entered_rx) = mpsc::channel::<()>();
   let (release_tx, release_rx) = mpsc::channel::<()>();
   let runs = Arc::new(AtomicUsize::new(0));

   assert_eq!(second.slot_state(id), Some(SLOT_IDLE));
   let winner = {
      let first = Arc::clone(&first);
      let runs = Arc::clone(&runs);
      thread::spawn(move || {
         let flag = OnceFlag::new(id);
         first
            .execute(&flag, || {
               runs.fetch_add(1, Ordering::SeqCst);
               entered_tx.send(()).unwrap();
               release_rx.recv().unwrap();
            })
            .unwrap();
      })
   };
   entered_rx.recv().unwrap();
   assert_eq!(second.slot_state(id), Some(SLOT_RUNNING));

   let loser = {
      let second = Arc::clone(&second);
      let runs = Arc::clone(&runs);
      thread::spawn(move || {
         let flag = OnceFlag::new(id);
         second
            .execute(&flag, || {
               runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
         flag.is_done()
      })
   };
   thread::sleep(Duration::from_millis(30));
   assert!(!loser.is_finished(), "loser must poll until the slot is done");
   assert_eq!(second.slot_state(id), Some(SLOT_RUNNING));

   release_tx.send(()).unwrap();
   winner.join().unwrap();
   assert!(loser.join().unwrap());
   assert_eq!(runs.load(Ordering::SeqCst), 1);
   assert_eq!(second.slot_state(id), Some(SLOT_DONE));
}

#[test]
fn test_completed_slot_is_seen_by_late_image() {
   let (_config, first, second) = two_images("late");
   let id = FlagId::new(0);
   let mut runs = 0;
   first.execute(&OnceFlag::new(id), || runs += 1).unwrap();

   let late_flag = OnceFlag::new(id);
   second.execute(&late_flag, || runs += 1).unwrap();
   assert_eq!(runs, 1);
   assert!(late_flag.is_done());
}

#[test]
fn test_cross_image_context_uses_shared_path() {
   let config = unique_config("context");
   let first = OnceContext::new(Capabilities::CROSS_IMAGE, &config).unwrap();
   let second = OnceContext::new(Capabilities::CROSS_IMAGE, &config).unwrap();
   assert!(first.is_shared());
   assert!(second.is_shared());
   assert!(first.shared().unwrap().region().is_owner());
   assert_eq!(
      first.shared().unwrap().region().name(),
      second.shared().unwrap().region().name()
   );

   let mut runs = 0;
   first.execute(&OnceFlag::new(FlagId::new(5)), || runs += 1).unwrap();
   second.execute(&OnceFlag::new(FlagId::new(5)), || runs += 1).unwrap();
   assert_eq!(runs, 1);
   assert_eq!(first.pending_waiters(FlagId::new(5)), 0);
}

#[test]
fn test_creator_drop_removes_region() {
   let config = unique_config("destroy");
   let size = SharedOnceExecutor::region_size(config.slot_count);
   let executor = SharedOnceExecutor::attach(&config).unwrap();
   assert!(SharedMemoryRegion::open(&config.region_tag, size).is_some());
   drop(executor);
   assert!(SharedMemoryRegion::open(&config.region_tag, size).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_images_initialize_once() {
   let (_config, first, second) = two_images("async");
   let id = FlagId::new(9);
   let counter = Arc::new(AtomicUsize::new(0));
   let tasks: Vec<_> = (0..8)
      .map(|i| {
         let executor = Arc::clone(if i % 2 == 0 { &first } else { &second });
         let counter = Arc::clone(&counter);
         tokio::spawn(async move {
            let flag = OnceFlag::new(id);
            executor
               .execute_async(&flag, || async {
                  counter.fetch_add(1, Ordering::SeqCst);
                  for _ in 0..20 {
                     tokio::task::yield_now().await;
                  }
               })
               .await
               .unwrap();
            flag.is_done()
         })
      })
      .collect();

   for task in tasks {
      assert!(task.await.unwrap());
   }
   assert_eq!(counter.load(Ordering::SeqCst), 1);
   assert_eq!(first.slot_state(id), Some(SLOT_DONE));
}

#[test]
fn test_mismatched_image_is_refused_instead_of_replacing_table() {
   let config = unique_config("mismatch").with_slot_count(8);
   let first = SharedOnceExecutor::attach(&config).expect("create region");
   let larger = config.clone().with_slot_count(16);
   assert!(matches!(
      SharedOnceExecutor::attach(&larger),
      Err(RegionError::TooSmall { size: 36, required: 68 })
   ));

   // The original table is untouched and still the only one.
   let smaller = SharedOnceExecutor::attach(&config.clone().with_slot_count(4)).expect("open region");
   assert!(!smaller.region().is_owner());
   assert_eq!(smaller.region().name(), first.region().name());

   let mut runs = 0;
   first.execute(&OnceFlag::new(FlagId::new(0)), || runs += 1).unwrap();
   smaller.execute(&OnceFlag::new(FlagId::new(0)), || runs += 1).unwrap();
   assert_eq!(runs, 1);
}

#[test]
fn test_panicking_initializer_marks_slot_done_and_releases_losers() {
   let (_config, first, second) = two_images("unwind");
   let id = FlagId::new(11);
   let (entered_tx, entered_rx) = mpsc::channel::<()>();
   let (release_tx, release_rx) = mpsc::channel::<()>();

   let winner = {
      let first = Arc::clone(&first);
      thread::spawn(move || {
         let flag = OnceFlag::new(id);
         let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = first.execute(&flag, || {
               entered_tx.send(()).unwrap();
               release_rx.recv().unwrap();
               panic!("initializer failed");
            });
         }));
         (outcome.is_err(), flag.is_done())
      })
   };
   entered_rx.recv().unwrap();

   let loser = {
      let second = Arc::clone(&second);
      thread::spawn(move || {
         let flag = OnceFlag::new(id);
         let mut ran = false;
         second.execute(&flag, || ran = true).unwrap();
         (ran, flag.is_done())
      })
   };
   release_tx.send(()).unwrap();

   assert_eq!(winner.join().unwrap(), (true, true));
   assert_eq!(loser.join().unwrap(), (false, true));
   assert_eq!(first.slot_state(id), Some(SLOT_DONE));
}

#[tokio::test]
async fn test_joined_calls_in_one_task_poll_instead_of_reentering() {
   let (_config, first, _second) = two_images("join");
   let flag = OnceFlag::new(FlagId::new(12));
   let runs = AtomicUsize::new(0);
   let runs_ref = &runs;
   let (a, b) = tokio::join!(
      first.execute_async(&flag, move || async move {
         runs_ref.fetch_add(1, Ordering::SeqCst);
         for _ in 0..10 {
            tokio::task::yield_now().await;
         }
      }),
      first.execute_async(&flag, move || async move {
         runs_ref.fetch_add(1, Ordering::SeqCst);
      }),
   );
   assert_eq!((a, b), (Ok(()), Ok(())));
   assert_eq!(runs.load(Ordering::SeqCst), 1);
}

const CHILD_DIR_ENV: &str = "ONCE_LATCH_RACE_DIR";
const CHILD_TAG_ENV: &str = "ONCE_LATCH_RACE_TAG";
const CHILDREN: usize = 4;

fn wait_for(path: &Path, timeout: Duration) -> bool {
   let deadline = Instant::now() + timeout;
   while !path.exists() {
      if Instant::now() > deadline {
         return false;
      }
      thread::sleep(Duration::from_millis(2));
   }
   true
}

/// One process of the race: attach at the start signal, initialize, report,
/// then stay alive until released so the region outlives every attach.
fn race_child(dir: &Path, tag: &str) {
   if !wait_for(&dir.join("start"), Duration::from_secs(10)) {
      return;
   }
   let config = OnceConfig::default().with_region_tag(tag).with_slot_count(8);
   let executor = SharedOnceExecutor::attach(&config).unwrap();
   executor
      .execute(&OnceFlag::new(FlagId::new(0)), || {
         let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("runs"))
            .unwrap();
         writeln!(log, "{}", std::process::id()).unwrap();
         thread::sleep(Duration::from_millis(50));
      })
      .unwrap();
   fs::write(dir.join(format!("done_{}", std::process::id())), b"").unwrap();
   wait_for(&dir.join("release"), Duration::from_secs(10));
}

#[test]
fn test_processes_starting_together_initialize_once() {
   if let (Some(dir), Some(tag)) = (env::var_os(CHILD_DIR_ENV), env::var(CHILD_TAG_ENV).ok()) {
      race_child(Path::new(&dir), &tag);
      return;
   }

   let config = unique_config("procs");
   let dir: PathBuf = env::temp_dir().join(&config.region_tag);
   fs::create_dir_all(&dir).unwrap();
   let children: Vec<Child> = (0..CHILDREN)
      .map(|_| {
         Command::new(env::current_exe().unwrap())
            .args([
               "test_processes_starting_together_initialize_once",
               "--exact",
               "--test-threads=1",
            ])
            .env(CHILD_DIR_ENV, &dir)
            .env(CHILD_TAG_ENV, &config.region_tag)
            .spawn()
            .unwrap()
      })
      .collect();
   fs::write(dir.join("start"), b"").unwrap();

   let deadline = Instant::now() + Duration::from_secs(10);
   let done = || {
      fs::read_dir(&dir)
         .map(|entries| {
            entries
               .flatten()
               .filter(|e| e.file_name().to_string_lossy().starts_with("done_"))
               .count()
         })
         .unwrap_or(0)
   };
   while done() < CHILDREN && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(5));
   }
   let finished = done();
   fs::write(dir.join("release"), b"").unwrap();
   for mut child in children {
      assert!(child.wait().unwrap().success());
   }

   let runs = fs::read_to_string(dir.join("runs")).unwrap();
   let _ = fs::remove_dir_all(&dir);
   assert_eq!(finished, CHILDREN);
   assert_eq!(runs.lines().count(), 1, "initializer ran in: {runs}");
}
