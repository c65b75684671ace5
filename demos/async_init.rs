//! Tasks racing on one flag: spawned tasks queue up and resume in order,
//! and two calls joined inside a single task race like any other pair.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use once_latch::{FlagId, OnceContext, OnceFlag};

static CONNECT: OnceFlag = OnceFlag::new(FlagId::new(0));
static WARMUP: OnceFlag = OnceFlag::new(FlagId::new(1));
static CONTEXT: OnceContext = OnceContext::local();

async fn connect(order: Arc<Mutex<Vec<usize>>>, task: usize) {
   CONTEXT
      .execute_async(&CONNECT, move || async move {
         println!("task {task} opens the connection");
         for _ in 0..10 {
            tokio::task::yield_now().await;
         }
      })
      .await
      .unwrap();
   order.lock().unwrap().push(task);
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
   let order = Arc::new(Mutex::new(Vec::new()));
   let tasks: Vec<_> = (0..5)
      .map(|task| tokio::spawn(connect(Arc::clone(&order), task)))
      .collect();
   for t in tasks {
      t.await.unwrap();
   }
   println!("tasks resumed in order {:?}", order.lock().unwrap());

   let runs = AtomicUsize::new(0);
   let runs_ref = &runs;
   let warm = move || async move {
      runs_ref.fetch_add(1, Ordering::Relaxed);
      tokio::task::yield_now().await;
   };
   let (a, b) = tokio::join!(
      CONTEXT.execute_async(&WARMUP, warm),
      CONTEXT.execute_async(&WARMUP, warm),
   );
   println!("joined warmups: {a:?} {b:?}, ran {} time(s)", runs.load(Ordering::Relaxed));
}
