//! Run several copies of this program at once: the initializer for global #0
//! runs in exactly one of them, the others wait for it.

use std::time::Duration;

use once_latch::{Capabilities, FlagId, OnceConfig, OnceContext, OnceFlag};

static BANNER: OnceFlag = OnceFlag::new(FlagId::new(0));

fn main() {
   let config = OnceConfig::from_env().with_region_tag("once_latch_demo");
   let context = match OnceContext::new(Capabilities::BUILD | Capabilities::CROSS_IMAGE, &config) {
      Ok(context) => context,
      Err(e) => {
         eprintln!("shared table unavailable ({e}), coordinating locally only");
         OnceContext::local()
      }
   };

   let pid = std::process::id();
   context
      .execute(&BANNER, || {
         println!("[{pid}] initializing banner");
         std::thread::sleep(Duration::from_secs(2));
      })
      .unwrap();
   println!("[{pid}] banner ready (shared={})", context.is_shared());

   // Keep the region alive for late starters.
   std::thread::sleep(Duration::from_secs(5));
}
