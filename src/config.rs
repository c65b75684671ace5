//! Runtime configuration for a [`OnceContext`](crate::OnceContext).

use std::env;

/// Default logical name of the shared slot table.
pub const DEFAULT_REGION_TAG: &str = "once_latch";

/// Default number of shared slots (one per `FlagId`).
pub const DEFAULT_SLOT_COUNT: u32 = 4096;

/// Default number of cooperative yields between slot polls before a waiter
/// falls back to a short sleep.
pub const DEFAULT_POLL_SPINS: u32 = 64;

/// Environment variable overriding [`OnceConfig::region_tag`].
pub const ENV_REGION_TAG: &str = "ONCE_LATCH_REGION_TAG";
/// Environment variable overriding [`OnceConfig::slot_count`].
pub const ENV_SLOTS: &str = "ONCE_LATCH_SLOTS";
/// Environment variable overriding [`OnceConfig::poll_spins`].
pub const ENV_POLL_SPINS: &str = "ONCE_LATCH_POLL_SPINS";

/// Settings for the shared-memory path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnceConfig {
   /// Logical region name. The concrete name also embeds the creator's pid.
   pub region_tag: String,
   /// Capacity of the slot table. Every `FlagId` must be below this.
   pub slot_count: u32,
   /// Yields between polls of a running slot before sleeping.
   pub poll_spins: u32,
}

impl Default for OnceConfig {
   fn default() -> Self {
      Self {
         region_tag: DEFAULT_REGION_TAG.to_string(),
         slot_count: DEFAULT_SLOT_COUNT,
         poll_spins: DEFAULT_POLL_SPINS,
      }
   }
}

impl OnceConfig {
   /// Defaults overridden by `ONCE_LATCH_*` environment variables.
   ///
   /// Malformed values are logged and ignored.
   pub fn from_env() -> Self {
      let mut config = Self::default();
      if let Ok(tag) = env::var(ENV_REGION_TAG) {
         if is_valid_tag(&tag) {
            config.region_tag = tag;
         } else {
            log::warn!("[once] ignoring {ENV_REGION_TAG}={tag:?}: not a valid region tag");
         }
      }
      if let Some(slots) = parse_env(ENV_SLOTS) {
         if slots > 0 {
            config.slot_count = slots;
         } else {
            log::warn!("[once] ignoring {ENV_SLOTS}=0");
         }
      }
      if let Some(spins) = parse_env(ENV_POLL_SPINS) {
         config.poll_spins = spins;
      }
      config
   }

   /// Overrides the region tag.
   #[must_use]
   pub fn with_region_tag(mut self, tag: impl Into<String>) -> Self {
      self.region_tag = tag.into();
      self
   }

   /// Overrides the slot count.
   #[must_use]
   pub fn with_slot_count(mut self, slot_count: u32) -> Self {
      self.slot_count = slot_count;
      self
   }

   /// Overrides the number of yields between slot polls before sleeping.
   #[must_use]
   pub fn with_poll_spins(mut self, poll_spins: u32) -> Self {
      self.poll_spins = poll_spins;
      self
   }
}

fn parse_env(key: &str) -> Option<u32> {
   let raw = env::var(key).ok()?;
   match raw.trim().parse() {
      Ok(value) => Some(value),
      Err(e) => {
         log::warn!("[once] ignoring {key}={raw:?}: {e}");
         None
      }
   }
}

/// Tags end up in a POSIX shm name, so `/` and NUL are rejected.
pub(crate) fn is_valid_tag(tag: &str) -> bool {
   !tag.is_empty() && !tag.contains('/') && !tag.contains('\0')
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn defaults() {
      let config = OnceConfig::default();
      assert_eq!(config.region_tag, DEFAULT_REGION_TAG);
      assert_eq!(config.slot_count, DEFAULT_SLOT_COUNT);
      assert_eq!(config.poll_spins, DEFAULT_POLL_SPINS);
   }

   #[test]
   fn builders_override() {
      let config = OnceConfig::default()
         .with_region_tag("app")
         .with_slot_count(16)
         .with_poll_spins(0);
      assert_eq!(config.region_tag, "app");
      assert_eq!(config.slot_count, 16);
      assert_eq!(config.poll_spins, 0);
   }

   #[test]
   fn tag_validation() {
      assert!(is_valid_tag("once_latch"));
      assert!(!is_valid_tag(""));
      assert!(!is_valid_tag("a/b"));
   }
}
