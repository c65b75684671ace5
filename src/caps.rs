//! Build capabilities consulted when choosing an initialization strategy.

use bitflags::bitflags;

bitflags! {
   /// Closed set of build-configuration flags relevant to once-initialization.
   #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
   pub struct Capabilities: u8 {
      /// Built with optimizations and without debug assertions.
      const RELEASE     = 1 << 0;
      /// Built with debug assertions.
      const DEBUG       = 1 << 1;
      /// Statically linked C runtime.
      const STATIC      = 1 << 2;
      /// Separately loaded images in one process (or several processes) coordinate
      /// through a shared-memory slot table.
      const CROSS_IMAGE = 1 << 3;
   }
}

impl Capabilities {
   /// Capabilities of the current build, resolved at compile time.
   pub const BUILD: Self = Self::detect();

   const fn detect() -> Self {
      let mut bits = 0;
      if cfg!(debug_assertions) {
         bits |= Self::DEBUG.bits();
      } else {
         bits |= Self::RELEASE.bits();
      }
      if cfg!(target_feature = "crt-static") {
         bits |= Self::STATIC.bits();
      }
      if cfg!(feature = "cross-image") {
         bits |= Self::CROSS_IMAGE.bits();
      }
      Self::from_bits_retain(bits)
   }

   /// Whether the shared-memory path should be used.
   #[inline]
   pub const fn cross_image(self) -> bool {
      self.contains(Self::CROSS_IMAGE)
   }
}
