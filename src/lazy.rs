//! Lazily-initialized global values.
//!
//! [`LazyGlobal<T>`] is what an initialization site looks like when written
//! by hand: a private [`OnceFlag`] checked on every access, storage for the
//! value, and a slow path through a [`OnceContext`] on the first access.

use core::cell::UnsafeCell;
#[cfg(feature = "async-tokio")]
use core::future::Future;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use core::{fmt, mem, ptr};

use crate::context::OnceContext;
use crate::error::OnceError;
use crate::flag::{FlagId, OnceFlag};

/// A global value computed on first access, exactly once.
///
/// The value lives in this process. With a cross-image context the
/// initializer runs once across all images, so images that lose the race
/// observe the flag set without a value of their own; reads there panic.
/// Use the cross-image path for initializers whose effects are themselves
/// shared.
///
/// The first slow-path access binds the global to the context it went
/// through. Later accesses through any other context fail with
/// [`OnceError::ForeignContext`], since two contexts keep separate registries
/// and would each elect a winner.
pub struct LazyGlobal<T> {
   flag: OnceFlag,
   /// Context the initialization is bound to. Compared, never dereferenced.
   bound: AtomicPtr<OnceContext>,
   state: AtomicU8,
   value: UnsafeCell<mem::MaybeUninit<T>>,
}

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const STORED: u8 = 2;

impl<T> LazyGlobal<T> {
   /// Creates an uninitialized global named by `id`.
   #[inline]
   #[must_use]
   pub const fn new(id: FlagId) -> Self {
      Self {
         flag: OnceFlag::new(id),
         bound: AtomicPtr::new(ptr::null_mut()),
         state: AtomicU8::new(EMPTY),
         value: UnsafeCell::new(mem::MaybeUninit::uninit()),
      }
   }

   /// Creates a global that is already initialized with `value`.
   #[inline]
   #[must_use]
   pub const fn with_value(id: FlagId, value: T) -> Self {
      Self {
         flag: OnceFlag::done(id),
         bound: AtomicPtr::new(ptr::null_mut()),
         state: AtomicU8::new(STORED),
         value: UnsafeCell::new(mem::MaybeUninit::new(value)),
      }
   }

   /// Handle of this global.
   #[inline]
   pub fn id(&self) -> FlagId {
      self.flag.id()
   }

   /// Whether the initializer has completed (here or in another image).
   #[inline]
   pub fn is_done(&self) -> bool {
      self.flag.is_done()
   }

   /// Returns the value if one was stored in this process. Never blocks.
   #[inline]
   pub fn get(&self) -> Option<&T> {
      if self.state.load(Ordering::Acquire) == STORED {
         // SAFETY: `STORED` is only published after the value was written.
         Some(unsafe { self.get_unchecked() })
      } else {
         None
      }
   }

   /// Returns the value, running `f` through [`OnceContext::global`] on first access.
   ///
   /// # Panics
   ///
   /// Panics if `f` transitively reads this same global, if the global is
   /// bound to a context other than the global one, or if no value is
   /// available after initialization (see [`LazyGlobal::get_or_init_in`]).
   #[inline]
   pub fn get_or_init<F>(&self, f: F) -> &T
   where
      F: FnOnce() -> T,
   {
      if let Some(value) = self.get() {
         return value;
      }
      match self.get_or_init_in(OnceContext::global(), f) {
         Ok(value) => value,
         Err(e) => panic!("{e}"),
      }
   }

   /// Returns the value, running `f` through `context` on first access.
   ///
   /// # Errors
   ///
   /// [`OnceError::Reentrant`] if `f` transitively reads this global again,
   /// [`OnceError::ForeignContext`] if the global is already bound to another
   /// context.
   ///
   /// # Panics
   ///
   /// Panics if initialization completed without storing a value: the
   /// initializer panicked, or it ran in another image.
   pub fn get_or_init_in<F>(&self, context: &OnceContext, f: F) -> Result<&T, OnceError>
   where
      F: FnOnce() -> T,
   {
      if let Some(value) = self.get() {
         return Ok(value);
      }
      self.bind(context)?;
      context.execute(&self.flag, || self.store(f()))?;
      Ok(self.initialized())
   }

   /// Async flavour of [`get_or_init`](Self::get_or_init).
   ///
   /// # Panics
   ///
   /// Same conditions as [`get_or_init`](Self::get_or_init).
   #[cfg(feature = "async-tokio")]
   pub async fn get_or_init_async<F, Fut>(&self, f: F) -> &T
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = T>,
   {
      if let Some(value) = self.get() {
         return value;
      }
      match self.get_or_init_async_in(OnceContext::global(), f).await {
         Ok(value) => value,
         Err(e) => panic!("{e}"),
      }
   }

   /// Async flavour of [`get_or_init_in`](Self::get_or_init_in).
   ///
   /// # Errors
   ///
   /// [`OnceError::Reentrant`] if `f` transitively reads this global again,
   /// [`OnceError::ForeignContext`] if the global is already bound to another
   /// context.
   #[cfg(feature = "async-tokio")]
   pub async fn get_or_init_async_in<F, Fut>(
      &self,
      context: &OnceContext,
      f: F,
   ) -> Result<&T, OnceError>
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = T>,
   {
      if let Some(value) = self.get() {
         return Ok(value);
      }
      self.bind(context)?;
      context
         .execute_async(&self.flag, move || async move { self.store(f().await) })
         .await?;
      Ok(self.initialized())
   }

   /// Returns a reference to the value without checking that it was stored.
   ///
   /// # Safety
   ///
   /// The caller must ensure a value was stored, e.g. via [`get`](Self::get).
   #[inline]
   pub unsafe fn get_unchecked(&self) -> &T {
      debug_assert_eq!(self.state.load(Ordering::Relaxed), STORED);
      // SAFETY: The caller guarantees that the value is initialized.
      unsafe { (*self.value.get()).assume_init_ref() }
   }

   /// Binds the global to `context`, or checks that it already is.
   fn bind(&self, context: &OnceContext) -> Result<(), OnceError> {
      let wanted = context as *const OnceContext as *mut OnceContext;
      match self
         .bound
         .compare_exchange(ptr::null_mut(), wanted, Ordering::AcqRel, Ordering::Acquire)
      {
         Ok(_) => Ok(()),
         Err(bound) if bound == wanted => Ok(()),
         Err(_) => {
            log::warn!("[once] lazy global {} accessed through a foreign context", self.id());
            Err(OnceError::ForeignContext(self.id()))
         }
      }
   }

   /// Writes the value. The first write wins; any later one is dropped.
   fn store(&self, value: T) {
      if self
         .state
         .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
         .is_err()
      {
         log::warn!("[once] lazy global {} already has a value; dropping a second one", self.id());
         return;
      }
      // SAFETY: Winning the `EMPTY -> WRITING` exchange grants exclusive write
      // access, and nobody reads the value before `STORED` is published.
      unsafe { (*self.value.get()).write(value) };
      self.state.store(STORED, Ordering::Release);
   }

   #[cold]
   fn missing(&self) -> ! {
      panic!(
         "lazy global {} has no value: its initializer panicked or ran in another image",
         self.flag.id()
      )
   }

   #[inline]
   fn initialized(&self) -> &T {
      match self.get() {
         Some(value) => value,
         None => self.missing(),
      }
   }
}

// SAFETY:
// Sharing a `LazyGlobal<T>` hands out `&T` to many threads (needs `T: Sync`),
// and the value may be produced on one thread and dropped on another (needs `T: Send`).
unsafe impl<T: Sync + Send> Sync for LazyGlobal<T> {}
// SAFETY: Moving the cell moves the `T` it owns.
unsafe impl<T: Send> Send for LazyGlobal<T> {}

impl<T: fmt::Debug> fmt::Debug for LazyGlobal<T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_tuple("LazyGlobal");
      d.field(&self.flag.id());
      match self.get() {
         Some(v) => d.field(v),
         None => d.field(&format_args!("<uninit>")),
      };
      d.finish()
   }
}

impl<T> Drop for LazyGlobal<T> {
   #[inline]
   fn drop(&mut self) {
      if *self.state.get_mut() == STORED {
         // SAFETY: A value was stored and we have exclusive access.
         unsafe { self.value.get_mut().assume_init_drop() };
      }
   }
}
