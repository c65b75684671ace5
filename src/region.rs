//! Named shared-memory regions.
//!
//! A region is a fixed-size block backed by a POSIX shared memory object and
//! mapped read/write into every participant. The creator's pid is part of the
//! object name (`/{tag}_{pid}`), so other participants rediscover it by
//! scanning `/dev/shm` for the tag and checking that the creator still lives.
//!
//! # Lifecycle
//!
//! 1. One participant calls [`SharedMemoryRegion::create`]
//! 2. Others call [`SharedMemoryRegion::open`] with the same tag
//! 3. Every mapping is unmapped on drop
//! 4. The creator's drop (or [`SharedMemoryRegion::destroy`]) also unlinks the object
//!
//! Lookup and creation for one tag are serialized by an advisory `flock` on
//! `{tag}.lock` next to the objects, so participants starting together agree
//! on a single creator. The lock file itself is never removed.

use crate::error::{RegionError, RegionResult};

#[cfg(unix)]
use std::ffi::CString;
#[cfg(unix)]
use std::fs::{File, OpenOptions};
#[cfg(unix)]
use std::io;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::ptr;

/// Directory where Linux exposes POSIX shared memory objects.
#[cfg(unix)]
const SHM_DIR: &str = "/dev/shm";

/// Longest object name accepted (`NAME_MAX`).
const MAX_NAME_LEN: usize = 255;

/// Objects this process created and still maps as owner. A same-pid object
/// missing from here was left behind by an earlier process that had our pid.
#[cfg(unix)]
static OWNED: spin::Mutex<Vec<String>> = spin::Mutex::new(Vec::new());

/// A mapped shared-memory region.
pub struct SharedMemoryRegion {
   ptr: *mut u8,
   size: usize,
   name: String,
   owner: bool,
}

// SAFETY: The region only hands out a raw pointer; everything built on top of
// it accesses the memory through atomics.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
   /// Concrete object name for `tag` created by process `pid`.
   #[must_use]
   pub fn object_name(tag: &str, pid: u32) -> String {
      format!("/{tag}_{pid}")
   }

   /// Pointer to the first byte of the mapping. Page aligned.
   #[inline]
   #[must_use]
   pub fn as_ptr(&self) -> *mut u8 {
      self.ptr
   }

   /// Size of the mapping in bytes.
   #[inline]
   #[must_use]
   pub fn size(&self) -> usize {
      self.size
   }

   /// Concrete object name, including the creator's pid.
   #[inline]
   #[must_use]
   pub fn name(&self) -> &str {
      &self.name
   }

   /// Whether this mapping created (and will unlink) the object.
   #[inline]
   #[must_use]
   pub fn is_owner(&self) -> bool {
      self.owner
   }

   /// Unmaps the region and, for the creator, removes the backing object.
   pub fn destroy(self) {
      drop(self);
   }

   fn validate_name(name: &str) -> RegionResult<()> {
      if !name.starts_with('/') {
         return Err(RegionError::InvalidName(format!(
            "Region name must start with '/': {name}"
         )));
      }
      if name.len() > 1 && name[1..].contains('/') {
         return Err(RegionError::InvalidName(format!(
            "Region name cannot contain '/' after prefix: {name}"
         )));
      }
      if name.len() > MAX_NAME_LEN {
         return Err(RegionError::InvalidName(format!(
            "Region name too long (max {MAX_NAME_LEN}): {name}"
         )));
      }
      Ok(())
   }
}

#[cfg(unix)]
impl SharedMemoryRegion {
   /// Opens the live region for `tag`, or creates one if there is none.
   ///
   /// Both steps run under the tag lock, so of several participants starting
   /// at once exactly one creates the region and the rest open it.
   ///
   /// # Errors
   ///
   /// Fails if the lock cannot be taken, if a live region exists but cannot
   /// be used (for instance it is smaller than `size`), or if creation fails.
   /// An unusable live region is never replaced.
   pub fn open_or_create(tag: &str, size: usize) -> RegionResult<Self> {
      let _lock = TagLock::acquire(tag)?;
      match Self::find_live(tag, size)? {
         Some(region) => Ok(region),
         None => Self::create_locked(tag, size),
      }
   }

   /// Creates a fresh, zeroed region owned by this process.
   ///
   /// Stale objects for the same tag are removed first: those of dead
   /// processes, and same-pid leftovers this process did not create.
   ///
   /// # Errors
   ///
   /// Returns an error if the name is invalid, if this process already owns a
   /// live region for `tag`, or if the OS refuses to create, size or map the
   /// object.
   pub fn create(tag: &str, size: usize) -> RegionResult<Self> {
      let _lock = TagLock::acquire(tag)?;
      Self::create_locked(tag, size)
   }

   fn create_locked(tag: &str, size: usize) -> RegionResult<Self> {
      let name = Self::object_name(tag, std::process::id());
      Self::validate_name(&name)?;
      let c_name = CString::new(name.as_str()).map_err(|_| RegionError::InvalidName(name.clone()))?;

      let cleaned = remove_stale(tag);
      if cleaned > 0 {
         log::debug!("[once] removed {cleaned} stale region(s) for tag {tag}");
      }

      // SAFETY:
      // - c_name is a valid null-terminated CString
      // - O_CREAT|O_EXCL fails with EEXIST instead of touching a live object
      let fd = unsafe {
         libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
      };
      if fd < 0 {
         return Err(RegionError::Create(io::Error::last_os_error()));
      }

      // SAFETY: fd is valid from the successful shm_open above.
      let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
      if ret < 0 {
         let err = io::Error::last_os_error();
         // SAFETY: fd is valid and not used again; the object is ours and is
         // removed so it is not leaked.
         unsafe {
            libc::close(fd);
            libc::shm_unlink(c_name.as_ptr());
         }
         return Err(RegionError::Create(err));
      }

      let ptr = match map(fd, size) {
         Ok(ptr) => ptr,
         Err(e) => {
            // SAFETY: The object was created above and nobody else knows about it yet.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(e);
         }
      };

      // SAFETY: ptr maps exactly `size` writable bytes and no one else has seen it yet.
      unsafe { ptr::write_bytes(ptr, 0, size) };

      OWNED.lock().push(name.clone());
      log::info!("[once] created shared region {name} ({size} bytes)");
      Ok(Self {
         ptr,
         size,
         name,
         owner: true,
      })
   }

   /// Maps a region for `tag` created by another live participant.
   ///
   /// Returns `None` when no usable region exists.
   pub fn open(tag: &str, size: usize) -> Option<Self> {
      let lookup = TagLock::acquire(tag).and_then(|_lock| Self::find_live(tag, size));
      match lookup {
         Ok(region) => region,
         Err(e) => {
            log::warn!("[once] cannot open shared region for {tag}: {e}");
            None
         }
      }
   }

   /// Scans for a live region. Caller holds the tag lock.
   ///
   /// `Ok(None)` means there is nothing to open. A live region that cannot be
   /// mapped is an error, so the caller never creates a rival table.
   fn find_live(tag: &str, size: usize) -> RegionResult<Option<Self>> {
      let mut failure = None;
      for (name, pid) in list_regions(tag) {
         if is_stale(&name, pid) {
            continue;
         }
         match Self::open_named(&name, size) {
            Ok(region) => {
               log::info!("[once] opened shared region {name} ({size} bytes)");
               return Ok(Some(region));
            }
            // Unlinked by its creator since the scan.
            Err(RegionError::Open(e)) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
               log::warn!("[once] cannot open shared region {name}: {e}");
               failure.get_or_insert(e);
            }
         }
      }
      match failure {
         Some(e) => Err(e),
         None => Ok(None),
      }
   }

   fn open_named(name: &str, size: usize) -> RegionResult<Self> {
      Self::validate_name(name)?;
      let c_name = CString::new(name).map_err(|_| RegionError::InvalidName(name.to_string()))?;

      // SAFETY: c_name is a valid null-terminated CString; mode is ignored without O_CREAT.
      let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
      if fd < 0 {
         return Err(RegionError::Open(io::Error::last_os_error()));
      }

      // Mapping past the end of the object would fault on first touch.
      // SAFETY: fd is valid; stat is a plain out-parameter.
      let actual = unsafe {
         let mut stat: libc::stat = std::mem::zeroed();
         if libc::fstat(fd, &mut stat) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(RegionError::Open(err));
         }
         stat.st_size as usize
      };
      if actual < size {
         // SAFETY: fd is valid and not used again.
         unsafe { libc::close(fd) };
         return Err(RegionError::TooSmall {
            size: actual,
            required: size,
         });
      }

      let ptr = map(fd, size)?;
      Ok(Self {
         ptr,
         size,
         name: name.to_string(),
         owner: false,
      })
   }
}

#[cfg(not(unix))]
impl SharedMemoryRegion {
   /// Shared memory is unavailable on this target.
   ///
   /// # Errors
   ///
   /// Always returns [`RegionError::Unsupported`].
   pub fn open_or_create(tag: &str, size: usize) -> RegionResult<Self> {
      Self::create(tag, size)
   }

   /// Shared memory is unavailable on this target.
   ///
   /// # Errors
   ///
   /// Always returns [`RegionError::Unsupported`].
   pub fn create(tag: &str, _size: usize) -> RegionResult<Self> {
      Self::validate_name(&Self::object_name(tag, std::process::id()))?;
      Err(RegionError::Unsupported)
   }

   /// Shared memory is unavailable on this target.
   pub fn open(_tag: &str, _size: usize) -> Option<Self> {
      None
   }
}

impl Drop for SharedMemoryRegion {
   fn drop(&mut self) {
      #[cfg(unix)]
      {
         // SAFETY: ptr/size come from a successful mmap and are unmapped exactly once.
         unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
         }
         if self.owner {
            if let Ok(c_name) = CString::new(self.name.as_str()) {
               // SAFETY: c_name is a valid CString; unlink only affects the namespace.
               unsafe { libc::shm_unlink(c_name.as_ptr()) };
               log::debug!("[once] unlinked shared region {}", self.name);
            }
            OWNED.lock().retain(|owned| *owned != self.name);
         }
      }
   }
}

/// Maps `size` bytes of `fd` shared and read/write, then closes `fd`.
#[cfg(unix)]
fn map(fd: libc::c_int, size: usize) -> RegionResult<*mut u8> {
   // SAFETY:
   // - a null hint lets the kernel pick a page-aligned address
   // - fd is valid; the mapping keeps its own reference so closing it afterwards is fine
   let ptr = unsafe {
      let ptr = libc::mmap(
         ptr::null_mut(),
         size,
         libc::PROT_READ | libc::PROT_WRITE,
         libc::MAP_SHARED,
         fd,
         0,
      );
      libc::close(fd);
      ptr
   };
   if ptr == libc::MAP_FAILED {
      return Err(RegionError::Mmap(io::Error::last_os_error()));
   }
   Ok(ptr.cast::<u8>())
}

/// Objects in `/dev/shm` named `{tag}_{pid}`, with their creator pid.
#[cfg(unix)]
fn list_regions(tag: &str) -> Vec<(String, u32)> {
   let Ok(entries) = std::fs::read_dir(SHM_DIR) else {
      return Vec::new();
   };
   let prefix = format!("{tag}_");
   entries
      .flatten()
      .filter_map(|entry| {
         let file_name = entry.file_name();
         let name = file_name.to_str()?;
         let pid = name.strip_prefix(&prefix)?.parse().ok()?;
         Some((format!("/{name}"), pid))
      })
      .collect()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
   let Ok(pid) = libc::pid_t::try_from(pid) else {
      return false;
   };
   // SAFETY: Signal 0 performs the permission and existence check only.
   if unsafe { libc::kill(pid, 0) } == 0 {
      return true;
   }
   io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether the object `name` created by `pid` can no longer have a creator.
#[cfg(unix)]
fn is_stale(name: &str, pid: u32) -> bool {
   if pid == std::process::id() {
      return !OWNED.lock().iter().any(|owned| owned == name);
   }
   !process_alive(pid)
}

/// Removes regions for `tag` whose creator is gone. Caller holds the tag lock.
#[cfg(unix)]
fn remove_stale(tag: &str) -> usize {
   let mut cleaned = 0;
   for (name, pid) in list_regions(tag) {
      if !is_stale(&name, pid) {
         continue;
      }
      let Ok(c_name) = CString::new(name.as_str()) else {
         continue;
      };
      // SAFETY: c_name is a valid CString.
      if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
         log::debug!("[once] cleaned up stale region {name}");
         cleaned += 1;
      }
   }
   cleaned
}

/// Removes regions for `tag` whose creating process no longer exists.
///
/// Returns the number of objects unlinked.
#[cfg(unix)]
pub fn cleanup_stale_regions(tag: &str) -> usize {
   match TagLock::acquire(tag) {
      Ok(_lock) => remove_stale(tag),
      Err(e) => {
         log::warn!("[once] skipping stale region cleanup for {tag}: {e}");
         0
      }
   }
}

/// Exclusive advisory lock over lookup and creation of one tag's region.
#[cfg(unix)]
struct TagLock(File);

#[cfg(unix)]
impl TagLock {
   fn acquire(tag: &str) -> RegionResult<Self> {
      SharedMemoryRegion::validate_name(&SharedMemoryRegion::object_name(tag, 0))?;
      let file = OpenOptions::new()
         .read(true)
         .write(true)
         .create(true)
         .truncate(false)
         .mode(0o600)
         .open(lock_path(tag))
         .map_err(RegionError::Lock)?;
      loop {
         // SAFETY: The descriptor is owned by `file` and stays open for the call.
         if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
            return Ok(Self(file));
         }
         let err = io::Error::last_os_error();
         if err.kind() != io::ErrorKind::Interrupted {
            return Err(RegionError::Lock(err));
         }
      }
   }
}

#[cfg(unix)]
impl Drop for TagLock {
   fn drop(&mut self) {
      // SAFETY: The descriptor is still owned by `self.0`; closing it would
      // release the lock as well.
      unsafe { libc::flock(self.0.as_raw_fd(), libc::LOCK_UN) };
   }
}

/// Lock file for `tag`: beside the shm objects when `/dev/shm` exists.
#[cfg(unix)]
fn lock_path(tag: &str) -> PathBuf {
   let dir = Path::new(SHM_DIR);
   let dir = if dir.is_dir() {
      dir.to_path_buf()
   } else {
      std::env::temp_dir()
   };
   dir.join(format!("{tag}.lock"))
}

/// No shared memory on this target, so nothing is ever stale.
#[cfg(not(unix))]
pub fn cleanup_stale_regions(_tag: &str) -> usize {
   0
}
