//! # Whole-file regions
//!
//! A [`WholeFileMapping`] is a single growable byte region, either anonymous or mapped from one
//! backing file. It is not paged: growth remaps the whole region, which may move it. The logical
//! head (bytes in use) is tracked separately from the capacity, which doubles on growth.
//!
//! Two locks guard the region. The *grow* lock is exclusive and is held by the single writer for
//! as long as its [`Writer`] lives. The *access* lock is shared by readers and the writer, and is
//! only taken exclusively while the mapping is being replaced. A writer always takes the grow
//! lock before the access lock; [`WholeFileMapping::acquire_writer`] is the only way to obtain
//! one.

use std::fs;
use std::ops;
use std::sync::atomic;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions, MmapRaw};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::file_graph::{FileGraph, WholeFileName};
use super::vfs;
use crate::append::Ensure;
use crate::error::{Error, Result};

/// Capacity of a freshly created region.
const INITIAL_CAPACITY: usize = 4096;

#[derive(Debug)]
struct Mapping {
  map: MmapRaw,
  file: Option<fs::File>,
}

impl Mapping {
  fn capacity(&self) -> usize {
    self.map.len()
  }

  /// Grows the mapping to `capacity` bytes. The backing file is extended first.
  ///
  /// Callers hold the access lock exclusively, so no slice into the old mapping is alive.
  fn grow(&mut self, capacity: usize) -> Result<()> {
    let remap_error = |source| Error::Remap { size: capacity, source };
    if let Some(file) = &self.file {
      file.set_len(capacity as u64)?;
    }

    #[cfg(target_os = "linux")]
    {
      use memmap2::RemapOptions;
      // SAFETY: the exclusive access lock guarantees there are no outstanding references into
      // the mapping.
      if unsafe { self.map.remap(capacity, RemapOptions::new().may_move(false)) }.is_ok() {
        return Ok(());
      }
      // SAFETY: as above.
      unsafe { self.map.remap(capacity, RemapOptions::new().may_move(true)) }.map_err(remap_error)?;
      tracing::debug!(capacity, "moved whole-file region");
      Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
      let map = match &self.file {
        Some(file) => MmapOptions::new().len(capacity).map_raw(file).map_err(remap_error)?,
        None => {
          let map = MmapRaw::from(MmapMut::map_anon(capacity).map_err(remap_error)?);
          // SAFETY: both mappings are live and at least `self.map.len()` bytes long, and the new
          // one is not shared with anything yet.
          unsafe { std::ptr::copy_nonoverlapping(self.map.as_ptr(), map.as_mut_ptr(), self.map.len()) };
          map
        }
      };
      self.map = map;
      tracing::debug!(capacity, "moved whole-file region");
      Ok(())
    }
  }
}

/// # Whole-file mapping
#[derive(Debug)]
pub struct WholeFileMapping {
  grow: Mutex<()>,
  access: RwLock<Mapping>,
  head: Arc<atomic::AtomicU64>,
}

impl WholeFileMapping {
  /// Creates an anonymous region with an empty head.
  pub fn anonymous() -> Result<WholeFileMapping> {
    let map = MmapRaw::from(MmapMut::map_anon(INITIAL_CAPACITY)?);
    Ok(WholeFileMapping {
      grow: Mutex::new(()),
      access: RwLock::new(Mapping { map, file: None }),
      head: Arc::new(atomic::AtomicU64::new(0)),
    })
  }

  /// Maps all of `file`. The head is shared with whoever persists it.
  pub fn from_file(file: fs::File, head: Arc<atomic::AtomicU64>) -> Result<WholeFileMapping> {
    let size = file.metadata()?.len();
    let used = head.load(atomic::Ordering::Acquire);
    if used > size {
      return Err(Error::Truncated { needed: used as usize, available: size as usize });
    }
    let capacity = size.max(INITIAL_CAPACITY as u64);
    if size < capacity {
      file.set_len(capacity)?;
    }
    let map = MmapOptions::new().len(capacity as usize).map_raw(&file)?;
    Ok(WholeFileMapping {
      grow: Mutex::new(()),
      access: RwLock::new(Mapping { map, file: Some(file) }),
      head,
    })
  }

  /// Maps the named region of a store, allocating its backing file on first use.
  pub fn open(graph: &mut FileGraph<vfs::StandardFileSystem>, name: WholeFileName) -> Result<WholeFileMapping> {
    let descriptor = graph.whole_file_descriptor(name)?;
    let file = graph.std_file(descriptor.file_index)?.try_clone()?;
    tracing::debug!(?name, path = %descriptor.path.display(), "mapping whole-file region");
    WholeFileMapping::from_file(file, descriptor.head)
  }

  pub fn head(&self) -> u64 {
    self.head.load(atomic::Ordering::Acquire)
  }

  pub fn capacity(&self) -> usize {
    self.access.read().capacity()
  }

  /// Returns a view of the bytes below the current head. Only the shared access lock is held.
  pub fn acquire_reader(&self) -> Reader<'_> {
    let guard = self.access.read();
    let len = self.head() as usize;
    Reader { guard, len }
  }

  /// Returns the single writer, blocking until any other writer is gone.
  pub fn acquire_writer(&self) -> Writer<'_> {
    let grow = self.grow.lock();
    let access = self.access.read();
    Writer { access: Some(access), _grow: grow, owner: self }
  }

  /// Writes mapped bytes back to the file. Does nothing for anonymous regions.
  pub fn flush(&self) -> Result<()> {
    let mapping = self.access.read();
    if mapping.file.is_some() {
      mapping.map.flush()?;
    }
    Ok(())
  }
}

impl Drop for WholeFileMapping {
  fn drop(&mut self) {
    if let Err(err) = self.flush() {
      tracing::warn!(error = %err, "failed to flush whole-file region on close");
    }
  }
}

/// Shared view of a [`WholeFileMapping`], up to the head at the time it was acquired.
pub struct Reader<'a> {
  guard: RwLockReadGuard<'a, Mapping>,
  len: usize,
}

impl ops::Deref for Reader<'_> {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    // SAFETY: the head never exceeds the capacity, and the read guard keeps the mapping alive and
    // in place.
    unsafe { std::slice::from_raw_parts(self.guard.map.as_ptr(), self.len) }
  }
}

/// Exclusive writer of a [`WholeFileMapping`].
pub struct Writer<'a> {
  // Dropped before `_grow`, so the access lock is released first.
  access: Option<RwLockReadGuard<'a, Mapping>>,
  _grow: MutexGuard<'a, ()>,
  owner: &'a WholeFileMapping,
}

impl Writer<'_> {
  fn mapping(&self) -> &Mapping {
    match &self.access {
      Some(access) => access,
      None => unreachable!("access lock is only released while growing"),
    }
  }

  pub fn head(&self) -> u64 {
    self.owner.head()
  }

  pub fn capacity(&self) -> usize {
    self.mapping().capacity()
  }

  /// Moves the head to `new_head`, growing the region if it does not fit. Moving the head
  /// backwards fails unless `allow_shrink` is set.
  pub fn ensure_head(&mut self, new_head: u64, allow_shrink: bool) -> Result<()> {
    let head = self.head();
    if new_head < head && !allow_shrink {
      return Err(Error::ShrinkRejected { head, requested: new_head });
    }
    let needed = usize::try_from(new_head).map_err(|_| Error::OutOfRange)?;
    let capacity = self.capacity();
    if needed > capacity {
      self.grow(needed.max(capacity.saturating_mul(2)))?;
    }
    self.owner.head.store(new_head, atomic::Ordering::Release);
    Ok(())
  }

  fn grow(&mut self, capacity: usize) -> Result<()> {
    drop(self.access.take());
    let mut exclusive = self.owner.access.write();
    let result = exclusive.grow(capacity);
    self.access = Some(RwLockWriteGuard::downgrade(exclusive));
    result
  }

  fn slice_mut(&mut self, len: usize) -> &mut [u8] {
    // SAFETY: `len` is at most the head, which never exceeds the capacity. Readers only look below
    // the head they observed, and the grow lock makes this the only writer.
    unsafe { std::slice::from_raw_parts_mut(self.mapping().map.as_mut_ptr(), len) }
  }
}

impl Ensure for Writer<'_> {
  fn bytes(&self) -> &[u8] {
    // SAFETY: as in `Reader::deref`.
    unsafe { std::slice::from_raw_parts(self.mapping().map.as_ptr(), self.head() as usize) }
  }

  fn bytes_mut(&mut self) -> Result<&mut [u8]> {
    let len = self.head() as usize;
    Ok(self.slice_mut(len))
  }

  fn ensure(&mut self, len: usize) -> Result<&mut [u8]> {
    if (self.head() as usize) < len {
      self.ensure_head(len as u64, false)?;
    }
    self.bytes_mut()
  }

  fn release(&mut self, len: usize) -> Result<()> {
    self.ensure_head(len as u64, true)
  }
}
