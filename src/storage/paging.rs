//! # Paged region
//!
//! A [`PageAllocator`] reserves a large range of address space up front and commits it one page
//! at a time, so containers can grow in place without ever moving. Pages are either anonymous
//! (zero-filled memory) or mapped from the backing files of a [`FileGraph`].
//!
//! Each page carries two independent bits:
//!
//! - *occupied*: the page has backing storage in a file;
//! - *loaded*: the page is committed and addressable in this process.
//!
//! Anonymous pages become loaded without ever being occupied. A file-backed page that was
//! committed by an earlier process starts out occupied but not loaded.

use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::ptr;
use std::slice;

use fixedbitset::FixedBitSet;

use super::file_graph::FileGraph;
use super::vfs;
use crate::append::Ensure;
use crate::config::{MAX_RESERVATION, PAGE_COUNT, PAGE_SIZE, UID_SHIFT};
use crate::error::{Error, Result};

/// How the pages of a region are backed.
#[derive(Debug)]
pub enum Style {
  /// A growable heap buffer. The region may move as it grows; meant for tests.
  Heap,
  /// Anonymous memory inside a fixed reservation.
  Anonymous,
  /// Pages mapped from the backing files of a store.
  FileBacked(FileGraph<vfs::StandardFileSystem>),
}

/// Byte counts reported by [`PageAllocator::sizes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSizes {
  /// Bytes with backing storage in a file.
  pub occupied: usize,
  /// Bytes committed in this process.
  pub loaded: usize,
  /// Bytes of committed pages currently resident in physical memory.
  pub resident: usize,
}

/// An address-space reservation of [`MAX_RESERVATION`] bytes, with the usable region aligned to
/// [`UID_SHIFT`] inside it.
#[derive(Debug)]
struct Reservation {
  base: *mut libc::c_void,
  region: *mut u8,
}

// The reservation is only touched through `&mut PageAllocator` or `&PageAllocator`.
unsafe impl Send for Reservation {}

fn os_page_size() -> usize {
  // SAFETY: sysconf has no preconditions.
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size > 0 {
    size as usize
  } else {
    4096
  }
}

impl Reservation {
  fn new() -> Result<Reservation> {
    // SAFETY: a fresh anonymous mapping with no access rights does not alias anything.
    let base = unsafe {
      libc::mmap(
        ptr::null_mut(),
        MAX_RESERVATION,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };
    if base == libc::MAP_FAILED {
      return Err(Error::Reserve { size: MAX_RESERVATION, source: io::Error::last_os_error() });
    }
    let start = base as usize;
    let aligned = start.next_multiple_of(UID_SHIFT);
    // SAFETY: `aligned - start < UID_SHIFT`, and the reservation is `2 * UID_SHIFT` long.
    let region = unsafe { base.cast::<u8>().add(aligned - start) };
    tracing::debug!(base = start, region = aligned, "reserved address space");
    Ok(Reservation { base, region })
  }

  fn page_ptr(&self, page: usize) -> *mut u8 {
    debug_assert!(page < PAGE_COUNT);
    // SAFETY: every page index below PAGE_COUNT lies inside the aligned window.
    unsafe { self.region.add(page * PAGE_SIZE) }
  }

  fn commit_anonymous(&self, page: usize) -> Result<()> {
    // SAFETY: the page lies inside our reservation.
    let result = unsafe { libc::mprotect(self.page_ptr(page).cast(), PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE) };
    if result != 0 {
      return Err(Error::Commit { page, source: io::Error::last_os_error() });
    }
    Ok(())
  }

  fn commit_file(&self, page: usize, file: &fs::File, byte_offset: u64) -> Result<()> {
    let offset = libc::off_t::try_from(byte_offset)
      .map_err(|err| Error::Commit { page, source: io::Error::new(io::ErrorKind::InvalidInput, err) })?;
    let target = self.page_ptr(page);
    // SAFETY: MAP_FIXED replaces part of our own reservation, which nothing else refers to while
    // the page is unloaded.
    let mapped = unsafe {
      libc::mmap(
        target.cast(),
        PAGE_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED,
        file.as_raw_fd(),
        offset,
      )
    };
    if mapped == libc::MAP_FAILED {
      return Err(Error::Commit { page, source: io::Error::last_os_error() });
    }
    if mapped.cast::<u8>() != target {
      return Err(Error::Commit { page, source: io::Error::other("mapping landed at the wrong address") });
    }
    Ok(())
  }

  fn sync(&self, page: usize) -> io::Result<()> {
    // SAFETY: the page is loaded, so the range is mapped.
    let result = unsafe { libc::msync(self.page_ptr(page).cast(), PAGE_SIZE, libc::MS_SYNC) };
    if result != 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }

  fn advise_dontneed(&self, page: usize) -> io::Result<()> {
    // SAFETY: the page is loaded and file-backed; its contents are reloaded from the file.
    let result = unsafe { libc::madvise(self.page_ptr(page).cast(), PAGE_SIZE, libc::MADV_DONTNEED) };
    if result != 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }

  fn resident_bytes(&self, page: usize, os_page: usize) -> io::Result<usize> {
    let mut residency = vec![0u8; PAGE_SIZE.div_ceil(os_page)];
    // SAFETY: the page is loaded and the vector holds one byte per OS page.
    let result = unsafe { libc::mincore(self.page_ptr(page).cast(), PAGE_SIZE, residency.as_mut_ptr().cast()) };
    if result != 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(residency.iter().filter(|x| **x & 1 != 0).count() * os_page)
  }
}

impl Drop for Reservation {
  fn drop(&mut self) {
    // SAFETY: `base` came from mmap with this length and is not used after this point.
    let result = unsafe { libc::munmap(self.base, MAX_RESERVATION) };
    if result != 0 {
      tracing::warn!(error = %io::Error::last_os_error(), "failed to release address space");
    }
  }
}

#[derive(Debug)]
enum Backing {
  Heap(Vec<u8>),
  Mapped { reservation: Reservation, file_graph: Option<FileGraph<vfs::StandardFileSystem>> },
}

/// # Lazily committed paged region
///
/// Offsets are relative to the start of the usable region, which is [`UID_SHIFT`] bytes long.
/// The allocator is `Send` but not `Sync`; a single writer owns it.
#[derive(Debug)]
pub struct PageAllocator {
  backing: Backing,
  occupied: FixedBitSet,
  loaded: FixedBitSet,
  /// Committed position for styles without a FileGraph.
  position: u64,
}

fn page_range(offset: usize, len: usize) -> std::ops::Range<usize> {
  offset / PAGE_SIZE..(offset + len).div_ceil(PAGE_SIZE)
}

impl PageAllocator {
  /// Reserves a region. A file-backed region starts with every page the store already holds
  /// marked occupied; none are loaded until touched.
  pub fn reserve(style: Style) -> Result<PageAllocator> {
    let mut occupied = FixedBitSet::with_capacity(PAGE_COUNT);
    let backing = match style {
      Style::Heap => Backing::Heap(Vec::new()),
      Style::Anonymous => Backing::Mapped { reservation: Reservation::new()?, file_graph: None },
      Style::FileBacked(graph) => {
        for page in 0..PAGE_COUNT {
          occupied.set(page, graph.is_page_in_file(page));
        }
        Backing::Mapped { reservation: Reservation::new()?, file_graph: Some(graph) }
      }
    };
    Ok(PageAllocator { backing, occupied, loaded: FixedBitSet::with_capacity(PAGE_COUNT), position: 0 })
  }

  pub fn is_file_backed(&self) -> bool {
    matches!(self.backing, Backing::Mapped { file_graph: Some(_), .. })
  }

  pub fn file_graph(&self) -> Option<&FileGraph<vfs::StandardFileSystem>> {
    match &self.backing {
      Backing::Mapped { file_graph, .. } => file_graph.as_ref(),
      Backing::Heap(_) => None,
    }
  }

  pub fn file_graph_mut(&mut self) -> Option<&mut FileGraph<vfs::StandardFileSystem>> {
    match &mut self.backing {
      Backing::Mapped { file_graph, .. } => file_graph.as_mut(),
      Backing::Heap(_) => None,
    }
  }

  pub fn is_page_loaded(&self, page: usize) -> bool {
    self.loaded.contains(page)
  }

  pub fn is_page_occupied(&self, page: usize) -> bool {
    self.occupied.contains(page)
  }

  fn check_range(offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
      Some(end) if end <= UID_SHIFT => Ok(()),
      _ => Err(Error::PageOutOfRange { page: offset.saturating_add(len) / PAGE_SIZE }),
    }
  }

  fn commit_page(&mut self, page: usize) -> Result<()> {
    match &mut self.backing {
      Backing::Heap(data) => {
        let needed = (page + 1) * PAGE_SIZE;
        if data.len() < needed {
          data.resize(needed, 0);
        }
      }
      Backing::Mapped { reservation, file_graph: None } => reservation.commit_anonymous(page)?,
      Backing::Mapped { reservation, file_graph: Some(graph) } => {
        let location = graph.page_offset(page)?;
        let file = graph.std_file(location.file_index)?;
        reservation.commit_file(page, file, location.byte_offset)?;
        self.occupied.insert(page);
      }
    }
    self.loaded.insert(page);
    tracing::trace!(page, "committed page");
    Ok(())
  }

  /// Makes every page overlapping `offset..offset + len` loaded, and returns that range.
  ///
  /// Pages are committed independently, so a range may straddle pages with different backing.
  /// Committing an already loaded page does nothing.
  pub fn ensure_committed(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
    Self::check_range(offset, len)?;
    if len == 0 {
      return Ok(&mut []);
    }
    for page in page_range(offset, len) {
      if !self.loaded.contains(page) {
        self.commit_page(page)?;
      }
    }
    Ok(self.slice_mut(offset, len))
  }

  /// Returns `offset..offset + len` if every page in it is loaded.
  pub fn committed(&self, offset: usize, len: usize) -> Option<&[u8]> {
    Self::check_range(offset, len).ok()?;
    if len == 0 {
      return Some(&[]);
    }
    if page_range(offset, len).all(|page| self.loaded.contains(page)) {
      Some(self.slice(offset, len))
    } else {
      None
    }
  }

  /// Length of the run of loaded bytes starting at `offset`.
  fn loaded_extent(&self, offset: usize) -> usize {
    let mut page = offset / PAGE_SIZE;
    while page < PAGE_COUNT && self.loaded.contains(page) {
      page += 1;
    }
    (page * PAGE_SIZE).saturating_sub(offset)
  }

  /// The caller guarantees that the range is loaded.
  fn slice(&self, offset: usize, len: usize) -> &[u8] {
    if len == 0 {
      return &[];
    }
    match &self.backing {
      Backing::Heap(data) => &data[offset..offset + len],
      // SAFETY: loaded pages are readable and writable, and the borrow of `self` keeps them
      // mapped for the lifetime of the slice.
      Backing::Mapped { reservation, .. } => unsafe { slice::from_raw_parts(reservation.region.add(offset), len) },
    }
  }

  /// The caller guarantees that the range is loaded.
  fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
    if len == 0 {
      return &mut [];
    }
    match &mut self.backing {
      Backing::Heap(data) => &mut data[offset..offset + len],
      // SAFETY: as in `slice`, and the exclusive borrow of `self` rules out aliasing.
      Backing::Mapped { reservation, .. } => unsafe {
        slice::from_raw_parts_mut(reservation.region.add(offset), len)
      },
    }
  }

  /// Writes every loaded file-backed page to disk, then the FileGraph prefix.
  pub fn flush(&mut self) -> Result<()> {
    if let Backing::Mapped { reservation, file_graph: Some(graph) } = &mut self.backing {
      for page in self.loaded.ones() {
        reservation.sync(page)?;
      }
      graph.flush()?;
    }
    Ok(())
  }

  /// Flushes, then asks the OS to drop the physical pages of every loaded file-backed page.
  /// Later accesses fault the data back in from the files. Does nothing for other styles.
  pub fn page_out(&mut self) -> Result<()> {
    if !self.is_file_backed() {
      return Ok(());
    }
    self.flush()?;
    if let Backing::Mapped { reservation, .. } = &self.backing {
      for page in self.loaded.ones() {
        if let Err(err) = reservation.advise_dontneed(page) {
          tracing::warn!(page, error = %err, "page out declined");
        }
      }
    }
    Ok(())
  }

  pub fn committed_position(&self) -> u64 {
    match self.file_graph() {
      Some(graph) => graph.committed_position(),
      None => self.position,
    }
  }

  /// Advances the committed position and flushes. Moving it backwards is an error.
  pub fn commit(&mut self, position: u64) -> Result<()> {
    match self.file_graph_mut() {
      Some(graph) => graph.set_committed_position(position)?,
      None => {
        if position < self.position {
          return Err(Error::CommittedPositionDecrease { current: self.position, requested: position });
        }
        self.position = position;
      }
    }
    self.flush()
  }

  /// Flushes and releases the reservation.
  pub fn destroy(mut self) -> Result<()> {
    self.flush()
  }

  pub fn sizes(&self) -> RegionSizes {
    let occupied = self.occupied.count_ones(..) * PAGE_SIZE;
    let loaded = self.loaded.count_ones(..) * PAGE_SIZE;
    let resident = match &self.backing {
      Backing::Heap(_) => loaded,
      Backing::Mapped { reservation, .. } => {
        let os_page = os_page_size();
        let mut resident = 0;
        for page in self.loaded.ones() {
          match reservation.resident_bytes(page, os_page) {
            Ok(bytes) => resident += bytes,
            Err(err) => tracing::debug!(page, error = %err, "residency query failed"),
          }
        }
        resident
      }
    };
    RegionSizes { occupied, loaded, resident }
  }

  /// Copies `from..to` out of the region. Every page in the range must be loaded or occupied.
  pub fn create_diff(&mut self, from: usize, to: usize) -> Result<Vec<u8>> {
    if to < from {
      return Err(Error::OutOfRange);
    }
    Self::check_range(from, to - from)?;
    if to > from {
      let available = |page| self.loaded.contains(page) || self.occupied.contains(page);
      if !page_range(from, to - from).all(available) {
        return Err(Error::OutOfRange);
      }
    }
    Ok(self.ensure_committed(from, to - from)?.to_vec())
  }

  /// Writes `bytes` at `at`, committing pages as needed.
  pub fn apply_diff(&mut self, at: usize, bytes: &[u8]) -> Result<()> {
    self.ensure_committed(at, bytes.len())?.copy_from_slice(bytes);
    Ok(())
  }

  /// Opens a container region starting at `offset`. Occupied pages following `offset` are
  /// loaded so that an existing container can be read back.
  pub fn slot(&mut self, offset: usize) -> Result<PagedSlot<'_>> {
    Self::check_range(offset, 0)?;
    let mut page = offset / PAGE_SIZE;
    while page < PAGE_COUNT && (self.loaded.contains(page) || self.occupied.contains(page)) {
      if !self.loaded.contains(page) {
        self.commit_page(page)?;
      }
      page += 1;
    }
    let len = self.loaded_extent(offset);
    Ok(PagedSlot { allocator: self, offset, len })
  }
}

impl Drop for PageAllocator {
  fn drop(&mut self) {
    if let Err(err) = self.flush() {
      tracing::warn!(error = %err, "failed to flush paged region on close");
    }
  }
}

/// A container region inside a [`PageAllocator`], spanning from its start offset to the end of
/// the loaded pages that follow it.
#[derive(Debug)]
pub struct PagedSlot<'a> {
  allocator: &'a mut PageAllocator,
  offset: usize,
  len: usize,
}

impl PagedSlot<'_> {
  pub fn offset(&self) -> usize {
    self.offset
  }
}

impl Ensure for PagedSlot<'_> {
  fn bytes(&self) -> &[u8] {
    self.allocator.slice(self.offset, self.len)
  }

  fn bytes_mut(&mut self) -> Result<&mut [u8]> {
    Ok(self.allocator.slice_mut(self.offset, self.len))
  }

  fn ensure(&mut self, len: usize) -> Result<&mut [u8]> {
    if self.len < len {
      self.allocator.ensure_committed(self.offset, len)?;
      self.len = self.allocator.loaded_extent(self.offset);
    }
    Ok(self.allocator.slice_mut(self.offset, self.len))
  }

  fn release(&mut self, _len: usize) -> Result<()> {
    Ok(())
  }
}
