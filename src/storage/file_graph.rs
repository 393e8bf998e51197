//! # FileGraph
//!
//! The on-disk side of a file-backed graph: a versioned superblock (the *prefix*) at the start of
//! file 0, and a page table that says which backing file and in-file page holds each page of the
//! paged region.

#![doc = include_str!("../../doc/file_format.md")]

use std::collections;
use std::fmt;
use std::io;
use std::mem;
use std::path;
use std::sync::atomic;
use std::sync::Arc;

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::vfs;
use super::vfs::File as _;
use crate::config::{Config, PAGE_COUNT, PAGE_SIZE};
use crate::error::{Error, Result};

/// Format version written by this build.
pub const DEFAULT_VERSION: u32 = 6;

/// Oldest format version that can still be loaded and upgraded.
pub const OLDEST_VERSION: u32 = 4;

/// Marks an unused page-table or descriptor slot.
const INVALID: u64 = u64::MAX;

/// Identity of a graph, checked every time its store is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphUid(pub [u8; 16]);

impl GraphUid {
  /// Generates a fresh random identity.
  pub fn random() -> GraphUid {
    GraphUid(rand::random())
  }
}

impl fmt::Display for GraphUid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in self.0 {
      write!(f, "{:02x}", byte)?;
    }
    Ok(())
  }
}

/// Names of the auxiliary whole-file regions that a graph may own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WholeFileName {
  EntityTypeTokens,
  RelationTypeTokens,
  EnumTokens,
  UidLookup,
  EuidLookup,
  TagLookup,
  /// Present from format version 5.
  ValueHashLookup,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PageEntry {
  file_index: U64,
  /// In pages, from the start of the file.
  offset: U64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct WholeFileEntry {
  file_index: U64,
  head: U64,
}

const UNUSED_PAGE: PageEntry = PageEntry { file_index: U64::new(INVALID), offset: U64::new(INVALID) };
const UNUSED_WHOLE_FILE: WholeFileEntry = WholeFileEntry { file_index: U64::new(INVALID), head: U64::new(0) };

/// The superblock. Fields are only ever appended; see [`prefix_len`].
#[repr(C)]
#[derive(Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct Prefix {
  version: U32,
  reserved: [u8; 4],
  uid: [u8; 16],
  committed_position: U64,
  pages: [PageEntry; PAGE_COUNT],
  next_free_file_index: U64,
  whole_files: [WholeFileEntry; 6],
  // Version 5.
  value_hash_lookup: WholeFileEntry,
  // Version 6.
  page_file_index: U64,
}

const _: () = assert!(mem::size_of::<Prefix>() <= PAGE_SIZE);

/// Number of bytes a prefix of the given version occupies on disk.
fn prefix_len(version: u32) -> usize {
  match version {
    4 => mem::offset_of!(Prefix, value_hash_lookup),
    5 => mem::offset_of!(Prefix, page_file_index),
    _ => mem::size_of::<Prefix>(),
  }
}

/// Number of whole pages reserved for the prefix at the start of file 0.
const PREFIX_PAGES: u64 = mem::size_of::<Prefix>().div_ceil(PAGE_SIZE) as u64;

impl Prefix {
  fn fresh(uid: GraphUid) -> Box<Prefix> {
    let mut prefix = Box::new(Prefix::new_zeroed());
    prefix.version.set(DEFAULT_VERSION);
    prefix.uid = uid.0;
    prefix.pages = [UNUSED_PAGE; PAGE_COUNT];
    prefix.next_free_file_index.set(1);
    prefix.whole_files = [UNUSED_WHOLE_FILE; 6];
    prefix.value_hash_lookup = UNUSED_WHOLE_FILE;
    prefix.page_file_index.set(0);
    prefix
  }

  /// Fills in the fields that did not exist in `self.version`.
  fn upgrade(&mut self) {
    let from = self.version.get();
    if from < 5 {
      self.value_hash_lookup = UNUSED_WHOLE_FILE;
    }
    if from < 6 {
      self.page_file_index.set(0);
    }
    self.version.set(DEFAULT_VERSION);
  }

  fn whole_file(&mut self, name: WholeFileName) -> &mut WholeFileEntry {
    match name {
      WholeFileName::EntityTypeTokens => &mut self.whole_files[0],
      WholeFileName::RelationTypeTokens => &mut self.whole_files[1],
      WholeFileName::EnumTokens => &mut self.whole_files[2],
      WholeFileName::UidLookup => &mut self.whole_files[3],
      WholeFileName::EuidLookup => &mut self.whole_files[4],
      WholeFileName::TagLookup => &mut self.whole_files[5],
      WholeFileName::ValueHashLookup => &mut self.value_hash_lookup,
    }
  }
}

/// Where a page lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLocation {
  pub file_index: u64,
  /// In bytes, from the start of the file.
  pub byte_offset: u64,
}

/// Backing file and head of a named whole-file region.
#[derive(Debug, Clone)]
pub struct WholeFileDescriptor {
  pub file_index: u64,
  pub path: path::PathBuf,
  /// Shared with the mapping; the FileGraph persists its value on every flush.
  pub head: Arc<atomic::AtomicU64>,
  /// Whether the backing file was allocated by this call.
  pub fresh: bool,
}

fn corrupt(path: &path::Path, reason: String) -> Error {
  Error::Corrupt { path: path.to_path_buf(), reason }
}

/// Returns the name of backing file `index`: `<prefix>_NNNNN.<extension>`.
pub fn filename_with_index(path_prefix: &path::Path, index: u64, extension: &str) -> path::PathBuf {
  let mut name = path_prefix.as_os_str().to_owned();
  name.push(format!("_{:05}.{}", index, extension));
  path::PathBuf::from(name)
}

/// Returns whether file 0 of the store at `path_prefix` exists.
pub fn exists<FS: vfs::FileSystem<Error = io::Error>>(
  fs: &mut FS,
  path_prefix: &path::Path,
  extension: &str,
) -> Result<bool> {
  Ok(fs.exists(&filename_with_index(path_prefix, 0, extension))?)
}

/// Deletes every backing file of the store at `path_prefix`.
pub fn delete_files<FS: vfs::FileSystem<Error = io::Error>>(
  fs: &mut FS,
  path_prefix: &path::Path,
  extension: &str,
) -> Result<()> {
  let Some(stem) = path_prefix.file_name().and_then(|x| x.to_str()) else {
    return Ok(());
  };
  let dir = match path_prefix.parent() {
    Some(dir) if !dir.as_os_str().is_empty() => dir,
    _ => path::Path::new("."),
  };
  let start = format!("{}_", stem);
  let end = format!(".{}", extension);
  let listed = match fs.list(dir) {
    Ok(listed) => listed,
    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(err) => return Err(err.into()),
  };
  for path in listed {
    let Some(name) = path.file_name().and_then(|x| x.to_str()) else {
      continue;
    };
    if name.starts_with(&start) && name.ends_with(&end) {
      tracing::debug!(path = %path.display(), "deleting backing file");
      fs.delete(&path)?;
    }
  }
  Ok(())
}

/// # FileGraph
///
/// Owns the backing files of one graph. File 0 carries an advisory exclusive lock for as long as
/// the FileGraph is alive, so a second process cannot open the same store.
pub struct FileGraph<FS: vfs::FileSystem<Error = io::Error>> {
  fs: FS,
  path_prefix: path::PathBuf,
  extension: String,
  pages_per_file: u64,
  files: Vec<Option<FS::File>>,
  prefix: Box<Prefix>,
  heads: collections::HashMap<WholeFileName, Arc<atomic::AtomicU64>>,
  locked: bool,
}

impl<FS: vfs::FileSystem<Error = io::Error>> fmt::Debug for FileGraph<FS> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FileGraph")
      .field("path_prefix", &self.path_prefix)
      .field("version", &self.prefix.version.get())
      .field("uid", &GraphUid(self.prefix.uid))
      .field("committed_position", &self.prefix.committed_position.get())
      .finish()
  }
}

impl<FS: vfs::FileSystem<Error = io::Error>> FileGraph<FS> {
  /// Opens the store described by `config`, or creates it.
  ///
  /// An existing store is loaded unless `config.force_fresh` is set. If loading fails for any
  /// reason other than lock contention, the store is deleted and recreated when
  /// `config.fallback_to_fresh` is set; otherwise the error is returned.
  pub fn open_or_create(fs: FS, config: &Config, uid: GraphUid) -> Result<Self> {
    config.validate()?;
    let mut graph = FileGraph {
      fs,
      path_prefix: config.path_prefix.clone(),
      extension: config.extension.clone(),
      pages_per_file: config.pages_per_file,
      files: Vec::new(),
      prefix: Prefix::fresh(uid),
      heads: collections::HashMap::new(),
      locked: false,
    };

    if !config.force_fresh && exists(&mut graph.fs, &graph.path_prefix, &graph.extension)? {
      match graph.load(uid, config.min_committed_position) {
        Ok(()) => {
          tracing::info!(path = %graph.filename(0).display(), uid = %uid, "opened file graph");
          return Ok(graph);
        }
        Err(err) => {
          graph.close();
          if matches!(err, Error::Locked { .. }) || !config.fallback_to_fresh {
            return Err(err);
          }
          tracing::warn!(path = %graph.filename(0).display(), error = %err, "recreating unreadable file graph");
        }
      }
    }

    graph.create(uid)?;
    tracing::info!(path = %graph.filename(0).display(), uid = %uid, "created file graph");
    Ok(graph)
  }

  fn load(&mut self, uid: GraphUid, min_committed_position: u64) -> Result<()> {
    let path = self.filename(0);
    let mut file = self.fs.open(&path)?;
    if !file.try_lock()? {
      return Err(Error::Locked { path });
    }
    self.files = vec![Some(file)];
    self.locked = true;

    let file = self.file(0)?;
    let size = file.size()?;
    if size < PAGE_SIZE as u64 || size % PAGE_SIZE as u64 != 0 {
      return Err(corrupt(&path, format!("size {} is not a positive multiple of the page size", size)));
    }

    let mut version = [0u8; 4];
    file.read(0, &mut version)?;
    let version = u32::from_le_bytes(version);
    if version < OLDEST_VERSION {
      return Err(Error::WrongVersion { path: path.clone(), version, detail: "older than the oldest readable format" });
    }
    if version > DEFAULT_VERSION {
      return Err(Error::WrongVersion { path: path.clone(), version, detail: "newer than this build supports" });
    }

    let mut prefix = Box::new(Prefix::new_zeroed());
    file.read(0, &mut prefix.as_mut_bytes()[..prefix_len(version)])?;
    if version < DEFAULT_VERSION {
      prefix.upgrade();
      tracing::info!(path = %path.display(), from = version, to = DEFAULT_VERSION, "upgraded file graph prefix");
    }

    if prefix.uid != uid.0 {
      return Err(corrupt(&path, format!("stored graph uid {} does not match {}", GraphUid(prefix.uid), uid)));
    }
    let committed_position = prefix.committed_position.get();
    if committed_position < min_committed_position {
      let reason = format!("committed position {} is below the minimum {}", committed_position, min_committed_position);
      return Err(corrupt(&path, reason));
    }
    let next_free = prefix.next_free_file_index.get();
    if next_free == 0 {
      return Err(corrupt(&path, "next free file index is 0".to_owned()));
    }
    let dangling = prefix.pages.iter().any(|x| x.file_index.get() != INVALID && x.file_index.get() >= next_free);
    if dangling {
      return Err(corrupt(&path, "page table refers to an unallocated file".to_owned()));
    }

    self.prefix = prefix;
    Ok(())
  }

  fn create(&mut self, uid: GraphUid) -> Result<()> {
    delete_files(&mut self.fs, &self.path_prefix, &self.extension)?;
    self.prefix = Prefix::fresh(uid);

    let path = self.filename(0);
    let mut file = self.fs.open(&path)?;
    if !file.try_lock()? {
      return Err(Error::Locked { path });
    }
    self.files = vec![Some(file)];
    self.locked = true;

    let file = self.file(0)?;
    file.truncate(PREFIX_PAGES * PAGE_SIZE as u64)?;
    self.write_prefix()
  }

  /// Releases the lock and every open file without writing anything.
  fn close(&mut self) {
    if self.locked {
      if let Some(Some(file)) = self.files.first_mut() {
        if let Err(err) = file.unlock() {
          tracing::warn!(error = %err, "failed to unlock file graph");
        }
      }
      self.locked = false;
    }
    self.files.clear();
  }

  fn file(&mut self, index: u64) -> Result<&mut FS::File> {
    let slot = usize::try_from(index).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    if self.files.len() <= slot {
      self.files.resize_with(slot + 1, || None);
    }
    if self.files[slot].is_none() {
      let path = filename_with_index(&self.path_prefix, index, &self.extension);
      self.files[slot] = Some(self.fs.open(&path)?);
    }
    match &mut self.files[slot] {
      Some(file) => Ok(file),
      None => Err(io::Error::from(io::ErrorKind::NotFound).into()),
    }
  }

  fn take_file_index(&mut self) -> u64 {
    let index = self.prefix.next_free_file_index.get();
    self.prefix.next_free_file_index.set(index + 1);
    index
  }

  fn write_prefix(&mut self) -> Result<()> {
    for (name, head) in &self.heads {
      let value = head.load(atomic::Ordering::Acquire);
      self.prefix.whole_file(*name).head.set(value);
    }
    let prefix = self.prefix.clone();
    let file = self.file(0)?;
    file.write(0, prefix.as_bytes())?;
    file.sync()?;
    Ok(())
  }

  /// Format version of the prefix in memory. Always [`DEFAULT_VERSION`] after loading.
  pub fn version(&self) -> u32 {
    self.prefix.version.get()
  }

  pub fn uid(&self) -> GraphUid {
    GraphUid(self.prefix.uid)
  }

  pub fn path_prefix(&self) -> &path::Path {
    &self.path_prefix
  }

  /// Name of backing file `index`.
  pub fn filename(&self, index: u64) -> path::PathBuf {
    filename_with_index(&self.path_prefix, index, &self.extension)
  }

  pub fn committed_position(&self) -> u64 {
    self.prefix.committed_position.get()
  }

  /// Advances the committed position. Moving it backwards is an error; the value is kept.
  pub fn set_committed_position(&mut self, position: u64) -> Result<()> {
    let current = self.prefix.committed_position.get();
    if position < current {
      return Err(Error::CommittedPositionDecrease { current, requested: position });
    }
    self.prefix.committed_position.set(position);
    Ok(())
  }

  /// Whether page `index` already has backing storage.
  pub fn is_page_in_file(&self, index: usize) -> bool {
    self.prefix.pages.get(index).is_some_and(|x| x.file_index.get() != INVALID)
  }

  /// Number of pages backing file `index` currently holds, counting a partial page as whole.
  pub fn file_size_in_pages(&mut self, index: u64) -> Result<u64> {
    let size = self.file(index)?.size()?;
    Ok(size.div_ceil(PAGE_SIZE as u64))
  }

  /// Returns where page `index` lives, assigning it a fresh page at the end of the current page
  /// file if it has none yet. The file is extended before the assignment is recorded.
  pub fn page_offset(&mut self, index: usize) -> Result<PageLocation> {
    let entry = *self.prefix.pages.get(index).ok_or(Error::PageOutOfRange { page: index })?;
    if entry.file_index.get() != INVALID {
      return Ok(PageLocation {
        file_index: entry.file_index.get(),
        byte_offset: entry.offset.get() * PAGE_SIZE as u64,
      });
    }

    let mut file_index = self.prefix.page_file_index.get();
    let mut offset = self.file_size_in_pages(file_index)?;
    if offset >= self.pages_per_file {
      file_index = self.take_file_index();
      self.prefix.page_file_index.set(file_index);
      offset = self.file_size_in_pages(file_index)?;
      tracing::info!(file_index, path = %self.filename(file_index).display(), "moved page data to a new file");
    }

    self.file(file_index)?.truncate((offset + 1) * PAGE_SIZE as u64)?;
    self.prefix.pages[index] = PageEntry { file_index: U64::new(file_index), offset: U64::new(offset) };
    tracing::trace!(page = index, file_index, offset, "assigned page");
    Ok(PageLocation { file_index, byte_offset: offset * PAGE_SIZE as u64 })
  }

  /// Returns the descriptor of a named whole-file region, allocating its backing file on first
  /// use. Repeated calls share the same head.
  pub fn whole_file_descriptor(&mut self, name: WholeFileName) -> Result<WholeFileDescriptor> {
    let mut fresh = false;
    if self.prefix.whole_file(name).file_index.get() == INVALID {
      let file_index = self.take_file_index();
      let entry = self.prefix.whole_file(name);
      entry.file_index.set(file_index);
      entry.head.set(0);
      self.file(file_index)?;
      fresh = true;
      tracing::info!(?name, file_index, "allocated whole-file region");
    }

    let entry = *self.prefix.whole_file(name);
    let head = self
      .heads
      .entry(name)
      .or_insert_with(|| Arc::new(atomic::AtomicU64::new(entry.head.get())))
      .clone();
    let file_index = entry.file_index.get();
    Ok(WholeFileDescriptor { file_index, path: self.filename(file_index), head, fresh })
  }

  /// Writes the prefix, including current whole-file heads, and syncs every open file.
  pub fn flush(&mut self) -> Result<()> {
    self.write_prefix()?;
    for file in self.files.iter_mut().flatten() {
      file.sync()?;
    }
    Ok(())
  }
}

impl FileGraph<vfs::StandardFileSystem> {
  /// The OS file behind backing file `index`, for memory mapping.
  pub fn std_file(&mut self, index: u64) -> Result<&std::fs::File> {
    Ok(self.file(index)?.as_file())
  }
}

impl<FS: vfs::FileSystem<Error = io::Error>> Drop for FileGraph<FS> {
  fn drop(&mut self) {
    if self.locked {
      if let Err(err) = self.flush() {
        tracing::warn!(path = %self.filename(0).display(), error = %err, "failed to flush file graph on close");
      }
    }
    self.close();
  }
}
