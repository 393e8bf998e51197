//! # Geometry constants and open-time configuration

use std::io;
use std::path;

use crate::error::Result;
use crate::storage::file_graph;
use crate::storage::paging;
use crate::storage::vfs;

/// Size of a single page in the paged region, and the unit by which backing files grow.
pub const PAGE_SIZE: usize = 1 << 20;

/// Alignment of the usable region, and also its length.
pub const UID_SHIFT: usize = 1 << 30;

/// Size of the address-space reservation. Twice the usable length, so an aligned window of
/// `UID_SHIFT` bytes always fits inside it.
pub const MAX_RESERVATION: usize = 2 * UID_SHIFT;

/// Number of pages in the usable region.
pub const PAGE_COUNT: usize = UID_SHIFT / PAGE_SIZE;

/// Configuration for opening a file-backed graph.
#[derive(Debug, Clone)]
pub struct Config {
  /// Backing files are named `<path_prefix>_NNNNN.<extension>`.
  pub path_prefix: path::PathBuf,
  /// File name extension of the backing files.
  pub extension: String,
  /// Delete and recreate the store when it cannot be loaded, instead of failing. Lock
  /// contention is never treated as a reason to recreate.
  pub fallback_to_fresh: bool,
  /// Always start from an empty store, deleting whatever is on disk.
  pub force_fresh: bool,
  /// Loading fails when the stored committed position is below this value.
  pub min_committed_position: u64,
  /// Page data moves on to a new backing file once the current one holds this many pages.
  pub pages_per_file: u64,
}

impl Default for Config {
  fn default() -> Config {
    Config {
      path_prefix: "".into(),
      extension: "pagegraph".to_owned(),
      fallback_to_fresh: false,
      force_fresh: false,
      min_committed_position: 0,
      pages_per_file: PAGE_COUNT as u64,
    }
  }
}

impl Config {
  /// Creates a configuration for the store at `path_prefix`, all other fields taking defaults.
  pub fn new(path_prefix: impl Into<path::PathBuf>) -> Config {
    Config { path_prefix: path_prefix.into(), ..Config::default() }
  }

  pub(crate) fn validate(&self) -> Result<()> {
    if self.path_prefix.file_name().is_none() {
      return Err(io::Error::new(io::ErrorKind::Unsupported, "Config's path_prefix must name a file").into());
    }

    if self.extension.is_empty() || self.extension.contains(path::MAIN_SEPARATOR) {
      let message = "Config's extension must be a plain non-empty name";
      return Err(io::Error::new(io::ErrorKind::Unsupported, message).into());
    }

    if self.pages_per_file == 0 {
      return Err(io::Error::new(io::ErrorKind::Unsupported, "Config's pages_per_file must be non-zero").into());
    }

    Ok(())
  }

  /// Opens (or creates) the store on the standard file system and reserves a file-backed paged
  /// region over it.
  pub fn open(&self, uid: file_graph::GraphUid) -> Result<paging::PageAllocator> {
    let graph = file_graph::FileGraph::open_or_create(vfs::StandardFileSystem, self, uid)?;
    paging::PageAllocator::reserve(paging::Style::FileBacked(graph))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_geometry() {
    assert_eq!(PAGE_COUNT * PAGE_SIZE, UID_SHIFT);
    assert_eq!(UID_SHIFT % PAGE_SIZE, 0);
    assert!(MAX_RESERVATION >= 2 * UID_SHIFT);
  }

  #[test]
  fn test_validate() {
    Config::new("graph").validate().unwrap();
    Config::default().validate().unwrap_err();
    Config { extension: String::new(), ..Config::new("graph") }.validate().unwrap_err();
    Config { pages_per_file: 0, ..Config::new("graph") }.validate().unwrap_err();
  }
}
