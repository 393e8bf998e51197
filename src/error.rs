//! # Errors
//!
//! A single error type is shared by every layer of the crate. Variants are grouped the way
//! callers are expected to react to them: resource failures are fatal to the owning graph,
//! version and corruption failures can be recovered by recreating the store, contention is kept
//! apart so the caller may wait, and the remaining variants indicate misuse by a higher layer.

use std::io;
use std::path;

use crate::append::Kind;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  #[error("failed to reserve {size} bytes of address space: {source}")]
  Reserve { size: usize, source: io::Error },

  #[error("failed to commit page {page}: {source}")]
  Commit { page: usize, source: io::Error },

  #[error("failed to remap region to {size} bytes: {source}")]
  Remap { size: usize, source: io::Error },

  #[error("page {page} lies outside the reserved region")]
  PageOutOfRange { page: usize },

  #[error("{} is locked by another process", path.display())]
  Locked { path: path::PathBuf },

  #[error("{} has unsupported version {version}: {detail}", path.display())]
  WrongVersion { path: path::PathBuf, version: u32, detail: &'static str },

  #[error("{} is corrupt: {reason}", path.display())]
  Corrupt { path: path::PathBuf, reason: String },

  #[error("committed position cannot move from {current} back to {requested}")]
  CommittedPositionDecrease { current: u64, requested: u64 },

  #[error("duplicate item: {0}")]
  Duplicate(String),

  #[error("last item does not match: {0}")]
  PopMismatch(String),

  #[error("container is empty")]
  Empty,

  #[error("diff of {len} bytes is not a multiple of the {element}-byte element size")]
  DiffMisaligned { len: usize, element: usize },

  #[error("diff replay ended at {actual} bytes, expected {expected}")]
  DiffSizeMismatch { expected: usize, actual: usize },

  #[error("expected a {expected:?} container, found kind tag {found}")]
  WrongKind { expected: Kind, found: u8 },

  #[error("{kind:?} container has unsupported version {found}")]
  KindVersion { kind: Kind, found: u8 },

  #[error("needed {needed} bytes but only {available} are available")]
  Truncated { needed: usize, available: usize },

  #[error("refusing to shrink head from {head} to {requested}")]
  ShrinkRejected { head: u64, requested: u64 },

  #[error("position lies outside the container or not on an element boundary")]
  OutOfRange,

  #[error("malformed element: {0}")]
  Malformed(String),

  #[error("region is read-only")]
  ReadOnly,

  #[error("key not found")]
  NotFound,
}
