//! # Append-only containers
//!
//! Every container lives in a contiguous byte region that starts with a 32-byte [`Header`] and
//! is followed by its elements, back to back. The region is anything implementing [`Ensure`]: a
//! `Vec<u8>`, a slot of the paged region, or the writer of a whole-file region. Growth goes
//! through [`Ensure::ensure`], which hands back a fresh view of the (possibly moved) region; the
//! container writes the new element at the end of that view and only then advances its size.
//!
//! Stored element bytes are never rewritten, with two exceptions: tree child links are filled in
//! when a child is attached, and variable dictionary entries are tombstoned when superseded.
//!
//! The in-memory layout doubles as the replication format. `create_diff` returns the raw bytes
//! between two positions; `apply_diff` replays them with the container's own insertion logic.
//! Revision and upstream size are maintained by the caller and are never touched by appends or
//! diffs.

use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

pub mod collision;
pub mod dict_fixed;
pub mod dict_variable;
pub mod element;
pub mod set;
pub mod set_variable;
pub mod tree;

pub use collision::CollisionHashMap;
pub use dict_fixed::DictFixed;
pub use dict_variable::DictVariable;
pub use element::{Fixed, Node, Pair, Variable};
pub use set::Set;
pub use set_variable::SetVariable;
pub use tree::BinaryTree;

/// # Growable byte region
///
/// The growth contract between a container and whatever holds its bytes. Mutable views returned
/// by [`Ensure::ensure`] borrow the region, so no earlier view survives a growth call.
pub trait Ensure {
  /// Current contents. May extend past the end of the container.
  fn bytes(&self) -> &[u8];

  /// Current contents, mutably.
  fn bytes_mut(&mut self) -> Result<&mut [u8]>;

  /// Makes the region at least `len` bytes long and returns all of it.
  fn ensure(&mut self, len: usize) -> Result<&mut [u8]>;

  /// Tells the region that only the first `len` bytes are in use any more.
  fn release(&mut self, len: usize) -> Result<()>;
}

impl Ensure for Vec<u8> {
  fn bytes(&self) -> &[u8] {
    self
  }

  fn bytes_mut(&mut self) -> Result<&mut [u8]> {
    Ok(self)
  }

  fn ensure(&mut self, len: usize) -> Result<&mut [u8]> {
    if self.len() < len {
      self.resize(len, 0);
    }
    Ok(self)
  }

  fn release(&mut self, len: usize) -> Result<()> {
    self.truncate(len);
    Ok(())
  }
}

impl<E: Ensure + ?Sized> Ensure for &mut E {
  fn bytes(&self) -> &[u8] {
    (**self).bytes()
  }

  fn bytes_mut(&mut self) -> Result<&mut [u8]> {
    (**self).bytes_mut()
  }

  fn ensure(&mut self, len: usize) -> Result<&mut [u8]> {
    (**self).ensure(len)
  }

  fn release(&mut self, len: usize) -> Result<()> {
    (**self).release(len)
  }
}

/// A borrowed region that can be read but not modified, e.g. a committed view of the paged
/// region or a whole-file reader.
#[derive(Debug, Clone, Copy)]
pub struct ReadOnly<'a>(pub &'a [u8]);

impl Ensure for ReadOnly<'_> {
  fn bytes(&self) -> &[u8] {
    self.0
  }

  fn bytes_mut(&mut self) -> Result<&mut [u8]> {
    Err(Error::ReadOnly)
  }

  fn ensure(&mut self, _len: usize) -> Result<&mut [u8]> {
    Err(Error::ReadOnly)
  }

  fn release(&mut self, _len: usize) -> Result<()> {
    Err(Error::ReadOnly)
  }
}

/// Container kinds, as stored in the first header byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
  Set = 1,
  DictFixed = 2,
  BinaryTree = 3,
  SetVariable = 4,
  DictVariable = 5,
  CollisionHashMap = 6,
}

impl Kind {
  fn from_tag(tag: u8) -> Option<Kind> {
    match tag {
      1 => Some(Kind::Set),
      2 => Some(Kind::DictFixed),
      3 => Some(Kind::BinaryTree),
      4 => Some(Kind::SetVariable),
      5 => Some(Kind::DictVariable),
      6 => Some(Kind::CollisionHashMap),
      _ => None,
    }
  }

  /// Identifies the container stored at the start of `bytes`, before opening it as a concrete
  /// type.
  pub fn inspect(bytes: &[u8]) -> Result<Kind> {
    let (header, _) = Header::ref_from_prefix(bytes)
      .map_err(|_| Error::Truncated { needed: HEADER_SIZE, available: bytes.len() })?;
    Kind::from_tag(header.kind).ok_or_else(|| Error::Malformed(format!("unknown container kind tag {}", header.kind)))
  }
}

/// Layout version of every container kind written by this build.
pub const KIND_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 32;

/// Common container header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Header {
  kind: u8,
  kind_version: u8,
  reserved: [u8; 6],
  size: U64,
  upstream_size: U64,
  revision: U64,
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

impl Header {
  fn new(kind: Kind) -> Header {
    Header {
      kind: kind as u8,
      kind_version: KIND_VERSION,
      reserved: [0; 6],
      size: U64::new(0),
      upstream_size: U64::new(0),
      revision: U64::new(0),
    }
  }

  pub fn kind(&self) -> Option<Kind> {
    Kind::from_tag(self.kind)
  }

  pub fn kind_version(&self) -> u8 {
    self.kind_version
  }

  /// Element count for fixed-size kinds, payload byte length for variable-size kinds.
  pub fn size(&self) -> u64 {
    self.size.get()
  }

  /// How much of the container a replication peer is known to have.
  pub fn upstream_size(&self) -> u64 {
    self.upstream_size.get()
  }

  pub fn revision(&self) -> u64 {
    self.revision.get()
  }
}

/// Header bookkeeping shared by every container: a cached copy of the header, written through to
/// the region whenever it changes, and the payload length it implies.
#[derive(Debug)]
pub(crate) struct Base<E> {
  region: E,
  header: Header,
  used: usize,
}

impl<E: Ensure> Base<E> {
  pub(crate) fn create(mut region: E, kind: Kind) -> Result<Base<E>> {
    let header = Header::new(kind);
    let bytes = if region.bytes().len() < HEADER_SIZE { region.ensure(HEADER_SIZE)? } else { region.bytes_mut()? };
    bytes[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    Ok(Base { region, header, used: 0 })
  }

  /// `payload_len` converts the stored size into a byte length, or `None` if it overflows.
  pub(crate) fn open(region: E, kind: Kind, payload_len: impl FnOnce(u64) -> Option<usize>) -> Result<Base<E>> {
    let bytes = region.bytes();
    let found = Kind::inspect(bytes)?;
    let (header, _) = Header::read_from_prefix(bytes)
      .map_err(|_| Error::Truncated { needed: HEADER_SIZE, available: bytes.len() })?;
    if found != kind {
      return Err(Error::WrongKind { expected: kind, found: header.kind });
    }
    if header.kind_version != KIND_VERSION {
      return Err(Error::KindVersion { kind, found: header.kind_version });
    }
    let used = payload_len(header.size()).ok_or_else(|| Error::Malformed(format!("size {} overflows", header.size())))?;
    let needed = HEADER_SIZE.saturating_add(used);
    if bytes.len() < needed {
      return Err(Error::Truncated { needed, available: bytes.len() });
    }
    Ok(Base { region, header, used })
  }

  pub(crate) fn header(&self) -> &Header {
    &self.header
  }

  pub(crate) fn size(&self) -> u64 {
    self.header.size()
  }

  /// Payload byte length.
  pub(crate) fn used(&self) -> usize {
    self.used
  }

  pub(crate) fn payload(&self) -> &[u8] {
    &self.region.bytes()[HEADER_SIZE..HEADER_SIZE + self.used]
  }

  /// Payload bytes plus `extra` bytes after them, growing the region if needed. Nothing is
  /// recorded until [`Base::advance`].
  pub(crate) fn reserve(&mut self, extra: usize) -> Result<&mut [u8]> {
    let needed = HEADER_SIZE + self.used + extra;
    let bytes = if self.region.bytes().len() < needed { self.region.ensure(needed)? } else { self.region.bytes_mut()? };
    Ok(&mut bytes[HEADER_SIZE..needed])
  }

  /// Records `bytes` more payload bytes holding `size` more size units.
  pub(crate) fn advance(&mut self, bytes: usize, size: u64) -> Result<()> {
    self.used += bytes;
    self.header.size.set(self.header.size() + size);
    self.store_header()
  }

  /// Zeroes and forgets the last `bytes` payload bytes, which held `size` size units.
  pub(crate) fn retreat(&mut self, bytes: usize, size: u64) -> Result<()> {
    let end = HEADER_SIZE + self.used;
    let region = self.region.bytes_mut()?;
    region[end - bytes..end].fill(0);
    self.used -= bytes;
    self.header.size.set(self.header.size() - size);
    self.store_header()?;
    self.region.release(HEADER_SIZE + self.used)
  }

  /// Mutable payload without growth, for in-place link and tombstone updates.
  pub(crate) fn payload_mut(&mut self) -> Result<&mut [u8]> {
    let used = self.used;
    Ok(&mut self.region.bytes_mut()?[HEADER_SIZE..HEADER_SIZE + used])
  }

  fn store_header(&mut self) -> Result<()> {
    let header = self.header;
    self.region.bytes_mut()?[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    Ok(())
  }

  pub(crate) fn bump_revision(&mut self) -> Result<u64> {
    let revision = self.header.revision() + 1;
    self.header.revision.set(revision);
    self.store_header()?;
    Ok(revision)
  }

  pub(crate) fn set_upstream_size(&mut self, upstream_size: u64) -> Result<()> {
    self.header.upstream_size.set(upstream_size);
    self.store_header()
  }

  pub(crate) fn region(&self) -> &E {
    &self.region
  }

  pub(crate) fn into_inner(self) -> E {
    self.region
  }
}

/// Checks a requested diff range against the current size.
pub(crate) fn check_range(from: u64, to: u64, size: u64) -> Result<()> {
  if from > to || to > size {
    return Err(Error::OutOfRange);
  }
  Ok(())
}

/// Generates the header accessors shared by every container type, delegating to `self.base`.
macro_rules! container_common {
  () => {
    /// The cached container header.
    pub fn header(&self) -> &$crate::append::Header {
      self.base.header()
    }

    pub fn revision(&self) -> u64 {
      self.base.header().revision()
    }

    /// Increments the revision counter and returns the new value.
    pub fn bump_revision(&mut self) -> $crate::error::Result<u64> {
      self.base.bump_revision()
    }

    pub fn upstream_size(&self) -> u64 {
      self.base.header().upstream_size()
    }

    pub fn set_upstream_size(&mut self, upstream_size: u64) -> $crate::error::Result<()> {
      self.base.set_upstream_size(upstream_size)
    }

    /// The underlying region.
    pub fn region(&self) -> &E {
      self.base.region()
    }

    /// Gives back the underlying region.
    pub fn into_inner(self) -> E {
      self.base.into_inner()
    }
  };
}

pub(crate) use container_common;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_inspect() {
    let mut bytes = Vec::new();
    let set = Set::<u32, _>::create(&mut bytes).unwrap();
    drop(set);
    assert_eq!(Kind::inspect(&bytes).unwrap(), Kind::Set);

    bytes[0] = 99;
    assert!(matches!(Kind::inspect(&bytes), Err(Error::Malformed(_))));
    assert!(matches!(Kind::inspect(&bytes[..10]), Err(Error::Truncated { needed: HEADER_SIZE, available: 10 })));
  }

  #[test]
  fn test_open_checks_kind_and_version() {
    let mut bytes = Vec::new();
    Set::<u32, _>::create(&mut bytes).unwrap();
    let err = SetVariable::<String, _>::open(ReadOnly(&bytes)).unwrap_err();
    assert!(matches!(err, Error::WrongKind { expected: Kind::SetVariable, found: 1 }));

    bytes[1] = KIND_VERSION + 1;
    let err = Set::<u32, _>::open(ReadOnly(&bytes)).unwrap_err();
    assert!(matches!(err, Error::KindVersion { kind: Kind::Set, .. }));
  }

  #[test]
  fn test_open_rejects_truncated_payload() {
    let mut bytes = Vec::new();
    let mut set = Set::<u64, _>::create(&mut bytes).unwrap();
    set.append(1).unwrap();
    set.append(2).unwrap();
    drop(set);
    let err = Set::<u64, _>::open(ReadOnly(&bytes[..HEADER_SIZE + 12])).unwrap_err();
    assert!(matches!(err, Error::Truncated { needed: 48, available: 44 }));
  }

  #[test]
  fn test_read_only_region() {
    let mut bytes = Vec::new();
    Set::<u32, _>::create(&mut bytes).unwrap().append(3).unwrap();
    let mut set = Set::<u32, _>::open(ReadOnly(&bytes)).unwrap();
    assert!(set.contains(&3));
    assert!(matches!(set.append(4), Err(Error::ReadOnly)));
    assert_eq!(set.len(), 1);
  }

  #[test]
  fn test_revision_and_upstream_size() {
    let mut bytes = Vec::new();
    let mut set = Set::<u32, _>::create(&mut bytes).unwrap();
    set.append(1).unwrap();
    assert_eq!(set.bump_revision().unwrap(), 1);
    set.set_upstream_size(1).unwrap();
    set.append(2).unwrap();
    drop(set);

    let set = Set::<u32, _>::open(ReadOnly(&bytes)).unwrap();
    assert_eq!(set.revision(), 1);
    assert_eq!(set.upstream_size(), 1);
    assert_eq!(set.header().size(), 2);
    assert_eq!(set.header().kind(), Some(Kind::Set));
  }
}
