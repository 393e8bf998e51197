//! # Variable-size set
//!
//! Like [`Set`](super::Set), but for self-describing elements. The header size is the payload
//! byte length, and positions are byte offsets of element boundaries.

use std::marker::PhantomData;

use super::element::{check_boundaries, diff_ranges, Variable, Walk};
use super::{container_common, Base, Ensure, Kind};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct SetVariable<T, E> {
  base: Base<E>,
  _element: PhantomData<T>,
}

impl<T: Variable, E: Ensure> SetVariable<T, E> {
  pub fn create(region: E) -> Result<Self> {
    Ok(SetVariable { base: Base::create(region, Kind::SetVariable)?, _element: PhantomData })
  }

  pub fn open(region: E) -> Result<Self> {
    let base = Base::open(region, Kind::SetVariable, |size| usize::try_from(size).ok())?;
    Ok(SetVariable { base, _element: PhantomData })
  }

  container_common!();

  /// Payload length in bytes.
  pub fn size(&self) -> u64 {
    self.base.size()
  }

  pub fn is_empty(&self) -> bool {
    self.base.used() == 0
  }

  pub fn iter(&self) -> impl Iterator<Item = Result<T>> + '_ {
    let payload = self.base.payload();
    Walk::new(payload, T::measure).map(move |range| T::decode(&payload[range?]))
  }

  pub fn as_vec(&self) -> Result<Vec<T>> {
    self.iter().collect()
  }

  /// Number of elements. Walks the whole payload.
  pub fn count(&self) -> Result<usize> {
    Walk::new(self.base.payload(), T::measure).try_fold(0, |count, range| range.map(|_| count + 1))
  }

  fn find(&self, encoded: &[u8]) -> Result<Option<usize>> {
    let payload = self.base.payload();
    for range in Walk::new(payload, T::measure) {
      let range = range?;
      if payload[range.clone()] == *encoded {
        return Ok(Some(range.start));
      }
    }
    Ok(None)
  }

  /// Byte offset of the element encoding to the same bytes as `item`.
  pub fn position(&self, item: &T) -> Result<Option<usize>> {
    self.find(&item.to_bytes())
  }

  pub fn contains(&self, item: &T) -> Result<bool> {
    Ok(self.position(item)?.is_some())
  }

  /// Appends `item`. Appending an element already present is an error and changes nothing.
  pub fn append(&mut self, item: &T) -> Result<()> {
    self.append_encoded(&item.to_bytes())
  }

  fn append_encoded(&mut self, encoded: &[u8]) -> Result<()> {
    if let Some(offset) = self.find(encoded)? {
      return Err(Error::Duplicate(format!("set already holds this item at offset {}", offset)));
    }
    let used = self.base.used();
    let payload = self.base.reserve(encoded.len())?;
    payload[used..].copy_from_slice(encoded);
    self.base.advance(encoded.len(), encoded.len() as u64)
  }

  /// Removes the last element, which must encode to the same bytes as `expected`.
  pub fn pop_last(&mut self, expected: &T) -> Result<()> {
    let payload = self.base.payload();
    let last = Walk::new(payload, T::measure).last().ok_or(Error::Empty)??;
    if payload[last.clone()] != expected.to_bytes()[..] {
      return Err(Error::PopMismatch(format!("last item at offset {} differs", last.start)));
    }
    self.base.retreat(last.len(), last.len() as u64)
  }

  /// Raw bytes between the byte offsets `from` and `to`, which must both be element boundaries.
  pub fn create_diff(&self, from: u64, to: u64) -> Result<Vec<u8>> {
    let payload = self.base.payload();
    let (from, to) = (usize::try_from(from), usize::try_from(to));
    let (Ok(from), Ok(to)) = (from, to) else {
      return Err(Error::OutOfRange);
    };
    check_boundaries(payload, T::measure, from, to)?;
    Ok(payload[from..to].to_vec())
  }

  /// Replays the elements encoded in `diff`, as produced by [`SetVariable::create_diff`].
  pub fn apply_diff(&mut self, diff: &[u8]) -> Result<()> {
    let ranges = diff_ranges(diff, T::measure)?;
    let expected = self.base.used() + diff.len();
    self.base.reserve(diff.len())?;
    for range in ranges {
      self.append_encoded(&diff[range])?;
    }
    if self.base.used() != expected {
      return Err(Error::DiffSizeMismatch { expected, actual: self.base.used() });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use rand::{Rng, SeedableRng};

  use super::*;
  use crate::append::HEADER_SIZE;
  use crate::storage::paging::{PageAllocator, Style};
  use crate::storage::whole_file::WholeFileMapping;

  fn test_round_trip<E: Ensure>(region: E) {
    let mut set = SetVariable::<String, _>::create(region).unwrap();
    for word in ["alpha", "", "gamma", "a much longer word than the others"] {
      set.append(&word.to_owned()).unwrap();
    }
    assert!(matches!(set.append(&"gamma".to_owned()), Err(Error::Duplicate(_))));
    assert_eq!(set.count().unwrap(), 4);
    assert_eq!(set.size(), 6 + 1 + 6 + 35);
    assert_eq!(set.position(&"gamma".to_owned()).unwrap(), Some(7));
    assert!(!set.contains(&"beta".to_owned()).unwrap());
    assert_eq!(set.as_vec().unwrap(), vec!["alpha", "", "gamma", "a much longer word than the others"]);
  }

  fn test_pop_restores_bytes<E: Ensure>(region: E) {
    let mut set = SetVariable::<Vec<u8>, _>::create(region).unwrap();
    set.append(&vec![1, 2, 3]).unwrap();
    let before = set.region().bytes().to_vec();

    set.append(&vec![4; 200]).unwrap();
    assert!(matches!(set.pop_last(&vec![1, 2, 3]), Err(Error::PopMismatch(_))));
    set.pop_last(&vec![4; 200]).unwrap();
    assert_eq!(set.region().bytes(), &before[..]);
    set.pop_last(&vec![1, 2, 3]).unwrap();
    assert!(matches!(set.pop_last(&vec![1, 2, 3]), Err(Error::Empty)));
  }

  fn test_diff_replay<E: Ensure, F: Ensure>(source: E, mirror: F) {
    let mut source = SetVariable::<Vec<u8>, _>::create(source).unwrap();
    let mut mirror = SetVariable::<Vec<u8>, _>::create(mirror).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(3);
    let mut synced = 0;
    for i in 0..100u32 {
      let mut item = i.to_le_bytes().to_vec();
      item.resize(rng.gen_range(4..150), 0xAB);
      source.append(&item).unwrap();
      if rng.gen_bool(0.3) {
        mirror.apply_diff(&source.create_diff(synced, source.size()).unwrap()).unwrap();
        synced = source.size();
      }
    }
    mirror.apply_diff(&source.create_diff(synced, source.size()).unwrap()).unwrap();

    let len = HEADER_SIZE + source.size() as usize;
    assert_eq!(&mirror.region().bytes()[..len], &source.region().bytes()[..len]);
    assert!(matches!(source.create_diff(1, source.size()), Err(Error::OutOfRange)));

    let diff = vec![0xFF; 3].to_bytes();
    let err = mirror.apply_diff(&diff[..diff.len() - 1]).unwrap_err();
    assert!(matches!(err, Error::DiffSizeMismatch { expected: 3, actual: 0 }));
  }

  #[test]
  fn test_vec() {
    test_round_trip(Vec::new());
    test_pop_restores_bytes(Vec::new());
    test_diff_replay(Vec::new(), Vec::new());
  }

  #[test]
  fn test_paged() {
    let mut allocator = PageAllocator::reserve(Style::Anonymous).unwrap();
    test_round_trip(allocator.slot(0).unwrap());
    test_pop_restores_bytes(allocator.slot(1 << 12).unwrap());
    let mut other = PageAllocator::reserve(Style::Heap).unwrap();
    test_diff_replay(allocator.slot(1 << 14).unwrap(), other.slot(0).unwrap());
  }

  #[test]
  fn test_whole_file() {
    test_round_trip(WholeFileMapping::anonymous().unwrap().acquire_writer());
    test_pop_restores_bytes(WholeFileMapping::anonymous().unwrap().acquire_writer());
    let source = WholeFileMapping::anonymous().unwrap();
    let mirror = WholeFileMapping::anonymous().unwrap();
    test_diff_replay(source.acquire_writer(), mirror.acquire_writer());
  }
}
