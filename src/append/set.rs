//! # Fixed-size set
//!
//! Elements are stored in append order. Membership is a linear scan over the encoded bytes, which
//! suits the small, rarely duplicated collections this is used for.

use std::marker::PhantomData;

use super::element::Fixed;
use super::{check_range, container_common, Base, Ensure, Kind};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Set<T, E> {
  base: Base<E>,
  _element: PhantomData<T>,
}

impl<T: Fixed, E: Ensure> Set<T, E> {
  /// Writes an empty set at the start of `region`.
  pub fn create(region: E) -> Result<Self> {
    Ok(Set { base: Base::create(region, Kind::Set)?, _element: PhantomData })
  }

  /// Opens the set stored at the start of `region`.
  pub fn open(region: E) -> Result<Self> {
    let base = Base::open(region, Kind::Set, |size| usize::try_from(size).ok()?.checked_mul(T::SIZE))?;
    Ok(Set { base, _element: PhantomData })
  }

  container_common!();

  pub fn len(&self) -> usize {
    self.base.size() as usize
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn get(&self, index: usize) -> Option<T> {
    let start = index.checked_mul(T::SIZE)?;
    let end = start.checked_add(T::SIZE)?;
    self.base.payload().get(start..end).map(T::decode)
  }

  pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
    self.base.payload().chunks_exact(T::SIZE).map(T::decode)
  }

  pub fn as_vec(&self) -> Vec<T> {
    self.iter().collect()
  }

  /// Index of the element encoding to the same bytes as `item`.
  pub fn position(&self, item: &T) -> Option<usize> {
    let encoded = item.to_bytes();
    self.base.payload().chunks_exact(T::SIZE).position(|x| x == &encoded[..])
  }

  pub fn contains(&self, item: &T) -> bool {
    self.position(item).is_some()
  }

  /// Appends `item`. Appending an element already present is an error and changes nothing.
  pub fn append(&mut self, item: T) -> Result<()> {
    if let Some(index) = self.position(&item) {
      return Err(Error::Duplicate(format!("set already holds this item at index {}", index)));
    }
    let used = self.base.used();
    let payload = self.base.reserve(T::SIZE)?;
    item.encode(&mut payload[used..]);
    self.base.advance(T::SIZE, 1)
  }

  /// Removes the last element, which must encode to the same bytes as `expected`.
  pub fn pop_last(&mut self, expected: &T) -> Result<()> {
    let payload = self.base.payload();
    if payload.is_empty() {
      return Err(Error::Empty);
    }
    if payload[payload.len() - T::SIZE..] != expected.to_bytes()[..] {
      return Err(Error::PopMismatch(format!("last of {} items differs", self.len())));
    }
    self.base.retreat(T::SIZE, 1)
  }

  /// Raw bytes of the elements at indices `from..to`.
  pub fn create_diff(&self, from: usize, to: usize) -> Result<Vec<u8>> {
    check_range(from as u64, to as u64, self.base.size())?;
    Ok(self.base.payload()[from * T::SIZE..to * T::SIZE].to_vec())
  }

  /// Appends the elements encoded in `diff`, as produced by [`Set::create_diff`].
  pub fn apply_diff(&mut self, diff: &[u8]) -> Result<()> {
    if diff.len() % T::SIZE != 0 {
      return Err(Error::DiffMisaligned { len: diff.len(), element: T::SIZE });
    }
    let used = self.base.used();
    let payload = self.base.reserve(diff.len())?;
    payload[used..].copy_from_slice(diff);
    self.base.advance(diff.len(), (diff.len() / T::SIZE) as u64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::append::ReadOnly;
  use crate::storage::paging::{PageAllocator, Style};
  use crate::storage::whole_file::WholeFileMapping;

  fn test_scenario<E: Ensure>(region: E) {
    let mut set = Set::<u64, _>::create(region).unwrap();
    set.append(5).unwrap();
    set.append(9).unwrap();
    let err = set.append(5).unwrap_err();
    assert!(matches!(err, Error::Duplicate(_)));
    assert_eq!(set.len(), 2);
    assert!(set.contains(&9));
    assert!(!set.contains(&6));
    assert_eq!(set.as_vec(), vec![5, 9]);
    assert_eq!(set.get(1), Some(9));
    assert_eq!(set.get(2), None);
    assert_eq!(set.get(usize::MAX / 8), None);
    assert_eq!(set.get(usize::MAX), None);
  }

  fn test_pop_restores_bytes<E: Ensure>(region: E) {
    let mut set = Set::<u32, _>::create(region).unwrap();
    set.append(1).unwrap();
    let before = set.region().bytes().to_vec();

    set.append(2).unwrap();
    assert!(matches!(set.pop_last(&1), Err(Error::PopMismatch(_))));
    set.pop_last(&2).unwrap();
    assert_eq!(set.region().bytes(), &before[..]);
    assert_eq!(set.len(), 1);

    set.pop_last(&1).unwrap();
    assert!(matches!(set.pop_last(&1), Err(Error::Empty)));
  }

  fn test_diff_replay<E: Ensure, F: Ensure>(source: E, mirror: F) {
    let mut source = Set::<[u8; 3], _>::create(source).unwrap();
    let mut mirror = Set::<[u8; 3], _>::create(mirror).unwrap();
    let mut synced = 0;
    for i in 0..50u8 {
      source.append([i, i.wrapping_mul(3), 7]).unwrap();
      if i % 7 == 0 {
        let diff = source.create_diff(synced, source.len()).unwrap();
        mirror.apply_diff(&diff).unwrap();
        synced = source.len();
      }
    }
    mirror.apply_diff(&source.create_diff(synced, source.len()).unwrap()).unwrap();

    let len = source.len() * 3 + crate::append::HEADER_SIZE;
    assert_eq!(&mirror.region().bytes()[..len], &source.region().bytes()[..len]);
    assert!(matches!(mirror.apply_diff(&[1, 2]), Err(Error::DiffMisaligned { len: 2, element: 3 })));
    assert!(matches!(source.create_diff(3, 51), Err(Error::OutOfRange)));
  }

  #[test]
  fn test_vec() {
    test_scenario(Vec::new());
    test_pop_restores_bytes(Vec::new());
    test_diff_replay(Vec::new(), Vec::new());
  }

  #[test]
  fn test_paged() {
    let mut allocator = PageAllocator::reserve(Style::Anonymous).unwrap();
    test_scenario(allocator.slot(0).unwrap());
    test_pop_restores_bytes(allocator.slot(4096).unwrap());
    let mut other = PageAllocator::reserve(Style::Heap).unwrap();
    test_diff_replay(allocator.slot(8192).unwrap(), other.slot(100).unwrap());
  }

  #[test]
  fn test_whole_file() {
    let source = WholeFileMapping::anonymous().unwrap();
    let mirror = WholeFileMapping::anonymous().unwrap();
    test_scenario(source.acquire_writer());
    let source = WholeFileMapping::anonymous().unwrap();
    test_pop_restores_bytes(source.acquire_writer());
    test_diff_replay(source.acquire_writer(), mirror.acquire_writer());
  }

  #[test]
  fn test_reopen() {
    let mut bytes = Vec::new();
    let mut set = Set::<i32, _>::create(&mut bytes).unwrap();
    set.append(-1).unwrap();
    set.append(7).unwrap();
    drop(set);

    let mut set = Set::<i32, _>::open(&mut bytes).unwrap();
    set.append(3).unwrap();
    assert!(matches!(set.append(-1), Err(Error::Duplicate(_))));
    drop(set);
    assert_eq!(Set::<i32, _>::open(ReadOnly(&bytes)).unwrap().as_vec(), vec![-1, 7, 3]);
  }
}
