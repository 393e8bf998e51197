//! # Fixed-size dictionary
//!
//! A set of [`Pair`]s. Keys are compared by their encoding, and a lookup returns the first pair
//! with a matching key that is not marked deleted.

use std::marker::PhantomData;

use super::element::{Fixed, Pair};
use super::{check_range, container_common, Base, Ensure, Kind};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct DictFixed<K, V, E> {
  base: Base<E>,
  _element: PhantomData<(K, V)>,
}

impl<K: Fixed, V: Fixed, E: Ensure> DictFixed<K, V, E> {
  pub fn create(region: E) -> Result<Self> {
    Ok(DictFixed { base: Base::create(region, Kind::DictFixed)?, _element: PhantomData })
  }

  pub fn open(region: E) -> Result<Self> {
    let base =
      Base::open(region, Kind::DictFixed, |size| usize::try_from(size).ok()?.checked_mul(Pair::<K, V>::SIZE))?;
    Ok(DictFixed { base, _element: PhantomData })
  }

  container_common!();

  /// Number of stored pairs, deleted ones included.
  pub fn len(&self) -> usize {
    self.base.size() as usize
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn chunks(&self) -> std::slice::ChunksExact<'_, u8> {
    self.base.payload().chunks_exact(Pair::<K, V>::SIZE)
  }

  /// Index of the first live pair whose key encodes like `key`.
  fn find(&self, key: &K) -> Option<usize> {
    let encoded = key.to_bytes();
    self.chunks().position(|x| x[0] == 0 && x[1..1 + K::SIZE] == encoded[..])
  }

  pub fn get(&self, key: &K) -> Option<V> {
    let index = self.find(key)?;
    let start = index * Pair::<K, V>::SIZE + 1 + K::SIZE;
    Some(V::decode(&self.base.payload()[start..start + V::SIZE]))
  }

  /// Like [`DictFixed::get`], but a missing key is an error.
  pub fn at(&self, key: &K) -> Result<V> {
    self.get(key).ok_or(Error::NotFound)
  }

  pub fn contains_key(&self, key: &K) -> bool {
    self.find(key).is_some()
  }

  /// All stored pairs in append order, deleted ones included.
  pub fn iter(&self) -> impl Iterator<Item = Pair<K, V>> + '_ {
    self.chunks().map(Pair::decode)
  }

  pub fn as_vec(&self) -> Vec<Pair<K, V>> {
    self.iter().collect()
  }

  pub fn insert(&mut self, key: K, value: V) -> Result<()> {
    self.append(Pair::new(key, value))
  }

  /// Appends `pair`. A live pair may not reuse a key that already has a live pair.
  pub fn append(&mut self, pair: Pair<K, V>) -> Result<()> {
    if !pair.deleted {
      if let Some(index) = self.find(&pair.key) {
        return Err(Error::Duplicate(format!("dictionary already holds this key at index {}", index)));
      }
    }
    let used = self.base.used();
    let payload = self.base.reserve(Pair::<K, V>::SIZE)?;
    pair.encode(&mut payload[used..]);
    self.base.advance(Pair::<K, V>::SIZE, 1)
  }

  /// Removes the last pair, which must encode to the same bytes as `expected`.
  pub fn pop_last(&mut self, expected: &Pair<K, V>) -> Result<()> {
    let payload = self.base.payload();
    if payload.is_empty() {
      return Err(Error::Empty);
    }
    if payload[payload.len() - Pair::<K, V>::SIZE..] != expected.to_bytes()[..] {
      return Err(Error::PopMismatch(format!("last of {} pairs differs", self.len())));
    }
    self.base.retreat(Pair::<K, V>::SIZE, 1)
  }

  /// Raw bytes of the pairs at indices `from..to`.
  pub fn create_diff(&self, from: usize, to: usize) -> Result<Vec<u8>> {
    check_range(from as u64, to as u64, self.base.size())?;
    let size = Pair::<K, V>::SIZE;
    Ok(self.base.payload()[from * size..to * size].to_vec())
  }

  /// Appends the pairs encoded in `diff`. Duplicate checks were made when the sender appended them.
  pub fn apply_diff(&mut self, diff: &[u8]) -> Result<()> {
    let size = Pair::<K, V>::SIZE;
    if diff.len() % size != 0 {
      return Err(Error::DiffMisaligned { len: diff.len(), element: size });
    }
    let used = self.base.used();
    let payload = self.base.reserve(diff.len())?;
    payload[used..].copy_from_slice(diff);
    self.base.advance(diff.len(), (diff.len() / size) as u64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::append::HEADER_SIZE;
  use crate::storage::paging::{PageAllocator, Style};
  use crate::storage::whole_file::WholeFileMapping;

  fn test_lookup<E: Ensure>(region: E) {
    let mut dict = DictFixed::<u32, u64, _>::create(region).unwrap();
    dict.insert(1, 100).unwrap();
    dict.append(Pair { deleted: true, key: 2, value: 7 }).unwrap();
    dict.insert(2, 200).unwrap();
    assert!(matches!(dict.insert(1, 5), Err(Error::Duplicate(_))));

    assert_eq!(dict.len(), 3);
    assert_eq!(dict.get(&1), Some(100));
    assert_eq!(dict.get(&2), Some(200));
    assert_eq!(dict.get(&3), None);
    assert!(matches!(dict.at(&3), Err(Error::NotFound)));
    assert!(dict.contains_key(&2));
    assert_eq!(dict.as_vec()[1], Pair { deleted: true, key: 2, value: 7 });
  }

  fn test_pop_restores_bytes<E: Ensure>(region: E) {
    let mut dict = DictFixed::<u16, [u8; 4], _>::create(region).unwrap();
    dict.insert(9, *b"nine").unwrap();
    let before = dict.region().bytes().to_vec();

    dict.insert(10, *b"ten!").unwrap();
    assert!(matches!(dict.pop_last(&Pair::new(10, *b"ten?")), Err(Error::PopMismatch(_))));
    dict.pop_last(&Pair::new(10, *b"ten!")).unwrap();
    assert_eq!(dict.region().bytes(), &before[..]);
    assert!(!dict.contains_key(&10));
  }

  fn test_diff_replay<E: Ensure, F: Ensure>(source: E, mirror: F) {
    let mut source = DictFixed::<u8, u8, _>::create(source).unwrap();
    let mut mirror = DictFixed::<u8, u8, _>::create(mirror).unwrap();
    for i in 0..20u8 {
      source.insert(i, i * 2).unwrap();
      if i % 3 == 2 {
        let from = mirror.len();
        mirror.apply_diff(&source.create_diff(from, source.len()).unwrap()).unwrap();
      }
    }
    mirror.apply_diff(&source.create_diff(mirror.len(), source.len()).unwrap()).unwrap();

    let len = HEADER_SIZE + source.len() * 3;
    assert_eq!(&mirror.region().bytes()[..len], &source.region().bytes()[..len]);
    assert_eq!(mirror.get(&13), Some(26));
    assert!(matches!(mirror.apply_diff(&[0; 4]), Err(Error::DiffMisaligned { len: 4, element: 3 })));
  }

  #[test]
  fn test_vec() {
    test_lookup(Vec::new());
    test_pop_restores_bytes(Vec::new());
    test_diff_replay(Vec::new(), Vec::new());
  }

  #[test]
  fn test_paged() {
    let mut allocator = PageAllocator::reserve(Style::Anonymous).unwrap();
    test_lookup(allocator.slot(0).unwrap());
    test_pop_restores_bytes(allocator.slot(1 << 12).unwrap());
    let mut other = PageAllocator::reserve(Style::Heap).unwrap();
    test_diff_replay(allocator.slot(1 << 13).unwrap(), other.slot(0).unwrap());
  }

  #[test]
  fn test_whole_file() {
    test_lookup(WholeFileMapping::anonymous().unwrap().acquire_writer());
    test_pop_restores_bytes(WholeFileMapping::anonymous().unwrap().acquire_writer());
    let source = WholeFileMapping::anonymous().unwrap();
    let mirror = WholeFileMapping::anonymous().unwrap();
    test_diff_replay(source.acquire_writer(), mirror.acquire_writer());
  }
}
