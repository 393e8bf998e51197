//! # Variable-size dictionary
//!
//! Entries are `[tombstone: u8][key][value]`, with self-describing keys and values. Appending a
//! value for a key that already has one tombstones the older entry, so each key has at most one
//! live entry. Tombstone bytes are the only bytes that change after an entry is written.

use std::marker::PhantomData;
use std::ops::Range;

use super::element::{check_boundaries, diff_ranges, Variable, Walk};
use super::{container_common, Base, Ensure, Kind};
use crate::error::{Error, Result};

const LIVE: u8 = 0;
const TOMBSTONE: u8 = 1;

#[derive(Debug)]
pub struct DictVariable<K, V, E> {
  base: Base<E>,
  _element: PhantomData<(K, V)>,
}

/// Byte ranges of one entry, relative to the start of the payload.
struct Entry {
  whole: Range<usize>,
  key: Range<usize>,
  value: Range<usize>,
}

impl<K: Variable, V: Variable, E: Ensure> DictVariable<K, V, E> {
  pub fn create(region: E) -> Result<Self> {
    Ok(DictVariable { base: Base::create(region, Kind::DictVariable)?, _element: PhantomData })
  }

  pub fn open(region: E) -> Result<Self> {
    let base = Base::open(region, Kind::DictVariable, |size| usize::try_from(size).ok())?;
    Ok(DictVariable { base, _element: PhantomData })
  }

  container_common!();

  /// Length of the entry at the front of `bytes`.
  fn measure(bytes: &[u8]) -> Result<usize> {
    match bytes.first() {
      None => Err(Error::Truncated { needed: 1, available: 0 }),
      Some(&(LIVE | TOMBSTONE)) => {
        let key = K::measure(&bytes[1..])?;
        let value = V::measure(&bytes[1 + key..])?;
        Ok(1 + key + value)
      }
      Some(other) => Err(Error::Malformed(format!("tombstone byte {}", other))),
    }
  }

  fn entry(payload: &[u8], whole: Range<usize>) -> Result<Entry> {
    let key_len = K::measure(&payload[whole.start + 1..whole.end])?;
    let key = whole.start + 1..whole.start + 1 + key_len;
    let value = key.end..whole.end;
    Ok(Entry { whole, key, value })
  }

  fn entries<'a>(payload: &'a [u8]) -> impl Iterator<Item = Result<Entry>> + 'a
  where
    K: 'a,
    V: 'a,
    E: 'a,
  {
    Walk::new(payload, Self::measure).map(move |whole| Self::entry(payload, whole?))
  }

  /// Payload length in bytes.
  pub fn size(&self) -> u64 {
    self.base.size()
  }

  pub fn is_empty(&self) -> bool {
    self.base.used() == 0
  }

  /// Offset of the live entry whose key encodes to `key`.
  fn find_live(payload: &[u8], key: &[u8]) -> Result<Option<usize>> {
    for entry in Self::entries(payload) {
      let entry = entry?;
      if payload[entry.whole.start] == LIVE && payload[entry.key.clone()] == *key {
        return Ok(Some(entry.whole.start));
      }
    }
    Ok(None)
  }

  pub fn get(&self, key: &K) -> Result<Option<V>> {
    let payload = self.base.payload();
    let encoded = key.to_bytes();
    for entry in Self::entries(payload) {
      let entry = entry?;
      if payload[entry.whole.start] == LIVE && payload[entry.key.clone()] == encoded[..] {
        return Ok(Some(V::decode(&payload[entry.value])?));
      }
    }
    Ok(None)
  }

  pub fn at(&self, key: &K) -> Result<V> {
    self.get(key)?.ok_or(Error::NotFound)
  }

  pub fn contains_key(&self, key: &K) -> Result<bool> {
    Ok(Self::find_live(self.base.payload(), &key.to_bytes())?.is_some())
  }

  /// Live entries in append order.
  pub fn iter(&self) -> impl Iterator<Item = Result<(K, V)>> + '_ {
    let payload = self.base.payload();
    Self::entries(payload).filter_map(move |entry| {
      let entry = match entry {
        Ok(entry) => entry,
        Err(err) => return Some(Err(err)),
      };
      if payload[entry.whole.start] != LIVE {
        return None;
      }
      Some(K::decode(&payload[entry.key]).and_then(|key| Ok((key, V::decode(&payload[entry.value])?))))
    })
  }

  pub fn as_vec(&self) -> Result<Vec<(K, V)>> {
    self.iter().collect()
  }

  /// Number of live entries. Walks the whole payload.
  pub fn count(&self) -> Result<usize> {
    self.iter().try_fold(0, |count, entry| entry.map(|_| count + 1))
  }

  /// Appends `value` for `key`, superseding any live entry for the same key.
  pub fn append(&mut self, key: &K, value: &V) -> Result<()> {
    let mut encoded = Vec::with_capacity(1 + key.encoded_len() + value.encoded_len());
    encoded.push(LIVE);
    key.encode(&mut encoded);
    value.encode(&mut encoded);
    self.append_encoded(&encoded, 1 + key.encoded_len())
  }

  /// Writes one encoded entry whose key ends at `key_end` as live, and tombstones its
  /// predecessor. The tombstone byte of `encoded` is ignored.
  fn append_encoded(&mut self, encoded: &[u8], key_end: usize) -> Result<()> {
    let previous = Self::find_live(self.base.payload(), &encoded[1..key_end])?;
    let used = self.base.used();
    let payload = self.base.reserve(encoded.len())?;
    payload[used..used + encoded.len()].copy_from_slice(encoded);
    payload[used] = LIVE;
    if let Some(offset) = previous {
      payload[offset] = TOMBSTONE;
    }
    self.base.advance(encoded.len(), encoded.len() as u64)
  }

  /// Removes the last entry, which must be live and hold `key` and `value`, and revives the
  /// entry it superseded. Every tombstoned entry was superseded by a later entry for its key, so
  /// the latest tombstoned entry for `key` is the one the last entry superseded, if any.
  pub fn pop_last(&mut self, key: &K, value: &V) -> Result<()> {
    let mut expected = vec![LIVE];
    key.encode(&mut expected);
    value.encode(&mut expected);

    let payload = self.base.payload();
    let key_bytes = &expected[1..1 + key.encoded_len()];
    let mut superseded = None;
    let mut last = None;
    for entry in Self::entries(payload) {
      let entry = entry?;
      if payload[entry.whole.start] == TOMBSTONE && payload[entry.key.clone()] == *key_bytes {
        superseded = Some(entry.whole.start);
      }
      last = Some(entry.whole);
    }
    let last = last.ok_or(Error::Empty)?;
    if payload[last.clone()] != expected[..] {
      return Err(Error::PopMismatch(format!("last entry at offset {} differs", last.start)));
    }
    if let Some(offset) = superseded.filter(|offset| *offset < last.start) {
      self.base.payload_mut()?[offset] = LIVE;
    }
    self.base.retreat(last.len(), last.len() as u64)
  }

  /// Raw bytes between the byte offsets `from` and `to`, which must both be entry boundaries.
  pub fn create_diff(&self, from: u64, to: u64) -> Result<Vec<u8>> {
    let payload = self.base.payload();
    let (Ok(from), Ok(to)) = (usize::try_from(from), usize::try_from(to)) else {
      return Err(Error::OutOfRange);
    };
    check_boundaries(payload, Self::measure, from, to)?;
    Ok(payload[from..to].to_vec())
  }

  /// Replays the entries encoded in `diff`. Tombstones set in the diff are dropped and
  /// recomputed: each entry lands live and tombstones the live entry it supersedes, whether that
  /// entry came before the diff or earlier in it. An entry the sender had already superseded by
  /// the time of the diff therefore stays live here until the superseding entry arrives.
  pub fn apply_diff(&mut self, diff: &[u8]) -> Result<()> {
    let ranges = diff_ranges(diff, Self::measure)?;
    let expected = self.base.used() + diff.len();
    self.base.reserve(diff.len())?;
    for range in ranges {
      let entry = Self::entry(diff, range)?;
      self.append_encoded(&diff[entry.whole.clone()], entry.key.end - entry.whole.start)?;
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

  fn test_supersede<E: Ensure>(region: E) {
    let mut dict = DictVariable::<String, Vec<u8>, _>::create(region).unwrap();
    dict.append(&"a".to_owned(), &vec![1]).unwrap();
    dict.append(&"b".to_owned(), &vec![2, 2]).unwrap();
    dict.append(&"a".to_owned(), &vec![3, 3, 3]).unwrap();

    assert_eq!(dict.get(&"a".to_owned()).unwrap(), Some(vec![3, 3, 3]));
    assert_eq!(dict.at(&"b".to_owned()).unwrap(), vec![2, 2]);
    assert!(matches!(dict.at(&"c".to_owned()), Err(Error::NotFound)));
    assert!(dict.contains_key(&"b".to_owned()).unwrap());
    assert_eq!(dict.count().unwrap(), 2);
    assert_eq!(dict.as_vec().unwrap(), vec![("b".to_owned(), vec![2, 2]), ("a".to_owned(), vec![3, 3, 3])]);
    assert_eq!(dict.region().bytes()[HEADER_SIZE], TOMBSTONE);
  }

  fn test_pop_restores_bytes<E: Ensure>(region: E) {
    let mut dict = DictVariable::<String, u64, _>::create(region).unwrap();
    dict.append(&"x".to_owned(), &1).unwrap();
    dict.append(&"y".to_owned(), &2).unwrap();
    let before = dict.region().bytes().to_vec();

    dict.append(&"x".to_owned(), &3).unwrap();
    assert_eq!(dict.get(&"x".to_owned()).unwrap(), Some(3));
    assert!(matches!(dict.pop_last(&"x".to_owned(), &1), Err(Error::PopMismatch(_))));
    dict.pop_last(&"x".to_owned(), &3).unwrap();
    assert_eq!(dict.region().bytes(), &before[..]);
    assert_eq!(dict.get(&"x".to_owned()).unwrap(), Some(1));
  }

  fn test_diff_replay<E: Ensure, F: Ensure>(source: E, mirror: F) {
    let mut source = DictVariable::<String, u64, _>::create(source).unwrap();
    let mut mirror = DictVariable::<String, u64, _>::create(mirror).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(5);
    let mut synced = 0;
    for i in 0..150u64 {
      let key = format!("key-{}", rng.gen_range(0..20));
      source.append(&key, &i).unwrap();
      if rng.gen_bool(0.2) {
        mirror.apply_diff(&source.create_diff(synced, source.size()).unwrap()).unwrap();
        synced = source.size();
      }
    }
    mirror.apply_diff(&source.create_diff(synced, source.size()).unwrap()).unwrap();

    let len = HEADER_SIZE + source.size() as usize;
    assert_eq!(&mirror.region().bytes()[..len], &source.region().bytes()[..len]);
    assert_eq!(mirror.as_vec().unwrap(), source.as_vec().unwrap());
    assert!(mirror.count().unwrap() <= 20);
  }

  #[test]
  fn test_vec() {
    test_supersede(Vec::new());
    test_pop_restores_bytes(Vec::new());
    test_diff_replay(Vec::new(), Vec::new());
  }

  #[test]
  fn test_paged() {
    let mut allocator = PageAllocator::reserve(Style::Anonymous).unwrap();
    test_supersede(allocator.slot(0).unwrap());
    test_pop_restores_bytes(allocator.slot(1 << 12).unwrap());
    let mut other = PageAllocator::reserve(Style::Heap).unwrap();
    test_diff_replay(allocator.slot(1 << 13).unwrap(), other.slot(0).unwrap());
  }

  #[test]
  fn test_whole_file() {
    test_supersede(WholeFileMapping::anonymous().unwrap().acquire_writer());
    test_pop_restores_bytes(WholeFileMapping::anonymous().unwrap().acquire_writer());
    let source = WholeFileMapping::anonymous().unwrap();
    let mirror = WholeFileMapping::anonymous().unwrap();
    test_diff_replay(source.acquire_writer(), mirror.acquire_writer());
  }

  #[test]
  fn test_retroactive_tombstones_only_before_diff() {
    let mut source = Vec::new();
    let mut dict = DictVariable::<String, u64, _>::create(&mut source).unwrap();
    dict.append(&"k".to_owned(), &1).unwrap();
    let start = dict.size();
    dict.append(&"k".to_owned(), &2).unwrap();
    dict.append(&"k".to_owned(), &3).unwrap();
    let diff = dict.create_diff(start, dict.size()).unwrap();
    drop(dict);

    let mut target = Vec::new();
    let mut mirror = DictVariable::<String, u64, _>::create(&mut target).unwrap();
    mirror.append(&"k".to_owned(), &1).unwrap();
    mirror.apply_diff(&diff).unwrap();
    assert_eq!(mirror.get(&"k".to_owned()).unwrap(), Some(3));
    drop(mirror);
    assert_eq!(source, target);
  }

  #[test]
  fn test_partial_diff_keeps_superseded_entry_live() {
    let mut source = Vec::new();
    let mut dict = DictVariable::<String, u64, _>::create(&mut source).unwrap();
    dict.append(&"k".to_owned(), &1).unwrap();
    let first = dict.size();
    dict.append(&"k".to_owned(), &2).unwrap();
    let head = dict.create_diff(0, first).unwrap();
    let tail = dict.create_diff(first, dict.size()).unwrap();
    drop(dict);
    assert_eq!(head[0], TOMBSTONE);

    let mut target = Vec::new();
    let mut mirror = DictVariable::<String, u64, _>::create(&mut target).unwrap();
    mirror.apply_diff(&head).unwrap();
    assert_eq!(mirror.as_vec().unwrap(), vec![("k".to_owned(), 1)]);
    let before = mirror.region().bytes().to_vec();

    mirror.append(&"k".to_owned(), &3).unwrap();
    mirror.pop_last(&"k".to_owned(), &3).unwrap();
    assert_eq!(mirror.region().bytes(), &before[..]);
    assert_eq!(mirror.get(&"k".to_owned()).unwrap(), Some(1));

    mirror.apply_diff(&tail).unwrap();
    assert_eq!(mirror.get(&"k".to_owned()).unwrap(), Some(2));
    drop(mirror);
    assert_eq!(source, target);
  }

  #[test]
  fn test_rejects_bad_tombstone() {
    let mut bytes = Vec::new();
    DictVariable::<String, u64, _>::create(&mut bytes).unwrap().append(&"k".to_owned(), &1).unwrap();
    bytes[HEADER_SIZE] = 7;
    let dict = DictVariable::<String, u64, _>::open(crate::append::ReadOnly(&bytes)).unwrap();
    assert!(matches!(dict.get(&"k".to_owned()), Err(Error::Malformed(_))));
  }
}
