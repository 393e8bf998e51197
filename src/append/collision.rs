//! # Collision hash map
//!
//! Laid out exactly like [`BinaryTree`](super::BinaryTree), keyed by a hash. Entries with equal
//! hashes may hold different logical values, and only the caller can tell them apart, usually by
//! resolving the value against data stored elsewhere. The caller therefore passes an `is_same`
//! predicate on every lookup and insertion instead of a comparator.
//!
//! An equal hash whose value is not the same always descends left. The choice depends on nothing
//! but the predicate's answer, so a replica can rebuild the identical shape by replaying with
//! plain value equality.

use std::cmp::Ordering;
use std::marker::PhantomData;

use super::element::{Fixed, Node};
use super::tree::{attach, descend, detach_last, diff_nodes, read_node, Descent};
use super::{check_range, container_common, Base, Ensure, Kind};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct CollisionHashMap<K, V, E> {
  base: Base<E>,
  _element: PhantomData<(K, V)>,
}

fn order<K: Ord, V>(hash: &K, node: &Node<K, V>, is_same: &mut impl FnMut(&V) -> bool) -> Ordering {
  match hash.cmp(&node.key) {
    Ordering::Equal if is_same(&node.value) => Ordering::Equal,
    Ordering::Equal => Ordering::Less,
    other => other,
  }
}

impl<K: Fixed + Ord, V: Fixed + PartialEq, E: Ensure> CollisionHashMap<K, V, E> {
  pub fn create(region: E) -> Result<Self> {
    Ok(CollisionHashMap { base: Base::create(region, Kind::CollisionHashMap)?, _element: PhantomData })
  }

  pub fn open(region: E) -> Result<Self> {
    let base = Base::open(region, Kind::CollisionHashMap, |size| {
      usize::try_from(size).ok()?.checked_mul(Node::<K, V>::SIZE)
    })?;
    Ok(CollisionHashMap { base, _element: PhantomData })
  }

  container_common!();

  pub fn len(&self) -> usize {
    self.base.size() as usize
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// All nodes in insertion order, links included.
  pub fn nodes(&self) -> impl Iterator<Item = Node<K, V>> + '_ {
    self.base.payload().chunks_exact(Node::<K, V>::SIZE).map(Node::decode)
  }

  /// The value stored under `hash` for which `is_same` holds.
  pub fn get(&self, hash: &K, mut is_same: impl FnMut(&V) -> bool) -> Result<Option<V>> {
    match descend::<K, V>(self.base.payload(), |node| order(hash, node, &mut is_same))? {
      Descent::Found(index) => Ok(Some(read_node::<K, V>(self.base.payload(), index).value)),
      Descent::Vacant(_) => Ok(None),
    }
  }

  /// Inserts `value` under `hash` and returns its node index. An entry for which `is_same`
  /// holds is a duplicate.
  pub fn insert(&mut self, hash: K, value: V, mut is_same: impl FnMut(&V) -> bool) -> Result<u64> {
    match descend::<K, V>(self.base.payload(), |node| order(&hash, node, &mut is_same))? {
      Descent::Found(index) => Err(Error::Duplicate(format!("map already holds this value at node {}", index))),
      Descent::Vacant(parent) => attach(&mut self.base, parent, hash, value),
    }
  }

  /// Like [`CollisionHashMap::insert`], but an existing entry is returned instead of being an
  /// error.
  pub fn get_or_insert(&mut self, hash: K, value: V, mut is_same: impl FnMut(&V) -> bool) -> Result<V> {
    match descend::<K, V>(self.base.payload(), |node| order(&hash, node, &mut is_same))? {
      Descent::Found(index) => Ok(read_node::<K, V>(self.base.payload(), index).value),
      Descent::Vacant(parent) => {
        let index = attach(&mut self.base, parent, hash, value)?;
        Ok(read_node::<K, V>(self.base.payload(), index).value)
      }
    }
  }

  pub fn pop_last(&mut self, hash: K, value: V) -> Result<()> {
    detach_last(&mut self.base, Node::leaf(hash, value))
  }

  /// Raw bytes of the nodes at indices `from..to`.
  pub fn create_diff(&self, from: u64, to: u64) -> Result<Vec<u8>> {
    check_range(from, to, self.base.size())?;
    let size = Node::<K, V>::SIZE;
    Ok(self.base.payload()[from as usize * size..to as usize * size].to_vec())
  }

  /// Replays the insertions encoded in `diff`, telling colliding entries apart by value equality.
  pub fn apply_diff(&mut self, diff: &[u8]) -> Result<()> {
    let entries = diff_nodes::<K, V>(diff)?;
    let expected = self.base.used() + diff.len();
    self.base.reserve(diff.len())?;
    for (hash, value) in entries {
      let descent = descend::<K, V>(self.base.payload(), |node| order(&hash, node, &mut |v: &V| *v == value))?;
      match descent {
        Descent::Found(index) => {
          return Err(Error::Duplicate(format!("diff repeats the value at node {}", index)));
        }
        Descent::Vacant(parent) => attach(&mut self.base, parent, hash, value)?,
      };
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

  /// Values stand for strings stored elsewhere; the hash keeps only the low bits so that
  /// collisions are common.
  fn hash(value: u32) -> u8 {
    (value % 4) as u8
  }

  fn test_collisions_go_left<E: Ensure>(region: E) {
    let mut map = CollisionHashMap::<u8, u32, _>::create(region).unwrap();
    map.insert(hash(1), 1, |v| *v == 1).unwrap();
    map.insert(hash(5), 5, |v| *v == 5).unwrap();
    map.insert(hash(9), 9, |v| *v == 9).unwrap();
    map.insert(hash(2), 2, |v| *v == 2).unwrap();
    assert!(matches!(map.insert(hash(5), 5, |v| *v == 5), Err(Error::Duplicate(_))));

    let links: Vec<_> = map.nodes().map(|node| (node.left, node.right)).collect();
    assert_eq!(links, vec![(1, 3), (2, 0), (0, 0), (0, 0)]);
    assert_eq!(map.get(&1, |v| *v == 9).unwrap(), Some(9));
    assert_eq!(map.get(&1, |v| *v == 13).unwrap(), None);
    assert_eq!(map.get_or_insert(hash(13), 13, |v| *v == 13).unwrap(), 13);
    assert_eq!(map.get_or_insert(hash(13), 13, |v| *v == 13).unwrap(), 13);
    assert_eq!(map.len(), 5);
  }

  fn test_pop_restores_bytes<E: Ensure>(region: E) {
    let mut map = CollisionHashMap::<u8, u32, _>::create(region).unwrap();
    map.insert(hash(3), 3, |v| *v == 3).unwrap();
    let before = map.region().bytes().to_vec();

    map.insert(hash(7), 7, |v| *v == 7).unwrap();
    assert!(matches!(map.pop_last(hash(3), 3), Err(Error::PopMismatch(_))));
    map.pop_last(hash(7), 7).unwrap();
    assert_eq!(map.region().bytes(), &before[..]);
    assert!(matches!(map.pop_last(hash(3), 3), Ok(())));
    assert!(matches!(map.pop_last(hash(3), 3), Err(Error::Empty)));
  }

  fn test_diff_replay<E: Ensure, F: Ensure>(source: E, mirror: F) {
    let mut source = CollisionHashMap::<u8, u32, _>::create(source).unwrap();
    let mut mirror = CollisionHashMap::<u8, u32, _>::create(mirror).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(11);
    let mut synced = 0;
    for _ in 0..200 {
      let value = rng.gen_range(0..1000u32);
      source.get_or_insert(hash(value), value, |v| *v == value).unwrap();
      if rng.gen_bool(0.25) {
        mirror.apply_diff(&source.create_diff(synced, source.len() as u64).unwrap()).unwrap();
        synced = source.len() as u64;
      }
    }
    mirror.apply_diff(&source.create_diff(synced, source.len() as u64).unwrap()).unwrap();

    let len = HEADER_SIZE + source.len() * Node::<u8, u32>::SIZE;
    assert_eq!(&mirror.region().bytes()[..len], &source.region().bytes()[..len]);

    let repeat = source.create_diff(0, 1).unwrap();
    assert!(matches!(mirror.apply_diff(&repeat), Err(Error::Duplicate(_))));
  }

  #[test]
  fn test_vec() {
    test_collisions_go_left(Vec::new());
    test_pop_restores_bytes(Vec::new());
    test_diff_replay(Vec::new(), Vec::new());
  }

  #[test]
  fn test_paged() {
    let mut allocator = PageAllocator::reserve(Style::Anonymous).unwrap();
    test_collisions_go_left(allocator.slot(0).unwrap());
    test_pop_restores_bytes(allocator.slot(1 << 12).unwrap());
    let mut other = PageAllocator::reserve(Style::Heap).unwrap();
    test_diff_replay(allocator.slot(1 << 13).unwrap(), other.slot(0).unwrap());
  }

  #[test]
  fn test_whole_file() {
    test_collisions_go_left(WholeFileMapping::anonymous().unwrap().acquire_writer());
    test_pop_restores_bytes(WholeFileMapping::anonymous().unwrap().acquire_writer());
    let source = WholeFileMapping::anonymous().unwrap();
    let mirror = WholeFileMapping::anonymous().unwrap();
    test_diff_replay(source.acquire_writer(), mirror.acquire_writer());
  }
}
