//! # Unbalanced binary search tree
//!
//! Nodes live in an array in insertion order and name their children by index. A new node goes
//! to the next free index and is linked from the parent whose branch was empty. Nothing is ever
//! rebalanced, so the shape is a function of the insertion order alone, and replaying a diff in
//! order reproduces it exactly.

use std::cmp::Ordering;
use std::marker::PhantomData;

use super::element::{Fixed, Node};
use super::{check_range, container_common, Base, Ensure, Kind};
use crate::error::{Error, Result};

/// Result of walking down from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Descent {
  /// A node compared equal.
  Found(u64),
  /// The walk ended at an empty branch: `(parent index, link offset within the parent)`, or
  /// `None` for an empty tree.
  Vacant(Option<(u64, usize)>),
}

/// Walks from the root. `compare` orders the sought entry against a node; `Less` goes left.
pub(crate) fn descend<K: Fixed, V: Fixed>(
  payload: &[u8],
  mut compare: impl FnMut(&Node<K, V>) -> Ordering,
) -> Result<Descent> {
  let count = (payload.len() / Node::<K, V>::SIZE) as u64;
  if count == 0 {
    return Ok(Descent::Vacant(None));
  }
  let mut index = 0u64;
  loop {
    let node = read_node::<K, V>(payload, index);
    let (child, offset) = match compare(&node) {
      Ordering::Equal => return Ok(Descent::Found(index)),
      Ordering::Less => (node.left, Node::<K, V>::LEFT),
      Ordering::Greater => (node.right, Node::<K, V>::RIGHT),
    };
    if child == 0 {
      return Ok(Descent::Vacant(Some((index, offset))));
    }
    // Children are always appended after their parent, which also rules out cycles.
    if child <= index || child >= count {
      return Err(Error::Malformed(format!("node {} links to node {}", index, child)));
    }
    index = child;
  }
}

pub(crate) fn read_node<K: Fixed, V: Fixed>(payload: &[u8], index: u64) -> Node<K, V> {
  let start = index as usize * Node::<K, V>::SIZE;
  Node::decode(&payload[start..start + Node::<K, V>::SIZE])
}

/// Appends a leaf holding `key` and `value` and links it from `parent`.
pub(crate) fn attach<K: Fixed, V: Fixed, E: Ensure>(
  base: &mut Base<E>,
  parent: Option<(u64, usize)>,
  key: K,
  value: V,
) -> Result<u64> {
  let size = Node::<K, V>::SIZE;
  let index = base.size();
  let used = base.used();
  let payload = base.reserve(size)?;
  Node::leaf(key, value).encode(&mut payload[used..used + size]);
  if let Some((parent, offset)) = parent {
    let start = parent as usize * size + offset;
    Fixed::encode(&index, &mut payload[start..start + 8]);
  }
  base.advance(size, 1)?;
  Ok(index)
}

/// Removes the last node after checking its key and value, and clears the link to it.
pub(crate) fn detach_last<K: Fixed, V: Fixed, E: Ensure>(base: &mut Base<E>, expected: Node<K, V>) -> Result<()> {
  let size = Node::<K, V>::SIZE;
  let count = base.size();
  if count == 0 {
    return Err(Error::Empty);
  }
  let last = count - 1;
  let payload = base.payload();
  if payload[payload.len() - size..] != expected.to_bytes()[..] {
    return Err(Error::PopMismatch(format!("last of {} nodes differs", count)));
  }
  let link = (0..last).find_map(|index| {
    let node = read_node::<K, V>(payload, index);
    if node.left == last {
      Some(index as usize * size + Node::<K, V>::LEFT)
    } else if node.right == last {
      Some(index as usize * size + Node::<K, V>::RIGHT)
    } else {
      None
    }
  });
  if let Some(start) = link {
    base.payload_mut()?[start..start + 8].fill(0);
  }
  base.retreat(size, 1)
}

/// Decodes the nodes of a diff, dropping their links, which replay recomputes.
pub(crate) fn diff_nodes<K: Fixed, V: Fixed>(diff: &[u8]) -> Result<Vec<(K, V)>> {
  let size = Node::<K, V>::SIZE;
  if diff.len() % size != 0 {
    return Err(Error::DiffMisaligned { len: diff.len(), element: size });
  }
  Ok(diff.chunks_exact(size).map(Node::<K, V>::decode).map(|node| (node.key, node.value)).collect())
}

/// In-order traversal over the node array.
pub(crate) struct InOrder<'a, K, V> {
  payload: &'a [u8],
  stack: Vec<u64>,
  next: Option<u64>,
  _node: PhantomData<(K, V)>,
}

impl<'a, K: Fixed, V: Fixed> InOrder<'a, K, V> {
  pub(crate) fn new(payload: &'a [u8]) -> Self {
    let next = if payload.is_empty() { None } else { Some(0) };
    InOrder { payload, stack: Vec::new(), next, _node: PhantomData }
  }
}

impl<K: Fixed, V: Fixed> Iterator for InOrder<'_, K, V> {
  type Item = Node<K, V>;

  fn next(&mut self) -> Option<Self::Item> {
    let count = (self.payload.len() / Node::<K, V>::SIZE) as u64;
    while let Some(index) = self.next {
      self.stack.push(index);
      let left = read_node::<K, V>(self.payload, index).left;
      self.next = if left > index && left < count { Some(left) } else { None };
    }
    let index = self.stack.pop()?;
    let node = read_node::<K, V>(self.payload, index);
    if node.right > index && node.right < count {
      self.next = Some(node.right);
    }
    Some(node)
  }
}

#[derive(Debug)]
pub struct BinaryTree<K, V, E> {
  base: Base<E>,
  _element: PhantomData<(K, V)>,
}

impl<K: Fixed + Ord, V: Fixed, E: Ensure> BinaryTree<K, V, E> {
  pub fn create(region: E) -> Result<Self> {
    Ok(BinaryTree { base: Base::create(region, Kind::BinaryTree)?, _element: PhantomData })
  }

  pub fn open(region: E) -> Result<Self> {
    let base =
      Base::open(region, Kind::BinaryTree, |size| usize::try_from(size).ok()?.checked_mul(Node::<K, V>::SIZE))?;
    Ok(BinaryTree { base, _element: PhantomData })
  }

  container_common!();

  pub fn len(&self) -> usize {
    self.base.size() as usize
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The node stored at `index`, in insertion order.
  pub fn node(&self, index: u64) -> Option<Node<K, V>> {
    (index < self.base.size()).then(|| read_node(self.base.payload(), index))
  }

  /// All nodes in insertion order, links included.
  pub fn nodes(&self) -> impl Iterator<Item = Node<K, V>> + '_ {
    self.base.payload().chunks_exact(Node::<K, V>::SIZE).map(Node::decode)
  }

  pub fn get(&self, key: &K) -> Result<Option<V>> {
    match descend::<K, V>(self.base.payload(), |node| key.cmp(&node.key))? {
      Descent::Found(index) => Ok(Some(read_node::<K, V>(self.base.payload(), index).value)),
      Descent::Vacant(_) => Ok(None),
    }
  }

  pub fn contains_key(&self, key: &K) -> Result<bool> {
    Ok(self.get(key)?.is_some())
  }

  /// Entries in key order.
  pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
    InOrder::<K, V>::new(self.base.payload()).map(|node| (node.key, node.value))
  }

  pub fn as_vec(&self) -> Vec<(K, V)> {
    self.iter().collect()
  }

  /// Inserts a new key and returns its node index. An existing key is an error.
  pub fn insert(&mut self, key: K, value: V) -> Result<u64> {
    match descend::<K, V>(self.base.payload(), |node| key.cmp(&node.key))? {
      Descent::Found(index) => Err(Error::Duplicate(format!("tree already holds this key at node {}", index))),
      Descent::Vacant(parent) => attach(&mut self.base, parent, key, value),
    }
  }

  /// Removes the most recently inserted node, which must hold `key` and `value`.
  pub fn pop_last(&mut self, key: K, value: V) -> Result<()> {
    detach_last(&mut self.base, Node::leaf(key, value))
  }

  /// Raw bytes of the nodes at indices `from..to`.
  pub fn create_diff(&self, from: u64, to: u64) -> Result<Vec<u8>> {
    check_range(from, to, self.base.size())?;
    let size = Node::<K, V>::SIZE;
    Ok(self.base.payload()[from as usize * size..to as usize * size].to_vec())
  }

  /// Replays the insertions encoded in `diff`, in order.
  pub fn apply_diff(&mut self, diff: &[u8]) -> Result<()> {
    let entries = diff_nodes::<K, V>(diff)?;
    let expected = self.base.used() + diff.len();
    self.base.reserve(diff.len())?;
    for (key, value) in entries {
      self.insert(key, value)?;
    }
    if self.base.used() != expected {
      return Err(Error::DiffSizeMismatch { expected, actual: self.base.used() });
    }
    Ok(())
  }
}
