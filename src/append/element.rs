//! # Element encodings
//!
//! Fixed-size elements are stored little-endian at a stable offset, so the `i`-th element of a
//! container is found by arithmetic. Variable-size elements are self-describing: their length can
//! be measured from their first bytes, so a run of them can be walked front to back.

use crate::encoding::prefix_varint;
use crate::error::{Error, Result};

/// # Fixed-size element
pub trait Fixed: Sized {
  /// Encoded size in bytes.
  const SIZE: usize;

  /// Writes the encoding into `out`, which is exactly [`Fixed::SIZE`] bytes long.
  fn encode(&self, out: &mut [u8]);

  /// Reads an element back from exactly [`Fixed::SIZE`] bytes.
  fn decode(bytes: &[u8]) -> Self;

  /// Convenience wrapper around [`Fixed::encode`].
  fn to_bytes(&self) -> Vec<u8> {
    let mut out = vec![0; Self::SIZE];
    self.encode(&mut out);
    out
  }
}

macro_rules! fixed_int {
  ($($ty:ty),*) => {
    $(
      impl Fixed for $ty {
        const SIZE: usize = std::mem::size_of::<$ty>();

        fn encode(&self, out: &mut [u8]) {
          out.copy_from_slice(&self.to_le_bytes());
        }

        fn decode(bytes: &[u8]) -> Self {
          let mut raw = [0u8; std::mem::size_of::<$ty>()];
          raw.copy_from_slice(bytes);
          <$ty>::from_le_bytes(raw)
        }
      }
    )*
  };
}

fixed_int!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

impl<const N: usize> Fixed for [u8; N] {
  const SIZE: usize = N;

  fn encode(&self, out: &mut [u8]) {
    out.copy_from_slice(self);
  }

  fn decode(bytes: &[u8]) -> Self {
    let mut raw = [0u8; N];
    raw.copy_from_slice(bytes);
    raw
  }
}

/// Key/value record of a fixed dictionary. A deleted pair is kept but ignored by lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair<K, V> {
  pub deleted: bool,
  pub key: K,
  pub value: V,
}

impl<K, V> Pair<K, V> {
  pub fn new(key: K, value: V) -> Pair<K, V> {
    Pair { deleted: false, key, value }
  }
}

impl<K: Fixed, V: Fixed> Fixed for Pair<K, V> {
  const SIZE: usize = 1 + K::SIZE + V::SIZE;

  fn encode(&self, out: &mut [u8]) {
    out[0] = u8::from(self.deleted);
    self.key.encode(&mut out[1..1 + K::SIZE]);
    self.value.encode(&mut out[1 + K::SIZE..]);
  }

  fn decode(bytes: &[u8]) -> Self {
    Pair {
      deleted: bytes[0] != 0,
      key: K::decode(&bytes[1..1 + K::SIZE]),
      value: V::decode(&bytes[1 + K::SIZE..]),
    }
  }
}

/// Tree node. Children are indices into the same container; 0 means no child, since index 0 is
/// always the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node<K, V> {
  pub key: K,
  pub value: V,
  pub left: u64,
  pub right: u64,
}

impl<K: Fixed, V: Fixed> Node<K, V> {
  pub(crate) const LEFT: usize = K::SIZE + V::SIZE;
  pub(crate) const RIGHT: usize = K::SIZE + V::SIZE + 8;

  pub fn leaf(key: K, value: V) -> Node<K, V> {
    Node { key, value, left: 0, right: 0 }
  }
}

impl<K: Fixed, V: Fixed> Fixed for Node<K, V> {
  const SIZE: usize = K::SIZE + V::SIZE + 16;

  fn encode(&self, out: &mut [u8]) {
    self.key.encode(&mut out[..K::SIZE]);
    self.value.encode(&mut out[K::SIZE..Self::LEFT]);
    Fixed::encode(&self.left, &mut out[Self::LEFT..Self::RIGHT]);
    Fixed::encode(&self.right, &mut out[Self::RIGHT..]);
  }

  fn decode(bytes: &[u8]) -> Self {
    Node {
      key: K::decode(&bytes[..K::SIZE]),
      value: V::decode(&bytes[K::SIZE..Self::LEFT]),
      left: <u64 as Fixed>::decode(&bytes[Self::LEFT..Self::RIGHT]),
      right: <u64 as Fixed>::decode(&bytes[Self::RIGHT..]),
    }
  }
}

/// # Variable-size element
pub trait Variable: Sized {
  /// Number of bytes [`Variable::encode`] appends.
  fn encoded_len(&self) -> usize;

  /// Appends the encoding to `out`.
  fn encode(&self, out: &mut Vec<u8>);

  /// Length of the element at the front of `bytes`, which may hold more after it.
  fn measure(bytes: &[u8]) -> Result<usize>;

  /// Reads an element from exactly its own encoding.
  fn decode(bytes: &[u8]) -> Result<Self>;

  /// Convenience wrapper around [`Variable::encode`].
  fn to_bytes(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(self.encoded_len());
    self.encode(&mut out);
    out
  }
}

/// Splits a length-prefixed payload off the front of `bytes`: returns the prefix length and the
/// payload length.
fn measure_prefixed(bytes: &[u8]) -> Result<(usize, usize)> {
  let (len, used) = prefix_varint::decode(bytes)
    .ok_or_else(|| Error::Truncated { needed: used_hint(bytes), available: bytes.len() })?;
  let len = usize::try_from(len).map_err(|_| Error::Malformed(format!("length {} overflows", len)))?;
  let total = used.checked_add(len).ok_or_else(|| Error::Malformed(format!("length {} overflows", len)))?;
  if bytes.len() < total {
    return Err(Error::Truncated { needed: total, available: bytes.len() });
  }
  Ok((used, len))
}

/// Prefix length announced by the first byte, for error reporting.
fn used_hint(bytes: &[u8]) -> usize {
  match bytes.first() {
    Some(initial) => 1 + (*initial as u32 | 0x100).trailing_zeros() as usize,
    None => 1,
  }
}

fn decode_prefixed(bytes: &[u8]) -> Result<&[u8]> {
  let (used, len) = measure_prefixed(bytes)?;
  if bytes.len() != used + len {
    return Err(Error::Malformed(format!("{} trailing bytes after element", bytes.len() - used - len)));
  }
  Ok(&bytes[used..])
}

impl Variable for Vec<u8> {
  fn encoded_len(&self) -> usize {
    prefix_varint::encoded_len(self.len() as u64) + self.len()
  }

  fn encode(&self, out: &mut Vec<u8>) {
    prefix_varint::encode(self.len() as u64, out);
    out.extend_from_slice(self);
  }

  fn measure(bytes: &[u8]) -> Result<usize> {
    let (used, len) = measure_prefixed(bytes)?;
    Ok(used + len)
  }

  fn decode(bytes: &[u8]) -> Result<Self> {
    Ok(decode_prefixed(bytes)?.to_vec())
  }
}

impl Variable for String {
  fn encoded_len(&self) -> usize {
    prefix_varint::encoded_len(self.len() as u64) + self.len()
  }

  fn encode(&self, out: &mut Vec<u8>) {
    prefix_varint::encode(self.len() as u64, out);
    out.extend_from_slice(self.as_bytes());
  }

  fn measure(bytes: &[u8]) -> Result<usize> {
    let (used, len) = measure_prefixed(bytes)?;
    Ok(used + len)
  }

  fn decode(bytes: &[u8]) -> Result<Self> {
    let payload = decode_prefixed(bytes)?;
    String::from_utf8(payload.to_vec()).map_err(|err| Error::Malformed(err.to_string()))
  }
}

impl Variable for u64 {
  fn encoded_len(&self) -> usize {
    8
  }

  fn encode(&self, out: &mut Vec<u8>) {
    out.extend_from_slice(&self.to_le_bytes());
  }

  fn measure(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < 8 {
      return Err(Error::Truncated { needed: 8, available: bytes.len() });
    }
    Ok(8)
  }

  fn decode(bytes: &[u8]) -> Result<Self> {
    if bytes.len() != 8 {
      return Err(Error::Malformed(format!("u64 element of {} bytes", bytes.len())));
    }
    Ok(<u64 as Fixed>::decode(bytes))
  }
}

/// Walks a run of back-to-back variable elements, yielding the byte range of each.
pub(crate) struct Walk<'a, F> {
  bytes: &'a [u8],
  offset: usize,
  measure: F,
}

impl<'a, F: FnMut(&[u8]) -> Result<usize>> Walk<'a, F> {
  pub(crate) fn new(bytes: &'a [u8], measure: F) -> Self {
    Walk { bytes, offset: 0, measure }
  }
}

impl<F: FnMut(&[u8]) -> Result<usize>> Iterator for Walk<'_, F> {
  type Item = Result<std::ops::Range<usize>>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.offset >= self.bytes.len() {
      return None;
    }
    match (self.measure)(&self.bytes[self.offset..]) {
      Ok(0) => {
        self.offset = self.bytes.len();
        Some(Err(Error::Malformed("zero-length element".to_owned())))
      }
      Ok(len) => {
        let start = self.offset;
        self.offset += len;
        Some(Ok(start..self.offset))
      }
      Err(err) => {
        self.offset = self.bytes.len();
        Some(Err(err))
      }
    }
  }
}

/// Checks that `from..to` is a range of whole elements within `payload`.
pub(crate) fn check_boundaries(
  payload: &[u8],
  measure: impl FnMut(&[u8]) -> Result<usize>,
  from: usize,
  to: usize,
) -> Result<()> {
  if from > to || to > payload.len() {
    return Err(Error::OutOfRange);
  }
  let (mut from_found, mut to_found) = (from == 0, to == 0);
  for range in Walk::new(payload, measure) {
    let end = range?.end;
    from_found |= end == from;
    to_found |= end == to;
  }
  if from_found && to_found {
    Ok(())
  } else {
    Err(Error::OutOfRange)
  }
}

/// Splits a diff into element ranges, which must cover it exactly.
pub(crate) fn diff_ranges(
  diff: &[u8],
  measure: impl FnMut(&[u8]) -> Result<usize>,
) -> Result<Vec<std::ops::Range<usize>>> {
  let mut ranges = Vec::new();
  for range in Walk::new(diff, measure) {
    match range {
      Ok(range) => ranges.push(range),
      Err(Error::Truncated { .. }) => {
        let actual = ranges.last().map_or(0, |x: &std::ops::Range<usize>| x.end);
        return Err(Error::DiffSizeMismatch { expected: diff.len(), actual });
      }
      Err(err) => return Err(err),
    }
  }
  Ok(ranges)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fixed_layouts() {
    assert_eq!(0x0102_0304u32.to_bytes(), vec![4, 3, 2, 1]);
    assert_eq!(<Pair<u16, u8>>::SIZE, 4);
    assert_eq!(Pair { deleted: true, key: 0x0102u16, value: 9u8 }.to_bytes(), vec![1, 2, 1, 9]);
    assert_eq!(<Node<u32, [u8; 2]>>::SIZE, 22);

    let node = Node { key: 7u32, value: *b"ab", left: 3, right: 258 };
    let bytes = node.to_bytes();
    assert_eq!(&bytes[..6], &[7, 0, 0, 0, b'a', b'b']);
    assert_eq!(&bytes[6..14], &3u64.to_le_bytes());
    assert_eq!(<Node<u32, [u8; 2]>>::decode(&bytes), node);
  }

  #[test]
  fn test_variable_measure() {
    let mut bytes = "hello".to_owned().to_bytes();
    assert_eq!(bytes, b"\x0bhello");
    bytes.extend_from_slice(b"trailing");
    assert_eq!(String::measure(&bytes).unwrap(), 6);
    assert!(matches!(String::decode(&bytes), Err(Error::Malformed(_))));
    assert_eq!(String::decode(&bytes[..6]).unwrap(), "hello");
    assert!(matches!(String::measure(&bytes[..3]), Err(Error::Truncated { needed: 6, available: 3 })));

    let long = vec![0xEE; 300];
    let encoded = long.to_bytes();
    assert_eq!(encoded.len(), long.encoded_len());
    assert_eq!(Vec::<u8>::measure(&encoded).unwrap(), 302);
    assert_eq!(Vec::<u8>::decode(&encoded).unwrap(), long);
  }

  #[test]
  fn test_invalid_utf8() {
    let encoded = vec![0xFFu8, 0xFE].to_bytes();
    assert!(matches!(String::decode(&encoded), Err(Error::Malformed(_))));
  }

  #[test]
  fn test_walk() {
    let mut bytes = Vec::new();
    for word in ["a", "", "ccc"] {
      word.to_owned().encode(&mut bytes);
    }
    let ranges: Vec<_> = Walk::new(&bytes, String::measure).map(|x| x.unwrap()).collect();
    assert_eq!(ranges, vec![0..2, 2..3, 3..7]);

    bytes.push(0x05);
    let last = Walk::new(&bytes, String::measure).last().unwrap();
    assert!(matches!(last, Err(Error::Truncated { .. })));
  }

  #[test]
  fn test_boundaries() {
    let mut bytes = Vec::new();
    for word in ["ab", "c"] {
      word.to_owned().encode(&mut bytes);
    }
    check_boundaries(&bytes, String::measure, 0, 5).unwrap();
    check_boundaries(&bytes, String::measure, 3, 3).unwrap();
    assert!(matches!(check_boundaries(&bytes, String::measure, 1, 3), Err(Error::OutOfRange)));
    assert!(matches!(check_boundaries(&bytes, String::measure, 0, 6), Err(Error::OutOfRange)));

    assert_eq!(diff_ranges(&bytes, String::measure).unwrap(), vec![0..3, 3..5]);
    let err = diff_ranges(&bytes[..4], String::measure).unwrap_err();
    assert!(matches!(err, Error::DiffSizeMismatch { expected: 4, actual: 3 }));
  }
}
