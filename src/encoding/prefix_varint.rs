//! # Prefix-varint length prefixes
//!
//! Variable-size elements start with their payload length in this format, so a reader can
//! measure an element from its first few bytes without an external index. The number of
//! trailing zero bits in the first byte gives the number of following bytes; a zero first byte
//! means a full 8-byte little-endian value follows.
//!
//! See: <https://github.com/WebAssembly/design/issues/601#issuecomment-196022303>

fn load_le(p: &[u8]) -> u64 {
  let mut array = [0u8; 8];
  let len = p.len().min(8);
  array[..len].copy_from_slice(&p[..len]);
  u64::from_le_bytes(array)
}

/// Total encoded length (including the first byte) implied by the first byte.
fn encoded_length(initial: u8) -> usize {
  1 + (initial as u32 | 0x100).trailing_zeros() as usize
}

/// Number of bytes that [`encode`] emits for `x`.
pub fn encoded_len(x: u64) -> usize {
  let bits = 64 - (x | 1).leading_zeros() as usize;
  if bits > 56 {
    9
  } else {
    1 + (bits - 1) / 7
  }
}

/// Decodes a value from the front of `p`, returning it along with the number of bytes consumed.
///
/// Returns `None` when `p` is too short to hold the encoding announced by its first byte.
pub fn decode(p: &[u8]) -> Option<(u64, usize)> {
  let length = encoded_length(*p.first()?);
  if p.len() < length {
    return None;
  }
  let value = if length < 9 {
    let unused = 64 - 8 * length as u32;
    load_le(&p[..length]) << unused >> (unused + length as u32)
  } else {
    load_le(&p[1..9])
  };
  Some((value, length))
}

/// Appends the encoding of `x` to `output`.
pub fn encode(x: u64, output: &mut Vec<u8>) {
  let bytes = encoded_len(x);
  if bytes == 9 {
    output.push(0);
    output.extend_from_slice(&x.to_le_bytes());
    return;
  }
  let mut x = (x << bytes) | (1 << (bytes - 1));
  for _ in 0..bytes {
    output.push((x & 0xff) as u8);
    x >>= 8;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::Rng;

  fn known_encodings() -> Vec<(u64, Vec<u8>)> {
    vec![
      (0, vec![0x01]),
      (1, vec![0x03]),
      (127, vec![0xFF]),
      (128, vec![0x02, 0x02]),
      (255, vec![0xFE, 0x03]),
      (8192, vec![0x02, 0x80]),
      (16383, vec![0xFE, 0xFF]),
      (16384, vec![0x04, 0x00, 0x02]),
      (1 << 56, vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01]),
      (u64::MAX, vec![0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
    ]
  }

  #[test]
  fn test_encoded_length() {
    let test_cases = vec![
      (0b00000001, 1),
      (0b00000010, 2),
      (0b00000100, 3),
      (0b00001000, 4),
      (0b00010000, 5),
      (0b00100000, 6),
      (0b01000000, 7),
      (0b10000000, 8),
      (0b00000000, 9),
    ];
    for (initial, expected) in test_cases {
      assert_eq!(encoded_length(initial), expected, "Initial byte: {:08b}", initial);
    }
  }

  #[test]
  fn test_specific_encode() {
    for (decoded, encoded) in known_encodings() {
      let mut output = Vec::new();
      encode(decoded, &mut output);
      assert_eq!(output, encoded, "Failed for decoded value: {}", decoded);
      assert_eq!(encoded_len(decoded), encoded.len());
    }
  }

  #[test]
  fn test_specific_decode() {
    for (decoded, encoded) in known_encodings() {
      assert_eq!(decode(&encoded), Some((decoded, encoded.len())), "Failed for encoded bytes: {:?}", encoded);
    }
  }

  #[test]
  fn test_decode_ignores_trailing_bytes() {
    // Element payloads follow the length prefix directly.
    assert_eq!(decode(&[0x02, 0x02, 0xAA, 0xBB]), Some((128, 2)));
    assert_eq!(decode(&[0x03, 0xFF]), Some((1, 1)));
  }

  #[test]
  fn test_decode_truncated() {
    assert_eq!(decode(&[]), None);
    assert_eq!(decode(&[0x04, 0x00]), None);
    assert_eq!(decode(&[0x00, 0xFF, 0xFF]), None);
  }

  #[test]
  fn test_random_values_in_sequence() {
    // A stream of prefixes can be walked one value at a time.
    let mut rng = rand::thread_rng();
    let values: Vec<u64> = (0..1000).map(|_| rng.gen::<u64>() >> rng.gen_range(0..64)).collect();
    let mut encoded = Vec::new();
    for &value in &values {
      encode(value, &mut encoded);
    }
    let mut rest = &encoded[..];
    for &value in &values {
      let (decoded, used) = decode(rest).unwrap();
      assert_eq!(decoded, value);
      rest = &rest[used..];
    }
    assert!(rest.is_empty());
  }
}
