//! # Byte-level encodings shared by the stored element formats

pub mod prefix_varint;
