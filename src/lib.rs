//! # Pagegraph
//!
//! Storage primitives for a graph database: append-only containers that live directly inside a
//! growable byte region, a lazily committed paged region to hold them, and the versioned
//! multi-file page table that makes the paged region durable.
//!
//! A file-backed region is usually opened through [`Config::open`]. Containers are placed in it
//! with [`PageAllocator::slot`], or in a [`WholeFileMapping`] through its writer.

pub mod append;
pub mod config;
pub mod encoding;
pub mod error;
pub mod storage;

pub use append::{BinaryTree, CollisionHashMap, DictFixed, DictVariable, Ensure, Kind, ReadOnly, Set, SetVariable};
pub use config::Config;
pub use error::{Error, Result};
pub use storage::file_graph::{FileGraph, GraphUid, WholeFileName};
pub use storage::paging::{PageAllocator, PagedSlot, Style};
pub use storage::whole_file::WholeFileMapping;
