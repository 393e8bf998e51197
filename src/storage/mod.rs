//! # Storage layers
//!
//! The paged region and its on-disk page table, the whole-file regions, and the file system
//! abstraction they are written against.

pub mod file_graph;
pub mod paging;
pub mod vfs;
pub mod whole_file;
