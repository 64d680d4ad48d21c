//! File system helpers: tree walking and atomic writes.

pub mod atomic;
pub mod walker;

pub use atomic::{write_atomic, write_json_atomic};
pub use walker::{walk_directory, FileInfo, WalkOptions};
