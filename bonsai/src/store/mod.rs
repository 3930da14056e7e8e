//! Page storage used by the bonsai trees: page stores, page files with
//! atomic units, the write cache and the atomic operation queue.

mod atomic_operation;
mod page_file;
mod page_store;
mod write_cache;

pub use atomic_operation::*;
pub use page_file::*;
pub use page_store::*;
pub use write_cache::*;
