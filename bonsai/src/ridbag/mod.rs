//! Rid bags: multisets of record links kept as pending deltas over a bonsai tree.

mod change;
mod event;
mod rid_bag;

pub use change::*;
pub use event::*;
pub use rid_bag::*;
