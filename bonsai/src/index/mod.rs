//! Posting sets of secondary indexes: embedded while small, backed by a
//! bonsai tree once they grow.

mod embedded_or_tree_set;
pub mod posting_codec;

pub use embedded_or_tree_set::*;
