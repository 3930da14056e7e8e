mod bucket;
mod pointer;
mod sys_bucket;
#[allow(clippy::module_inception)]
mod tree;
mod value;

pub use bucket::*;
pub use pointer::*;
pub use sys_bucket::*;
pub use tree::*;
pub use value::*;
