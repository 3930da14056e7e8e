mod constants;
mod lock;
mod record;
mod type_utils;

pub use constants::*;
pub use lock::*;
pub use record::*;
pub use type_utils::*;
