/// Event type rid bag change events are published under.
pub const CHANGE_EVENT: &str = "bonsai_change_event";

/// Prefix of the bonsai file that backs the trees of one cluster.
pub const COLLECTIONS_FILE_PREFIX: &str = "collections_";
/// Extension of rid bag tree files.
pub const COLLECTIONS_FILE_EXTENSION: &str = ".sbc";
/// Extension of posting set tree files.
pub const POSTING_FILE_EXTENSION: &str = ".irs";

pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;
pub const DEFAULT_BUCKET_SIZE: usize = 2 * 1024;
pub const DEFAULT_FREE_SPACE_REUSE_TRIGGER: f32 = 0.5;
pub const DEFAULT_CACHE_MAX_SIZE: usize = 100_000;
pub const DEFAULT_EVICTION_THRESHOLD: usize = 1_000;
pub const DEFAULT_RIDBAG_PREFETCH_SIZE: usize = 1_000;
pub const DEFAULT_TOP_THRESHOLD: usize = 80;
pub const DEFAULT_BOTTOM_THRESHOLD: usize = 60;

/// Size of the fixed rid bag header: page index, page offset and size.
pub const RIDBAG_HEADER_SIZE: usize = 8 + 4 + 4;
