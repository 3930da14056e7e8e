//! Configuration for bonsai trees, the tree handle cache and the link collections.

use crate::common::{
    atomic, Atomic, Guarded, DEFAULT_BOTTOM_THRESHOLD, DEFAULT_BUCKET_SIZE,
    DEFAULT_CACHE_MAX_SIZE, DEFAULT_EVICTION_THRESHOLD, DEFAULT_FREE_SPACE_REUSE_TRIGGER,
    DEFAULT_PAGE_SIZE, DEFAULT_RIDBAG_PREFETCH_SIZE, DEFAULT_TOP_THRESHOLD,
};
use crate::errors::{BonsaiError, BonsaiResult, ErrorKind};
use crate::tree::MIN_BUCKET_SIZE;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Public interface for bonsai configuration.
///
/// All clones share the same settings. Page geometry can only be changed
/// until the configuration is handed to a [`TreeHandleCache`](crate::cache::TreeHandleCache);
/// the remaining settings stay adjustable.
///
/// # Examples
///
/// ```rust
/// use bonsai::config::BonsaiConfig;
///
/// let config = BonsaiConfig::builder()
///     .thresholds(40, 20)
///     .cache_max_size(1000)
///     .build()
///     .unwrap();
/// assert_eq!(config.top_threshold(), 40);
/// assert_eq!(config.page_size(), 64 * 1024);
/// ```
#[derive(Clone)]
pub struct BonsaiConfig {
    inner: Arc<BonsaiConfigInner>,
}

impl Default for BonsaiConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BonsaiConfig {
    /// Creates a new configuration instance with default values.
    pub fn new() -> Self {
        BonsaiConfig {
            inner: Arc::new(BonsaiConfigInner::new()),
        }
    }

    /// Returns a builder starting from the default values.
    pub fn builder() -> BonsaiConfigBuilder {
        BonsaiConfigBuilder::new()
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size.load(Ordering::Relaxed)
    }

    pub fn bucket_size(&self) -> usize {
        self.inner.bucket_size.load(Ordering::Relaxed)
    }

    /// Sets the page and bucket sizes of newly created bonsai files.
    ///
    /// # Errors
    ///
    /// Returns error if the geometry is frozen, if the bucket is too small to
    /// hold a split, or if the bucket size does not divide the page size.
    pub fn set_geometry(&self, page_size: usize, bucket_size: usize) -> BonsaiResult<()> {
        self.inner.set_geometry(page_size, bucket_size)
    }

    /// Fraction of free-listed buckets over all buckets at which allocation
    /// starts reusing the free list.
    pub fn free_space_reuse_trigger(&self) -> f32 {
        f32::from_bits(self.inner.free_space_reuse_trigger.load(Ordering::Relaxed))
    }

    pub fn set_free_space_reuse_trigger(&self, trigger: f32) -> BonsaiResult<()> {
        self.inner.set_free_space_reuse_trigger(trigger)
    }

    /// Number of cached tree handles above which eviction kicks in.
    pub fn cache_max_size(&self) -> usize {
        self.inner.cache_max_size.load(Ordering::Relaxed)
    }

    pub fn set_cache_max_size(&self, size: usize) -> BonsaiResult<()> {
        self.inner.set_positive(&self.inner.cache_max_size, size, "Cache max size")
    }

    /// Number of least recently used handles inspected by one eviction pass.
    pub fn eviction_threshold(&self) -> usize {
        self.inner.eviction_threshold.load(Ordering::Relaxed)
    }

    pub fn set_eviction_threshold(&self, threshold: usize) -> BonsaiResult<()> {
        self.inner
            .set_positive(&self.inner.eviction_threshold, threshold, "Eviction threshold")
    }

    /// Number of tree entries a rid bag iterator fetches per tree round-trip.
    pub fn ridbag_prefetch_size(&self) -> usize {
        self.inner.ridbag_prefetch_size.load(Ordering::Relaxed)
    }

    pub fn set_ridbag_prefetch_size(&self, size: usize) -> BonsaiResult<()> {
        self.inner
            .set_positive(&self.inner.ridbag_prefetch_size, size, "Rid bag prefetch size")
    }

    /// Size above which an embedded set is promoted to a tree.
    pub fn top_threshold(&self) -> usize {
        self.inner.top_threshold.load(Ordering::Relaxed)
    }

    /// Size below which a tree-backed set is demoted to an embedded set.
    pub fn bottom_threshold(&self) -> usize {
        self.inner.bottom_threshold.load(Ordering::Relaxed)
    }

    /// Sets both promotion thresholds.
    ///
    /// # Errors
    ///
    /// Returns error unless `0 < bottom < top`.
    pub fn set_thresholds(&self, top: usize, bottom: usize) -> BonsaiResult<()> {
        self.inner.set_thresholds(top, bottom)
    }

    pub fn durable_non_tx(&self) -> bool {
        self.inner.durable_non_tx.load(Ordering::Relaxed)
    }

    pub fn set_durable_non_tx(&self, durable: bool) {
        self.inner.durable_non_tx.store(durable, Ordering::Relaxed)
    }

    /// Directory holding the bonsai files, or `None` for in-memory storage.
    pub fn storage_path(&self) -> Option<PathBuf> {
        self.inner.storage_path.read_with(|path| path.clone())
    }

    pub fn set_storage_path(&self, path: impl AsRef<Path>) -> BonsaiResult<()> {
        self.inner.set_storage_path(path.as_ref())
    }

    /// Prevents further geometry changes. Called when the configuration starts
    /// backing page files.
    pub(crate) fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::Relaxed);
    }
}

struct BonsaiConfigInner {
    frozen: AtomicBool,
    page_size: AtomicUsize,
    bucket_size: AtomicUsize,
    free_space_reuse_trigger: AtomicU32,
    cache_max_size: AtomicUsize,
    eviction_threshold: AtomicUsize,
    ridbag_prefetch_size: AtomicUsize,
    top_threshold: AtomicUsize,
    bottom_threshold: AtomicUsize,
    durable_non_tx: AtomicBool,
    storage_path: Atomic<Option<PathBuf>>,
}

impl BonsaiConfigInner {
    fn new() -> Self {
        BonsaiConfigInner {
            frozen: AtomicBool::new(false),
            page_size: AtomicUsize::new(DEFAULT_PAGE_SIZE),
            bucket_size: AtomicUsize::new(DEFAULT_BUCKET_SIZE),
            free_space_reuse_trigger: AtomicU32::new(DEFAULT_FREE_SPACE_REUSE_TRIGGER.to_bits()),
            cache_max_size: AtomicUsize::new(DEFAULT_CACHE_MAX_SIZE),
            eviction_threshold: AtomicUsize::new(DEFAULT_EVICTION_THRESHOLD),
            ridbag_prefetch_size: AtomicUsize::new(DEFAULT_RIDBAG_PREFETCH_SIZE),
            top_threshold: AtomicUsize::new(DEFAULT_TOP_THRESHOLD),
            bottom_threshold: AtomicUsize::new(DEFAULT_BOTTOM_THRESHOLD),
            durable_non_tx: AtomicBool::new(false),
            storage_path: atomic(None),
        }
    }

    fn set_geometry(&self, page_size: usize, bucket_size: usize) -> BonsaiResult<()> {
        if self.frozen.load(Ordering::Relaxed) {
            log::error!("Page geometry cannot be changed once page files are open");
            return Err(BonsaiError::new(
                "Page geometry cannot be changed once page files are open",
                ErrorKind::InvalidOperation,
            ));
        }

        if bucket_size < MIN_BUCKET_SIZE {
            log::error!("Bucket size {} is below the minimum of {}", bucket_size, MIN_BUCKET_SIZE);
            return Err(BonsaiError::new(
                &format!("Bucket size must be at least {} bytes", MIN_BUCKET_SIZE),
                ErrorKind::ValidationError,
            ));
        }

        if page_size < bucket_size || page_size % bucket_size != 0 {
            log::error!("Bucket size {} does not divide page size {}", bucket_size, page_size);
            return Err(BonsaiError::new(
                &format!(
                    "Bucket size {} must divide page size {}",
                    bucket_size, page_size
                ),
                ErrorKind::ValidationError,
            ));
        }

        self.page_size.store(page_size, Ordering::Relaxed);
        self.bucket_size.store(bucket_size, Ordering::Relaxed);
        Ok(())
    }

    fn set_free_space_reuse_trigger(&self, trigger: f32) -> BonsaiResult<()> {
        if !(0.0..=1.0).contains(&trigger) {
            log::error!("Free space reuse trigger {} is out of range", trigger);
            return Err(BonsaiError::new(
                "Free space reuse trigger must be between 0 and 1",
                ErrorKind::ValidationError,
            ));
        }
        self.free_space_reuse_trigger
            .store(trigger.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn set_positive(&self, slot: &AtomicUsize, value: usize, name: &str) -> BonsaiResult<()> {
        if value == 0 {
            log::error!("{} must be greater than zero", name);
            return Err(BonsaiError::new(
                &format!("{} must be greater than zero", name),
                ErrorKind::ValidationError,
            ));
        }
        slot.store(value, Ordering::Relaxed);
        Ok(())
    }

    fn set_thresholds(&self, top: usize, bottom: usize) -> BonsaiResult<()> {
        if bottom == 0 || bottom >= top {
            log::error!("Invalid thresholds: top {} bottom {}", top, bottom);
            return Err(BonsaiError::new(
                &format!(
                    "Bottom threshold {} must be positive and below top threshold {}",
                    bottom, top
                ),
                ErrorKind::ValidationError,
            ));
        }
        self.top_threshold.store(top, Ordering::Relaxed);
        self.bottom_threshold.store(bottom, Ordering::Relaxed);
        Ok(())
    }

    fn set_storage_path(&self, path: &Path) -> BonsaiResult<()> {
        if self.frozen.load(Ordering::Relaxed) {
            log::error!("Storage path cannot be changed once page files are open");
            return Err(BonsaiError::new(
                "Storage path cannot be changed once page files are open",
                ErrorKind::InvalidOperation,
            ));
        }
        if path.as_os_str().is_empty() {
            return Err(BonsaiError::new(
                "Storage path cannot be empty",
                ErrorKind::ValidationError,
            ));
        }
        self.storage_path
            .write_with(|current| *current = Some(path.to_path_buf()));
        Ok(())
    }
}

/// Builder for [`BonsaiConfig`].
///
/// The first rejected value is captured and returned by [`BonsaiConfigBuilder::build`].
#[derive(Default)]
pub struct BonsaiConfigBuilder {
    error: Option<BonsaiError>,
    config: BonsaiConfig,
}

impl BonsaiConfigBuilder {
    pub fn new() -> Self {
        BonsaiConfigBuilder {
            error: None,
            config: BonsaiConfig::new(),
        }
    }

    fn apply(mut self, f: impl FnOnce(&BonsaiConfig) -> BonsaiResult<()>) -> Self {
        if self.error.is_none() {
            if let Err(e) = f(&self.config) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Sets the page and bucket sizes.
    pub fn geometry(self, page_size: usize, bucket_size: usize) -> Self {
        self.apply(|c| c.set_geometry(page_size, bucket_size))
    }

    pub fn free_space_reuse_trigger(self, trigger: f32) -> Self {
        self.apply(|c| c.set_free_space_reuse_trigger(trigger))
    }

    pub fn cache_max_size(self, size: usize) -> Self {
        self.apply(|c| c.set_cache_max_size(size))
    }

    pub fn eviction_threshold(self, threshold: usize) -> Self {
        self.apply(|c| c.set_eviction_threshold(threshold))
    }

    pub fn ridbag_prefetch_size(self, size: usize) -> Self {
        self.apply(|c| c.set_ridbag_prefetch_size(size))
    }

    /// Sets the promotion (`top`) and demotion (`bottom`) thresholds.
    pub fn thresholds(self, top: usize, bottom: usize) -> Self {
        self.apply(|c| c.set_thresholds(top, bottom))
    }

    pub fn durable_non_tx(self, durable: bool) -> Self {
        self.apply(|c| {
            c.set_durable_non_tx(durable);
            Ok(())
        })
    }

    /// Stores bonsai files under `path` instead of in memory.
    pub fn storage_path(self, path: impl AsRef<Path>) -> Self {
        self.apply(|c| c.set_storage_path(path))
    }

    /// Returns the configuration or the first error captured while building it.
    pub fn build(self) -> BonsaiResult<BonsaiConfig> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BonsaiConfig::new();
        assert_eq!(config.page_size(), 65536);
        assert_eq!(config.bucket_size(), 2048);
        assert_eq!(config.free_space_reuse_trigger(), 0.5);
        assert_eq!(config.cache_max_size(), 100_000);
        assert_eq!(config.eviction_threshold(), 1000);
        assert_eq!(config.ridbag_prefetch_size(), 1000);
        assert_eq!(config.top_threshold(), 80);
        assert_eq!(config.bottom_threshold(), 60);
        assert!(!config.durable_non_tx());
        assert!(config.storage_path().is_none());
    }

    #[test]
    fn test_clones_share_settings() {
        let config = BonsaiConfig::new();
        let other = config.clone();
        other.set_cache_max_size(10).unwrap();
        assert_eq!(config.cache_max_size(), 10);
    }

    #[test]
    fn test_thresholds_validation() {
        let config = BonsaiConfig::new();
        assert!(config.set_thresholds(10, 10).is_err());
        assert!(config.set_thresholds(10, 0).is_err());
        assert!(config.set_thresholds(10, 20).is_err());
        config.set_thresholds(10, 5).unwrap();
        assert_eq!(config.top_threshold(), 10);
        assert_eq!(config.bottom_threshold(), 5);
    }

    #[test]
    fn test_geometry_validation() {
        let config = BonsaiConfig::new();
        let err = config.set_geometry(4096, 1000).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ValidationError);
        assert!(config.set_geometry(4096, 64).is_err());
        assert!(config.set_geometry(512, 1024).is_err());
        config.set_geometry(4096, 512).unwrap();
        assert_eq!(config.page_size(), 4096);
        assert_eq!(config.bucket_size(), 512);
    }

    #[test]
    fn test_geometry_frozen() {
        let config = BonsaiConfig::new();
        config.freeze();
        let err = config.set_geometry(4096, 512).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
        assert!(config.set_storage_path("/tmp/bonsai").is_err());
        // non geometry settings stay adjustable
        config.set_thresholds(8, 4).unwrap();
    }

    #[test]
    fn test_positive_values() {
        let config = BonsaiConfig::new();
        assert!(config.set_cache_max_size(0).is_err());
        assert!(config.set_eviction_threshold(0).is_err());
        assert!(config.set_ridbag_prefetch_size(0).is_err());
        assert!(config.set_free_space_reuse_trigger(1.5).is_err());
        config.set_free_space_reuse_trigger(0.0).unwrap();
    }

    #[test]
    fn test_builder_captures_first_error() {
        let result = BonsaiConfig::builder()
            .cache_max_size(0)
            .thresholds(1, 2)
            .build();
        let err = result.err().unwrap();
        assert!(err.message().contains("Cache max size"));
    }

    #[test]
    fn test_builder_sets_values() {
        let config = BonsaiConfig::builder()
            .geometry(8192, 1024)
            .free_space_reuse_trigger(0.25)
            .cache_max_size(2)
            .eviction_threshold(1)
            .ridbag_prefetch_size(3)
            .thresholds(4, 2)
            .durable_non_tx(true)
            .storage_path("/tmp/bonsai-config-test")
            .build()
            .unwrap();
        assert_eq!(config.page_size(), 8192);
        assert_eq!(config.bucket_size(), 1024);
        assert_eq!(config.free_space_reuse_trigger(), 0.25);
        assert_eq!(config.cache_max_size(), 2);
        assert_eq!(config.eviction_threshold(), 1);
        assert_eq!(config.ridbag_prefetch_size(), 3);
        assert_eq!(config.top_threshold(), 4);
        assert_eq!(config.bottom_threshold(), 2);
        assert!(config.durable_non_tx());
        assert_eq!(
            config.storage_path(),
            Some(PathBuf::from("/tmp/bonsai-config-test"))
        );
    }
}
