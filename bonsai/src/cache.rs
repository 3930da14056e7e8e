//! Shared, reference counted handles to bonsai trees.

use crate::common::{StripedLocks, COLLECTIONS_FILE_EXTENSION, COLLECTIONS_FILE_PREFIX};
use crate::config::BonsaiConfig;
use crate::errors::{BonsaiError, BonsaiResult, ErrorKind};
use crate::get_cpu_count;
use crate::store::WriteCache;
use crate::tree::{BonsaiTree, BucketValue, CollectionPointer};
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// A cached tree together with the number of outstanding borrows.
///
/// `usages` is only changed while the shard lock of the tree's pointer is held.
pub struct TreeHandleContainer<V> {
    tree: BonsaiTree<V>,
    usages: AtomicI32,
}

impl<V: BucketValue> TreeHandleContainer<V> {
    fn new(tree: BonsaiTree<V>) -> Self {
        TreeHandleContainer {
            tree,
            usages: AtomicI32::new(0),
        }
    }

    pub fn usages(&self) -> i32 {
        self.usages.load(Ordering::SeqCst)
    }
}

/// Process wide cache of open bonsai trees, keyed by [`CollectionPointer`].
///
/// Every borrow obtained through [`TreeHandleCache::create_sb_tree`] or
/// [`TreeHandleCache::load_sb_tree`] must be returned exactly once, either by
/// dropping the [`TreeHandle`] or by calling [`TreeHandle::release`]. Trees
/// with no outstanding borrows are evicted in least recently used order once
/// the cache holds more than `cache_max_size` entries.
///
/// All clones share the same registry.
pub struct TreeHandleCache<V> {
    inner: Arc<TreeHandleCacheInner<V>>,
}

impl<V> Clone for TreeHandleCache<V> {
    fn clone(&self) -> Self {
        TreeHandleCache {
            inner: self.inner.clone(),
        }
    }
}

struct TreeHandleCacheInner<V> {
    write_cache: WriteCache,
    locks: StripedLocks,
    registry: Mutex<LruCache<CollectionPointer, Arc<TreeHandleContainer<V>>>>,
    closed: AtomicBool,
}

impl<V: BucketValue> TreeHandleCache<V> {
    /// Creates an empty cache over `write_cache`. The configuration of the
    /// write cache drives sizing and eviction.
    pub fn new(write_cache: WriteCache) -> Self {
        let stripes = 4 * get_cpu_count();
        TreeHandleCache {
            inner: Arc::new(TreeHandleCacheInner {
                write_cache,
                locks: StripedLocks::new(stripes),
                registry: Mutex::new(LruCache::unbounded()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn write_cache(&self) -> &WriteCache {
        &self.inner.write_cache
    }

    pub fn config(&self) -> &BonsaiConfig {
        self.inner.write_cache.config()
    }

    /// Number of shard locks.
    pub fn shards(&self) -> usize {
        self.inner.locks.stripes()
    }

    /// Creates a new tree in the collections file of `cluster_id` and returns
    /// it borrowed once.
    ///
    /// # Arguments
    ///
    /// * `cluster_id` - the cluster whose `collections_<cluster>.sbc` file hosts the tree.
    ///
    /// # Returns
    ///
    /// The borrowed tree and its pointer.
    pub fn create_sb_tree(&self, cluster_id: i32) -> BonsaiResult<(TreeHandle<V>, CollectionPointer)> {
        let name = format!(
            "{}{}{}",
            COLLECTIONS_FILE_PREFIX, cluster_id, COLLECTIONS_FILE_EXTENSION
        );
        self.create_sb_tree_in(&name)
    }

    /// Creates a new tree in the bonsai file called `file_name` and returns it
    /// borrowed once.
    pub fn create_sb_tree_in(&self, file_name: &str) -> BonsaiResult<(TreeHandle<V>, CollectionPointer)> {
        self.ensure_open()?;
        let file_id = self.inner.write_cache.open_file(file_name)?;
        let file = self.inner.write_cache.file(file_id)?;
        let tree = BonsaiTree::create(file, self.config())?;
        let pointer = tree.collection_pointer();

        let container = Arc::new(TreeHandleContainer::new(tree));
        {
            let _guard = self.inner.locks.lock(&pointer);
            container.usages.fetch_add(1, Ordering::SeqCst);
            self.inner.registry.lock().put(pointer, container.clone());
        }
        log::debug!("Created tree {} in {}", pointer, file_name);

        self.evict();
        Ok((TreeHandle::new(self.clone(), container), pointer))
    }

    /// Borrows the tree at `pointer`, loading it on a cache miss.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::StructuralCorruption`] when the pointer does not
    /// lead to a live tree root.
    pub fn load_sb_tree(&self, pointer: &CollectionPointer) -> BonsaiResult<TreeHandle<V>> {
        self.ensure_open()?;
        let container = {
            let _guard = self.inner.locks.lock(pointer);
            let cached = self.inner.registry.lock().get(pointer).cloned();
            let container = match cached {
                Some(container) => container,
                None => {
                    log::debug!("Tree {} not cached, loading", pointer);
                    let file = self.inner.write_cache.file(pointer.file_id())?;
                    let tree = BonsaiTree::load(file, pointer.root_pointer(), self.config())?;
                    let container = Arc::new(TreeHandleContainer::new(tree));
                    self.inner.registry.lock().put(*pointer, container.clone());
                    container
                }
            };
            container.usages.fetch_add(1, Ordering::SeqCst);
            container
        };

        self.evict();
        Ok(TreeHandle::new(self.clone(), container))
    }

    /// Returns one borrow of the tree at `pointer`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::UnbalancedRelease`] when the tree is not cached or
    /// has no outstanding borrow.
    pub fn release_sb_tree(&self, pointer: &CollectionPointer) -> BonsaiResult<()> {
        {
            let _guard = self.inner.locks.lock(pointer);
            let mut registry = self.inner.registry.lock();
            let container = match registry.get(pointer) {
                Some(container) => container,
                None => {
                    log::error!("Release of tree {} which is not cached", pointer);
                    return Err(BonsaiError::new(
                        &format!("Tree {} is not borrowed", pointer),
                        ErrorKind::UnbalancedRelease,
                    ));
                }
            };

            let usages = container.usages.load(Ordering::SeqCst);
            if usages <= 0 {
                log::error!("Release of tree {} would drive usages to {}", pointer, usages - 1);
                return Err(BonsaiError::new(
                    &format!("Tree {} released more often than borrowed", pointer),
                    ErrorKind::UnbalancedRelease,
                ));
            }
            container.usages.fetch_sub(1, Ordering::SeqCst);
        }

        self.evict();
        Ok(())
    }

    /// Deletes the tree at `pointer` and drops it from the cache.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InUse`] while the tree is borrowed.
    pub fn delete(&self, pointer: &CollectionPointer) -> BonsaiResult<()> {
        self.ensure_open()?;
        let file = self.inner.write_cache.file(pointer.file_id())?;
        // file writers before the shard lock, the order commits take them in
        let _writer = file.exclusive();
        let _guard = self.inner.locks.lock(pointer);
        let cached = self.inner.registry.lock().peek(pointer).cloned();
        let tree = match cached {
            Some(container) => {
                let usages = container.usages();
                if usages > 0 {
                    log::error!("Tree {} is deleted while borrowed {} time(s)", pointer, usages);
                    return Err(BonsaiError::new(
                        &format!("Tree {} is still in use", pointer),
                        ErrorKind::InUse,
                    ));
                }
                self.inner.registry.lock().pop(pointer);
                container.tree.clone()
            }
            None => BonsaiTree::load(file.clone(), pointer.root_pointer(), self.config())?,
        };
        tree.delete()
    }

    /// Outstanding borrows of a cached tree, `None` when it is not cached.
    pub fn usages(&self, pointer: &CollectionPointer) -> Option<i32> {
        let _guard = self.inner.locks.lock(pointer);
        self.inner
            .registry
            .lock()
            .peek(pointer)
            .map(|container| container.usages())
    }

    pub fn contains(&self, pointer: &CollectionPointer) -> bool {
        self.inner.registry.lock().contains(pointer)
    }

    /// Number of cached trees.
    pub fn len(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached tree and flushes the write cache. Borrows still
    /// outstanding are reported and their later release fails.
    pub fn close(&self) -> BonsaiResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut registry = self.inner.registry.lock();
            for (pointer, container) in registry.iter() {
                let usages = container.usages();
                if usages > 0 {
                    log::warn!("Tree {} is still borrowed {} time(s) at close", pointer, usages);
                }
            }
            registry.clear();
        }
        self.inner.write_cache.flush()
    }

    fn ensure_open(&self) -> BonsaiResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            log::error!("Tree handle cache is closed");
            return Err(BonsaiError::new(
                "Tree handle cache is closed",
                ErrorKind::InvalidOperation,
            ));
        }
        Ok(())
    }

    /// Removes idle trees among the least recently used ones once the cache
    /// is over capacity. Must be called without holding a shard lock.
    fn evict(&self) {
        let max_size = self.config().cache_max_size();
        let candidates = {
            let registry = self.inner.registry.lock();
            if registry.len() <= max_size {
                return;
            }
            registry
                .iter()
                .rev()
                .take(self.config().eviction_threshold())
                .map(|(pointer, _)| *pointer)
                .collect::<Vec<_>>()
        };

        let mut evicted = 0usize;
        for pointer in candidates {
            let _guard = self.inner.locks.lock(&pointer);
            let mut registry = self.inner.registry.lock();
            let idle = registry
                .peek(&pointer)
                .map(|container| container.usages() == 0)
                .unwrap_or(false);
            if idle {
                registry.pop(&pointer);
                evicted += 1;
            }
        }
        log::debug!("Evicted {} idle tree(s)", evicted);
    }
}

/// A borrowed tree. Dropping the handle returns the borrow to its cache.
pub struct TreeHandle<V: BucketValue> {
    cache: TreeHandleCache<V>,
    container: Arc<TreeHandleContainer<V>>,
    released: bool,
}

impl<V: BucketValue> TreeHandle<V> {
    fn new(cache: TreeHandleCache<V>, container: Arc<TreeHandleContainer<V>>) -> Self {
        TreeHandle {
            cache,
            container,
            released: false,
        }
    }

    pub fn collection_pointer(&self) -> CollectionPointer {
        self.container.tree.collection_pointer()
    }

    /// Returns the borrow now and reports a failed release.
    pub fn release(mut self) -> BonsaiResult<()> {
        self.released = true;
        self.cache.release_sb_tree(&self.collection_pointer())
    }
}

impl<V: BucketValue> Debug for TreeHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeHandle")
            .field("pointer", &self.collection_pointer())
            .field("usages", &self.container.usages())
            .finish()
    }
}

impl<V: BucketValue> Deref for TreeHandle<V> {
    type Target = BonsaiTree<V>;

    fn deref(&self) -> &Self::Target {
        &self.container.tree
    }
}

impl<V: BucketValue> Drop for TreeHandle<V> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.cache.release_sb_tree(&self.collection_pointer()) {
            log::error!("Failed to release tree {}: {}", self.collection_pointer(), e);
        }
    }
}
