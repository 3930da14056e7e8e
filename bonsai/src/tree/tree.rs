use crate::common::RecordId;
use crate::config::BonsaiConfig;
use crate::errors::{BonsaiError, BonsaiResult, ErrorKind};
use crate::ridbag::Change;
use crate::store::{AtomicUnit, PageFile, PageSource};
use crate::tree::{Bucket, BucketPointer, BucketValue, CollectionPointer, SysBucket, SYS_BUCKET};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::ops::{Bound, Range};
use std::sync::Arc;

const MAX_DEPTH: usize = 64;

/// A non-leaf bucket on the way down to a leaf and the child taken from it.
#[derive(Clone, Copy, Debug)]
struct PathItem {
    pointer: BucketPointer,
    child: usize,
}

struct SearchResult {
    path: Vec<PathItem>,
    leaf: BucketPointer,
    index: Result<usize, usize>,
}

impl SearchResult {
    fn pointers(&self) -> Vec<BucketPointer> {
        self.path.iter().map(|item| item.pointer).collect()
    }
}

struct SplitPlan {
    is_leaf: bool,
    split_index: usize,
    separation_key: RecordId,
    left_entries: Vec<Vec<u8>>,
    right_entries: Vec<Vec<u8>>,
    right_sibling: BucketPointer,
    tree_size: i64,
}

/// A paged B+Tree keyed by [`RecordId`] living inside a bonsai file.
///
/// Several trees share one file; each is identified by its root bucket,
/// which stays in place for the whole life of the tree. Root splits move the
/// old content into two new children and rewrite the root as a non-leaf.
///
/// Every mutation runs inside one [`AtomicUnit`] of the file: either all of
/// its page writes become visible or none do.
pub struct BonsaiTree<V> {
    file: Arc<PageFile>,
    root: BucketPointer,
    bucket_size: usize,
    free_space_reuse_trigger: f32,
    _value: PhantomData<V>,
}

impl<V: BucketValue> Clone for BonsaiTree<V> {
    fn clone(&self) -> Self {
        BonsaiTree {
            file: self.file.clone(),
            root: self.root,
            bucket_size: self.bucket_size,
            free_space_reuse_trigger: self.free_space_reuse_trigger,
            _value: PhantomData,
        }
    }
}

impl<V> Debug for BonsaiTree<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BonsaiTree")
            .field("file", &self.file.name())
            .field("root", &self.root)
            .finish()
    }
}

impl<V: BucketValue> BonsaiTree<V> {
    /// Creates an empty tree in `file`, initializing the file's system
    /// bucket when the file is new.
    ///
    /// # Arguments
    ///
    /// * `file` - The bonsai file that receives the root bucket
    /// * `config` - Supplies the bucket size and the free space reuse trigger
    ///
    /// # Returns
    ///
    /// The new tree. Its [`BonsaiTree::collection_pointer`] identifies it from now on.
    pub fn create(file: Arc<PageFile>, config: &BonsaiConfig) -> BonsaiResult<Self> {
        let mut tree = BonsaiTree {
            file,
            root: BucketPointer::NULL,
            bucket_size: config.bucket_size(),
            free_space_reuse_trigger: config.free_space_reuse_trigger(),
            _value: PhantomData,
        };

        let file = tree.file.clone();
        let mut unit = file.atomic_unit();
        if unit.filled_up_to() == 0 {
            unit.add_page()?;
        }
        {
            let mut sys = tree.sys_bucket_mut(&mut unit)?;
            if !sys.is_initialized() {
                sys.init(tree.bucket_size);
            }
        }
        let root = tree.allocate_bucket(&mut unit)?;
        tree.bucket_mut(&mut unit, root)?.init(true);
        unit.commit();

        tree.root = root;
        log::debug!("Created tree {} in {}", tree.collection_pointer(), file.name());
        Ok(tree)
    }

    /// Opens an existing tree rooted at `root`.
    ///
    /// Fails with [`ErrorKind::StructuralCorruption`] when `root` does not
    /// point at a live root bucket.
    pub fn load(file: Arc<PageFile>, root: BucketPointer, config: &BonsaiConfig) -> BonsaiResult<Self> {
        let tree = BonsaiTree {
            file,
            root,
            bucket_size: config.bucket_size(),
            free_space_reuse_trigger: config.free_space_reuse_trigger(),
            _value: PhantomData,
        };
        tree.check_root()?;
        Ok(tree)
    }

    fn check_root(&self) -> BonsaiResult<()> {
        if !self.root.is_valid() || self.root == SYS_BUCKET {
            return Err(corruption(format!(
                "{:?} is not a valid root in {}",
                self.root,
                self.file.name()
            )));
        }

        let guard = self.file.read();
        let sys = self.sys_bucket(&guard)?;
        if !sys.is_initialized() {
            return Err(corruption(format!(
                "File {} has no system bucket",
                self.file.name()
            )));
        }

        let root = self.bucket(&guard, self.root)?;
        if root.is_deleted() {
            return Err(corruption(format!(
                "Root {:?} of {} has been deleted",
                self.root,
                self.file.name()
            )));
        }
        if root.left_sibling().is_valid()
            || root.right_sibling().is_valid()
            || root.size() > root.capacity()
            || (!root.is_leaf() && root.is_empty())
            || root.tree_size() < 0
        {
            return Err(corruption(format!(
                "Bucket {:?} of {} does not have the shape of a root",
                self.root,
                self.file.name()
            )));
        }
        Ok(())
    }

    pub fn collection_pointer(&self) -> CollectionPointer {
        CollectionPointer::new(self.file.file_id(), self.root)
    }

    pub fn root_pointer(&self) -> BucketPointer {
        self.root
    }

    pub fn file(&self) -> &Arc<PageFile> {
        &self.file
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &RecordId) -> BonsaiResult<Option<V>> {
        let guard = self.file.read();
        let search = self.find_bucket(&guard, key)?;
        match search.index {
            Ok(index) => Ok(Some(self.bucket(&guard, search.leaf)?.value(index))),
            Err(_) => Ok(None),
        }
    }

    /// Inserts `key` or overwrites its value. Always returns `true`.
    ///
    /// Fails with [`ErrorKind::ValidationError`] when the cluster of `key`
    /// does not fit the key form.
    pub fn put(&self, key: &RecordId, value: &V) -> BonsaiResult<bool> {
        key.key_cluster()?;
        let mut unit = self.file.atomic_unit();
        let search = self.find_bucket(&unit, key)?;
        match search.index {
            Ok(index) => {
                self.bucket_mut(&mut unit, search.leaf)?.set_value(index, value);
            }
            Err(index) => {
                let mut parents = search.pointers();
                let mut leaf = search.leaf;
                let mut index = index;
                while !self.bucket_mut(&mut unit, leaf)?.add_leaf_entry(index, key, value)? {
                    let (path, target, target_index) =
                        self.split_bucket(&mut unit, &parents, leaf, index, key)?;
                    parents = path;
                    leaf = target;
                    index = target_index;
                }
                self.update_tree_size(&mut unit, 1)?;
            }
        }
        unit.commit();
        Ok(true)
    }

    /// Removes `key` and returns its value.
    ///
    /// A non-root leaf emptied by the removal is unlinked from its siblings,
    /// dropped from its parent and put on the free list.
    pub fn remove(&self, key: &RecordId) -> BonsaiResult<Option<V>> {
        let mut unit = self.file.atomic_unit();
        let search = self.find_bucket(&unit, key)?;
        let index = match search.index {
            Ok(index) => index,
            Err(_) => {
                unit.commit();
                return Ok(None);
            }
        };

        let (value, emptied) = {
            let mut leaf = self.bucket_mut(&mut unit, search.leaf)?;
            let value = leaf.value(index);
            leaf.remove(index);
            (value, leaf.is_empty())
        };
        self.update_tree_size(&mut unit, -1)?;

        if emptied && !search.path.is_empty() {
            self.unlink_leaf(&mut unit, &search.path, search.leaf)?;
        }
        unit.commit();
        Ok(Some(value))
    }

    /// Number of keys in the tree.
    pub fn size(&self) -> BonsaiResult<u64> {
        let guard = self.file.read();
        let root = self.live_bucket(&guard, self.root)?;
        Ok(root.tree_size().max(0) as u64)
    }

    pub fn is_empty(&self) -> BonsaiResult<bool> {
        Ok(self.size()? == 0)
    }

    pub fn first_key(&self) -> BonsaiResult<Option<RecordId>> {
        let mut first = None;
        self.scan(Bound::Unbounded, Bound::Unbounded, true, |key, _| {
            first = Some(key);
            false
        })?;
        Ok(first)
    }

    pub fn last_key(&self) -> BonsaiResult<Option<RecordId>> {
        let mut last = None;
        self.scan(Bound::Unbounded, Bound::Unbounded, false, |key, _| {
            last = Some(key);
            false
        })?;
        Ok(last)
    }

    /// Values of the keys above `key` in ascending key order.
    ///
    /// # Arguments
    ///
    /// * `key` - The lower bound
    /// * `inclusive` - Whether `key` itself is part of the range
    /// * `max_fetch` - Maximum number of values to return, `-1` for all
    pub fn values_major(&self, key: &RecordId, inclusive: bool, max_fetch: i32) -> BonsaiResult<Vec<V>> {
        self.collect_values(bound(key, inclusive), Bound::Unbounded, true, max_fetch)
    }

    /// Values of the keys below `key` in descending key order.
    pub fn values_minor(&self, key: &RecordId, inclusive: bool, max_fetch: i32) -> BonsaiResult<Vec<V>> {
        self.collect_values(Bound::Unbounded, bound(key, inclusive), false, max_fetch)
    }

    /// Values of the keys between `from` and `to` in ascending key order.
    pub fn values_between(
        &self,
        from: &RecordId,
        from_inclusive: bool,
        to: &RecordId,
        to_inclusive: bool,
        max_fetch: i32,
    ) -> BonsaiResult<Vec<V>> {
        self.collect_values(
            bound(from, from_inclusive),
            bound(to, to_inclusive),
            true,
            max_fetch,
        )
    }

    /// Feeds the entries above `key` to `listener` until it returns `false`.
    pub fn load_entries_major<F>(
        &self,
        key: &RecordId,
        inclusive: bool,
        ascending: bool,
        listener: F,
    ) -> BonsaiResult<()>
    where
        F: FnMut(RecordId, V) -> bool,
    {
        self.scan(bound(key, inclusive), Bound::Unbounded, ascending, listener)
    }

    /// Feeds the entries below `key` to `listener` until it returns `false`.
    pub fn load_entries_minor<F>(
        &self,
        key: &RecordId,
        inclusive: bool,
        ascending: bool,
        listener: F,
    ) -> BonsaiResult<()>
    where
        F: FnMut(RecordId, V) -> bool,
    {
        self.scan(Bound::Unbounded, bound(key, inclusive), ascending, listener)
    }

    /// Feeds the entries between `from` and `to` in ascending order to
    /// `listener` until it returns `false`.
    pub fn load_entries_between<F>(
        &self,
        from: &RecordId,
        from_inclusive: bool,
        to: &RecordId,
        to_inclusive: bool,
        listener: F,
    ) -> BonsaiResult<()>
    where
        F: FnMut(RecordId, V) -> bool,
    {
        self.scan(
            bound(from, from_inclusive),
            bound(to, to_inclusive),
            true,
            listener,
        )
    }

    /// Removes every entry. Child buckets go to the free list and the root
    /// becomes an empty leaf.
    pub fn clear(&self) -> BonsaiResult<()> {
        let mut unit = self.file.atomic_unit();
        let buckets = self.collect_buckets(&unit)?;
        for pointer in buckets {
            self.free_bucket(&mut unit, pointer)?;
        }
        self.bucket_mut(&mut unit, self.root)?.init(true);
        unit.commit();
        log::debug!("Cleared tree {}", self.collection_pointer());
        Ok(())
    }

    /// Frees every bucket of the tree, the root included. The tree can not
    /// be used afterwards.
    pub fn delete(&self) -> BonsaiResult<()> {
        let mut unit = self.file.atomic_unit();
        let buckets = self.collect_buckets(&unit)?;
        for pointer in buckets {
            self.free_bucket(&mut unit, pointer)?;
        }
        self.free_bucket(&mut unit, self.root)?;
        unit.commit();
        log::debug!("Deleted tree {}", self.collection_pointer());
        Ok(())
    }

    pub(crate) fn scan<F>(
        &self,
        lower: Bound<&RecordId>,
        upper: Bound<&RecordId>,
        ascending: bool,
        mut listener: F,
    ) -> BonsaiResult<()>
    where
        F: FnMut(RecordId, V) -> bool,
    {
        let guard = self.file.read();
        let max_hops = self.max_buckets(&guard);
        let mut hops = 0usize;

        if ascending {
            let (mut leaf, mut index) = match lower {
                Bound::Unbounded => (self.edge_leaf(&guard, true)?, 0),
                Bound::Included(key) => {
                    let search = self.find_bucket(&guard, key)?;
                    let index = match search.index {
                        Ok(index) | Err(index) => index,
                    };
                    (search.leaf, index)
                }
                Bound::Excluded(key) => {
                    let search = self.find_bucket(&guard, key)?;
                    let index = match search.index {
                        Ok(index) => index + 1,
                        Err(index) => index,
                    };
                    (search.leaf, index)
                }
            };

            loop {
                let bucket = self.bucket(&guard, leaf)?;
                while index < bucket.size() {
                    let key = bucket.key(index);
                    if !below(&key, upper) || !listener(key, bucket.value(index)) {
                        return Ok(());
                    }
                    index += 1;
                }

                let next = bucket.right_sibling();
                if !next.is_valid() {
                    return Ok(());
                }
                hops += 1;
                if hops > max_hops || self.bucket(&guard, next)?.left_sibling() != leaf {
                    return Err(corruption(format!(
                        "Broken sibling link between {:?} and {:?} in {}",
                        leaf,
                        next,
                        self.file.name()
                    )));
                }
                leaf = next;
                index = 0;
            }
        } else {
            let (mut leaf, mut position) = match upper {
                Bound::Unbounded => {
                    let leaf = self.edge_leaf(&guard, false)?;
                    (leaf, self.bucket(&guard, leaf)?.size())
                }
                Bound::Included(key) => {
                    let search = self.find_bucket(&guard, key)?;
                    let position = match search.index {
                        Ok(index) => index + 1,
                        Err(index) => index,
                    };
                    (search.leaf, position)
                }
                Bound::Excluded(key) => {
                    let search = self.find_bucket(&guard, key)?;
                    let position = match search.index {
                        Ok(index) | Err(index) => index,
                    };
                    (search.leaf, position)
                }
            };

            loop {
                let bucket = self.bucket(&guard, leaf)?;
                while position > 0 {
                    position -= 1;
                    let key = bucket.key(position);
                    if !above(&key, lower) || !listener(key, bucket.value(position)) {
                        return Ok(());
                    }
                }

                let previous = bucket.left_sibling();
                if !previous.is_valid() {
                    return Ok(());
                }
                hops += 1;
                let previous_bucket = self.bucket(&guard, previous)?;
                if hops > max_hops || previous_bucket.right_sibling() != leaf {
                    return Err(corruption(format!(
                        "Broken sibling link between {:?} and {:?} in {}",
                        previous,
                        leaf,
                        self.file.name()
                    )));
                }
                leaf = previous;
                position = previous_bucket.size();
            }
        }
    }

    fn collect_values(
        &self,
        lower: Bound<&RecordId>,
        upper: Bound<&RecordId>,
        ascending: bool,
        max_fetch: i32,
    ) -> BonsaiResult<Vec<V>> {
        let mut values = Vec::new();
        if max_fetch == 0 {
            return Ok(values);
        }
        self.scan(lower, upper, ascending, |_, value| {
            values.push(value);
            max_fetch < 0 || values.len() < max_fetch as usize
        })?;
        Ok(values)
    }

    fn find_bucket<S: PageSource + ?Sized>(&self, source: &S, key: &RecordId) -> BonsaiResult<SearchResult> {
        let mut path = Vec::new();
        let mut pointer = self.root;
        loop {
            if path.len() > MAX_DEPTH {
                return Err(corruption(format!(
                    "Tree {} is deeper than {} levels",
                    self.collection_pointer(),
                    MAX_DEPTH
                )));
            }

            let bucket = self.live_bucket(source, pointer)?;
            if bucket.is_leaf() {
                return Ok(SearchResult {
                    path,
                    leaf: pointer,
                    index: bucket.find(key),
                });
            }
            if bucket.is_empty() {
                return Err(corruption(format!(
                    "Non-leaf bucket {:?} of {} has no separators",
                    pointer,
                    self.file.name()
                )));
            }

            let child = match bucket.find(key) {
                Ok(index) => index + 1,
                Err(index) => index,
            };
            path.push(PathItem { pointer, child });
            pointer = bucket.child(child);
        }
    }

    /// Leftmost (`first`) or rightmost leaf of the tree.
    fn edge_leaf<S: PageSource + ?Sized>(&self, source: &S, first: bool) -> BonsaiResult<BucketPointer> {
        let mut pointer = self.root;
        for _ in 0..=MAX_DEPTH {
            let bucket = self.live_bucket(source, pointer)?;
            if bucket.is_leaf() {
                return Ok(pointer);
            }
            if bucket.is_empty() {
                break;
            }
            pointer = if first {
                bucket.child(0)
            } else {
                bucket.child(bucket.size())
            };
        }
        Err(corruption(format!(
            "No leaf reachable from root {}",
            self.collection_pointer()
        )))
    }

    /// Splits the full bucket `target` whose ancestors are `parents`.
    ///
    /// Returns the ancestors, the bucket and the position at which
    /// `key` now has to be inserted.
    fn split_bucket(
        &self,
        unit: &mut AtomicUnit<'_>,
        parents: &[BucketPointer],
        target: BucketPointer,
        key_index: usize,
        key: &RecordId,
    ) -> BonsaiResult<(Vec<BucketPointer>, BucketPointer, usize)> {
        let plan = {
            let bucket = self.bucket(&*unit, target)?;
            let size = bucket.size();
            let split_index = size / 2;
            let right_start = if bucket.is_leaf() {
                split_index
            } else {
                split_index + 1
            };
            SplitPlan {
                is_leaf: bucket.is_leaf(),
                split_index,
                separation_key: bucket.key(split_index),
                left_entries: (0..split_index).map(|i| bucket.raw_entry(i)).collect(),
                right_entries: (right_start..size).map(|i| bucket.raw_entry(i)).collect(),
                right_sibling: bucket.right_sibling(),
                tree_size: bucket.tree_size(),
            }
        };

        let right_index = if plan.is_leaf {
            key_index.saturating_sub(plan.split_index)
        } else {
            key_index.saturating_sub(plan.split_index + 1)
        };
        let goes_left = key < &plan.separation_key;

        if target == self.root {
            let left = self.allocate_bucket(unit)?;
            let right = self.allocate_bucket(unit)?;
            {
                let mut bucket = self.bucket_mut(unit, left)?;
                bucket.init(plan.is_leaf);
                bucket.add_all(&plan.left_entries);
                if plan.is_leaf {
                    bucket.set_right_sibling(right);
                }
            }
            {
                let mut bucket = self.bucket_mut(unit, right)?;
                bucket.init(plan.is_leaf);
                bucket.add_all(&plan.right_entries);
                if plan.is_leaf {
                    bucket.set_left_sibling(left);
                }
            }
            {
                let mut root = self.bucket_mut(unit, self.root)?;
                root.init(false);
                root.set_tree_size(plan.tree_size);
                root.add_internal_entry(0, left, right, &plan.separation_key, true)?;
            }
            log::debug!(
                "Split root of {} into {:?} and {:?}",
                self.collection_pointer(),
                left,
                right
            );

            return Ok(if goes_left {
                (vec![self.root], left, key_index)
            } else {
                (vec![self.root], right, right_index)
            });
        }

        let (parent, grand_parents) = match parents.split_last() {
            Some((parent, rest)) => (*parent, rest.to_vec()),
            None => {
                return Err(BonsaiError::new(
                    &format!("Bucket {:?} has no parent but is not the root", target),
                    ErrorKind::InternalError,
                ))
            }
        };

        let right = self.allocate_bucket(unit)?;
        {
            let mut bucket = self.bucket_mut(unit, right)?;
            bucket.init(plan.is_leaf);
            bucket.add_all(&plan.right_entries);
            if plan.is_leaf {
                bucket.set_left_sibling(target);
                bucket.set_right_sibling(plan.right_sibling);
            }
        }
        {
            let mut bucket = self.bucket_mut(unit, target)?;
            bucket.shrink(plan.split_index);
            if plan.is_leaf {
                bucket.set_right_sibling(right);
            }
        }
        if plan.is_leaf && plan.right_sibling.is_valid() {
            self.bucket_mut(unit, plan.right_sibling)?.set_left_sibling(right);
        }

        let mut parent = parent;
        let mut grand_parents = grand_parents;
        let mut insertion = match self.bucket(&*unit, parent)?.find(&plan.separation_key) {
            Err(index) => index,
            Ok(_) => {
                return Err(corruption(format!(
                    "Separator {} already present in {:?} of {}",
                    plan.separation_key,
                    parent,
                    self.file.name()
                )))
            }
        };
        while !self.bucket_mut(unit, parent)?.add_internal_entry(
            insertion,
            target,
            right,
            &plan.separation_key,
            true,
        )? {
            let (path, bucket, index) =
                self.split_bucket(unit, &grand_parents, parent, insertion, &plan.separation_key)?;
            grand_parents = path;
            parent = bucket;
            insertion = index;
        }
        log::debug!(
            "Split {:?} of {} at {}, new right bucket {:?}",
            target,
            self.file.name(),
            plan.separation_key,
            right
        );

        let mut path = grand_parents;
        path.push(parent);
        Ok(if goes_left {
            (path, target, key_index)
        } else {
            (path, right, right_index)
        })
    }

    fn unlink_leaf(&self, unit: &mut AtomicUnit<'_>, path: &[PathItem], leaf: BucketPointer) -> BonsaiResult<()> {
        let (left, right) = {
            let bucket = self.bucket(&*unit, leaf)?;
            (bucket.left_sibling(), bucket.right_sibling())
        };
        if left.is_valid() {
            self.bucket_mut(unit, left)?.set_right_sibling(right);
        }
        if right.is_valid() {
            self.bucket_mut(unit, right)?.set_left_sibling(left);
        }
        self.free_bucket(unit, leaf)?;
        self.detach_child(unit, path, path.len() - 1)
    }

    /// Drops the child taken at `path[level]`. A bucket left with a single
    /// child is replaced by that child.
    fn detach_child(&self, unit: &mut AtomicUnit<'_>, path: &[PathItem], level: usize) -> BonsaiResult<()> {
        let item = path[level];
        let remaining = {
            let bucket = self.bucket(&*unit, item.pointer)?;
            match bucket.size() {
                0 => {
                    return Err(corruption(format!(
                        "Non-leaf bucket {:?} of {} has no separators",
                        item.pointer,
                        self.file.name()
                    )))
                }
                1 if item.child == 0 => Some(bucket.right_child(0)),
                1 => Some(bucket.left_child(0)),
                _ => None,
            }
        };

        match remaining {
            None => {
                self.bucket_mut(unit, item.pointer)?.remove_child(item.child);
                Ok(())
            }
            Some(child) if level == 0 => self.collapse_root(unit, child),
            Some(child) => {
                let parent = path[level - 1];
                self.bucket_mut(unit, parent.pointer)?.set_child(parent.child, child);
                self.free_bucket(unit, item.pointer)
            }
        }
    }

    /// Moves the only child of the root into the root bucket.
    fn collapse_root(&self, unit: &mut AtomicUnit<'_>, child: BucketPointer) -> BonsaiResult<()> {
        let image = {
            let page = unit.page(child.page_index())?;
            page[self.bucket_range(child, page.len())?].to_vec()
        };
        let tree_size = self.bucket(&*unit, self.root)?.tree_size();
        {
            let page = unit.page_mut(self.root.page_index())?;
            let range = self.bucket_range(self.root, page.len())?;
            let mut root: Bucket<&mut [u8], V> = Bucket::new(&mut page[range]);
            root.as_bytes_mut().copy_from_slice(&image);
            root.set_tree_size(tree_size);
            root.set_left_sibling(BucketPointer::NULL);
            root.set_right_sibling(BucketPointer::NULL);
            root.set_free_list_pointer(BucketPointer::NULL);
        }
        log::debug!("Collapsed {:?} into root of {}", child, self.collection_pointer());
        self.free_bucket(unit, child)
    }

    fn update_tree_size(&self, unit: &mut AtomicUnit<'_>, delta: i64) -> BonsaiResult<()> {
        let mut root = self.bucket_mut(unit, self.root)?;
        let size = root.tree_size() + delta;
        root.set_tree_size(size);
        Ok(())
    }

    /// Every non-root bucket reachable from the root.
    fn collect_buckets<S: PageSource + ?Sized>(&self, source: &S) -> BonsaiResult<Vec<BucketPointer>> {
        let mut buckets = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(self.root);
        while let Some(pointer) = queue.pop_front() {
            let bucket = self.live_bucket(source, pointer)?;
            if bucket.is_leaf() {
                continue;
            }
            for position in 0..=bucket.size() {
                let child = bucket.child(position);
                if !seen.insert(child) {
                    return Err(corruption(format!(
                        "Bucket {:?} of {} is referenced twice",
                        child,
                        self.file.name()
                    )));
                }
                buckets.push(child);
                queue.push_back(child);
            }
        }
        Ok(buckets)
    }

    fn allocate_bucket(&self, unit: &mut AtomicUnit<'_>) -> BonsaiResult<BucketPointer> {
        let (head, length, free_space) = {
            let sys = self.sys_bucket(&*unit)?;
            (sys.free_list_head(), sys.free_list_length(), sys.free_space_pointer())
        };

        let total_buckets = self.max_buckets(&*unit) as f64;
        if length > 0
            && head.is_valid()
            && length as f64 / total_buckets >= self.free_space_reuse_trigger as f64
        {
            let next = self.bucket(&*unit, head)?.free_list_pointer();
            let mut sys = self.sys_bucket_mut(unit)?;
            sys.set_free_list_head(next);
            sys.set_free_list_length(length - 1);
            log::debug!("Reused bucket {:?} of {}", head, self.file.name());
            return Ok(head);
        }

        let page_size = self.file.page_size();
        if free_space.page_offset() as usize + self.bucket_size > page_size {
            let page = unit.add_page()?;
            self.sys_bucket_mut(unit)?
                .set_free_space_pointer(BucketPointer::new(page, self.bucket_size as i32));
            Ok(BucketPointer::new(page, 0))
        } else {
            self.sys_bucket_mut(unit)?.set_free_space_pointer(BucketPointer::new(
                free_space.page_index(),
                free_space.page_offset() + self.bucket_size as i32,
            ));
            Ok(free_space)
        }
    }

    fn free_bucket(&self, unit: &mut AtomicUnit<'_>, pointer: BucketPointer) -> BonsaiResult<()> {
        let (head, length) = {
            let sys = self.sys_bucket(&*unit)?;
            (sys.free_list_head(), sys.free_list_length())
        };
        {
            let mut bucket = self.bucket_mut(unit, pointer)?;
            bucket.set_deleted();
            bucket.set_free_list_pointer(head);
        }
        let mut sys = self.sys_bucket_mut(unit)?;
        sys.set_free_list_head(pointer);
        sys.set_free_list_length(length + 1);
        Ok(())
    }

    fn max_buckets<S: PageSource + ?Sized>(&self, source: &S) -> usize {
        source.filled_up_to().max(0) as usize * (self.file.page_size() / self.bucket_size)
    }

    fn bucket_range(&self, pointer: BucketPointer, page_len: usize) -> BonsaiResult<Range<usize>> {
        let offset = pointer.page_offset();
        if offset < 0
            || offset as usize % self.bucket_size != 0
            || offset as usize + self.bucket_size > page_len
        {
            return Err(corruption(format!(
                "{:?} is not a bucket boundary in {}",
                pointer,
                self.file.name()
            )));
        }
        let offset = offset as usize;
        Ok(offset..offset + self.bucket_size)
    }

    fn bucket<'a, S: PageSource + ?Sized>(
        &self,
        source: &'a S,
        pointer: BucketPointer,
    ) -> BonsaiResult<Bucket<&'a [u8], V>> {
        let page = source.page(pointer.page_index())?;
        let range = self.bucket_range(pointer, page.len())?;
        let bucket = Bucket::new(&page[range]);
        self.check_header(&bucket, pointer)?;
        Ok(bucket)
    }

    fn live_bucket<'a, S: PageSource + ?Sized>(
        &self,
        source: &'a S,
        pointer: BucketPointer,
    ) -> BonsaiResult<Bucket<&'a [u8], V>> {
        let bucket = self.bucket(source, pointer)?;
        if bucket.is_deleted() {
            return Err(corruption(format!(
                "Bucket {:?} of tree {} has been deleted",
                pointer,
                self.collection_pointer()
            )));
        }
        Ok(bucket)
    }

    fn bucket_mut<'a>(
        &self,
        unit: &'a mut AtomicUnit<'_>,
        pointer: BucketPointer,
    ) -> BonsaiResult<Bucket<&'a mut [u8], V>> {
        let page = unit.page_mut(pointer.page_index())?;
        let range = self.bucket_range(pointer, page.len())?;
        let bucket = Bucket::new(&mut page[range]);
        self.check_header(&bucket, pointer)?;
        Ok(bucket)
    }

    fn check_header<B: AsRef<[u8]>>(&self, bucket: &Bucket<B, V>, pointer: BucketPointer) -> BonsaiResult<()> {
        if bucket.is_well_formed() {
            return Ok(());
        }
        Err(corruption(format!(
            "Bucket {:?} of {} has a broken header",
            pointer,
            self.file.name()
        )))
    }

    fn sys_bucket<'a, S: PageSource + ?Sized>(&self, source: &'a S) -> BonsaiResult<SysBucket<&'a [u8]>> {
        let page = source.page(SYS_BUCKET.page_index())?;
        Ok(SysBucket::new(&page[..self.bucket_size]))
    }

    fn sys_bucket_mut<'a>(&self, unit: &'a mut AtomicUnit<'_>) -> BonsaiResult<SysBucket<&'a mut [u8]>> {
        let page = unit.page_mut(SYS_BUCKET.page_index())?;
        Ok(SysBucket::new(&mut page[..self.bucket_size]))
    }
}

impl BonsaiTree<i32> {
    /// Size of a rid bag whose stored counts are this tree and whose pending
    /// deltas are `changes`.
    pub fn real_bag_size(&self, changes: &BTreeMap<RecordId, Change>) -> BonsaiResult<i32> {
        let mut size = 0i32;
        let mut applied = BTreeSet::new();
        self.scan(Bound::Unbounded, Bound::Unbounded, true, |key, count| {
            size += match changes.get(&key) {
                Some(change) => {
                    applied.insert(key);
                    change.apply_to(count)
                }
                None => count,
            };
            true
        })?;

        for (key, change) in changes {
            if !applied.contains(key) {
                size += change.apply_to(0);
            }
        }
        Ok(size)
    }
}

fn bound(key: &RecordId, inclusive: bool) -> Bound<&RecordId> {
    if inclusive {
        Bound::Included(key)
    } else {
        Bound::Excluded(key)
    }
}

fn below(key: &RecordId, upper: Bound<&RecordId>) -> bool {
    match upper {
        Bound::Unbounded => true,
        Bound::Included(limit) => key <= limit,
        Bound::Excluded(limit) => key < limit,
    }
}

fn above(key: &RecordId, lower: Bound<&RecordId>) -> bool {
    match lower {
        Bound::Unbounded => true,
        Bound::Included(limit) => key >= limit,
        Bound::Excluded(limit) => key > limit,
    }
}

fn corruption(message: String) -> BonsaiError {
    log::error!("{}", message);
    BonsaiError::new(&message, ErrorKind::StructuralCorruption)
}
