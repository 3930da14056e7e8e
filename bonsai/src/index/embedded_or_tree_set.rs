use crate::cache::TreeHandleCache;
use crate::common::{RecordId, POSTING_FILE_EXTENSION};
use crate::errors::BonsaiResult;
use crate::tree::{CollectionPointer, PostingMarker};
use std::collections::btree_set;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::ops::Bound;

#[derive(Clone, Debug)]
pub(crate) enum Underlying {
    Embedded(BTreeSet<RecordId>),
    Tree(CollectionPointer),
}

/// Posting set of an index key.
///
/// Small sets are kept in memory and travel inside the index entry. Once the
/// set grows above `top_threshold` elements it moves into a bonsai tree in
/// the index's `.irs` file, and it moves back into memory when it shrinks
/// below `bottom_threshold`. The gap between both thresholds keeps a set
/// oscillating around one of them from being converted on every change.
pub struct EmbeddedOrTreeSet {
    cache: TreeHandleCache<PostingMarker>,
    file_name: String,
    underlying: Underlying,
    top_threshold: usize,
    bottom_threshold: usize,
    durable_non_tx: bool,
}

impl Debug for EmbeddedOrTreeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedOrTreeSet")
            .field("file_name", &self.file_name)
            .field("underlying", &self.underlying)
            .field("top_threshold", &self.top_threshold)
            .field("bottom_threshold", &self.bottom_threshold)
            .finish()
    }
}

impl EmbeddedOrTreeSet {
    /// Creates an empty embedded set for the index called `name`.
    ///
    /// Thresholds and durability are taken from the cache's configuration.
    pub fn new(cache: TreeHandleCache<PostingMarker>, name: &str) -> Self {
        let file_name = Self::file_name_for(name);
        Self::with_underlying(cache, file_name, Underlying::Embedded(BTreeSet::new()))
    }

    pub(crate) fn with_underlying(
        cache: TreeHandleCache<PostingMarker>,
        file_name: String,
        underlying: Underlying,
    ) -> Self {
        let config = cache.config();
        let top_threshold = config.top_threshold();
        let bottom_threshold = config.bottom_threshold();
        let durable_non_tx = config.durable_non_tx();
        EmbeddedOrTreeSet {
            cache,
            file_name,
            underlying,
            top_threshold,
            bottom_threshold,
            durable_non_tx,
        }
    }

    pub(crate) fn file_name_for(name: &str) -> String {
        format!("{}{}", name, POSTING_FILE_EXTENSION)
    }

    pub(crate) fn underlying(&self) -> &Underlying {
        &self.underlying
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.underlying, Underlying::Embedded(_))
    }

    /// Pointer of the backing tree, `None` while the set is embedded.
    pub fn collection_pointer(&self) -> Option<CollectionPointer> {
        match &self.underlying {
            Underlying::Embedded(_) => None,
            Underlying::Tree(pointer) => Some(*pointer),
        }
    }

    pub fn durable_non_tx(&self) -> bool {
        self.durable_non_tx
    }

    pub fn set_durable_non_tx(&mut self, durable: bool) {
        self.durable_non_tx = durable;
    }

    pub fn len(&self) -> BonsaiResult<usize> {
        match &self.underlying {
            Underlying::Embedded(set) => Ok(set.len()),
            Underlying::Tree(pointer) => {
                let tree = self.cache.load_sb_tree(pointer)?;
                let size = tree.size()?;
                tree.release()?;
                Ok(size as usize)
            }
        }
    }

    pub fn is_empty(&self) -> BonsaiResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, id: &RecordId) -> BonsaiResult<bool> {
        match &self.underlying {
            Underlying::Embedded(set) => Ok(set.contains(id)),
            Underlying::Tree(pointer) => {
                let tree = self.cache.load_sb_tree(pointer)?;
                let found = tree.get(id)?.is_some();
                tree.release()?;
                Ok(found)
            }
        }
    }

    /// Adds `id`. Returns `false` when it was already present.
    ///
    /// Ids whose cluster does not fit the key form are rejected with
    /// [`crate::errors::ErrorKind::ValidationError`], embedded or not.
    pub fn add(&mut self, id: RecordId) -> BonsaiResult<bool> {
        let added = self.insert(id)?;
        if added {
            self.after_grow()?;
        }
        Ok(added)
    }

    /// Adds every id. Returns `true` when at least one was not present.
    pub fn add_all(&mut self, ids: impl IntoIterator<Item = RecordId>) -> BonsaiResult<bool> {
        let mut changed = false;
        for id in ids {
            if self.insert(id)? {
                changed = true;
                self.after_grow()?;
            }
        }
        Ok(changed)
    }

    /// Removes `id`. Returns `false` when it was not present.
    pub fn remove(&mut self, id: &RecordId) -> BonsaiResult<bool> {
        let removed = self.delete_key(id)?;
        if removed {
            self.after_shrink()?;
        }
        Ok(removed)
    }

    /// Removes every id. Returns `true` when at least one was present.
    pub fn remove_all<'r>(&mut self, ids: impl IntoIterator<Item = &'r RecordId>) -> BonsaiResult<bool> {
        let mut changed = false;
        for id in ids {
            if self.delete_key(id)? {
                changed = true;
                self.after_shrink()?;
            }
        }
        Ok(changed)
    }

    /// Iterates the ids in key order. A tree backed set is read once, up front.
    pub fn iter(&self) -> BonsaiResult<PostingIter<'_>> {
        match &self.underlying {
            Underlying::Embedded(set) => Ok(PostingIter::Embedded(set.iter())),
            Underlying::Tree(pointer) => {
                let mut ids = Vec::new();
                let tree = self.cache.load_sb_tree(pointer)?;
                tree.scan(Bound::Unbounded, Bound::Unbounded, true, |id, _| {
                    ids.push(id);
                    true
                })?;
                tree.release()?;
                Ok(PostingIter::Tree(ids.into_iter()))
            }
        }
    }

    /// Empties the set. A backing tree is deleted as a whole and the set
    /// becomes embedded again.
    pub fn clear(&mut self) -> BonsaiResult<()> {
        match &mut self.underlying {
            Underlying::Embedded(set) => set.clear(),
            Underlying::Tree(pointer) => {
                let pointer = *pointer;
                self.cache.delete(&pointer)?;
                self.underlying = Underlying::Embedded(BTreeSet::new());
                log::debug!("Cleared posting set by deleting tree {}", pointer);
                self.flush_if_durable()?;
            }
        }
        Ok(())
    }

    /// Moves an embedded set into a tree regardless of its size, so the set
    /// has a stable [`EmbeddedOrTreeSet::collection_pointer`].
    pub fn check_not_embedded(&mut self) -> BonsaiResult<()> {
        if self.is_embedded() {
            self.promote()?;
        }
        Ok(())
    }

    fn insert(&mut self, id: RecordId) -> BonsaiResult<bool> {
        id.key_cluster()?;
        match &mut self.underlying {
            Underlying::Embedded(set) => Ok(set.insert(id)),
            Underlying::Tree(pointer) => {
                let tree = self.cache.load_sb_tree(pointer)?;
                let added = if tree.get(&id)?.is_some() {
                    false
                } else {
                    tree.put(&id, &PostingMarker)?
                };
                tree.release()?;
                if added {
                    self.flush_if_durable()?;
                }
                Ok(added)
            }
        }
    }

    fn delete_key(&mut self, id: &RecordId) -> BonsaiResult<bool> {
        match &mut self.underlying {
            Underlying::Embedded(set) => Ok(set.remove(id)),
            Underlying::Tree(pointer) => {
                let tree = self.cache.load_sb_tree(pointer)?;
                let removed = tree.remove(id)?.is_some();
                tree.release()?;
                if removed {
                    self.flush_if_durable()?;
                }
                Ok(removed)
            }
        }
    }

    fn after_grow(&mut self) -> BonsaiResult<()> {
        if self.is_embedded() && self.len()? > self.top_threshold {
            self.promote()?;
        }
        Ok(())
    }

    fn after_shrink(&mut self) -> BonsaiResult<()> {
        if !self.is_embedded() && self.len()? < self.bottom_threshold {
            self.demote()?;
        }
        Ok(())
    }

    fn promote(&mut self) -> BonsaiResult<()> {
        let elements = match &self.underlying {
            Underlying::Embedded(set) => set,
            Underlying::Tree(_) => return Ok(()),
        };

        let (tree, pointer) = self.cache.create_sb_tree_in(&self.file_name)?;
        let filled = elements
            .iter()
            .try_for_each(|id| tree.put(id, &PostingMarker).map(|_| ()));
        tree.release()?;
        if let Err(e) = filled {
            if let Err(cleanup) = self.cache.delete(&pointer) {
                log::warn!("Failed to drop partially filled tree {}: {}", pointer, cleanup);
            }
            return Err(e);
        }

        log::debug!(
            "Promoted posting set of {} element(s) to tree {}",
            elements.len(),
            pointer
        );
        self.underlying = Underlying::Tree(pointer);
        self.flush_if_durable()
    }

    fn demote(&mut self) -> BonsaiResult<()> {
        let pointer = match &self.underlying {
            Underlying::Tree(pointer) => *pointer,
            Underlying::Embedded(_) => return Ok(()),
        };

        let mut elements = BTreeSet::new();
        let tree = self.cache.load_sb_tree(&pointer)?;
        tree.scan(Bound::Unbounded, Bound::Unbounded, true, |id, _| {
            elements.insert(id);
            true
        })?;
        tree.release()?;
        self.cache.delete(&pointer)?;

        log::debug!(
            "Demoted posting set of {} element(s) from tree {}",
            elements.len(),
            pointer
        );
        self.underlying = Underlying::Embedded(elements);
        self.flush_if_durable()
    }

    fn flush_if_durable(&self) -> BonsaiResult<()> {
        if self.durable_non_tx {
            self.cache.write_cache().flush()?;
        }
        Ok(())
    }
}

/// Iterator returned by [`EmbeddedOrTreeSet::iter`].
pub enum PostingIter<'a> {
    Embedded(btree_set::Iter<'a, RecordId>),
    Tree(std::vec::IntoIter<RecordId>),
}

impl Iterator for PostingIter<'_> {
    type Item = RecordId;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            PostingIter::Embedded(iter) => iter.next().copied(),
            PostingIter::Tree(iter) => iter.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BonsaiConfig;
    use crate::errors::ErrorKind;
    use crate::store::{MemoryPageStore, PageStore, WriteCache};
    use std::sync::Arc;

    fn cache(top: usize, bottom: usize) -> TreeHandleCache<PostingMarker> {
        let config = BonsaiConfig::builder()
            .geometry(1024, 256)
            .thresholds(top, bottom)
            .build()
            .unwrap();
        TreeHandleCache::new(WriteCache::new(&config).unwrap())
    }

    fn rid(position: i64) -> RecordId {
        RecordId::new(3, position)
    }

    #[test]
    fn test_embedded_operations() {
        let mut set = EmbeddedOrTreeSet::new(cache(10, 5), "name_idx");
        assert_eq!(set.file_name(), "name_idx.irs");
        assert!(set.add(rid(2)).unwrap());
        assert!(set.add(rid(1)).unwrap());
        assert!(!set.add(rid(1)).unwrap());
        assert_eq!(set.len().unwrap(), 2);
        assert!(set.contains(&rid(2)).unwrap());
        assert_eq!(set.iter().unwrap().collect::<Vec<_>>(), vec![rid(1), rid(2)]);
        assert!(set.remove(&rid(2)).unwrap());
        assert!(!set.remove(&rid(2)).unwrap());
        assert!(set.is_embedded());
        assert!(set.collection_pointer().is_none());
    }

    #[test]
    fn test_promotion_above_top() {
        let cache = cache(4, 2);
        let mut set = EmbeddedOrTreeSet::new(cache.clone(), "age_idx");
        set.add_all((0..4).map(rid)).unwrap();
        assert!(set.is_embedded());

        set.add(rid(4)).unwrap();
        assert!(!set.is_embedded());
        let pointer = set.collection_pointer().unwrap();
        assert_eq!(
            cache.write_cache().file_name_by_id(pointer.file_id()).unwrap(),
            "age_idx.irs"
        );
        assert_eq!(set.len().unwrap(), 5);
        assert_eq!(
            set.iter().unwrap().collect::<Vec<_>>(),
            (0..5).map(rid).collect::<Vec<_>>()
        );
        assert_eq!(cache.usages(&pointer), Some(0));
    }

    #[test]
    fn test_hysteresis() {
        let mut set = EmbeddedOrTreeSet::new(cache(4, 2), "idx");
        set.add_all((0..5).map(rid)).unwrap();
        let pointer = set.collection_pointer().unwrap();

        for round in 0..5 {
            set.remove(&rid(4)).unwrap();
            assert!(!set.is_embedded(), "demoted in round {}", round);
            set.add(rid(4)).unwrap();
            assert_eq!(set.collection_pointer(), Some(pointer));
        }

        set.remove(&rid(4)).unwrap();
        set.remove(&rid(3)).unwrap();
        assert!(!set.is_embedded());
        set.remove(&rid(2)).unwrap();
        assert!(!set.is_embedded());
        set.remove(&rid(1)).unwrap();
        assert!(set.is_embedded());
        assert_eq!(set.iter().unwrap().collect::<Vec<_>>(), vec![rid(0)]);
    }

    #[test]
    fn test_demotion_deletes_tree() {
        let cache = cache(4, 2);
        let mut set = EmbeddedOrTreeSet::new(cache.clone(), "idx");
        set.add_all((0..5).map(rid)).unwrap();
        let pointer = set.collection_pointer().unwrap();
        let ids = (0..4).map(rid).collect::<Vec<_>>();
        set.remove_all(ids.iter()).unwrap();
        assert!(set.is_embedded());
        assert_eq!(set.len().unwrap(), 1);
        let err = cache.load_sb_tree(&pointer).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::StructuralCorruption);
    }

    #[test]
    fn test_check_not_embedded() {
        let mut set = EmbeddedOrTreeSet::new(cache(10, 5), "idx");
        set.add(rid(1)).unwrap();
        set.check_not_embedded().unwrap();
        assert!(!set.is_embedded());
        assert!(set.contains(&rid(1)).unwrap());

        let pointer = set.collection_pointer();
        set.check_not_embedded().unwrap();
        assert_eq!(set.collection_pointer(), pointer);
    }

    #[test]
    fn test_clear_tree_backed() {
        let cache = cache(4, 2);
        let mut set = EmbeddedOrTreeSet::new(cache.clone(), "idx");
        set.add_all((0..8).map(rid)).unwrap();
        let pointer = set.collection_pointer().unwrap();
        set.clear().unwrap();
        assert!(set.is_embedded());
        assert!(set.is_empty().unwrap());
        assert!(cache.load_sb_tree(&pointer).is_err());
    }

    #[test]
    fn test_durable_non_tx_flushes() {
        let config = BonsaiConfig::builder()
            .geometry(1024, 256)
            .thresholds(2, 1)
            .durable_non_tx(true)
            .build()
            .unwrap();
        let store = Arc::new(MemoryPageStore::new());
        let write_cache = WriteCache::with_store(&config, store.clone());
        let mut set = EmbeddedOrTreeSet::new(TreeHandleCache::new(write_cache), "idx");
        assert!(set.durable_non_tx());
        set.add_all((0..3).map(rid)).unwrap();

        assert_eq!(store.list_files().unwrap(), vec!["idx.irs".to_string()]);
    }

    #[test]
    fn test_wide_cluster_is_rejected() {
        let mut set = EmbeddedOrTreeSet::new(cache(4, 2), "idx");
        set.add(rid(1)).unwrap();
        let wide = RecordId::new(i16::MAX as i32 + 1, 1);
        assert_eq!(set.add(wide).unwrap_err().kind(), &ErrorKind::ValidationError);
        assert!(set.is_embedded());
        assert!(!set.contains(&wide).unwrap());

        set.add_all((2..8).map(rid)).unwrap();
        assert!(!set.is_embedded());
        let err = set.add(wide).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ValidationError);
        assert_eq!(set.len().unwrap(), 7);
        assert_eq!(set.iter().unwrap().collect::<Vec<_>>(), (1..8).map(rid).collect::<Vec<_>>());
    }
}
