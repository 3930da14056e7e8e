use crate::cache::TreeHandleCache;
use crate::common::{
    atomic, resolve_identity, Atomic, Guarded, RecordId, RecordRef,
    RecordResolver, RIDBAG_HEADER_SIZE,
};
use crate::errors::{BonsaiError, BonsaiResult, ErrorKind};
use crate::ridbag::{
    ChangeListeners, ChangeType, Change, RidBagChangeEvent, RidBagChangeListener, SubscriberRef,
};
use crate::store::{DeferredOperation, SerializationContext};
use crate::tree::{BucketPointer, CollectionPointer};
use fnv::FnvHashMap;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::ops::Bound;
use std::sync::Arc;

/// A multiset of record links backed by a bonsai tree.
///
/// Stored occurrence counts live in the tree at [`RidBag::collection_pointer`].
/// Mutations never touch the tree directly: links to saved records are kept
/// as signed deltas in `changed_values` and links to unsaved records are kept
/// per handle in `new_entries`. [`RidBag::serialize`] turns both into one
/// deferred tree update of the current atomic operation.
///
/// A bag is owned by one thread at a time. Listeners may be registered from
/// any thread.
pub struct RidBag {
    cache: TreeHandleCache<i32>,
    resolver: Arc<dyn RecordResolver>,
    changed_values: Atomic<BTreeMap<RecordId, Change>>,
    new_entries: NewEntries,
    size: Option<i32>,
    collection_pointer: Option<CollectionPointer>,
    owner_cluster: i32,
    auto_convert_to_record: bool,
    prefetch_size: usize,
    listeners: ChangeListeners,
}

impl RidBag {
    /// Creates an empty bag without a tree.
    pub fn new(cache: TreeHandleCache<i32>, resolver: Arc<dyn RecordResolver>) -> Self {
        let prefetch_size = cache.config().ridbag_prefetch_size();
        RidBag {
            cache,
            resolver,
            changed_values: atomic(BTreeMap::new()),
            new_entries: NewEntries::default(),
            size: Some(0),
            collection_pointer: None,
            owner_cluster: -1,
            auto_convert_to_record: true,
            prefetch_size,
            listeners: ChangeListeners::new(),
        }
    }

    /// Reads the 16 byte header written by [`RidBag::serialize`].
    ///
    /// # Arguments
    ///
    /// * `bytes` - The serialized header
    /// * `file_id` - The bonsai file holding the tree, kept by the owning document
    /// * `cache` - The cache the tree is borrowed from
    /// * `resolver` - Saves and loads records for the new bag
    ///
    /// # Returns
    ///
    /// A bag pointing at the stored tree. Its size is recomputed on first use
    /// since deferred updates may not have been committed yet.
    pub fn deserialize(
        bytes: &[u8],
        file_id: i64,
        cache: TreeHandleCache<i32>,
        resolver: Arc<dyn RecordResolver>,
    ) -> BonsaiResult<RidBag> {
        if bytes.len() != RIDBAG_HEADER_SIZE {
            log::error!("Rid bag header has {} bytes", bytes.len());
            return Err(BonsaiError::new(
                &format!(
                    "Rid bag header must be {} bytes, got {}",
                    RIDBAG_HEADER_SIZE,
                    bytes.len()
                ),
                ErrorKind::EncodingError,
            ));
        }

        let page_index = i64::from_be_bytes(read_array(&bytes[0..8]));
        let page_offset = i32::from_be_bytes(read_array(&bytes[8..12]));
        let size = i32::from_be_bytes(read_array(&bytes[12..16]));
        if size < 0 {
            return Err(BonsaiError::new(
                &format!("Rid bag header carries a negative size {}", size),
                ErrorKind::EncodingError,
            ));
        }

        let mut bag = RidBag::new(cache, resolver);
        if page_index >= 0 {
            let root = BucketPointer::new(page_index, page_offset);
            bag.collection_pointer = Some(CollectionPointer::new(file_id, root));
            bag.size = None;
        } else {
            bag.size = Some(0);
        }
        Ok(bag)
    }

    pub fn collection_pointer(&self) -> Option<CollectionPointer> {
        self.collection_pointer
    }

    pub fn owner_cluster(&self) -> i32 {
        self.owner_cluster
    }

    /// Sets the cluster whose collections file receives the tree once the
    /// bag is serialized for the first time.
    pub fn set_owner_cluster(&mut self, cluster_id: i32) {
        self.owner_cluster = cluster_id;
    }

    pub fn is_auto_convert_to_record(&self) -> bool {
        self.auto_convert_to_record
    }

    pub fn set_auto_convert_to_record(&mut self, convert: bool) {
        self.auto_convert_to_record = convert;
    }

    /// Pending deltas, ordered by key.
    pub fn pending_changes(&self) -> Vec<(RecordId, i32)> {
        self.changed_values
            .read_with(|changes| changes.iter().map(|(k, c)| (*k, c.delta())).collect())
    }

    /// Links to unsaved records and their counts.
    pub fn new_entries(&self) -> Vec<(RecordRef, i32)> {
        self.new_entries.to_vec()
    }

    /// Adds one occurrence of `record`.
    pub fn add(&mut self, record: &RecordRef) -> BonsaiResult<()> {
        let identity = record.identity();
        if identity.is_persistent() {
            let defined = self.changed_values.write_with(|changes| match changes.get_mut(&identity) {
                Some(change) => {
                    let defined = !change.is_undefined();
                    change.increment();
                    defined
                }
                None => {
                    changes.insert(identity, Change::new(record.clone(), 1));
                    true
                }
            });
            self.size = if defined { self.size.map(|s| s + 1) } else { None };
        } else {
            self.new_entries.add(record, 1);
            self.size = self.size.map(|s| s + 1);
        }

        self.listeners
            .publish(RidBagChangeEvent::new(ChangeType::Add, record.clone()))
    }

    pub fn add_all<'r>(&mut self, records: impl IntoIterator<Item = &'r RecordRef>) -> BonsaiResult<()> {
        for record in records {
            self.add(record)?;
        }
        Ok(())
    }

    /// Removes one occurrence of `record`.
    ///
    /// A saved record with no pending delta gets a delta of `-1`, which is
    /// reconciled against the tree when the bag is read or committed. That
    /// leaves the size undefined until it is recomputed.
    ///
    /// # Returns
    ///
    /// `false` when `record` is unsaved and was never added.
    pub fn remove(&mut self, record: &RecordRef) -> BonsaiResult<bool> {
        if self.new_entries.remove_one(record) {
            self.size = self.size.map(|s| s - 1);
        } else {
            let identity = record.identity();
            if !identity.is_persistent() {
                return Ok(false);
            }

            let defined = self.changed_values.write_with(|changes| match changes.get_mut(&identity) {
                Some(change) => {
                    change.decrement();
                    !change.is_undefined()
                }
                None => {
                    changes.insert(identity, Change::new(record.clone(), -1));
                    false
                }
            });
            self.size = if defined { self.size.map(|s| s - 1) } else { None };
        }

        self.listeners
            .publish(RidBagChangeEvent::new(ChangeType::Remove, record.clone()))?;
        Ok(true)
    }

    /// Number of links, counting repeated links once per occurrence.
    pub fn size(&mut self) -> BonsaiResult<i32> {
        if let Some(size) = self.size {
            return Ok(size);
        }

        let from_links = match &self.collection_pointer {
            Some(pointer) => {
                let tree = self.cache.load_sb_tree(pointer)?;
                let size = self
                    .changed_values
                    .read_with(|changes| tree.real_bag_size(changes))?;
                tree.release()?;
                size
            }
            None => self
                .changed_values
                .read_with(|changes| changes.values().map(|c| c.apply_to(0)).sum::<i32>()),
        };
        let size = from_links + self.new_entries.total();
        self.size = Some(size);
        Ok(size)
    }

    pub fn is_empty(&mut self) -> BonsaiResult<bool> {
        Ok(self.size()? == 0)
    }

    /// Returns `true` when at least one occurrence of `record` is in the bag.
    pub fn contains(&self, record: &RecordRef) -> BonsaiResult<bool> {
        if self.new_entries.contains(record) {
            return Ok(true);
        }

        let identity = record.identity();
        if !identity.is_persistent() {
            return Ok(false);
        }

        let stored = match &self.collection_pointer {
            Some(pointer) => {
                let tree = self.cache.load_sb_tree(pointer)?;
                let stored = tree.get(&identity)?;
                tree.release()?;
                stored.unwrap_or(0)
            }
            None => 0,
        };
        let count = self.changed_values.read_with(|changes| match changes.get(&identity) {
            Some(change) => change.apply_to(stored),
            None => stored,
        });
        Ok(count > 0)
    }

    /// Iterates every occurrence. Links to saved records are materialized
    /// through the resolver when auto conversion is on.
    pub fn iter(&mut self) -> RidBagIterator<'_> {
        let convert = self.auto_convert_to_record;
        RidBagIterator::new(self, convert)
    }

    /// Iterates every occurrence without materializing records.
    pub fn raw_iter(&mut self) -> RidBagIterator<'_> {
        RidBagIterator::new(self, false)
    }

    pub fn add_change_listener(&self, listener: RidBagChangeListener) -> BonsaiResult<SubscriberRef> {
        self.listeners.register(listener)
    }

    pub fn remove_change_listener(&self, subscriber: SubscriberRef) -> BonsaiResult<()> {
        self.listeners.deregister(subscriber)
    }

    /// Writes the bag header and defers the pending deltas to the current
    /// atomic operation. Without one the deltas stay pending in the bag and
    /// go with its next serialization inside an atomic operation.
    ///
    /// Links to unsaved records are saved first. A tree is created in the
    /// collections file of the owner cluster when the bag has none yet and
    /// an atomic operation is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::UnresolvableRecord`] when an unsaved record can
    /// not be given a persistent identity.
    pub fn serialize(&mut self, context: &SerializationContext) -> BonsaiResult<Vec<u8>> {
        self.flush_new_entries()?;

        if self.collection_pointer.is_none() && context.current_operation().is_some() {
            if self.owner_cluster < 0 {
                log::error!("Rid bag has no owner cluster to allocate its tree in");
                return Err(BonsaiError::new(
                    "Owner cluster must be set before the rid bag gets a tree",
                    ErrorKind::InvalidOperation,
                ));
            }
            let (tree, pointer) = self.cache.create_sb_tree(self.owner_cluster)?;
            tree.release()?;
            log::debug!("Allocated tree {} for rid bag", pointer);
            self.collection_pointer = Some(pointer);
        }

        let size = self.size()?;
        let root = self
            .collection_pointer
            .map(|pointer| pointer.root_pointer())
            .unwrap_or(BucketPointer::NULL);

        let mut bytes = Vec::with_capacity(RIDBAG_HEADER_SIZE);
        bytes.extend_from_slice(&root.page_index().to_be_bytes());
        bytes.extend_from_slice(&root.page_offset().to_be_bytes());
        bytes.extend_from_slice(&size.to_be_bytes());

        if let Some(pointer) = self.collection_pointer {
            let queued = context.push(DeferredOperation::UpdateTree {
                pointer,
                changes: self.changed_values.clone(),
            });
            if !queued {
                let pending = self.changed_values.read_with(|changes| changes.len());
                if pending > 0 {
                    log::warn!(
                        "Serialized rid bag {} outside an atomic operation, {} change(s) stay pending",
                        pointer,
                        pending
                    );
                }
            }
        }
        Ok(bytes)
    }

    /// Defers deletion of the tree and empties the bag.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidOperation`] when the bag has a tree but no
    /// atomic operation is in progress. The bag is left untouched.
    pub fn delete(&mut self, context: &SerializationContext) -> BonsaiResult<()> {
        if let Some(pointer) = self.collection_pointer {
            if !context.push(DeferredOperation::DeleteTree { pointer }) {
                log::error!("Tree {} can not be deleted outside an atomic operation", pointer);
                return Err(BonsaiError::new(
                    "Deleting a tree backed rid bag needs an atomic operation",
                    ErrorKind::InvalidOperation,
                ));
            }
        }

        self.collection_pointer = None;
        // a pending update of the deleted tree must not see later changes
        self.changed_values = atomic(BTreeMap::new());
        self.new_entries.clear();
        self.size = Some(0);
        self.listeners.clear()
    }

    /// Saves every unsaved record and keys its count by the new identity.
    ///
    /// # Returns
    ///
    /// `false` when at least one record could not be saved. Those records
    /// stay unsaved links.
    pub fn convert_records_to_links(&mut self) -> bool {
        let entries = self.new_entries.take();
        let mut converted = true;
        for (record, count) in entries {
            match resolve_identity(self.resolver.as_ref(), &record) {
                Ok(identity) => self.merge_new_entry(identity, record, count),
                Err(e) => {
                    log::warn!("Failed to save linked record: {}", e);
                    converted = false;
                    self.new_entries.add(&record, count);
                }
            }
        }
        converted
    }

    /// Same as [`RidBag::convert_records_to_links`].
    pub fn detach(&mut self) -> bool {
        self.convert_records_to_links()
    }

    /// Links can not be turned back into in-memory records.
    pub fn convert_links_to_records(&mut self) -> BonsaiResult<()> {
        Err(BonsaiError::new(
            "Rid bag links can not be converted to records",
            ErrorKind::UnsupportedOperation,
        ))
    }

    /// Replays the unsaved links and pending deltas of `other` onto this bag.
    pub fn merge_changes(&mut self, other: &RidBag) -> BonsaiResult<()> {
        for (record, count) in other.new_entries.iter() {
            for _ in 0..*count {
                self.add(record)?;
            }
        }

        let changes = other
            .changed_values
            .read_with(|changes| changes.values().cloned().collect::<Vec<_>>());
        for change in changes {
            if change.delta() > 0 {
                for _ in 0..change.delta() {
                    self.add(change.record())?;
                }
            } else {
                for _ in 0..-change.delta() {
                    self.remove(change.record())?;
                }
            }
        }
        Ok(())
    }

    /// Rebuilds the contents the bag had before `events` happened.
    ///
    /// The returned bag has no tree and holds every link in memory.
    pub fn revert(&mut self, events: &[RidBagChangeEvent]) -> BonsaiResult<RidBag> {
        let mut reverted = RidBag::new(self.cache.clone(), self.resolver.clone());
        reverted.owner_cluster = self.owner_cluster;
        reverted.auto_convert_to_record = self.auto_convert_to_record;

        let records = self.raw_iter().collect::<BonsaiResult<Vec<_>>>()?;
        for record in &records {
            reverted.add(record)?;
        }
        for event in events.iter().rev() {
            match event.change_type() {
                ChangeType::Add => {
                    reverted.remove(event.record())?;
                }
                ChangeType::Remove => reverted.add(event.record())?,
            }
        }
        Ok(reverted)
    }

    fn flush_new_entries(&mut self) -> BonsaiResult<()> {
        let mut identities = Vec::with_capacity(self.new_entries.len());
        for (record, _) in self.new_entries.iter() {
            match resolve_identity(self.resolver.as_ref(), record) {
                Ok(identity) => identities.push(identity),
                Err(e) => {
                    log::error!("Linked record {:?} can not be saved: {}", record, e);
                    return Err(BonsaiError::new_with_cause(
                        "Rid bag holds a link that can not be saved",
                        ErrorKind::UnresolvableRecord,
                        e,
                    ));
                }
            }
        }

        let entries = self.new_entries.take();
        for ((record, count), identity) in entries.into_iter().zip(identities) {
            self.merge_new_entry(identity, record, count);
        }
        Ok(())
    }

    fn merge_new_entry(&mut self, identity: RecordId, record: RecordRef, count: i32) {
        let defined = self.changed_values.write_with(|changes| match changes.get_mut(&identity) {
            Some(change) => {
                let defined = !change.is_undefined();
                change.apply_diff(count);
                defined
            }
            None => {
                changes.insert(identity, Change::new(record, count));
                true
            }
        });
        if !defined {
            self.size = None;
        }
    }
}

impl Debug for RidBag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RidBag")
            .field("collection_pointer", &self.collection_pointer)
            .field("size", &self.size)
            .field("new_entries", &self.new_entries.len())
            .field("changes", &self.changed_values.read_with(|c| c.len()))
            .finish()
    }
}

/// Links to unsaved records with their counts, in insertion order and
/// keyed by record handle.
#[derive(Clone, Default)]
struct NewEntries {
    entries: BTreeMap<u64, (RecordRef, i32)>,
    by_handle: FnvHashMap<usize, u64>,
    next_sequence: u64,
}

impl NewEntries {
    fn add(&mut self, record: &RecordRef, count: i32) {
        match self.by_handle.get(&record.handle_key()) {
            Some(sequence) => {
                if let Some((_, stored)) = self.entries.get_mut(sequence) {
                    *stored += count;
                }
            }
            None => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                self.by_handle.insert(record.handle_key(), sequence);
                self.entries.insert(sequence, (record.clone(), count));
            }
        }
    }

    /// Takes one occurrence of `record` away. Returns `false` when the
    /// handle is not among the entries.
    fn remove_one(&mut self, record: &RecordRef) -> bool {
        let key = record.handle_key();
        let sequence = match self.by_handle.get(&key) {
            Some(sequence) => *sequence,
            None => return false,
        };
        let emptied = match self.entries.get_mut(&sequence) {
            Some((_, count)) => {
                *count -= 1;
                *count <= 0
            }
            None => true,
        };
        if emptied {
            self.entries.remove(&sequence);
            self.by_handle.remove(&key);
        }
        true
    }

    fn contains(&self, record: &RecordRef) -> bool {
        self.by_handle.contains_key(&record.handle_key())
    }

    fn total(&self) -> i32 {
        self.entries.values().map(|(_, count)| *count).sum()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_handle.clear();
    }

    fn iter(&self) -> impl Iterator<Item = &(RecordRef, i32)> {
        self.entries.values()
    }

    fn to_vec(&self) -> Vec<(RecordRef, i32)> {
        self.iter().cloned().collect()
    }

    fn take(&mut self) -> Vec<(RecordRef, i32)> {
        self.by_handle.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(bytes);
    array
}

/// Prefetching reader over the stored counts of a tree.
struct TreeCursor {
    pointer: Option<CollectionPointer>,
    batch: VecDeque<(RecordId, i32)>,
    last_key: Option<RecordId>,
    exhausted: bool,
    prefetch_size: usize,
}

impl TreeCursor {
    fn new(pointer: Option<CollectionPointer>, prefetch_size: usize) -> Self {
        TreeCursor {
            pointer,
            batch: VecDeque::new(),
            last_key: None,
            exhausted: pointer.is_none(),
            prefetch_size: prefetch_size.max(1),
        }
    }

    fn next(&mut self, cache: &TreeHandleCache<i32>) -> BonsaiResult<Option<(RecordId, i32)>> {
        if self.batch.is_empty() && !self.exhausted {
            self.refill(cache)?;
        }
        Ok(self.batch.pop_front())
    }

    /// Fetches the next batch after the last fetched key. The tree is only
    /// borrowed for the duration of the fetch.
    fn refill(&mut self, cache: &TreeHandleCache<i32>) -> BonsaiResult<()> {
        let pointer = match self.pointer {
            Some(pointer) => pointer,
            None => {
                self.exhausted = true;
                return Ok(());
            }
        };

        let last_key = self.last_key;
        let lower = match last_key.as_ref() {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let limit = self.prefetch_size;
        let batch = &mut self.batch;

        let tree = cache.load_sb_tree(&pointer)?;
        tree.scan(lower, Bound::Unbounded, true, |key, count| {
            batch.push_back((key, count));
            batch.len() < limit
        })?;
        tree.release()?;

        if self.batch.len() < limit {
            self.exhausted = true;
        }
        if let Some((key, _)) = self.batch.back() {
            self.last_key = Some(*key);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    NewEntries,
    Merge,
    Done,
}

/// Iterator over every occurrence of a [`RidBag`].
///
/// Links to unsaved records come first, each repeated by its count. Then the
/// pending deltas are merged key by key with the stored counts of the tree.
/// Keys whose resulting count is zero or less are skipped.
///
/// The bag stays borrowed for the life of the iterator, so it can only be
/// changed through [`RidBagIterator::remove`].
pub struct RidBagIterator<'a> {
    bag: &'a mut RidBag,
    convert: bool,
    phase: Phase,
    new_entries: Vec<(RecordRef, i32)>,
    new_index: usize,
    current: Option<(RecordRef, i32)>,
    change_anchor: Option<RecordId>,
    next_change: Option<(RecordId, Change)>,
    changes_done: bool,
    cursor: TreeCursor,
    next_stored: Option<(RecordId, i32)>,
    last: Option<RecordRef>,
}

impl<'a> RidBagIterator<'a> {
    fn new(bag: &'a mut RidBag, convert: bool) -> Self {
        let cursor = TreeCursor::new(bag.collection_pointer, bag.prefetch_size);
        let new_entries = bag.new_entries.to_vec();
        RidBagIterator {
            bag,
            convert,
            phase: Phase::NewEntries,
            new_entries,
            new_index: 0,
            current: None,
            change_anchor: None,
            next_change: None,
            changes_done: false,
            cursor,
            next_stored: None,
            last: None,
        }
    }

    /// Removes the occurrence returned by the last call to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidOperation`] when `next` was not called or
    /// the occurrence was already removed.
    pub fn remove(&mut self) -> BonsaiResult<()> {
        match self.last.take() {
            Some(record) => {
                self.bag.remove(&record)?;
                Ok(())
            }
            None => Err(BonsaiError::new(
                "remove() must follow a call to next()",
                ErrorKind::InvalidOperation,
            )),
        }
    }

    /// Restarts the iteration from the current content of the bag.
    pub fn reset(&mut self) {
        self.phase = Phase::NewEntries;
        self.new_entries = self.bag.new_entries.to_vec();
        self.new_index = 0;
        self.current = None;
        self.change_anchor = None;
        self.next_change = None;
        self.changes_done = false;
        self.cursor = TreeCursor::new(self.bag.collection_pointer, self.bag.prefetch_size);
        self.next_stored = None;
        self.last = None;
    }

    /// First pending delta after the anchor. Looked up again on every step
    /// so removals made through the iterator are seen.
    fn lookup_change(&self) -> Option<(RecordId, Change)> {
        let anchor = self.change_anchor;
        self.bag.changed_values.read_with(|changes| {
            let mut range = match anchor.as_ref() {
                Some(key) => changes.range((Bound::Excluded(key), Bound::Unbounded)),
                None => changes.range::<RecordId, _>(..),
            };
            range.next().map(|(key, change)| (*key, change.clone()))
        })
    }

    fn next_merged(&mut self) -> BonsaiResult<Option<(RecordRef, i32)>> {
        loop {
            if self.next_change.is_none() && !self.changes_done {
                self.next_change = self.lookup_change();
                self.changes_done = self.next_change.is_none();
            }
            if self.next_stored.is_none() {
                self.next_stored = self.cursor.next(&self.bag.cache)?;
            }

            let take_change = match (&self.next_change, &self.next_stored) {
                (None, None) => return Ok(None),
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some((change_key, _)), Some((stored_key, _))) => change_key <= stored_key,
            };

            if take_change {
                let (key, change) = match self.next_change.take() {
                    Some(next) => next,
                    None => return Ok(None),
                };
                self.change_anchor = Some(key);
                let stored = match self.next_stored {
                    Some((stored_key, count)) if stored_key == key => Some(count),
                    _ => None,
                };
                if stored.is_some() {
                    self.next_stored = None;
                }
                let count = change.apply_to(stored.unwrap_or(0));
                if count > 0 {
                    return Ok(Some((change.record().clone(), count)));
                }
            } else if let Some((key, count)) = self.next_stored.take() {
                if count > 0 {
                    return Ok(Some((RecordRef::new(key), count)));
                }
            }
        }
    }

    fn materialize(&self, record: &RecordRef) -> BonsaiResult<RecordRef> {
        if !self.convert {
            return Ok(record.clone());
        }
        let loaded = self.bag.resolver.load(&record.identity())?;
        Ok(loaded.unwrap_or_else(|| record.clone()))
    }
}

impl Iterator for RidBagIterator<'_> {
    type Item = BonsaiResult<RecordRef>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((record, remaining)) = self.current.as_mut() {
                if *remaining > 0 {
                    *remaining -= 1;
                    let record = record.clone();
                    self.last = Some(record.clone());
                    return Some(Ok(record));
                }
                self.current = None;
            }

            match self.phase {
                Phase::NewEntries => {
                    if let Some(entry) = self.new_entries.get(self.new_index) {
                        self.current = Some(entry.clone());
                        self.new_index += 1;
                    } else {
                        self.phase = Phase::Merge;
                    }
                }
                Phase::Merge => match self.next_merged() {
                    Ok(Some((record, count))) => match self.materialize(&record) {
                        Ok(materialized) => {
                            self.current = Some((materialized.clone(), count - 1));
                            self.last = Some(record);
                            return Some(Ok(materialized));
                        }
                        Err(e) => {
                            self.phase = Phase::Done;
                            return Some(Err(e));
                        }
                    },
                    Ok(None) => self.phase = Phase::Done,
                    Err(e) => {
                        self.phase = Phase::Done;
                        return Some(Err(e));
                    }
                },
                Phase::Done => return None,
            }
        }
    }
}
