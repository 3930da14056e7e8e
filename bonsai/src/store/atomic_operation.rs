use crate::cache::TreeHandleCache;
use crate::common::{Atomic, Guarded, RecordId};
use crate::errors::BonsaiResult;
use crate::ridbag::Change;
use crate::tree::CollectionPointer;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tree mutation deferred until the enclosing atomic operation commits.
#[derive(Clone, Debug)]
pub enum DeferredOperation {
    /// Applies the pending deltas to the tree. The map is shared with the
    /// rid bag that pushed the operation and is emptied once applied.
    UpdateTree {
        pointer: CollectionPointer,
        changes: Atomic<BTreeMap<RecordId, Change>>,
    },
    /// Deletes the tree.
    DeleteTree { pointer: CollectionPointer },
}

impl DeferredOperation {
    pub fn pointer(&self) -> CollectionPointer {
        match self {
            DeferredOperation::UpdateTree { pointer, .. } => *pointer,
            DeferredOperation::DeleteTree { pointer } => *pointer,
        }
    }
}

/// The unit of work link collections defer their tree mutations to.
///
/// Operations are queued by `serialize` and `delete` of a rid bag and run
/// in push order on [`AtomicOperation::commit`].
#[derive(Clone, Default)]
pub struct AtomicOperation {
    inner: Arc<AtomicOperationInner>,
}

#[derive(Default)]
struct AtomicOperationInner {
    operations: Mutex<Vec<DeferredOperation>>,
}

impl AtomicOperation {
    pub fn new() -> Self {
        AtomicOperation::default()
    }

    /// Queues `operation` after the already pushed ones.
    pub fn push(&self, operation: DeferredOperation) {
        log::debug!("Deferred {:?}", operation);
        self.inner.operations.lock().push(operation);
    }

    /// A copy of the queued operations, oldest first.
    pub fn pending(&self) -> Vec<DeferredOperation> {
        self.inner.operations.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.operations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies the queued operations in order and flushes the written pages.
    ///
    /// The commit is all or nothing. Every file the queued operations touch
    /// is journaled first, and the first error undoes the tree changes made
    /// so far. A failed commit keeps its queue and the pending deltas of
    /// every rid bag, so it can be retried or rolled back.
    pub fn commit(&self, cache: &TreeHandleCache<i32>) -> BonsaiResult<()> {
        let mut queue = self.inner.operations.lock();
        let count = queue.len();

        let mut file_ids = queue.iter().map(|op| op.pointer().file_id()).collect::<Vec<_>>();
        file_ids.sort_unstable();
        file_ids.dedup();
        let files = file_ids
            .into_iter()
            .map(|file_id| cache.write_cache().file(file_id))
            .collect::<BonsaiResult<Vec<_>>>()
            .map_err(|e| {
                log::error!("Failed to open the files of a commit: {}", e);
                e
            })?;
        // in file id order, so that concurrent commits never wait on each other in a cycle
        let journals = files
            .iter()
            .map(|file| file.journal())
            .collect::<BonsaiResult<Vec<_>>>()?;

        let mut applied: Vec<&Atomic<BTreeMap<RecordId, Change>>> = Vec::new();
        for operation in queue.iter() {
            let result = match operation {
                DeferredOperation::UpdateTree { pointer, changes } => {
                    if applied.iter().any(|seen| Arc::ptr_eq(seen, changes)) {
                        continue;
                    }
                    applied.push(changes);
                    apply_changes(cache, pointer, changes)
                }
                DeferredOperation::DeleteTree { pointer } => cache.delete(pointer),
            };
            if let Err(e) = result {
                log::error!("Failed to commit {:?}: {}", operation, e);
                drop(journals);
                return Err(e);
            }
        }

        for journal in journals {
            journal.commit();
        }
        for changes in applied {
            changes.write_with(|changes| changes.clear());
        }
        queue.clear();
        drop(queue);

        cache.write_cache().flush()?;
        log::debug!("Committed {} deferred operation(s)", count);
        Ok(())
    }

    /// Drops every queued operation.
    pub fn rollback(&self) {
        let dropped = std::mem::take(&mut *self.inner.operations.lock());
        log::debug!("Rolled back {} deferred operation(s)", dropped.len());
    }
}

fn apply_changes(
    cache: &TreeHandleCache<i32>,
    pointer: &CollectionPointer,
    changes: &Atomic<BTreeMap<RecordId, Change>>,
) -> BonsaiResult<()> {
    let changes = changes.read_with(|changes| changes.clone());
    if changes.is_empty() {
        return Ok(());
    }

    let tree = cache.load_sb_tree(pointer)?;
    for (key, change) in changes {
        let stored = tree.get(&key)?;
        let updated = change.apply_to(stored.unwrap_or(0));
        if updated > 0 {
            tree.put(&key, &updated)?;
        } else if stored.is_some() {
            tree.remove(&key)?;
        }
    }
    tree.release()
}

/// What a rid bag needs from its surroundings while it is serialized: the
/// atomic operation in progress, if any.
#[derive(Clone, Default)]
pub struct SerializationContext {
    operation: Option<AtomicOperation>,
}

impl SerializationContext {
    pub fn new(operation: AtomicOperation) -> Self {
        SerializationContext {
            operation: Some(operation),
        }
    }

    /// A context with no atomic operation. Tree allocation and deferred
    /// updates are skipped.
    pub fn detached() -> Self {
        SerializationContext { operation: None }
    }

    pub fn current_operation(&self) -> Option<&AtomicOperation> {
        self.operation.as_ref()
    }

    /// Queues `operation` on the current atomic operation. Returns `false`
    /// when there is none.
    pub fn push(&self, operation: DeferredOperation) -> bool {
        match &self.operation {
            Some(current) => {
                current.push(operation);
                true
            }
            None => false,
        }
    }
}
