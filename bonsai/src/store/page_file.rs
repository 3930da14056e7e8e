use crate::errors::{BonsaiError, BonsaiResult, ErrorKind};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;

/// Read access to the pages of one file.
pub trait PageSource {
    /// Returns the image of page `index`.
    fn page(&self, index: i64) -> BonsaiResult<&[u8]>;

    /// Number of pages in the file.
    fn filled_up_to(&self) -> i64;
}

/// A paged file held by the write cache.
///
/// Readers share the file lock; a writer holds it exclusively through an
/// [`AtomicUnit`] for the whole of one structural mutation, so no reader
/// observes a half-applied change.
///
/// Writers are also serialized by a reentrant writer lock. A [`FileJournal`]
/// keeps it across many units so that their changes can be undone together.
pub struct PageFile {
    file_id: i64,
    name: String,
    page_size: usize,
    writer: ReentrantMutex<()>,
    state: RwLock<PageFileState>,
}

struct PageFileState {
    pages: Vec<Box<[u8]>>,
    dirty: BTreeSet<i64>,
    deleted: bool,
    journal: Option<JournalImages>,
}

/// Page images taken at the first write of a page since the journal began.
struct JournalImages {
    before_images: HashMap<i64, Box<[u8]>>,
    pages_before: usize,
}

impl Debug for PageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFile")
            .field("file_id", &self.file_id)
            .field("name", &self.name)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl PageFile {
    pub(crate) fn new(file_id: i64, name: &str, page_size: usize, pages: Vec<Box<[u8]>>) -> Self {
        PageFile {
            file_id,
            name: name.to_string(),
            page_size,
            writer: ReentrantMutex::new(()),
            state: RwLock::new(PageFileState {
                pages,
                dirty: BTreeSet::new(),
                deleted: false,
                journal: None,
            }),
        }
    }

    pub fn file_id(&self) -> i64 {
        self.file_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Takes the file lock in shared mode.
    pub fn read(&self) -> PageReadGuard<'_> {
        PageReadGuard {
            file: self,
            state: self.state.read(),
        }
    }

    /// Takes the file lock exclusively and starts recording page images so
    /// that the unit can be undone if it is dropped without [`AtomicUnit::commit`].
    pub fn atomic_unit(&self) -> AtomicUnit<'_> {
        let writer = self.writer.lock();
        let state = self.state.write();
        let pages_before = state.pages.len();
        AtomicUnit {
            file: self,
            state,
            before_images: HashMap::new(),
            newly_dirty: Vec::new(),
            pages_before,
            committed: false,
            _writer: writer,
        }
    }

    /// Keeps writers of other threads out until the guard is dropped.
    pub(crate) fn exclusive(&self) -> ReentrantMutexGuard<'_, ()> {
        self.writer.lock()
    }

    /// Starts a journal over the following writes of this thread. Writers of
    /// other threads wait until the journal is committed or dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidOperation`] when a journal is already open
    /// on this file.
    pub fn journal(&self) -> BonsaiResult<FileJournal<'_>> {
        let writer = self.writer.lock();
        let mut state = self.state.write();
        if state.journal.is_some() {
            log::error!("A journal is already open on {}", self.name);
            return Err(BonsaiError::new(
                &format!("A journal is already open on {}", self.name),
                ErrorKind::InvalidOperation,
            ));
        }
        state.journal = Some(JournalImages {
            before_images: HashMap::new(),
            pages_before: state.pages.len(),
        });
        Ok(FileJournal {
            file: self,
            committed: false,
            _writer: writer,
        })
    }

    /// Returns the dirty pages and forgets them.
    pub(crate) fn take_dirty(&self) -> Vec<(i64, Box<[u8]>)> {
        let mut state = self.state.write();
        let dirty = std::mem::take(&mut state.dirty);
        dirty
            .into_iter()
            .filter_map(|index| {
                state
                    .pages
                    .get(index as usize)
                    .map(|page| (index, page.clone()))
            })
            .collect()
    }

    pub(crate) fn mark_deleted(&self) {
        let mut state = self.state.write();
        state.deleted = true;
        state.pages.clear();
        state.dirty.clear();
    }

    pub fn is_deleted(&self) -> bool {
        self.state.read().deleted
    }
}

fn page_of<'s>(
    file: &PageFile,
    state: &'s PageFileState,
    index: i64,
) -> BonsaiResult<&'s [u8]> {
    if state.deleted {
        log::error!("Page {} requested from deleted file {}", index, file.name);
        return Err(BonsaiError::new(
            &format!("File {} has been deleted", file.name),
            ErrorKind::FileNotFound,
        ));
    }

    if index < 0 {
        return Err(BonsaiError::new(
            &format!("Negative page index {} in file {}", index, file.name),
            ErrorKind::StructuralCorruption,
        ));
    }

    match state.pages.get(index as usize) {
        Some(page) => Ok(&page[..]),
        None => {
            log::error!(
                "Page {} is beyond the end of file {} ({} pages)",
                index,
                file.name,
                state.pages.len()
            );
            Err(BonsaiError::new(
                &format!("Page {} is beyond the end of file {}", index, file.name),
                ErrorKind::StructuralCorruption,
            ))
        }
    }
}

/// Shared access to a page file.
pub struct PageReadGuard<'a> {
    file: &'a PageFile,
    state: RwLockReadGuard<'a, PageFileState>,
}

impl PageSource for PageReadGuard<'_> {
    fn page(&self, index: i64) -> BonsaiResult<&[u8]> {
        page_of(self.file, &self.state, index)
    }

    fn filled_up_to(&self) -> i64 {
        self.state.pages.len() as i64
    }
}

/// Exclusive access to a page file for one atomic structural change.
///
/// The first write to a page saves its before-image. Dropping the unit
/// without committing restores those images and drops pages added by the unit.
pub struct AtomicUnit<'a> {
    file: &'a PageFile,
    state: RwLockWriteGuard<'a, PageFileState>,
    before_images: HashMap<i64, Box<[u8]>>,
    newly_dirty: Vec<i64>,
    pages_before: usize,
    committed: bool,
    _writer: ReentrantMutexGuard<'a, ()>,
}

impl AtomicUnit<'_> {
    /// Returns page `index` for writing.
    pub fn page_mut(&mut self, index: i64) -> BonsaiResult<&mut [u8]> {
        page_of(self.file, &self.state, index)?;
        let slot = index as usize;
        if slot < self.pages_before && !self.before_images.contains_key(&index) {
            let image = self.state.pages[slot].clone();
            self.before_images.insert(index, image);
        }

        let state = &mut *self.state;
        if let Some(journal) = state.journal.as_mut() {
            if slot < journal.pages_before && !journal.before_images.contains_key(&index) {
                journal.before_images.insert(index, state.pages[slot].clone());
            }
        }
        if state.dirty.insert(index) {
            self.newly_dirty.push(index);
        }
        Ok(&mut state.pages[slot][..])
    }

    /// Appends a zeroed page and returns its index.
    pub fn add_page(&mut self) -> BonsaiResult<i64> {
        if self.state.deleted {
            return Err(BonsaiError::new(
                &format!("File {} has been deleted", self.file.name),
                ErrorKind::FileNotFound,
            ));
        }
        let index = self.state.pages.len() as i64;
        self.state
            .pages
            .push(vec![0u8; self.file.page_size].into_boxed_slice());
        self.state.dirty.insert(index);
        self.newly_dirty.push(index);
        log::debug!("Added page {} to file {}", index, self.file.name);
        Ok(index)
    }

    /// Makes the changes of this unit permanent.
    pub fn commit(mut self) {
        self.committed = true;
    }

    pub fn file(&self) -> &PageFile {
        self.file
    }
}

impl PageSource for AtomicUnit<'_> {
    fn page(&self, index: i64) -> BonsaiResult<&[u8]> {
        page_of(self.file, &self.state, index)
    }

    fn filled_up_to(&self) -> i64 {
        self.state.pages.len() as i64
    }
}

impl Drop for AtomicUnit<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        log::warn!(
            "Rolling back {} page(s) of file {}",
            self.before_images.len(),
            self.file.name
        );
        for (index, image) in self.before_images.drain() {
            if let Some(page) = self.state.pages.get_mut(index as usize) {
                *page = image;
            }
        }
        for index in self.newly_dirty.drain(..) {
            self.state.dirty.remove(&index);
        }
        let pages_before = self.pages_before;
        self.state.pages.truncate(pages_before);
    }
}

/// Undo log of a page file spanning several [`AtomicUnit`]s.
///
/// Dropping the journal without [`FileJournal::commit`] puts every page
/// written since [`PageFile::journal`] back to its earlier image, drops the
/// pages added since and marks the restored pages dirty again.
pub struct FileJournal<'a> {
    file: &'a PageFile,
    committed: bool,
    _writer: ReentrantMutexGuard<'a, ()>,
}

impl FileJournal<'_> {
    /// Keeps the journaled changes.
    pub fn commit(mut self) {
        self.committed = true;
    }

    pub fn file(&self) -> &PageFile {
        self.file
    }
}

impl Drop for FileJournal<'_> {
    fn drop(&mut self) {
        let mut guard = self.file.state.write();
        let state = &mut *guard;
        let journal = match state.journal.take() {
            Some(journal) => journal,
            None => return,
        };
        if self.committed || state.deleted {
            return;
        }

        log::warn!(
            "Undoing {} journaled page(s) of file {}",
            journal.before_images.len(),
            self.file.name
        );
        for (index, image) in journal.before_images {
            if let Some(page) = state.pages.get_mut(index as usize) {
                *page = image;
                state.dirty.insert(index);
            }
        }
        let pages_before = journal.pages_before;
        state.pages.truncate(pages_before);
        state.dirty.retain(|index| (*index as usize) < pages_before);
    }
}
