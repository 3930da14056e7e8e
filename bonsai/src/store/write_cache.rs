use crate::config::BonsaiConfig;
use crate::errors::{BonsaiError, BonsaiResult, ErrorKind};
use crate::store::{FilePageStore, MemoryPageStore, PageFile, PageSource, PageStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fnv::FnvHasher;
use parking_lot::Mutex;
use std::hash::Hasher;
use std::sync::Arc;

/// Registry of open page files.
///
/// Files are identified by a stable id derived from their name, so an id
/// stored inside a serialized collection still resolves after a restart.
/// Pages are kept in memory and written to the [`PageStore`] on [`WriteCache::flush`].
#[derive(Clone)]
pub struct WriteCache {
    inner: Arc<WriteCacheInner>,
}

struct WriteCacheInner {
    config: BonsaiConfig,
    store: Arc<dyn PageStore>,
    files: DashMap<i64, Arc<PageFile>>,
    names: DashMap<String, i64>,
    // held from taking dirty pages until the store has them
    flush_lock: Mutex<()>,
}

impl WriteCache {
    /// Creates a write cache over the store selected by `config`: a
    /// [`FilePageStore`] when a storage path is set, a [`MemoryPageStore`] otherwise.
    pub fn new(config: &BonsaiConfig) -> BonsaiResult<Self> {
        let store: Arc<dyn PageStore> = match config.storage_path() {
            Some(path) => Arc::new(FilePageStore::open(&path)?),
            None => Arc::new(MemoryPageStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Creates a write cache over an explicit page store.
    pub fn with_store(config: &BonsaiConfig, store: Arc<dyn PageStore>) -> Self {
        config.freeze();
        WriteCache {
            inner: Arc::new(WriteCacheInner {
                config: config.clone(),
                store,
                files: DashMap::new(),
                names: DashMap::new(),
                flush_lock: Mutex::new(()),
            }),
        }
    }

    /// Returns the id a file called `name` has.
    pub fn file_id_for_name(name: &str) -> i64 {
        let mut hasher = FnvHasher::default();
        hasher.write(name.as_bytes());
        (hasher.finish() & i64::MAX as u64) as i64
    }

    pub fn config(&self) -> &BonsaiConfig {
        &self.inner.config
    }

    /// Opens `name`, loading its pages from the store on first use, and
    /// returns its file id.
    pub fn open_file(&self, name: &str) -> BonsaiResult<i64> {
        self.inner.open_file(name)
    }

    /// Returns `true` when `name` is open or present in the store.
    pub fn exists(&self, name: &str) -> BonsaiResult<bool> {
        if self.inner.names.contains_key(name) {
            return Ok(true);
        }
        Ok(self.inner.store.list_files()?.iter().any(|n| n == name))
    }

    /// Returns the open file with `file_id`, opening it from the store if needed.
    pub fn file(&self, file_id: i64) -> BonsaiResult<Arc<PageFile>> {
        self.inner.file(file_id)
    }

    pub fn file_name_by_id(&self, file_id: i64) -> BonsaiResult<String> {
        self.file(file_id).map(|file| file.name().to_string())
    }

    /// Returns a copy of page `index` of a file.
    pub fn load_page(&self, file_id: i64, index: i64) -> BonsaiResult<Box<[u8]>> {
        let file = self.file(file_id)?;
        let guard = file.read();
        guard.page(index).map(|page| page.to_vec().into_boxed_slice())
    }

    /// Appends a zeroed page to a file and returns its index.
    pub fn add_page(&self, file_id: i64) -> BonsaiResult<i64> {
        let file = self.file(file_id)?;
        let mut unit = file.atomic_unit();
        let index = unit.add_page()?;
        unit.commit();
        Ok(index)
    }

    /// Number of pages of a file.
    pub fn filled_up_to(&self, file_id: i64) -> BonsaiResult<i64> {
        let file = self.file(file_id)?;
        let guard = file.read();
        Ok(guard.filled_up_to())
    }

    /// Deletes a file from the cache and the store. Trees still pointing at
    /// it fail on their next access.
    pub fn delete_file(&self, file_id: i64) -> BonsaiResult<()> {
        self.inner.delete_file(file_id)
    }

    /// Writes every dirty page to the store.
    pub fn flush(&self) -> BonsaiResult<()> {
        self.inner.flush()
    }
}

impl WriteCacheInner {
    fn open_file(&self, name: &str) -> BonsaiResult<i64> {
        if let Some(file_id) = self.names.get(name) {
            return Ok(*file_id);
        }

        let file_id = WriteCache::file_id_for_name(name);
        if let Some(existing) = self.files.get(&file_id) {
            if existing.name() != name {
                log::error!(
                    "File id {} of {} collides with {}",
                    file_id,
                    name,
                    existing.name()
                );
                return Err(BonsaiError::new(
                    &format!("File id of {} collides with {}", name, existing.name()),
                    ErrorKind::InternalError,
                ));
            }
        }

        let page_size = self.config.page_size();
        let pages = self.store.read_file(name, page_size).map_err(|e| {
            log::error!("Failed to open {}: {}", name, e);
            BonsaiError::new_with_cause(
                &format!("Failed to open {}", name),
                ErrorKind::FileAccessError,
                e,
            )
        })?;

        match self.names.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(*entry.get()),
            Entry::Vacant(entry) => {
                log::debug!("Opened {} as file {} with {} page(s)", name, file_id, pages.len());
                self.files
                    .insert(file_id, Arc::new(PageFile::new(file_id, name, page_size, pages)));
                entry.insert(file_id);
                Ok(file_id)
            }
        }
    }

    fn file(&self, file_id: i64) -> BonsaiResult<Arc<PageFile>> {
        if let Some(file) = self.files.get(&file_id) {
            return Ok(file.value().clone());
        }

        let name = self
            .store
            .list_files()?
            .into_iter()
            .find(|name| WriteCache::file_id_for_name(name) == file_id);

        match name {
            Some(name) => {
                self.open_file(&name)?;
                match self.files.get(&file_id) {
                    Some(file) => Ok(file.value().clone()),
                    None => Err(BonsaiError::new(
                        &format!("File {} was deleted while opening", name),
                        ErrorKind::FileNotFound,
                    )),
                }
            }
            None => {
                log::error!("No file with id {}", file_id);
                Err(BonsaiError::new(
                    &format!("No file with id {}", file_id),
                    ErrorKind::FileNotFound,
                ))
            }
        }
    }

    fn delete_file(&self, file_id: i64) -> BonsaiResult<()> {
        let file = self.file(file_id)?;
        self.names.remove(file.name());
        self.files.remove(&file_id);
        file.mark_deleted();
        self.store.delete_file(file.name())?;
        log::debug!("Deleted file {}", file.name());
        Ok(())
    }

    fn flush(&self) -> BonsaiResult<()> {
        let _guard = self.flush_lock.lock();
        let files = self
            .files
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();

        for file in files {
            let dirty = file.take_dirty();
            if dirty.is_empty() {
                continue;
            }
            let pages = dirty
                .iter()
                .map(|(index, image)| (*index, &image[..]))
                .collect::<Vec<_>>();
            self.store
                .write_pages(file.name(), file.page_size(), &pages)?;
            log::debug!("Flushed {} page(s) of {}", pages.len(), file.name());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> BonsaiConfig {
        BonsaiConfig::builder().geometry(1024, 256).build().unwrap()
    }

    #[test]
    fn test_open_file_is_idempotent() {
        let cache = WriteCache::new(&small_config()).unwrap();
        let a = cache.open_file("collections_1.sbc").unwrap();
        let b = cache.open_file("collections_1.sbc").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, WriteCache::file_id_for_name("collections_1.sbc"));
        assert_eq!(cache.file_name_by_id(a).unwrap(), "collections_1.sbc");
        assert_ne!(a, cache.open_file("collections_2.sbc").unwrap());
    }

    #[test]
    fn test_pages_survive_reopen_after_flush() {
        let config = small_config();
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new());
        let file_id = {
            let cache = WriteCache::with_store(&config, store.clone());
            let file_id = cache.open_file("tree.irs").unwrap();
            assert_eq!(cache.add_page(file_id).unwrap(), 0);
            {
                let file = cache.file(file_id).unwrap();
                let mut unit = file.atomic_unit();
                unit.page_mut(0).unwrap()[5] = 77;
                unit.commit();
            }
            cache.flush().unwrap();
            file_id
        };

        let reopened = WriteCache::with_store(&config, store);
        // found by id through the store listing
        assert_eq!(reopened.file_name_by_id(file_id).unwrap(), "tree.irs");
        assert_eq!(reopened.filled_up_to(file_id).unwrap(), 1);
        assert_eq!(reopened.load_page(file_id, 0).unwrap()[5], 77);
    }

    #[test]
    fn test_unflushed_pages_are_not_persisted() {
        let config = small_config();
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new());
        let cache = WriteCache::with_store(&config, store.clone());
        let file_id = cache.open_file("tree.irs").unwrap();
        cache.add_page(file_id).unwrap();

        let reopened = WriteCache::with_store(&config, store);
        assert!(reopened.file(file_id).is_err());
    }

    #[test]
    fn test_delete_file() {
        let cache = WriteCache::new(&small_config()).unwrap();
        let file_id = cache.open_file("gone.sbc").unwrap();
        cache.add_page(file_id).unwrap();
        cache.flush().unwrap();
        let file = cache.file(file_id).unwrap();

        cache.delete_file(file_id).unwrap();
        assert!(file.is_deleted());
        assert!(!cache.exists("gone.sbc").unwrap());
        assert_eq!(
            cache.file(file_id).unwrap_err().kind(),
            &ErrorKind::FileNotFound
        );
    }

    #[test]
    fn test_unknown_file_id() {
        let cache = WriteCache::new(&small_config()).unwrap();
        assert_eq!(cache.load_page(42, 0).unwrap_err().kind(), &ErrorKind::FileNotFound);
    }

    #[test]
    fn test_file_store_backed_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = BonsaiConfig::builder()
            .geometry(1024, 256)
            .storage_path(dir.path())
            .build()
            .unwrap();
        let cache = WriteCache::new(&config).unwrap();
        let file_id = cache.open_file("collections_9.sbc").unwrap();
        cache.add_page(file_id).unwrap();
        cache.add_page(file_id).unwrap();
        cache.flush().unwrap();

        let on_disk = std::fs::metadata(dir.path().join("collections_9.sbc")).unwrap();
        assert_eq!(on_disk.len(), 2048);
    }
}
