//! Durable backing for page files.
//!
//! A page store keeps whole pages of named files. It is only touched when a
//! file is first opened and when dirty pages are flushed.

use crate::common::{atomic, Atomic, Guarded};
use crate::errors::{BonsaiError, BonsaiResult, ErrorKind};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Storage for the pages of named files.
pub trait PageStore: Send + Sync {
    /// Names of all files known to the store.
    fn list_files(&self) -> BonsaiResult<Vec<String>>;

    /// Reads every page of `name`. A missing file has no pages.
    fn read_file(&self, name: &str, page_size: usize) -> BonsaiResult<Vec<Box<[u8]>>>;

    /// Writes the given `(page index, page image)` pairs of `name`, creating
    /// the file when needed.
    fn write_pages(&self, name: &str, page_size: usize, pages: &[(i64, &[u8])]) -> BonsaiResult<()>;

    /// Removes `name` and all its pages. Removing a missing file is a no-op.
    fn delete_file(&self, name: &str) -> BonsaiResult<()>;
}

/// Keeps flushed pages in memory. Reopening a file from the same store sees
/// the last flushed images.
#[derive(Clone, Default)]
pub struct MemoryPageStore {
    files: Atomic<HashMap<String, Vec<Box<[u8]>>>>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        MemoryPageStore {
            files: atomic(HashMap::new()),
        }
    }
}

impl PageStore for MemoryPageStore {
    fn list_files(&self) -> BonsaiResult<Vec<String>> {
        Ok(self.files.read_with(|files| files.keys().cloned().collect()))
    }

    fn read_file(&self, name: &str, _page_size: usize) -> BonsaiResult<Vec<Box<[u8]>>> {
        Ok(self
            .files
            .read_with(|files| files.get(name).cloned().unwrap_or_default()))
    }

    fn write_pages(&self, name: &str, page_size: usize, pages: &[(i64, &[u8])]) -> BonsaiResult<()> {
        self.files.write_with(|files| {
            let stored = files.entry(name.to_string()).or_default();
            for (index, image) in pages {
                let index = *index as usize;
                while stored.len() <= index {
                    stored.push(vec![0u8; page_size].into_boxed_slice());
                }
                stored[index].copy_from_slice(image);
            }
        });
        Ok(())
    }

    fn delete_file(&self, name: &str) -> BonsaiResult<()> {
        self.files.write_with(|files| files.remove(name));
        Ok(())
    }
}

/// Keeps each file as a plain file of consecutive pages inside a directory.
pub struct FilePageStore {
    root: PathBuf,
}

impl FilePageStore {
    /// Opens (and creates when missing) the storage directory.
    pub fn open(root: &Path) -> BonsaiResult<Self> {
        fs::create_dir_all(root).map_err(|e| {
            log::error!("Failed to create storage directory {}: {}", root.display(), e);
            BonsaiError::new_with_cause(
                &format!("Failed to create storage directory {}", root.display()),
                ErrorKind::FileAccessError,
                e.into(),
            )
        })?;
        Ok(FilePageStore {
            root: root.to_path_buf(),
        })
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl PageStore for FilePageStore {
    fn list_files(&self) -> BonsaiResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn read_file(&self, name: &str, page_size: usize) -> BonsaiResult<Vec<Box<[u8]>>> {
        let path = self.path_of(name);
        let mut file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                log::error!("Failed to open {}: {}", path.display(), e);
                return Err(BonsaiError::new_with_cause(
                    &format!("Failed to open {}", path.display()),
                    ErrorKind::FileAccessError,
                    e.into(),
                ));
            }
        };

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        if content.len() % page_size != 0 {
            log::error!(
                "File {} has {} bytes which is not a multiple of page size {}",
                path.display(),
                content.len(),
                page_size
            );
            return Err(BonsaiError::new(
                &format!("File {} is truncated", path.display()),
                ErrorKind::StructuralCorruption,
            ));
        }

        Ok(content
            .chunks(page_size)
            .map(|chunk| chunk.to_vec().into_boxed_slice())
            .collect())
    }

    fn write_pages(&self, name: &str, page_size: usize, pages: &[(i64, &[u8])]) -> BonsaiResult<()> {
        let path = self.path_of(name);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                log::error!("Failed to open {} for writing: {}", path.display(), e);
                BonsaiError::new_with_cause(
                    &format!("Failed to open {} for writing", path.display()),
                    ErrorKind::FileAccessError,
                    e.into(),
                )
            })?;

        for (index, image) in pages {
            let offset = (*index as u64) * page_size as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(image)?;
        }
        file.sync_data()?;
        Ok(())
    }

    fn delete_file(&self, name: &str) -> BonsaiResult<()> {
        match fs::remove_file(self.path_of(name)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; 16]
    }

    fn check_store(store: &dyn PageStore) {
        assert!(store.read_file("a.sbc", 16).unwrap().is_empty());

        let one = page(1);
        let three = page(3);
        store
            .write_pages("a.sbc", 16, &[(0, one.as_slice()), (2, three.as_slice())])
            .unwrap();

        let pages = store.read_file("a.sbc", 16).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(&*pages[0], &one[..]);
        assert_eq!(&*pages[1], &[0u8; 16][..]);
        assert_eq!(&*pages[2], &three[..]);

        let two = page(2);
        store.write_pages("a.sbc", 16, &[(1, two.as_slice())]).unwrap();
        let pages = store.read_file("a.sbc", 16).unwrap();
        assert_eq!(&*pages[1], &two[..]);

        assert_eq!(store.list_files().unwrap(), vec!["a.sbc".to_string()]);

        store.delete_file("a.sbc").unwrap();
        store.delete_file("a.sbc").unwrap();
        assert!(store.read_file("a.sbc", 16).unwrap().is_empty());
        assert!(store.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store() {
        check_store(&MemoryPageStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = tempdir().unwrap();
        let store = FilePageStore::open(dir.path()).unwrap();
        check_store(&store);
    }

    #[test]
    fn test_file_store_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.sbc"), [0u8; 10]).unwrap();
        let store = FilePageStore::open(dir.path()).unwrap();
        let err = store.read_file("broken.sbc", 16).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::StructuralCorruption);
    }

    #[test]
    fn test_memory_store_clones_share_files() {
        let store = MemoryPageStore::new();
        let clone = store.clone();
        let image = [9u8; 4];
        store.write_pages("x", 4, &[(0, &image[..])]).unwrap();
        assert_eq!(clone.read_file("x", 4).unwrap().len(), 1);
    }
}
