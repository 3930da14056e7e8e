use crate::cache::TreeHandleCache;
use crate::common::RecordId;
use crate::errors::{BonsaiError, BonsaiResult, ErrorKind};
use crate::index::embedded_or_tree_set::Underlying;
use crate::index::EmbeddedOrTreeSet;
use crate::store::WriteCache;
use crate::tree::{BucketPointer, CollectionPointer, PostingMarker};
use std::collections::BTreeSet;

const FIXED_SIZE: usize = 4 + 8 + 4 + 8 + 4;
const REF_SIZE: usize = 2 + 8;

/// Writes `set` as a mixed container:
///
/// ```text
/// total_size: i32 | file_id: i64 | embedded_count: i32 | embedded_count x (cluster: i16, position: i64)
///     | root_page: i64 | root_offset: i32
/// ```
///
/// All numbers are little-endian. A tree backed set has no embedded refs, an
/// embedded set has a root page of `-1`.
pub fn encode(set: &EmbeddedOrTreeSet) -> BonsaiResult<Vec<u8>> {
    let (embedded, root) = match set.underlying() {
        Underlying::Embedded(ids) => (Some(ids), BucketPointer::NULL),
        Underlying::Tree(pointer) => (None, pointer.root_pointer()),
    };
    let count = embedded.map(|ids| ids.len()).unwrap_or(0);
    let total_size = FIXED_SIZE + count * REF_SIZE;
    if total_size > i32::MAX as usize {
        return Err(BonsaiError::new(
            &format!("Posting set of {} elements is too large to encode", count),
            ErrorKind::EncodingError,
        ));
    }

    let file_id = WriteCache::file_id_for_name(set.file_name());
    let mut bytes = Vec::with_capacity(total_size);
    bytes.extend_from_slice(&(total_size as i32).to_le_bytes());
    bytes.extend_from_slice(&file_id.to_le_bytes());
    bytes.extend_from_slice(&(count as i32).to_le_bytes());
    if let Some(ids) = embedded {
        let mut buf = [0u8; REF_SIZE];
        for id in ids {
            id.encode_key(&mut buf)?;
            bytes.extend_from_slice(&buf);
        }
    }
    bytes.extend_from_slice(&root.page_index().to_le_bytes());
    bytes.extend_from_slice(&root.page_offset().to_le_bytes());
    Ok(bytes)
}

/// Reads a container written by [`encode`] for the index called `name`.
///
/// # Errors
///
/// Returns [`ErrorKind::EncodingError`] when the bytes are truncated, carry
/// an inconsistent size or count, or belong to another index file.
pub fn decode(
    bytes: &[u8],
    cache: TreeHandleCache<PostingMarker>,
    name: &str,
) -> BonsaiResult<EmbeddedOrTreeSet> {
    let mut reader = Reader::new(bytes);
    let total_size = reader.i32()?;
    if total_size < 0 || total_size as usize != bytes.len() {
        return Err(encoding_error(&format!(
            "Posting set declares {} bytes but {} were given",
            total_size,
            bytes.len()
        )));
    }

    let file_name = EmbeddedOrTreeSet::file_name_for(name);
    let file_id = reader.i64()?;
    if file_id != WriteCache::file_id_for_name(&file_name) {
        return Err(encoding_error(&format!(
            "Posting set belongs to file {} and not to {}",
            file_id, file_name
        )));
    }

    let count = reader.i32()?;
    if count < 0 || FIXED_SIZE + count as usize * REF_SIZE != bytes.len() {
        return Err(encoding_error(&format!(
            "Posting set count {} does not match its size {}",
            count,
            bytes.len()
        )));
    }

    let mut ids = BTreeSet::new();
    for _ in 0..count {
        ids.insert(RecordId::decode_key(reader.take(REF_SIZE)?));
    }

    let page_index = reader.i64()?;
    let page_offset = reader.i32()?;
    let underlying = if page_index >= 0 {
        if count > 0 {
            return Err(encoding_error(
                "Posting set carries both embedded refs and a tree",
            ));
        }
        let root = BucketPointer::new(page_index, page_offset);
        Underlying::Tree(CollectionPointer::new(file_id, root))
    } else {
        Underlying::Embedded(ids)
    };

    Ok(EmbeddedOrTreeSet::with_underlying(cache, file_name, underlying))
}

fn encoding_error(message: &str) -> BonsaiError {
    log::error!("{}", message);
    BonsaiError::new(message, ErrorKind::EncodingError)
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, position: 0 }
    }

    fn take(&mut self, len: usize) -> BonsaiResult<&'a [u8]> {
        let end = self.position + len;
        if end > self.bytes.len() {
            return Err(encoding_error(&format!(
                "Posting set is truncated at byte {}",
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn i32(&mut self) -> BonsaiResult<i32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(buf))
    }

    fn i64(&mut self) -> BonsaiResult<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(buf))
    }
}
