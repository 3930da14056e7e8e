use crate::common::RecordId;
use crate::errors::BonsaiResult;
use crate::tree::{BucketPointer, BucketValue};
use std::cmp::Ordering;
use std::marker::PhantomData;

const FREE_POINTER_OFFSET: usize = 0;
pub(crate) const SIZE_OFFSET: usize = FREE_POINTER_OFFSET + 4;
const FLAGS_OFFSET: usize = SIZE_OFFSET + 4;
const FREE_LIST_POINTER_OFFSET: usize = FLAGS_OFFSET + 1;
const LEFT_SIBLING_OFFSET: usize = FREE_LIST_POINTER_OFFSET + BucketPointer::ENCODED_SIZE;
const RIGHT_SIBLING_OFFSET: usize = LEFT_SIBLING_OFFSET + BucketPointer::ENCODED_SIZE;
const TREE_SIZE_OFFSET: usize = RIGHT_SIBLING_OFFSET + BucketPointer::ENCODED_SIZE;
pub(crate) const ENTRIES_OFFSET: usize = TREE_SIZE_OFFSET + 8;

const LEAF: u8 = 1;
const DELETED: u8 = 2;

const INTERNAL_ENTRY_SIZE: usize = 2 * BucketPointer::ENCODED_SIZE + RecordId::ENCODED_SIZE;

/// Smallest bucket that still holds enough separators to split.
pub const MIN_BUCKET_SIZE: usize = 256;

/// A view over the bytes of one bucket.
///
/// Entries have a fixed width and are kept sorted and contiguous right after
/// the header; the free pointer marks the end of the entry area.
///
/// Leaf entry: `key | value`. Non-leaf entry: `left child | right child | key`,
/// where the right child of entry `i` is the left child of entry `i + 1`.
pub struct Bucket<B, V> {
    buf: B,
    _value: PhantomData<V>,
}

impl<B, V> Bucket<B, V>
where
    B: AsRef<[u8]>,
    V: BucketValue,
{
    pub fn new(buf: B) -> Self {
        Bucket {
            buf,
            _value: PhantomData,
        }
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn read_i32(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.bytes()[offset..offset + 4]);
        i32::from_le_bytes(bytes)
    }

    fn read_i64(&self, offset: usize) -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.bytes()[offset..offset + 8]);
        i64::from_le_bytes(bytes)
    }

    fn read_pointer(&self, offset: usize) -> BucketPointer {
        BucketPointer::decode(&self.bytes()[offset..offset + BucketPointer::ENCODED_SIZE])
    }

    pub fn size(&self) -> usize {
        self.read_i32(SIZE_OFFSET).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.bytes()[FLAGS_OFFSET] & LEAF == LEAF
    }

    pub fn is_deleted(&self) -> bool {
        self.bytes()[FLAGS_OFFSET] & DELETED == DELETED
    }

    /// Checks the header fields that entry access relies on: known flag bits
    /// and a stored size between zero and the capacity.
    pub fn is_well_formed(&self) -> bool {
        let flags = self.bytes()[FLAGS_OFFSET];
        let size = self.read_i32(SIZE_OFFSET);
        flags & !(LEAF | DELETED) == 0 && size >= 0 && size as usize <= self.capacity()
    }

    pub fn free_pointer(&self) -> usize {
        self.read_i32(FREE_POINTER_OFFSET).max(0) as usize
    }

    pub fn entry_size(&self) -> usize {
        if self.is_leaf() {
            RecordId::ENCODED_SIZE + V::SIZE
        } else {
            INTERNAL_ENTRY_SIZE
        }
    }

    /// Number of entries that fit in this bucket.
    pub fn capacity(&self) -> usize {
        (self.bytes().len() - ENTRIES_OFFSET) / self.entry_size()
    }

    #[inline]
    fn entry_offset(&self, index: usize) -> usize {
        ENTRIES_OFFSET + index * self.entry_size()
    }

    pub fn key(&self, index: usize) -> RecordId {
        let offset = if self.is_leaf() {
            self.entry_offset(index)
        } else {
            self.entry_offset(index) + 2 * BucketPointer::ENCODED_SIZE
        };
        RecordId::decode_key(&self.bytes()[offset..offset + RecordId::ENCODED_SIZE])
    }

    pub fn value(&self, index: usize) -> V {
        let offset = self.entry_offset(index) + RecordId::ENCODED_SIZE;
        V::decode(&self.bytes()[offset..offset + V::SIZE])
    }

    pub fn left_child(&self, index: usize) -> BucketPointer {
        self.read_pointer(self.entry_offset(index))
    }

    pub fn right_child(&self, index: usize) -> BucketPointer {
        self.read_pointer(self.entry_offset(index) + BucketPointer::ENCODED_SIZE)
    }

    /// Returns the `j`-th child of a non-leaf bucket, counting from the left
    /// child of entry 0 up to the right child of the last entry.
    pub fn child(&self, position: usize) -> BucketPointer {
        if position < self.size() {
            self.left_child(position)
        } else {
            self.right_child(position - 1)
        }
    }

    /// Binary search for `key`. `Err` carries the insertion index.
    pub fn find(&self, key: &RecordId) -> Result<usize, usize> {
        let mut low = 0usize;
        let mut high = self.size();
        while low < high {
            let mid = (low + high) / 2;
            match self.key(mid).cmp(key) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(low)
    }

    pub fn raw_entry(&self, index: usize) -> Vec<u8> {
        let offset = self.entry_offset(index);
        self.bytes()[offset..offset + self.entry_size()].to_vec()
    }

    pub fn left_sibling(&self) -> BucketPointer {
        self.read_pointer(LEFT_SIBLING_OFFSET)
    }

    pub fn right_sibling(&self) -> BucketPointer {
        self.read_pointer(RIGHT_SIBLING_OFFSET)
    }

    pub fn free_list_pointer(&self) -> BucketPointer {
        self.read_pointer(FREE_LIST_POINTER_OFFSET)
    }

    /// Number of keys in the whole tree. Only meaningful on the root bucket.
    pub fn tree_size(&self) -> i64 {
        self.read_i64(TREE_SIZE_OFFSET)
    }
}

impl<B, V> Bucket<B, V>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
    V: BucketValue,
{
    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// The whole bucket image, header included.
    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    fn write_i32(&mut self, offset: usize, value: i32) {
        self.bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_pointer(&mut self, offset: usize, pointer: BucketPointer) {
        pointer.encode(&mut self.bytes_mut()[offset..offset + BucketPointer::ENCODED_SIZE]);
    }

    /// Resets the bucket to an empty leaf or non-leaf bucket.
    pub fn init(&mut self, is_leaf: bool) {
        self.bytes_mut()[..ENTRIES_OFFSET].fill(0);
        self.bytes_mut()[FLAGS_OFFSET] = if is_leaf { LEAF } else { 0 };
        self.set_size(0);
        self.write_pointer(FREE_LIST_POINTER_OFFSET, BucketPointer::NULL);
        self.write_pointer(LEFT_SIBLING_OFFSET, BucketPointer::NULL);
        self.write_pointer(RIGHT_SIBLING_OFFSET, BucketPointer::NULL);
        self.set_tree_size(0);
    }

    fn set_size(&mut self, size: usize) {
        let free_pointer = ENTRIES_OFFSET + size * self.entry_size();
        self.write_i32(SIZE_OFFSET, size as i32);
        self.write_i32(FREE_POINTER_OFFSET, free_pointer as i32);
    }

    pub fn set_deleted(&mut self) {
        self.bytes_mut()[FLAGS_OFFSET] |= DELETED;
    }

    /// Opens a gap at `index`. Returns `false` when the bucket is full.
    fn make_room(&mut self, index: usize) -> bool {
        let size = self.size();
        if size >= self.capacity() {
            return false;
        }
        let entry_size = self.entry_size();
        let start = self.entry_offset(index);
        let end = self.entry_offset(size);
        self.bytes_mut().copy_within(start..end, start + entry_size);
        self.set_size(size + 1);
        true
    }

    /// Inserts a leaf entry at `index`. Returns `false` when the bucket is full.
    ///
    /// Fails without touching the bucket when `key` has no key form.
    pub fn add_leaf_entry(&mut self, index: usize, key: &RecordId, value: &V) -> BonsaiResult<bool> {
        let mut encoded = [0u8; RecordId::ENCODED_SIZE];
        key.encode_key(&mut encoded)?;
        if !self.make_room(index) {
            return Ok(false);
        }
        let offset = self.entry_offset(index);
        self.bytes_mut()[offset..offset + RecordId::ENCODED_SIZE].copy_from_slice(&encoded);
        let offset = offset + RecordId::ENCODED_SIZE;
        value.encode(&mut self.bytes_mut()[offset..offset + V::SIZE]);
        Ok(true)
    }

    pub fn set_value(&mut self, index: usize, value: &V) {
        let offset = self.entry_offset(index) + RecordId::ENCODED_SIZE;
        value.encode(&mut self.bytes_mut()[offset..offset + V::SIZE]);
    }

    /// Inserts a separator at `index`. With `update_neighbors` the right child
    /// of the previous entry and the left child of the next entry are rewired
    /// to keep children contiguous. Returns `false` when the bucket is full.
    pub fn add_internal_entry(
        &mut self,
        index: usize,
        left: BucketPointer,
        right: BucketPointer,
        key: &RecordId,
        update_neighbors: bool,
    ) -> BonsaiResult<bool> {
        let mut encoded = [0u8; RecordId::ENCODED_SIZE];
        key.encode_key(&mut encoded)?;
        if !self.make_room(index) {
            return Ok(false);
        }
        let offset = self.entry_offset(index);
        self.write_pointer(offset, left);
        self.write_pointer(offset + BucketPointer::ENCODED_SIZE, right);
        let key_offset = offset + 2 * BucketPointer::ENCODED_SIZE;
        self.bytes_mut()[key_offset..key_offset + RecordId::ENCODED_SIZE].copy_from_slice(&encoded);

        if update_neighbors {
            let size = self.size();
            if index > 0 {
                self.set_right_child(index - 1, left);
            }
            if index + 1 < size {
                self.set_left_child(index + 1, right);
            }
        }
        Ok(true)
    }

    pub fn set_left_child(&mut self, index: usize, pointer: BucketPointer) {
        let offset = self.entry_offset(index);
        self.write_pointer(offset, pointer);
    }

    pub fn set_right_child(&mut self, index: usize, pointer: BucketPointer) {
        let offset = self.entry_offset(index) + BucketPointer::ENCODED_SIZE;
        self.write_pointer(offset, pointer);
    }

    /// Replaces the child at `position` (see [`Bucket::child`]).
    pub fn set_child(&mut self, position: usize, pointer: BucketPointer) {
        let size = self.size();
        if position < size {
            self.set_left_child(position, pointer);
        }
        if position > 0 {
            self.set_right_child(position - 1, pointer);
        }
    }

    /// Removes the entry at `index`, closing the gap.
    pub fn remove(&mut self, index: usize) {
        let size = self.size();
        let entry_size = self.entry_size();
        let start = self.entry_offset(index) + entry_size;
        let end = self.entry_offset(size);
        self.bytes_mut()
            .copy_within(start..end, start - entry_size);
        self.set_size(size - 1);
    }

    /// Drops the child at `position` of a non-leaf bucket with at least two
    /// entries. The neighbouring child takes over its key range.
    pub fn remove_child(&mut self, position: usize) {
        let size = self.size();
        if position < size {
            let right = self.right_child(position);
            self.remove(position);
            if position > 0 {
                self.set_right_child(position - 1, right);
            }
        } else {
            self.remove(size - 1);
        }
    }

    /// Appends raw entries taken from a bucket of the same kind.
    pub fn add_all(&mut self, entries: &[Vec<u8>]) {
        let size = self.size();
        let entry_size = self.entry_size();
        for (i, entry) in entries.iter().enumerate() {
            let offset = self.entry_offset(size + i);
            self.bytes_mut()[offset..offset + entry_size].copy_from_slice(entry);
        }
        self.set_size(size + entries.len());
    }

    /// Keeps only the first `new_size` entries.
    pub fn shrink(&mut self, new_size: usize) {
        if new_size < self.size() {
            self.set_size(new_size);
        }
    }

    pub fn set_left_sibling(&mut self, pointer: BucketPointer) {
        self.write_pointer(LEFT_SIBLING_OFFSET, pointer);
    }

    pub fn set_right_sibling(&mut self, pointer: BucketPointer) {
        self.write_pointer(RIGHT_SIBLING_OFFSET, pointer);
    }

    pub fn set_free_list_pointer(&mut self, pointer: BucketPointer) {
        self.write_pointer(FREE_LIST_POINTER_OFFSET, pointer);
    }

    pub fn set_tree_size(&mut self, size: i64) {
        self.bytes_mut()[TREE_SIZE_OFFSET..TREE_SIZE_OFFSET + 8].copy_from_slice(&size.to_le_bytes());
    }
}
