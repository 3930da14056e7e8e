use crate::tree::BucketPointer;

const INIT_FLAG_OFFSET: usize = 0;
const FREE_SPACE_OFFSET: usize = INIT_FLAG_OFFSET + 1;
const FREE_LIST_HEAD_OFFSET: usize = FREE_SPACE_OFFSET + BucketPointer::ENCODED_SIZE;
const FREE_LIST_LENGTH_OFFSET: usize = FREE_LIST_HEAD_OFFSET + BucketPointer::ENCODED_SIZE;

const INITIALIZED: u8 = 1;

/// Location of the system bucket in every bonsai file.
pub const SYS_BUCKET: BucketPointer = BucketPointer::new(0, 0);

/// File-wide allocation state kept in the first bucket of page 0.
///
/// `free_space` points at the next never-used bucket slot, the free list
/// chains recycled buckets through their free-list pointer.
pub struct SysBucket<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> SysBucket<B> {
    pub fn new(buf: B) -> Self {
        SysBucket { buf }
    }

    pub fn is_initialized(&self) -> bool {
        self.buf.as_ref()[INIT_FLAG_OFFSET] == INITIALIZED
    }

    pub fn free_space_pointer(&self) -> BucketPointer {
        BucketPointer::decode(&self.buf.as_ref()[FREE_SPACE_OFFSET..])
    }

    pub fn free_list_head(&self) -> BucketPointer {
        BucketPointer::decode(&self.buf.as_ref()[FREE_LIST_HEAD_OFFSET..])
    }

    pub fn free_list_length(&self) -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf.as_ref()[FREE_LIST_LENGTH_OFFSET..FREE_LIST_LENGTH_OFFSET + 8]);
        i64::from_le_bytes(bytes)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SysBucket<B> {
    /// Marks the file as initialized with the first free slot right after
    /// the system bucket and an empty free list.
    pub fn init(&mut self, bucket_size: usize) {
        self.buf.as_mut()[INIT_FLAG_OFFSET] = INITIALIZED;
        self.set_free_space_pointer(BucketPointer::new(0, bucket_size as i32));
        self.set_free_list_head(BucketPointer::NULL);
        self.set_free_list_length(0);
    }

    pub fn set_free_space_pointer(&mut self, pointer: BucketPointer) {
        pointer.encode(&mut self.buf.as_mut()[FREE_SPACE_OFFSET..]);
    }

    pub fn set_free_list_head(&mut self, pointer: BucketPointer) {
        pointer.encode(&mut self.buf.as_mut()[FREE_LIST_HEAD_OFFSET..]);
    }

    pub fn set_free_list_length(&mut self, length: i64) {
        self.buf.as_mut()[FREE_LIST_LENGTH_OFFSET..FREE_LIST_LENGTH_OFFSET + 8]
            .copy_from_slice(&length.to_le_bytes());
    }
}
