use std::fmt::{Debug, Display, Formatter};

/// Location of a bucket: the page and the byte offset inside that page.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketPointer {
    page_index: i64,
    page_offset: i32,
}

impl BucketPointer {
    pub const NULL: BucketPointer = BucketPointer::new(-1, -1);
    pub const ENCODED_SIZE: usize = 8 + 4;

    pub const fn new(page_index: i64, page_offset: i32) -> Self {
        BucketPointer {
            page_index,
            page_offset,
        }
    }

    #[inline]
    pub fn page_index(&self) -> i64 {
        self.page_index
    }

    #[inline]
    pub fn page_offset(&self) -> i32 {
        self.page_offset
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.page_index >= 0
    }

    /// Writes the pointer little-endian into the first 12 bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.page_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_offset.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut index = [0u8; 8];
        index.copy_from_slice(&buf[0..8]);
        let mut offset = [0u8; 4];
        offset.copy_from_slice(&buf[8..12]);
        BucketPointer::new(i64::from_le_bytes(index), i32::from_le_bytes(offset))
    }
}

impl Default for BucketPointer {
    fn default() -> Self {
        BucketPointer::NULL
    }
}

impl Debug for BucketPointer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page_index, self.page_offset)
    }
}

/// Persistent identity of a bonsai tree: its file and root bucket.
///
/// The root bucket never moves, so a pointer stays valid for the whole life
/// of the tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionPointer {
    file_id: i64,
    root_pointer: BucketPointer,
}

impl CollectionPointer {
    pub const INVALID: CollectionPointer = CollectionPointer {
        file_id: -1,
        root_pointer: BucketPointer::NULL,
    };

    pub fn new(file_id: i64, root_pointer: BucketPointer) -> Self {
        CollectionPointer {
            file_id,
            root_pointer,
        }
    }

    #[inline]
    pub fn file_id(&self) -> i64 {
        self.file_id
    }

    #[inline]
    pub fn root_pointer(&self) -> BucketPointer {
        self.root_pointer
    }

    pub fn is_valid(&self) -> bool {
        self.file_id >= 0 && self.root_pointer.is_valid()
    }
}

impl Debug for CollectionPointer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollectionPointer({}, {:?})", self.file_id, self.root_pointer)
    }
}

impl Display for CollectionPointer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.file_id, self.root_pointer.page_index, self.root_pointer.page_offset
        )
    }
}
