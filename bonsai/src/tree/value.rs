use std::fmt::Debug;

/// Fixed-width value stored next to each key of a leaf bucket.
pub trait BucketValue: Copy + PartialEq + Debug + Send + Sync + 'static {
    /// Encoded width in bytes.
    const SIZE: usize;

    fn encode(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> Self;
}

/// Occurrence counts of a rid bag.
impl BucketValue for i32 {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[0..4]);
        i32::from_le_bytes(bytes)
    }
}

/// Membership marker of a posting set. Only the key carries information.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PostingMarker;

impl BucketValue for PostingMarker {
    const SIZE: usize = 1;

    fn encode(&self, buf: &mut [u8]) {
        buf[0] = 1;
    }

    fn decode(_buf: &[u8]) -> Self {
        PostingMarker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_value() {
        let mut buf = [0u8; 4];
        (-3i32).encode(&mut buf);
        assert_eq!(i32::decode(&buf), -3);
    }

    #[test]
    fn test_posting_marker() {
        let mut buf = [0u8; 1];
        PostingMarker.encode(&mut buf);
        assert_eq!(buf[0], 1);
        assert_eq!(PostingMarker::decode(&buf), PostingMarker);
    }
}
