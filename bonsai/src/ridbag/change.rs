use crate::common::RecordRef;

/// A pending signed change of the occurrence count of one record.
///
/// The count stored in the tree is only known once the tree is read, so a
/// negative delta leaves the bag size undefined until it is recomputed.
#[derive(Clone, Debug)]
pub struct Change {
    record: RecordRef,
    delta: i32,
}

impl Change {
    pub fn new(record: RecordRef, delta: i32) -> Self {
        Change { record, delta }
    }

    /// The handle the change was first recorded with.
    pub fn record(&self) -> &RecordRef {
        &self.record
    }

    #[inline]
    pub fn delta(&self) -> i32 {
        self.delta
    }

    pub fn increment(&mut self) {
        self.delta += 1;
    }

    pub fn decrement(&mut self) {
        self.delta -= 1;
    }

    pub fn apply_diff(&mut self, diff: i32) {
        self.delta += diff;
    }

    /// `true` when the resulting count depends on the stored count.
    #[inline]
    pub fn is_undefined(&self) -> bool {
        self.delta < 0
    }

    /// Count obtained by applying this change to a stored `value`. Never negative.
    #[inline]
    pub fn apply_to(&self, value: i32) -> i32 {
        (value + self.delta).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RecordId;

    #[test]
    fn test_apply_to_clamps_at_zero() {
        let mut change = Change::new(RecordRef::new(RecordId::new(1, 1)), 2);
        assert_eq!(change.apply_to(0), 2);
        assert_eq!(change.apply_to(3), 5);

        change.apply_diff(-4);
        assert!(change.is_undefined());
        assert_eq!(change.apply_to(1), 0);
        assert_eq!(change.apply_to(5), 3);

        change.increment();
        change.increment();
        change.decrement();
        assert_eq!(change.delta(), -1);
    }
}
