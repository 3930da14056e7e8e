use crate::common::{atomic, Atomic, Guarded};
use crate::errors::{BonsaiError, BonsaiResult, ErrorKind};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

pub const CLUSTER_ID_INVALID: i32 = -1;
pub const CLUSTER_POS_INVALID: i64 = -1;

/// Physical identity of a record: the cluster it lives in and its position
/// inside that cluster.
///
/// Ordering is by cluster id, then by position. This is the key order of
/// every bonsai tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    cluster_id: i32,
    cluster_position: i64,
}

impl RecordId {
    /// Size of a record id inside a bucket: cluster as `i16`, position as `i64`.
    pub const ENCODED_SIZE: usize = 2 + 8;

    pub const fn new(cluster_id: i32, cluster_position: i64) -> Self {
        RecordId {
            cluster_id,
            cluster_position,
        }
    }

    /// An identity that has not been assigned yet.
    pub const fn invalid() -> Self {
        RecordId::new(CLUSTER_ID_INVALID, CLUSTER_POS_INVALID)
    }

    /// A temporary identity handed out inside a unit of work before the record
    /// is saved. Temporary positions start at `-2`.
    pub const fn temporary(cluster_id: i32, sequence: i64) -> Self {
        RecordId::new(cluster_id, -2 - sequence)
    }

    #[inline]
    pub fn cluster_id(&self) -> i32 {
        self.cluster_id
    }

    #[inline]
    pub fn cluster_position(&self) -> i64 {
        self.cluster_position
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.cluster_position != CLUSTER_POS_INVALID
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.cluster_id > -1 && self.cluster_position > CLUSTER_POS_INVALID
    }

    #[inline]
    pub fn is_new(&self) -> bool {
        self.cluster_position < CLUSTER_POS_INVALID
    }

    /// Writes the bucket key form of this id into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ValidationError`] when the cluster id does not fit
    /// the two byte cluster field. Nothing is written in that case.
    pub fn encode_key(&self, buf: &mut [u8]) -> BonsaiResult<()> {
        let cluster = self.key_cluster()?;
        buf[0..2].copy_from_slice(&cluster.to_le_bytes());
        buf[2..10].copy_from_slice(&self.cluster_position.to_le_bytes());
        Ok(())
    }

    /// The cluster id as stored in the key form.
    pub fn key_cluster(&self) -> BonsaiResult<i16> {
        i16::try_from(self.cluster_id).map_err(|_| {
            log::error!("Cluster id of {} does not fit a bucket key", self);
            BonsaiError::new(
                &format!(
                    "Cluster id {} of {} is outside {}..={}",
                    self.cluster_id,
                    self,
                    i16::MIN,
                    i16::MAX
                ),
                ErrorKind::ValidationError,
            )
        })
    }

    /// Reads a key written by [`RecordId::encode_key`].
    pub fn decode_key(buf: &[u8]) -> Self {
        let mut cluster = [0u8; 2];
        cluster.copy_from_slice(&buf[0..2]);
        let mut position = [0u8; 8];
        position.copy_from_slice(&buf[2..10]);
        RecordId::new(
            i16::from_le_bytes(cluster) as i32,
            i64::from_le_bytes(position),
        )
    }
}

impl Default for RecordId {
    fn default() -> Self {
        RecordId::invalid()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.cluster_position)
    }
}

impl Debug for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.cluster_position)
    }
}

/// A shared handle to a record's identity.
///
/// All clones of a `RecordRef` share one identity cell, so saving the record
/// through any clone is visible through every other clone. Two handles refer
/// to the same record when [`RecordRef::same_record`] returns `true`; `==`
/// compares the current identities instead.
#[derive(Clone)]
pub struct RecordRef {
    identity: Atomic<RecordId>,
}

impl RecordRef {
    pub fn new(identity: RecordId) -> Self {
        RecordRef {
            identity: atomic(identity),
        }
    }

    /// A record that has not been saved yet.
    pub fn unsaved() -> Self {
        RecordRef::new(RecordId::invalid())
    }

    #[inline]
    pub fn identity(&self) -> RecordId {
        self.identity.read_with(|id| *id)
    }

    /// Assigns a new identity, typically right after the record was saved.
    pub fn set_identity(&self, identity: RecordId) {
        self.identity.write_with(|id| *id = identity);
    }

    /// Returns `true` when both handles point at the same identity cell.
    #[inline]
    pub fn same_record(&self, other: &RecordRef) -> bool {
        Arc::ptr_eq(&self.identity, &other.identity)
    }

    /// Address of the shared identity cell. Equal for two handles exactly
    /// when [`RecordRef::same_record`] holds, as long as both are alive.
    #[inline]
    pub(crate) fn handle_key(&self) -> usize {
        Arc::as_ptr(&self.identity) as *const () as usize
    }
}

impl PartialEq for RecordRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_record(other) || self.identity() == other.identity()
    }
}

impl Eq for RecordRef {}

impl From<RecordId> for RecordRef {
    fn from(value: RecordId) -> Self {
        RecordRef::new(value)
    }
}

impl Debug for RecordRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordRef({:?})", self.identity())
    }
}

/// Saves and loads records on behalf of the link collections.
///
/// Implemented by the document layer. A rid bag calls `save` to give an
/// unsaved record a persistent identity and `load` to materialize a record
/// when auto conversion is enabled.
pub trait RecordResolver: Send + Sync {
    /// Saves `record` and returns its persistent identity.
    fn save(&self, record: &RecordRef) -> BonsaiResult<RecordId>;

    /// Loads the record stored under `id`, if any.
    fn load(&self, id: &RecordId) -> BonsaiResult<Option<RecordRef>>;
}

/// Saves `record` through `resolver` and assigns the returned identity to it.
///
/// Fails with [`ErrorKind::UnresolvableRecord`] when the resolver does not
/// produce a persistent identity.
pub(crate) fn resolve_identity(
    resolver: &dyn RecordResolver,
    record: &RecordRef,
) -> BonsaiResult<RecordId> {
    let current = record.identity();
    if current.is_persistent() {
        return Ok(current);
    }

    let saved = resolver.save(record)?;
    if !saved.is_persistent() {
        return Err(BonsaiError::new(
            &format!("Record {} was saved without a persistent identity ({})", current, saved),
            ErrorKind::UnresolvableRecord,
        ));
    }
    record.set_identity(saved);
    Ok(saved)
}
