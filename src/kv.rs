use async_trait::async_trait;

use crate::clock::Timestamp;
use crate::descriptor::{DatabaseId, DescriptorId, DescriptorVersion, TableDescriptor};
use crate::error::Error;

/// One persisted lease assertion: node `node_id` holds `version` of
/// descriptor `descriptor_id` until `expiration`. The primary key of the
/// lease table is the full tuple, so duplicate rows cannot exist and
/// deletes are exact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseRow {
    pub descriptor_id: DescriptorId,
    pub version: DescriptorVersion,
    pub node_id: u32,
    pub expiration_micros: i64,
}

/// A structured entry for the schema-change event log, written in the
/// same transaction as the descriptor update that caused it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaEvent {
    pub descriptor_id: DescriptorId,
    pub kind: String,
    pub info: String,
}

/// A transaction against the descriptor store.
///
/// Reads observe the transaction's own buffered writes. Dropping a
/// transaction without calling [`Txn::commit`] aborts it.
#[async_trait]
pub trait Txn: Send {
    /// Reads the descriptor with the given id, if any.
    async fn get_descriptor(&mut self, id: DescriptorId) -> Result<Option<TableDescriptor>, Error>;

    /// Writes the descriptor under its id and maintains the name index.
    async fn put_descriptor(&mut self, desc: &TableDescriptor) -> Result<(), Error>;

    /// Resolves `(database, normalized name)` through the name index.
    async fn lookup_name(
        &mut self,
        parent: DatabaseId,
        normalized_name: &str,
    ) -> Result<Option<DescriptorId>, Error>;

    /// Appends to the schema-change event log.
    async fn log_event(&mut self, event: SchemaEvent) -> Result<(), Error>;

    /// Marks this transaction as mutating the system configuration, so a
    /// config notification is broadcast at commit. Implementations may
    /// require that no write precedes this call.
    fn set_system_config_trigger(&mut self);

    async fn commit(self: Box<Self>) -> Result<(), Error>;
}

/// The transactional KV store the lease machinery runs against.
///
/// The lease-table operations auto-commit in their own transactions; that
/// isolation is load-bearing. A lease row must outlive the caller's
/// transaction (which may abort), and an orphaned row is harmless where a
/// vanished one is not.
#[async_trait]
pub trait Db: Send + Sync + 'static {
    /// Opens a new transaction.
    async fn begin(&self) -> Result<Box<dyn Txn>, Error>;

    /// Non-transactional read of the current descriptor.
    async fn get_descriptor(&self, id: DescriptorId) -> Result<Option<TableDescriptor>, Error>;

    /// Inserts a lease row, auto-committed.
    async fn insert_lease(&self, row: &LeaseRow) -> Result<(), Error>;

    /// Deletes a lease row by its full key, auto-committed. Returns the
    /// number of rows affected (0 or 1).
    async fn delete_lease(&self, row: &LeaseRow) -> Result<u64, Error>;

    /// Counts lease rows for `(id, version)` whose expiration is after
    /// `now`, across all nodes.
    async fn count_leases(
        &self,
        id: DescriptorId,
        version: DescriptorVersion,
        now: Timestamp,
    ) -> Result<u64, Error>;
}
