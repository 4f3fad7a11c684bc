use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;

use crate::clock::Timestamp;
use crate::descriptor::{normalize_name, DatabaseId, DescriptorId, DescriptorVersion, TableDescriptor};
use crate::error::Error;
use crate::gossip::{Gossip, SystemConfig};
use crate::kv::{Db, LeaseRow, SchemaEvent, Txn};

/// Serializable in-memory [`Db`].
///
/// Holds the descriptor table, the name index, the lease table and the
/// event log behind one mutex, and broadcasts a fresh [`SystemConfig`]
/// through the attached [`Gossip`] whenever a commit wrote descriptors.
/// This is the backend the crate's own test suite runs against; it also
/// works for single-process embedding.
#[derive(Clone, Debug)]
pub struct MemDb {
    state: Arc<Mutex<MemState>>,
    gossip: Gossip,
}

#[derive(Debug, Default)]
struct MemState {
    descriptors: BTreeMap<DescriptorId, TableDescriptor>,
    names: BTreeMap<(DatabaseId, String), DescriptorId>,
    leases: BTreeSet<LeaseRow>,
    events: Vec<SchemaEvent>,
    lease_inserts: u64,
}

impl MemDb {
    pub fn new(gossip: Gossip) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState::default())),
            gossip,
        }
    }

    pub fn gossip(&self) -> &Gossip {
        &self.gossip
    }

    /// Creates a table outside any transaction, broadcasting the
    /// resulting config. Bootstrap helper for tests and embedders.
    pub fn create_table(&self, desc: TableDescriptor) -> Result<(), Error> {
        desc.validate()?;
        let config = {
            let mut state = self.state.lock().unwrap();
            if state.descriptors.contains_key(&desc.id) {
                return Err(anyhow!("descriptor {} already exists", desc.id).into());
            }
            let key = (desc.parent_id, normalize_name(&desc.name));
            if state.names.contains_key(&key) {
                return Err(anyhow!("table name {:?} already in use", desc.name).into());
            }
            state.names.insert(key, desc.id);
            state.descriptors.insert(desc.id, desc);
            state.config()
        };
        self.gossip.broadcast(config);
        Ok(())
    }

    /// Current lease rows, key-ordered.
    pub fn lease_rows(&self) -> Vec<LeaseRow> {
        self.state.lock().unwrap().leases.iter().copied().collect()
    }

    /// Total lease-row inserts ever performed.
    pub fn lease_insert_count(&self) -> u64 {
        self.state.lock().unwrap().lease_inserts
    }

    pub fn descriptor(&self, id: DescriptorId) -> Option<TableDescriptor> {
        self.state.lock().unwrap().descriptors.get(&id).cloned()
    }

    pub fn events(&self) -> Vec<SchemaEvent> {
        self.state.lock().unwrap().events.clone()
    }
}

impl MemState {
    fn config(&self) -> SystemConfig {
        SystemConfig::new(self.descriptors.clone())
    }
}

#[async_trait]
impl Db for MemDb {
    async fn begin(&self) -> Result<Box<dyn Txn>, Error> {
        Ok(Box::new(MemTxn {
            db: self.clone(),
            desc_writes: BTreeMap::new(),
            events: Vec::new(),
            trigger: false,
        }))
    }

    async fn get_descriptor(&self, id: DescriptorId) -> Result<Option<TableDescriptor>, Error> {
        Ok(self.descriptor(id))
    }

    async fn insert_lease(&self, row: &LeaseRow) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.leases.insert(*row) {
            return Err(anyhow!("duplicate lease row {row:?}").into());
        }
        state.lease_inserts += 1;
        Ok(())
    }

    async fn delete_lease(&self, row: &LeaseRow) -> Result<u64, Error> {
        let mut state = self.state.lock().unwrap();
        Ok(u64::from(state.leases.remove(row)))
    }

    async fn count_leases(
        &self,
        id: DescriptorId,
        version: DescriptorVersion,
        now: Timestamp,
    ) -> Result<u64, Error> {
        let state = self.state.lock().unwrap();
        let now_micros = now.as_micros();
        Ok(state
            .leases
            .iter()
            .filter(|row| {
                row.descriptor_id == id
                    && row.version == version
                    && row.expiration_micros > now_micros
            })
            .count() as u64)
    }
}

/// A buffered-write transaction over [`MemDb`]. Reads observe the
/// transaction's own writes; dropping without commit aborts.
#[derive(Debug)]
pub struct MemTxn {
    db: MemDb,
    desc_writes: BTreeMap<DescriptorId, TableDescriptor>,
    events: Vec<SchemaEvent>,
    trigger: bool,
}

#[async_trait]
impl Txn for MemTxn {
    async fn get_descriptor(&mut self, id: DescriptorId) -> Result<Option<TableDescriptor>, Error> {
        if let Some(desc) = self.desc_writes.get(&id) {
            return Ok(Some(desc.clone()));
        }
        Ok(self.db.descriptor(id))
    }

    async fn put_descriptor(&mut self, desc: &TableDescriptor) -> Result<(), Error> {
        self.desc_writes.insert(desc.id, desc.clone());
        Ok(())
    }

    async fn lookup_name(
        &mut self,
        parent: DatabaseId,
        normalized_name: &str,
    ) -> Result<Option<DescriptorId>, Error> {
        for desc in self.desc_writes.values() {
            if desc.parent_id == parent && normalize_name(&desc.name) == normalized_name {
                return Ok(Some(desc.id));
            }
        }
        let state = self.db.state.lock().unwrap();
        Ok(state
            .names
            .get(&(parent, normalized_name.to_string()))
            .copied())
    }

    async fn log_event(&mut self, event: SchemaEvent) -> Result<(), Error> {
        self.events.push(event);
        Ok(())
    }

    fn set_system_config_trigger(&mut self) {
        assert!(
            self.desc_writes.is_empty() && self.events.is_empty(),
            "system-config trigger must be set before the first write"
        );
        self.trigger = true;
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        let MemTxn {
            db,
            desc_writes,
            events,
            trigger,
        } = *self;
        let announce = trigger || !desc_writes.is_empty();
        let config = {
            let mut state = db.state.lock().unwrap();
            for desc in desc_writes.into_values() {
                // Maintain the name index. The entry under an old name is
                // left in place (a schema changer retires it later, which
                // is out of scope here); resolving through it reaches a
                // descriptor that no longer carries the name, and the
                // manager's re-check path turns that into "undefined".
                if !desc.dropped {
                    state
                        .names
                        .insert((desc.parent_id, normalize_name(&desc.name)), desc.id);
                }
                state.descriptors.insert(desc.id, desc);
            }
            state.events.extend(events);
            announce.then(|| state.config())
        };
        if let Some(config) = config {
            db.gossip.broadcast(config);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ColumnDescriptor;

    fn table(id: u64, name: &str) -> TableDescriptor {
        TableDescriptor::new(
            DescriptorId(id),
            DescriptorId(50),
            name,
            vec![ColumnDescriptor {
                id: 1,
                name: "k".into(),
            }],
        )
    }

    #[tokio::test]
    async fn txn_reads_its_own_writes() {
        let db = MemDb::new(Gossip::new());
        let mut txn = db.begin().await.unwrap();
        txn.put_descriptor(&table(51, "kv")).await.unwrap();
        let read = txn.get_descriptor(DescriptorId(51)).await.unwrap();
        assert_eq!(read.unwrap().name, "kv");
        // Not visible outside before commit.
        assert!(db.descriptor(DescriptorId(51)).is_none());
        txn.commit().await.unwrap();
        assert!(db.descriptor(DescriptorId(51)).is_some());
    }

    #[tokio::test]
    async fn abort_discards_writes() {
        let db = MemDb::new(Gossip::new());
        let mut txn = db.begin().await.unwrap();
        txn.put_descriptor(&table(51, "kv")).await.unwrap();
        drop(txn);
        assert!(db.descriptor(DescriptorId(51)).is_none());
    }

    #[tokio::test]
    async fn rename_adds_new_mapping_and_leaves_old() {
        let db = MemDb::new(Gossip::new());
        db.create_table(table(51, "old")).unwrap();

        let mut txn = db.begin().await.unwrap();
        let mut desc = txn.get_descriptor(DescriptorId(51)).await.unwrap().unwrap();
        desc.name = "new".into();
        txn.put_descriptor(&desc).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        assert_eq!(
            txn.lookup_name(DescriptorId(50), "new").await.unwrap(),
            Some(DescriptorId(51))
        );
        // The old mapping dangles until retired out of band; resolving
        // through it reaches a descriptor named "new".
        assert_eq!(
            txn.lookup_name(DescriptorId(50), "old").await.unwrap(),
            Some(DescriptorId(51))
        );
    }

    #[tokio::test]
    async fn commit_with_descriptor_writes_gossips() {
        let gossip = Gossip::new();
        let mut rx = gossip.register_system_config_channel();
        let db = MemDb::new(gossip);
        rx.borrow_and_update();

        db.create_table(table(51, "kv")).unwrap();
        assert!(rx.has_changed().unwrap());
        let config = rx.borrow_and_update().clone();
        assert_eq!(config.get(DescriptorId(51)).unwrap().name, "kv");
    }

    #[tokio::test]
    async fn lease_rows_are_keyed_by_full_tuple() {
        let db = MemDb::new(Gossip::new());
        let row = LeaseRow {
            descriptor_id: DescriptorId(51),
            version: DescriptorVersion(1),
            node_id: 1,
            expiration_micros: 1_000,
        };
        db.insert_lease(&row).await.unwrap();
        assert!(db.insert_lease(&row).await.is_err());
        // Same key except expiration is a distinct row.
        let row2 = LeaseRow {
            expiration_micros: 2_000,
            ..row
        };
        db.insert_lease(&row2).await.unwrap();

        assert_eq!(db.delete_lease(&row).await.unwrap(), 1);
        assert_eq!(db.delete_lease(&row).await.unwrap(), 0);
        assert_eq!(
            db.count_leases(DescriptorId(51), DescriptorVersion(1), Timestamp::from_micros(1_500))
                .await
                .unwrap(),
            1
        );
    }
}
