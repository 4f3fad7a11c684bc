use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::builder::LeaseManagerBuilder;
use crate::descriptor::{normalize_name, DatabaseId, DescriptorId, DescriptorVersion, TableDescriptor};
use crate::error::Error;
use crate::gossip::{Gossip, SystemConfig};
use crate::kv::{SchemaEvent, Txn};
use crate::lease::{Lease, TableVersionState};
use crate::name_cache::TableNameCache;
use crate::stopper::Stopper;
use crate::store::LeaseStore;
use crate::table_state::TableState;

/// Hands out leased descriptor snapshots to SQL execution.
///
/// Every node runs one manager. It caches lease entries per table,
/// coalesces concurrent store acquisitions, keeps a by-name cache, and
/// refreshes its caches from gossiped system-config updates. Cloning is
/// cheap and clones share all state.
#[derive(Clone)]
pub struct LeaseManager {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) store: LeaseStore,
    pub(crate) stopper: Stopper,
    pub(crate) name_cache: TableNameCache,
    pub(crate) min_lease_duration: Duration,
    tables: Mutex<HashMap<DescriptorId, Arc<TableState>>>,
    draining: AtomicBool,
}

impl LeaseManager {
    /// Returns a new [`LeaseManager`] builder.
    pub fn builder() -> LeaseManagerBuilder {
        <_>::default()
    }

    pub(crate) fn new(store: LeaseStore, stopper: Stopper, min_lease_duration: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                stopper,
                name_cache: TableNameCache::default(),
                min_lease_duration,
                tables: Mutex::new(HashMap::new()),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Acquires a lease on descriptor `id`.
    ///
    /// With `version: None` any sufficiently fresh version is returned,
    /// preferring the newest known. With an explicit version, the exact
    /// version is returned if it is still live; requesting a version
    /// older than the newest known fails with [`Error::OldVersion`].
    #[instrument(skip_all, fields(id = %id))]
    pub async fn acquire(
        &self,
        txn: &mut dyn Txn,
        id: DescriptorId,
        version: Option<DescriptorVersion>,
    ) -> Result<Lease, Error> {
        if self.inner.is_draining() {
            return Err(Error::Draining);
        }
        let table = self.inner.table_state(id, true).expect("created");
        let state = table.acquire(txn, version, &self.inner).await?;
        Ok(Lease::new(state, Arc::clone(&self.inner)))
    }

    /// Acquires a lease on the newest version of the table named `name`
    /// in database `db_id`.
    ///
    /// A cached by-name hit may be stale in the middle of a rename: the
    /// id resolved from the name index can point at a descriptor that no
    /// longer carries this name. In that case the cached lease is
    /// released, a fresh store acquisition (bypassing any in-flight one)
    /// re-reads the descriptor, and the name is checked once more;
    /// a second mismatch reports the table as undefined rather than
    /// guessing.
    #[instrument(skip_all, fields(db = %db_id, name))]
    pub async fn acquire_by_name(
        &self,
        txn: &mut dyn Txn,
        db_id: DatabaseId,
        name: &str,
    ) -> Result<Lease, Error> {
        if self.inner.is_draining() {
            return Err(Error::Draining);
        }
        let normalized = normalize_name(name);

        let now = self.inner.store.clock.now();
        if let Some(state) =
            self.inner
                .name_cache
                .get(db_id, &normalized, now, self.inner.min_lease_duration)
        {
            return Ok(Lease::new(state, Arc::clone(&self.inner)));
        }

        let id = txn
            .lookup_name(db_id, &normalized)
            .await?
            .ok_or_else(|| Error::UndefinedTable(name.to_string()))?;

        let lease = self.acquire(txn, id, None).await?;
        if descriptor_matches(lease.descriptor(), db_id, &normalized) {
            return Ok(lease);
        }

        // Rename race: the lease points at a descriptor that no longer
        // carries the requested name. Force a fresh round trip and
        // re-check.
        debug!(%id, "descriptor name mismatch; refreshing from store");
        self.release(lease).await;
        let table = self.inner.table_state(id, true).expect("created");
        let state = table.acquire_freshest_from_store(txn, &self.inner).await?;
        let lease = Lease::new(state, Arc::clone(&self.inner));
        if descriptor_matches(lease.descriptor(), db_id, &normalized) {
            return Ok(lease);
        }
        self.release(lease).await;
        Err(Error::UndefinedTable(name.to_string()))
    }

    /// Releases a held lease.
    ///
    /// The refcount drops immediately; whether the entry leaves the cache
    /// and its row is deleted follows the removal policy. While draining,
    /// the durable delete is awaited.
    #[instrument(skip_all, fields(id = %lease.descriptor().id, version = %lease.descriptor().version))]
    pub async fn release(&self, lease: Lease) {
        let state = lease.take_state();
        Inner::release_state(&self.inner, state).await;
    }

    /// Moves the manager in or out of draining.
    ///
    /// While draining, new acquisitions fail with [`Error::Draining`],
    /// inactive lease entries are released durably before this returns,
    /// and active entries are released as their holders finish.
    pub async fn set_draining(&self, drain: bool) {
        self.inner.draining.store(drain, Ordering::SeqCst);
        if !drain {
            return;
        }
        for table in self.inner.all_tables() {
            table.release_inactive(&self.inner).await;
        }
    }

    /// Starts the background worker that refreshes leases off gossiped
    /// system-config updates. Returns [`Error::Stopped`] if the stopper
    /// is already quiescing.
    pub fn start_refresh_leases(&self, gossip: &Gossip) -> Result<(), Error> {
        let inner = Arc::clone(&self.inner);
        let mut updates = gossip.register_system_config_channel();
        let stopper = self.inner.stopper.clone();
        self.inner.stopper.run_async_task(async move {
            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let config = updates.borrow_and_update().clone();
                        Inner::refresh_leases(&inner, &config).await;
                    }
                    _ = stopper.should_quiesce() => return,
                }
            }
        })
    }

    /// Installs the next version of descriptor `id`; see
    /// [`LeaseStore::publish`] semantics in the crate docs. `update`
    /// mutates the descriptor in place and must not touch its version.
    pub async fn publish<F>(
        &self,
        id: DescriptorId,
        mut update: F,
        event: Option<SchemaEvent>,
    ) -> Result<TableDescriptor, Error>
    where
        F: FnMut(&mut TableDescriptor) -> Result<(), Error> + Send,
    {
        self.inner
            .store
            .publish(&self.inner.stopper, id, &mut update, event)
            .await
    }

    /// Blocks until at most one version of descriptor `id` has live
    /// leases anywhere in the cluster, then returns that version.
    pub async fn wait_for_one_version(&self, id: DescriptorId) -> Result<DescriptorVersion, Error> {
        self.inner
            .store
            .wait_for_one_version(&self.inner.stopper, id)
            .await
    }
}

fn descriptor_matches(desc: &TableDescriptor, db_id: DatabaseId, normalized_name: &str) -> bool {
    desc.parent_id == db_id && normalize_name(&desc.name) == normalized_name
}

impl Inner {
    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn table_state(&self, id: DescriptorId, create: bool) -> Option<Arc<TableState>> {
        let mut tables = self.tables.lock().unwrap();
        match tables.get(&id) {
            Some(table) => Some(Arc::clone(table)),
            None if create => {
                let table = Arc::new(TableState::new(id));
                tables.insert(id, Arc::clone(&table));
                Some(table)
            }
            None => None,
        }
    }

    fn all_tables(&self) -> Vec<Arc<TableState>> {
        self.tables.lock().unwrap().values().map(Arc::clone).collect()
    }

    pub(crate) async fn release_state(this: &Arc<Self>, state: Arc<TableVersionState>) {
        let id = state.descriptor().id;
        let table = this
            .table_state(id, false)
            .unwrap_or_else(|| panic!("no table state for descriptor {id} on release"));
        table.release(state, this).await;
    }

    /// Fallback for a [`Lease`] dropped without an explicit release.
    pub(crate) fn release_from_drop(this: &Arc<Self>, state: Arc<TableVersionState>) {
        let inner = Arc::clone(this);
        if this
            .stopper
            .run_async_task(async move {
                Inner::release_state(&inner, state).await;
            })
            .is_err()
        {
            warn!("lease dropped during shutdown; row will lapse at expiration");
        }
    }

    /// Processes one gossiped system-config snapshot: decode and validate
    /// each table descriptor, and for every table this node has local
    /// state for, purge old versions (prefetching the new one) or start
    /// tearing it down if it was dropped.
    async fn refresh_leases(this: &Arc<Self>, config: &SystemConfig) {
        if let Some(hook) = &this.store.knobs.gossip_update_event {
            hook(config);
        }
        for desc in config.table_descriptors() {
            let mut desc = desc.clone();
            desc.maybe_upgrade_format_version();
            if let Err(err) = desc.validate() {
                warn!(id = %desc.id, %err, "ignoring invalid gossiped descriptor");
                continue;
            }
            let Some(table) = this.table_state(desc.id, false) else {
                continue;
            };
            debug!(
                id = %desc.id,
                version = %desc.version,
                dropped = desc.dropped,
                "refreshing leases from gossip"
            );
            if let Err(err) = table.purge_old_leases(this, desc.dropped, desc.version).await {
                warn!(id = %desc.id, %err, "error purging old leases");
            }
        }
        if let Some(hook) = &this.store.knobs.leases_refreshed_event {
            hook(config);
        }
    }
}
