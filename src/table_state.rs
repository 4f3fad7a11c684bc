use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, instrument};

use crate::clock::Timestamp;
use crate::descriptor::{DescriptorId, DescriptorVersion};
use crate::error::Error;
use crate::kv::Txn;
use crate::lease::{TableSet, TableVersionState};
use crate::manager::Inner;

/// Per-table lease state: the set of active version snapshots, the
/// single-flight slot for in-progress store acquisitions, and the dropped
/// flag. Created lazily on first reference and never evicted.
#[derive(Debug)]
pub(crate) struct TableState {
    pub(crate) id: DescriptorId,
    mu: Mutex<TableStateMu>,
}

#[derive(Debug, Default)]
struct TableStateMu {
    active: TableSet,
    /// Present while exactly one task performs a store acquisition for
    /// this table. Waiters subscribe and are woken when the sender drops.
    acquiring: Option<watch::Sender<()>>,
    dropped: bool,
}

impl TableState {
    pub(crate) fn new(id: DescriptorId) -> Self {
        Self {
            id,
            mu: Mutex::new(TableStateMu::default()),
        }
    }

    /// Returns a referenced lease entry for `version` (`None` = any),
    /// going to the store when nothing cached fits.
    ///
    /// The loop re-examines state after every store acquisition because
    /// coalesced waiters do not inherit the acquirer's result: the entry
    /// that fits this caller may already be present, or may still be
    /// missing when the in-flight acquisition was for something else.
    pub(crate) async fn acquire(
        &self,
        txn: &mut dyn Txn,
        version: Option<DescriptorVersion>,
        m: &Inner,
    ) -> Result<Arc<TableVersionState>, Error> {
        loop {
            let mu = self.mu.lock().await;
            if let Some(s) = mu.active.find_newest(version) {
                if self.check_lease(&mu, &s, version, m) {
                    return Ok(s);
                }
            } else if let (Some(requested), Some(newest)) = (version, mu.active.newest_version()) {
                if requested < newest {
                    return Err(Error::OldVersion {
                        id: self.id,
                        version: requested,
                    });
                }
            }

            if let Some(in_flight) = &mu.acquiring {
                let mut done = in_flight.subscribe();
                drop(mu);
                // Resolves with Err once the acquirer drops the sender.
                let _ = done.changed().await;
                continue;
            }
            self.acquire_from_store(mu, txn, version, None, m).await?;
        }
    }

    /// Lease-usability policy. A request for any version or for the
    /// newest version needs `min_lease_duration` of life left, so the
    /// caller's transaction does not outlive its descriptor. An explicit
    /// request for an older version bypasses the check: the transaction
    /// is already tied to that version, and renewing it would break the
    /// newest-only refresh discipline.
    fn check_lease(
        &self,
        mu: &TableStateMu,
        s: &Arc<TableVersionState>,
        version: Option<DescriptorVersion>,
        m: &Inner,
    ) -> bool {
        let wants_newest = version.is_none() || mu.active.newest_version() == version;
        if wants_newest {
            let now = m.store.clock.now();
            if !s.has_some_lifetime(now, m.min_lease_duration) {
                return false;
            }
        }
        s.try_ref()
    }

    /// Runs one store acquisition as the single flight for this table.
    ///
    /// Takes the lock by value, releases it for the network round trips,
    /// and reinstalls the result under the re-acquired lock. Waiters are
    /// woken (the sender drops) whether the acquisition succeeded or not;
    /// on failure the next waiter becomes the acquirer.
    async fn acquire_from_store(
        &self,
        mut mu: MutexGuard<'_, TableStateMu>,
        txn: &mut dyn Txn,
        min_version: Option<DescriptorVersion>,
        min_expiration: Option<Timestamp>,
        m: &Inner,
    ) -> Result<(), Error> {
        let (sender, _) = watch::channel(());
        mu.acquiring = Some(sender);
        drop(mu);

        let result = m
            .store
            .acquire(txn, self.id, min_version, min_expiration)
            .await;

        let mut mu = self.mu.lock().await;
        let _wake_waiters = mu.acquiring.take();
        let state = result?;
        self.upsert_locked(&mut mu, state, m);
        Ok(())
    }

    /// Installs a freshly acquired entry. A concurrent acquisition may
    /// have installed one at the same version already; the new entry
    /// subsumes it, taking over its refcount so outstanding holders keep
    /// balancing against the live entry.
    fn upsert_locked(&self, mu: &mut TableStateMu, state: Arc<TableVersionState>, m: &Inner) {
        if let Some(existing) = mu.active.find(state.version()) {
            state.absorb_refs_from(&existing);
            mu.active.remove(&existing);
            m.name_cache.remove(&existing);
        }
        mu.active.insert(Arc::clone(&state));
        m.name_cache.insert(&state);
    }

    /// Waits out any in-flight acquisition, then unconditionally runs a
    /// new one whose expiration is forced past the newest cached entry,
    /// guaranteeing the result is fresh and sorts last. Returns the new
    /// entry with a reference taken.
    pub(crate) async fn acquire_freshest_from_store(
        &self,
        txn: &mut dyn Txn,
        m: &Inner,
    ) -> Result<Arc<TableVersionState>, Error> {
        loop {
            let mu = self.mu.lock().await;
            if let Some(in_flight) = &mu.acquiring {
                let mut done = in_flight.subscribe();
                drop(mu);
                let _ = done.changed().await;
                continue;
            }
            let min_expiration = mu
                .active
                .find_newest(None)
                .map(|s| s.expiration().add(Duration::from_millis(1)));
            self.acquire_from_store(mu, txn, None, min_expiration, m)
                .await?;

            let mu = self.mu.lock().await;
            if let Some(s) = mu.active.find_newest(None) {
                if s.try_ref() {
                    return Ok(s);
                }
            }
            // Lost a race with a purge; go around again.
        }
    }

    /// Drops one reference to the entry at `state`'s version and removes
    /// the entry when warranted: when a knob forces it, the table is
    /// dropped, the manager is draining, or the entry stopped being the
    /// newest version.
    ///
    /// The durable delete runs as a supervised background task, except
    /// while draining, where it is awaited so shutdown can guarantee the
    /// node's rows are gone.
    pub(crate) async fn release(&self, state: Arc<TableVersionState>, m: &Arc<Inner>) {
        let removed = {
            let mut mu = self.mu.lock().await;
            // Lookup by version, not identity: a subsumed entry's holders
            // release against its replacement.
            let s = mu.active.find(state.version()).unwrap_or_else(|| {
                panic!(
                    "release of version {} of descriptor {}, which holds no lease",
                    state.version(),
                    self.id
                )
            });
            let remaining = s.unref();
            let remove_when_idle = m.store.knobs.remove_once_dereferenced
                || mu.dropped
                || m.is_draining()
                || mu.active.newest_version() != Some(s.version());
            if remaining == 0 && remove_when_idle && s.invalidate_if_unreferenced() {
                self.remove_locked(&mut mu, &s, m);
                Some(s)
            } else {
                None
            }
        };
        if let Some(s) = removed {
            Self::release_store_lease(s, m).await;
        }
    }

    fn remove_locked(&self, mu: &mut TableStateMu, s: &Arc<TableVersionState>, m: &Inner) {
        mu.active.remove(s);
        m.name_cache.remove(s);
        if let Some(hook) = &m.store.knobs.lease_released_event {
            hook(s.descriptor(), s.expiration());
        }
    }

    async fn release_store_lease(s: Arc<TableVersionState>, m: &Arc<Inner>) {
        if m.is_draining() {
            m.store.release(&m.stopper, &s).await;
            return;
        }
        let m2 = Arc::clone(m);
        if m.stopper
            .run_async_task(async move {
                m2.store.release(&m2.stopper, &s).await;
            })
            .is_err()
        {
            debug!("stopper quiescing; lease row will lapse at expiration");
        }
    }

    /// Invalidates and removes every entry nothing references, releasing
    /// their rows durably.
    pub(crate) async fn release_inactive(&self, m: &Arc<Inner>) {
        let removed = {
            let mut mu = self.mu.lock().await;
            let entries: Vec<_> = mu.active.iter().map(Arc::clone).collect();
            let mut removed = Vec::new();
            for s in entries {
                if s.invalidate_if_unreferenced() {
                    self.remove_locked(&mut mu, &s, m);
                    removed.push(s);
                }
            }
            removed
        };
        for s in removed {
            Self::release_store_lease(s, m).await;
        }
    }

    /// Reacts to a gossiped descriptor update.
    ///
    /// For a drop, marks the table and releases whatever is inactive;
    /// active holders release eagerly as they finish. Otherwise pins the
    /// gossiped version with a fresh acquisition so releasing the old
    /// inactive entries cannot empty the set, then unpins.
    #[instrument(skip_all, fields(id = %self.id, dropped, min_version = %min_version))]
    pub(crate) async fn purge_old_leases(
        &self,
        m: &Arc<Inner>,
        dropped: bool,
        min_version: DescriptorVersion,
    ) -> Result<(), Error> {
        {
            let mu = self.mu.lock().await;
            if mu.active.is_empty() {
                return Ok(());
            }
        }

        if dropped {
            self.mark_dropped(m).await;
            return Ok(());
        }

        let mut txn = m.store.db.begin().await?;
        let result = self.acquire(&mut *txn, Some(min_version), m).await;
        txn.commit().await?;
        match result {
            Ok(pin) => {
                self.release_inactive(m).await;
                self.release(pin, m).await;
                Ok(())
            }
            Err(Error::TableDropped) => {
                self.mark_dropped(m).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn mark_dropped(&self, m: &Arc<Inner>) {
        {
            let mut mu = self.mu.lock().await;
            mu.dropped = true;
        }
        self.release_inactive(m).await;
    }
}
