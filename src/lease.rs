use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Timestamp;
use crate::descriptor::{DescriptorVersion, TableDescriptor};
use crate::kv::LeaseRow;
use crate::manager;

/// One leased `(descriptor, version)` snapshot with a concrete expiration.
///
/// The descriptor and expiration are immutable; the refcount and the
/// invalidation flag are guarded by their own mutex, the innermost lock in
/// the manager's lock order. Once `invalid` is set the entry is never
/// handed to another caller and its refcount only decreases.
#[derive(Debug)]
pub(crate) struct TableVersionState {
    descriptor: TableDescriptor,
    expiration: Timestamp,
    counts: Mutex<RefCounts>,
}

#[derive(Debug, Default)]
struct RefCounts {
    refcount: usize,
    invalid: bool,
}

impl TableVersionState {
    pub(crate) fn new(descriptor: TableDescriptor, expiration: Timestamp) -> Self {
        Self {
            descriptor,
            expiration,
            counts: Mutex::new(RefCounts::default()),
        }
    }

    pub(crate) fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub(crate) fn version(&self) -> DescriptorVersion {
        self.descriptor.version
    }

    pub(crate) fn expiration(&self) -> Timestamp {
        self.expiration
    }

    /// The persisted row this snapshot corresponds to.
    pub(crate) fn lease_row(&self, node_id: u32) -> LeaseRow {
        LeaseRow {
            descriptor_id: self.descriptor.id,
            version: self.descriptor.version,
            node_id,
            expiration_micros: self.expiration.as_micros(),
        }
    }

    /// Whether the lease still has at least `min` of life left.
    pub(crate) fn has_some_lifetime(&self, now: Timestamp, min: Duration) -> bool {
        self.expiration > now.add(min)
    }

    /// Takes a reference if the entry is still valid. Returns false for
    /// an invalidated entry, whose refcount must never grow again.
    pub(crate) fn try_ref(&self) -> bool {
        let mut counts = self.counts.lock().unwrap();
        if counts.invalid {
            return false;
        }
        counts.refcount += 1;
        true
    }

    /// Drops a reference, returning the remaining count.
    pub(crate) fn unref(&self) -> usize {
        let mut counts = self.counts.lock().unwrap();
        assert!(
            counts.refcount > 0,
            "release of lease with zero refcount: {:?}",
            self.descriptor
        );
        counts.refcount -= 1;
        counts.refcount
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self) -> usize {
        self.counts.lock().unwrap().refcount
    }

    #[cfg(test)]
    pub(crate) fn is_invalid(&self) -> bool {
        self.counts.lock().unwrap().invalid
    }

    /// Marks the entry invalid, monotonically.
    #[cfg(test)]
    pub(crate) fn invalidate(&self) {
        self.counts.lock().unwrap().invalid = true;
    }

    /// Invalidates the entry only if nothing references it, atomically
    /// with respect to [`TableVersionState::try_ref`]. Returns whether
    /// this call performed the invalidation; the winner owns the removal.
    pub(crate) fn invalidate_if_unreferenced(&self) -> bool {
        let mut counts = self.counts.lock().unwrap();
        if counts.refcount == 0 && !counts.invalid {
            counts.invalid = true;
            true
        } else {
            false
        }
    }

    /// Moves the refcount of `old` (being subsumed by `self`) over, so
    /// holders released by version keep balancing against the live entry.
    pub(crate) fn absorb_refs_from(&self, old: &TableVersionState) {
        let mut old_counts = old.counts.lock().unwrap();
        let mut counts = self.counts.lock().unwrap();
        counts.refcount += old_counts.refcount;
        old_counts.refcount = 0;
        old_counts.invalid = true;
    }
}

/// The active lease entries for one table, sorted by `(version,
/// expiration)`. Sets stay tiny; at most two versions are live at once.
#[derive(Debug, Default)]
pub(crate) struct TableSet {
    data: Vec<Arc<TableVersionState>>,
}

impl TableSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<TableVersionState>> {
        self.data.iter()
    }

    /// Inserts a new entry, keeping the sort order. A duplicate version
    /// means the single-flight discipline was violated upstream.
    pub(crate) fn insert(&mut self, state: Arc<TableVersionState>) {
        assert!(
            self.find(state.version()).is_none(),
            "duplicate lease inserted for version {} of descriptor {}",
            state.version(),
            state.descriptor().id
        );
        let key = (state.version(), state.expiration());
        let idx = self
            .data
            .partition_point(|s| (s.version(), s.expiration()) < key);
        self.data.insert(idx, state);
    }

    /// Removes an entry by identity. The entry must be present.
    pub(crate) fn remove(&mut self, state: &Arc<TableVersionState>) {
        let idx = self
            .data
            .iter()
            .position(|s| Arc::ptr_eq(s, state))
            .unwrap_or_else(|| {
                panic!(
                    "removal of lease not in the set: version {} of descriptor {}",
                    state.version(),
                    state.descriptor().id
                )
            });
        self.data.remove(idx);
    }

    /// Exact-version lookup.
    pub(crate) fn find(&self, version: DescriptorVersion) -> Option<Arc<TableVersionState>> {
        self.data
            .iter()
            .find(|s| s.version() == version)
            .map(Arc::clone)
    }

    /// With `None`, the newest entry overall; with `Some(v)`, the entry
    /// at exactly `v` with the latest expiration.
    pub(crate) fn find_newest(
        &self,
        version: Option<DescriptorVersion>,
    ) -> Option<Arc<TableVersionState>> {
        match version {
            None => self.data.last().map(Arc::clone),
            Some(v) => self
                .data
                .iter()
                .rev()
                .find(|s| s.version() == v)
                .map(Arc::clone),
        }
    }

    pub(crate) fn newest_version(&self) -> Option<DescriptorVersion> {
        self.data.last().map(|s| s.version())
    }
}

/// A held descriptor lease.
///
/// Grants read access to one immutable descriptor snapshot until released.
/// Release explicitly through [`crate::LeaseManager::release`]; dropping
/// the handle without releasing falls back to a spawned background
/// release.
pub struct Lease {
    state: Option<Arc<TableVersionState>>,
    manager: Arc<manager::Inner>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Lease");
        if let Some(state) = &self.state {
            dbg.field("id", &state.descriptor().id)
                .field("version", &state.version())
                .field("expiration", &state.expiration());
        }
        dbg.finish()
    }
}

impl Lease {
    pub(crate) fn new(state: Arc<TableVersionState>, manager: Arc<manager::Inner>) -> Self {
        Self {
            state: Some(state),
            manager,
        }
    }

    /// The leased descriptor snapshot.
    pub fn descriptor(&self) -> &TableDescriptor {
        self.state.as_ref().expect("released").descriptor()
    }

    /// When the lease stops being valid.
    pub fn expiration(&self) -> Timestamp {
        self.state.as_ref().expect("released").expiration()
    }

    pub(crate) fn take_state(mut self) -> Arc<TableVersionState> {
        self.state.take().expect("released")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            manager::Inner::release_from_drop(&self.manager, state);
        }
    }
}
