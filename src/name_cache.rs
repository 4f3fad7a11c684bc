use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Timestamp;
use crate::descriptor::{normalize_name, DatabaseId};
use crate::lease::TableVersionState;

/// Maps `(database, normalized table name)` to the newest known lease
/// entry carrying that name.
///
/// The cache holds weak-by-convention references: the table set owns each
/// entry, and removal here is a cleanup step of the owner's removal. A
/// stale pointer is therefore possible and every hit is re-validated.
#[derive(Debug, Default)]
pub(crate) struct TableNameCache {
    tables: Mutex<HashMap<(DatabaseId, String), Arc<TableVersionState>>>,
}

impl TableNameCache {
    /// Returns the cached entry with a reference already taken, or `None`
    /// when the name is unknown, the entry has been invalidated, or it no
    /// longer has `min_lifetime` of validity left.
    pub(crate) fn get(
        &self,
        parent: DatabaseId,
        normalized_name: &str,
        now: Timestamp,
        min_lifetime: Duration,
    ) -> Option<Arc<TableVersionState>> {
        let tables = self.tables.lock().unwrap();
        let state = tables.get(&(parent, normalized_name.to_string()))?;
        if !state.has_some_lifetime(now, min_lifetime) {
            return None;
        }
        // try_ref refuses invalidated entries.
        if !state.try_ref() {
            return None;
        }
        Some(Arc::clone(state))
    }

    /// Caches `state` under its descriptor's name, keeping whichever of
    /// the old and new entries has the higher `(version, expiration)`.
    pub(crate) fn insert(&self, state: &Arc<TableVersionState>) {
        let mut tables = self.tables.lock().unwrap();
        let key = Self::key(state);
        match tables.get(&key) {
            Some(existing)
                if (existing.version(), existing.expiration())
                    >= (state.version(), state.expiration()) => {}
            _ => {
                tables.insert(key, Arc::clone(state));
            }
        }
    }

    /// Drops the mapping only if it still points at exactly `state`; a
    /// newer entry may have replaced it already.
    pub(crate) fn remove(&self, state: &Arc<TableVersionState>) {
        let mut tables = self.tables.lock().unwrap();
        let key = Self::key(state);
        if let Some(existing) = tables.get(&key) {
            if Arc::ptr_eq(existing, state) {
                tables.remove(&key);
            }
        }
    }

    fn key(state: &Arc<TableVersionState>) -> (DatabaseId, String) {
        let desc = state.descriptor();
        (desc.parent_id, normalize_name(&desc.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorId, DescriptorVersion, TableDescriptor};

    const MINUTE: Duration = Duration::from_secs(60);

    fn state(name: &str, version: u64, expiration_micros: i64) -> Arc<TableVersionState> {
        let mut desc = TableDescriptor::new(DescriptorId(51), DescriptorId(50), name, Vec::new());
        desc.version = DescriptorVersion(version);
        Arc::new(TableVersionState::new(
            desc,
            Timestamp::from_micros(expiration_micros),
        ))
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let cache = TableNameCache::default();
        let s = state("Users", 1, 300_000_000);
        cache.insert(&s);
        let hit = cache
            .get(DescriptorId(50), &normalize_name("USERS"), Timestamp::ZERO, MINUTE)
            .expect("cache miss");
        assert!(Arc::ptr_eq(&hit, &s));
        assert_eq!(s.refcount(), 1);
    }

    #[test]
    fn misses_on_short_lifetime_or_invalid() {
        let cache = TableNameCache::default();
        // Expires at t=200s.
        let s = state("users", 1, 200_000_000);
        cache.insert(&s);

        // 50s of life left but a minute required.
        let now = Timestamp::from_micros(150_000_000);
        assert!(cache
            .get(DescriptorId(50), "users", now, MINUTE)
            .is_none());

        s.invalidate();
        assert!(cache
            .get(DescriptorId(50), "users", Timestamp::ZERO, MINUTE)
            .is_none());
    }

    #[test]
    fn insert_keeps_newest() {
        let cache = TableNameCache::default();
        let newer = state("users", 2, 300_000_000);
        let older = state("users", 1, 400_000_000);
        cache.insert(&newer);
        cache.insert(&older);
        let hit = cache
            .get(DescriptorId(50), "users", Timestamp::ZERO, MINUTE)
            .unwrap();
        assert!(Arc::ptr_eq(&hit, &newer));
    }

    #[test]
    fn remove_ignores_replaced_pointer() {
        let cache = TableNameCache::default();
        let old = state("users", 1, 300_000_000);
        let new = state("users", 2, 300_000_000);
        cache.insert(&old);
        cache.insert(&new);
        // Removing the replaced entry must not evict the newer one.
        cache.remove(&old);
        assert!(cache
            .get(DescriptorId(50), "users", Timestamp::ZERO, MINUTE)
            .is_some());
        cache.remove(&new);
        assert!(cache
            .get(DescriptorId(50), "users", Timestamp::ZERO, MINUTE)
            .is_none());
    }
}
