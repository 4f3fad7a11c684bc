use std::sync::Arc;

use crate::clock::Timestamp;
use crate::descriptor::TableDescriptor;
use crate::gossip::SystemConfig;

pub type DescriptorHook = Arc<dyn Fn(&TableDescriptor, Timestamp) + Send + Sync>;
pub type ConfigHook = Arc<dyn Fn(&SystemConfig) + Send + Sync>;

/// Test-only event hooks threaded through the manager. All default to
/// unset and cost nothing when unset.
#[derive(Clone, Default)]
pub struct TestingKnobs {
    /// Drop a cached lease entry as soon as its refcount reaches zero,
    /// instead of keeping it warm until it stops being the newest.
    pub remove_once_dereferenced: bool,

    /// Fired after a successful durable acquisition, with the descriptor
    /// snapshot and its expiration.
    pub lease_acquired_event: Option<DescriptorHook>,

    /// Fired after a lease entry has been removed from the local caches
    /// (before the durable delete completes).
    pub lease_released_event: Option<DescriptorHook>,

    /// Fired when the refresh worker receives a system-config update,
    /// before any purging.
    pub gossip_update_event: Option<ConfigHook>,

    /// Fired after the refresh worker has finished processing an update.
    pub leases_refreshed_event: Option<ConfigHook>,
}

impl std::fmt::Debug for TestingKnobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestingKnobs")
            .field("remove_once_dereferenced", &self.remove_once_dereferenced)
            .field("lease_acquired_event", &self.lease_acquired_event.is_some())
            .field("lease_released_event", &self.lease_released_event.is_some())
            .field("gossip_update_event", &self.gossip_update_event.is_some())
            .field(
                "leases_refreshed_event",
                &self.leases_refreshed_event.is_some(),
            )
            .finish()
    }
}
