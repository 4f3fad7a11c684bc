use std::collections::BTreeMap;

use tokio::sync::watch;

use crate::descriptor::{DescriptorId, TableDescriptor};

/// Snapshot of the descriptor portion of the system configuration, as
/// broadcast after a schema change commits.
#[derive(Clone, Debug, Default)]
pub struct SystemConfig {
    descriptors: BTreeMap<DescriptorId, TableDescriptor>,
}

impl SystemConfig {
    pub fn new(descriptors: BTreeMap<DescriptorId, TableDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Iterates the table descriptors in the snapshot, id-ordered.
    pub fn table_descriptors(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.descriptors.values()
    }

    pub fn get(&self, id: DescriptorId) -> Option<&TableDescriptor> {
        self.descriptors.get(&id)
    }
}

/// In-process stand-in for the cluster gossip network, restricted to the
/// system-config channel the lease manager subscribes to.
#[derive(Clone, Debug)]
pub struct Gossip {
    config: watch::Sender<SystemConfig>,
}

impl Default for Gossip {
    fn default() -> Self {
        let (config, _) = watch::channel(SystemConfig::default());
        Self { config }
    }
}

impl Gossip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers for system-config updates. The receiver observes the
    /// latest snapshot plus a change notification per broadcast.
    pub fn register_system_config_channel(&self) -> watch::Receiver<SystemConfig> {
        self.config.subscribe()
    }

    /// The most recently broadcast snapshot.
    pub fn system_config(&self) -> SystemConfig {
        self.config.borrow().clone()
    }

    /// Broadcasts a new snapshot to all subscribers.
    pub fn broadcast(&self, config: SystemConfig) {
        // send_replace never fails even with no subscribers.
        self.config.send_replace(config);
    }
}
