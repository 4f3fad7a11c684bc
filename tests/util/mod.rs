#![allow(dead_code)] // shared between test binaries; not every helper is used in each

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use schema_lease::{
    Clock, ColumnDescriptor, Db, DescriptorId, Gossip, LeaseManager, LeaseManagerBuilder, MemDb,
    RetryOptions, Stopper, TableDescriptor,
};

/// Test wait timeout, generally long enough that something has probably
/// gone wrong.
pub const TEST_WAIT: Duration = Duration::from_secs(4);

/// Database all test tables live in.
pub const DB_ID: DescriptorId = DescriptorId(50);

/// The shared durable state of a simulated cluster.
pub fn shared_store() -> (Arc<MemDb>, Gossip) {
    let gossip = Gossip::new();
    let db = Arc::new(MemDb::new(gossip.clone()));
    (db, gossip)
}

/// One node's lease manager over the shared store, with its refresh
/// worker running.
pub struct Node {
    pub manager: LeaseManager,
    pub stopper: Stopper,
}

pub fn node(node_id: u32, db: &Arc<MemDb>, gossip: &Gossip) -> Node {
    node_with(node_id, db, Some(gossip), |b| b)
}

/// A node without a refresh worker, for tests that need cached state to
/// stay deliberately stale.
pub fn node_without_refresh(node_id: u32, db: &Arc<MemDb>) -> Node {
    node_with(node_id, db, None, |b| b)
}

pub fn node_with(
    node_id: u32,
    db: &Arc<MemDb>,
    gossip: Option<&Gossip>,
    configure: impl FnOnce(LeaseManagerBuilder) -> LeaseManagerBuilder,
) -> Node {
    let stopper = Stopper::new();
    let builder = LeaseManager::builder()
        .node_id(node_id)
        .retry_options(fast_retries());
    let store: Arc<dyn Db> = Arc::clone(db) as Arc<dyn Db>;
    let manager = configure(builder).build(store, Arc::new(Clock::new()), stopper.clone());
    if let Some(gossip) = gossip {
        manager.start_refresh_leases(gossip).unwrap();
    }
    Node { manager, stopper }
}

/// Backoffs short enough that waits resolve well inside [`TEST_WAIT`].
pub fn fast_retries() -> RetryOptions {
    RetryOptions {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        release_attempts: 5,
    }
}

/// A two-column table descriptor at version 1.
pub fn table(id: u64, name: &str) -> TableDescriptor {
    TableDescriptor::new(
        DescriptorId(id),
        DB_ID,
        name,
        vec![
            ColumnDescriptor {
                id: 1,
                name: "k".into(),
            },
            ColumnDescriptor {
                id: 2,
                name: "v".into(),
            },
        ],
    )
}
