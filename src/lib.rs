//! Per-node descriptor lease manager for online schema changes.
//!
//! Many nodes execute transactions against the same logical schema while
//! that schema evolves underneath them. Each node leases immutable,
//! versioned descriptor snapshots through a [`LeaseManager`]; publishing
//! a new version first waits until at most one older version has live
//! leases anywhere, so the cluster never sees more than two versions of
//! a table at once and schema changes can proceed stepwise without
//! blocking reads or writes.
//!
//! # Example
//! ```
//! # use std::{sync::Arc, time::Duration};
//! # async fn demo() -> Result<(), schema_lease::Error> {
//! use schema_lease::{
//!     Clock, Db, DescriptorId, Gossip, LeaseManager, MemDb, Stopper, TableDescriptor,
//! };
//!
//! let gossip = Gossip::new();
//! let db = Arc::new(MemDb::new(gossip.clone()));
//! let manager = LeaseManager::builder()
//!     .node_id(1)
//!     .lease_duration(Duration::from_secs(300))
//!     .min_lease_duration(Duration::from_secs(60))
//!     .build(db.clone(), Arc::new(Clock::new()), Stopper::new());
//! manager.start_refresh_leases(&gossip)?;
//!
//! let users = TableDescriptor::new(DescriptorId(51), DescriptorId(50), "users", Vec::new());
//! db.create_table(users)?;
//!
//! // Acquire a leased snapshot by name; concurrent acquisitions of the
//! // same table coalesce into a single store round trip.
//! let mut txn = db.begin().await?;
//! let lease = manager.acquire_by_name(&mut *txn, DescriptorId(50), "users").await?;
//! assert_eq!(lease.descriptor().name, "users");
//!
//! // Publishing bumps the version once no leases on older versions
//! // remain live anywhere in the cluster.
//! manager.release(lease).await;
//! manager
//!     .publish(DescriptorId(51), |desc| { desc.name = "people".into(); Ok(()) }, None)
//!     .await?;
//! # Ok(()) }
//! ```

mod builder;
mod clock;
mod descriptor;
mod error;
mod gossip;
mod knobs;
mod kv;
mod lease;
mod manager;
mod mem;
mod name_cache;
mod stopper;
mod store;
mod table_state;

pub use builder::LeaseManagerBuilder;
pub use clock::{Clock, Timestamp};
pub use descriptor::{
    normalize_name, ColumnDescriptor, DatabaseId, DescriptorId, DescriptorVersion, FormatVersion,
    TableDescriptor,
};
pub use error::Error;
pub use gossip::{Gossip, SystemConfig};
pub use knobs::{ConfigHook, DescriptorHook, TestingKnobs};
pub use kv::{Db, LeaseRow, SchemaEvent, Txn};
pub use lease::Lease;
pub use manager::LeaseManager;
pub use mem::{MemDb, MemTxn};
pub use stopper::Stopper;
pub use store::RetryOptions;
