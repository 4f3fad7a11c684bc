use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::knobs::TestingKnobs;
use crate::kv::Db;
use crate::manager::LeaseManager;
use crate::stopper::Stopper;
use crate::store::{LeaseStore, RetryOptions};

/// [`LeaseManager`] builder.
pub struct LeaseManagerBuilder {
    node_id: u32,
    lease_duration: Duration,
    min_lease_duration: Duration,
    retry: RetryOptions,
    knobs: TestingKnobs,
}

impl Default for LeaseManagerBuilder {
    fn default() -> Self {
        Self {
            node_id: 0,
            lease_duration: Duration::from_secs(5 * 60),
            min_lease_duration: Duration::from_secs(60),
            retry: RetryOptions::default(),
            knobs: TestingKnobs::default(),
        }
    }
}

impl LeaseManagerBuilder {
    /// Sets this node's id, stamped into every lease row it writes.
    /// **Must be non-zero**; zero never identifies a node and a row
    /// carrying it could not be traced back for cleanup.
    pub fn node_id(mut self, node_id: u32) -> Self {
        self.node_id = node_id;
        self
    }

    /// Sets how long an acquired lease lives. The actual expiration of
    /// each lease is jittered over `[0.75, 1.25]` of this value so the
    /// cluster's leases do not all lapse at once.
    ///
    /// Leases are not extended in place: a fresh lease at the same
    /// version replaces one that runs low, so this mostly bounds how
    /// long an unreachable node can pin an old schema version.
    ///
    /// Default 5 minutes.
    ///
    /// # Panics
    /// Panics if zero.
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        assert!(duration > Duration::ZERO, "must be greater than zero");
        self.lease_duration = duration;
        self
    }

    /// Sets the minimum remaining life a cached lease needs to be handed
    /// out for a newest-version request. Below this the manager goes back
    /// to the store for a fresh lease instead. This must be comfortably
    /// longer than a transaction, or descriptors could expire mid-use.
    ///
    /// Default 1 minute.
    pub fn min_lease_duration(mut self, duration: Duration) -> Self {
        self.min_lease_duration = duration;
        self
    }

    /// Overrides the backoff used for durable-release retries and the
    /// one-version wait.
    pub fn retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Installs test hooks. Unset hooks cost nothing.
    pub fn testing_knobs(mut self, knobs: TestingKnobs) -> Self {
        self.knobs = knobs;
        self
    }

    /// Builds the [`LeaseManager`].
    ///
    /// # Panics
    /// Panics if no node id was set, or if `min_lease_duration` does not
    /// fit under the shortest jittered lease duration (a lease would be
    /// unusable the moment it was acquired).
    pub fn build(self, db: Arc<dyn Db>, clock: Arc<Clock>, stopper: Stopper) -> LeaseManager {
        assert!(self.node_id != 0, "node id must be set and non-zero");
        // Jitter can shrink a lease to 0.75 × lease_duration; the minimum
        // usable life must fit under that or a fresh lease could be
        // refused the moment it was acquired.
        assert!(
            self.min_lease_duration < self.lease_duration.mul_f64(0.75),
            "min_lease_duration must be less than the shortest jittered lease_duration"
        );
        let store = LeaseStore {
            db,
            clock,
            node_id: self.node_id,
            lease_duration: self.lease_duration,
            retry: self.retry,
            knobs: self.knobs,
        };
        LeaseManager::new(store, stopper, self.min_lease_duration)
    }
}
