use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, instrument, warn};

use crate::clock::{Clock, Timestamp};
use crate::descriptor::{DescriptorId, DescriptorVersion, TableDescriptor};
use crate::error::Error;
use crate::knobs::TestingKnobs;
use crate::kv::{Db, SchemaEvent, Txn};
use crate::lease::TableVersionState;
use crate::stopper::Stopper;

/// Backoff configuration for the durable-release retry loop and the
/// one-version wait.
#[derive(Clone, Debug)]
pub struct RetryOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts before a durable release is abandoned.
    pub release_attempts: usize,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            release_attempts: 5,
        }
    }
}

impl RetryOptions {
    /// Doubling backoff with jitter, capped at `max_backoff`. Endless;
    /// bound with `take` where attempts are limited.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.initial_backoff.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_backoff)
            .map(jitter)
    }
}

/// Stateless façade over the KV store for the durable half of leasing:
/// lease-row insert/delete, the one-version wait, and coordinated
/// publication of new descriptor versions.
pub(crate) struct LeaseStore {
    pub(crate) db: Arc<dyn Db>,
    pub(crate) clock: Arc<Clock>,
    pub(crate) node_id: u32,
    pub(crate) lease_duration: Duration,
    pub(crate) retry: RetryOptions,
    pub(crate) knobs: TestingKnobs,
}

impl LeaseStore {
    /// Spreads expirations over `[0.75, 1.25] × lease_duration` so leases
    /// taken together do not all lapse together.
    fn jittered_lease_duration(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0.75..1.25);
        self.lease_duration.mul_f64(factor)
    }

    /// Acquires a lease on the current version of descriptor `id`.
    ///
    /// The descriptor is read under the caller's transaction so that
    /// descriptors created inside it are visible. The lease row itself is
    /// written through an auto-committed separate transaction: the
    /// caller's transaction may abort, and the in-memory cache cannot
    /// tolerate a lease that has vanished. An orphaned row is harmless
    /// and lapses at its expiration.
    #[instrument(skip_all, fields(id = %id))]
    pub(crate) async fn acquire(
        &self,
        txn: &mut dyn Txn,
        id: DescriptorId,
        min_version: Option<DescriptorVersion>,
        min_expiration: Option<Timestamp>,
    ) -> Result<Arc<TableVersionState>, Error> {
        let mut expiration = self
            .clock
            .now()
            .add(self.jittered_lease_duration())
            .round_to_micros();
        if let Some(min) = min_expiration {
            if min > expiration {
                expiration = min;
            }
        }

        let mut desc = txn
            .get_descriptor(id)
            .await?
            .ok_or(Error::DescriptorNotFound(id))?;
        if desc.dropped {
            return Err(Error::TableDropped);
        }
        desc.maybe_upgrade_format_version();
        desc.validate()?;
        if let Some(min_version) = min_version {
            if desc.version < min_version {
                return Err(Error::VersionNotFound {
                    id,
                    version: min_version,
                });
            }
        }

        let state = Arc::new(TableVersionState::new(desc, expiration));
        self.db.insert_lease(&state.lease_row(self.node_id)).await?;
        debug!(version = %state.version(), expiration = %expiration, "lease acquired");
        if let Some(hook) = &self.knobs.lease_acquired_event {
            hook(state.descriptor(), expiration);
        }
        Ok(state)
    }

    /// Durably deletes the lease row for `state`, retrying with backoff.
    ///
    /// The first attempt must affect exactly one row; later attempts
    /// tolerate zero, since an earlier attempt may have deleted the row
    /// and then lost its reply. Abandons the work once the stopper is
    /// quiescing. Failures are logged, not surfaced; the row lapses at
    /// its expiration regardless.
    #[instrument(skip_all, fields(id = %state.descriptor().id, version = %state.version()))]
    pub(crate) async fn release(&self, stopper: &Stopper, state: &TableVersionState) {
        let row = state.lease_row(self.node_id);
        let mut first_attempt = true;
        let mut backoff = self.retry.backoff().take(self.retry.release_attempts);
        loop {
            match self.db.delete_lease(&row).await {
                Ok(1) => return,
                Ok(0) if !first_attempt => return,
                Ok(n) => {
                    warn!(rows = n, "unexpected row count deleting lease");
                }
                Err(err) => {
                    warn!(%err, "error deleting lease");
                }
            }
            first_attempt = false;
            let Some(delay) = backoff.next() else {
                warn!("giving up on lease delete; row will lapse at expiration");
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopper.should_quiesce() => return,
            }
        }
    }

    pub(crate) async fn count_leases(
        &self,
        id: DescriptorId,
        version: DescriptorVersion,
        now: Timestamp,
    ) -> Result<u64, Error> {
        self.db.count_leases(id, version, now).await
    }

    /// Blocks until every lease on a version older than the current one
    /// has expired or been deleted cluster-wide, then returns the current
    /// version. From that point a new version may be installed without a
    /// third version ever being live.
    pub(crate) async fn wait_for_one_version(
        &self,
        stopper: &Stopper,
        id: DescriptorId,
    ) -> Result<DescriptorVersion, Error> {
        let mut backoff = self.retry.backoff();
        loop {
            let desc = self
                .db
                .get_descriptor(id)
                .await?
                .ok_or(Error::DescriptorNotFound(id))?;
            let now = self.clock.now();
            let count = self.count_leases(id, desc.version.prev(), now).await?;
            if count == 0 {
                return Ok(desc.version);
            }
            debug!(
                id = %id,
                version = %desc.version,
                outstanding = count,
                "waiting for old-version leases to drain"
            );
            let delay = backoff.next().expect("endless backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopper.should_quiesce() => return Err(Error::Stopped),
            }
        }
    }

    /// Installs the next version of descriptor `id`.
    ///
    /// `update` mutates the descriptor in place and must leave its
    /// version alone; the version bump and modification time are applied
    /// here. Returning [`Error::DidNotUpdateDescriptor`] from `update`
    /// aborts the write and reports success with the stored descriptor.
    ///
    /// The wait/write pair races with other publishers; a version moving
    /// underneath us restarts the loop.
    #[instrument(skip_all, fields(id = %id))]
    pub(crate) async fn publish(
        &self,
        stopper: &Stopper,
        id: DescriptorId,
        update: &mut (dyn FnMut(&mut TableDescriptor) -> Result<(), Error> + Send),
        event: Option<SchemaEvent>,
    ) -> Result<TableDescriptor, Error> {
        loop {
            let expected = self.wait_for_one_version(stopper, id).await?;
            match self.publish_at(id, expected, update, event.as_ref()).await {
                Err(Error::LeaseVersionChanged) => {
                    // Another node published while we were waiting.
                    debug!(%expected, "lease version changed; retrying");
                }
                other => return other,
            }
        }
    }

    /// One attempt to install `expected + 1`, failing with
    /// [`Error::LeaseVersionChanged`] if the stored version is no longer
    /// `expected`.
    async fn publish_at(
        &self,
        id: DescriptorId,
        expected: DescriptorVersion,
        update: &mut (dyn FnMut(&mut TableDescriptor) -> Result<(), Error> + Send),
        event: Option<&SchemaEvent>,
    ) -> Result<TableDescriptor, Error> {
        let mut txn = self.db.begin().await?;
        let mut desc = txn
            .get_descriptor(id)
            .await?
            .ok_or(Error::DescriptorNotFound(id))?;
        if desc.version != expected {
            return Err(Error::LeaseVersionChanged);
        }

        let stored = desc.clone();
        match update(&mut desc) {
            Ok(()) => {}
            Err(Error::DidNotUpdateDescriptor) => return Ok(stored),
            Err(err) => return Err(err),
        }
        if desc.version != expected {
            return Err(Error::InvalidDescriptor(format!(
                "update closure changed the version of descriptor {} from {} to {}",
                id, expected, desc.version
            )));
        }

        desc.version = expected.next();
        desc.modification_time = self.clock.now();
        desc.validate()?;

        if let Some(event) = event {
            // The trigger requires the descriptor write to be the first
            // operation, so the config change gossips at commit.
            txn.set_system_config_trigger();
            txn.put_descriptor(&desc).await?;
            txn.log_event(event.clone()).await?;
        } else {
            txn.put_descriptor(&desc).await?;
        }
        txn.commit().await?;
        Ok(desc)
    }
}
