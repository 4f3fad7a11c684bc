use crate::descriptor::{DescriptorId, DescriptorVersion};

/// Errors surfaced by lease acquisition, release and publication.
///
/// Only [`Error::TableDropped`] carries meaning callers should act on;
/// the rest are surfaced as-is. [`Error::LeaseVersionChanged`] is retried
/// inside [`crate::LeaseManager::publish`] and never escapes it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The descriptor is being dropped. Callers must not retry.
    #[error("table is being dropped")]
    TableDropped,

    /// A lease was requested at a version older than the newest known one.
    #[error("unable to acquire lease on old version {version} of descriptor {id}")]
    OldVersion {
        id: DescriptorId,
        version: DescriptorVersion,
    },

    /// The stored descriptor has not reached the requested version yet.
    #[error("version {version} of descriptor {id} does not exist yet")]
    VersionNotFound {
        id: DescriptorId,
        version: DescriptorVersion,
    },

    /// No descriptor exists for the given id.
    #[error("descriptor {0} not found")]
    DescriptorNotFound(DescriptorId),

    /// Name resolution failed, or the resolved descriptor no longer
    /// carries the requested name.
    #[error("table {0:?} does not exist")]
    UndefinedTable(String),

    /// The manager is draining and refuses new acquisitions.
    #[error("cannot acquire lease when draining")]
    Draining,

    /// The descriptor version moved between the one-version wait and the
    /// publish transaction.
    #[error("lease version changed")]
    LeaseVersionChanged,

    /// Sentinel returned by a publish closure declining to mutate the
    /// descriptor. Treated as success with the current descriptor.
    #[error("did not update the descriptor")]
    DidNotUpdateDescriptor,

    /// The descriptor failed structural validation.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// The stopper is quiescing; background work was abandoned.
    #[error("node is shutting down")]
    Stopped,

    /// Transport or storage failure from the KV layer.
    #[error(transparent)]
    Kv(#[from] anyhow::Error),
}
