//! # Sync Error Types

use shardsync_core::SanityViolation;
use thiserror::Error;

use crate::world::EntityId;

/// Errors raised by the sync queues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// An invariant did not hold while marking an entity.
    #[error(transparent)]
    Sanity(#[from] SanityViolation),

    /// A flush pass stopped on an invariant violation.
    ///
    /// The remaining entities of the batch were put back at the front of the
    /// queue and go out with the next flush.
    #[error("flush aborted at entity {entity} ({requeued} entities requeued)")]
    FlushAborted {
        /// Entity being processed when the violation was raised.
        entity: EntityId,
        /// Entities put back into the queue.
        requeued: usize,
        /// The violation itself.
        #[source]
        source: SanityViolation,
    },
}

/// Result type for sync queue operations.
pub type SyncResult<T> = Result<T, SyncError>;
