//! Crate-level error types for ledger writes, reads and partition calls.

use crate::record::RevisionId;

/// Error returned by every ledger, projection and link-index operation.
///
/// `NotFound`, `Validation` and `Conflict` are raised synchronously by the
/// owning partition. `Transient` and `Permanent` originate from a
/// [`PartitionGateway`](crate::PartitionGateway) call and are only surfaced
/// when the caller actually waited on that call (specification or process
/// resolution); the reciprocal half of a link write never fails the local
/// write.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Unknown id or revision, or a record that has been removed.
    #[error("no {kind} record found for {id}")]
    NotFound {
        /// Record kind (e.g. `"economic_event"`).
        kind: &'static str,
        /// The id or revision that was looked up.
        id: String,
    },

    /// The write was rejected before anything was committed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Optimistic concurrency check failed.
    ///
    /// The caller named a revision that is no longer the current one.
    #[error("revision conflict on {kind} {id}: expected {expected}, current is {current}")]
    Conflict {
        /// Record kind.
        kind: &'static str,
        /// Stable record id.
        id: String,
        /// The revision the caller last observed.
        expected: RevisionId,
        /// The revision actually stored.
        current: RevisionId,
    },

    /// A partition could not be reached or did not answer in time.
    ///
    /// Safe to retry with backoff.
    #[error("partition '{partition}' temporarily unavailable: {reason}")]
    Transient {
        /// Target partition name.
        partition: String,
        /// Human-readable cause.
        reason: String,
    },

    /// A partition refused the call (authorization or capability denial).
    ///
    /// Never retried.
    #[error("partition '{partition}' refused the call: {reason}")]
    Permanent {
        /// Target partition name.
        partition: String,
        /// Human-readable cause.
        reason: String,
    },

    /// Snapshot or outbox persistence failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// `true` for [`LedgerError::Transient`].
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Reasons a write is rejected before commit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// The `action` field names none of the built-in actions.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// The action changes a quantity but the event carries none.
    #[error("action '{action}' requires a resource quantity")]
    MissingQuantity {
        /// Action id.
        action: &'static str,
    },

    /// Negative or non-finite magnitude, or zero for an action that moves
    /// quantity between two resources.
    #[error("invalid quantity {value} for action '{action}'")]
    InvalidQuantity {
        /// Action id.
        action: &'static str,
        /// Offending magnitude.
        value: f64,
    },

    /// Neither a specification nor a classification was supplied when
    /// creating a resource.
    #[error("EconomicResource must have either a specification or classification")]
    MissingSpecificationOrClassification,

    /// The event's unit differs from the resource's established unit.
    #[error("unit mismatch on resource {resource}: expected '{expected}', found '{found}'")]
    UnitMismatch {
        /// Resource id.
        resource: String,
        /// Unit the resource is measured in.
        expected: String,
        /// Unit the event carried.
        found: String,
    },

    /// `toResourceInventoriedAs` was given for an action that only affects
    /// a single resource.
    #[error("action '{action}' does not accept a destination resource")]
    DestinationNotAllowed {
        /// Action id.
        action: &'static str,
    },

    /// Both `resourceInventoriedAs` and a new resource seed were given.
    #[error("an event cannot both reference an existing resource and create a new one")]
    ConflictingResourceReference,

    /// `query` was called with a field name no relation declares.
    #[error("unknown index field '{0}'")]
    UnknownField(String),
}

/// Failure reported by a [`PartitionGateway`](crate::PartitionGateway).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, thiserror::Error)]
pub enum GatewayError {
    /// Unreachable or timed out; retry with backoff.
    #[error("partition '{partition}' temporarily unavailable: {reason}")]
    Transient {
        /// Target partition name.
        partition: String,
        /// Human-readable cause.
        reason: String,
    },

    /// Refused; surface immediately, never retry.
    #[error("partition '{partition}' refused the call: {reason}")]
    Permanent {
        /// Target partition name.
        partition: String,
        /// Human-readable cause.
        reason: String,
    },
}

impl GatewayError {
    /// `true` for [`GatewayError::Transient`].
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<GatewayError> for LedgerError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transient { partition, reason } => Self::Transient { partition, reason },
            GatewayError::Permanent { partition, reason } => Self::Permanent { partition, reason },
        }
    }
}
