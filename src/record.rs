//! Stable identities, revision chains and partition-qualified addresses.
//!
//! Every stored entity keeps its full revision chain keyed by a stable
//! [`RecordId`]. Writers name the [`RevisionId`] they last observed; a
//! mismatch with the stored head fails with
//! [`LedgerError::Conflict`](crate::LedgerError::Conflict).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Stable identity of a record. Never changes across revisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Mint a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version pointer: the stable id plus a sequence number that is
/// monotonic per id. Displayed as `id@seq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionId {
    pub id: RecordId,
    pub seq: u64,
}

impl RevisionId {
    pub fn new(id: RecordId, seq: u64) -> Self {
        Self { id, seq }
    }

    /// Revision zero of a freshly minted id.
    pub fn initial() -> Self {
        Self::new(RecordId::new(), 0)
    }

    fn next(&self) -> Self {
        Self::new(self.id.clone(), self.seq + 1)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.seq)
    }
}

/// Name of an independently replicated partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionRef(String);

impl PartitionRef {
    /// Events, resources and processes.
    pub const OBSERVATION: &'static str = "observation";
    /// Intents.
    pub const PLANNING: &'static str = "planning";
    /// Process and resource specifications.
    pub const SPECIFICATION: &'static str = "specification";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record reference that may point into another partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub partition: PartitionRef,
    pub id: RecordId,
}

impl Address {
    pub fn new(partition: impl Into<PartitionRef>, id: RecordId) -> Self {
        Self {
            partition: partition.into(),
            id,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.id)
    }
}

/// Tri-state field in an update request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldUpdate<T> {
    /// Leave the stored value as it is.
    #[default]
    Unchanged,
    /// Remove the stored value.
    Clear,
    /// Replace the stored value.
    Set(T),
}

impl<T> FieldUpdate<T> {
    /// Apply to `slot`, returning `true` if the stored value may have changed.
    pub fn apply(self, slot: &mut Option<T>) -> bool {
        match self {
            Self::Unchanged => false,
            Self::Clear => slot.take().is_some(),
            Self::Set(v) => {
                *slot = Some(v);
                true
            }
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

/// A revisioned record stored in a [`RecordTable`].
pub trait Record: Clone {
    /// Record kind used in error messages (e.g. `"economic_event"`).
    const KIND: &'static str;

    fn revision_id(&self) -> &RevisionId;

    fn set_revision_id(&mut self, rev: RevisionId);

    fn id(&self) -> &RecordId {
        &self.revision_id().id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevisionChain<T> {
    revisions: Vec<T>,
    #[serde(default)]
    removed: bool,
}

impl<T: Record> RevisionChain<T> {
    fn head(&self) -> Option<&T> {
        self.revisions.last()
    }
}

/// Records of one kind, each with its full revision chain.
///
/// Insertion order is kept separately so that listing (and event commit
/// order) is stable across snapshot round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize",
    deserialize = "T: serde::de::DeserializeOwned"
))]
pub struct RecordTable<T> {
    chains: BTreeMap<RecordId, RevisionChain<T>>,
    order: Vec<RecordId>,
}

impl<T> Default for RecordTable<T> {
    fn default() -> Self {
        Self {
            chains: BTreeMap::new(),
            order: Vec::new(),
        }
    }
}

impl<T: Record> RecordTable<T> {
    /// Store a new record at revision zero of its id.
    ///
    /// The record's revision id is normalized to `seq = 0`.
    pub fn insert(&mut self, mut record: T) -> T {
        let rev = RevisionId::new(record.id().clone(), 0);
        record.set_revision_id(rev.clone());
        self.order.push(rev.id.clone());
        self.chains.insert(
            rev.id,
            RevisionChain {
                revisions: vec![record.clone()],
                removed: false,
            },
        );
        record
    }

    /// Current head of a live record.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if the id is unknown or the record was removed.
    pub fn current(&self, id: &RecordId) -> Result<&T, LedgerError> {
        match self.chains.get(id) {
            Some(chain) if !chain.removed => chain
                .head()
                .ok_or_else(|| LedgerError::not_found(T::KIND, id)),
            _ => Err(LedgerError::not_found(T::KIND, id)),
        }
    }

    /// `true` if `id` names a live record.
    pub fn contains(&self, id: &RecordId) -> bool {
        self.current(id).is_ok()
    }

    /// Any revision in the chain, including historic ones of removed records.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if no such revision was ever stored.
    pub fn revision(&self, rev: &RevisionId) -> Result<&T, LedgerError> {
        self.chains
            .get(&rev.id)
            .and_then(|chain| {
                chain
                    .revisions
                    .iter()
                    .find(|r| r.revision_id().seq == rev.seq)
            })
            .ok_or_else(|| LedgerError::not_found(T::KIND, rev))
    }

    /// Verify that `expected` is the current head.
    ///
    /// # Errors
    ///
    /// * [`LedgerError::NotFound`] if the record is unknown or removed.
    /// * [`LedgerError::Conflict`] if the head has advanced past `expected`.
    pub fn check(&self, expected: &RevisionId) -> Result<&T, LedgerError> {
        let head = self.current(&expected.id)?;
        if head.revision_id() != expected {
            return Err(LedgerError::Conflict {
                kind: T::KIND,
                id: expected.id.to_string(),
                expected: expected.clone(),
                current: head.revision_id().clone(),
            });
        }
        Ok(head)
    }

    /// Append a new revision derived from the head named by `expected`.
    ///
    /// `f` edits a copy of the head; if it fails nothing is stored.
    ///
    /// # Errors
    ///
    /// Those of [`check`](Self::check), plus whatever `f` returns.
    pub fn revise<F>(&mut self, expected: &RevisionId, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut T) -> Result<(), LedgerError>,
    {
        let mut next = self.check(expected)?.clone();
        f(&mut next)?;
        next.set_revision_id(expected.next());
        self.push(next.clone());
        Ok(next)
    }

    /// Advance the revision of a live record without an optimistic check.
    ///
    /// Used when a dependent write (an event touching a resource) changes
    /// the record's derived state.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if the record is unknown or removed.
    pub fn touch(&mut self, id: &RecordId) -> Result<T, LedgerError> {
        let mut next = self.current(id)?.clone();
        let rev = next.revision_id().next();
        next.set_revision_id(rev);
        self.push(next.clone());
        Ok(next)
    }

    /// Mark the record named by `expected` as removed.
    ///
    /// # Errors
    ///
    /// Those of [`check`](Self::check).
    pub fn remove(&mut self, expected: &RevisionId) -> Result<T, LedgerError> {
        let removed = self.check(expected)?.clone();
        if let Some(chain) = self.chains.get_mut(&expected.id) {
            chain.removed = true;
        }
        Ok(removed)
    }

    /// Live records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|id| self.current(id).ok())
    }

    /// Insertion position of `id`, live or removed.
    #[cfg(test)]
    fn position(&self, id: &RecordId) -> Option<usize> {
        self.order.iter().position(|o| o == id)
    }

    fn push(&mut self, record: T) {
        if let Some(chain) = self.chains.get_mut(record.id()) {
            chain.revisions.push(record);
        }
    }
}
