//! Bidirectional relationship indexes.
//!
//! Each [`Relation`] pairs a forward field on an owner record with a
//! reciprocal set on a target record that may live in another partition.
//! The owner's partition stores the forward entry and its query index; the
//! target's partition stores the reciprocal set and the reverse query
//! index. The two halves are written by different partitions, so the
//! reciprocal half is delivered through the
//! [`ReciprocalOutbox`](crate::ReciprocalOutbox) after the owner commits.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, ValidationError};
use crate::gateway::{Capability, CapabilityCall};
use crate::outbox::{ReciprocalOutbox, Staged};
use crate::partition::PartitionStore;
use crate::record::{Address, RecordId};

/// Kinds of record that take part in relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    EconomicEvent,
    EconomicResource,
    Process,
    Intent,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EconomicEvent => "economic_event",
            Self::EconomicResource => "economic_resource",
            Self::Process => "process",
            Self::Intent => "intent",
        }
    }
}

/// A declared bidirectional relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// `economic_event.input_of` / `process.inputs`
    EventInputOf,
    /// `economic_event.output_of` / `process.outputs`
    EventOutputOf,
    /// `intent.input_of` / `process.intended_inputs`
    IntentInputOf,
    /// `intent.output_of` / `process.intended_outputs`
    IntentOutputOf,
    /// `economic_event.affects` / `economic_resource.affected_by`
    EventAffects,
    /// `economic_resource.contained_in` / `economic_resource.contains`
    ResourceContainedIn,
}

/// Which half of a relation a field name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Forward,
    Reciprocal,
}

impl Relation {
    pub const ALL: [Relation; 6] = [
        Self::EventInputOf,
        Self::EventOutputOf,
        Self::IntentInputOf,
        Self::IntentOutputOf,
        Self::EventAffects,
        Self::ResourceContainedIn,
    ];

    pub fn forward_field(self) -> &'static str {
        match self {
            Self::EventInputOf => "economic_event.input_of",
            Self::EventOutputOf => "economic_event.output_of",
            Self::IntentInputOf => "intent.input_of",
            Self::IntentOutputOf => "intent.output_of",
            Self::EventAffects => "economic_event.affects",
            Self::ResourceContainedIn => "economic_resource.contained_in",
        }
    }

    pub fn reciprocal_field(self) -> &'static str {
        match self {
            Self::EventInputOf => "process.inputs",
            Self::EventOutputOf => "process.outputs",
            Self::IntentInputOf => "process.intended_inputs",
            Self::IntentOutputOf => "process.intended_outputs",
            Self::EventAffects => "economic_resource.affected_by",
            Self::ResourceContainedIn => "economic_resource.contains",
        }
    }

    pub fn owner_kind(self) -> RecordKind {
        match self {
            Self::EventInputOf | Self::EventOutputOf | Self::EventAffects => {
                RecordKind::EconomicEvent
            }
            Self::IntentInputOf | Self::IntentOutputOf => RecordKind::Intent,
            Self::ResourceContainedIn => RecordKind::EconomicResource,
        }
    }

    pub fn target_kind(self) -> RecordKind {
        match self {
            Self::EventInputOf | Self::EventOutputOf => RecordKind::Process,
            Self::IntentInputOf | Self::IntentOutputOf => RecordKind::Process,
            Self::EventAffects | Self::ResourceContainedIn => RecordKind::EconomicResource,
        }
    }

    /// Resolve a field name to its relation and side.
    pub fn for_field(field: &str) -> Option<(Relation, Side)> {
        Self::ALL.into_iter().find_map(|r| {
            if r.forward_field() == field {
                Some((r, Side::Forward))
            } else if r.reciprocal_field() == field {
                Some((r, Side::Reciprocal))
            } else {
                None
            }
        })
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.forward_field(), self.reciprocal_field())
    }
}

/// One forward edge held by an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub relation: Relation,
    pub target: Address,
}

/// `(field, value)` key of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    field: String,
    value: RecordId,
}

impl EntryKey {
    fn new(field: &str, value: &RecordId) -> Self {
        Self {
            field: field.to_string(),
            value: value.clone(),
        }
    }
}

type EntryMap<V> = BTreeMap<EntryKey, Vec<V>>;

/// Index entries of one partition.
///
/// Every mutation is an idempotent set operation, so replaying a reciprocal
/// call after a lost acknowledgement leaves the table unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LinkTable {
    /// `(forward field, target id)` -> owners in this partition.
    #[serde(default, with = "entry_map")]
    forward: EntryMap<RecordId>,
    /// `(reciprocal field, target id)` -> owners, possibly remote.
    #[serde(default, with = "entry_map")]
    reciprocal: EntryMap<Address>,
    /// `(reciprocal field, owner id)` -> targets in this partition.
    #[serde(default, with = "entry_map")]
    reverse: EntryMap<RecordId>,
    /// Forward edges per owner, so cascading removal never scans.
    #[serde(default)]
    owned: BTreeMap<RecordId, Vec<Link>>,
}

impl LinkTable {
    /// Record a forward edge. Returns `false` if it already existed.
    pub(crate) fn add_forward(
        &mut self,
        relation: Relation,
        owner: &RecordId,
        target: &Address,
    ) -> bool {
        let link = Link {
            relation,
            target: target.clone(),
        };
        let links = self.owned.entry(owner.clone()).or_default();
        if links.contains(&link) {
            return false;
        }
        links.push(link);
        push_unique(
            self.forward
                .entry(EntryKey::new(relation.forward_field(), &target.id))
                .or_default(),
            owner.clone(),
        );
        true
    }

    /// Drop a forward edge. Returns `false` if it did not exist.
    pub(crate) fn remove_forward(
        &mut self,
        relation: Relation,
        owner: &RecordId,
        target: &Address,
    ) -> bool {
        let Some(links) = self.owned.get_mut(owner) else {
            return false;
        };
        let before = links.len();
        links.retain(|l| !(l.relation == relation && l.target == *target));
        if links.len() == before {
            return false;
        }
        if links.is_empty() {
            self.owned.remove(owner);
        }
        remove_entry(
            &mut self.forward,
            &EntryKey::new(relation.forward_field(), &target.id),
            owner,
        );
        true
    }

    /// Drop every forward edge of `owner`, returning what was removed.
    pub(crate) fn remove_owner(&mut self, owner: &RecordId) -> Vec<Link> {
        let links = self.owned.remove(owner).unwrap_or_default();
        for link in &links {
            remove_entry(
                &mut self.forward,
                &EntryKey::new(link.relation.forward_field(), &link.target.id),
                owner,
            );
        }
        links
    }

    pub(crate) fn forward_links(&self, owner: &RecordId) -> &[Link] {
        self.owned.get(owner).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Add `owner` to the reciprocal set on `target`.
    pub(crate) fn add_reciprocal(
        &mut self,
        relation: Relation,
        target: &RecordId,
        owner: &Address,
    ) -> bool {
        let field = relation.reciprocal_field();
        let added = push_unique(
            self.reciprocal
                .entry(EntryKey::new(field, target))
                .or_default(),
            owner.clone(),
        );
        push_unique(
            self.reverse
                .entry(EntryKey::new(field, &owner.id))
                .or_default(),
            target.clone(),
        );
        added
    }

    /// Remove `owner` from the reciprocal set on `target`.
    pub(crate) fn remove_reciprocal(
        &mut self,
        relation: Relation,
        target: &RecordId,
        owner: &Address,
    ) -> bool {
        let field = relation.reciprocal_field();
        let removed = remove_entry(&mut self.reciprocal, &EntryKey::new(field, target), owner);
        remove_entry(&mut self.reverse, &EntryKey::new(field, &owner.id), target);
        removed
    }

    /// Forget every reciprocal set held by a removed target.
    pub(crate) fn drop_target(&mut self, target: &RecordId) {
        for relation in Relation::ALL {
            let field = relation.reciprocal_field();
            if let Some(owners) = self.reciprocal.remove(&EntryKey::new(field, target)) {
                for owner in owners {
                    remove_entry(&mut self.reverse, &EntryKey::new(field, &owner.id), target);
                }
            }
        }
    }

    pub(crate) fn reciprocal_set(&self, relation: Relation, target: &RecordId) -> Vec<Address> {
        self.reciprocal
            .get(&EntryKey::new(relation.reciprocal_field(), target))
            .cloned()
            .unwrap_or_default()
    }

    /// Ids whose `field` matches `value`, in insertion order.
    ///
    /// # Errors
    ///
    /// [`ValidationError::UnknownField`] if no relation declares `field`.
    pub(crate) fn query(&self, field: &str, value: &RecordId) -> Result<Vec<RecordId>, ValidationError> {
        let (_, side) =
            Relation::for_field(field).ok_or_else(|| ValidationError::UnknownField(field.into()))?;
        let map = match side {
            Side::Forward => &self.forward,
            Side::Reciprocal => &self.reverse,
        };
        Ok(map
            .get(&EntryKey::new(field, value))
            .cloned()
            .unwrap_or_default())
    }
}

fn push_unique<T: PartialEq>(values: &mut Vec<T>, value: T) -> bool {
    if values.contains(&value) {
        false
    } else {
        values.push(value);
        true
    }
}

fn remove_entry<T: PartialEq>(map: &mut EntryMap<T>, key: &EntryKey, value: &T) -> bool {
    let Some(values) = map.get_mut(key) else {
        return false;
    };
    let before = values.len();
    values.retain(|v| v != value);
    let removed = values.len() != before;
    if values.is_empty() {
        map.remove(key);
    }
    removed
}

/// Custom serde for index maps.
///
/// JSON object keys must be strings, so each `(field, value)` key is
/// encoded as `"field/value"`.
mod entry_map {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{EntryKey, EntryMap};

    const SEP: char = '/';

    pub fn serialize<S, V>(map: &EntryMap<V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        let mut ser_map = serializer.serialize_map(Some(map.len()))?;
        for (key, values) in map {
            ser_map.serialize_entry(&format!("{}{SEP}{}", key.field, key.value), values)?;
        }
        ser_map.end()
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<EntryMap<V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        let raw: BTreeMap<String, Vec<V>> = BTreeMap::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, values)| {
                let (field, value) = key.split_once(SEP).ok_or_else(|| {
                    D::Error::custom(format!("index key missing '{SEP}' separator: {key}"))
                })?;
                Ok((
                    EntryKey {
                        field: field.to_string(),
                        value: value.into(),
                    },
                    values,
                ))
            })
            .collect()
    }
}

/// Link operations for the records of one partition.
///
/// Owner-side writes commit under the partition lock, and the reciprocal
/// half is staged in the outbox before that lock is released. Delivery is
/// attempted afterwards. A link is reported as made once the owner side
/// commits, whether or not the target partition has acknowledged it.
#[derive(Clone)]
pub struct LinkIndex {
    store: Arc<PartitionStore>,
    outbox: ReciprocalOutbox,
}

impl LinkIndex {
    pub(crate) fn new(store: Arc<PartitionStore>, outbox: ReciprocalOutbox) -> Self {
        Self { store, outbox }
    }

    /// Link `owner` (a record in this partition) to `target`.
    ///
    /// # Arguments
    ///
    /// * `relation` - The declared relation; its owner kind must match `owner`.
    /// * `owner` - Id of the owning record in this partition.
    /// * `target` - Address of the target record, local or remote.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if `owner` is not a live record of the
    /// relation's owner kind in this partition. Failures of the reciprocal
    /// half are never returned; see
    /// [`ReciprocalOutbox::failures`](crate::ReciprocalOutbox::failures).
    pub async fn link(
        &self,
        relation: Relation,
        owner: &RecordId,
        target: &Address,
    ) -> Result<(), LedgerError> {
        let staged = {
            let mut state = self.store.write().await;
            if !state.contains(relation.owner_kind(), owner) {
                return Err(LedgerError::not_found(relation.owner_kind().as_str(), owner));
            }
            if !state.links.add_forward(relation, owner, target) {
                return Ok(());
            }
            self.stage(vec![self.add_call(relation, owner, target)])
        };
        tracing::debug!(%relation, %owner, %target, "forward link recorded");
        self.deliver(staged).await;
        Ok(())
    }

    /// Inverse of [`link`](Self::link). Unlinking an absent edge is a no-op.
    pub async fn unlink(&self, relation: Relation, owner: &RecordId, target: &Address) {
        let staged = {
            let mut state = self.store.write().await;
            if !state.links.remove_forward(relation, owner, target) {
                return;
            }
            self.stage(vec![self.remove_call(relation, owner, target)])
        };
        tracing::debug!(%relation, %owner, %target, "forward link removed");
        self.deliver(staged).await;
    }

    /// Ids whose `field` has `value`.
    ///
    /// Forward fields (e.g. `intent.input_of`) are answered by the owner's
    /// partition; reciprocal fields (e.g. `process.intended_inputs`) by the
    /// target's.
    ///
    /// # Errors
    ///
    /// [`ValidationError::UnknownField`] if no relation declares `field`.
    pub async fn query(&self, field: &str, value: &RecordId) -> Result<Vec<RecordId>, LedgerError> {
        let state = self.store.read().await;
        Ok(state.links.query(field, value)?)
    }

    /// Owners currently in the reciprocal set of `target`.
    pub async fn reciprocal_set(&self, relation: Relation, target: &RecordId) -> Vec<Address> {
        self.store.read().await.links.reciprocal_set(relation, target)
    }

    /// Remove every edge `owner` participates in as owner.
    ///
    /// Idempotent: an owner with no edges left (for example one already
    /// cascaded) yields zero and sends nothing.
    ///
    /// # Returns
    ///
    /// The number of forward edges removed.
    pub async fn cascade_remove(&self, owner: &RecordId) -> usize {
        let (count, staged) = {
            let mut state = self.store.write().await;
            let links = state.links.remove_owner(owner);
            let calls = links
                .iter()
                .map(|l| self.remove_call(l.relation, owner, &l.target))
                .collect();
            (links.len(), self.stage(calls))
        };
        if count == 0 {
            return 0;
        }
        tracing::debug!(%owner, count, "cascading link removal");
        self.deliver(staged).await;
        count
    }

    /// Queue reciprocal calls in commit order. Call with this partition's
    /// write lock held.
    pub(crate) fn stage(&self, calls: Vec<CapabilityCall>) -> Staged {
        self.outbox.stage(calls)
    }

    /// Attempt staged calls. Call after the partition lock is released.
    pub(crate) async fn deliver(&self, staged: Staged) {
        self.outbox.deliver(staged).await;
    }

    pub(crate) fn add_call(
        &self,
        relation: Relation,
        owner: &RecordId,
        target: &Address,
    ) -> CapabilityCall {
        CapabilityCall::new(
            target.partition.clone(),
            Capability::AddReciprocal {
                relation,
                target: target.id.clone(),
                owner: Address::new(self.store.name().clone(), owner.clone()),
            },
        )
    }

    pub(crate) fn remove_call(
        &self,
        relation: Relation,
        owner: &RecordId,
        target: &Address,
    ) -> CapabilityCall {
        CapabilityCall::new(
            target.partition.clone(),
            Capability::RemoveReciprocal {
                relation,
                target: target.id.clone(),
                owner: Address::new(self.store.name().clone(), owner.clone()),
            },
        )
    }
}
