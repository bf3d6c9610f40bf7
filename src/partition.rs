//! Partition storage and the per-partition component facade.
//!
//! A partition is an independently replicated store for a subset of record
//! kinds. [`PartitionStore`] holds its tables and link entries behind one
//! lock and answers capability calls from peers. [`Partition`] hands out
//! the components that operate on it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{LedgerError, ValidationError};
use crate::event::{EconomicEvent, Measure};
use crate::gateway::{Capability, PartitionGateway, Reply};
use crate::ledger::EventLedger;
use crate::link::{LinkIndex, LinkTable, RecordKind};
use crate::outbox::ReciprocalOutbox;
use crate::planning::{Intent, Intents, ProcessRecord, Processes};
use crate::projection::ResourceProjector;
use crate::record::{Address, PartitionRef, RecordId, RecordTable};
use crate::resource::ResourceRecord;
use crate::specification::{
    ProcessSpecification, ResourceSpecification, Specification, Specifications,
};

/// Everything one partition stores. Also the snapshot format.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct PartitionState {
    #[serde(default)]
    pub(crate) events: RecordTable<EconomicEvent>,
    #[serde(default)]
    pub(crate) resources: RecordTable<ResourceRecord>,
    #[serde(default)]
    pub(crate) processes: RecordTable<ProcessRecord>,
    #[serde(default)]
    pub(crate) intents: RecordTable<Intent>,
    #[serde(default)]
    pub(crate) process_specifications: RecordTable<ProcessSpecification>,
    #[serde(default)]
    pub(crate) resource_specifications: RecordTable<ResourceSpecification>,
    #[serde(default)]
    pub(crate) links: LinkTable,
    /// Commit position handed to the next appended event.
    #[serde(default)]
    pub(crate) next_sequence: u64,
}

impl PartitionState {
    pub(crate) fn contains(&self, kind: RecordKind, id: &RecordId) -> bool {
        match kind {
            RecordKind::EconomicEvent => self.events.contains(id),
            RecordKind::EconomicResource => self.resources.contains(id),
            RecordKind::Process => self.processes.contains(id),
            RecordKind::Intent => self.intents.contains(id),
        }
    }

    /// Live events naming `resource` as source or destination, in commit order.
    pub(crate) fn events_affecting(&self, resource: &RecordId) -> Vec<EconomicEvent> {
        self.events
            .iter()
            .filter(|e| e.touches(resource))
            .cloned()
            .collect()
    }

    /// The unit a resource is measured in: its `unitOfEffort`, else the unit
    /// of the first quantified event that touched it.
    pub(crate) fn established_unit(&self, resource: &ResourceRecord) -> Option<String> {
        let id = &resource.revision_id.id;
        resource.unit_of_effort.clone().or_else(|| {
            self.events
                .iter()
                .filter(|e| e.touches(id))
                .find_map(|e| e.resource_quantity.as_ref()?.has_unit.clone())
        })
    }

    /// Reject `quantity` if its unit disagrees with the resource's.
    ///
    /// # Errors
    ///
    /// * [`LedgerError::NotFound`] if the resource is unknown or removed.
    /// * [`ValidationError::UnitMismatch`] on disagreement.
    pub(crate) fn check_unit(
        &self,
        resource: &RecordId,
        quantity: Option<&Measure>,
    ) -> Result<(), LedgerError> {
        let record = self.resources.current(resource)?;
        let Some(found) = quantity.and_then(|q| q.has_unit.as_deref()) else {
            return Ok(());
        };
        if let Some(expected) = self.established_unit(record)
            && expected != found
        {
            return Err(ValidationError::UnitMismatch {
                resource: resource.to_string(),
                expected,
                found: found.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn resolve_specification(&self, id: &RecordId) -> Option<Specification> {
        if let Ok(spec) = self.process_specifications.current(id) {
            return Some(Specification::Process(spec.clone()));
        }
        self.resource_specifications
            .current(id)
            .ok()
            .map(|spec| Specification::Resource(spec.clone()))
    }
}

/// Lock-guarded storage of one partition.
#[derive(Debug)]
pub struct PartitionStore {
    name: PartitionRef,
    state: RwLock<PartitionState>,
}

impl PartitionStore {
    pub(crate) fn new(name: PartitionRef, state: PartitionState) -> Self {
        Self {
            name,
            state: RwLock::new(state),
        }
    }

    pub fn name(&self) -> &PartitionRef {
        &self.name
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, PartitionState> {
        self.state.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, PartitionState> {
        self.state.write().await
    }

    /// Apply a capability call from a peer.
    ///
    /// Reciprocal writes are idempotent set operations. Adding to a target
    /// that does not exist answers [`Reply::NotFound`]; removing from one
    /// answers [`Reply::Ack`], since the membership is gone either way.
    pub(crate) async fn handle(&self, capability: Capability) -> Reply {
        match capability {
            Capability::AddReciprocal {
                relation,
                target,
                owner,
            } => {
                let mut state = self.write().await;
                if !state.contains(relation.target_kind(), &target) {
                    tracing::warn!(
                        partition = %self.name,
                        %relation,
                        %target,
                        "reciprocal target not found"
                    );
                    return Reply::NotFound;
                }
                if state.links.add_reciprocal(relation, &target, &owner) {
                    tracing::debug!(%relation, %target, %owner, "reciprocal added");
                }
                Reply::Ack
            }
            Capability::RemoveReciprocal {
                relation,
                target,
                owner,
            } => {
                let mut state = self.write().await;
                if state.links.remove_reciprocal(relation, &target, &owner) {
                    tracing::debug!(%relation, %target, %owner, "reciprocal removed");
                }
                Reply::Ack
            }
            Capability::ResolveSpecification { id } => self
                .read()
                .await
                .resolve_specification(&id)
                .map_or(Reply::NotFound, Reply::Specification),
            Capability::ResolveProcess { id } => self
                .read()
                .await
                .processes
                .current(&id)
                .map_or(Reply::NotFound, |p| Reply::Process(p.clone())),
        }
    }
}

/// Components bound to one partition.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct Partition {
    store: Arc<PartitionStore>,
    gateway: Arc<dyn PartitionGateway>,
    outbox: ReciprocalOutbox,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("name", self.store.name())
            .finish_non_exhaustive()
    }
}

impl Partition {
    pub(crate) fn new(
        store: Arc<PartitionStore>,
        gateway: Arc<dyn PartitionGateway>,
        outbox: ReciprocalOutbox,
    ) -> Self {
        Self {
            store,
            gateway,
            outbox,
        }
    }

    pub fn name(&self) -> &PartitionRef {
        self.store.name()
    }

    /// Address of a record held by this partition.
    pub fn address(&self, id: &RecordId) -> Address {
        Address::new(self.name().clone(), id.clone())
    }

    pub fn ledger(&self) -> EventLedger {
        EventLedger::new(
            self.store.clone(),
            self.gateway.clone(),
            self.links(),
            self.projector(),
        )
    }

    pub fn projector(&self) -> ResourceProjector {
        ResourceProjector::new(self.store.clone(), self.gateway.clone())
    }

    pub fn links(&self) -> LinkIndex {
        LinkIndex::new(self.store.clone(), self.outbox.clone())
    }

    pub fn processes(&self) -> Processes {
        Processes::new(self.store.clone())
    }

    pub fn intents(&self) -> Intents {
        Intents::new(self.store.clone(), self.links())
    }

    pub fn specifications(&self) -> Specifications {
        Specifications::new(self.store.clone())
    }

    pub(crate) fn store(&self) -> &Arc<PartitionStore> {
        &self.store
    }
}
