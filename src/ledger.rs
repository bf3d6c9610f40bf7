//! The append-only event ledger of a partition, and the resources it
//! inventories.
//!
//! Every write commits under the partition lock, then releases it before
//! delivering reciprocal link calls and re-projecting the resources it
//! touched. Reciprocal calls may target this same partition, so holding
//! the lock across delivery would deadlock against its endpoint.

use std::sync::Arc;

use tracing::Instrument;

use crate::error::{LedgerError, ValidationError};
use crate::event::{EconomicEvent, EventUpdate, NewEvent};
use crate::gateway::{PartitionGateway, resolve_process, resolve_specification};
use crate::link::{LinkIndex, Relation};
use crate::outbox::Staged;
use crate::partition::PartitionStore;
use crate::projection::ResourceProjector;
use crate::record::{Address, FieldUpdate, Record, RecordId, RevisionId};
use crate::resource::{EconomicResource, ResourceSeed, ResourceUpdate};

/// Event and resource operations of one partition.
#[derive(Clone)]
pub struct EventLedger {
    store: Arc<PartitionStore>,
    gateway: Arc<dyn PartitionGateway>,
    links: LinkIndex,
    projector: ResourceProjector,
}

impl EventLedger {
    pub(crate) fn new(
        store: Arc<PartitionStore>,
        gateway: Arc<dyn PartitionGateway>,
        links: LinkIndex,
        projector: ResourceProjector,
    ) -> Self {
        Self {
            store,
            gateway,
            links,
            projector,
        }
    }

    fn address(&self, id: &RecordId) -> Address {
        Address::new(self.store.name().clone(), id.clone())
    }

    /// Append an economic event, optionally creating the resource it
    /// observes.
    ///
    /// # Arguments
    ///
    /// * `new` - The event. Names an existing resource through
    ///   `resource_inventoried_as`, or none when `seed` is given.
    /// * `seed` - Fields of a new resource. The resource is created in the
    ///   same commit and becomes the event's subject. Its `unitOfEffort` is
    ///   taken from the resource specification named by the seed, else by
    ///   the event.
    ///
    /// # Returns
    ///
    /// The committed event and the projection of its subject resource, if
    /// it has one. Reciprocal links are dispatched before returning but may
    /// still be queued for retry.
    ///
    /// # Errors
    ///
    /// * [`LedgerError::Validation`] for an unknown action, a bad quantity,
    ///   a unit that disagrees with the resource, a resource that would have
    ///   neither specification nor classification, or a seed given together
    ///   with an existing resource.
    /// * [`LedgerError::NotFound`] if a named resource or container does
    ///   not exist.
    /// * [`LedgerError::Transient`] / [`LedgerError::Permanent`] if the
    ///   specification or output process could not be resolved. Nothing is
    ///   committed in that case.
    pub async fn append(
        &self,
        new: NewEvent,
        seed: Option<ResourceSeed>,
    ) -> Result<(EconomicEvent, Option<EconomicResource>), LedgerError> {
        let span = tracing::debug_span!("append", partition = %self.store.name(), action = %new.action);
        self.append_inner(new, seed).instrument(span).await
    }

    async fn append_inner(
        &self,
        mut new: NewEvent,
        seed: Option<ResourceSeed>,
    ) -> Result<(EconomicEvent, Option<EconomicResource>), LedgerError> {
        let action = new.validate()?;
        if seed.is_some() && new.resource_inventoried_as.is_some() {
            return Err(ValidationError::ConflictingResourceReference.into());
        }

        // Remote lookups happen before the lock so nothing commits if a
        // collaborator is unavailable.
        let unit_of_effort = match &seed {
            Some(seed) => {
                seed.check_creatable(&new)?;
                let unit = self.unit_of_effort(seed, &new).await?;
                if let Some(expected) = &unit
                    && let Some(found) = new.resource_quantity.as_ref().and_then(|q| q.has_unit.as_deref())
                    && expected != found
                {
                    return Err(ValidationError::UnitMismatch {
                        resource: "new resource".to_string(),
                        expected: expected.clone(),
                        found: found.to_string(),
                    }
                    .into());
                }
                unit
            }
            None => None,
        };
        if let Some(process) = &new.output_of {
            resolve_process(self.gateway.as_ref(), process).await?;
        }

        let (event, staged) = {
            let mut state = self.store.write().await;

            for resource in [&new.resource_inventoried_as, &new.to_resource_inventoried_as]
                .into_iter()
                .flatten()
            {
                state.check_unit(resource, new.resource_quantity.as_ref())?;
            }

            let mut calls = Vec::new();
            if let Some(seed) = seed {
                if let Some(container) = &seed.contained_in
                    && !state.resources.contains(container)
                {
                    return Err(LedgerError::not_found("economic_resource", container));
                }
                if let Some(destination) = &new.to_resource_inventoried_as {
                    state.resources.touch(destination)?;
                }
                let created = state.resources.insert(seed.into_record(&new, unit_of_effort));
                if let Some(container) = &created.contained_in {
                    let target = self.address(container);
                    state
                        .links
                        .add_forward(Relation::ResourceContainedIn, created.id(), &target);
                    calls.push(self.links.add_call(
                        Relation::ResourceContainedIn,
                        created.id(),
                        &target,
                    ));
                }
                tracing::info!(resource_id = %created.id(), "resource created");
                new.resource_inventoried_as = Some(created.id().clone());
            } else {
                for resource in [&new.resource_inventoried_as, &new.to_resource_inventoried_as]
                    .into_iter()
                    .flatten()
                {
                    state.resources.touch(resource)?;
                }
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let event = state.events.insert(new.into_event(action.id, sequence));

            let mut forward: Vec<(Relation, Address)> = Vec::new();
            if let Some(process) = &event.input_of {
                forward.push((Relation::EventInputOf, process.clone()));
            }
            if let Some(process) = &event.output_of {
                forward.push((Relation::EventOutputOf, process.clone()));
            }
            for resource in event.touched_resources() {
                forward.push((Relation::EventAffects, self.address(resource)));
            }
            for (relation, target) in &forward {
                state.links.add_forward(*relation, event.id(), target);
                calls.push(self.links.add_call(*relation, event.id(), target));
            }

            (event, self.links.stage(calls))
        };
        tracing::info!(
            event_id = %event.id(),
            sequence = event.sequence,
            action = %event.action,
            "event appended"
        );

        let resource = self.settle(staged, &event).await?;
        Ok((event, resource))
    }

    /// Resolve the unit of effort a new resource takes.
    async fn unit_of_effort(
        &self,
        seed: &ResourceSeed,
        new: &NewEvent,
    ) -> Result<Option<String>, LedgerError> {
        let Some(spec) = seed.specification(new) else {
            return Ok(None);
        };
        match resolve_specification(self.gateway.as_ref(), spec).await? {
            Some(found) => Ok(found.default_unit_of_effort().map(str::to_string)),
            None => {
                tracing::warn!(%spec, "resource specification not found; unitOfEffort left empty");
                Ok(None)
            }
        }
    }

    /// Deliver link calls and re-project both sides of `event` concurrently.
    ///
    /// # Returns
    ///
    /// The source resource's projection, if the event has a source.
    async fn settle(
        &self,
        staged: Staged,
        event: &EconomicEvent,
    ) -> Result<Option<EconomicResource>, LedgerError> {
        let project = |resource: Option<RecordId>| async move {
            match resource {
                Some(id) => self.projector.project(&id).await.map(Some),
                None => Ok(None),
            }
        };
        let ((), source, destination) = tokio::join!(
            self.links.deliver(staged),
            project(event.resource_inventoried_as.clone()),
            project(event.to_resource_inventoried_as.clone()),
        );
        if let Some(destination) = destination? {
            tracing::debug!(resource_id = %destination.id(), "destination re-projected");
        }
        source
    }

    pub async fn get(&self, id: &RecordId) -> Result<EconomicEvent, LedgerError> {
        Ok(self.store.read().await.events.current(id)?.clone())
    }

    /// Any stored revision of an event, including those of removed events.
    pub async fn revision(&self, rev: &RevisionId) -> Result<EconomicEvent, LedgerError> {
        Ok(self.store.read().await.events.revision(rev)?.clone())
    }

    /// Live events in commit order.
    pub async fn list(&self) -> Vec<EconomicEvent> {
        self.store.read().await.events.iter().cloned().collect()
    }

    /// Live events naming `resource` as source or destination, in commit order.
    pub async fn events_affecting(&self, resource: &RecordId) -> Vec<EconomicEvent> {
        self.store.read().await.events_affecting(resource)
    }

    /// Correct an event's descriptive fields.
    ///
    /// The event keeps its id and commit position; its revision advances.
    ///
    /// # Returns
    ///
    /// The new revision and the re-projected source resource.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or [`LedgerError::Conflict`] if `expected`
    /// is not the current revision.
    pub async fn update(
        &self,
        expected: &RevisionId,
        update: EventUpdate,
    ) -> Result<(EconomicEvent, Option<EconomicResource>), LedgerError> {
        let event = {
            let mut state = self.store.write().await;
            let event = state.events.revise(expected, |e| {
                update.apply(e);
                Ok(())
            })?;
            for resource in event.touched_resources() {
                if state.resources.contains(resource) {
                    state.resources.touch(resource)?;
                }
            }
            event
        };
        tracing::info!(event_id = %event.id(), revision = %event.revision_id, "event updated");

        let resource = self.settle(Staged::default(), &event).await?;
        Ok((event, resource))
    }

    /// Remove an event.
    ///
    /// Its links are cascaded away. The resources it touched advance their
    /// revision and fold without it on their next read.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or [`LedgerError::Conflict`] if `expected`
    /// is not the current revision.
    pub async fn remove(&self, expected: &RevisionId) -> Result<(), LedgerError> {
        let event = {
            let mut state = self.store.write().await;
            let event = state.events.remove(expected)?;
            for resource in event.touched_resources() {
                if state.resources.contains(resource) {
                    state.resources.touch(resource)?;
                }
            }
            event
        };
        let unlinked = self.links.cascade_remove(event.id()).await;
        tracing::info!(event_id = %event.id(), unlinked, "event removed");
        Ok(())
    }

    /// Current projection of a resource.
    pub async fn get_resource(&self, id: &RecordId) -> Result<EconomicResource, LedgerError> {
        self.projector.project(id).await
    }

    /// Projections of every live resource, in creation order.
    pub async fn list_resources(&self) -> Result<Vec<EconomicResource>, LedgerError> {
        let ids: Vec<RecordId> = {
            let state = self.store.read().await;
            state.resources.iter().map(|r| r.id().clone()).collect()
        };
        let mut resources = Vec::with_capacity(ids.len());
        for id in &ids {
            resources.push(self.projector.project(id).await?);
        }
        Ok(resources)
    }

    /// Change a resource's authored fields.
    ///
    /// Changing `contained_in` unlinks the old container and links the new
    /// one.
    ///
    /// # Errors
    ///
    /// * [`LedgerError::NotFound`] or [`LedgerError::Conflict`] if
    ///   `expected` is not the current revision.
    /// * [`LedgerError::NotFound`] if the new container does not exist.
    pub async fn update_resource(
        &self,
        expected: &RevisionId,
        update: ResourceUpdate,
    ) -> Result<EconomicResource, LedgerError> {
        let (id, relinked, staged) = {
            let mut state = self.store.write().await;
            if let FieldUpdate::Set(container) = &update.contained_in
                && !state.resources.contains(container)
            {
                return Err(LedgerError::not_found("economic_resource", container));
            }
            let before = state.resources.check(expected)?.contained_in.clone();
            let record = state.resources.revise(expected, |r| {
                update.apply(r);
                Ok(())
            })?;

            let mut calls = Vec::new();
            if before != record.contained_in {
                if let Some(old) = &before {
                    let target = self.address(old);
                    state
                        .links
                        .remove_forward(Relation::ResourceContainedIn, record.id(), &target);
                    calls.push(self.links.remove_call(
                        Relation::ResourceContainedIn,
                        record.id(),
                        &target,
                    ));
                }
                if let Some(new) = &record.contained_in {
                    let target = self.address(new);
                    state
                        .links
                        .add_forward(Relation::ResourceContainedIn, record.id(), &target);
                    calls.push(self.links.add_call(
                        Relation::ResourceContainedIn,
                        record.id(),
                        &target,
                    ));
                }
            }
            let relinked = calls.len();
            (record.id().clone(), relinked, self.links.stage(calls))
        };
        tracing::info!(resource_id = %id, relinked, "resource updated");

        self.links.deliver(staged).await;
        self.projector.project(&id).await
    }

    /// Remove a resource and every link it owns or is the target of.
    ///
    /// Events that touched the resource are kept.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or [`LedgerError::Conflict`] if `expected`
    /// is not the current revision.
    pub async fn remove_resource(&self, expected: &RevisionId) -> Result<(), LedgerError> {
        let removed = {
            let mut state = self.store.write().await;
            let removed = state.resources.remove(expected)?;
            state.links.drop_target(removed.id());
            removed
        };
        let unlinked = self.links.cascade_remove(removed.id()).await;
        tracing::info!(resource_id = %removed.id(), unlinked, "resource removed");
        Ok(())
    }
}
