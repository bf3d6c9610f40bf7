//! Resource projection: a pure fold over the events that touch a resource.
//!
//! [`fold`] is deterministic and holds no state between calls, so a
//! resource can be re-derived from scratch at any time. Removing or
//! correcting an event therefore needs no undo logic: the next projection
//! simply folds a different event sequence.
//!
//! The only input that is not local to the partition is the process
//! specification behind each `outputOf` process, which sets `stage`.
//! [`ResourceProjector::project`] resolves those through the gateway
//! concurrently before folding.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::Instrument;

use crate::error::LedgerError;
use crate::event::{EconomicEvent, Measure};
use crate::gateway::{PartitionGateway, resolve_process};
use crate::partition::PartitionStore;
use crate::record::{Address, RecordId};
use crate::resource::{EconomicResource, ResourceRecord};

/// Process address -> the process specification it is based on, if any.
pub type StageMap = HashMap<Address, Option<Address>>;

/// Fold `events` (in commit order) onto the stored `record`.
///
/// # Arguments
///
/// * `record` - The stored resource fields.
/// * `events` - Live events naming the resource as source or destination,
///   in commit order. Events that do not touch the resource are ignored.
/// * `stages` - Resolved process specifications for `outputOf` processes.
///   A process missing from the map leaves `stage` unchanged.
///
/// # Returns
///
/// The projected resource. Running totals start at zero in the resource's
/// unit of effort, or in the unit of the first quantified event when the
/// resource has none.
pub fn fold(record: &ResourceRecord, events: &[EconomicEvent], stages: &StageMap) -> EconomicResource {
    let id = &record.revision_id.id;
    let unit = record.unit_of_effort.clone().or_else(|| {
        events
            .iter()
            .filter(|e| e.touches(id))
            .find_map(|e| e.resource_quantity.as_ref()?.has_unit.clone())
    });

    let mut accounting = 0.0;
    let mut onhand = 0.0;
    let mut state = None;
    let mut stage = None;
    let mut location = record.current_location.clone();
    let mut classified_as: Vec<String> = Vec::new();

    for event in events {
        let as_source = event.resource_inventoried_as.as_ref() == Some(id);
        let as_destination = event.to_resource_inventoried_as.as_ref() == Some(id);
        if !as_source && !as_destination {
            continue;
        }

        let action = event.action();
        let magnitude = event.magnitude();

        if as_source {
            accounting += action.resource_effect.sign() * magnitude;
            onhand += action.onhand_effect.sign() * magnitude;
        }
        if as_destination {
            // What leaves the source arrives here.
            accounting -= action.resource_effect.sign() * magnitude;
            onhand -= action.onhand_effect.sign() * magnitude;
        }

        if action.is_state_outcome() {
            state = Some(action.id);
        }
        for class in &event.resource_classified_as {
            if !classified_as.contains(class) {
                classified_as.push(class.clone());
            }
        }

        if let Some(process) = &event.output_of
            && let Some(Some(spec)) = stages.get(process)
        {
            stage = Some(spec.clone());
        }

        if action.changes_location()
            && let Some(at) = &event.at_location
        {
            location = Some(at.clone());
        }
    }

    EconomicResource {
        revision_id: record.revision_id.clone(),
        name: record.name.clone(),
        note: record.note.clone(),
        tracking_identifier: record.tracking_identifier.clone(),
        conforms_to: record.conforms_to.clone(),
        classified_as,
        accounting_quantity: Measure {
            has_numerical_value: accounting,
            has_unit: unit.clone(),
        },
        onhand_quantity: Measure {
            has_numerical_value: onhand,
            has_unit: unit,
        },
        unit_of_effort: record.unit_of_effort.clone(),
        state,
        stage,
        current_location: location,
        contained_in: record.contained_in.clone(),
    }
}

/// Computes [`EconomicResource`] views for the resources of one partition.
#[derive(Clone)]
pub struct ResourceProjector {
    store: Arc<PartitionStore>,
    gateway: Arc<dyn PartitionGateway>,
}

impl ResourceProjector {
    pub(crate) fn new(store: Arc<PartitionStore>, gateway: Arc<dyn PartitionGateway>) -> Self {
        Self { store, gateway }
    }

    /// Project the current state of `resource`.
    ///
    /// Reads the stored record and its events under one read lock, then
    /// resolves stages and folds without holding it. Two concurrent calls
    /// may see different event sets; re-project after your own write
    /// commits for a fixed point.
    ///
    /// # Errors
    ///
    /// * [`LedgerError::NotFound`] if the resource is unknown or removed.
    /// * [`LedgerError::Transient`] / [`LedgerError::Permanent`] if a
    ///   process could not be resolved.
    pub async fn project(&self, resource: &RecordId) -> Result<EconomicResource, LedgerError> {
        let span = tracing::debug_span!("project", %resource);
        async {
            let (record, events) = {
                let state = self.store.read().await;
                let record = state.resources.current(resource)?.clone();
                (record, state.events_affecting(resource))
            };
            let stages = resolve_stages(&self.gateway, &events).await?;
            let projected = fold(&record, &events, &stages);
            tracing::debug!(
                events = events.len(),
                accounting = projected.accounting_quantity.has_numerical_value,
                onhand = projected.onhand_quantity.has_numerical_value,
                "resource projected"
            );
            Ok(projected)
        }
        .instrument(span)
        .await
    }
}

/// Resolve the process specification of every distinct `outputOf` process.
async fn resolve_stages(
    gateway: &Arc<dyn PartitionGateway>,
    events: &[EconomicEvent],
) -> Result<StageMap, LedgerError> {
    let mut processes: Vec<Address> = events.iter().filter_map(|e| e.output_of.clone()).collect();
    processes.sort();
    processes.dedup();

    let mut tasks = JoinSet::new();
    for process in processes {
        let gateway = gateway.clone();
        tasks.spawn(async move {
            let resolved = resolve_process(gateway.as_ref(), &process).await;
            (process, resolved)
        });
    }

    let mut stages = StageMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (process, resolved) = joined.map_err(|e| {
            LedgerError::Io(io::Error::other(format!("stage resolution task failed: {e}")))
        })?;
        stages.insert(process, resolved?.and_then(|p| p.based_on));
    }
    Ok(stages)
}
