//! Economic resource records and their projected view.
//!
//! The stored [`ResourceRecord`] only holds what is authored directly or
//! fixed at creation. Quantities, state, stage, location and
//! classifications are derived by
//! [`ResourceProjector`](crate::ResourceProjector) into an
//! [`EconomicResource`].

use serde::{Deserialize, Serialize};

use crate::action::ActionId;
use crate::error::ValidationError;
use crate::event::{Measure, NewEvent};
use crate::record::{Address, FieldUpdate, Record, RecordId, RevisionId};

/// Stored resource fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub revision_id: RevisionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_identifier: Option<String>,
    /// Fixed at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conforms_to: Option<Address>,
    /// Fixed at creation from the resolved specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_effort: Option<String>,
    /// Location before any location-changing event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contained_in: Option<RecordId>,
}

impl Record for ResourceRecord {
    const KIND: &'static str = "economic_resource";

    fn revision_id(&self) -> &RevisionId {
        &self.revision_id
    }

    fn set_revision_id(&mut self, rev: RevisionId) {
        self.revision_id = rev;
    }
}

/// Fields for a resource created by its first event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSeed {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub tracking_identifier: Option<String>,
    #[serde(default)]
    pub conforms_to: Option<Address>,
    #[serde(default)]
    pub current_location: Option<String>,
    #[serde(default)]
    pub contained_in: Option<RecordId>,
}

impl ResourceSeed {
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn conforms_to(mut self, spec: Address) -> Self {
        self.conforms_to = Some(spec);
        self
    }

    /// Specification whose `defaultUnitOfEffort` the resource takes:
    /// the resource's own `conformsTo`, else the creating event's.
    pub(crate) fn specification<'a>(&'a self, event: &'a NewEvent) -> Option<&'a Address> {
        self.conforms_to
            .as_ref()
            .or(event.resource_conforms_to.as_ref())
    }

    /// A resource needs a specification or a classification to exist.
    ///
    /// # Errors
    ///
    /// [`ValidationError::MissingSpecificationOrClassification`] if neither
    /// the seed nor the creating event supply one.
    pub(crate) fn check_creatable(&self, event: &NewEvent) -> Result<(), ValidationError> {
        if self.conforms_to.is_some()
            || event.resource_conforms_to.is_some()
            || !event.resource_classified_as.is_empty()
        {
            Ok(())
        } else {
            Err(ValidationError::MissingSpecificationOrClassification)
        }
    }

    pub(crate) fn into_record(
        self,
        event: &NewEvent,
        unit_of_effort: Option<String>,
    ) -> ResourceRecord {
        let conforms_to = self
            .conforms_to
            .or_else(|| event.resource_conforms_to.clone());
        ResourceRecord {
            revision_id: RevisionId::initial(),
            name: self.name,
            note: self.note,
            tracking_identifier: self.tracking_identifier,
            conforms_to,
            unit_of_effort,
            current_location: self
                .current_location
                .or_else(|| event.at_location.clone()),
            contained_in: self.contained_in,
        }
    }
}

/// Directly authored resource fields that may change after creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdate {
    #[serde(default)]
    pub name: FieldUpdate<String>,
    #[serde(default)]
    pub note: FieldUpdate<String>,
    #[serde(default)]
    pub tracking_identifier: FieldUpdate<String>,
    #[serde(default)]
    pub contained_in: FieldUpdate<RecordId>,
}

impl ResourceUpdate {
    pub(crate) fn apply(self, resource: &mut ResourceRecord) {
        self.name.apply(&mut resource.name);
        self.note.apply(&mut resource.note);
        self.tracking_identifier
            .apply(&mut resource.tracking_identifier);
        self.contained_in.apply(&mut resource.contained_in);
    }
}

/// Projected resource state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EconomicResource {
    pub revision_id: RevisionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conforms_to: Option<Address>,
    pub classified_as: Vec<String>,
    pub accounting_quantity: Measure,
    pub onhand_quantity: Measure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_effort: Option<String>,
    /// Last `pass` or `fail` in commit order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ActionId>,
    /// Process specification of the last process this resource was output of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contained_in: Option<RecordId>,
}

impl EconomicResource {
    pub fn id(&self) -> &RecordId {
        &self.revision_id.id
    }
}
