//! Economic event records and the request types used to create them.

use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionId, ActionRegistry};
use crate::error::ValidationError;
use crate::record::{Address, FieldUpdate, Record, RecordId, RevisionId};

/// A quantity with an optional unit identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measure {
    pub has_numerical_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_unit: Option<String>,
}

impl Measure {
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            has_numerical_value: value,
            has_unit: Some(unit.into()),
        }
    }

    /// Zero in `unit`; the starting point of every running total.
    pub fn zero(unit: Option<String>) -> Self {
        Self {
            has_numerical_value: 0.0,
            has_unit: unit,
        }
    }
}

/// A committed economic event.
///
/// Economic fields are immutable once committed. Only `note` and
/// `resource_classified_as` may be corrected through
/// [`EventLedger::update`](crate::EventLedger::update), which issues a new
/// revision under the same id and commit position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EconomicEvent {
    pub revision_id: RevisionId,
    /// Commit position within the owning partition. Read-only.
    pub sequence: u64,
    pub action: ActionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_inventoried_as: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_resource_inventoried_as: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_quantity: Option<Measure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort_quantity: Option<Measure>,
    #[serde(default)]
    pub resource_classified_as: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_conforms_to: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_of: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_of: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_point_in_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_beginning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_end: Option<String>,
}

impl EconomicEvent {
    /// The row of the action table this event was committed with.
    pub fn action(&self) -> &'static Action {
        ActionRegistry::get(self.action)
    }

    /// Magnitude of the resource quantity, or zero if none was given.
    pub fn magnitude(&self) -> f64 {
        self.resource_quantity
            .as_ref()
            .map_or(0.0, |q| q.has_numerical_value)
    }

    /// Every resource this event acts on, source first.
    pub fn touched_resources(&self) -> impl Iterator<Item = &RecordId> {
        self.resource_inventoried_as
            .iter()
            .chain(self.to_resource_inventoried_as.iter())
    }

    /// `true` if this event names `resource` as source or destination.
    pub fn touches(&self, resource: &RecordId) -> bool {
        self.touched_resources().any(|r| r == resource)
    }
}

impl Record for EconomicEvent {
    const KIND: &'static str = "economic_event";

    fn revision_id(&self) -> &RevisionId {
        &self.revision_id
    }

    fn set_revision_id(&mut self, rev: RevisionId) {
        self.revision_id = rev;
    }
}

/// Request to append an economic event.
///
/// `action` is the wire id and is validated against the
/// [`ActionRegistry`] on append.
///
/// # Examples
///
/// ```
/// use rea_ledger::NewEvent;
///
/// let event = NewEvent::new("raise")
///     .quantity(8.0, "kg")
///     .classified_as("http://www.productontology.org/doc/Apple.ttl");
/// assert_eq!(event.action, "raise");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub action: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub resource_inventoried_as: Option<RecordId>,
    #[serde(default)]
    pub to_resource_inventoried_as: Option<RecordId>,
    #[serde(default)]
    pub resource_quantity: Option<Measure>,
    #[serde(default)]
    pub effort_quantity: Option<Measure>,
    #[serde(default)]
    pub resource_classified_as: Vec<String>,
    #[serde(default)]
    pub resource_conforms_to: Option<Address>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub input_of: Option<Address>,
    #[serde(default)]
    pub output_of: Option<Address>,
    #[serde(default)]
    pub at_location: Option<String>,
    #[serde(default)]
    pub has_point_in_time: Option<String>,
    #[serde(default)]
    pub has_beginning: Option<String>,
    #[serde(default)]
    pub has_end: Option<String>,
}

impl NewEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn quantity(mut self, value: f64, unit: impl Into<String>) -> Self {
        self.resource_quantity = Some(Measure::new(value, unit));
        self
    }

    pub fn classified_as(mut self, uri: impl Into<String>) -> Self {
        self.resource_classified_as.push(uri.into());
        self
    }

    pub fn conforms_to(mut self, spec: Address) -> Self {
        self.resource_conforms_to = Some(spec);
        self
    }

    pub fn of_resource(mut self, resource: RecordId) -> Self {
        self.resource_inventoried_as = Some(resource);
        self
    }

    pub fn to_resource(mut self, resource: RecordId) -> Self {
        self.to_resource_inventoried_as = Some(resource);
        self
    }

    pub fn input_of(mut self, process: Address) -> Self {
        self.input_of = Some(process);
        self
    }

    pub fn output_of(mut self, process: Address) -> Self {
        self.output_of = Some(process);
        self
    }

    pub fn at_location(mut self, location: impl Into<String>) -> Self {
        self.at_location = Some(location.into());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Check the request against the action table.
    ///
    /// # Returns
    ///
    /// The resolved [`Action`] row.
    ///
    /// # Errors
    ///
    /// * [`ValidationError::UnknownAction`] if `action` is not built in.
    /// * [`ValidationError::DestinationNotAllowed`] if a destination is
    ///   given for a single-resource action.
    /// * [`ValidationError::MissingQuantity`] if the action changes a
    ///   quantity and none is given.
    /// * [`ValidationError::InvalidQuantity`] for a negative or non-finite
    ///   magnitude, or a zero magnitude on a transfer or move.
    pub fn validate(&self) -> Result<&'static Action, ValidationError> {
        let id: ActionId = self.action.parse()?;
        let action = ActionRegistry::get(id);

        if self.to_resource_inventoried_as.is_some() && !action.is_dual_resource() {
            return Err(ValidationError::DestinationNotAllowed {
                action: id.as_str(),
            });
        }

        match &self.resource_quantity {
            None if action.affects_quantity() => Err(ValidationError::MissingQuantity {
                action: id.as_str(),
            }),
            None => Ok(action),
            Some(q) => {
                let value = q.has_numerical_value;
                let invalid = !value.is_finite()
                    || value < 0.0
                    || (action.is_dual_resource() && value == 0.0);
                if invalid {
                    Err(ValidationError::InvalidQuantity {
                        action: id.as_str(),
                        value,
                    })
                } else {
                    Ok(action)
                }
            }
        }
    }

    /// Build the committed record for this request.
    pub(crate) fn into_event(self, action: ActionId, sequence: u64) -> EconomicEvent {
        EconomicEvent {
            revision_id: RevisionId::initial(),
            sequence,
            action,
            note: self.note,
            resource_inventoried_as: self.resource_inventoried_as,
            to_resource_inventoried_as: self.to_resource_inventoried_as,
            resource_quantity: self.resource_quantity,
            effort_quantity: self.effort_quantity,
            resource_classified_as: self.resource_classified_as,
            resource_conforms_to: self.resource_conforms_to,
            provider: self.provider,
            receiver: self.receiver,
            input_of: self.input_of,
            output_of: self.output_of,
            at_location: self.at_location,
            has_point_in_time: self.has_point_in_time,
            has_beginning: self.has_beginning,
            has_end: self.has_end,
        }
    }
}

/// Correction applied by [`EventLedger::update`](crate::EventLedger::update).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventUpdate {
    #[serde(default)]
    pub note: FieldUpdate<String>,
    /// Replaces the whole classification list when set.
    #[serde(default)]
    pub resource_classified_as: Option<Vec<String>>,
}

impl EventUpdate {
    pub(crate) fn apply(self, event: &mut EconomicEvent) {
        self.note.apply(&mut event.note);
        if let Some(classes) = self.resource_classified_as {
            event.resource_classified_as = classes;
        }
    }
}
