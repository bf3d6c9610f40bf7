//! Processes and intents.
//!
//! A process is observed in the `observation` partition; its `inputs`,
//! `outputs`, `intendedInputs` and `intendedOutputs` are reciprocal sets
//! maintained by the link index and filled in on read. Intents live in the
//! `planning` partition and point at processes across the boundary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::action::ActionId;
use crate::error::LedgerError;
use crate::event::Measure;
use crate::link::{LinkIndex, Relation};
use crate::partition::{PartitionState, PartitionStore};
use crate::record::{Address, FieldUpdate, Record, RecordId, RevisionId};

/// Stored process fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub revision_id: RevisionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// The process specification this process follows. Drives resource `stage`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub based_on: Option<Address>,
    #[serde(default)]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_beginning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_end: Option<String>,
}

impl Record for ProcessRecord {
    const KIND: &'static str = "process";

    fn revision_id(&self) -> &RevisionId {
        &self.revision_id
    }

    fn set_revision_id(&mut self, rev: RevisionId) {
        self.revision_id = rev;
    }
}

/// A process as read back, with its reciprocal sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(flatten)]
    pub record: ProcessRecord,
    /// Events naming this process as `inputOf`.
    pub inputs: Vec<Address>,
    /// Events naming this process as `outputOf`.
    pub outputs: Vec<Address>,
    /// Intents naming this process as `inputOf`.
    pub intended_inputs: Vec<Address>,
    /// Intents naming this process as `outputOf`.
    pub intended_outputs: Vec<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProcess {
    pub name: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub based_on: Option<Address>,
    #[serde(default)]
    pub has_beginning: Option<String>,
    #[serde(default)]
    pub has_end: Option<String>,
}

impl NewProcess {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn based_on(mut self, spec: Address) -> Self {
        self.based_on = Some(spec);
        self
    }

    pub(crate) fn into_record(self) -> ProcessRecord {
        ProcessRecord {
            revision_id: RevisionId::initial(),
            name: self.name,
            note: self.note,
            based_on: self.based_on,
            finished: false,
            has_beginning: self.has_beginning,
            has_end: self.has_end,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub note: FieldUpdate<String>,
    #[serde(default)]
    pub based_on: FieldUpdate<Address>,
    #[serde(default)]
    pub finished: Option<bool>,
}

impl ProcessUpdate {
    pub(crate) fn apply(self, process: &mut ProcessRecord) {
        if let Some(name) = self.name {
            process.name = name;
        }
        self.note.apply(&mut process.note);
        self.based_on.apply(&mut process.based_on);
        if let Some(finished) = self.finished {
            process.finished = finished;
        }
    }
}

/// A planned flow into or out of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub revision_id: RevisionId,
    pub action: ActionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_of: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_of: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_quantity: Option<Measure>,
    #[serde(default)]
    pub resource_classified_as: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_conforms_to: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default)]
    pub finished: bool,
}

impl Record for Intent {
    const KIND: &'static str = "intent";

    fn revision_id(&self) -> &RevisionId {
        &self.revision_id
    }

    fn set_revision_id(&mut self, rev: RevisionId) {
        self.revision_id = rev;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIntent {
    pub action: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub input_of: Option<Address>,
    #[serde(default)]
    pub output_of: Option<Address>,
    #[serde(default)]
    pub resource_quantity: Option<Measure>,
    #[serde(default)]
    pub resource_classified_as: Vec<String>,
    #[serde(default)]
    pub resource_conforms_to: Option<Address>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub receiver: Option<String>,
}

impl NewIntent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn input_of(mut self, process: Address) -> Self {
        self.input_of = Some(process);
        self
    }

    pub fn output_of(mut self, process: Address) -> Self {
        self.output_of = Some(process);
        self
    }

    pub fn quantity(mut self, value: f64, unit: impl Into<String>) -> Self {
        self.resource_quantity = Some(Measure::new(value, unit));
        self
    }

    pub(crate) fn into_record(self, action: ActionId) -> Intent {
        Intent {
            revision_id: RevisionId::initial(),
            action,
            note: self.note,
            input_of: self.input_of,
            output_of: self.output_of,
            resource_quantity: self.resource_quantity,
            resource_classified_as: self.resource_classified_as,
            resource_conforms_to: self.resource_conforms_to,
            provider: self.provider,
            receiver: self.receiver,
            finished: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentUpdate {
    #[serde(default)]
    pub note: FieldUpdate<String>,
    #[serde(default)]
    pub input_of: FieldUpdate<Address>,
    #[serde(default)]
    pub output_of: FieldUpdate<Address>,
    #[serde(default)]
    pub resource_quantity: FieldUpdate<Measure>,
    #[serde(default)]
    pub finished: Option<bool>,
}

impl IntentUpdate {
    pub(crate) fn apply(self, intent: &mut Intent) {
        self.note.apply(&mut intent.note);
        self.input_of.apply(&mut intent.input_of);
        self.output_of.apply(&mut intent.output_of);
        self.resource_quantity.apply(&mut intent.resource_quantity);
        if let Some(finished) = self.finished {
            intent.finished = finished;
        }
    }
}

/// Process operations of one partition.
#[derive(Clone)]
pub struct Processes {
    store: Arc<PartitionStore>,
}

impl Processes {
    pub(crate) fn new(store: Arc<PartitionStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, new: NewProcess) -> Result<Process, LedgerError> {
        let mut state = self.store.write().await;
        let record = state.processes.insert(new.into_record());
        tracing::info!(partition = %self.store.name(), process_id = %record.id(), "process created");
        Ok(with_reciprocals(&state, record))
    }

    /// The process with its reciprocal sets filled in.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if the process is unknown.
    pub async fn get(&self, id: &RecordId) -> Result<Process, LedgerError> {
        let state = self.store.read().await;
        let record = state.processes.current(id)?.clone();
        Ok(with_reciprocals(&state, record))
    }

    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or [`LedgerError::Conflict`] if `expected`
    /// is not the current revision.
    pub async fn update(&self, expected: &RevisionId, update: ProcessUpdate) -> Result<Process, LedgerError> {
        let mut state = self.store.write().await;
        let record = state.processes.revise(expected, |p| {
            update.apply(p);
            Ok(())
        })?;
        tracing::info!(process_id = %record.id(), revision = %record.revision_id, "process updated");
        Ok(with_reciprocals(&state, record))
    }

    pub async fn list(&self) -> Vec<Process> {
        let state = self.store.read().await;
        state
            .processes
            .iter()
            .map(|p| with_reciprocals(&state, p.clone()))
            .collect()
    }
}

fn with_reciprocals(state: &PartitionState, record: ProcessRecord) -> Process {
    let id = record.id().clone();
    let set = |relation| state.links.reciprocal_set(relation, &id);
    Process {
        inputs: set(Relation::EventInputOf),
        outputs: set(Relation::EventOutputOf),
        intended_inputs: set(Relation::IntentInputOf),
        intended_outputs: set(Relation::IntentOutputOf),
        record,
    }
}

/// Intent operations of one partition.
///
/// Intents point at processes that usually live in another partition. The
/// forward link commits with the intent; the process side is updated
/// through the outbox afterwards.
#[derive(Clone)]
pub struct Intents {
    store: Arc<PartitionStore>,
    links: LinkIndex,
}

impl Intents {
    pub(crate) fn new(store: Arc<PartitionStore>, links: LinkIndex) -> Self {
        Self { store, links }
    }

    /// # Errors
    ///
    /// [`ValidationError::UnknownAction`] if the action is not registered.
    pub async fn create(&self, new: NewIntent) -> Result<Intent, LedgerError> {
        let action: ActionId = new.action.parse()?;
        let span = tracing::debug_span!("create_intent", partition = %self.store.name(), %action);
        async {
            let (intent, staged) = {
                let mut state = self.store.write().await;
                let intent = state.intents.insert(new.into_record(action));
                let mut calls = Vec::new();
                for (relation, process) in intent_links(&intent) {
                    state.links.add_forward(relation, intent.id(), process);
                    calls.push(self.links.add_call(relation, intent.id(), process));
                }
                let staged = self.links.stage(calls);
                (intent, staged)
            };
            tracing::info!(intent_id = %intent.id(), "intent created");
            self.links.deliver(staged).await;
            Ok(intent)
        }
        .instrument(span)
        .await
    }

    pub async fn get(&self, id: &RecordId) -> Result<Intent, LedgerError> {
        Ok(self.store.read().await.intents.current(id)?.clone())
    }

    pub async fn list(&self) -> Vec<Intent> {
        self.store.read().await.intents.iter().cloned().collect()
    }

    /// Apply `update`, re-linking any process reference it changes.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or [`LedgerError::Conflict`] if `expected`
    /// is not the current revision.
    pub async fn update(&self, expected: &RevisionId, update: IntentUpdate) -> Result<Intent, LedgerError> {
        let (intent, relinked, staged) = {
            let mut state = self.store.write().await;
            let before = state.intents.check(expected)?.clone();
            let intent = state.intents.revise(expected, |i| {
                update.apply(i);
                Ok(())
            })?;

            let mut calls = Vec::new();
            let old = intent_links(&before);
            let new = intent_links(&intent);
            for (relation, process) in old.iter().filter(|l| !new.contains(l)) {
                state.links.remove_forward(*relation, intent.id(), process);
                calls.push(self.links.remove_call(*relation, intent.id(), process));
            }
            for (relation, process) in new.iter().filter(|l| !old.contains(l)) {
                state.links.add_forward(*relation, intent.id(), process);
                calls.push(self.links.add_call(*relation, intent.id(), process));
            }
            let relinked = calls.len();
            let staged = self.links.stage(calls);
            (intent, relinked, staged)
        };
        tracing::info!(intent_id = %intent.id(), relinked, "intent updated");
        self.links.deliver(staged).await;
        Ok(intent)
    }

    /// Remove the intent and every link it owns.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or [`LedgerError::Conflict`] if `expected`
    /// is not the current revision.
    pub async fn remove(&self, expected: &RevisionId) -> Result<(), LedgerError> {
        let removed = self.store.write().await.intents.remove(expected)?;
        let unlinked = self.links.cascade_remove(removed.id()).await;
        tracing::info!(intent_id = %removed.id(), unlinked, "intent removed");
        Ok(())
    }
}

fn intent_links(intent: &Intent) -> Vec<(Relation, &Address)> {
    let mut links = Vec::new();
    if let Some(process) = &intent.input_of {
        links.push((Relation::IntentInputOf, process));
    }
    if let Some(process) = &intent.output_of {
        links.push((Relation::IntentOutputOf, process));
    }
    links
}
