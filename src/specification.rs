//! Process and resource specifications.
//!
//! Both are immutable once created. They live in the `specification`
//! partition and are resolved from other partitions through the gateway.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::partition::PartitionStore;
use crate::record::{Record, RecordId, RevisionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpecification {
    pub revision_id: RevisionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Record for ProcessSpecification {
    const KIND: &'static str = "process_specification";

    fn revision_id(&self) -> &RevisionId {
        &self.revision_id
    }

    fn set_revision_id(&mut self, rev: RevisionId) {
        self.revision_id = rev;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpecification {
    pub revision_id: RevisionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Unit stamped onto resources created against this specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_unit_of_effort: Option<String>,
}

impl Record for ResourceSpecification {
    const KIND: &'static str = "resource_specification";

    fn revision_id(&self) -> &RevisionId {
        &self.revision_id
    }

    fn set_revision_id(&mut self, rev: RevisionId) {
        self.revision_id = rev;
    }
}

/// Either kind of specification, as returned by a resolution call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Specification {
    Process(ProcessSpecification),
    Resource(ResourceSpecification),
}

impl Specification {
    /// `defaultUnitOfEffort` of a resource specification; `None` otherwise.
    pub fn default_unit_of_effort(&self) -> Option<&str> {
        match self {
            Self::Resource(spec) => spec.default_unit_of_effort.as_deref(),
            Self::Process(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProcessSpecification {
    pub name: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl NewProcessSpecification {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            note: None,
        }
    }

    pub(crate) fn into_record(self) -> ProcessSpecification {
        ProcessSpecification {
            revision_id: RevisionId::initial(),
            name: self.name,
            note: self.note,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewResourceSpecification {
    pub name: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub default_unit_of_effort: Option<String>,
}

impl NewResourceSpecification {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn unit_of_effort(mut self, unit: impl Into<String>) -> Self {
        self.default_unit_of_effort = Some(unit.into());
        self
    }

    pub(crate) fn into_record(self) -> ResourceSpecification {
        ResourceSpecification {
            revision_id: RevisionId::initial(),
            name: self.name,
            note: self.note,
            default_unit_of_effort: self.default_unit_of_effort,
        }
    }
}

/// Specification operations of one partition.
#[derive(Clone)]
pub struct Specifications {
    store: Arc<PartitionStore>,
}

impl Specifications {
    pub(crate) fn new(store: Arc<PartitionStore>) -> Self {
        Self { store }
    }

    pub async fn create_process_specification(
        &self,
        new: NewProcessSpecification,
    ) -> Result<ProcessSpecification, LedgerError> {
        let spec = self
            .store
            .write()
            .await
            .process_specifications
            .insert(new.into_record());
        tracing::info!(partition = %self.store.name(), id = %spec.id(), "process specification created");
        Ok(spec)
    }

    pub async fn create_resource_specification(
        &self,
        new: NewResourceSpecification,
    ) -> Result<ResourceSpecification, LedgerError> {
        let spec = self
            .store
            .write()
            .await
            .resource_specifications
            .insert(new.into_record());
        tracing::info!(partition = %self.store.name(), id = %spec.id(), "resource specification created");
        Ok(spec)
    }

    /// Either kind of specification by id.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if neither table holds `id`.
    pub async fn get(&self, id: &RecordId) -> Result<Specification, LedgerError> {
        let state = self.store.read().await;
        if let Ok(spec) = state.process_specifications.current(id) {
            return Ok(Specification::Process(spec.clone()));
        }
        state
            .resource_specifications
            .current(id)
            .map(|spec| Specification::Resource(spec.clone()))
            .map_err(|_| LedgerError::not_found("specification", id))
    }
}
