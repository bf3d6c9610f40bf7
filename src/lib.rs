//! Append-only economic event ledger with resource projections and
//! cross-partition link indexes.

mod action;
pub use action::{Action, ActionId, ActionRegistry, Effect, InputOutput};
mod actor;
mod error;
mod event;
mod gateway;
mod ledger;
mod link;
mod outbox;
mod partition;
mod planning;
mod projection;
mod record;
mod resource;
mod snapshot;
mod specification;
mod storage;
mod store;

pub use error::{GatewayError, LedgerError, ValidationError};
pub use event::{EconomicEvent, EventUpdate, Measure, NewEvent};
pub use gateway::{
    Capability, CapabilityCall, LocalGateway, PartitionGateway, PartitionStatus, Reply,
};
pub use ledger::EventLedger;
pub use link::{Link, LinkIndex, RecordKind, Relation, Side};
pub use outbox::{
    CallId, DeadLetter, Delivery, DeliveryFailure, FlushReport, OutboxHandle, PendingCall,
    ReciprocalOutbox, RetryConfig,
};
pub use partition::{Partition, PartitionStore};
pub use planning::{
    Intent, IntentUpdate, Intents, NewIntent, NewProcess, Process, ProcessRecord, ProcessUpdate,
    Processes,
};
pub use projection::{ResourceProjector, StageMap, fold};
pub use record::{Address, FieldUpdate, PartitionRef, Record, RecordId, RecordTable, RevisionId};
pub use resource::{EconomicResource, ResourceRecord, ResourceSeed, ResourceUpdate};
pub use specification::{
    NewProcessSpecification, NewResourceSpecification, ProcessSpecification,
    ResourceSpecification, Specification, Specifications,
};
pub use storage::{StoreLayout, read_json_lines};
pub use store::{LedgerStore, LedgerStoreBuilder};
