//! Top-level ledger store wiring the three partitions together.
//!
//! `LedgerStore` is the primary entry point. It owns the `observation`,
//! `planning` and `specification` partitions, the [`LocalGateway`] that
//! routes calls between them, and the [`ReciprocalOutbox`] that delivers
//! cross-partition link writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::LedgerError;
use crate::gateway::{LocalGateway, PartitionGateway};
use crate::outbox::{OutboxHandle, ReciprocalOutbox, RetryConfig};
use crate::partition::{Partition, PartitionStore};
use crate::record::PartitionRef;
use crate::snapshot::{load_partition, save_partition};
use crate::storage::StoreLayout;

/// Default window for a partition call before it counts as transient.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// The three wired partitions with their gateway and outbox.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped or handles.
#[derive(Clone, Debug)]
pub struct LedgerStore {
    gateway: Arc<LocalGateway>,
    outbox: ReciprocalOutbox,
    worker: Option<OutboxHandle>,
    observation: Partition,
    planning: Partition,
    specification: Partition,
    layout: Option<StoreLayout>,
}

impl LedgerStore {
    /// Create a builder for configuring and opening a store.
    pub fn builder() -> LedgerStoreBuilder {
        LedgerStoreBuilder::new()
    }

    /// Events, resources and processes.
    pub fn observation(&self) -> &Partition {
        &self.observation
    }

    /// Intents.
    pub fn planning(&self) -> &Partition {
        &self.planning
    }

    /// Process and resource specifications.
    pub fn specification(&self) -> &Partition {
        &self.specification
    }

    /// The gateway, for status injection.
    pub fn gateway(&self) -> &LocalGateway {
        &self.gateway
    }

    pub fn outbox(&self) -> &ReciprocalOutbox {
        &self.outbox
    }

    /// Persist every partition to `base_dir`. A no-op for in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if a snapshot cannot be written.
    pub async fn save(&self) -> Result<(), LedgerError> {
        let Some(layout) = &self.layout else {
            return Ok(());
        };
        for partition in [&self.observation, &self.planning, &self.specification] {
            save_partition(layout, partition.store()).await?;
        }
        tracing::info!(base_dir = %layout.base_dir().display(), "ledger saved");
        Ok(())
    }

    /// Stop the retry worker and the partition endpoints, then save.
    ///
    /// Queued reciprocal calls stay queued (and persisted, with a
    /// `base_dir`) for the next open.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if the worker panicked or a snapshot
    /// cannot be written.
    pub async fn shutdown(&self) -> Result<(), LedgerError> {
        if let Some(worker) = &self.worker {
            worker.shutdown().await?;
        }
        self.gateway.shutdown().await;
        self.save().await
    }
}

/// Builder for configuring and opening a [`LedgerStore`].
///
/// # Examples
///
/// ```no_run
/// use rea_ledger::LedgerStore;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), rea_ledger::LedgerError> {
/// let store = LedgerStore::builder()
///     .base_dir("/tmp/ledger")
///     .call_timeout(Duration::from_secs(2))
///     .open()
///     .await?;
/// # store.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LedgerStoreBuilder {
    base_dir: Option<PathBuf>,
    call_timeout: Duration,
    retry_config: RetryConfig,
    spawn_retry_worker: bool,
}

impl LedgerStoreBuilder {
    /// Create a builder for an in-memory store with default settings.
    pub fn new() -> Self {
        Self {
            base_dir: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            retry_config: RetryConfig::default(),
            spawn_retry_worker: true,
        }
    }

    /// Persist snapshots and the outbox queue under `path`.
    ///
    /// Without a base directory the store lives in memory only.
    pub fn base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.base_dir = Some(path.as_ref().to_owned());
        self
    }

    /// Longest wait for a partition call before it counts as transient.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Whether to run the background retry worker. Defaults to `true`.
    ///
    /// Without it, queued calls are only retried by
    /// [`ReciprocalOutbox::flush`] and [`ReciprocalOutbox::retry_due`].
    pub fn spawn_retry_worker(mut self, spawn: bool) -> Self {
        self.spawn_retry_worker = spawn;
        self
    }

    /// Load snapshots, start the partition endpoints and the outbox.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] for unexpected I/O failures while
    /// reading snapshots or the outbox queue. Corrupt files are logged and
    /// ignored.
    pub async fn open(self) -> Result<LedgerStore, LedgerError> {
        let layout = self.base_dir.map(StoreLayout::new);
        let gateway = Arc::new(LocalGateway::new(self.call_timeout));

        let open_store = |name: &str| -> Result<Arc<PartitionStore>, LedgerError> {
            let state = match &layout {
                Some(layout) => load_partition(layout, name)?,
                None => Default::default(),
            };
            let store = Arc::new(PartitionStore::new(PartitionRef::new(name), state));
            gateway.register(store.clone());
            Ok(store)
        };
        let observation = open_store(PartitionRef::OBSERVATION)?;
        let planning = open_store(PartitionRef::PLANNING)?;
        let specification = open_store(PartitionRef::SPECIFICATION)?;

        let dyn_gateway: Arc<dyn PartitionGateway> = gateway.clone();
        let outbox = ReciprocalOutbox::open(dyn_gateway.clone(), self.retry_config, layout.clone())?;
        let worker = self.spawn_retry_worker.then(|| outbox.spawn_worker());
        let partition = |store| Partition::new(store, dyn_gateway.clone(), outbox.clone());
        let (observation, planning, specification) =
            (partition(observation), partition(planning), partition(specification));

        tracing::info!(
            base_dir = ?layout.as_ref().map(|l| l.base_dir().display().to_string()),
            pending = outbox.pending().len(),
            "ledger store opened"
        );

        Ok(LedgerStore {
            gateway,
            outbox,
            worker,
            observation,
            planning,
            specification,
            layout,
        })
    }
}

impl Default for LedgerStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
