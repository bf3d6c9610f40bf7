//! Delivery of reciprocal link writes to their target partitions.
//!
//! The owner side of a link commits locally; the reciprocal half is a
//! [`CapabilityCall`] handed to the [`ReciprocalOutbox`]. The outbox tries
//! the call right away. A transient failure queues it for retry with
//! exponential backoff. A permanent failure is never retried: it is kept
//! in [`failures`](ReciprocalOutbox::failures), appended to the
//! dead-letter log, and logged at error level.
//!
//! Calls are delivered FIFO per target partition. Writers stage their calls
//! with [`stage`](ReciprocalOutbox::stage) while still holding the owning
//! partition's write lock, so queue order is commit order. Delivery then
//! drains each lane from its head: an add can never overtake the remove
//! that followed it, and a call backing off holds back later calls to the
//! same partition.
//!
//! Retrying happens in [`flush`](ReciprocalOutbox::flush) (everything, now),
//! [`retry_due`](ReciprocalOutbox::retry_due) (only calls whose backoff has
//! elapsed), or a background worker started by
//! [`spawn_worker`](ReciprocalOutbox::spawn_worker).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{GatewayError, LedgerError};
use crate::gateway::{Capability, CapabilityCall, PartitionGateway, Reply};
use crate::record::PartitionRef;
use crate::storage::{StoreLayout, append_json_line, read_json, write_json_atomic};

/// Retry tuning for the outbox.
///
/// # Examples
///
/// ```
/// use rea_ledger::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig {
///     max_attempts: Some(10),
///     ..RetryConfig::default()
/// };
/// assert_eq!(config.backoff(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Wait before the first retry. Doubles per further attempt.
    pub base_delay: Duration,
    /// Upper bound on the wait between attempts.
    pub max_delay: Duration,
    /// Attempts after which a call is dead-lettered. `None` retries until
    /// the call is delivered or abandoned.
    pub max_attempts: Option<u32>,
    /// How often the background worker looks for due calls.
    pub poll_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Wait after the `attempts`-th failed attempt: `base_delay * 2^(attempts - 1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Identifier of a call handed to the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Uuid);

impl CallId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A call waiting for redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCall {
    pub id: CallId,
    pub call: CapabilityCall,
    /// Failed attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Not persisted; a reloaded call is due immediately.
    #[serde(skip)]
    due: Option<Instant>,
}

impl PendingCall {
    fn is_due(&self, now: Instant) -> bool {
        self.due.is_none_or(|due| due <= now)
    }
}

/// A call that will not be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub call_id: CallId,
    pub call: CapabilityCall,
    pub error: String,
}

/// One line of the dead-letter log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub call_id: CallId,
    pub call: CapabilityCall,
    pub attempts: u32,
    pub error: String,
    /// Seconds since the Unix epoch.
    pub ts: u64,
}

/// Outcome of handing a call to the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The target acknowledged the call.
    Delivered,
    /// The call is waiting for redelivery.
    Queued(CallId),
    /// The call failed permanently and was dead-lettered.
    Failed(CallId),
}

/// Summary of a [`flush`](ReciprocalOutbox::flush) or
/// [`retry_due`](ReciprocalOutbox::retry_due) pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Calls delivered during the pass.
    pub delivered: usize,
    /// Calls still queued after the pass.
    pub remaining: usize,
    /// Calls dead-lettered during the pass.
    pub dead_lettered: usize,
}

enum Outcome {
    Delivered,
    Retry(String),
    Fail(String),
}

/// Calls staged under a partition lock and not yet driven to delivery.
///
/// Pass to [`ReciprocalOutbox::deliver`] once the lock is released.
#[derive(Debug, Default)]
#[must_use = "staged calls are only attempted once delivered"]
pub(crate) struct Staged {
    ids: Vec<CallId>,
    partitions: Vec<PartitionRef>,
}

#[derive(Default)]
struct OutboxState {
    pending: VecDeque<PendingCall>,
    failures: Vec<DeliveryFailure>,
}

struct Inner {
    gateway: Arc<dyn PartitionGateway>,
    config: RetryConfig,
    layout: Option<StoreLayout>,
    state: Mutex<OutboxState>,
    /// Serializes delivery per target partition.
    lanes: Mutex<HashMap<PartitionRef, Arc<tokio::sync::Mutex<()>>>>,
}

/// Queue of reciprocal calls with at-least-once delivery.
///
/// `Clone` is cheap: clones share one queue.
#[derive(Clone)]
pub struct ReciprocalOutbox {
    inner: Arc<Inner>,
}

impl fmt::Debug for ReciprocalOutbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReciprocalOutbox")
            .field("config", &self.inner.config)
            .field("pending", &self.lock_state().pending.len())
            .finish_non_exhaustive()
    }
}

impl ReciprocalOutbox {
    /// Create an outbox, reloading queued calls from `layout` if given.
    ///
    /// A corrupt queue file is logged and treated as empty.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] for unexpected I/O failures while
    /// reading the queue file.
    pub(crate) fn open(
        gateway: Arc<dyn PartitionGateway>,
        config: RetryConfig,
        layout: Option<StoreLayout>,
    ) -> Result<Self, LedgerError> {
        let pending: VecDeque<PendingCall> = match &layout {
            Some(layout) => read_json(&layout.outbox_pending())?.unwrap_or_default(),
            None => VecDeque::new(),
        };
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "reloaded undelivered reciprocal calls");
        }
        Ok(Self {
            inner: Arc::new(Inner {
                gateway,
                config,
                layout,
                state: Mutex::new(OutboxState {
                    pending,
                    failures: Vec::new(),
                }),
                lanes: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Deliver `call`, queueing it if the target cannot be reached.
    ///
    /// Never returns an error: the caller's local write has already
    /// committed, and delivery problems surface through
    /// [`pending`](Self::pending) and [`failures`](Self::failures).
    pub async fn dispatch(&self, call: CapabilityCall) -> Delivery {
        let staged = self.stage(vec![call]);
        let ids = staged.ids.clone();
        self.deliver(staged).await;

        let state = self.lock_state();
        match ids.first() {
            Some(&id) if state.pending.iter().any(|p| p.id == id) => Delivery::Queued(id),
            Some(&id) if state.failures.iter().any(|f| f.call_id == id) => Delivery::Failed(id),
            _ => Delivery::Delivered,
        }
    }

    /// Append `calls` to the queue without attempting them.
    ///
    /// Call while holding the owning partition's write lock: calls to one
    /// target partition are delivered in the order they were staged.
    pub(crate) fn stage(&self, calls: Vec<CapabilityCall>) -> Staged {
        let mut staged = Staged::default();
        if calls.is_empty() {
            return staged;
        }
        {
            let mut state = self.lock_state();
            for call in calls {
                let id = CallId::new();
                if !staged.partitions.contains(&call.partition) {
                    staged.partitions.push(call.partition.clone());
                }
                staged.ids.push(id);
                state.pending.push_back(PendingCall {
                    id,
                    call,
                    attempts: 0,
                    last_error: None,
                    due: None,
                });
            }
        }
        self.persist();
        staged
    }

    /// Drive the lanes of `staged` calls. A lane stops at a call that is
    /// still backing off; staged calls behind it stay queued.
    pub(crate) async fn deliver(&self, staged: Staged) -> FlushReport {
        let mut report = FlushReport::default();
        for partition in &staged.partitions {
            self.drain_lane(partition, false, &mut report).await;
        }
        report.remaining = self.lock_state().pending.len();
        report
    }

    /// Retry every queued call now, ignoring backoff.
    ///
    /// A partition's lane stops at its first transient failure, keeping
    /// later calls to it behind that one.
    pub async fn flush(&self) -> FlushReport {
        self.drain(true).await
    }

    /// Retry queued calls whose backoff has elapsed.
    pub async fn retry_due(&self) -> FlushReport {
        self.drain(false).await
    }

    /// Calls waiting for redelivery, oldest first.
    pub fn pending(&self) -> Vec<PendingCall> {
        self.lock_state().pending.iter().cloned().collect()
    }

    /// Calls that failed permanently since this outbox was opened.
    pub fn failures(&self) -> Vec<DeliveryFailure> {
        self.lock_state().failures.clone()
    }

    /// Give up on a queued call. It is dead-lettered and never retried.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if no queued call has this id.
    pub fn abandon(&self, id: CallId) -> Result<PendingCall, LedgerError> {
        let pending = self
            .take(id)
            .ok_or_else(|| LedgerError::not_found("pending_call", id))?;
        self.dead_letter(
            pending.id,
            pending.call.clone(),
            pending.attempts,
            "abandoned by operator".to_string(),
        );
        Ok(pending)
    }

    /// Start a task that calls [`retry_due`](Self::retry_due) every
    /// `poll_interval` until [`OutboxHandle::shutdown`] is called.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_worker(&self) -> OutboxHandle {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(run_retry_loop(self.clone(), shutdown_rx));
        OutboxHandle {
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    async fn drain(&self, force: bool) -> FlushReport {
        let partitions: Vec<PartitionRef> = {
            let state = self.lock_state();
            let mut seen = Vec::new();
            for p in &state.pending {
                if !seen.contains(&p.call.partition) {
                    seen.push(p.call.partition.clone());
                }
            }
            seen
        };

        let mut report = FlushReport::default();
        for partition in partitions {
            self.drain_lane(&partition, force, &mut report).await;
        }
        report.remaining = self.lock_state().pending.len();
        report
    }

    async fn drain_lane(&self, partition: &PartitionRef, force: bool, report: &mut FlushReport) {
        let lane = self.lane(partition);
        let _guard = lane.lock().await;

        loop {
            let next = self
                .lock_state()
                .pending
                .iter()
                .find(|p| &p.call.partition == partition)
                .cloned();
            let Some(pending) = next else { break };
            if !force && !pending.is_due(Instant::now()) {
                break;
            }

            match self.attempt(&pending.call).await {
                Outcome::Delivered => {
                    if self.take(pending.id).is_some() {
                        report.delivered += 1;
                        if pending.attempts > 0 {
                            tracing::info!(
                                %partition,
                                call_id = %pending.id,
                                attempts = pending.attempts + 1,
                                "reciprocal call delivered on retry"
                            );
                        }
                    }
                }
                Outcome::Retry(reason) => {
                    let attempts = pending.attempts + 1;
                    if self
                        .inner
                        .config
                        .max_attempts
                        .is_some_and(|max| attempts >= max)
                    {
                        if self.take(pending.id).is_some() {
                            self.dead_letter(
                                pending.id,
                                pending.call,
                                attempts,
                                format!("gave up after {attempts} attempts: {reason}"),
                            );
                            report.dead_lettered += 1;
                        }
                        continue;
                    }
                    tracing::warn!(
                        %partition,
                        call_id = %pending.id,
                        attempts,
                        error = %reason,
                        "reciprocal call failed transiently; queued for retry"
                    );
                    self.reschedule(pending.id, attempts, reason);
                    break;
                }
                Outcome::Fail(reason) => {
                    if self.take(pending.id).is_some() {
                        self.dead_letter(pending.id, pending.call, pending.attempts + 1, reason);
                        report.dead_lettered += 1;
                    }
                }
            }
        }
    }

    async fn attempt(&self, call: &CapabilityCall) -> Outcome {
        match self.inner.gateway.invoke(call.clone()).await {
            Ok(Reply::Ack) => Outcome::Delivered,
            // The membership is already gone.
            Ok(Reply::NotFound) if matches!(call.capability, Capability::RemoveReciprocal { .. }) => {
                Outcome::Delivered
            }
            Ok(Reply::NotFound) => Outcome::Fail("target record not found".to_string()),
            Ok(other) => Outcome::Fail(format!("unexpected reply: {other:?}")),
            Err(e @ GatewayError::Transient { .. }) => Outcome::Retry(e.to_string()),
            Err(e @ GatewayError::Permanent { .. }) => Outcome::Fail(e.to_string()),
        }
    }

    fn take(&self, id: CallId) -> Option<PendingCall> {
        let taken = {
            let mut state = self.lock_state();
            let pos = state.pending.iter().position(|p| p.id == id)?;
            state.pending.remove(pos)
        };
        self.persist();
        taken
    }

    fn reschedule(&self, id: CallId, attempts: u32, reason: String) {
        {
            let mut state = self.lock_state();
            if let Some(p) = state.pending.iter_mut().find(|p| p.id == id) {
                p.attempts = attempts;
                p.last_error = Some(reason);
                p.due = Some(Instant::now() + self.inner.config.backoff(attempts));
            }
        }
        self.persist();
    }

    fn dead_letter(&self, call_id: CallId, call: CapabilityCall, attempts: u32, error: String) {
        tracing::error!(
            partition = %call.partition,
            %call_id,
            attempts,
            error = %error,
            "reciprocal call will not be delivered"
        );
        if let Some(layout) = &self.inner.layout {
            let entry = DeadLetter {
                call_id,
                call: call.clone(),
                attempts,
                error: error.clone(),
                ts: unix_secs(),
            };
            if let Err(e) = append_json_line(&layout.dead_letters(), &entry) {
                tracing::error!(%call_id, error = %e, "failed to write dead letter");
            }
        }
        self.lock_state().failures.push(DeliveryFailure {
            call_id,
            call,
            error,
        });
    }

    /// Rewrite the queue file. Failures are logged; the in-memory queue
    /// stays authoritative.
    ///
    /// The state lock is held across the snapshot and the write, so the
    /// last file written always holds the newest queue.
    fn persist(&self) {
        let Some(layout) = &self.inner.layout else {
            return;
        };
        let state = self.lock_state();
        if let Err(e) = write_json_atomic(&layout.outbox_pending(), &state.pending) {
            tracing::warn!(error = %e, "failed to persist outbox queue");
        }
    }

    fn lane(&self, partition: &PartitionRef) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self
            .inner
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        lanes.entry(partition.clone()).or_default().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, OutboxState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unix_secs() -> u64 {
    std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Handle to the background retry worker.
///
/// Dropping the handle does **not** stop the worker; call
/// [`shutdown`](OutboxHandle::shutdown).
#[derive(Debug, Clone)]
pub struct OutboxHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl OutboxHandle {
    /// Stop the worker and wait for it to exit. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if the worker task panicked.
    pub async fn shutdown(&self) -> Result<(), LedgerError> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.await
                .map_err(|e| io::Error::other(format!("outbox worker panicked: {e}")))?;
        }
        Ok(())
    }
}

async fn run_retry_loop(outbox: ReciprocalOutbox, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(outbox.inner.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let report = outbox.retry_due().await;
                if report.delivered > 0 || report.dead_lettered > 0 {
                    tracing::debug!(
                        delivered = report.delivered,
                        dead_lettered = report.dead_lettered,
                        remaining = report.remaining,
                        "outbox retry pass"
                    );
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    tracing::debug!("outbox worker stopped");
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use super::*;
    use crate::link::Relation;
    use crate::record::{Address, RecordId};
    use crate::storage::read_json_lines;

    /// Gateway that answers from a script, then acks.
    #[derive(Default)]
    struct ScriptedGateway {
        script: Mutex<VecDeque<Result<Reply, GatewayError>>>,
        seen: Mutex<Vec<CapabilityCall>>,
    }

    impl ScriptedGateway {
        fn with(script: Vec<Result<Reply, GatewayError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                seen: Mutex::default(),
            })
        }

        fn seen(&self) -> Vec<CapabilityCall> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl PartitionGateway for ScriptedGateway {
        fn invoke<'a>(
            &'a self,
            call: CapabilityCall,
        ) -> Pin<Box<dyn Future<Output = Result<Reply, GatewayError>> + Send + 'a>> {
            self.seen.lock().unwrap().push(call);
            let next = self.script.lock().unwrap().pop_front();
            Box::pin(async move { next.unwrap_or(Ok(Reply::Ack)) })
        }
    }

    fn transient() -> Result<Reply, GatewayError> {
        Err(GatewayError::Transient {
            partition: "observation".into(),
            reason: "unreachable".into(),
        })
    }

    fn add(target: &str) -> CapabilityCall {
        CapabilityCall::new(
            "observation".into(),
            Capability::AddReciprocal {
                relation: Relation::IntentInputOf,
                target: RecordId::from(target),
                owner: Address::new("planning", RecordId::from("intent-1")),
            },
        )
    }

    fn remove(target: &str) -> CapabilityCall {
        CapabilityCall::new(
            "observation".into(),
            Capability::RemoveReciprocal {
                relation: Relation::IntentInputOf,
                target: RecordId::from(target),
                owner: Address::new("planning", RecordId::from("intent-1")),
            },
        )
    }

    fn outbox(gateway: Arc<ScriptedGateway>) -> ReciprocalOutbox {
        ReciprocalOutbox::open(gateway, RetryConfig::default(), None).expect("open should succeed")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..RetryConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(5), Duration::from_secs(1));
        assert_eq!(config.backoff(100), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn acked_call_is_delivered_inline() {
        let gateway = ScriptedGateway::with(vec![]);
        let outbox = outbox(gateway.clone());

        assert_eq!(outbox.dispatch(add("p1")).await, Delivery::Delivered);
        assert!(outbox.pending().is_empty());
        assert_eq!(gateway.seen().len(), 1);
    }

    #[tokio::test]
    async fn later_calls_queue_behind_a_transient_failure() {
        let gateway = ScriptedGateway::with(vec![transient()]);
        let outbox = outbox(gateway.clone());

        let first = outbox.dispatch(add("p1")).await;
        let second = outbox.dispatch(remove("p1")).await;
        assert!(matches!(first, Delivery::Queued(_)));
        assert!(matches!(second, Delivery::Queued(_)));
        // The remove was never attempted ahead of the add.
        assert_eq!(gateway.seen().len(), 1);

        let report = outbox.flush().await;
        assert_eq!(
            report,
            FlushReport {
                delivered: 2,
                remaining: 0,
                dead_lettered: 0
            }
        );
        let seen = gateway.seen();
        assert_eq!(seen[1], add("p1"));
        assert_eq!(seen[2], remove("p1"));
    }

    #[tokio::test]
    async fn retry_due_respects_backoff() {
        let gateway = ScriptedGateway::with(vec![transient()]);
        let outbox = ReciprocalOutbox::open(
            gateway,
            RetryConfig {
                base_delay: Duration::from_secs(60),
                ..RetryConfig::default()
            },
            None,
        )
        .expect("open should succeed");

        outbox.dispatch(add("p1")).await;
        let report = outbox.retry_due().await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.remaining, 1);

        let report = outbox.flush().await;
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn not_found_on_remove_counts_as_delivered() {
        let gateway = ScriptedGateway::with(vec![Ok(Reply::NotFound)]);
        let outbox = outbox(gateway);
        assert_eq!(outbox.dispatch(remove("gone")).await, Delivery::Delivered);
        assert!(outbox.failures().is_empty());
    }

    #[tokio::test]
    async fn permanent_failures_are_dead_lettered() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let layout = StoreLayout::new(tmp.path());
        let gateway = ScriptedGateway::with(vec![
            Err(GatewayError::Permanent {
                partition: "observation".into(),
                reason: "denied".into(),
            }),
            Ok(Reply::NotFound),
        ]);
        let outbox = ReciprocalOutbox::open(gateway, RetryConfig::default(), Some(layout.clone()))
            .expect("open should succeed");

        assert!(matches!(outbox.dispatch(add("p1")).await, Delivery::Failed(_)));
        assert!(matches!(outbox.dispatch(add("missing")).await, Delivery::Failed(_)));
        assert!(outbox.pending().is_empty());

        let failures = outbox.failures();
        assert_eq!(failures.len(), 2);
        assert!(failures[1].error.contains("not found"), "got: {}", failures[1].error);

        let letters: Vec<DeadLetter> =
            read_json_lines(&layout.dead_letters()).expect("dead letters should read");
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].call, add("p1"));
    }

    #[tokio::test]
    async fn max_attempts_dead_letters_on_retry() {
        let gateway = ScriptedGateway::with(vec![transient(), transient()]);
        let outbox = ReciprocalOutbox::open(
            gateway,
            RetryConfig {
                max_attempts: Some(2),
                ..RetryConfig::default()
            },
            None,
        )
        .expect("open should succeed");

        outbox.dispatch(add("p1")).await;
        let report = outbox.flush().await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.remaining, 0);
        assert!(outbox.failures()[0].error.contains("gave up after 2 attempts"));
    }

    #[tokio::test]
    async fn abandon_removes_a_queued_call() {
        let gateway = ScriptedGateway::with(vec![transient()]);
        let outbox = outbox(gateway);

        let Delivery::Queued(id) = outbox.dispatch(add("p1")).await else {
            panic!("expected the call to be queued");
        };
        let abandoned = outbox.abandon(id).expect("call should be pending");
        assert_eq!(abandoned.call, add("p1"));
        assert!(outbox.pending().is_empty());
        assert_eq!(outbox.failures()[0].error, "abandoned by operator");

        let err = outbox.abandon(id).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn queue_survives_reopen() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let layout = StoreLayout::new(tmp.path());
        {
            let gateway = ScriptedGateway::with(vec![transient()]);
            let outbox =
                ReciprocalOutbox::open(gateway, RetryConfig::default(), Some(layout.clone()))
                    .expect("open should succeed");
            outbox.dispatch(remove("p1")).await;
        }

        let gateway = ScriptedGateway::with(vec![]);
        let outbox = ReciprocalOutbox::open(gateway.clone(), RetryConfig::default(), Some(layout))
            .expect("reopen should succeed");
        let pending = outbox.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].call, remove("p1"));
        assert_eq!(pending[0].attempts, 1);

        // Reloaded calls are due at once.
        assert_eq!(outbox.retry_due().await.delivered, 1);
        assert_eq!(gateway.seen(), vec![remove("p1")]);
    }

    #[tokio::test]
    async fn staged_calls_deliver_in_staging_order() {
        let gateway = ScriptedGateway::with(vec![]);
        let outbox = outbox(gateway.clone());

        // The add commits first, but its writer is slower to deliver.
        let add_staged = outbox.stage(vec![add("p1")]);
        let remove_staged = outbox.stage(vec![remove("p1")]);
        assert_eq!(outbox.pending().len(), 2);

        let report = outbox.deliver(remove_staged).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.remaining, 0);
        let report = outbox.deliver(add_staged).await;
        assert_eq!(report.delivered, 0);

        assert_eq!(gateway.seen(), vec![add("p1"), remove("p1")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_queueing_persists_every_call() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let layout = StoreLayout::new(tmp.path());
        let lanes = 16;
        let gateway = ScriptedGateway::with((0..lanes).map(|_| transient()).collect());
        let outbox = ReciprocalOutbox::open(gateway, RetryConfig::default(), Some(layout.clone()))
            .expect("open should succeed");

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..lanes {
            let outbox = outbox.clone();
            tasks.spawn(async move {
                let call = CapabilityCall::new(
                    PartitionRef::new(format!("partition-{i}")),
                    Capability::RemoveReciprocal {
                        relation: Relation::IntentInputOf,
                        target: RecordId::from("p1"),
                        owner: Address::new("planning", RecordId::from("intent-1")),
                    },
                );
                outbox.dispatch(call).await
            });
        }
        while let Some(delivery) = tasks.join_next().await {
            let delivery = delivery.expect("dispatch task should not panic");
            assert!(matches!(delivery, Delivery::Queued(_)), "got: {delivery:?}");
        }
        assert_eq!(outbox.pending().len(), lanes);

        let reopened = ReciprocalOutbox::open(
            ScriptedGateway::with(vec![]),
            RetryConfig::default(),
            Some(layout),
        )
        .expect("reopen should succeed");
        assert_eq!(reopened.pending().len(), lanes);
    }

    #[tokio::test]
    async fn worker_retries_in_background_and_shuts_down_twice() {
        let gateway = ScriptedGateway::with(vec![transient()]);
        let outbox = ReciprocalOutbox::open(
            gateway,
            RetryConfig {
                base_delay: Duration::from_millis(10),
                poll_interval: Duration::from_millis(10),
                ..RetryConfig::default()
            },
            None,
        )
        .expect("open should succeed");
        let worker = outbox.spawn_worker();

        outbox.dispatch(add("p1")).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !outbox.pending().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(outbox.pending().is_empty(), "worker should deliver the call");

        worker.shutdown().await.expect("first shutdown");
        worker.shutdown().await.expect("second shutdown");
    }
}
