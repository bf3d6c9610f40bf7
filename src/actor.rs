//! Endpoint task that serves capability calls for one partition.
//!
//! Each registered partition gets a task that receives calls over an
//! `mpsc` channel and answers each on its own `oneshot`. Calls are handled
//! one at a time in arrival order, which gives every peer FIFO delivery
//! into the partition.
//!
//! Crate-internal: [`EndpointHandle`] (cloneable sender) and
//! [`spawn_endpoint`] (starts the task).

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::gateway::{Capability, Reply};
use crate::partition::PartitionStore;

/// Channel capacity per endpoint.
const ENDPOINT_QUEUE: usize = 64;

/// Messages sent from an [`EndpointHandle`] to the endpoint task.
pub(crate) enum EndpointMessage {
    /// Apply a capability and answer on `reply`.
    Invoke {
        capability: Capability,
        reply: oneshot::Sender<Reply>,
    },

    /// Stop serving. Calls already queued behind this message are dropped.
    Shutdown,
}

/// Runs the endpoint loop until the channel closes or `Shutdown` arrives.
///
/// # Arguments
///
/// * `store` - The partition this endpoint serves.
/// * `rx` - Receiving end of the endpoint channel.
async fn run_endpoint(store: Arc<PartitionStore>, mut rx: mpsc::Receiver<EndpointMessage>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            EndpointMessage::Invoke { capability, reply } => {
                let span = tracing::debug_span!("capability", partition = %store.name());
                let answer = store.handle(capability).instrument(span).await;
                // The caller may have timed out and dropped its receiver.
                let _ = reply.send(answer);
            }
            EndpointMessage::Shutdown => break,
        }
    }
    tracing::debug!(partition = %store.name(), "endpoint stopped");
}

/// Cloneable sender half of a partition endpoint.
#[derive(Debug, Clone)]
pub(crate) struct EndpointHandle {
    sender: mpsc::Sender<EndpointMessage>,
}

impl EndpointHandle {
    /// Send `capability` and wait for the answer.
    ///
    /// # Returns
    ///
    /// `None` if the endpoint task has stopped.
    pub(crate) async fn call(&self, capability: Capability) -> Option<Reply> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EndpointMessage::Invoke {
                capability,
                reply: tx,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Ask the endpoint to stop. Safe to call more than once.
    pub(crate) async fn shutdown(&self) {
        let _ = self.sender.send(EndpointMessage::Shutdown).await;
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Start the endpoint task for `store`.
///
/// Must be called from within a Tokio runtime.
pub(crate) fn spawn_endpoint(store: Arc<PartitionStore>) -> EndpointHandle {
    let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE);
    tokio::spawn(run_endpoint(store, rx));
    EndpointHandle { sender: tx }
}
