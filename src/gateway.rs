//! Cross-partition capability calls.
//!
//! Every call from one partition into another, including calls a
//! partition makes to itself, goes through a [`PartitionGateway`]. The
//! in-process [`LocalGateway`] routes each call as a message to the target
//! partition's endpoint task and bounds the wait with a timeout, so the
//! partial-failure contract holds even when everything runs in one
//! process.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::actor::{EndpointHandle, spawn_endpoint};
use crate::error::{GatewayError, LedgerError};
use crate::link::Relation;
use crate::partition::PartitionStore;
use crate::planning::ProcessRecord;
use crate::record::{Address, PartitionRef, RecordId};
use crate::specification::Specification;

/// Named operation a partition exposes to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "capability", rename_all = "snake_case")]
pub enum Capability {
    /// Add `owner` to the reciprocal set of `relation` on `target`.
    AddReciprocal {
        relation: Relation,
        target: RecordId,
        owner: Address,
    },
    /// Remove `owner` from the reciprocal set of `relation` on `target`.
    RemoveReciprocal {
        relation: Relation,
        target: RecordId,
        owner: Address,
    },
    ResolveSpecification {
        id: RecordId,
    },
    ResolveProcess {
        id: RecordId,
    },
}

/// A capability addressed to a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityCall {
    pub partition: PartitionRef,
    #[serde(flatten)]
    pub capability: Capability,
}

impl CapabilityCall {
    pub fn new(partition: PartitionRef, capability: Capability) -> Self {
        Self {
            partition,
            capability,
        }
    }
}

/// Answer to a [`CapabilityCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Specification(Specification),
    Process(ProcessRecord),
    NotFound,
}

/// Port through which partitions reach each other.
///
/// Implementations must classify failures: unreachable peers and elapsed
/// call windows are [`GatewayError::Transient`]; refusals are
/// [`GatewayError::Permanent`].
pub trait PartitionGateway: Send + Sync {
    /// Invoke `call` on its target partition.
    fn invoke<'a>(
        &'a self,
        call: CapabilityCall,
    ) -> Pin<Box<dyn Future<Output = Result<Reply, GatewayError>> + Send + 'a>>;
}

/// Reachability of a registered partition, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionStatus {
    #[default]
    Online,
    /// Every call fails as transient.
    Unreachable,
    /// Every call fails as permanent.
    Denied,
    /// Calls are held for the given time before being sent.
    Delayed(Duration),
}

struct Route {
    endpoint: EndpointHandle,
    status: PartitionStatus,
}

/// In-process gateway over registered partition endpoints.
pub struct LocalGateway {
    routes: RwLock<HashMap<PartitionRef, Route>>,
    call_timeout: Duration,
}

impl std::fmt::Debug for LocalGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGateway")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl LocalGateway {
    /// # Arguments
    ///
    /// * `call_timeout` - Longest wait for a reply before a call is
    ///   reported as transient.
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            call_timeout,
        }
    }

    /// Start an endpoint task for `store` and route its name to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn register(&self, store: Arc<PartitionStore>) {
        let name = store.name().clone();
        let endpoint = spawn_endpoint(store);
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.insert(
            name,
            Route {
                endpoint,
                status: PartitionStatus::Online,
            },
        );
    }

    /// Change how calls to `partition` behave.
    ///
    /// # Returns
    ///
    /// `false` if no such partition is registered.
    pub fn set_status(&self, partition: &str, status: PartitionStatus) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        match routes.get_mut(&PartitionRef::from(partition)) {
            Some(route) => {
                tracing::info!(partition, ?status, "partition status changed");
                route.status = status;
                true
            }
            None => false,
        }
    }

    pub fn status(&self, partition: &str) -> Option<PartitionStatus> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes.get(&PartitionRef::from(partition)).map(|r| r.status)
    }

    /// Stop every endpoint task. Later calls fail as transient.
    pub(crate) async fn shutdown(&self) {
        let endpoints: Vec<EndpointHandle> = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            routes.values().map(|r| r.endpoint.clone()).collect()
        };
        for endpoint in endpoints {
            endpoint.shutdown().await;
        }
    }

    fn route(&self, partition: &PartitionRef) -> Option<(EndpointHandle, PartitionStatus)> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .get(partition)
            .map(|r| (r.endpoint.clone(), r.status))
    }
}

impl PartitionGateway for LocalGateway {
    fn invoke<'a>(
        &'a self,
        call: CapabilityCall,
    ) -> Pin<Box<dyn Future<Output = Result<Reply, GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let CapabilityCall {
                partition,
                capability,
            } = call;
            let Some((endpoint, status)) = self.route(&partition) else {
                return Err(GatewayError::Permanent {
                    partition: partition.to_string(),
                    reason: "unknown partition".into(),
                });
            };

            if !endpoint.is_alive() {
                return Err(GatewayError::Transient {
                    partition: partition.to_string(),
                    reason: "endpoint stopped".into(),
                });
            }

            let delay = match status {
                PartitionStatus::Online => Duration::ZERO,
                PartitionStatus::Delayed(d) => d,
                PartitionStatus::Unreachable => {
                    return Err(GatewayError::Transient {
                        partition: partition.to_string(),
                        reason: "partition unreachable".into(),
                    });
                }
                PartitionStatus::Denied => {
                    return Err(GatewayError::Permanent {
                        partition: partition.to_string(),
                        reason: "capability denied".into(),
                    });
                }
            };

            let exchange = async {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                endpoint.call(capability).await
            };

            match tokio::time::timeout(self.call_timeout, exchange).await {
                Ok(Some(reply)) => Ok(reply),
                Ok(None) => Err(GatewayError::Transient {
                    partition: partition.to_string(),
                    reason: "endpoint stopped".into(),
                }),
                Err(_elapsed) => Err(GatewayError::Transient {
                    partition: partition.to_string(),
                    reason: format!("no reply within {:?}", self.call_timeout),
                }),
            }
        })
    }
}

/// Look up a process through the gateway.
///
/// # Returns
///
/// `Ok(None)` if the owning partition has no such live process.
///
/// # Errors
///
/// Transient and permanent gateway failures, and unexpected replies.
pub(crate) async fn resolve_process(
    gateway: &dyn PartitionGateway,
    process: &Address,
) -> Result<Option<ProcessRecord>, LedgerError> {
    let call = CapabilityCall::new(
        process.partition.clone(),
        Capability::ResolveProcess {
            id: process.id.clone(),
        },
    );
    match gateway.invoke(call).await? {
        Reply::Process(record) => Ok(Some(record)),
        Reply::NotFound => {
            tracing::warn!(%process, "process not found; stage left unchanged");
            Ok(None)
        }
        other => Err(unexpected(&process.partition, &other)),
    }
}

/// Look up a specification through the gateway.
///
/// # Returns
///
/// `Ok(None)` if the owning partition has no such specification.
///
/// # Errors
///
/// Transient and permanent gateway failures, and unexpected replies.
pub(crate) async fn resolve_specification(
    gateway: &dyn PartitionGateway,
    spec: &Address,
) -> Result<Option<Specification>, LedgerError> {
    let call = CapabilityCall::new(
        spec.partition.clone(),
        Capability::ResolveSpecification {
            id: spec.id.clone(),
        },
    );
    match gateway.invoke(call).await? {
        Reply::Specification(found) => Ok(Some(found)),
        Reply::NotFound => Ok(None),
        other => Err(unexpected(&spec.partition, &other)),
    }
}

fn unexpected(partition: &PartitionRef, reply: &Reply) -> LedgerError {
    LedgerError::Permanent {
        partition: partition.to_string(),
        reason: format!("unexpected reply: {reply:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionState;
    use crate::specification::NewResourceSpecification;

    async fn gateway_with(name: &str) -> (LocalGateway, Arc<PartitionStore>) {
        let gateway = LocalGateway::new(Duration::from_millis(200));
        let store = Arc::new(PartitionStore::new(name.into(), PartitionState::default()));
        gateway.register(store.clone());
        (gateway, store)
    }

    #[tokio::test]
    async fn resolves_a_specification_in_another_partition() {
        let (gateway, store) = gateway_with("specification").await;
        let spec = store
            .write()
            .await
            .resource_specifications
            .insert(NewResourceSpecification::new("apples").unit_of_effort("kg").into_record());

        let found = resolve_specification(
            &gateway,
            &Address::new("specification", spec.revision_id.id.clone()),
        )
        .await
        .expect("resolution should succeed")
        .expect("specification should exist");
        assert_eq!(found.default_unit_of_effort(), Some("kg"));
    }

    #[tokio::test]
    async fn unknown_partition_is_permanent() {
        let gateway = LocalGateway::new(Duration::from_millis(200));
        let call = CapabilityCall::new(
            "nowhere".into(),
            Capability::ResolveProcess {
                id: RecordId::from("p"),
            },
        );
        let err = gateway.invoke(call).await.unwrap_err();
        assert!(!err.is_transient(), "expected permanent, got: {err:?}");
    }

    #[tokio::test]
    async fn injected_statuses_classify_failures() {
        let (gateway, _store) = gateway_with("planning").await;
        let call = CapabilityCall::new(
            "planning".into(),
            Capability::ResolveProcess {
                id: RecordId::from("p"),
            },
        );

        assert!(gateway.set_status("planning", PartitionStatus::Unreachable));
        let err = gateway.invoke(call.clone()).await.unwrap_err();
        assert!(err.is_transient());

        gateway.set_status("planning", PartitionStatus::Denied);
        let err = gateway.invoke(call.clone()).await.unwrap_err();
        assert!(!err.is_transient());

        gateway.set_status("planning", PartitionStatus::Online);
        let reply = gateway.invoke(call).await.expect("online call should succeed");
        assert_eq!(reply, Reply::NotFound);
    }

    #[tokio::test]
    async fn delay_beyond_timeout_is_transient() {
        let (gateway, _store) = gateway_with("planning").await;
        gateway.set_status("planning", PartitionStatus::Delayed(Duration::from_secs(5)));
        let call = CapabilityCall::new(
            "planning".into(),
            Capability::ResolveProcess {
                id: RecordId::from("p"),
            },
        );
        let err = gateway.invoke(call).await.unwrap_err();
        assert!(
            matches!(err, GatewayError::Transient { ref reason, .. } if reason.starts_with("no reply")),
            "expected timeout, got: {err:?}"
        );
    }

    #[test]
    fn calls_serialize_as_flat_tagged_messages() {
        let call = CapabilityCall::new(
            "observation".into(),
            Capability::AddReciprocal {
                relation: Relation::IntentInputOf,
                target: RecordId::from("proc-1"),
                owner: Address::new("planning", RecordId::from("intent-1")),
            },
        );
        let json = serde_json::to_value(&call).expect("serialize should succeed");
        assert_eq!(json["partition"], "observation");
        assert_eq!(json["capability"], "add_reciprocal");
        assert_eq!(json["relation"], "intent_input_of");

        let back: CapabilityCall = serde_json::from_value(json).expect("deserialize should succeed");
        assert_eq!(back, call);
    }
}
