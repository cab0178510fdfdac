//! Kubernetes Lease Adapter
//!
//! Implements the `LeaseStore` port on `coordination.k8s.io/v1` Lease
//! objects. Writes use `replace` with the observed resourceVersion so a
//! concurrent writer surfaces as a 409 conflict.
//!
//! The last object read or written per lease is kept, and updates are applied
//! onto it. Only holder, transitions and the two timestamps change; labels,
//! owner references and other spec fields go back to the API untouched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::Client;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::domain::{LeaseRecord, LeaseStore};
use crate::error::{Error, Result};

/// Lease store backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeLeaseStore {
    client: Client,
    namespace: String,
    observed: Arc<Mutex<HashMap<String, Lease>>>,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            observed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn remember(&self, name: &str, lease: &Lease) {
        self.observed.lock().insert(name.to_string(), lease.clone());
    }

    async fn fetch(&self, name: &str) -> Result<Lease> {
        match self.leases_api().get(name).await {
            Ok(lease) => {
                self.remember(name, &lease);
                Ok(lease)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::Lease(format!(
                "lease {}/{} not found",
                self.namespace, name
            ))),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    fn leases_api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Convert a Lease object to the domain record.
    fn from_lease(name: &str, lease: &Lease) -> LeaseRecord {
        let spec = lease.spec.clone().unwrap_or_default();
        LeaseRecord {
            name: lease.metadata.name.clone().unwrap_or_else(|| name.to_string()),
            holder_identity: spec.holder_identity.unwrap_or_default(),
            acquire_time: spec.acquire_time.map(|t| t.0),
            renew_time: spec.renew_time.map(|t| t.0),
            lease_transitions: spec.lease_transitions.unwrap_or(0),
            lease_duration_seconds: spec.lease_duration_seconds,
            resource_version: lease.metadata.resource_version.clone(),
        }
    }

    /// Apply the record onto a previously observed Lease object.
    fn apply(mut lease: Lease, record: &LeaseRecord) -> Lease {
        lease.metadata.resource_version = record.resource_version.clone();
        let mut spec = lease.spec.take().unwrap_or_default();
        spec.holder_identity = Some(record.holder_identity.clone());
        spec.acquire_time = record.acquire_time.map(MicroTime);
        spec.renew_time = record.renew_time.map(MicroTime);
        spec.lease_transitions = Some(record.lease_transitions);
        if record.lease_duration_seconds.is_some() {
            spec.lease_duration_seconds = record.lease_duration_seconds;
        }
        lease.spec = Some(spec);
        lease
    }
}

impl std::fmt::Debug for KubeLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeaseStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<LeaseRecord> {
        let lease = self.fetch(name).await?;
        Ok(Self::from_lease(name, &lease))
    }

    #[instrument(skip(self, record), fields(lease = %record.name, holder = %record.holder_identity))]
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        let observed = self.observed.lock().get(&record.name).cloned();
        let base = match observed {
            Some(lease) => lease,
            None => self.fetch(&record.name).await?,
        };
        let lease = Self::apply(base, record);
        match self
            .leases_api()
            .replace(&record.name, &PostParams::default(), &lease)
            .await
        {
            Ok(updated) => {
                debug!(
                    resource_version = ?updated.metadata.resource_version,
                    "Updated lease"
                );
                self.remember(&record.name, &updated);
                Ok(Self::from_lease(&record.name, &updated))
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::LeaseConflict {
                name: record.name.clone(),
            }),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::Lease(format!(
                "lease {}/{} not found",
                self.namespace, record.name
            ))),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}

/// Look up the node a pod is scheduled on.
#[instrument(skip(client))]
pub async fn pod_node_name(client: Client, namespace: &str, pod: &str) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let pod_obj = pods.get(pod).await?;
    pod_obj
        .spec
        .and_then(|spec| spec.node_name)
        .filter(|node| !node.is_empty())
        .ok_or_else(|| Error::Config(format!("pod {}/{} has no node assigned", namespace, pod)))
}
