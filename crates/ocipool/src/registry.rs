//! Cluster node registry access
//!
//! Resolved pool membership is written back onto node objects as annotations
//! and labels so later lookups can skip the vendor entirely. Failures here are
//! logged and ignored: the registry is a memo, not a source of truth.

use crate::models::{
    NodeRef, ANNOTATION_COMPARTMENT_ID, ANNOTATION_INSTANCE_ID, ANNOTATION_INSTANCE_POOL_ID,
    NON_POOL_MEMBER,
};
use crate::template::{LABEL_INSTANCE_TYPE, LABEL_INSTANCE_TYPE_BETA, LABEL_ZONE, LABEL_ZONE_BETA};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, PostParams};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const PROVIDER_ID_PREFIX: &str = "oci://";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} not found")]
    NotFound(String),

    #[error("node object has no name")]
    MissingName,

    #[error("kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

/// Object store holding cluster nodes
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, RegistryError>;

    async fn update_node(&self, node: &Node) -> Result<(), RegistryError>;
}

/// [`NodeRegistry`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeNodeRegistry {
    api: Api<Node>,
}

impl KubeNodeRegistry {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeRegistry for KubeNodeRegistry {
    async fn get_node(&self, name: &str) -> Result<Node, RegistryError> {
        match self.api.get(name).await {
            Ok(node) => Ok(node),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(RegistryError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_node(&self, node: &Node) -> Result<(), RegistryError> {
        let name = node
            .metadata
            .name
            .as_deref()
            .ok_or(RegistryError::MissingName)?;
        self.api.replace(name, &PostParams::default(), node).await?;
        Ok(())
    }
}

impl NodeRef {
    /// Identity of a registry node from its name, annotations, labels,
    /// addresses and provider id
    pub fn from_node(node: &Node) -> Self {
        let annotation = |key: &str| {
            node.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(key))
                .cloned()
                .unwrap_or_default()
        };
        let label = |keys: &[&str]| {
            let labels = node.metadata.labels.as_ref();
            keys.iter()
                .find_map(|key| labels.and_then(|l| l.get(*key)))
                .cloned()
                .unwrap_or_default()
        };
        let address = |kind: &str| {
            node.status
                .as_ref()
                .and_then(|s| s.addresses.as_ref())
                .and_then(|addresses| addresses.iter().find(|a| a.type_ == kind))
                .map(|a| a.address.clone())
                .unwrap_or_default()
        };

        let mut instance_id = annotation(ANNOTATION_INSTANCE_ID);
        if instance_id.is_empty() {
            instance_id = node
                .spec
                .as_ref()
                .and_then(|s| s.provider_id.as_deref())
                .map(|id| id.strip_prefix(PROVIDER_ID_PREFIX).unwrap_or(id).to_string())
                .unwrap_or_default();
        }

        NodeRef {
            name: node.metadata.name.clone().unwrap_or_default(),
            availability_domain: label(&[LABEL_ZONE, LABEL_ZONE_BETA]),
            compartment_id: annotation(ANNOTATION_COMPARTMENT_ID),
            instance_id,
            pool_id: annotation(ANNOTATION_INSTANCE_POOL_ID),
            private_ip: address("InternalIP"),
            public_ip: address("ExternalIP"),
            shape: label(&[LABEL_INSTANCE_TYPE, LABEL_INSTANCE_TYPE_BETA]),
        }
    }
}

/// Writes resolver results onto registry nodes
#[derive(Clone)]
pub struct NodeAnnotator {
    registry: Arc<dyn NodeRegistry>,
}

impl NodeAnnotator {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Record the resolved identity of `node` in one get and at most one
    /// update. Returns whether the node was updated.
    pub async fn apply_identity(&self, node: &NodeRef) -> bool {
        let mut annotations = Vec::new();
        let mut labels = Vec::new();
        for (key, value) in [
            (ANNOTATION_COMPARTMENT_ID, &node.compartment_id),
            (ANNOTATION_INSTANCE_ID, &node.instance_id),
            (ANNOTATION_INSTANCE_POOL_ID, &node.pool_id),
        ] {
            if !value.is_empty() {
                annotations.push((key, value.as_str()));
            }
        }
        for (keys, value) in [
            ([LABEL_ZONE, LABEL_ZONE_BETA], &node.availability_domain),
            ([LABEL_INSTANCE_TYPE, LABEL_INSTANCE_TYPE_BETA], &node.shape),
        ] {
            if !value.is_empty() {
                labels.extend(keys.map(|key| (key, value.as_str())));
            }
        }
        let provider_id = (!node.instance_id.is_empty()).then_some(node.instance_id.as_str());

        self.apply(&node.name, &annotations, &labels, provider_id)
            .await
    }

    /// Persist the non-member sentinel so later lookups short-circuit
    pub async fn mark_non_member(&self, name: &str) -> bool {
        self.apply(name, &[(ANNOTATION_INSTANCE_POOL_ID, NON_POOL_MEMBER)], &[], None)
            .await
    }

    async fn apply(
        &self,
        name: &str,
        annotations: &[(&str, &str)],
        labels: &[(&str, &str)],
        provider_id: Option<&str>,
    ) -> bool {
        if name.is_empty() {
            return false;
        }

        let mut node = match self.registry.get_node(name).await {
            Ok(node) => node,
            Err(e) => {
                warn!(node = %name, error = %e, "Failed to fetch node for annotation");
                return false;
            }
        };

        let mut changed = merge(&mut node.metadata.annotations, annotations);
        changed |= merge(&mut node.metadata.labels, labels);
        if let Some(provider_id) = provider_id {
            let spec = node.spec.get_or_insert_with(Default::default);
            if spec.provider_id.as_deref() != Some(provider_id) {
                spec.provider_id = Some(provider_id.to_string());
                changed = true;
            }
        }

        if !changed {
            debug!(node = %name, "Node already carries pool identity");
            return false;
        }

        match self.registry.update_node(&node).await {
            Ok(()) => {
                debug!(node = %name, "Updated node pool identity");
                true
            }
            Err(e) => {
                warn!(node = %name, error = %e, "Failed to update node annotations");
                false
            }
        }
    }
}

fn merge(target: &mut Option<BTreeMap<String, String>>, entries: &[(&str, &str)]) -> bool {
    let map = target.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (key, value) in entries {
        if map.get(*key).map(String::as_str) != Some(*value) {
            map.insert(key.to_string(), value.to_string());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory [`NodeRegistry`] counting its calls
    #[derive(Default)]
    pub struct InMemoryNodeRegistry {
        nodes: Mutex<HashMap<String, Node>>,
        pub gets: AtomicUsize,
        pub updates: AtomicUsize,
        fail_updates: std::sync::atomic::AtomicBool,
    }

    impl InMemoryNodeRegistry {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn insert(&self, node: Node) {
            let name = node.metadata.name.clone().unwrap_or_default();
            self.nodes.lock().unwrap().insert(name, node);
        }

        pub fn insert_named(&self, name: &str) {
            self.insert(Node {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            });
        }

        pub fn node(&self, name: &str) -> Option<Node> {
            self.nodes.lock().unwrap().get(name).cloned()
        }

        pub fn annotation(&self, name: &str, key: &str) -> Option<String> {
            self.node(name)
                .and_then(|n| n.metadata.annotations)
                .and_then(|a| a.get(key).cloned())
        }

        pub fn fail_updates(&self) {
            self.fail_updates.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl NodeRegistry for InMemoryNodeRegistry {
        async fn get_node(&self, name: &str) -> Result<Node, RegistryError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.node(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))
        }

        async fn update_node(&self, node: &Node) -> Result<(), RegistryError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(RegistryError::MissingName);
            }
            self.insert(node.clone());
            Ok(())
        }
    }
}
