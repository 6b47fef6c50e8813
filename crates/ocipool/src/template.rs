//! Template nodes for scale-up simulation
//!
//! The autoscaler needs a representative node for a pool that may have no
//! members yet. The template carries the member shape as capacity, the pool's
//! placement as zone labels and the pool identity as annotations.

use crate::error::{PoolError, Result};
use crate::models::{
    Shape, ANNOTATION_COMPARTMENT_ID, ANNOTATION_INSTANCE_ID, ANNOTATION_INSTANCE_POOL_ID,
    RESOURCE_GPU,
};
use crate::shape::ShapeResolver;
use crate::vendor::InstancePool;
use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus, Taint};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

pub const MAX_PODS: u32 = 110;

pub const LABEL_ARCH: &str = "kubernetes.io/arch";
pub const LABEL_OS: &str = "kubernetes.io/os";
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
pub const LABEL_INSTANCE_TYPE_BETA: &str = "beta.kubernetes.io/instance-type";
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_ZONE_BETA: &str = "failure-domain.beta.kubernetes.io/zone";
pub const LABEL_REGION: &str = "topology.kubernetes.io/region";
pub const LABEL_REGION_BETA: &str = "failure-domain.beta.kubernetes.io/region";

const DEFAULT_ARCH: &str = "amd64";
const DEFAULT_OS: &str = "linux";

/// Build the template node for `pool`, resolving its shape first
pub async fn build_template_node(pool: &InstancePool, shapes: &ShapeResolver) -> Result<Node> {
    let shape = shapes.get_pool_shape(pool).await?;
    template_node(pool, &shape)
}

/// Build the template node for `pool` with members of `shape`
pub fn template_node(pool: &InstancePool, shape: &Shape) -> Result<Node> {
    let name = template_name(&pool.id);
    let availability_domain = availability_domain(pool)?;

    let capacity = capacity(shape);
    let taints = (shape.gpu > 0).then(|| {
        vec![Taint {
            key: RESOURCE_GPU.to_string(),
            value: Some(String::new()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        }]
    });

    let mut labels = BTreeMap::from([
        (LABEL_ARCH.to_string(), DEFAULT_ARCH.to_string()),
        (LABEL_OS.to_string(), DEFAULT_OS.to_string()),
        (LABEL_INSTANCE_TYPE.to_string(), shape.name.clone()),
        (LABEL_INSTANCE_TYPE_BETA.to_string(), shape.name.clone()),
        (LABEL_ZONE.to_string(), availability_domain.clone()),
        (LABEL_ZONE_BETA.to_string(), availability_domain),
        (LABEL_HOSTNAME.to_string(), name.clone()),
    ]);
    if let Some(region) = region_from_pool_id(&pool.id) {
        labels.insert(LABEL_REGION.to_string(), region.to_string());
        labels.insert(LABEL_REGION_BETA.to_string(), region.to_string());
    }

    let annotations = BTreeMap::from([
        (
            ANNOTATION_COMPARTMENT_ID.to_string(),
            pool.compartment_id.clone(),
        ),
        (ANNOTATION_INSTANCE_POOL_ID.to_string(), pool.id.clone()),
        (
            ANNOTATION_INSTANCE_ID.to_string(),
            placeholder_instance_id(&pool.id),
        ),
    ]);

    Ok(Node {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints,
            ..Default::default()
        }),
        status: Some(NodeStatus {
            allocatable: Some(capacity.clone()),
            capacity: Some(capacity),
            conditions: Some(ready_conditions()),
            ..Default::default()
        }),
    })
}

/// Deterministic node name for a pool's template
fn template_name(pool_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(pool_id.as_bytes()));
    format!("inst-{}", &digest[..6])
}

/// Pool id with its resource segment rewritten to `instance`, plus `.tbd`
pub fn placeholder_instance_id(pool_id: &str) -> String {
    let mut segments: Vec<&str> = pool_id.split('.').collect();
    if segments.len() > 1 {
        segments[1] = "instance";
    }
    format!("{}.tbd", segments.join("."))
}

/// Region segment of a five-part pool OCID
fn region_from_pool_id(pool_id: &str) -> Option<&str> {
    let segments: Vec<&str> = pool_id.split('.').collect();
    (segments.len() == 5).then(|| segments[3])
}

/// Canonical AD (tenancy prefix stripped) of the pool's first placement
fn availability_domain(pool: &InstancePool) -> Result<String> {
    let placements = &pool.placement_configurations;
    let first = placements
        .first()
        .ok_or_else(|| PoolError::NoPlacement(pool.id.clone()))?;
    if placements.len() > 1 {
        warn!(
            pool_id = %pool.id,
            placements = placements.len(),
            "Instance pool has multiple placement configurations, using the first for templates"
        );
    }
    Ok(canonical_availability_domain(&first.availability_domain).to_string())
}

/// Strip the tenancy prefix from `Uocm:PHX-AD-1`
pub fn canonical_availability_domain(availability_domain: &str) -> &str {
    availability_domain
        .split_once(':')
        .map(|(_, ad)| ad)
        .unwrap_or(availability_domain)
}

fn capacity(shape: &Shape) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("pods".to_string(), Quantity(MAX_PODS.to_string())),
        ("cpu".to_string(), cpu_quantity(shape.cpu)),
        (
            "memory".to_string(),
            Quantity(format!("{}", shape.memory_bytes.round() as u64)),
        ),
        (RESOURCE_GPU.to_string(), Quantity(shape.gpu.to_string())),
    ])
}

fn cpu_quantity(cores: f64) -> Quantity {
    if cores.fract() == 0.0 {
        Quantity(format!("{}", cores as u64))
    } else {
        Quantity(format!("{}m", (cores * 1000.0).round() as u64))
    }
}

fn ready_conditions() -> Vec<NodeCondition> {
    let transition = Time(Utc::now() - ChronoDuration::minutes(1));
    let condition = |type_: &str, status: &str, reason: &str| NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        last_transition_time: Some(transition.clone()),
        last_heartbeat_time: Some(transition.clone()),
        message: None,
    };
    vec![
        condition("Ready", "True", "KubeletReady"),
        condition("NetworkUnavailable", "False", "RouteCreated"),
        condition("DiskPressure", "False", "KubeletHasNoDiskPressure"),
        condition("MemoryPressure", "False", "KubeletHasSufficientMemory"),
    ]
}
