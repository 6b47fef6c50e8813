//! Core data models for the instance-pool adapter

use crate::error::PoolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Marker every instance-pool OCID carries
pub const INSTANCE_POOL_RESOURCE_IDENT: &str = "instancepool";

pub const ANNOTATION_COMPARTMENT_ID: &str = "oci.oraclecloud.com/compartment-id";
pub const ANNOTATION_INSTANCE_ID: &str = "oci.oraclecloud.com/instance-id";
pub const ANNOTATION_INSTANCE_POOL_ID: &str = "oci.oraclecloud.com/instancepool-id";

/// Pool-id annotation value memoising "not in any managed pool"
pub const NON_POOL_MEMBER: &str = "non_pool_member";

/// Synthetic member state for instances the vendor failed to create
pub const INSTANCE_STATE_UNFULFILLED: &str = "Unfulfilled";
/// Id prefix of unfulfilled placeholder members, followed by `<poolId>-<i>`
pub const UNFULFILLED_INSTANCE_PREFIX: &str = "instance_placeholder";

pub const RESOURCE_GPU: &str = "nvidia.com/gpu";

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Static configuration of one managed pool (`<min>:<max>:<id>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: String,
    pub min_size: usize,
    pub max_size: usize,
}

impl PoolSpec {
    pub fn new(id: impl Into<String>, min_size: usize, max_size: usize) -> Result<Self, PoolError> {
        let spec = Self {
            id: id.into(),
            min_size,
            max_size,
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), PoolError> {
        if !self.id.contains(INSTANCE_POOL_RESOURCE_IDENT) {
            return Err(PoolError::Validation(format!(
                "{} is not an instance pool id",
                self.id
            )));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::Validation(format!(
                "min size {} is greater than max size {} for {}",
                self.min_size, self.max_size, self.id
            )));
        }
        Ok(())
    }
}

impl FromStr for PoolSpec {
    type Err = PoolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if !value.contains(INSTANCE_POOL_RESOURCE_IDENT) {
            return Err(PoolError::Validation(format!(
                "node group spec {value:?} does not reference an instance pool"
            )));
        }

        let tokens: Vec<&str> = value.splitn(3, ':').collect();
        if tokens.len() != 3 || !tokens[2].starts_with("ocid") {
            return Err(PoolError::Validation(format!(
                "incorrect number of tokens in node group spec {value:?}, expected <min>:<max>:<ocid>"
            )));
        }

        let parse_size = |token: &str, which: &str| {
            token.parse::<usize>().map_err(|e| {
                PoolError::Validation(format!("failed to parse {which} size {token:?}: {e}"))
            })
        };
        let min_size = parse_size(tokens[0], "min")?;
        let max_size = parse_size(tokens[1], "max")?;

        PoolSpec::new(tokens[2], min_size, max_size)
    }
}

impl fmt::Display for PoolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.min_size, self.max_size, self.id)
    }
}

/// Identity of a cluster node as known to the caller
///
/// Any field may be empty. Resolution needs at least one of `instance_id`,
/// `private_ip` or `public_ip`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub name: String,
    pub availability_domain: String,
    pub compartment_id: String,
    pub instance_id: String,
    pub pool_id: String,
    pub private_ip: String,
    pub public_ip: String,
    pub shape: String,
}

impl NodeRef {
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    pub fn with_private_ip(private_ip: impl Into<String>) -> Self {
        Self {
            private_ip: private_ip.into(),
            ..Default::default()
        }
    }

    pub fn has_address(&self) -> bool {
        !(self.instance_id.is_empty() && self.private_ip.is_empty() && self.public_ip.is_empty())
    }
}

/// Per-instance capacity of a pool's members
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Shape {
    pub name: String,
    /// Cores (OCPUs); may be fractional for flexible shapes
    pub cpu: f64,
    pub gpu: u32,
    pub memory_bytes: f64,
}

/// Instance state as reported to the autoscaler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Running,
    Creating,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceErrorClass {
    OutOfResources,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceErrorInfo {
    pub error_class: InstanceErrorClass,
    pub error_code: String,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub error_info: Option<InstanceErrorInfo>,
}

/// A pool member as seen by the autoscaler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub status: InstanceStatus,
}

/// Placeholder id for the `index`-th unfulfilled member of a pool
pub fn unfulfilled_instance_id(pool_id: &str, index: usize) -> String {
    format!("{UNFULFILLED_INSTANCE_PREFIX}{pool_id}-{index}")
}

/// Pool id embedded in a placeholder id, if `id` is one
pub fn pool_id_from_unfulfilled(id: &str) -> Option<&str> {
    let rest = id.strip_prefix(UNFULFILLED_INSTANCE_PREFIX)?;
    let (pool_id, index) = rest.rsplit_once('-')?;
    if pool_id.is_empty() || index.parse::<usize>().is_err() {
        return None;
    }
    Some(pool_id)
}
