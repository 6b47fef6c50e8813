//! Instance pool control layer for the cluster autoscaler on OCI
//!
//! This crate provides:
//! - A cache of managed instance pools, their members and target sizes
//! - Node to pool membership resolution with negative caching
//! - Shape resolution and template nodes for scale-up simulation
//! - Resize and detach operations with lifecycle waits
//! - Node annotation, metrics and structured logging

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod observability;
pub mod registry;
pub mod shape;
pub mod template;
pub mod vendor;

pub use cache::{DetachOutcome, InstancePoolCache};
pub use crate::config::ManagerConfig;
pub use error::{PoolError, Result};
pub use manager::InstancePoolManager;
pub use models::*;
pub use observability::{LookupOutcome, PoolEventLogger, PoolMetrics};
pub use registry::{KubeNodeRegistry, NodeAnnotator, NodeRegistry, RegistryError};
pub use shape::ShapeResolver;
pub use vendor::{OciClients, RetryPolicy, VendorError};
