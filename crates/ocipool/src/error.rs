//! Error taxonomy for the instance-pool control layer

use crate::vendor::{PoolLifecycleState, VendorError};
use thiserror::Error;

/// Errors surfaced by the cache, resolvers and manager
#[derive(Debug, Error)]
pub enum PoolError {
    /// The node is not a member of any managed instance pool.
    ///
    /// The manager translates this into "not my concern" before it reaches
    /// the autoscaler.
    #[error("instance-pool not found for instance")]
    NotMember,

    #[error("{0} was not found in the cache")]
    NotCached(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("timed out waiting for instance pool {pool_id} to reach state {state}")]
    TimedOut {
        pool_id: String,
        state: PoolLifecycleState,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// The pool is mid-transition; the operation may succeed later
    #[error("instance pool {pool_id} is {state}, instances can only be detached while it is RUNNING")]
    PoolBusy {
        pool_id: String,
        state: PoolLifecycleState,
    },

    #[error("could not delete instance {instance_id} from instance pool {pool_id}")]
    DeleteFailed {
        pool_id: String,
        instance_id: String,
    },

    #[error("shape not found for instance pool {0}")]
    ShapeNotFound(String),

    #[error("instance-pool {0} does not have the required placement configurations")]
    NoPlacement(String),

    /// Quota, limit or capacity exhaustion reported by a work request
    #[error("instance pool {pool_id} cannot be scaled: {message}")]
    Unrecoverable { pool_id: String, message: String },

    #[error(transparent)]
    Vendor(#[from] VendorError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Returns true for errors the caller may retry without changing input
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::TimedOut { .. } | PoolError::PoolBusy { .. } => true,
            PoolError::Vendor(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(err: config::ConfigError) -> Self {
        PoolError::Config(err.to_string())
    }
}

/// Crate-wide result type
pub type Result<T, E = PoolError> = std::result::Result<T, E>;
