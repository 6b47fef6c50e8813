//! Instance pool cache
//!
//! Single source of truth for pool state within the process:
//! - Pool descriptors and member lists, replaced wholesale per pool on rebuild
//! - Target sizes, the autoscaler's view between refreshes
//! - A negative cache of nodes proven not to belong to any managed pool
//!
//! Every mutating vendor call goes through the cache lock.

mod resolver;
pub mod work_requests;

#[cfg(test)]
mod tests;

use crate::error::{PoolError, Result};
use crate::models::{
    pool_id_from_unfulfilled, unfulfilled_instance_id, NodeRef, INSTANCE_STATE_UNFULFILLED,
};
use crate::observability::PoolMetrics;
use crate::vendor::{
    DetachInstancePoolInstanceDetails, InstancePool, InstanceSummary, OciClients,
    PoolLifecycleState, UpdateInstancePoolDetails, WorkRequestStatus,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default)]
struct CacheState {
    pools: BTreeMap<String, InstancePool>,
    members: HashMap<String, Vec<InstanceSummary>>,
    target_sizes: HashMap<String, usize>,
    unowned: HashSet<NodeRef>,
}

impl CacheState {
    fn install(&mut self, pool: InstancePool, members: Vec<InstanceSummary>) {
        self.target_sizes.insert(pool.id.clone(), pool.size);
        self.members.insert(pool.id.clone(), members);
        self.pools.insert(pool.id.clone(), pool);
    }

    fn remove_member(&mut self, pool_id: &str, instance_id: &str) {
        if let Some(members) = self.members.get_mut(pool_id) {
            members.retain(|m| m.id != instance_id);
        }
    }

    fn decrement_target(&mut self, pool_id: &str) -> usize {
        let target = self.target_sizes.entry(pool_id.to_string()).or_default();
        *target = target.saturating_sub(1);
        *target
    }
}

/// Result of detaching an instance from a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachOutcome {
    Detached,
    /// The pool is mid-transition; nothing was sent to the vendor
    PoolNotRunning(PoolLifecycleState),
    /// The request was unusable (e.g. empty instance id)
    Rejected,
    Failed(String),
}

impl DetachOutcome {
    pub fn is_detached(&self) -> bool {
        matches!(self, DetachOutcome::Detached)
    }
}

impl fmt::Display for DetachOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetachOutcome::Detached => f.write_str("detached"),
            DetachOutcome::PoolNotRunning(state) => write!(f, "pool_{}", state.as_str().to_lowercase()),
            DetachOutcome::Rejected => f.write_str("rejected"),
            DetachOutcome::Failed(_) => f.write_str("failed"),
        }
    }
}

/// Lock-protected view of every managed instance pool
pub struct InstancePoolCache {
    state: Mutex<CacheState>,
    clients: OciClients,
    compartment_id: String,
    poll_interval: Duration,
    wait_timeout: Duration,
    metrics: PoolMetrics,
}

impl InstancePoolCache {
    pub fn new(clients: OciClients, compartment_id: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            clients,
            compartment_id: compartment_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            metrics: PoolMetrics::new(),
        }
    }

    /// Override how often and how long `set_size` polls for RUNNING
    pub fn with_state_wait(mut self, poll_interval: Duration, wait_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn compartment_id(&self) -> &str {
        &self.compartment_id
    }

    /// Refetch every pool in `pool_ids` and reset the negative cache.
    ///
    /// Stops at the first failure; pools installed before it stay installed
    /// and the negative cache is kept.
    pub async fn rebuild(&self, pool_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        for pool_id in pool_ids {
            let (pool, members) = self.fetch_pool(pool_id).await.map_err(|e| {
                warn!(pool_id = %pool_id, error = %e, "Failed to refresh instance pool");
                e
            })?;
            self.metrics.set_target_size(pool_id, pool.size);
            state.install(pool, members);
        }
        state.unowned.clear();
        Ok(())
    }

    /// Refetch a single pool
    pub async fn rebuild_pool(&self, pool_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let (pool, members) = self.fetch_pool(pool_id).await?;
        self.metrics.set_target_size(pool_id, pool.size);
        state.install(pool, members);
        Ok(())
    }

    /// Descriptor and complete member list of a pool, with placeholders for
    /// members the vendor failed to launch
    async fn fetch_pool(&self, pool_id: &str) -> Result<(InstancePool, Vec<InstanceSummary>)> {
        let pool = self
            .clients
            .compute_management
            .get_instance_pool(pool_id)
            .await?;
        let mut members = self.list_members(pool_id, &self.compartment_id).await?;

        if members.len() < pool.size && pool.lifecycle_state != PoolLifecycleState::Running {
            debug!(
                pool_id = %pool_id,
                members = members.len(),
                size = pool.size,
                "Instance pool has fewer members than requested"
            );
            if let Some(message) = work_requests::unrecoverable_launch_error(
                &self.clients,
                &pool.compartment_id,
                pool_id,
                WorkRequestStatus::Failed,
            )
            .await
            {
                info!(
                    pool_id = %pool_id,
                    placeholders = pool.size - members.len(),
                    reason = %message,
                    "Adding placeholders for unfulfilled instances"
                );
                for index in members.len()..pool.size {
                    members.push(unfulfilled_member(&pool, index));
                }
            }
        }

        Ok((pool, members))
    }

    /// All members of a pool straight from the vendor
    async fn list_members(&self, pool_id: &str, compartment_id: &str) -> Result<Vec<InstanceSummary>> {
        let mut members = Vec::new();
        let mut page: Option<String> = None;
        loop {
            let response = self
                .clients
                .compute_management
                .list_instance_pool_instances(pool_id, compartment_id, page.as_deref())
                .await?;
            members.extend(response.items);
            match response.next_page {
                Some(next) => page = Some(next),
                None => return Ok(members),
            }
        }
    }

    /// Snapshot of the cached pool descriptors
    pub async fn pools(&self) -> BTreeMap<String, InstancePool> {
        self.state.lock().await.pools.clone()
    }

    pub async fn instance_summaries(&self, pool_id: &str) -> Result<Vec<InstanceSummary>> {
        self.state
            .lock()
            .await
            .members
            .get(pool_id)
            .cloned()
            .ok_or_else(|| PoolError::NotCached(format!("instance summaries for {pool_id}")))
    }

    pub async fn descriptor(&self, pool_id: &str) -> Result<InstancePool> {
        self.state
            .lock()
            .await
            .pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| PoolError::NotCached(format!("instance pool {pool_id}")))
    }

    pub async fn target_size(&self, pool_id: &str) -> Result<usize> {
        self.state
            .lock()
            .await
            .target_sizes
            .get(pool_id)
            .copied()
            .ok_or_else(|| PoolError::NotFound(format!("target size of {pool_id}")))
    }

    /// Resize a pool and wait for it to return to RUNNING.
    ///
    /// The new target is recorded as soon as the vendor accepts the update;
    /// a failed or timed out wait does not roll it back.
    pub async fn set_size(&self, pool_id: &str, size: usize) -> Result<()> {
        if pool_id.is_empty() {
            return Err(PoolError::InvalidArgument(
                "instance pool id is required".to_string(),
            ));
        }

        let (previous, compartment_id) = {
            let mut state = self.state.lock().await;
            let pool = self
                .clients
                .compute_management
                .get_instance_pool(pool_id)
                .await?;
            let details = UpdateInstancePoolDetails {
                size,
                instance_configuration_id: pool.instance_configuration_id.clone(),
            };
            self.clients
                .compute_management
                .update_instance_pool(pool_id, &details)
                .await?;

            state.target_sizes.insert(pool_id.to_string(), size);
            self.metrics.set_target_size(pool_id, size);
            (pool.size, pool.compartment_id)
        };

        debug!(pool_id = %pool_id, from = previous, to = size, "Instance pool update accepted");
        self.wait_for_state(
            pool_id,
            &compartment_id,
            PoolLifecycleState::Running,
            size > previous,
        )
        .await
    }

    /// Poll the vendor until the pool reaches `desired`, bounded by the wait
    /// timeout. On scale-up, also abort on unrecoverable launch errors.
    async fn wait_for_state(
        &self,
        pool_id: &str,
        compartment_id: &str,
        desired: PoolLifecycleState,
        scale_up: bool,
    ) -> Result<()> {
        let poll = self.poll_until_state(pool_id, compartment_id, desired, scale_up);
        match tokio::time::timeout(self.wait_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::TimedOut {
                pool_id: pool_id.to_string(),
                state: desired,
            }),
        }
    }

    async fn poll_until_state(
        &self,
        pool_id: &str,
        compartment_id: &str,
        desired: PoolLifecycleState,
        scale_up: bool,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;

            if scale_up {
                if let Some(message) = work_requests::unrecoverable_launch_error(
                    &self.clients,
                    compartment_id,
                    pool_id,
                    WorkRequestStatus::InProgress,
                )
                .await
                {
                    return Err(PoolError::Unrecoverable {
                        pool_id: pool_id.to_string(),
                        message,
                    });
                }
            }

            let pool = self
                .clients
                .compute_management
                .get_instance_pool(pool_id)
                .await?;
            if pool.lifecycle_state == desired {
                debug!(pool_id = %pool_id, state = %desired, "Instance pool reached desired state");
                return Ok(());
            }
            debug!(
                pool_id = %pool_id,
                state = %pool.lifecycle_state,
                desired = %desired,
                "Waiting for instance pool state"
            );
        }
    }

    /// Detach `instance_id` from the pool, shrinking it by one.
    ///
    /// Placeholders for unfulfilled members are removed by lowering the
    /// vendor target instead, since there is no instance to detach.
    pub async fn detach_instance(&self, pool_id: &str, instance_id: &str) -> DetachOutcome {
        if instance_id.is_empty() {
            warn!(pool_id = %pool_id, "Instance id is not set, skipping removal");
            return DetachOutcome::Rejected;
        }

        let mut state = self.state.lock().await;
        let result = if pool_id_from_unfulfilled(instance_id).is_some() {
            self.remove_placeholder(&state, pool_id).await
        } else {
            match self.detach_from_vendor(pool_id, instance_id).await {
                Ok(None) => Ok(()),
                Ok(Some(lifecycle)) => return DetachOutcome::PoolNotRunning(lifecycle),
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                let target = state.decrement_target(pool_id);
                state.remove_member(pool_id, instance_id);
                self.metrics.set_target_size(pool_id, target);
                DetachOutcome::Detached
            }
            Err(e) => {
                warn!(pool_id = %pool_id, instance_id = %instance_id, error = %e, "Failed to detach instance");
                DetachOutcome::Failed(e.to_string())
            }
        }
    }

    /// Returns the pool's lifecycle instead of detaching when it is not RUNNING
    async fn detach_from_vendor(
        &self,
        pool_id: &str,
        instance_id: &str,
    ) -> Result<Option<PoolLifecycleState>> {
        let pool = self
            .clients
            .compute_management
            .get_instance_pool(pool_id)
            .await?;
        if pool.lifecycle_state != PoolLifecycleState::Running {
            debug!(
                pool_id = %pool_id,
                state = %pool.lifecycle_state,
                "Instance pool is not running, refusing to detach"
            );
            return Ok(Some(pool.lifecycle_state));
        }

        let details = DetachInstancePoolInstanceDetails {
            instance_id: instance_id.to_string(),
            is_decrement_size: true,
            is_auto_terminate: true,
        };
        self.clients
            .compute_management
            .detach_instance_pool_instance(pool_id, &details)
            .await?;
        Ok(None)
    }

    async fn remove_placeholder(&self, state: &CacheState, pool_id: &str) -> Result<()> {
        let pool = state
            .pools
            .get(pool_id)
            .ok_or_else(|| PoolError::NotCached(format!("instance pool {pool_id}")))?;
        let target = state
            .target_sizes
            .get(pool_id)
            .copied()
            .unwrap_or(pool.size);
        let details = UpdateInstancePoolDetails {
            size: target.saturating_sub(1),
            instance_configuration_id: pool.instance_configuration_id.clone(),
        };
        self.clients
            .compute_management
            .update_instance_pool(pool_id, &details)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn is_unowned(&self, node: &NodeRef) -> bool {
        self.state.lock().await.unowned.contains(node)
    }
}

fn unfulfilled_member(pool: &InstancePool, index: usize) -> InstanceSummary {
    InstanceSummary {
        id: unfulfilled_instance_id(&pool.id, index),
        availability_domain: pool
            .placement_configurations
            .first()
            .map(|p| p.availability_domain.clone())
            .unwrap_or_default(),
        compartment_id: pool.compartment_id.clone(),
        display_name: format!("{}-{}", pool.display_name, index),
        shape: String::new(),
        state: INSTANCE_STATE_UNFULFILLED.to_string(),
    }
}
