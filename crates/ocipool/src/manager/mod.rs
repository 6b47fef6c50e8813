//! Instance pool manager
//!
//! The facade the autoscaler talks to. Owns the static pool specs, the pool
//! cache and the shape resolver, and decides when the cache is rebuilt.


use crate::cache::{DetachOutcome, InstancePoolCache};
use crate::config::ManagerConfig;
use crate::error::{PoolError, Result};
use crate::models::{
    pool_id_from_unfulfilled, Instance, InstanceErrorClass, InstanceErrorInfo, InstanceState,
    InstanceStatus, NodeRef, PoolSpec, NON_POOL_MEMBER,
};
use crate::observability::{LookupOutcome, PoolEventLogger, PoolMetrics};
use crate::registry::{NodeAnnotator, NodeRegistry};
use crate::shape::ShapeResolver;
use crate::template::build_template_node;
use crate::vendor::{InstanceLifecycleState, InstanceSummary, OciClients, RetryPolicy};
use k8s_openapi::api::core::v1::Node;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const UNFULFILLED_ERROR_CODE: &str = "unfulfilled";
pub const UNFULFILLED_ERROR_MESSAGE: &str =
    "OCI cannot provision additional instances for this instance pool. Review quota and/or capacity.";

/// Manages a fixed set of OCI instance pools on behalf of the autoscaler
pub struct InstancePoolManager {
    config: ManagerConfig,
    specs: BTreeMap<String, PoolSpec>,
    cache: InstancePoolCache,
    shapes: ShapeResolver,
    annotator: NodeAnnotator,
    last_refresh: RwLock<Option<Instant>>,
    metrics: PoolMetrics,
    logger: PoolEventLogger,
}

impl InstancePoolManager {
    /// Build a manager without touching the vendor.
    ///
    /// `specs` are `min:max:poolId` strings; any malformed entry fails with a
    /// validation error.
    pub fn new<S: AsRef<str>>(
        mut config: ManagerConfig,
        clients: OciClients,
        registry: Arc<dyn NodeRegistry>,
        specs: &[S],
    ) -> Result<Self> {
        config.validate()?;
        config.compartment_id = config.compartment_or(&clients.tenancy_id).to_string();

        let mut parsed = BTreeMap::new();
        for raw in specs {
            let spec: PoolSpec = raw.as_ref().parse()?;
            debug!(pool_id = %spec.id, min = spec.min_size, max = spec.max_size, "Registered instance pool");
            parsed.insert(spec.id.clone(), spec);
        }

        let cache = InstancePoolCache::new(clients.clone(), config.compartment_id.clone())
            .with_state_wait(config.state_poll_interval, config.state_wait_timeout);
        let logger = PoolEventLogger::new(config.compartment_id.clone());

        Ok(Self {
            specs: parsed,
            cache,
            shapes: ShapeResolver::new(clients),
            annotator: NodeAnnotator::new(registry),
            last_refresh: RwLock::new(None),
            metrics: PoolMetrics::new(),
            logger,
            config,
        })
    }

    /// Build a manager over retrying clients and block until the first
    /// refresh succeeds, retrying every `startup_retry_interval`.
    pub async fn create<S: AsRef<str>>(
        config: ManagerConfig,
        clients: OciClients,
        registry: Arc<dyn NodeRegistry>,
        specs: &[S],
    ) -> Result<Self> {
        let clients = clients.with_retry(RetryPolicy::standard());
        let manager = Self::new(config, clients, registry, specs)?;

        loop {
            match manager.force_refresh().await {
                Ok(()) => break,
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in_secs = manager.config.startup_retry_interval.as_secs(),
                        "Initial instance pool refresh failed"
                    );
                    tokio::time::sleep(manager.config.startup_retry_interval).await;
                }
            }
        }

        manager.logger.log_startup(manager.specs.len());
        Ok(manager)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn compartment_id(&self) -> &str {
        &self.config.compartment_id
    }

    /// Rebuild the cache unless the last successful rebuild is younger than
    /// the refresh interval.
    pub async fn refresh(&self) -> Result<()> {
        if let Some(last) = *self.last_refresh.read().await {
            if last.elapsed() < self.config.refresh_interval {
                return Ok(());
            }
        }
        self.force_refresh().await
    }

    /// Rebuild the cache now. The refresh clock only advances on success.
    pub async fn force_refresh(&self) -> Result<()> {
        let started = Instant::now();
        self.shapes.refresh();

        let pool_ids: Vec<String> = self.specs.keys().cloned().collect();
        match self.cache.rebuild(&pool_ids).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                *self.last_refresh.write().await = Some(Instant::now());
                self.metrics.observe_refresh(elapsed.as_secs_f64());
                self.logger.log_refresh(
                    pool_ids.len(),
                    elapsed.as_millis() as u64,
                    self.config.refresh_interval.as_secs(),
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_refresh_errors();
                self.logger.log_refresh_failed(&e.to_string());
                Err(e)
            }
        }
    }

    /// Rebuild the cached entry of a single managed pool
    pub async fn force_refresh_pool(&self, pool_id: &str) -> Result<()> {
        if !self.specs.contains_key(pool_id) {
            return Err(PoolError::NotFound(format!("instance pool {pool_id}")));
        }
        self.cache.rebuild_pool(pool_id).await
    }

    /// Static specs of every managed pool, ordered by pool id
    pub fn pools(&self) -> Vec<PoolSpec> {
        self.specs.values().cloned().collect()
    }

    /// Members of `spec` in autoscaler terms.
    ///
    /// Members in states the autoscaler has no use for (stopped, terminated)
    /// are left out.
    pub async fn pool_nodes(&self, spec: &PoolSpec) -> Result<Vec<Instance>> {
        let members = self.cache.instance_summaries(&spec.id).await?;
        Ok(members.iter().filter_map(instance_from_summary).collect())
    }

    /// Managed pool `node` belongs to, or `None` when it belongs to none.
    pub async fn pool_for_node(&self, node: &NodeRef) -> Result<Option<PoolSpec>> {
        if self.config.use_non_member_annotation && node.pool_id == NON_POOL_MEMBER {
            debug!(node = %node.name, "Node is annotated as a non pool member");
            self.metrics.inc_resolver_lookups(LookupOutcome::NotMember);
            return Ok(None);
        }

        let mut node = node.clone();
        if node.compartment_id.is_empty() {
            node.compartment_id = self.config.compartment_id.clone();
        }

        if let Some(spec) = self.specs.get(&node.pool_id) {
            self.metrics.inc_resolver_lookups(LookupOutcome::Cached);
            return Ok(Some(spec.clone()));
        }

        match self.cache.find_by_details(&node).await {
            Ok(resolved) => {
                self.metrics.inc_resolver_lookups(LookupOutcome::Resolved);
                let Some(spec) = self.specs.get(&resolved.pool_id) else {
                    return Ok(None);
                };
                if !is_placeholder(&resolved) {
                    self.annotator.apply_identity(&resolved).await;
                    self.logger
                        .log_node_resolved(&resolved.name, &resolved.instance_id, &resolved.pool_id);
                }
                Ok(Some(spec.clone()))
            }
            Err(PoolError::NotMember) => {
                self.metrics.inc_resolver_lookups(LookupOutcome::NotMember);
                if self.config.use_non_member_annotation {
                    self.annotator.mark_non_member(&node.name).await;
                }
                Ok(None)
            }
            Err(e) => {
                self.metrics.inc_resolver_lookups(LookupOutcome::Error);
                Err(e)
            }
        }
    }

    /// Template node for scale-up simulation of `spec`
    pub async fn template_node(&self, spec: &PoolSpec) -> Result<Node> {
        let pool = self.cache.descriptor(&spec.id).await?;
        build_template_node(&pool, &self.shapes).await
    }

    /// Current target size of `spec`
    pub async fn pool_size(&self, spec: &PoolSpec) -> Result<usize> {
        self.cache.target_size(&spec.id).await
    }

    /// Resize `spec` to `size` and refresh its cache entry.
    ///
    /// The cache entry is refreshed whether or not the resize succeeded.
    pub async fn set_pool_size(&self, spec: &PoolSpec, size: usize) -> Result<()> {
        if !self.specs.contains_key(&spec.id) {
            return Err(PoolError::Validation(format!(
                "instance pool {} is not managed",
                spec.id
            )));
        }

        let previous = self.cache.target_size(&spec.id).await.unwrap_or_default();
        info!(pool_id = %spec.id, from = previous, to = size, "Resizing instance pool");
        let result = self.cache.set_size(&spec.id, size).await;

        if let Err(e) = self.force_refresh_pool(&spec.id).await {
            warn!(pool_id = %spec.id, error = %e, "Failed to refresh instance pool after resize");
        }

        self.metrics.inc_scale_requests(&spec.id, result.is_ok());
        let error = result.as_ref().err().map(ToString::to_string);
        self.logger
            .log_scale(&spec.id, previous, size, error.as_deref());
        result
    }

    /// Detach and terminate `nodes`, one at a time, stopping at the first
    /// failure.
    pub async fn delete_instances(&self, spec: &PoolSpec, nodes: &[NodeRef]) -> Result<()> {
        for node in nodes {
            let outcome = self.cache.detach_instance(&spec.id, &node.instance_id).await;
            self.logger
                .log_detach(&spec.id, &node.instance_id, &outcome.to_string());

            match outcome {
                DetachOutcome::Detached => self.metrics.inc_instances_detached(&spec.id),
                DetachOutcome::PoolNotRunning(state) => {
                    return Err(PoolError::PoolBusy {
                        pool_id: spec.id.clone(),
                        state,
                    })
                }
                DetachOutcome::Rejected | DetachOutcome::Failed(_) => {
                    return Err(PoolError::DeleteFailed {
                        pool_id: spec.id.clone(),
                        instance_id: node.instance_id.clone(),
                    })
                }
            }
        }
        Ok(())
    }
}

fn is_placeholder(node: &NodeRef) -> bool {
    pool_id_from_unfulfilled(&node.instance_id).is_some()
        || pool_id_from_unfulfilled(&node.name).is_some()
}

fn instance_from_summary(summary: &InstanceSummary) -> Option<Instance> {
    let (state, error_info) = match summary.lifecycle() {
        InstanceLifecycleState::Running => (InstanceState::Running, None),
        InstanceLifecycleState::Provisioning
        | InstanceLifecycleState::Starting
        | InstanceLifecycleState::CreatingImage
        | InstanceLifecycleState::Moving => (InstanceState::Creating, None),
        InstanceLifecycleState::Stopping | InstanceLifecycleState::Terminating => {
            (InstanceState::Deleting, None)
        }
        InstanceLifecycleState::Unfulfilled => (
            InstanceState::Creating,
            Some(InstanceErrorInfo {
                error_class: InstanceErrorClass::OutOfResources,
                error_code: UNFULFILLED_ERROR_CODE.to_string(),
                error_message: UNFULFILLED_ERROR_MESSAGE.to_string(),
            }),
        ),
        _ => return None,
    };

    Some(Instance {
        id: summary.id.clone(),
        status: InstanceStatus { state, error_info },
    })
}
