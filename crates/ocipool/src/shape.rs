//! Shape resolution for instance pools
//!
//! Derives the capacity each member of a pool will have, either from the
//! flexible shape config on the pool's instance configuration or from the
//! compartment's shape catalog.

use crate::error::{PoolError, Result};
use crate::models::Shape;
use crate::vendor::{InstancePool, OciClients, ShapeSummary};
use dashmap::DashMap;
use tracing::debug;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Shape catalog page size
pub const SHAPE_PAGE_LIMIT: u32 = 50;

/// Resolves and caches member shapes, keyed by pool id
pub struct ShapeResolver {
    clients: OciClients,
    shapes: DashMap<String, Shape>,
}

impl ShapeResolver {
    pub fn new(clients: OciClients) -> Self {
        Self {
            clients,
            shapes: DashMap::new(),
        }
    }

    /// Capacity of a member of `pool`
    pub async fn get_pool_shape(&self, pool: &InstancePool) -> Result<Shape> {
        if let Some(shape) = self.shapes.get(&pool.id).map(|entry| entry.clone()) {
            return Ok(shape);
        }

        let configuration = self
            .clients
            .compute_management
            .get_instance_configuration(&pool.instance_configuration_id)
            .await?;
        let launch = configuration.launch_details();
        let name = launch
            .and_then(|details| details.shape.clone())
            .unwrap_or_default();

        let flexible = launch
            .and_then(|details| details.shape_config.as_ref())
            .and_then(|config| config.ocpus.map(|ocpus| (ocpus, config.memory_in_gbs)));

        let shape = match flexible {
            Some((ocpus, memory_gbs)) => Shape {
                name,
                cpu: ocpus,
                gpu: 0,
                // 1 GB per OCPU unless memory is configured
                memory_bytes: memory_gbs.unwrap_or(ocpus) * GIB,
            },
            None if name.is_empty() => return Err(PoolError::ShapeNotFound(pool.id.clone())),
            None => self
                .find_in_catalog(&pool.compartment_id, &name)
                .await?
                .ok_or_else(|| PoolError::ShapeNotFound(pool.id.clone()))?,
        };

        debug!(
            pool_id = %pool.id,
            shape = %shape.name,
            cpu = shape.cpu,
            memory_bytes = shape.memory_bytes,
            gpu = shape.gpu,
            "Resolved pool shape"
        );
        self.shapes.insert(pool.id.clone(), shape.clone());
        Ok(shape)
    }

    async fn find_in_catalog(&self, compartment_id: &str, name: &str) -> Result<Option<Shape>> {
        let mut page: Option<String> = None;
        loop {
            let response = self
                .clients
                .compute
                .list_shapes(compartment_id, SHAPE_PAGE_LIMIT, page.as_deref())
                .await?;

            if let Some(summary) = response.items.iter().find(|s| s.shape == name) {
                return Ok(Some(shape_from_summary(summary)));
            }

            match response.next_page {
                Some(next) => page = Some(next),
                None => return Ok(None),
            }
        }
    }

    /// Drop every cached shape
    pub fn refresh(&self) {
        self.shapes.clear();
    }

    pub fn cached(&self) -> usize {
        self.shapes.len()
    }
}

fn shape_from_summary(summary: &ShapeSummary) -> Shape {
    Shape {
        name: summary.shape.clone(),
        cpu: summary.ocpus.unwrap_or_default(),
        gpu: summary.gpus.unwrap_or_default(),
        memory_bytes: summary.memory_in_gbs.unwrap_or_default() * GIB,
    }
}
