//! Node to pool membership resolution
//!
//! Matches a partial node identity against live pool membership. Runs under
//! the cache lock so concurrent resolutions never duplicate vendor listings.

use super::InstancePoolCache;
use crate::error::{PoolError, Result};
use crate::models::{pool_id_from_unfulfilled, NodeRef};
use crate::template::canonical_availability_domain;
use crate::vendor::{InstanceSummary, Vnic, VnicAttachmentState};
use tracing::debug;

impl InstancePoolCache {
    /// Find the managed pool `node` belongs to and return the node's full
    /// identity. Fails with [`PoolError::NotMember`] when no pool claims it;
    /// such nodes are remembered until the next full rebuild.
    pub async fn find_by_details(&self, node: &NodeRef) -> Result<NodeRef> {
        if let Some(pool_id) = placeholder_pool_id(node) {
            return Ok(NodeRef {
                pool_id: pool_id.to_string(),
                ..node.clone()
            });
        }

        if !node.has_address() {
            return Err(PoolError::InvalidArgument(
                "instance id or an IP address is required to resolve details".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        if state.unowned.contains(node) {
            debug!(node = %node.name, "Node is known not to be a member of any managed pool");
            return Err(PoolError::NotMember);
        }

        let candidates: Vec<(String, usize)> = state
            .pools
            .values()
            .map(|pool| (pool.id.clone(), pool.size))
            .collect();
        let compartment_id = if node.compartment_id.is_empty() {
            self.compartment_id.as_str()
        } else {
            node.compartment_id.as_str()
        };

        for (pool_id, size) in candidates {
            if !node.pool_id.is_empty() && node.pool_id != pool_id {
                continue;
            }
            if size == 0 {
                continue;
            }

            // Live listing: cached members may lag pool growth
            let members = self.list_members(&pool_id, compartment_id).await?;
            for member in members.iter().filter(|m| m.is_running()) {
                if !node.instance_id.is_empty() && node.instance_id != member.id {
                    continue;
                }
                if let Some(vnic) = self.matching_vnic(node, member).await? {
                    debug!(
                        instance_id = %member.id,
                        pool_id = %pool_id,
                        "Matched node to instance pool member"
                    );
                    return Ok(enrich(node, &pool_id, member, &vnic));
                }
            }
        }

        debug!(node = %node.name, "Node is not a member of any managed pool");
        state.unowned.insert(node.clone());
        Err(PoolError::NotMember)
    }

    /// First attached VNIC of `member` that identifies it as `node`
    async fn matching_vnic(&self, node: &NodeRef, member: &InstanceSummary) -> Result<Option<Vnic>> {
        let attachments = self
            .clients
            .compute
            .list_vnic_attachments(&member.compartment_id, &member.id)
            .await?;

        for attachment in attachments
            .iter()
            .filter(|a| a.lifecycle_state == VnicAttachmentState::Attached)
        {
            let Some(vnic_id) = attachment.vnic_id.as_deref() else {
                continue;
            };
            let vnic = self.clients.network.get_vnic(vnic_id).await?;
            if member.id == node.instance_id
                || same_address(vnic.private_ip.as_deref(), &node.private_ip)
                || same_address(vnic.public_ip.as_deref(), &node.public_ip)
            {
                return Ok(Some(vnic));
            }
        }
        Ok(None)
    }
}

fn same_address(vnic: Option<&str>, node: &str) -> bool {
    matches!(vnic, Some(ip) if !ip.is_empty() && ip == node)
}

fn placeholder_pool_id(node: &NodeRef) -> Option<&str> {
    pool_id_from_unfulfilled(&node.instance_id).or_else(|| pool_id_from_unfulfilled(&node.name))
}

/// `node` completed from the matched member and its VNIC
fn enrich(node: &NodeRef, pool_id: &str, member: &InstanceSummary, vnic: &Vnic) -> NodeRef {
    let mut resolved = node.clone();
    if resolved.name.is_empty() {
        resolved.name = member.display_name.clone();
    }
    resolved.instance_id = member.id.clone();
    resolved.pool_id = pool_id.to_string();
    resolved.compartment_id = member.compartment_id.clone();
    resolved.availability_domain =
        canonical_availability_domain(&member.availability_domain).to_string();
    resolved.shape = member.shape.clone();
    resolved.private_ip = vnic.private_ip.clone().unwrap_or_default();
    if let Some(public_ip) = &vnic.public_ip {
        resolved.public_ip = public_ip.clone();
    }
    resolved
}
