//! Work request inspection
//!
//! Pool launches run as vendor work requests. A failed or stalled launch
//! whose errors name a quota, limit or capacity problem will not recover by
//! waiting, so callers use these helpers to stop early.

use crate::vendor::{OciClients, WorkRequestStatus, WorkRequestSummary};
use tracing::{debug, warn};

/// Operation type of the work request launching pool members
pub const LAUNCH_INSTANCES_IN_POOL_OP: &str = "LaunchInstancesInPool";

const UNRECOVERABLE_MARKERS: [&str; 3] = ["quotaexceeded", "limitexceeded", "outofcapacity"];

/// Most recently started work request for `resource_id`
pub async fn last_started_work_request(
    clients: &OciClients,
    compartment_id: &str,
    resource_id: &str,
) -> Option<WorkRequestSummary> {
    let requests = match clients
        .work_requests
        .list_work_requests(compartment_id, resource_id)
        .await
    {
        Ok(requests) => requests,
        Err(e) => {
            warn!(resource_id = %resource_id, error = %e, "Failed to list work requests");
            return None;
        }
    };

    requests
        .into_iter()
        .filter(|request| request.time_started.is_some())
        .max_by_key(|request| request.time_started)
}

/// First error message of the work request that names an unrecoverable cause
pub async fn first_unrecoverable_error(
    clients: &OciClients,
    work_request_id: &str,
    compartment_id: &str,
) -> Option<String> {
    let errors = match clients
        .work_requests
        .list_work_request_errors(work_request_id, compartment_id)
        .await
    {
        Ok(errors) => errors,
        Err(e) => {
            warn!(work_request_id = %work_request_id, error = %e, "Failed to list work request errors");
            return None;
        }
    };

    let found = errors.into_iter().map(|e| e.message).find(|message| {
        let message = message.to_lowercase();
        UNRECOVERABLE_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    });
    if found.is_some() {
        debug!(work_request_id = %work_request_id, "Found unrecoverable work request error");
    }
    found
}

/// Unrecoverable error of the pool's latest launch, if that launch is in `status`
pub async fn unrecoverable_launch_error(
    clients: &OciClients,
    compartment_id: &str,
    pool_id: &str,
    status: WorkRequestStatus,
) -> Option<String> {
    let request = last_started_work_request(clients, compartment_id, pool_id).await?;
    if request.operation_type != LAUNCH_INSTANCES_IN_POOL_OP || request.status != status {
        return None;
    }
    first_unrecoverable_error(clients, &request.id, compartment_id).await
}
