use super::*;
use crate::models::UNFULFILLED_INSTANCE_PREFIX;
use crate::vendor::fake::{self, FakeOci, COMPARTMENT_ID};
use crate::vendor::{VendorError, WorkRequestError, WorkRequestSummary};
use chrono::Utc;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

const P1: &str = "ocid1.instancepool.oc1.phx.aaaaaaaap1";
const P2: &str = "ocid1.instancepool.oc1.phx.aaaaaaaap2";
const M1: &str = "ocid1.instance.oc1.phx.aaaaaaaam1";
const M2: &str = "ocid1.instance.oc1.phx.aaaaaaaam2";

fn setup() -> (Arc<FakeOci>, InstancePoolCache) {
    let oci = FakeOci::new();
    oci.add_pool(fake::pool(P1, 2));
    oci.add_member(P1, fake::member(M1, "Running"), Some("10.0.20.59"), None);
    oci.add_member(
        P1,
        fake::member(M2, "Running"),
        Some("10.0.20.60"),
        Some("129.146.0.2"),
    );
    let cache = InstancePoolCache::new(oci.clients(), COMPARTMENT_ID)
        .with_state_wait(Duration::from_secs(15), Duration::from_secs(300));
    (oci, cache)
}

fn ids(members: &[InstanceSummary]) -> Vec<&str> {
    members.iter().map(|m| m.id.as_str()).collect()
}

fn failed_launch(pool_id: &str, status: WorkRequestStatus, message: &str) -> (WorkRequestSummary, Vec<WorkRequestError>) {
    (
        WorkRequestSummary {
            id: format!("{pool_id}-launch"),
            operation_type: work_requests::LAUNCH_INSTANCES_IN_POOL_OP.to_string(),
            status,
            time_started: Some(Utc::now()),
        },
        vec![WorkRequestError {
            code: "InternalError".to_string(),
            message: message.to_string(),
        }],
    )
}

#[tokio::test]
async fn test_reads_before_rebuild_are_not_cached() {
    let (_oci, cache) = setup();
    assert!(matches!(cache.descriptor(P1).await, Err(PoolError::NotCached(_))));
    assert!(matches!(cache.instance_summaries(P1).await, Err(PoolError::NotCached(_))));
    assert!(matches!(cache.target_size(P1).await, Err(PoolError::NotFound(_))));
    assert!(cache.pools().await.is_empty());
}

#[tokio::test]
async fn test_rebuild_installs_pools() {
    let (_oci, cache) = setup();
    assert_ok!(cache.rebuild(&[P1.to_string()]).await);

    assert_eq!(cache.descriptor(P1).await.unwrap().size, 2);
    assert_eq!(ids(&cache.instance_summaries(P1).await.unwrap()), vec![M1, M2]);
    assert_eq!(cache.target_size(P1).await.unwrap(), 2);
    assert_eq!(cache.pools().await.len(), 1);
}

#[tokio::test]
async fn test_rebuild_pages_through_members() {
    let (oci, cache) = setup();
    oci.set_page_size(1);
    for i in 3..6 {
        oci.add_member(P1, fake::member(&format!("ocid1.instance.oc1.phx.m{i}"), "Running"), None, None);
    }

    cache.rebuild(&[P1.to_string()]).await.unwrap();
    assert_eq!(cache.instance_summaries(P1).await.unwrap().len(), 5);
    assert_eq!(oci.calls("ListInstancePoolInstances"), 5);
}

#[tokio::test]
async fn test_rebuild_stops_at_first_failure() {
    let (oci, cache) = setup();
    let missing = "ocid1.instancepool.oc1.phx.missing".to_string();

    let result = cache.rebuild(&[P1.to_string(), missing]).await;
    assert!(matches!(result, Err(PoolError::Vendor(_))));
    // pools fetched before the failure stay installed
    assert!(cache.descriptor(P1).await.is_ok());
    assert_eq!(oci.calls("GetInstancePool"), 2);
}

#[tokio::test]
async fn test_failed_rebuild_keeps_negative_cache() {
    let (oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();
    let stranger = NodeRef::with_instance_id("ocid1.instance.oc1.phx.stranger");
    assert_err!(cache.find_by_details(&stranger).await);
    assert!(cache.is_unowned(&stranger).await);

    oci.fail("GetInstancePool", VendorError::service(500, "InternalError", "down"));
    assert_err!(cache.rebuild(&[P1.to_string()]).await);
    assert!(cache.is_unowned(&stranger).await);

    oci.clear_failure("GetInstancePool");
    cache.rebuild(&[P1.to_string()]).await.unwrap();
    assert!(!cache.is_unowned(&stranger).await);
}

#[tokio::test]
async fn test_rebuild_adds_unfulfilled_placeholders() {
    let oci = FakeOci::new();
    let mut pool = fake::pool(P2, 3);
    pool.lifecycle_state = PoolLifecycleState::Scaling;
    oci.add_pool(pool);
    oci.add_member(P2, fake::member(M1, "Running"), None, None);
    let (request, errors) = failed_launch(
        P2,
        WorkRequestStatus::Failed,
        "QuotaExceeded: service limit reached for VM.Standard2.8",
    );
    oci.add_work_request(P2, request, errors);

    let cache = InstancePoolCache::new(oci.clients(), COMPARTMENT_ID);
    cache.rebuild(&[P2.to_string()]).await.unwrap();

    let members = cache.instance_summaries(P2).await.unwrap();
    assert_eq!(members.len(), 3);
    assert_eq!(members[0].id, M1);
    for (index, member) in members.iter().enumerate().skip(1) {
        assert_eq!(member.id, format!("{UNFULFILLED_INSTANCE_PREFIX}{P2}-{index}"));
        assert_eq!(member.state, INSTANCE_STATE_UNFULFILLED);
    }
}

#[tokio::test]
async fn test_no_placeholders_for_recoverable_errors() {
    let oci = FakeOci::new();
    let mut pool = fake::pool(P2, 3);
    pool.lifecycle_state = PoolLifecycleState::Scaling;
    oci.add_pool(pool);
    let (request, errors) = failed_launch(P2, WorkRequestStatus::Failed, "internal hiccup");
    oci.add_work_request(P2, request, errors);

    let cache = InstancePoolCache::new(oci.clients(), COMPARTMENT_ID);
    cache.rebuild(&[P2.to_string()]).await.unwrap();
    assert!(cache.instance_summaries(P2).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_set_size_updates_target() {
    let (oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();

    assert_ok!(cache.set_size(P1, 3).await);
    assert_eq!(cache.target_size(P1).await.unwrap(), 3);
    assert_eq!(oci.pool_size(P1), Some(3));
    assert_eq!(oci.calls("UpdateInstancePool"), 1);
}

#[tokio::test]
async fn test_set_size_requires_pool_id() {
    let (oci, cache) = setup();
    assert!(matches!(
        cache.set_size("", 1).await,
        Err(PoolError::InvalidArgument(_))
    ));
    assert_eq!(oci.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_set_size_times_out_but_keeps_target() {
    let (oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();
    oci.set_state_after_update(PoolLifecycleState::Scaling);

    let result = cache.set_size(P1, 1).await;
    assert!(matches!(
        result,
        Err(PoolError::TimedOut { ref pool_id, state: PoolLifecycleState::Running }) if pool_id == P1
    ));
    assert_eq!(cache.target_size(P1).await.unwrap(), 1);
    // immediate poll plus one every 15s within the 5 minute window
    assert!(oci.calls("GetInstancePool") >= 20);
}

#[tokio::test(start_paused = true)]
async fn test_scale_up_fails_fast_on_capacity_errors() {
    let (oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();
    oci.set_state_after_update(PoolLifecycleState::Scaling);
    let (request, errors) = failed_launch(
        P1,
        WorkRequestStatus::InProgress,
        "OutOfCapacity: out of host capacity",
    );
    oci.add_work_request(P1, request, errors);

    let result = cache.set_size(P1, 4).await;
    assert!(matches!(result, Err(PoolError::Unrecoverable { .. })));
    assert_eq!(cache.target_size(P1).await.unwrap(), 4);
}

#[tokio::test]
async fn test_set_size_propagates_update_errors() {
    let (oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();
    oci.fail("UpdateInstancePool", VendorError::service(409, "Conflict", "busy"));

    assert!(matches!(cache.set_size(P1, 5).await, Err(PoolError::Vendor(_))));
    assert_eq!(cache.target_size(P1).await.unwrap(), 2);
}

#[tokio::test]
async fn test_detach_instance() {
    let (oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();

    assert_eq!(cache.detach_instance(P1, M2).await, DetachOutcome::Detached);
    assert_eq!(cache.target_size(P1).await.unwrap(), 1);
    assert_eq!(ids(&cache.instance_summaries(P1).await.unwrap()), vec![M1]);
    assert_eq!(oci.member_ids(P1), vec![M1.to_string()]);
    assert_eq!(oci.pool_size(P1), Some(1));
}

#[tokio::test]
async fn test_detach_requires_running_pool() {
    let (oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();
    oci.set_pool_state(P1, PoolLifecycleState::Scaling);

    assert_eq!(
        cache.detach_instance(P1, M2).await,
        DetachOutcome::PoolNotRunning(PoolLifecycleState::Scaling)
    );
    assert_eq!(oci.calls("DetachInstancePoolInstance"), 0);
    assert_eq!(cache.target_size(P1).await.unwrap(), 2);
}

#[tokio::test]
async fn test_detach_rejects_empty_instance_id() {
    let (oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();
    let before = oci.total_calls();

    assert_eq!(cache.detach_instance(P1, "").await, DetachOutcome::Rejected);
    assert_eq!(oci.total_calls(), before);
}

#[tokio::test]
async fn test_detach_failure_keeps_state() {
    let (oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();

    let outcome = cache.detach_instance(P1, "ocid1.instance.oc1.phx.unknown").await;
    assert!(matches!(outcome, DetachOutcome::Failed(_)));
    assert!(!outcome.is_detached());
    assert_eq!(cache.target_size(P1).await.unwrap(), 2);
    assert_eq!(oci.member_ids(P1).len(), 2);
}

#[tokio::test]
async fn test_detach_placeholder_lowers_vendor_size() {
    let oci = FakeOci::new();
    let mut pool = fake::pool(P2, 2);
    pool.lifecycle_state = PoolLifecycleState::Scaling;
    oci.add_pool(pool);
    oci.add_member(P2, fake::member(M1, "Running"), None, None);
    let (request, errors) = failed_launch(P2, WorkRequestStatus::Failed, "LimitExceeded");
    oci.add_work_request(P2, request, errors);

    let cache = InstancePoolCache::new(oci.clients(), COMPARTMENT_ID);
    cache.rebuild(&[P2.to_string()]).await.unwrap();
    let placeholder = unfulfilled_instance_id(P2, 1);

    assert_eq!(cache.detach_instance(P2, &placeholder).await, DetachOutcome::Detached);
    assert_eq!(oci.calls("DetachInstancePoolInstance"), 0);
    assert_eq!(oci.calls("UpdateInstancePool"), 1);
    assert_eq!(oci.pool_size(P2), Some(1));
    assert_eq!(cache.target_size(P2).await.unwrap(), 1);
    assert_eq!(ids(&cache.instance_summaries(P2).await.unwrap()), vec![M1]);
}

#[tokio::test]
async fn test_find_by_private_ip() {
    let (_oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();

    let resolved = cache
        .find_by_details(&NodeRef::with_private_ip("10.0.20.59"))
        .await
        .unwrap();
    assert_eq!(resolved.instance_id, M1);
    assert_eq!(resolved.pool_id, P1);
    assert_eq!(resolved.availability_domain, "PHX-AD-1");
    assert_eq!(resolved.name, format!("{M1}-name"));
    assert_eq!(resolved.shape, fake::SHAPE);
    assert_eq!(resolved.compartment_id, COMPARTMENT_ID);
}

#[tokio::test]
async fn test_find_by_public_ip_fills_addresses() {
    let (_oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();

    let node = NodeRef {
        name: "worker-7".to_string(),
        public_ip: "129.146.0.2".to_string(),
        ..Default::default()
    };
    let resolved = cache.find_by_details(&node).await.unwrap();
    assert_eq!(resolved.name, "worker-7");
    assert_eq!(resolved.instance_id, M2);
    assert_eq!(resolved.private_ip, "10.0.20.60");
}

#[tokio::test]
async fn test_find_uses_live_membership() {
    let (oci, cache) = setup();
    oci.remove_member(P1, M2);
    cache.rebuild(&[P1.to_string()]).await.unwrap();
    oci.add_member(P1, fake::member(M2, "Running"), Some("10.0.20.60"), None);

    let resolved = cache
        .find_by_details(&NodeRef::with_instance_id(M2))
        .await
        .unwrap();
    assert_eq!(resolved.pool_id, P1);
}

#[tokio::test]
async fn test_non_member_is_remembered() {
    let (oci, cache) = setup();
    cache.rebuild(&[P1.to_string()]).await.unwrap();
    let stranger = NodeRef::with_instance_id("ocid1.instance.oc1.phx.dne");

    assert!(matches!(cache.find_by_details(&stranger).await, Err(PoolError::NotMember)));
    let calls = oci.total_calls();
    assert!(matches!(cache.find_by_details(&stranger).await, Err(PoolError::NotMember)));
    assert_eq!(oci.total_calls(), calls);
}

#[tokio::test]
async fn test_find_requires_an_address() {
    let (_oci, cache) = setup();
    let node = NodeRef {
        name: "worker-1".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        cache.find_by_details(&node).await,
        Err(PoolError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_find_skips_empty_and_other_pools() {
    let (oci, cache) = setup();
    oci.add_pool(fake::pool(P2, 0));
    cache.rebuild(&[P1.to_string(), P2.to_string()]).await.unwrap();
    let before = oci.calls("ListInstancePoolInstances");

    // the hint excludes P1 and P2 is empty, so nothing is listed
    let node = NodeRef {
        pool_id: P2.to_string(),
        private_ip: "10.0.20.59".to_string(),
        ..Default::default()
    };
    assert!(matches!(cache.find_by_details(&node).await, Err(PoolError::NotMember)));
    assert_eq!(oci.calls("ListInstancePoolInstances"), before);
}

#[tokio::test]
async fn test_find_skips_members_that_are_not_running() {
    let (oci, cache) = setup();
    oci.add_member(
        P1,
        fake::member("ocid1.instance.oc1.phx.booting", "Provisioning"),
        Some("10.0.20.99"),
        None,
    );
    cache.rebuild(&[P1.to_string()]).await.unwrap();

    let result = cache
        .find_by_details(&NodeRef::with_private_ip("10.0.20.99"))
        .await;
    assert!(matches!(result, Err(PoolError::NotMember)));
}

#[tokio::test]
async fn test_find_resolves_placeholders_without_vendor_calls() {
    let (oci, cache) = setup();
    let node = NodeRef::with_instance_id(unfulfilled_instance_id(P1, 2));

    let resolved = cache.find_by_details(&node).await.unwrap();
    assert_eq!(resolved.pool_id, P1);
    assert_eq!(oci.total_calls(), 0);
}
