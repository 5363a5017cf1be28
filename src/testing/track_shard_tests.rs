//! Scenario tests for adding a replica to the primary's in-sync set.

#![cfg(test)]

use super::{init_tracing, FakeShard, RecordingChunkSender, TestPrimary};
use crate::config::ReplicationConfig;
use crate::error::{Error, ReplicationError};
use crate::network::TrackShardRequest;
use crate::replication::TrackingRegistration;
use crate::shard::{peer_recovery_lease_id, IndexShard};
use crate::types::{AllocationId, NodeDescriptor, ShardId};
use std::sync::Arc;
use std::time::{Duration, Instant};

const REPLICA_NODE: u64 = 2;

fn config() -> ReplicationConfig {
    ReplicationConfig::new()
        .unthrottled()
        .with_routing_poll_interval(Duration::from_millis(20))
        .with_routing_wait_timeout(Duration::from_millis(200))
        .with_permit_acquire_timeout(Duration::from_secs(1))
}

fn shard_id() -> ShardId {
    ShardId::new("logs", 0)
}

fn replica_allocation() -> AllocationId {
    AllocationId::new("replica-a")
}

fn track_request() -> TrackShardRequest {
    TrackShardRequest {
        request_id: 9,
        registration: TrackingRegistration {
            shard_id: shard_id(),
            target_allocation_id: replica_allocation(),
            target_node: NodeDescriptor::new(REPLICA_NODE, "127.0.0.1:9302".parse().unwrap()),
        },
    }
}

/// A primary whose shard holds its own peer recovery lease.
async fn setup(config: ReplicationConfig) -> (TestPrimary, Arc<FakeShard>) {
    init_tracing();
    let primary = TestPrimary::new(config, RecordingChunkSender::new()).unwrap();
    let shard = primary.add_shard(shard_id());
    shard.add_primary_retention_lease().await.unwrap();
    (primary, shard)
}

#[tokio::test]
async fn test_visible_allocation_is_tracked_in_sync() {
    let (primary, shard) = setup(config()).await;
    primary.routing.add(&shard_id(), &replica_allocation());

    let response = primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap();

    assert!(response.in_sync);
    assert_eq!(response.request_id, 9);

    let tracker = shard.replication_tracker();
    assert!(tracker.is_tracked(&replica_allocation()));
    assert!(tracker.is_in_sync(&replica_allocation()));
    let lease = tracker
        .retention_lease(&peer_recovery_lease_id(REPLICA_NODE))
        .unwrap();
    assert_eq!(lease.retaining_seq_no, 0);
    assert_eq!(shard.primary_permits().active_permits(), 0);
    assert_eq!(primary.coordinator.metrics().snapshot().track_shard_success, 1);
}

#[tokio::test]
async fn test_allocation_visible_after_delay() {
    let (primary, shard) = setup(config()).await;
    primary
        .routing
        .add_after(&shard_id(), &replica_allocation(), Duration::from_millis(60));

    let start = Instant::now();
    let response = primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap();

    assert!(response.in_sync);
    assert!(start.elapsed() >= Duration::from_millis(60));
    assert!(primary.routing.lookups() > 1);
    assert!(shard.replication_tracker().is_in_sync(&replica_allocation()));
}

#[tokio::test]
async fn test_allocation_never_visible_times_out() {
    let (primary, shard) = setup(config()).await;

    let start = Instant::now();
    let err = primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    match &err {
        Error::Replication(ReplicationError::RoutingTimeout {
            shard_id: s,
            allocation_id,
            waited,
        }) => {
            assert_eq!(s, &shard_id());
            assert_eq!(allocation_id, &replica_allocation());
            assert!(*waited >= Duration::from_millis(200));
        }
        other => panic!("expected routing timeout, got {:?}", other),
    }
    assert!(err.is_retryable());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2), "waited {:?}", elapsed);

    assert!(!shard.replication_tracker().is_tracked(&replica_allocation()));
    let metrics = primary.coordinator.metrics().snapshot();
    assert_eq!(metrics.track_shard_timeouts, 1);
    assert_eq!(metrics.track_shard_success, 0);
}

#[tokio::test]
async fn test_missing_primary_lease_stops_before_tracking() {
    init_tracing();
    let primary = TestPrimary::new(config(), RecordingChunkSender::new()).unwrap();
    let shard = primary.add_shard(shard_id());
    primary.routing.add(&shard_id(), &replica_allocation());

    let err = primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Replication(ReplicationError::RetentionLeaseNotFound(_))
    ));
    let tracker = shard.replication_tracker();
    assert!(!tracker.is_tracked(&replica_allocation()));
    assert!(tracker.retention_leases().is_empty());
    assert_eq!(shard.primary_permits().active_permits(), 0);
    assert_eq!(primary.coordinator.metrics().snapshot().track_shard_failures, 1);
}

#[tokio::test]
async fn test_second_registration_of_same_node_fails() {
    let (primary, _shard) = setup(config()).await;
    primary.routing.add(&shard_id(), &replica_allocation());

    primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap();
    let err = primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Replication(ReplicationError::RetentionLeaseAlreadyExists(_))
    ));
}

/// Move the primary's local checkpoint, and so the global checkpoint, to `seq_no`.
async fn advance_primary(shard: &FakeShard, seq_no: i64) {
    let tracker = shard.replication_tracker();
    let permit = shard
        .primary_permits()
        .acquire(Duration::from_secs(1))
        .await
        .unwrap();
    tracker
        .update_local_checkpoint(&permit, tracker.primary_allocation(), seq_no)
        .unwrap();
}

#[tokio::test]
async fn test_lagging_replica_is_acked_once_caught_up() {
    let (primary, shard) = setup(config()).await;
    primary.routing.add(&shard_id(), &replica_allocation());
    advance_primary(&shard, 10).await;
    assert_eq!(shard.replication_tracker().global_checkpoint(), 10);

    let catch_up = {
        let shard = shard.clone();
        tokio::spawn(async move {
            let tracker = shard.replication_tracker();
            while !tracker.is_pending_in_sync(&replica_allocation()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            let permit = shard
                .primary_permits()
                .acquire(Duration::from_secs(1))
                .await
                .unwrap();
            tracker
                .update_local_checkpoint(&permit, &replica_allocation(), 10)
                .unwrap();
        })
    };

    let start = Instant::now();
    let response = primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap();
    catch_up.await.unwrap();

    assert!(response.in_sync);
    assert!(start.elapsed() >= Duration::from_millis(50));
    let tracker = shard.replication_tracker();
    assert!(tracker.is_in_sync(&replica_allocation()));
    assert!(!tracker.is_pending_in_sync(&replica_allocation()));
    assert_eq!(tracker.global_checkpoint(), 10);
    assert_eq!(shard.primary_permits().active_permits(), 0);
    assert_eq!(primary.coordinator.metrics().snapshot().track_shard_success, 1);
}

#[tokio::test]
async fn test_replica_that_never_catches_up_is_rolled_back() {
    let config = config().with_in_sync_timeout(Duration::from_millis(100));
    let (primary, shard) = setup(config).await;
    primary.routing.add(&shard_id(), &replica_allocation());
    advance_primary(&shard, 10).await;

    let err = primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Replication(ReplicationError::InSyncTimeout { .. })
    ));
    assert!(err.is_retryable());

    let tracker = shard.replication_tracker();
    assert!(!tracker.is_tracked(&replica_allocation()));
    assert!(!tracker.is_pending_in_sync(&replica_allocation()));
    assert!(tracker
        .retention_lease(&peer_recovery_lease_id(REPLICA_NODE))
        .is_none());
    assert_eq!(shard.primary_permits().active_permits(), 0);
    assert_eq!(primary.coordinator.metrics().snapshot().track_shard_timeouts, 1);

    // Nothing left over, so the replica can register again once it has caught up.
    let permit = shard
        .primary_permits()
        .acquire(Duration::from_secs(1))
        .await
        .unwrap();
    tracker.initiate_tracking(&permit, &replica_allocation());
    tracker
        .update_local_checkpoint(&permit, &replica_allocation(), 10)
        .unwrap();
    drop(permit);
    let retry = primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap();
    assert!(retry.in_sync);
}

#[tokio::test]
async fn test_tracking_after_primary_term_bump() {
    let (primary, shard) = setup(config()).await;
    primary.routing.add(&shard_id(), &replica_allocation());

    shard
        .primary_permits()
        .update_primary_term(2, Duration::from_secs(1))
        .await
        .unwrap();

    let response = primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap();

    assert!(response.in_sync);
    let tracker = shard.replication_tracker();
    assert_eq!(tracker.primary_term(), 2);
    assert!(tracker.is_in_sync(&replica_allocation()));
}

#[tokio::test]
async fn test_relocated_primary_rejects_tracking() {
    let (primary, shard) = setup(config()).await;
    primary.routing.add(&shard_id(), &replica_allocation());
    shard
        .primary_permits()
        .relocate(Duration::from_secs(1))
        .await
        .unwrap();

    let err = primary
        .coordinator
        .handle_track_shard(track_request())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Replication(ReplicationError::PrimaryRelocated(_))
    ));
    assert!(!shard.replication_tracker().is_tracked(&replica_allocation()));
}

#[tokio::test]
async fn test_shutdown_cancels_routing_wait() {
    let config = config().with_routing_wait_timeout(Duration::from_secs(30));
    let (primary, _shard) = setup(config).await;

    let coordinator = primary.coordinator.clone();
    let start = Instant::now();
    let pending = tokio::spawn(async move { coordinator.handle_track_shard(track_request()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    primary.coordinator.shutdown();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(primary.coordinator.is_shutdown());
}

#[tokio::test]
async fn test_unknown_shard_fails_without_polling() {
    let (primary, _shard) = setup(config()).await;
    let mut request = track_request();
    request.registration.shard_id = ShardId::new("logs", 7);

    let err = primary
        .coordinator
        .handle_track_shard(request)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ShardNotFound(_)));
    assert_eq!(primary.routing.lookups(), 0);
}
