//! Registering a new replica into the primary's in-sync set.
//!
//! The replica's allocation must first be visible in the primary's routing
//! table. The primary learns about it from cluster state application on a
//! separate path, so visibility is polled with a bound. Once visible, the
//! four tracking mutations run in order under one primary permit so a
//! relocation hand-off cannot interleave with them. A replica that lags the
//! global checkpoint is waited for under the same permit; the request only
//! succeeds once the replica is in-sync.

use crate::error::{Error, ReplicationError, Result};
use crate::shard::{IndexShard, RoutingTable};
use crate::types::{AllocationId, NodeDescriptor, ShardId, NO_OPS_PERFORMED};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Request context for adding one replica to the tracking set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRegistration {
    pub shard_id: ShardId,
    pub target_allocation_id: AllocationId,
    pub target_node: NodeDescriptor,
}

/// Bounds on the routing visibility wait.
#[derive(Debug, Clone, Copy)]
pub struct RoutingWait {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Poll `routing` until the allocation shows up.
///
/// Returns how long the wait took. Fails with a retryable
/// [`ReplicationError::RoutingTimeout`] once `wait.timeout` has passed and
/// with [`Error::Cancelled`] when `cancel` fires.
pub async fn wait_for_allocation(
    routing: &dyn RoutingTable,
    shard_id: &ShardId,
    allocation_id: &AllocationId,
    wait: RoutingWait,
    cancel: &CancellationToken,
) -> Result<Duration> {
    let start = Instant::now();

    loop {
        if routing.has_allocation(shard_id, allocation_id) {
            return Ok(start.elapsed());
        }

        let waited = start.elapsed();
        if waited >= wait.timeout {
            return Err(ReplicationError::RoutingTimeout {
                shard_id: shard_id.clone(),
                allocation_id: allocation_id.clone(),
                waited,
            }
            .into());
        }

        debug!(%shard_id, %allocation_id, waited_ms = waited.as_millis() as u64, "Allocation not yet in routing table");

        let nap = wait.poll_interval.min(wait.timeout - waited);
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
}

/// Bounds on the permit and in-sync waits of [`track_replica`].
#[derive(Debug, Clone, Copy)]
pub struct TrackingTimeouts {
    pub permit: Duration,
    pub in_sync: Duration,
}

/// Run the tracking mutations for `registration` under one primary permit.
///
/// Returns once the replica is in the in-sync set. If it lags the global
/// checkpoint and does not catch up within `timeouts.in_sync`, or `cancel`
/// fires first, its lease and pending entry are removed again so a retry
/// starts from scratch.
pub async fn track_replica(
    shard: &dyn IndexShard,
    registration: &TrackingRegistration,
    timeouts: TrackingTimeouts,
    cancel: &CancellationToken,
) -> Result<()> {
    let permit = shard.primary_permits().acquire(timeouts.permit).await?;
    let tracker = shard.replication_tracker();
    let allocation_id = &registration.target_allocation_id;

    // The remaining steps assume the lease exists, so a failure here ends the request.
    let lease =
        tracker.clone_local_peer_recovery_retention_lease(&permit, registration.target_node.id)?;
    tracker.initiate_tracking(&permit, allocation_id);
    tracker.update_local_checkpoint(&permit, allocation_id, NO_OPS_PERFORMED)?;
    if !tracker.mark_allocation_in_sync(&permit, allocation_id, NO_OPS_PERFORMED)? {
        debug!(
            shard_id = %registration.shard_id,
            %allocation_id,
            timeout_ms = timeouts.in_sync.as_millis() as u64,
            "Waiting for replica to catch up"
        );
        if let Err(e) = tracker
            .wait_for_in_sync(allocation_id, timeouts.in_sync, cancel)
            .await
        {
            tracker.cancel_pending_in_sync(&permit, allocation_id);
            tracker.remove_retention_lease(&permit, &lease.id);
            warn!(
                shard_id = %registration.shard_id,
                %allocation_id,
                error = %e,
                "Replica did not become in-sync, tracking rolled back"
            );
            return Err(e);
        }
    }

    info!(
        shard_id = %registration.shard_id,
        %allocation_id,
        target_node = registration.target_node.id,
        lease_id = %lease.id,
        "Replica tracked in-sync"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct StaticRouting {
        visible: Mutex<HashSet<AllocationId>>,
    }

    impl RoutingTable for StaticRouting {
        fn has_allocation(&self, _shard_id: &ShardId, allocation_id: &AllocationId) -> bool {
            self.visible.lock().contains(allocation_id)
        }
    }

    fn wait(timeout_ms: u64) -> RoutingWait {
        RoutingWait {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_visible_allocation_returns_immediately() {
        let routing = StaticRouting::default();
        let allocation = AllocationId::new("a");
        routing.visible.lock().insert(allocation.clone());

        let waited = wait_for_allocation(
            &routing,
            &ShardId::new("logs", 0),
            &allocation,
            wait(1000),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(waited < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_missing_allocation_times_out() {
        let routing = StaticRouting::default();
        let start = Instant::now();
        let err = wait_for_allocation(
            &routing,
            &ShardId::new("logs", 0),
            &AllocationId::new("a"),
            wait(50),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            Error::Replication(ReplicationError::RoutingTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let routing = StaticRouting::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = wait_for_allocation(
            &routing,
            &ShardId::new("logs", 0),
            &AllocationId::new("a"),
            wait(10_000),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
