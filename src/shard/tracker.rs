//! In-sync tracking for a primary's replication group.
//!
//! The tracker records, per allocation, the highest sequence number the copy
//! has processed (its local checkpoint) and whether it belongs to the in-sync
//! set. The global checkpoint is the minimum local checkpoint of the in-sync
//! set. Every mutation requires a [`PrimaryPermit`] for this shard. A permit
//! from a newer primary term moves the tracker to that term; one from an
//! older term is a bug.
//!
//! ```text
//!   initiate_tracking ──► tracked ──► update_local_checkpoint ──► mark_in_sync
//!                                                   │                  │
//!                                                   │   lagging ───► pending
//!                                                   └─ catches up ──► in-sync
//! ```

use super::PrimaryPermit;
use crate::error::{Error, ReplicationError, Result};
use crate::types::{AllocationId, NodeId, ShardId, NO_OPS_PERFORMED, UNASSIGNED_SEQ_NO};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Source tag of leases created for peer recovery.
pub const PEER_RECOVERY_LEASE_SOURCE: &str = "peer recovery";

/// Id of the peer recovery retention lease held for `node`.
pub fn peer_recovery_lease_id(node: NodeId) -> String {
    format!("peer_recovery/{}", node)
}

/// Keeps operation history at or above `retaining_seq_no` available to a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionLease {
    pub id: String,
    pub retaining_seq_no: i64,
    pub timestamp_millis: u64,
    pub source: String,
}

/// Tracking state of a single allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointState {
    pub local_checkpoint: i64,
    pub global_checkpoint: i64,
    pub in_sync: bool,
    pub tracked: bool,
}

impl CheckpointState {
    fn untracked() -> Self {
        Self {
            local_checkpoint: UNASSIGNED_SEQ_NO,
            global_checkpoint: UNASSIGNED_SEQ_NO,
            in_sync: false,
            tracked: false,
        }
    }
}

struct TrackerState {
    checkpoints: HashMap<AllocationId, CheckpointState>,
    retention_leases: HashMap<String, RetentionLease>,
    pending_in_sync: HashSet<AllocationId>,
    global_checkpoint: i64,
}

/// Replication group tracking for one primary shard.
pub struct ReplicationTracker {
    shard_id: ShardId,
    local_node_id: NodeId,
    primary_allocation: AllocationId,
    primary_term: AtomicU64,
    state: RwLock<TrackerState>,
    in_sync_changed: Notify,
}

impl ReplicationTracker {
    /// Create a tracker whose only in-sync copy is the primary itself.
    pub fn new(
        shard_id: ShardId,
        local_node_id: NodeId,
        primary_allocation: AllocationId,
        primary_term: u64,
    ) -> Self {
        let mut checkpoints = HashMap::new();
        checkpoints.insert(
            primary_allocation.clone(),
            CheckpointState {
                local_checkpoint: NO_OPS_PERFORMED,
                global_checkpoint: NO_OPS_PERFORMED,
                in_sync: true,
                tracked: true,
            },
        );

        Self {
            shard_id,
            local_node_id,
            primary_allocation,
            primary_term: AtomicU64::new(primary_term),
            state: RwLock::new(TrackerState {
                checkpoints,
                retention_leases: HashMap::new(),
                pending_in_sync: HashSet::new(),
                global_checkpoint: NO_OPS_PERFORMED,
            }),
            in_sync_changed: Notify::new(),
        }
    }

    /// Shard being tracked.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Allocation of the primary copy.
    pub fn primary_allocation(&self) -> &AllocationId {
        &self.primary_allocation
    }

    /// Highest primary term seen so far.
    pub fn primary_term(&self) -> u64 {
        self.primary_term.load(Ordering::SeqCst)
    }

    /// Move the tracker to a newer primary term. Lower terms are ignored.
    pub fn update_primary_term(&self, term: u64) {
        let previous = self.primary_term.fetch_max(term, Ordering::SeqCst);
        if term > previous {
            debug!(shard_id = %self.shard_id, previous, term, "Tracker adopted primary term");
        }
    }

    /// Create the primary's own peer recovery retention lease.
    pub fn add_peer_recovery_retention_lease(
        &self,
        permit: &PrimaryPermit,
        retaining_seq_no: i64,
    ) -> Result<RetentionLease> {
        self.verify_permit(permit);
        let id = peer_recovery_lease_id(self.local_node_id);
        let mut state = self.state.write();
        if state.retention_leases.contains_key(&id) {
            return Err(ReplicationError::RetentionLeaseAlreadyExists(id).into());
        }
        let lease = RetentionLease {
            id: id.clone(),
            retaining_seq_no,
            timestamp_millis: now_millis(),
            source: PEER_RECOVERY_LEASE_SOURCE.to_string(),
        };
        state.retention_leases.insert(id, lease.clone());
        Ok(lease)
    }

    /// Give `node` a copy of the primary's peer recovery retention lease.
    pub fn clone_local_peer_recovery_retention_lease(
        &self,
        permit: &PrimaryPermit,
        node: NodeId,
    ) -> Result<RetentionLease> {
        self.verify_permit(permit);
        let source_id = peer_recovery_lease_id(self.local_node_id);
        let target_id = peer_recovery_lease_id(node);

        let mut state = self.state.write();
        let source = state
            .retention_leases
            .get(&source_id)
            .cloned()
            .ok_or(ReplicationError::RetentionLeaseNotFound(source_id))?;
        if state.retention_leases.contains_key(&target_id) {
            return Err(ReplicationError::RetentionLeaseAlreadyExists(target_id).into());
        }

        let lease = RetentionLease {
            id: target_id.clone(),
            retaining_seq_no: source.retaining_seq_no,
            timestamp_millis: now_millis(),
            source: PEER_RECOVERY_LEASE_SOURCE.to_string(),
        };
        state.retention_leases.insert(target_id, lease.clone());
        debug!(
            shard_id = %self.shard_id,
            lease_id = %lease.id,
            retaining_seq_no = lease.retaining_seq_no,
            "Cloned peer recovery retention lease"
        );
        Ok(lease)
    }

    /// Drop a retention lease. Returns the removed lease, if any.
    pub fn remove_retention_lease(
        &self,
        permit: &PrimaryPermit,
        id: &str,
    ) -> Option<RetentionLease> {
        self.verify_permit(permit);
        let removed = self.state.write().retention_leases.remove(id);
        if removed.is_some() {
            debug!(shard_id = %self.shard_id, lease_id = id, "Removed retention lease");
        }
        removed
    }

    /// Start tracking an allocation. Tracking an already tracked copy is a no-op.
    pub fn initiate_tracking(&self, permit: &PrimaryPermit, allocation_id: &AllocationId) {
        self.verify_permit(permit);
        let mut state = self.state.write();
        let entry = state
            .checkpoints
            .entry(allocation_id.clone())
            .or_insert_with(CheckpointState::untracked);
        if !entry.tracked {
            entry.tracked = true;
            debug!(shard_id = %self.shard_id, %allocation_id, "Initiated tracking");
        }
    }

    /// Advance an allocation's local checkpoint. Regressions are ignored.
    pub fn update_local_checkpoint(
        &self,
        permit: &PrimaryPermit,
        allocation_id: &AllocationId,
        checkpoint: i64,
    ) -> Result<()> {
        self.verify_permit(permit);
        let mut state = self.state.write();
        let entry = state
            .checkpoints
            .get_mut(allocation_id)
            .filter(|s| s.tracked)
            .ok_or_else(|| ReplicationError::AllocationNotTracked(allocation_id.clone()))?;
        if checkpoint > entry.local_checkpoint {
            entry.local_checkpoint = checkpoint;
        }
        let local = entry.local_checkpoint;

        if state.pending_in_sync.contains(allocation_id) && local >= state.global_checkpoint {
            state.pending_in_sync.remove(allocation_id);
            if let Some(entry) = state.checkpoints.get_mut(allocation_id) {
                entry.in_sync = true;
            }
            info!(shard_id = %self.shard_id, %allocation_id, "Pending allocation caught up, now in-sync");
            Self::recompute_global_checkpoint(&mut state);
            drop(state);
            self.in_sync_changed.notify_waiters();
            return Ok(());
        }

        Self::recompute_global_checkpoint(&mut state);
        Ok(())
    }

    /// Add an allocation to the in-sync set.
    ///
    /// Returns `true` when the copy is in-sync on return. A copy lagging the
    /// global checkpoint is recorded as pending and joins once
    /// [`update_local_checkpoint`](Self::update_local_checkpoint) catches it up.
    pub fn mark_allocation_in_sync(
        &self,
        permit: &PrimaryPermit,
        allocation_id: &AllocationId,
        local_checkpoint: i64,
    ) -> Result<bool> {
        self.verify_permit(permit);
        let mut state = self.state.write();
        let global = state.global_checkpoint;
        let entry = state
            .checkpoints
            .get_mut(allocation_id)
            .filter(|s| s.tracked)
            .ok_or_else(|| ReplicationError::AllocationNotTracked(allocation_id.clone()))?;

        if local_checkpoint > entry.local_checkpoint {
            entry.local_checkpoint = local_checkpoint;
        }
        if entry.in_sync {
            return Ok(true);
        }

        if entry.local_checkpoint >= global {
            entry.in_sync = true;
            state.pending_in_sync.remove(allocation_id);
            Self::recompute_global_checkpoint(&mut state);
            info!(shard_id = %self.shard_id, %allocation_id, "Marked allocation in-sync");
            Ok(true)
        } else {
            let lagging = entry.local_checkpoint;
            state.pending_in_sync.insert(allocation_id.clone());
            debug!(
                shard_id = %self.shard_id,
                %allocation_id,
                local_checkpoint = lagging,
                global_checkpoint = global,
                "Allocation lags global checkpoint, in-sync pending"
            );
            Ok(false)
        }
    }

    /// Stop waiting for a pending allocation and drop it from tracking.
    ///
    /// Copies that already made it into the in-sync set are left alone.
    /// Returns whether anything was undone.
    pub fn cancel_pending_in_sync(
        &self,
        permit: &PrimaryPermit,
        allocation_id: &AllocationId,
    ) -> bool {
        self.verify_permit(permit);
        let mut state = self.state.write();
        if !state.pending_in_sync.remove(allocation_id) {
            return false;
        }
        if let Some(entry) = state.checkpoints.get(allocation_id) {
            if !entry.in_sync {
                state.checkpoints.remove(allocation_id);
            }
        }
        drop(state);
        self.in_sync_changed.notify_waiters();
        debug!(shard_id = %self.shard_id, %allocation_id, "Cancelled pending in-sync");
        true
    }

    /// Wait until a pending allocation joins the in-sync set.
    ///
    /// Fails with a retryable [`ReplicationError::InSyncTimeout`] once
    /// `timeout` has passed, with [`Error::Cancelled`] when `cancel` fires and
    /// with [`ReplicationError::AllocationNotTracked`] if the allocation stops
    /// being pending without becoming in-sync.
    pub async fn wait_for_in_sync(
        &self,
        allocation_id: &AllocationId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let start = tokio::time::Instant::now();
        let deadline = start + timeout;

        loop {
            let notified = self.in_sync_changed.notified();
            tokio::pin!(notified);
            // Register before checking so a promotion in between is not missed.
            notified.as_mut().enable();

            if self.is_in_sync(allocation_id) {
                return Ok(());
            }
            if !self.is_pending_in_sync(allocation_id) {
                return Err(ReplicationError::AllocationNotTracked(allocation_id.clone()).into());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ReplicationError::InSyncTimeout {
                        allocation_id: allocation_id.clone(),
                        waited: start.elapsed(),
                    }
                    .into());
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Minimum local checkpoint across the in-sync set.
    pub fn global_checkpoint(&self) -> i64 {
        self.state.read().global_checkpoint
    }

    /// Tracking state of one allocation.
    pub fn checkpoint_state(&self, allocation_id: &AllocationId) -> Option<CheckpointState> {
        self.state.read().checkpoints.get(allocation_id).copied()
    }

    /// Whether the allocation is tracked.
    pub fn is_tracked(&self, allocation_id: &AllocationId) -> bool {
        self.checkpoint_state(allocation_id)
            .is_some_and(|s| s.tracked)
    }

    /// Whether the allocation is in the in-sync set.
    pub fn is_in_sync(&self, allocation_id: &AllocationId) -> bool {
        self.checkpoint_state(allocation_id)
            .is_some_and(|s| s.in_sync)
    }

    /// Whether the allocation is waiting to become in-sync.
    pub fn is_pending_in_sync(&self, allocation_id: &AllocationId) -> bool {
        self.state.read().pending_in_sync.contains(allocation_id)
    }

    /// Allocations currently in-sync.
    pub fn in_sync_allocations(&self) -> Vec<AllocationId> {
        let state = self.state.read();
        let mut ids: Vec<_> = state
            .checkpoints
            .iter()
            .filter(|(_, s)| s.in_sync)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Retention lease by id.
    pub fn retention_lease(&self, id: &str) -> Option<RetentionLease> {
        self.state.read().retention_leases.get(id).cloned()
    }

    /// All retention leases, sorted by id.
    pub fn retention_leases(&self) -> Vec<RetentionLease> {
        let state = self.state.read();
        let mut leases: Vec<_> = state.retention_leases.values().cloned().collect();
        leases.sort_by(|a, b| a.id.cmp(&b.id));
        leases
    }

    fn verify_permit(&self, permit: &PrimaryPermit) {
        assert!(
            permit.shard_id() == &self.shard_id,
            "permit for {} used on {}",
            permit.shard_id(),
            self.shard_id
        );
        let current = self
            .primary_term
            .fetch_max(permit.primary_term(), Ordering::SeqCst);
        assert!(
            permit.primary_term() >= current,
            "permit for {} term {} used on {} term {}",
            permit.shard_id(),
            permit.primary_term(),
            self.shard_id,
            current
        );
    }

    fn recompute_global_checkpoint(state: &mut TrackerState) {
        let min = state
            .checkpoints
            .values()
            .filter(|s| s.in_sync)
            .map(|s| s.local_checkpoint)
            .min()
            .unwrap_or(NO_OPS_PERFORMED);
        // The global checkpoint never goes backwards.
        if min > state.global_checkpoint {
            state.global_checkpoint = min;
            for s in state.checkpoints.values_mut().filter(|s| s.in_sync) {
                s.global_checkpoint = min;
            }
        }
    }
}

impl std::fmt::Debug for ReplicationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ReplicationTracker")
            .field("shard_id", &self.shard_id)
            .field("primary_term", &self.primary_term())
            .field("global_checkpoint", &state.global_checkpoint)
            .field("tracked", &state.checkpoints.len())
            .field("retention_leases", &state.retention_leases.len())
            .finish()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::PrimaryPermits;
    use std::time::Duration;

    const PRIMARY_NODE: NodeId = 1;

    fn setup() -> (PrimaryPermits, ReplicationTracker) {
        let shard_id = ShardId::new("logs", 0);
        let permits = PrimaryPermits::new(shard_id.clone(), 1);
        let tracker =
            ReplicationTracker::new(shard_id, PRIMARY_NODE, AllocationId::new("primary"), 1);
        (permits, tracker)
    }

    async fn permit(permits: &PrimaryPermits) -> PrimaryPermit {
        permits.acquire(Duration::from_secs(1)).await.unwrap()
    }

    #[tokio::test]
    async fn test_primary_starts_in_sync() {
        let (_permits, tracker) = setup();
        assert!(tracker.is_in_sync(&AllocationId::new("primary")));
        assert_eq!(tracker.global_checkpoint(), NO_OPS_PERFORMED);
    }

    #[tokio::test]
    async fn test_clone_lease_requires_primary_lease() {
        let (permits, tracker) = setup();
        let permit = permit(&permits).await;

        let err = tracker
            .clone_local_peer_recovery_retention_lease(&permit, 2)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Replication(ReplicationError::RetentionLeaseNotFound(_))
        ));

        tracker.add_peer_recovery_retention_lease(&permit, 0).unwrap();
        let lease = tracker
            .clone_local_peer_recovery_retention_lease(&permit, 2)
            .unwrap();
        assert_eq!(lease.id, "peer_recovery/2");
        assert_eq!(lease.source, PEER_RECOVERY_LEASE_SOURCE);
        assert_eq!(lease.retaining_seq_no, 0);

        let err = tracker
            .clone_local_peer_recovery_retention_lease(&permit, 2)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Replication(ReplicationError::RetentionLeaseAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_track_and_mark_in_sync() {
        let (permits, tracker) = setup();
        let permit = permit(&permits).await;
        let replica = AllocationId::new("replica");

        tracker.initiate_tracking(&permit, &replica);
        assert!(tracker.is_tracked(&replica));
        assert!(!tracker.is_in_sync(&replica));

        tracker
            .update_local_checkpoint(&permit, &replica, NO_OPS_PERFORMED)
            .unwrap();
        assert!(tracker
            .mark_allocation_in_sync(&permit, &replica, NO_OPS_PERFORMED)
            .unwrap());
        assert!(tracker.is_in_sync(&replica));
        assert_eq!(tracker.in_sync_allocations().len(), 2);
    }

    #[tokio::test]
    async fn test_mark_in_sync_requires_tracking() {
        let (permits, tracker) = setup();
        let permit = permit(&permits).await;
        let err = tracker
            .mark_allocation_in_sync(&permit, &AllocationId::new("ghost"), 0)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Replication(ReplicationError::AllocationNotTracked(_))
        ));
    }

    #[tokio::test]
    async fn test_lagging_copy_is_pending_until_caught_up() {
        let (permits, tracker) = setup();
        let permit = permit(&permits).await;
        let primary = AllocationId::new("primary");
        let replica = AllocationId::new("replica");

        tracker.update_local_checkpoint(&permit, &primary, 10).unwrap();
        assert_eq!(tracker.global_checkpoint(), 10);

        tracker.initiate_tracking(&permit, &replica);
        assert!(!tracker
            .mark_allocation_in_sync(&permit, &replica, 4)
            .unwrap());
        assert!(tracker.is_pending_in_sync(&replica));

        tracker.update_local_checkpoint(&permit, &replica, 10).unwrap();
        assert!(tracker.is_in_sync(&replica));
        assert!(!tracker.is_pending_in_sync(&replica));
    }

    #[tokio::test]
    async fn test_local_checkpoint_ignores_regression() {
        let (permits, tracker) = setup();
        let permit = permit(&permits).await;
        let primary = AllocationId::new("primary");
        tracker.update_local_checkpoint(&permit, &primary, 7).unwrap();
        tracker.update_local_checkpoint(&permit, &primary, 3).unwrap();
        assert_eq!(
            tracker.checkpoint_state(&primary).unwrap().local_checkpoint,
            7
        );
        assert_eq!(tracker.global_checkpoint(), 7);
    }

    #[tokio::test]
    async fn test_permit_from_newer_term_is_adopted() {
        let (permits, tracker) = setup();
        permits
            .update_primary_term(2, Duration::from_secs(1))
            .await
            .unwrap();
        let permit = permit(&permits).await;

        tracker.initiate_tracking(&permit, &AllocationId::new("replica"));
        assert_eq!(tracker.primary_term(), 2);
        assert!(tracker.is_tracked(&AllocationId::new("replica")));
    }

    #[tokio::test]
    #[should_panic(expected = "term 1 used on")]
    async fn test_permit_from_older_term_panics() {
        let (permits, tracker) = setup();
        tracker.update_primary_term(3);
        let stale = permit(&permits).await;
        tracker.initiate_tracking(&stale, &AllocationId::new("replica"));
    }

    #[tokio::test]
    async fn test_wait_for_in_sync_wakes_on_catch_up() {
        let (permits, tracker) = setup();
        let tracker = std::sync::Arc::new(tracker);
        let permits = std::sync::Arc::new(permits);
        let primary = AllocationId::new("primary");
        let replica = AllocationId::new("replica");
        {
            let permit = permit(&permits).await;
            tracker.update_local_checkpoint(&permit, &primary, 10).unwrap();
            tracker.initiate_tracking(&permit, &replica);
            assert!(!tracker
                .mark_allocation_in_sync(&permit, &replica, 2)
                .unwrap());
        }

        let catch_up = {
            let tracker = tracker.clone();
            let permits = permits.clone();
            let replica = replica.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let permit = permit(&permits).await;
                tracker.update_local_checkpoint(&permit, &replica, 10).unwrap();
            })
        };

        tracker
            .wait_for_in_sync(&replica, Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap();
        assert!(tracker.is_in_sync(&replica));
        catch_up.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_in_sync_times_out_and_cancel_undoes_pending() {
        let (permits, tracker) = setup();
        let permit = permit(&permits).await;
        let primary = AllocationId::new("primary");
        let replica = AllocationId::new("replica");
        tracker.update_local_checkpoint(&permit, &primary, 10).unwrap();
        tracker.initiate_tracking(&permit, &replica);
        assert!(!tracker
            .mark_allocation_in_sync(&permit, &replica, 2)
            .unwrap());

        let err = tracker
            .wait_for_in_sync(&replica, Duration::from_millis(40), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            crate::Error::Replication(ReplicationError::InSyncTimeout { .. })
        ));

        assert!(tracker.cancel_pending_in_sync(&permit, &replica));
        assert!(!tracker.is_pending_in_sync(&replica));
        assert!(!tracker.is_tracked(&replica));
        assert!(!tracker.cancel_pending_in_sync(&permit, &replica));
        assert!(tracker.is_in_sync(&primary));
    }

    #[tokio::test]
    #[should_panic(expected = "permit for")]
    async fn test_foreign_permit_panics() {
        let (_permits, tracker) = setup();
        let other = PrimaryPermits::new(ShardId::new("metrics", 0), 1);
        let foreign = other.acquire(Duration::from_secs(1)).await.unwrap();
        tracker.initiate_tracking(&foreign, &AllocationId::new("replica"));
    }
}
