//! Primary operation permits.
//!
//! Every mutation of replication tracking state runs while holding a
//! [`PrimaryPermit`]. Relocation hand-off takes all permits at once, so it
//! waits for in-flight holders and blocks new ones; once the hand-off is done
//! the shard refuses further permits.

use crate::error::{Error, ReplicationError, Result};
use crate::types::ShardId;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Number of concurrent operation permits; relocation acquires all of them.
const OPERATION_PERMITS: u32 = 1 << 24;

/// Issues primary permits for one shard.
pub struct PrimaryPermits {
    shard_id: ShardId,
    primary_term: AtomicU64,
    semaphore: Arc<Semaphore>,
    relocated: AtomicBool,
    closed: AtomicBool,
}

impl PrimaryPermits {
    /// Create permits for a primary at the given term.
    pub fn new(shard_id: ShardId, primary_term: u64) -> Self {
        Self {
            shard_id,
            primary_term: AtomicU64::new(primary_term),
            semaphore: Arc::new(Semaphore::new(OPERATION_PERMITS as usize)),
            relocated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Shard the permits guard.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Current primary term.
    pub fn primary_term(&self) -> u64 {
        self.primary_term.load(Ordering::SeqCst)
    }

    /// Whether the primary has been handed off.
    pub fn is_relocated(&self) -> bool {
        self.relocated.load(Ordering::SeqCst)
    }

    /// Whether the shard has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of permits currently held.
    pub fn active_permits(&self) -> usize {
        OPERATION_PERMITS as usize - self.semaphore.available_permits()
    }

    /// Acquire an operation permit, waiting at most `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<PrimaryPermit> {
        self.ensure_accepting()?;

        let permit = match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ReplicationError::ShardClosed(self.shard_id.clone()).into()),
            Err(_) => return Err(Error::Timeout),
        };

        // A hand-off may have completed while this request was queued behind it.
        self.ensure_accepting()?;

        Ok(PrimaryPermit {
            shard_id: self.shard_id.clone(),
            primary_term: self.primary_term(),
            _permit: permit,
        })
    }

    /// Hand the primary off: wait for every permit holder, then stop issuing permits.
    pub async fn relocate(&self, timeout: Duration) -> Result<()> {
        self.ensure_accepting()?;
        let all = self.block_operations(timeout).await?;

        self.relocated.store(true, Ordering::SeqCst);
        drop(all);
        info!(shard_id = %self.shard_id, "Primary relocated, permits no longer issued");
        Ok(())
    }

    /// Bump the primary term, for example after a promotion.
    ///
    /// Waits for every permit issued under the old term to be released, so
    /// no permit outlives the term it was issued for. Lower terms are ignored.
    pub async fn update_primary_term(&self, term: u64, timeout: Duration) -> Result<()> {
        if term <= self.primary_term() {
            return Ok(());
        }
        let all = self.block_operations(timeout).await?;
        let previous = self.primary_term.fetch_max(term, Ordering::SeqCst);
        drop(all);
        debug!(shard_id = %self.shard_id, previous, term, "Primary term updated");
        Ok(())
    }

    /// Take every operation permit, waiting at most `timeout`.
    async fn block_operations(&self, timeout: Duration) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(
            timeout,
            self.semaphore.clone().acquire_many_owned(OPERATION_PERMITS),
        )
        .await
        {
            Ok(Ok(all)) => Ok(all),
            Ok(Err(_)) => Err(ReplicationError::ShardClosed(self.shard_id.clone()).into()),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Close the shard; waiting and future acquisitions fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ReplicationError::ShardClosed(self.shard_id.clone()).into());
        }
        if self.is_relocated() {
            return Err(ReplicationError::PrimaryRelocated(self.shard_id.clone()).into());
        }
        Ok(())
    }
}

impl fmt::Debug for PrimaryPermits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryPermits")
            .field("shard_id", &self.shard_id)
            .field("primary_term", &self.primary_term())
            .field("active_permits", &self.active_permits())
            .field("relocated", &self.is_relocated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Proof that the holder may mutate the shard's tracking state.
///
/// Released when dropped.
#[derive(Debug)]
pub struct PrimaryPermit {
    shard_id: ShardId,
    primary_term: u64,
    _permit: OwnedSemaphorePermit,
}

impl PrimaryPermit {
    /// Shard the permit was issued for.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Primary term at the time of issue.
    pub fn primary_term(&self) -> u64 {
        self.primary_term
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permits() -> Arc<PrimaryPermits> {
        Arc::new(PrimaryPermits::new(ShardId::new("logs", 0), 1))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let permits = permits();
        let permit = permits.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(permits.active_permits(), 1);
        assert_eq!(permit.primary_term(), 1);
        drop(permit);
        assert_eq!(permits.active_permits(), 0);
    }

    #[tokio::test]
    async fn test_relocation_waits_for_holders() {
        let permits = permits();
        let permit = permits.acquire(Duration::from_secs(1)).await.unwrap();

        let relocating = permits.clone();
        let handle =
            tokio::spawn(async move { relocating.relocate(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!permits.is_relocated());

        drop(permit);
        handle.await.unwrap().unwrap();
        assert!(permits.is_relocated());

        let err = permits.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Replication(ReplicationError::PrimaryRelocated(_))
        ));
    }

    #[tokio::test]
    async fn test_relocation_times_out_while_permit_held() {
        let permits = permits();
        let _permit = permits.acquire(Duration::from_secs(1)).await.unwrap();
        let err = permits.relocate(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(!permits.is_relocated());
    }

    #[tokio::test]
    async fn test_closed_shard_refuses_permits() {
        let permits = permits();
        permits.close();
        let err = permits.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Replication(ReplicationError::ShardClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_primary_term_never_goes_back() {
        let permits = permits();
        permits.update_primary_term(3, Duration::from_secs(1)).await.unwrap();
        permits.update_primary_term(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(permits.primary_term(), 3);

        let permit = permits.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(permit.primary_term(), 3);
    }

    #[tokio::test]
    async fn test_term_bump_waits_for_old_term_permits() {
        let permits = permits();
        let permit = permits.acquire(Duration::from_secs(1)).await.unwrap();

        let err = permits
            .update_primary_term(2, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(permits.primary_term(), 1);

        drop(permit);
        permits.update_primary_term(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(permits.primary_term(), 2);
    }
}
