//! Lock manager and lock handles

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use raftable_api::{DatabaseError, DatabaseService, Result, TableModificationType, WriteStatus};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{LOCK_TABLE, LOCK_TABLE_TTL_MILLIS, LockStats, LockStatsCollector, new_lock_id};
use crate::raft::events::DatabaseEvent;

/// Failed waiter retries back off up to this multiple of the base delay
const MAX_RETRY_BACKOFF_FACTOR: u32 = 32;

/// A blocked `lock` call waiting for the path to be released
struct LockWaiter {
    lock_id: String,
    /// None waits forever
    deadline: Option<Instant>,
    /// Receives the instant the lock was granted
    tx: oneshot::Sender<Instant>,
}

impl LockWaiter {
    fn is_expired(&self, now: Instant) -> bool {
        self.tx.is_closed() || self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

type WaiterQueue = Arc<Mutex<VecDeque<LockWaiter>>>;

/// Outcome of one pass over a path's waiters
enum RetryOutcome {
    Done,
    /// The acquire attempt failed; the head waiter is still queued
    Failed,
}

/// Hands out [`DistributedLock`]s and wakes their waiters when a lock row
/// is deleted.
pub struct LockManager {
    database: Arc<dyn DatabaseService>,
    member: String,
    /// path -> waiters in arrival order; a path's queue is held across each
    /// acquire attempt on that path
    waiters: DashMap<String, WaiterQueue>,
    /// Paths with a backoff retry in flight
    retrying: DashSet<String>,
    retry_delay: Duration,
    table_ready: AtomicBool,
    stats: LockStatsCollector,
    shutdown: CancellationToken,
}

impl LockManager {
    /// `retry_delay` is the first backoff step after a failed waiter retry
    pub fn new(
        database: Arc<dyn DatabaseService>,
        member: impl Into<String>,
        retry_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            database,
            member: member.into(),
            waiters: DashMap::new(),
            retrying: DashSet::new(),
            retry_delay,
            table_ready: AtomicBool::new(false),
            stats: LockStatsCollector::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Retry waiters as lock rows disappear, until `cancel` fires
    pub fn start(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DatabaseEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => manager.on_event(event),
                        None => break,
                    },
                }
            }
            manager.shutdown.cancel();
            debug!("Lock event loop stopped");
        })
    }

    /// A handle for `path` with a fresh holder token
    pub fn create_lock(self: &Arc<Self>, path: impl Into<String>) -> DistributedLock {
        DistributedLock {
            path: path.into(),
            lock_id: new_lock_id(&self.member),
            manager: self.clone(),
            expires_at: parking_lot::Mutex::new(None),
        }
    }

    pub fn stats(&self) -> LockStats {
        self.stats.snapshot()
    }

    fn on_event(self: &Arc<Self>, event: DatabaseEvent) {
        match event {
            DatabaseEvent::TableModified(modification)
                if modification.table_name == LOCK_TABLE
                    && modification.kind == TableModificationType::RowDeleted =>
            {
                self.spawn_retry(modification.key);
            }
            DatabaseEvent::TableDropped(name) if name == LOCK_TABLE => {
                self.table_ready.store(false, Ordering::Release);
                self.retry_all();
            }
            DatabaseEvent::SnapshotInstalled(_) => self.retry_all(),
            _ => {}
        }
    }

    fn retry_all(self: &Arc<Self>) {
        let paths: Vec<String> = self.waiters.iter().map(|entry| entry.key().clone()).collect();
        for path in paths {
            self.spawn_retry(path);
        }
    }

    /// Retry `path` off the event loop so one slow path never delays another
    fn spawn_retry(self: &Arc<Self>, path: String) {
        if !self.waiters.contains_key(&path) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let RetryOutcome::Failed = manager.retry_waiters(&path).await {
                manager.schedule_backoff(path);
            }
        });
    }

    /// Keep retrying `path` with exponential backoff until an attempt
    /// reaches the store or the queue empties
    fn schedule_backoff(self: &Arc<Self>, path: String) {
        if !self.retrying.insert(path.clone()) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let mut factor = 1;
            loop {
                let delay = manager.retry_delay * factor;
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match manager.retry_waiters(&path).await {
                    RetryOutcome::Done => break,
                    RetryOutcome::Failed => {
                        factor = (factor * 2).min(MAX_RETRY_BACKOFF_FACTOR);
                        debug!(path, ?delay, "Lock waiter retry failed, backing off");
                    }
                }
            }
            manager.retrying.remove(&path);
        });
    }

    async fn retry_waiters(&self, path: &str) -> RetryOutcome {
        let Some(queue) = self.waiters.get(path).map(|entry| entry.value().clone()) else {
            return RetryOutcome::Done;
        };

        let mut abandoned = None;
        let outcome = {
            let mut queue = queue.lock().await;
            let now = Instant::now();
            let mut outcome = RetryOutcome::Done;
            while let Some(waiter) = queue.pop_front() {
                self.stats.queued_waiters.fetch_sub(1, Ordering::Relaxed);
                if waiter.is_expired(now) {
                    self.stats.expired_waiters.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                match self.try_acquire(path, &waiter.lock_id).await {
                    Ok(true) => {
                        if waiter.tx.send(Instant::now()).is_err() {
                            // The waiter gave up between the check and the grant
                            abandoned = Some(waiter.lock_id);
                        } else {
                            debug!(path, lock_id = %waiter.lock_id, "Granted lock to waiter");
                        }
                    }
                    Ok(false) => {
                        queue.push_front(waiter);
                        self.stats.queued_waiters.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(path, error = %e, "Failed to retry lock waiter");
                        queue.push_front(waiter);
                        self.stats.queued_waiters.fetch_add(1, Ordering::Relaxed);
                        outcome = RetryOutcome::Failed;
                    }
                }
                break;
            }
            outcome
        };
        drop(queue);

        self.remove_if_idle(path);
        self.publish_queued();
        if let Some(lock_id) = abandoned {
            // The delete event retries the next waiter
            self.release(path, &lock_id).await;
        }
        outcome
    }

    fn remove_if_idle(&self, path: &str) {
        self.waiters.remove_if(path, |_, queue| {
            Arc::strong_count(queue) == 1 && queue.try_lock().is_ok_and(|queue| queue.is_empty())
        });
    }

    fn publish_queued(&self) {
        let queued = self.stats.queued_waiters.load(Ordering::Relaxed);
        metrics::gauge!("raftable_lock_waiters").set(queued as f64);
    }

    async fn ensure_table(&self) -> Result<()> {
        if self.table_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        if self
            .database
            .create_table_with_ttl(LOCK_TABLE, LOCK_TABLE_TTL_MILLIS)
            .await?
        {
            info!(table = LOCK_TABLE, "Created lock table");
        }
        self.table_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn try_acquire(&self, path: &str, lock_id: &str) -> Result<bool> {
        self.ensure_table().await?;
        let outcome = match self
            .database
            .put_if_absent(LOCK_TABLE, path, lock_id.as_bytes().to_vec())
            .await
        {
            Err(DatabaseError::UnexpectedStatus { status, .. })
                if status == WriteStatus::NoSuchTable.to_string() =>
            {
                // Dropped behind our back
                self.table_ready.store(false, Ordering::Release);
                self.ensure_table().await?;
                self.database
                    .put_if_absent(LOCK_TABLE, path, lock_id.as_bytes().to_vec())
                    .await?
            }
            outcome => outcome?,
        };

        if outcome {
            self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.contended.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    async fn release(&self, path: &str, lock_id: &str) -> bool {
        match self
            .database
            .remove_if_value_matches(LOCK_TABLE, path, lock_id.as_bytes().to_vec())
            .await
        {
            Ok(released) => {
                if released {
                    self.stats.released.fetch_add(1, Ordering::Relaxed);
                }
                released
            }
            Err(e) => {
                warn!(path, lock_id, error = %e, "Failed to release lock");
                false
            }
        }
    }
}

/// A cluster-wide lock on one path.
///
/// Ownership is tracked locally from the lease granted at acquisition and
/// is not re-checked against the store, so [`DistributedLock::is_locked`]
/// is only as accurate as the local clock. The lock row itself is removed
/// by TTL expiration [`LOCK_TABLE_TTL_MILLIS`] after it was inserted, which
/// bounds every lease.
pub struct DistributedLock {
    path: String,
    lock_id: String,
    manager: Arc<LockManager>,
    expires_at: parking_lot::Mutex<Option<Instant>>,
}

impl DistributedLock {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Holder token stored in the lock row
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Acquire, waiting as long as it takes
    pub async fn lock(&self, lease: Duration) -> Result<()> {
        if self.acquire(None, lease).await? {
            Ok(())
        } else {
            Err(DatabaseError::IllegalState(format!(
                "lock {} was abandoned while waiting",
                self.path
            )))
        }
    }

    /// Single attempt; true if this handle now holds the lock
    pub async fn try_lock(&self, lease: Duration) -> Result<bool> {
        self.acquire(Some(Duration::ZERO), lease).await
    }

    /// Acquire, giving up after `wait`
    pub async fn try_lock_with_wait(&self, wait: Duration, lease: Duration) -> Result<bool> {
        self.acquire(Some(wait), lease).await
    }

    pub fn is_locked(&self) -> bool {
        self.expires_at
            .lock()
            .is_some_and(|expires_at| Instant::now() < expires_at)
    }

    /// Release the lock if this handle still holds it
    pub async fn unlock(&self) -> Result<bool> {
        *self.expires_at.lock() = None;
        let released = self
            .manager
            .database
            .remove_if_value_matches(LOCK_TABLE, &self.path, self.lock_id.as_bytes().to_vec())
            .await?;
        if released {
            self.manager.stats.released.fetch_add(1, Ordering::Relaxed);
            debug!(path = %self.path, lock_id = %self.lock_id, "Released lock");
        }
        Ok(released)
    }

    /// Renew the lease if the lock row still carries this handle's token
    pub async fn extend_expiration(&self, lease: Duration) -> Result<bool> {
        let token = self.lock_id.as_bytes().to_vec();
        let extended = self
            .manager
            .database
            .put_if_value_matches(LOCK_TABLE, &self.path, token.clone(), token)
            .await?;
        if extended {
            *self.expires_at.lock() = Some(Instant::now() + lease);
        }
        Ok(extended)
    }

    async fn acquire(&self, wait: Option<Duration>, lease: Duration) -> Result<bool> {
        let deadline = wait.map(|wait| Instant::now() + wait);
        let manager = &self.manager;

        let queue = manager
            .waiters
            .entry(self.path.clone())
            .or_default()
            .value()
            .clone();
        let mut rx = {
            let mut waiters = queue.lock().await;
            let acquired = manager.try_acquire(&self.path, &self.lock_id).await;
            if !matches!(acquired, Ok(false)) || wait == Some(Duration::ZERO) {
                drop(waiters);
                drop(queue);
                manager.remove_if_idle(&self.path);
                if acquired? {
                    *self.expires_at.lock() = Some(Instant::now() + lease);
                    return Ok(true);
                }
                return Ok(false);
            }

            let (tx, rx) = oneshot::channel();
            waiters.push_back(LockWaiter {
                lock_id: self.lock_id.clone(),
                deadline,
                tx,
            });
            manager.stats.queued_waiters.fetch_add(1, Ordering::Relaxed);
            manager.publish_queued();
            debug!(path = %self.path, lock_id = %self.lock_id, "Queued lock waiter");
            rx
        };
        drop(queue);

        let granted_at = match deadline {
            None => rx.await.ok(),
            Some(deadline) => tokio::select! {
                granted = &mut rx => granted.ok(),
                _ = tokio::time::sleep_until(deadline) => {
                    // A grant may have raced the deadline
                    rx.close();
                    rx.try_recv().ok()
                }
            },
        };

        match granted_at {
            Some(granted_at) => {
                *self.expires_at.lock() = Some(granted_at + lease);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("path", &self.path)
            .field("lock_id", &self.lock_id)
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatabase;

    const LEASE: Duration = Duration::from_secs(2);

    fn manager() -> (Arc<MemoryDatabase>, Arc<LockManager>, CancellationToken) {
        let database = Arc::new(MemoryDatabase::default());
        let manager = LockManager::new(
            database.clone() as Arc<dyn DatabaseService>,
            "node-1",
            Duration::from_millis(20),
        );
        let cancel = CancellationToken::new();
        manager.start(database.subscribe(), cancel.clone());
        (database, manager, cancel)
    }

    #[tokio::test]
    async fn test_try_lock_is_mutually_exclusive() {
        let (database, manager, _cancel) = manager();
        let first = manager.create_lock("/jobs/a");
        let second = manager.create_lock("/jobs/a");

        let (a, b) = tokio::join!(first.try_lock(LEASE), second.try_lock(LEASE));
        assert!(a.unwrap() ^ b.unwrap());

        let tables = database.list_tables().await.unwrap();
        assert!(tables.contains(LOCK_TABLE));
    }

    #[tokio::test]
    async fn test_unlock_requires_own_token() {
        let (_database, manager, _cancel) = manager();
        let holder = manager.create_lock("/p");
        let other = manager.create_lock("/p");

        assert!(holder.try_lock(LEASE).await.unwrap());
        assert!(holder.is_locked());
        assert!(!other.unlock().await.unwrap());
        assert!(!other.try_lock(LEASE).await.unwrap());

        assert!(holder.unlock().await.unwrap());
        assert!(!holder.is_locked());
        assert!(other.try_lock(LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_is_granted_on_release() {
        let (_database, manager, _cancel) = manager();
        let holder = manager.create_lock("/p");
        assert!(holder.try_lock(LEASE).await.unwrap());

        let waiter = manager.create_lock("/p");
        let task = tokio::spawn(async move {
            waiter.lock(LEASE).await.unwrap();
            waiter.is_locked()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.stats().queued_waiters, 1);
        assert!(holder.unlock().await.unwrap());

        assert!(tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap());
        assert_eq!(manager.stats().queued_waiters, 0);
    }

    #[tokio::test]
    async fn test_bounded_wait_gives_up() {
        let (_database, manager, _cancel) = manager();
        let holder = manager.create_lock("/p");
        assert!(holder.try_lock(LEASE).await.unwrap());

        let waiter = manager.create_lock("/p");
        let started = Instant::now();
        assert!(!waiter
            .try_lock_with_wait(Duration::from_millis(100), LEASE)
            .await
            .unwrap());
        assert!(started.elapsed() >= Duration::from_millis(100));

        // The stale waiter is dropped without being granted
        assert!(holder.unlock().await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = manager.stats();
        assert_eq!(stats.expired_waiters, 1);
        assert_eq!(stats.queued_waiters, 0);
        assert!(!waiter.is_locked());
    }

    #[tokio::test]
    async fn test_extend_expiration_keeps_token() {
        let (database, manager, _cancel) = manager();
        let lock = manager.create_lock("/p");
        assert!(!lock.extend_expiration(LEASE).await.unwrap());

        assert!(lock.try_lock(Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!lock.is_locked());

        assert!(lock.extend_expiration(LEASE).await.unwrap());
        assert!(lock.is_locked());
        let row = database.get(LOCK_TABLE, "/p").await.unwrap().unwrap();
        assert_eq!(row.value, lock.lock_id().as_bytes());
    }

    #[tokio::test]
    async fn test_lock_table_recreated_after_drop() {
        let (database, manager, _cancel) = manager();
        let lock = manager.create_lock("/p");
        assert!(lock.try_lock(LEASE).await.unwrap());

        database.drop_table(LOCK_TABLE).await.unwrap();
        let other = manager.create_lock("/q");
        assert!(other.try_lock(LEASE).await.unwrap());

        let stats = manager.stats();
        assert_eq!(stats.acquired, 2);
    }

    #[tokio::test]
    async fn test_waiter_retried_after_failed_grant() {
        let (database, manager, _cancel) = manager();
        let holder = manager.create_lock("/p");
        assert!(holder.try_lock(LEASE).await.unwrap());

        let waiter = manager.create_lock("/p");
        let task = tokio::spawn(async move {
            waiter.lock(LEASE).await.unwrap();
            waiter.is_locked()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The first grant attempt after the release cannot reach consensus
        database.fail_conditional_inserts(2);
        assert!(holder.unlock().await.unwrap());

        assert!(tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap());
        assert_eq!(manager.stats().queued_waiters, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_path_does_not_block_other_paths() {
        let (database, manager, _cancel) = manager();
        // Create the lock table up front so only the insert on /slow stalls
        let warmup = manager.create_lock("/warmup");
        assert!(warmup.try_lock(LEASE).await.unwrap());

        let gate = database.gate("/slow");
        let slow = manager.create_lock("/slow");
        let slow_task = tokio::spawn(async move { slow.try_lock(LEASE).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fast = manager.create_lock("/fast");
        let acquired = tokio::time::timeout(Duration::from_millis(500), fast.try_lock(LEASE))
            .await
            .expect("lock on another path stalled")
            .unwrap();
        assert!(acquired);

        gate.add_permits(1);
        assert!(slow_task.await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_grant_to_departed_waiter_is_released() {
        let (database, manager, _cancel) = manager();
        let holder = manager.create_lock("/p");
        assert!(holder.try_lock(LEASE).await.unwrap());

        let waiter = manager.create_lock("/p");
        let task = tokio::spawn(async move {
            waiter
                .try_lock_with_wait(Duration::from_millis(150), LEASE)
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Hold the grant in flight until the waiter has given up
        let gate = database.gate("/p");
        assert!(holder.unlock().await.unwrap());
        assert!(!task.await.unwrap());
        gate.add_permits(1);

        let next = manager.create_lock("/p");
        let mut acquired = false;
        for _ in 0..40 {
            if next.try_lock(LEASE).await.unwrap() {
                acquired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(acquired);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.stats().released, 2);
    }
}
