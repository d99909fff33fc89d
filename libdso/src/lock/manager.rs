use super::helper::LockHelper;
use super::notified_waiters::NotifiedWaiters;
use super::server_lock::ServerLock;
use super::store::LockStore;
use super::timer::start_timer_loop;
use super::timer::LockTimer;
use super::timer::TimerCallback;
use super::timer::TimerTask;
use super::ClientLockContext;
use super::LockResponse;
use super::NotifyAction;
use super::ServerLockLevel;
use crate::id::ClientId;
use crate::id::LockId;
use crate::id::ThreadId;
use crate::metrics::DsoMetrics;
use crate::op::OpError;
use crate::op::OpResult;
use crate::LockManagerCfg;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use strum::Display;
use tracing::debug;
use tracing::info;
use tracing::warn;


#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum LockManagerStatus {
  Starting,
  Started,
  Stopped,
}

// Requests that may arrive before the manager has started, and so get queued until then.
#[derive(Debug)]
enum LockRequest {
  Lock {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
  },
  TryLock {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
    timeout_ms: i64,
  },
  Unlock {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
  },
  Interrupt {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
  },
  Query {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
  },
  RecallCommit {
    lock_id: LockId,
    client: ClientId,
    contexts: Vec<ClientLockContext>,
  },
}

struct Inner {
  cfg: LockManagerCfg,
  helper: LockHelper,
  // Only the timer callback holds a read across lock work, and only after its checkout. Nothing may wait for a checkout while holding one.
  status: RwLock<LockManagerStatus>,
  queued: Mutex<Vec<LockRequest>>,
  store: LockStore,
}

impl Inner {
  fn status(&self) -> LockManagerStatus {
    *self.status.read()
  }

  fn execute(&self, req: LockRequest) -> OpResult<()> {
    let helper = &self.helper;
    match req {
      LockRequest::Lock {
        lock_id,
        client,
        thread,
        level,
      } => self
        .store
        .checkout(&lock_id)
        .lock(client, thread, level, helper)?,
      LockRequest::TryLock {
        lock_id,
        client,
        thread,
        level,
        timeout_ms,
      } => self
        .store
        .checkout(&lock_id)
        .try_lock(client, thread, level, timeout_ms, helper)?,
      LockRequest::Unlock {
        lock_id,
        client,
        thread,
      } => self.store.checkout(&lock_id).unlock(client, thread, helper),
      LockRequest::Interrupt {
        lock_id,
        client,
        thread,
      } => self
        .store
        .checkout(&lock_id)
        .interrupt(client, thread, helper),
      LockRequest::Query {
        lock_id,
        client,
        thread,
      } => self.store.checkout(&lock_id).query(client, thread, helper),
      LockRequest::RecallCommit {
        lock_id,
        client,
        contexts,
      } => self
        .store
        .checkout(&lock_id)
        .recall_commit(client, contexts, helper),
    };
    Ok(())
  }
}

impl TimerCallback for Inner {
  fn timer_timeout(&self, task: TimerTask) {
    let Some(mut lock) = self.store.get(&task.lock_id) else {
      self
        .helper
        .metrics
        .0
        .timer_suppressed_count
        .fetch_add(1, Relaxed);
      return;
    };
    // Held until the effect is applied, so that `stop` can't return while one is in progress.
    let status = self.status.read();
    if *status != LockManagerStatus::Started {
      self
        .helper
        .metrics
        .0
        .timer_suppressed_count
        .fetch_add(1, Relaxed);
      return;
    };
    lock.timer_timeout(task.client, task.thread, task.id, &self.helper);
    drop(status);
  }
}

/// Registry of every ServerLock. Operations on one lock are serialised by checking it out; operations on different locks run in parallel.
///
/// Events for clients (awards, refusals, recalls, wait timeouts and query results) are sent to the channel given on creation.
#[derive(Clone)]
pub struct LockManager {
  inner: Arc<Inner>,
}

impl LockManager {
  pub fn new(cfg: LockManagerCfg, responses: Sender<LockResponse>) -> Self {
    let metrics = DsoMetrics::default();
    let (timer, timer_receiver) = LockTimer::new();
    let helper = LockHelper::new(cfg.policy, metrics.clone(), responses, Arc::new(timer));
    let inner = Arc::new(Inner {
      cfg,
      helper,
      status: RwLock::new(LockManagerStatus::Starting),
      queued: Mutex::new(Vec::new()),
      store: LockStore::default(),
    });
    // The loop only holds a weak reference, so it exits once the manager is dropped.
    start_timer_loop(timer_receiver, Arc::downgrade(&inner), metrics);
    Self { inner }
  }

  pub fn cfg(&self) -> &LockManagerCfg {
    &self.inner.cfg
  }

  pub fn metrics(&self) -> &DsoMetrics {
    &self.inner.helper.metrics
  }

  pub fn helper(&self) -> &LockHelper {
    &self.inner.helper
  }

  pub fn status(&self) -> LockManagerStatus {
    self.inner.status()
  }

  /// Replays requests queued while starting, then activates timers.
  pub fn start(&self) {
    let mut queued = self.inner.queued.lock();
    if self.inner.status() != LockManagerStatus::Starting {
      warn!(status = %self.inner.status(), "ignoring start");
      return;
    };
    let replayed = queued.len();
    for req in queued.drain(..) {
      if let Err(err) = self.inner.execute(req) {
        warn!(error = %err, "queued lock request failed");
      };
    }
    *self.inner.status.write() = LockManagerStatus::Started;
    self.inner.helper.timer().start();
    info!(replayed, locks = self.inner.store.len(), "lock manager started");
  }

  /// Permanent. Timers that haven't fired yet never will, and one already being applied finishes before this returns.
  pub fn stop(&self) {
    let mut queued = self.inner.queued.lock();
    *self.inner.status.write() = LockManagerStatus::Stopped;
    let dropped = queued.len();
    queued.clear();
    self.inner.helper.timer().stop();
    info!(dropped, "lock manager stopped");
  }

  fn submit(&self, req: LockRequest) -> OpResult<()> {
    match self.inner.status() {
      LockManagerStatus::Started => return self.inner.execute(req),
      LockManagerStatus::Stopped => return Err(OpError::ManagerStopped),
      LockManagerStatus::Starting => {}
    };
    let mut queued = self.inner.queued.lock();
    // Start holds the queue lock while switching status.
    match self.inner.status() {
      LockManagerStatus::Started => {
        drop(queued);
        self.inner.execute(req)
      }
      LockManagerStatus::Stopped => Err(OpError::ManagerStopped),
      LockManagerStatus::Starting => {
        debug!(?req, "queueing lock request until start");
        queued.push(req);
        Ok(())
      }
    }
  }

  fn require_started(&self) -> OpResult<()> {
    match self.inner.status() {
      LockManagerStatus::Started => Ok(()),
      LockManagerStatus::Starting => Err(OpError::ManagerNotStarted),
      LockManagerStatus::Stopped => Err(OpError::ManagerStopped),
    }
  }

  pub fn lock(
    &self,
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
  ) -> OpResult<()> {
    self.submit(LockRequest::Lock {
      lock_id,
      client,
      thread,
      level,
    })
  }

  pub fn try_lock(
    &self,
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
    timeout_ms: i64,
  ) -> OpResult<()> {
    self.submit(LockRequest::TryLock {
      lock_id,
      client,
      thread,
      level,
      timeout_ms,
    })
  }

  pub fn unlock(&self, lock_id: LockId, client: ClientId, thread: ThreadId) -> OpResult<()> {
    self.submit(LockRequest::Unlock {
      lock_id,
      client,
      thread,
    })
  }

  pub fn interrupt(&self, lock_id: LockId, client: ClientId, thread: ThreadId) -> OpResult<()> {
    self.submit(LockRequest::Interrupt {
      lock_id,
      client,
      thread,
    })
  }

  pub fn query(&self, lock_id: LockId, client: ClientId, thread: ThreadId) -> OpResult<()> {
    self.submit(LockRequest::Query {
      lock_id,
      client,
      thread,
    })
  }

  pub fn recall_commit(
    &self,
    lock_id: LockId,
    client: ClientId,
    contexts: Vec<ClientLockContext>,
  ) -> OpResult<()> {
    self.submit(LockRequest::RecallCommit {
      lock_id,
      client,
      contexts,
    })
  }

  pub fn wait(
    &self,
    lock_id: &LockId,
    client: ClientId,
    thread: ThreadId,
    timeout_ms: i64,
  ) -> OpResult<()> {
    self.require_started()?;
    self
      .inner
      .store
      .checkout(lock_id)
      .wait(client, thread, timeout_ms, &self.inner.helper)
  }

  /// Notified waiters are added to `notified`, so one collection can gather the notifies of a whole transaction.
  pub fn notify(
    &self,
    lock_id: &LockId,
    client: ClientId,
    thread: ThreadId,
    action: NotifyAction,
    notified: &mut NotifiedWaiters,
  ) -> OpResult<()> {
    self.require_started()?;
    self
      .inner
      .store
      .checkout(lock_id)
      .notify(client, thread, action, notified, &self.inner.helper)
  }

  /// Rebuilds holder and waiter state reported by clients after failover. Only possible before `start`, so that wait timers don't fire until every client has reported in.
  pub fn reestablish(&self, lock_id: &LockId, ctx: ClientLockContext) -> OpResult<()> {
    let _queued = self.inner.queued.lock();
    if self.inner.status() != LockManagerStatus::Starting {
      return Err(OpError::ReestablishAfterStart);
    };
    self
      .inner
      .store
      .checkout(lock_id)
      .reestablish(ctx, &self.inner.helper);
    Ok(())
  }

  /// Removes the client from every lock, as on disconnect. Works in every status.
  pub fn clear_all_locks_for(&self, client: ClientId) {
    let mut affected = 0;
    for lock_id in self.inner.store.lock_ids() {
      // The lock may have gone away since the snapshot.
      let Some(mut lock) = self.inner.store.get(&lock_id) else {
        continue;
      };
      if lock.iter().any(|c| c.client() == client) {
        affected += 1;
      };
      lock.clear_state_for_client(client, &self.inner.helper);
    }
    self
      .inner
      .helper
      .metrics
      .0
      .client_clear_count
      .fetch_add(1, Relaxed);
    info!(%client, affected, "cleared all locks for client");
  }

  pub fn lock_count(&self) -> usize {
    self.inner.store.len()
  }

  pub fn has_pending(&self, lock_id: &LockId) -> bool {
    self
      .inner
      .store
      .get(lock_id)
      .map_or(false, |l| l.has_pending())
  }

  /// Read-only access to a lock under checkout. Returns None if the lock doesn't exist.
  pub fn inspect<R>(&self, lock_id: &LockId, f: impl FnOnce(&ServerLock) -> R) -> Option<R> {
    self.inner.store.get(lock_id).map(|l| f(&l))
  }
}
