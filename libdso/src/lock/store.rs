use super::server_lock::ServerLock;
use crate::id::LockId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::Mutex;
use parking_lot::RawMutex;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;

/// All live ServerLocks. A lock exists from the first request that names it until the last context leaves it.
#[derive(Default)]
pub(crate) struct LockStore {
  map: DashMap<LockId, Arc<Mutex<ServerLock>>>,
}

impl LockStore {
  /// Blocks until no one else has the lock checked out. Creates the lock if it doesn't exist.
  pub fn checkout(&self, lock_id: &LockId) -> CheckedOutLock<'_> {
    // Don't hold the map shard while waiting for the lock's mutex.
    let arc = self
      .map
      .entry(lock_id.clone())
      .or_insert_with(|| Arc::new(Mutex::new(ServerLock::new(lock_id.clone()))))
      .clone();
    CheckedOutLock {
      store: self,
      guard: arc.lock_arc(),
    }
  }

  /// Like `checkout`, but doesn't create the lock.
  pub fn get(&self, lock_id: &LockId) -> Option<CheckedOutLock<'_>> {
    let arc = self.map.get(lock_id)?.clone();
    Some(CheckedOutLock {
      store: self,
      guard: arc.lock_arc(),
    })
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  /// A point-in-time copy; locks may come and go while it's being used.
  pub fn lock_ids(&self) -> Vec<LockId> {
    self.map.iter().map(|e| e.key().clone()).collect()
  }

  fn remove_if_unused(&self, lock_id: &LockId, arc: &Arc<Mutex<ServerLock>>) {
    let Entry::Occupied(e) = self.map.entry(lock_id.clone()) else {
      // Already removed by an earlier checkin of the same lock.
      return;
    };
    // One reference for the map and one for our guard. Anyone else holding a reference is about to check it out.
    if Arc::ptr_eq(e.get(), arc) && Arc::strong_count(arc) == 2 {
      e.remove();
    };
  }
}

pub struct CheckedOutLock<'a> {
  store: &'a LockStore,
  guard: ArcMutexGuard<RawMutex, ServerLock>,
}

impl<'a> CheckedOutLock<'a> {
  /// Equivalent to dropping.
  pub fn checkin(self) {}
}

impl<'a> Deref for CheckedOutLock<'a> {
  type Target = ServerLock;

  fn deref(&self) -> &Self::Target {
    &self.guard
  }
}

impl<'a> DerefMut for CheckedOutLock<'a> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.guard
  }
}

impl<'a> Drop for CheckedOutLock<'a> {
  fn drop(&mut self) {
    if self.guard.is_empty() {
      let lock_id = self.guard.lock_id().clone();
      self
        .store
        .remove_if_unused(&lock_id, ArcMutexGuard::mutex(&self.guard));
    };
  }
}
