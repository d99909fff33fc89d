use crate::id::ClientId;
use crate::id::LockId;
use crate::id::ThreadId;
use rustc_hash::FxHashMap;

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct NotifiedWaiter {
  pub lock_id: LockId,
  pub thread: ThreadId,
}

/// Waiters moved to pending by notify calls, grouped by client so that each client can be told about its own threads in one go.
#[derive(Default, Debug)]
pub struct NotifiedWaiters {
  by_client: FxHashMap<ClientId, Vec<NotifiedWaiter>>,
}

impl NotifiedWaiters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_notification(&mut self, lock_id: LockId, client: ClientId, thread: ThreadId) {
    self
      .by_client
      .entry(client)
      .or_default()
      .push(NotifiedWaiter { lock_id, thread });
  }

  /// In notification order.
  pub fn for_client(&self, client: ClientId) -> &[NotifiedWaiter] {
    self
      .by_client
      .get(&client)
      .map(|w| w.as_slice())
      .unwrap_or_default()
  }

  pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
    self.by_client.keys().copied()
  }

  pub fn len(&self) -> usize {
    self.by_client.values().map(|w| w.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.by_client.is_empty()
  }

  pub fn into_inner(self) -> FxHashMap<ClientId, Vec<NotifiedWaiter>> {
    self.by_client
  }
}
