use crate::id::ClientId;
use crate::id::LockId;
use crate::id::ThreadId;
use serde::Deserialize;
use serde::Serialize;
use strum::Display;

pub mod context;
pub mod helper;
pub mod manager;
pub mod notified_waiters;
pub mod server_lock;
pub mod store;
pub mod timer;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum ServerLockLevel {
  #[serde(rename = "0")]
  Read,
  #[serde(rename = "1")]
  Write,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum NotifyAction {
  One,
  All,
}

/// The state of one requester on one lock, as exchanged with clients when reestablishing state after failover, committing a recall, or answering a query.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClientLockState {
  Holder(ServerLockLevel),
  GreedyHolder(ServerLockLevel),
  Pending(ServerLockLevel),
  TryPending {
    level: ServerLockLevel,
    timeout_ms: i64,
  },
  // A negative timeout waits indefinitely.
  Waiter {
    timeout_ms: i64,
  },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClientLockContext {
  pub client: ClientId,
  pub thread: ThreadId,
  pub state: ClientLockState,
}

/// Events produced by the lock engine for delivery to clients or to a management collaborator.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LockResponse {
  Award {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
  },
  Refused {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
  },
  // Asks a greedy holder to give its lease back through a recall commit.
  Recall {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
  },
  WaitTimeout {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
  },
  Query {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
    holder_level: Option<ServerLockLevel>,
    holders_and_waiters: Vec<ClientLockContext>,
    pending_count: usize,
  },
}

impl LockResponse {
  pub fn lock_id(&self) -> &LockId {
    match self {
      LockResponse::Award { lock_id, .. }
      | LockResponse::Refused { lock_id, .. }
      | LockResponse::Recall { lock_id, .. }
      | LockResponse::WaitTimeout { lock_id, .. }
      | LockResponse::Query { lock_id, .. } => lock_id,
    }
  }

  /// The requester this response is addressed to.
  pub fn requester(&self) -> (ClientId, ThreadId) {
    match self {
      LockResponse::Award { client, thread, .. }
      | LockResponse::Refused { client, thread, .. }
      | LockResponse::Recall { client, thread, .. }
      | LockResponse::WaitTimeout { client, thread, .. }
      | LockResponse::Query { client, thread, .. } => (*client, *thread),
    }
  }
}
