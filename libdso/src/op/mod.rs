use crate::id::ClientId;
use crate::id::LockId;
use crate::id::ThreadId;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

pub type OpResult<T> = Result<T, OpError>;

#[derive(Debug)]
pub enum OpError {
  // A requester holding READ asked for WRITE on the same lock. It must unlock and request again.
  LockUpgradeNotSupported {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
  },
  // wait/notify by a requester that is not the current WRITE holder.
  IllegalMonitorState {
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
    reason: &'static str,
  },
  ManagerNotStarted,
  ManagerStopped,
  ReestablishAfterStart,
  BatchEncode(String),
  MalformedBatch(String),
}

impl Display for OpError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OpError::LockUpgradeNotSupported {
        lock_id,
        client,
        thread,
      } => write!(
        f,
        "lock upgrade is not supported: {client},{thread} holds READ on {lock_id}"
      ),
      OpError::IllegalMonitorState {
        lock_id,
        client,
        thread,
        reason,
      } => write!(
        f,
        "illegal monitor state for {client},{thread} on {lock_id}: {reason}"
      ),
      OpError::ManagerNotStarted => write!(f, "lock manager has not been started"),
      OpError::ManagerStopped => write!(f, "lock manager has been stopped"),
      OpError::ReestablishAfterStart => {
        write!(f, "lock state can only be reestablished before start")
      }
      OpError::BatchEncode(msg) => write!(f, "failed to encode transaction batch: {msg}"),
      OpError::MalformedBatch(msg) => write!(f, "malformed transaction batch: {msg}"),
    }
  }
}

impl Error for OpError {}
