use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;

// All numeric identities are plain newtypes so that they serialize as their inner integer.
macro_rules! numeric_id {
  ($name:ident, $prefix:literal) => {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
    pub struct $name(pub u64);

    impl Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, concat!($prefix, "{}"), self.0)
      }
    }
  };
}

numeric_id!(ClientId, "client:");
numeric_id!(ObjectId, "oid:");
numeric_id!(TransactionId, "txn:");
numeric_id!(SequenceId, "seq:");
numeric_id!(BatchId, "batch:");

impl TransactionId {
  pub const NULL: TransactionId = TransactionId(0);
}

impl SequenceId {
  /// Returned as the minimum sequence when nothing is in flight.
  pub const NULL: SequenceId = SequenceId(0);

  pub fn is_null(self) -> bool {
    self == Self::NULL
  }
}

/// A logical thread within a client. The reserved `VM` value stands for the whole client process and is used for greedy leases.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

impl ThreadId {
  pub const VM: ThreadId = ThreadId(u64::MAX);

  pub fn is_vm(self) -> bool {
    self == Self::VM
  }
}

impl Display for ThreadId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_vm() {
      write!(f, "thread:vm")
    } else {
      write!(f, "thread:{}", self.0)
    }
  }
}

// WARNING: Do not reorder variants or their fields, as rmp_serde doesn't store field names.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum LockId {
  #[serde(rename = "0")]
  Str(String),
  #[serde(rename = "1")]
  Object(ObjectId),
}

impl LockId {
  pub fn str(name: impl Into<String>) -> Self {
    LockId::Str(name.into())
  }
}

impl From<ObjectId> for LockId {
  fn from(oid: ObjectId) -> Self {
    LockId::Object(oid)
  }
}

impl Display for LockId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LockId::Str(s) => write!(f, "lock:{s}"),
      LockId::Object(oid) => write!(f, "lock:{oid}"),
    }
  }
}
