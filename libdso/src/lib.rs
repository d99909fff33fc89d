pub mod id;
pub mod lock;
pub mod metrics;
pub mod op;
pub mod txn;

use serde::Deserialize;
use serde::Serialize;

pub use id::ClientId;
pub use id::LockId;
pub use id::ObjectId;
pub use id::ThreadId;
pub use lock::manager::LockManager;
pub use lock::ServerLockLevel;
pub use metrics::DsoMetrics;
pub use op::OpError;
pub use op::OpResult;
pub use txn::reader::TransactionBatchReader;
pub use txn::writer::TransactionBatchWriter;
pub use txn::ClientTransaction;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum LockPolicy {
  #[default]
  NonGreedy,
  // Uncontended awards go to the whole client, which then serves its own threads until recalled.
  Greedy,
}

#[derive(Clone, Debug, Default)]
pub struct LockManagerCfg {
  pub policy: LockPolicy,
}

/// Limits on how many transactions get folded into one. A limit of zero means unlimited.
#[derive(Clone, Debug)]
pub struct FoldingCfg {
  pub enabled: bool,
  pub object_limit: usize,
  pub lock_limit: usize,
}

impl FoldingCfg {
  pub fn disabled() -> Self {
    Self {
      enabled: false,
      object_limit: 0,
      lock_limit: 0,
    }
  }
}

impl Default for FoldingCfg {
  fn default() -> Self {
    Self {
      enabled: true,
      object_limit: 0,
      lock_limit: 0,
    }
  }
}
