use super::DmiDescriptor;
use super::Notify;
use super::ObjectChange;
use super::TxnType;
use crate::id::BatchId;
use crate::id::LockId;
use crate::id::ObjectId;
use crate::id::SequenceId;
use crate::id::TransactionId;
use crate::op::OpError;
use crate::op::OpResult;
use serde::Deserialize;
use serde::Serialize;

// WARNING: Do not reorder fields, as rmp_serde doesn't store field names.

#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct WireBatch {
  pub batch_id: BatchId,
  // Set if any transaction is Normal, which the sender waits on.
  pub contains_sync_write: bool,
  pub transactions: Vec<WireTransaction>,
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct WireTransaction {
  pub transaction_id: TransactionId,
  pub sequence_id: SequenceId,
  pub txn_type: TxnType,
  pub application_txn_count: u32,
  pub lock_ids: Vec<LockId>,
  pub changes: Vec<ObjectChange>,
  pub new_roots: Vec<(String, ObjectId)>,
  pub notifies: Vec<Notify>,
  pub dmis: Vec<DmiDescriptor>,
}

impl WireBatch {
  pub fn encode(&self) -> OpResult<Vec<u8>> {
    rmp_serde::to_vec(self).map_err(|err| OpError::BatchEncode(err.to_string()))
  }

  pub fn decode(raw: &[u8]) -> OpResult<Self> {
    rmp_serde::from_slice(raw).map_err(|err| OpError::MalformedBatch(err.to_string()))
  }
}
