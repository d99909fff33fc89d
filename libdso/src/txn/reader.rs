use super::wire::WireBatch;
use super::wire::WireTransaction;
use super::ServerTransaction;
use crate::id::BatchId;
use crate::id::ClientId;
use crate::op::OpResult;
use std::vec::IntoIter;
use tracing::trace;

/// Reconstructs the transactions of a batch received from `source`.
pub struct TransactionBatchReader {
  source: ClientId,
  batch_id: BatchId,
  contains_sync_write: bool,
  count: usize,
  transactions: IntoIter<WireTransaction>,
}

impl TransactionBatchReader {
  pub fn new(raw: &[u8], source: ClientId) -> OpResult<Self> {
    let batch = WireBatch::decode(raw)?;
    trace!(batch_id = %batch.batch_id, %source, txns = batch.transactions.len(), "read transaction batch");
    Ok(Self {
      source,
      batch_id: batch.batch_id,
      contains_sync_write: batch.contains_sync_write,
      count: batch.transactions.len(),
      transactions: batch.transactions.into_iter(),
    })
  }

  pub fn batch_id(&self) -> BatchId {
    self.batch_id
  }

  pub fn source(&self) -> ClientId {
    self.source
  }

  /// After folding; includes transactions already read.
  pub fn number_of_txns(&self) -> usize {
    self.count
  }

  pub fn contains_sync_write_transaction(&self) -> bool {
    self.contains_sync_write
  }

  pub fn next_transaction(&mut self) -> Option<ServerTransaction> {
    let t = self.transactions.next()?;
    Some(ServerTransaction {
      source: self.source,
      transaction_id: t.transaction_id,
      sequence_id: t.sequence_id,
      txn_type: t.txn_type,
      num_application_txn: t.application_txn_count,
      lock_ids: t.lock_ids,
      changes: t.changes,
      new_roots: t.new_roots,
      notifies: t.notifies,
      dmis: t.dmis,
    })
  }
}
