use super::message::CommitTransactionMessageFactory;
use super::wire::WireBatch;
use super::wire::WireTransaction;
use super::ClientTransaction;
use super::DmiDescriptor;
use super::FoldedInfo;
use super::Notify;
use super::ObjectChange;
use super::SequenceGenerator;
use super::TransactionIdGenerator;
use super::TxnType;
use crate::id::BatchId;
use crate::id::LockId;
use crate::id::ObjectId;
use crate::id::SequenceId;
use crate::id::TransactionId;
use crate::metrics::DsoMetrics;
use crate::op::OpResult;
use crate::FoldingCfg;
use itertools::Itertools;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tracing::debug;
use tracing::trace;


/*

# Folding

Consecutive transactions under a common lock are often small changes to the same few objects, so instead of sending each one, later ones can be merged into an earlier one that hasn't been sent yet. There is at most one transaction that can be merged into, the open target. Any transaction that isn't merged closes the current target and, if it can take folds itself, becomes the new one. A closed target never reopens.

A folded transaction gets the target's id and sequence, so its changes are applied at the target's position. That's only safe if nothing between the target and it must be applied first, hence the rules in `fold_target`.

*/

struct HeldTransaction {
  id: TransactionId,
  sequence: SequenceId,
  txn_type: TxnType,
  application_txn_count: u32,
  // Distinct, in fold order.
  lock_ids: Vec<LockId>,
  changes: Vec<ObjectChange>,
  change_index: FxHashMap<ObjectId, usize>,
  new_roots: Vec<(String, ObjectId)>,
  notifies: Vec<Notify>,
  dmis: Vec<DmiDescriptor>,
}

impl HeldTransaction {
  fn new(txn: ClientTransaction) -> Self {
    let change_index = txn
      .changes
      .iter()
      .enumerate()
      .map(|(i, c)| (c.object_id, i))
      .collect();
    Self {
      id: txn.id,
      sequence: txn.sequence,
      txn_type: txn.txn_type,
      application_txn_count: 1,
      lock_ids: txn.lock_ids,
      changes: txn.changes,
      change_index,
      new_roots: txn.new_roots,
      notifies: txn.notifies,
      dmis: txn.dmis,
    }
  }

  fn new_object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
    self.changes.iter().filter(|c| c.is_new).map(|c| c.object_id)
  }

  fn merge(&mut self, txn: ClientTransaction) {
    for lock_id in txn.lock_ids {
      if !self.lock_ids.contains(&lock_id) {
        self.lock_ids.push(lock_id);
      };
    }
    for change in txn.changes {
      match self.change_index.get(&change.object_id) {
        Some(&idx) => {
          let existing = &mut self.changes[idx];
          existing.is_new |= change.is_new;
          existing.deltas.extend(change.deltas);
        }
        None => {
          self.change_index.insert(change.object_id, self.changes.len());
          self.changes.push(change);
        }
      };
    }
    self.application_txn_count += 1;
  }

  fn to_wire(&self) -> WireTransaction {
    WireTransaction {
      transaction_id: self.id,
      sequence_id: self.sequence,
      txn_type: self.txn_type,
      application_txn_count: self.application_txn_count,
      lock_ids: self.lock_ids.clone(),
      changes: self.changes.clone(),
      new_roots: self.new_roots.clone(),
      notifies: self.notifies.clone(),
      dmis: self.dmis.clone(),
    }
  }
}

#[derive(Default)]
struct WriterState {
  held: BTreeMap<SequenceId, HeldTransaction>,
  by_id: FxHashMap<TransactionId, SequenceId>,
  open_target: Option<TransactionId>,
  // Which held transaction creates each new object.
  creators: FxHashMap<ObjectId, TransactionId>,
  acknowledged: Vec<TransactionId>,
}

fn exceeds_limit(limit: usize, count: usize) -> bool {
  limit != 0 && count > limit
}

/// Collects a client's transactions until they're sent as one batch, and holds them until the coordinator acknowledges each one.
pub struct TransactionBatchWriter {
  batch_id: BatchId,
  cfg: FoldingCfg,
  metrics: DsoMetrics,
  factory: Arc<dyn CommitTransactionMessageFactory>,
  state: Mutex<WriterState>,
}

impl TransactionBatchWriter {
  pub fn new(
    batch_id: BatchId,
    cfg: FoldingCfg,
    metrics: DsoMetrics,
    factory: Arc<dyn CommitTransactionMessageFactory>,
  ) -> Self {
    Self {
      batch_id,
      cfg,
      metrics,
      factory,
      state: Mutex::new(WriterState::default()),
    }
  }

  pub fn batch_id(&self) -> BatchId {
    self.batch_id
  }

  pub fn is_empty(&self) -> bool {
    self.state.lock().held.is_empty()
  }

  /// After folding.
  pub fn number_of_txns(&self) -> usize {
    self.state.lock().held.len()
  }

  pub fn contains_sync_write_transaction(&self) -> bool {
    self
      .state
      .lock()
      .held
      .values()
      .any(|t| t.txn_type == TxnType::Normal)
  }

  pub fn add_acknowledged_transaction_ids(&self, ids: impl IntoIterator<Item = TransactionId>) {
    self.state.lock().acknowledged.extend(ids);
  }

  // Returns the sequence of the open target if `txn` can be folded into it.
  fn fold_target(&self, state: &WriterState, txn: &ClientTransaction) -> Option<SequenceId> {
    if !self.cfg.enabled || !txn.is_foldable_content() {
      return None;
    };
    let target_id = state.open_target?;
    let seq = *state.by_id.get(&target_id)?;
    let target = state.held.get(&seq)?;
    if target.txn_type != txn.txn_type {
      return None;
    };
    // Without a common lock, another client could have changed the same objects in between.
    if !txn.lock_ids.iter().any(|l| target.lock_ids.contains(l)) {
      return None;
    };
    let objects = target.changes.len()
      + txn
        .changes
        .iter()
        .filter(|c| !target.change_index.contains_key(&c.object_id))
        .count();
    if exceeds_limit(self.cfg.object_limit, objects) {
      return None;
    };
    let locks = target.lock_ids.len()
      + txn
        .lock_ids
        .iter()
        .filter(|l| !target.lock_ids.contains(l))
        .count();
    if exceeds_limit(self.cfg.lock_limit, locks) {
      return None;
    };
    // Folding would apply a delta before the transaction that creates its object.
    if txn.changes.iter().filter(|c| !c.is_new).any(|c| {
      state
        .creators
        .get(&c.object_id)
        .map_or(false, |creator| *creator != target_id)
    }) {
      return None;
    };
    Some(seq)
  }

  pub fn add_transaction(
    &self,
    mut txn: ClientTransaction,
    sequences: &SequenceGenerator,
    ids: &TransactionIdGenerator,
  ) -> FoldedInfo {
    txn.changes.retain(|c| !c.is_empty());
    txn.lock_ids = txn.lock_ids.into_iter().unique().collect();
    self.metrics.0.txn_added_count.fetch_add(1, Relaxed);

    let mut state = self.state.lock();
    let state = &mut *state;
    let fold_into = self.fold_target(state, &txn);
    if let Some(target) = fold_into.and_then(|seq| state.held.get_mut(&seq)) {
      let transaction_id = target.id;
      state
        .creators
        .extend(txn.new_object_ids().map(|oid| (oid, transaction_id)));
      target.merge(txn);
      self.metrics.0.txn_folded_count.fetch_add(1, Relaxed);
      trace!(%transaction_id, folded = target.application_txn_count, "folded transaction");
      return FoldedInfo {
        transaction_id,
        folded: true,
      };
    };

    let transaction_id = ids.next();
    let sequence = sequences.next();
    txn.id = transaction_id;
    txn.sequence = sequence;
    if let Some(closed) = state.open_target.take() {
      trace!(transaction_id = %closed, "closed fold target");
    };
    if self.cfg.enabled && txn.is_foldable_content() {
      state.open_target = Some(transaction_id);
    };
    state
      .creators
      .extend(txn.new_object_ids().map(|oid| (oid, transaction_id)));
    state.by_id.insert(transaction_id, sequence);
    state.held.insert(sequence, HeldTransaction::new(txn));
    FoldedInfo {
      transaction_id,
      folded: false,
    }
  }

  /// Drops an acknowledged transaction. Panics if the transaction isn't held.
  pub fn remove_transaction(&self, id: TransactionId) {
    let mut state = self.state.lock();
    let Some(seq) = state.by_id.remove(&id) else {
      panic!("{id} is not held by {}", self.batch_id);
    };
    if let Some(held) = state.held.remove(&seq) {
      for oid in held.new_object_ids() {
        if state.creators.get(&oid) == Some(&id) {
          state.creators.remove(&oid);
        };
      }
    };
    if state.open_target == Some(id) {
      state.open_target = None;
    };
    self.metrics.0.txn_removed_count.fetch_add(1, Relaxed);
  }

  /// The lowest sequence still held, or null if nothing is.
  pub fn min_transaction_sequence(&self) -> SequenceId {
    self
      .state
      .lock()
      .held
      .keys()
      .next()
      .copied()
      .unwrap_or(SequenceId::NULL)
  }

  fn wire_batch(&self, state: &WriterState) -> WireBatch {
    WireBatch {
      batch_id: self.batch_id,
      contains_sync_write: state.held.values().any(|t| t.txn_type == TxnType::Normal),
      transactions: state.held.values().map(|t| t.to_wire()).collect(),
    }
  }

  /// Every held transaction, in sequence order.
  pub fn encode(&self) -> OpResult<Vec<u8>> {
    self.wire_batch(&self.state.lock()).encode()
  }

  /// Sends every held transaction as one batch. Nothing more can be folded into what was sent.
  pub fn send(&self) -> OpResult<()> {
    let mut state = self.state.lock();
    let data = self.wire_batch(&state).encode()?;
    let acknowledged = std::mem::take(&mut state.acknowledged);
    state.open_target = None;
    let (txns, bytes) = (state.held.len(), data.len());
    drop(state);

    let mut msg = self.factory.new_message();
    msg.set_batch(self.batch_id, data, acknowledged);
    msg.send();
    self.metrics.0.batch_sent_count.fetch_add(1, Relaxed);
    self
      .metrics
      .0
      .batch_sent_bytes
      .fetch_add(bytes as u64, Relaxed);
    debug!(batch_id = %self.batch_id, txns, bytes, "sent transaction batch");
    Ok(())
  }
}
