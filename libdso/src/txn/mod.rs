use crate::id::ClientId;
use crate::id::LockId;
use crate::id::ObjectId;
use crate::id::SequenceId;
use crate::id::ThreadId;
use crate::id::TransactionId;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde::Serialize;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use strum::Display;

pub mod message;
pub mod reader;
pub mod wire;
pub mod writer;

// WARNING: Do not reorder variants or fields of any type in this file, as rmp_serde doesn't store field names.

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum TxnType {
  #[serde(rename = "0")]
  Normal,
  // Doesn't need to be applied in lock order relative to other clients, so the client doesn't wait on it.
  #[serde(rename = "1")]
  Concurrent,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum FieldValue {
  #[serde(rename = "0")]
  Null,
  #[serde(rename = "1")]
  Bool(bool),
  #[serde(rename = "2")]
  Int(i64),
  #[serde(rename = "3")]
  Str(String),
  #[serde(rename = "4")]
  Ref(ObjectId),
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum Delta {
  #[serde(rename = "0")]
  Field { field: String, value: FieldValue },
  #[serde(rename = "1")]
  ArrayElement { index: u32, value: FieldValue },
  #[serde(rename = "2")]
  Literal { value: FieldValue },
}

/// Every delta made to one object in a transaction, in the order they were made.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ObjectChange {
  pub object_id: ObjectId,
  pub is_new: bool,
  pub deltas: Vec<Delta>,
}

impl ObjectChange {
  /// A change with no deltas that doesn't create the object carries nothing.
  pub fn is_empty(&self) -> bool {
    !self.is_new && self.deltas.is_empty()
  }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Notify {
  pub lock_id: LockId,
  pub thread: ThreadId,
  pub all: bool,
}

/// A distributed method invocation to run on other clients once the transaction is applied.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DmiDescriptor {
  pub receiver: ObjectId,
  pub dmi_call: ObjectId,
  pub fault_receiver: bool,
}

/// One unit of change made by a client under one or more locks. The first lock is the one the transaction was started with.
#[derive(Clone, Debug)]
pub struct ClientTransaction {
  pub(crate) id: TransactionId,
  pub(crate) sequence: SequenceId,
  pub(crate) lock_ids: Vec<LockId>,
  pub(crate) txn_type: TxnType,
  pub(crate) changes: Vec<ObjectChange>,
  change_index: FxHashMap<ObjectId, usize>,
  pub(crate) new_roots: Vec<(String, ObjectId)>,
  pub(crate) notifies: Vec<Notify>,
  pub(crate) dmis: Vec<DmiDescriptor>,
}

impl ClientTransaction {
  pub fn new(lock_id: LockId, txn_type: TxnType) -> Self {
    Self::with_locks(vec![lock_id], txn_type)
  }

  pub fn with_locks(lock_ids: Vec<LockId>, txn_type: TxnType) -> Self {
    assert!(!lock_ids.is_empty(), "a transaction needs at least one lock");
    Self {
      id: TransactionId::NULL,
      sequence: SequenceId::NULL,
      lock_ids,
      txn_type,
      changes: Vec::new(),
      change_index: FxHashMap::default(),
      new_roots: Vec::new(),
      notifies: Vec::new(),
      dmis: Vec::new(),
    }
  }

  fn change_mut(&mut self, object_id: ObjectId) -> &mut ObjectChange {
    let changes = &mut self.changes;
    let idx = *self.change_index.entry(object_id).or_insert_with(|| {
      changes.push(ObjectChange {
        object_id,
        is_new: false,
        deltas: Vec::new(),
      });
      changes.len() - 1
    });
    &mut self.changes[idx]
  }

  pub fn field_changed(&mut self, object_id: ObjectId, field: impl Into<String>, value: FieldValue) {
    self.change_mut(object_id).deltas.push(Delta::Field {
      field: field.into(),
      value,
    });
  }

  pub fn array_changed(&mut self, object_id: ObjectId, index: u32, value: FieldValue) {
    self
      .change_mut(object_id)
      .deltas
      .push(Delta::ArrayElement { index, value });
  }

  pub fn literal_changed(&mut self, object_id: ObjectId, value: FieldValue) {
    self
      .change_mut(object_id)
      .deltas
      .push(Delta::Literal { value });
  }

  pub fn create_object(&mut self, object_id: ObjectId) {
    self.change_mut(object_id).is_new = true;
  }

  pub fn create_root(&mut self, name: impl Into<String>, object_id: ObjectId) {
    self.new_roots.push((name.into(), object_id));
  }

  pub fn add_notify(&mut self, notify: Notify) {
    self.notifies.push(notify);
  }

  pub fn add_dmi(&mut self, dmi: DmiDescriptor) {
    self.dmis.push(dmi);
  }

  /// Null until the transaction has been added to a batch writer.
  pub fn id(&self) -> TransactionId {
    self.id
  }

  pub fn sequence(&self) -> SequenceId {
    self.sequence
  }

  pub fn lock_ids(&self) -> &[LockId] {
    &self.lock_ids
  }

  pub fn txn_type(&self) -> TxnType {
    self.txn_type
  }

  pub fn changes(&self) -> &[ObjectChange] {
    &self.changes
  }

  pub fn new_roots(&self) -> &[(String, ObjectId)] {
    &self.new_roots
  }

  pub fn notifies(&self) -> &[Notify] {
    &self.notifies
  }

  pub fn dmis(&self) -> &[DmiDescriptor] {
    &self.dmis
  }

  pub fn is_concurrent(&self) -> bool {
    self.txn_type == TxnType::Concurrent
  }

  pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
    self.changes.iter().map(|c| c.object_id)
  }

  pub fn new_object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
    self.changes.iter().filter(|c| c.is_new).map(|c| c.object_id)
  }

  pub fn has_changes_or_notifies(&self) -> bool {
    self.changes.iter().any(|c| !c.is_empty())
      || !self.new_roots.is_empty()
      || !self.notifies.is_empty()
      || !self.dmis.is_empty()
  }

  // Roots, DMIs and notifies have side effects that must happen exactly once and in order.
  pub(crate) fn is_foldable_content(&self) -> bool {
    self.new_roots.is_empty() && self.dmis.is_empty() && self.notifies.is_empty()
  }
}

/// Per-client counter for transaction sequence numbers. Starts at 1, as 0 is the null sequence.
#[derive(Debug, Default)]
pub struct SequenceGenerator(AtomicU64);

impl SequenceGenerator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn next(&self) -> SequenceId {
    SequenceId(self.0.fetch_add(1, Relaxed) + 1)
  }

  /// The last sequence handed out, or null if none has been.
  pub fn current(&self) -> SequenceId {
    SequenceId(self.0.load(Relaxed))
  }
}

#[derive(Debug, Default)]
pub struct TransactionIdGenerator(AtomicU64);

impl TransactionIdGenerator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn next(&self) -> TransactionId {
    TransactionId(self.0.fetch_add(1, Relaxed) + 1)
  }

  pub fn current(&self) -> TransactionId {
    TransactionId(self.0.load(Relaxed))
  }
}

/// The result of adding a transaction to a batch writer: the id it will be applied under, and whether it was folded into an earlier transaction to get that id.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FoldedInfo {
  pub transaction_id: TransactionId,
  pub folded: bool,
}

/// A transaction as reconstructed on the receiving side of a batch.
#[derive(Clone, Debug)]
pub struct ServerTransaction {
  pub(crate) source: ClientId,
  pub(crate) transaction_id: TransactionId,
  pub(crate) sequence_id: SequenceId,
  pub(crate) txn_type: TxnType,
  pub(crate) num_application_txn: u32,
  pub(crate) lock_ids: Vec<LockId>,
  pub(crate) changes: Vec<ObjectChange>,
  pub(crate) new_roots: Vec<(String, ObjectId)>,
  pub(crate) notifies: Vec<Notify>,
  pub(crate) dmis: Vec<DmiDescriptor>,
}

impl ServerTransaction {
  pub fn source(&self) -> ClientId {
    self.source
  }

  pub fn transaction_id(&self) -> TransactionId {
    self.transaction_id
  }

  pub fn sequence_id(&self) -> SequenceId {
    self.sequence_id
  }

  pub fn txn_type(&self) -> TxnType {
    self.txn_type
  }

  /// How many client transactions were folded into this one; 1 if it was never folded. Diagnostic only.
  pub fn num_application_txn(&self) -> u32 {
    self.num_application_txn
  }

  /// In fold order.
  pub fn lock_ids(&self) -> &[LockId] {
    &self.lock_ids
  }

  pub fn changes(&self) -> &[ObjectChange] {
    &self.changes
  }

  pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
    self.changes.iter().map(|c| c.object_id)
  }

  pub fn new_object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
    self.changes.iter().filter(|c| c.is_new).map(|c| c.object_id)
  }

  pub fn new_roots(&self) -> &[(String, ObjectId)] {
    &self.new_roots
  }

  pub fn notifies(&self) -> &[Notify] {
    &self.notifies
  }

  pub fn dmis(&self) -> &[DmiDescriptor] {
    &self.dmis
  }
}
