use crate::id::BatchId;
use crate::id::TransactionId;
use parking_lot::Mutex;
use std::sync::Arc;

/// The outgoing message that carries one encoded batch to the coordinator.
pub trait CommitTransactionMessage: Send {
  /// `acknowledged` lists transactions whose acknowledgements the coordinator can now forget.
  fn set_batch(&mut self, batch_id: BatchId, data: Vec<u8>, acknowledged: Vec<TransactionId>);
  fn send(self: Box<Self>);
}

pub trait CommitTransactionMessageFactory: Send + Sync {
  fn new_message(&self) -> Box<dyn CommitTransactionMessage>;
}

#[derive(Clone, Debug)]
pub struct SentBatch {
  pub batch_id: BatchId,
  pub data: Vec<u8>,
  pub acknowledged: Vec<TransactionId>,
}

/// Keeps every sent batch in memory, in send order.
#[derive(Clone, Default)]
pub struct MemoryMessageFactory {
  sent: Arc<Mutex<Vec<SentBatch>>>,
}

impl MemoryMessageFactory {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn sent(&self) -> Vec<SentBatch> {
    self.sent.lock().clone()
  }

  pub fn take_sent(&self) -> Vec<SentBatch> {
    std::mem::take(&mut *self.sent.lock())
  }
}

struct MemoryMessage {
  sent: Arc<Mutex<Vec<SentBatch>>>,
  batch: Option<SentBatch>,
}

impl CommitTransactionMessage for MemoryMessage {
  fn set_batch(&mut self, batch_id: BatchId, data: Vec<u8>, acknowledged: Vec<TransactionId>) {
    self.batch = Some(SentBatch {
      batch_id,
      data,
      acknowledged,
    });
  }

  fn send(self: Box<Self>) {
    // A message sent without a batch has nothing to deliver.
    if let Some(batch) = self.batch {
      self.sent.lock().push(batch);
    };
  }
}

impl CommitTransactionMessageFactory for MemoryMessageFactory {
  fn new_message(&self) -> Box<dyn CommitTransactionMessage> {
    Box::new(MemoryMessage {
      sent: self.sent.clone(),
      batch: None,
    })
  }
}
