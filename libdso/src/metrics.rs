use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

#[rustfmt::skip]
#[derive(Default)]
pub(crate) struct Inner {
  pub(crate) lock_award_count: AtomicU64, // Includes greedy awards.
  pub(crate) greedy_award_count: AtomicU64,
  pub(crate) lock_refuse_count: AtomicU64,
  pub(crate) recall_count: AtomicU64,
  pub(crate) upgrade_reject_count: AtomicU64,

  pub(crate) wait_count: AtomicU64,
  pub(crate) notify_count: AtomicU64,
  pub(crate) notified_waiter_count: AtomicU64,
  pub(crate) wait_timeout_count: AtomicU64,
  pub(crate) try_lock_timeout_count: AtomicU64,

  pub(crate) timer_armed_count: AtomicU64,
  pub(crate) timer_fired_count: AtomicU64,
  // Fired or dropped timers that had no effect, because they were cancelled, their context moved on, or the manager was not running.
  pub(crate) timer_suppressed_count: AtomicU64,

  pub(crate) client_clear_count: AtomicU64,

  pub(crate) txn_added_count: AtomicU64,
  pub(crate) txn_folded_count: AtomicU64,
  pub(crate) txn_removed_count: AtomicU64,
  pub(crate) batch_sent_count: AtomicU64,
  pub(crate) batch_sent_bytes: AtomicU64,
}

#[derive(Clone, Default)]
pub struct DsoMetrics(pub(crate) Arc<Inner>);

impl DsoMetrics {
  pub fn all(&self) -> Vec<(&'static str, u64)> {
    vec![
      ("lock_award_count", self.lock_award_count()),
      ("greedy_award_count", self.greedy_award_count()),
      ("lock_refuse_count", self.lock_refuse_count()),
      ("recall_count", self.recall_count()),
      ("upgrade_reject_count", self.upgrade_reject_count()),
      ("wait_count", self.wait_count()),
      ("notify_count", self.notify_count()),
      ("notified_waiter_count", self.notified_waiter_count()),
      ("wait_timeout_count", self.wait_timeout_count()),
      ("try_lock_timeout_count", self.try_lock_timeout_count()),
      ("timer_armed_count", self.timer_armed_count()),
      ("timer_fired_count", self.timer_fired_count()),
      ("timer_suppressed_count", self.timer_suppressed_count()),
      ("client_clear_count", self.client_clear_count()),
      ("txn_added_count", self.txn_added_count()),
      ("txn_folded_count", self.txn_folded_count()),
      ("txn_removed_count", self.txn_removed_count()),
      ("batch_sent_count", self.batch_sent_count()),
      ("batch_sent_bytes", self.batch_sent_bytes()),
    ]
  }
}

#[rustfmt::skip]
impl DsoMetrics {
  pub fn lock_award_count(&self) -> u64 { self.0.lock_award_count.load(Relaxed) }
  pub fn greedy_award_count(&self) -> u64 { self.0.greedy_award_count.load(Relaxed) }
  pub fn lock_refuse_count(&self) -> u64 { self.0.lock_refuse_count.load(Relaxed) }
  pub fn recall_count(&self) -> u64 { self.0.recall_count.load(Relaxed) }
  pub fn upgrade_reject_count(&self) -> u64 { self.0.upgrade_reject_count.load(Relaxed) }

  pub fn wait_count(&self) -> u64 { self.0.wait_count.load(Relaxed) }
  pub fn notify_count(&self) -> u64 { self.0.notify_count.load(Relaxed) }
  pub fn notified_waiter_count(&self) -> u64 { self.0.notified_waiter_count.load(Relaxed) }
  pub fn wait_timeout_count(&self) -> u64 { self.0.wait_timeout_count.load(Relaxed) }
  pub fn try_lock_timeout_count(&self) -> u64 { self.0.try_lock_timeout_count.load(Relaxed) }

  pub fn timer_armed_count(&self) -> u64 { self.0.timer_armed_count.load(Relaxed) }
  pub fn timer_fired_count(&self) -> u64 { self.0.timer_fired_count.load(Relaxed) }
  pub fn timer_suppressed_count(&self) -> u64 { self.0.timer_suppressed_count.load(Relaxed) }

  pub fn client_clear_count(&self) -> u64 { self.0.client_clear_count.load(Relaxed) }

  pub fn txn_added_count(&self) -> u64 { self.0.txn_added_count.load(Relaxed) }
  pub fn txn_folded_count(&self) -> u64 { self.0.txn_folded_count.load(Relaxed) }
  pub fn txn_removed_count(&self) -> u64 { self.0.txn_removed_count.load(Relaxed) }
  pub fn batch_sent_count(&self) -> u64 { self.0.batch_sent_count.load(Relaxed) }
  pub fn batch_sent_bytes(&self) -> u64 { self.0.batch_sent_bytes.load(Relaxed) }
}
