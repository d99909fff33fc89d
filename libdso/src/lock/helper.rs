use super::timer::LockTimer;
use super::timer::TimerHandle;
use super::LockResponse;
use crate::id::ClientId;
use crate::id::LockId;
use crate::id::ThreadId;
use crate::metrics::DsoMetrics;
use crate::LockPolicy;
use crossbeam_channel::Sender;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tracing::trace;

/// Everything a ServerLock needs from its surroundings while it is checked out.
#[derive(Clone)]
pub struct LockHelper {
  pub(crate) policy: LockPolicy,
  pub(crate) metrics: DsoMetrics,
  responses: Sender<LockResponse>,
  timer: Arc<LockTimer>,
}

impl LockHelper {
  pub(crate) fn new(
    policy: LockPolicy,
    metrics: DsoMetrics,
    responses: Sender<LockResponse>,
    timer: Arc<LockTimer>,
  ) -> Self {
    Self {
      policy,
      metrics,
      responses,
      timer,
    }
  }

  pub(crate) fn respond(&self, response: LockResponse) {
    if self.responses.send(response).is_err() {
      trace!("lock response dropped as nothing is receiving");
    };
  }

  pub(crate) fn schedule_timer(
    &self,
    lock_id: &LockId,
    client: ClientId,
    thread: ThreadId,
    timeout_ms: i64,
  ) -> TimerHandle {
    self.metrics.0.timer_armed_count.fetch_add(1, Relaxed);
    self
      .timer
      .schedule(lock_id.clone(), client, thread, timeout_ms)
  }

  pub(crate) fn timer(&self) -> &LockTimer {
    &self.timer
  }
}
