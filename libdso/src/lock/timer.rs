use crate::id::ClientId;
use crate::id::LockId;
use crate::id::ThreadId;
use crate::metrics::DsoMetrics;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::sync::Weak;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::trace;

/// Handle kept by a waiter or try-lock context so that a notify or award can cancel its timer.
#[derive(Debug)]
pub struct TimerHandle {
  id: u64,
  cancelled: Arc<AtomicBool>,
  sender: Sender<TimerMsg>,
}

impl TimerHandle {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// The flag covers a task the loop has already taken; the message makes the loop drop the task.
  pub(crate) fn cancel(&self) {
    self.cancelled.store(true, Relaxed);
    let _ = self.sender.send(TimerMsg::Cancel(self.id));
  }
}

#[derive(Debug)]
pub(crate) struct TimerTask {
  pub id: u64,
  pub lock_id: LockId,
  pub client: ClientId,
  pub thread: ThreadId,
  cancelled: Arc<AtomicBool>,
}

/// Applies an expired timer. Implementations must check out the lock and check that they are still live before mutating anything.
pub(crate) trait TimerCallback: Send + Sync + 'static {
  fn timer_timeout(&self, task: TimerTask);
}

enum TimerMsg {
  Schedule { deadline: Instant, task: TimerTask },
  Cancel(u64),
  Start,
  Stop,
}

pub(crate) struct LockTimer {
  next_id: AtomicU64,
  sender: Sender<TimerMsg>,
}

impl LockTimer {
  /// The returned receiver must be handed to `start_timer_loop`. Until the loop receives `start`, scheduled timers are held but never fire.
  pub fn new() -> (Self, TimerLoopReceiver) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (
      Self {
        next_id: AtomicU64::new(1),
        sender,
      },
      TimerLoopReceiver(receiver),
    )
  }

  pub fn schedule(
    &self,
    lock_id: LockId,
    client: ClientId,
    thread: ThreadId,
    timeout_ms: i64,
  ) -> TimerHandle {
    let id = self.next_id.fetch_add(1, Relaxed);
    let cancelled = Arc::new(AtomicBool::new(false));
    let delay = Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0));
    let task = TimerTask {
      id,
      lock_id,
      client,
      thread,
      cancelled: cancelled.clone(),
    };
    // If the loop has exited, the manager has stopped and the timer would be inert anyway.
    let _ = self.sender.send(TimerMsg::Schedule {
      deadline: Instant::now() + delay,
      task,
    });
    TimerHandle {
      id,
      cancelled,
      sender: self.sender.clone(),
    }
  }

  pub fn start(&self) {
    let _ = self.sender.send(TimerMsg::Start);
  }

  pub fn stop(&self) {
    let _ = self.sender.send(TimerMsg::Stop);
  }
}

pub(crate) struct TimerLoopReceiver(Receiver<TimerMsg>);

/// Runs on its own thread until stopped or until the callback's owner is dropped. Tasks pending at that point are discarded, which makes them permanently inert. The thread returns how many were discarded.
pub(crate) fn start_timer_loop<C: TimerCallback>(
  receiver: TimerLoopReceiver,
  callback: Weak<C>,
  metrics: DsoMetrics,
) -> thread::JoinHandle<usize> {
  let receiver = receiver.0;
  thread::spawn(move || {
    let mut started = false;
    let mut deadlines = BinaryHeap::<Reverse<(Instant, u64)>>::new();
    let mut tasks = FxHashMap::<u64, TimerTask>::default();
    loop {
      let next_deadline = deadlines.peek().filter(|_| started).map(|d| d.0 .0);
      let msg = match next_deadline {
        Some(deadline) => {
          receiver.recv_timeout(deadline.saturating_duration_since(Instant::now()))
        }
        None => receiver
          .recv()
          .map_err(|_| RecvTimeoutError::Disconnected),
      };
      match msg {
        Ok(TimerMsg::Schedule { deadline, task }) => {
          deadlines.push(Reverse((deadline, task.id)));
          tasks.insert(task.id, task);
        }
        Ok(TimerMsg::Cancel(id)) => {
          // The heap entry stays until its deadline or the next compaction, but finds no task.
          if tasks.remove(&id).is_some() {
            trace!(timer_id = id, "cancelled timer");
            metrics.0.timer_suppressed_count.fetch_add(1, Relaxed);
          };
          if deadlines.len() > 2 * tasks.len() + 64 {
            deadlines.retain(|Reverse((_, timer_id))| tasks.contains_key(timer_id));
          };
        }
        Ok(TimerMsg::Start) => {
          debug!(pending = tasks.len(), "lock timer started");
          started = true;
        }
        Ok(TimerMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        Err(RecvTimeoutError::Timeout) => {}
      };
      if !started {
        continue;
      };

      let now = Instant::now();
      while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
        if deadline > now {
          break;
        };
        deadlines.pop();
        let Some(task) = tasks.remove(&id) else {
          continue;
        };
        if task.cancelled.load(Relaxed) {
          trace!(timer_id = id, lock_id = %task.lock_id, "skipping cancelled timer");
          metrics.0.timer_suppressed_count.fetch_add(1, Relaxed);
          continue;
        };
        let Some(callback) = callback.upgrade() else {
          return tasks.len();
        };
        trace!(timer_id = id, lock_id = %task.lock_id, client = %task.client, thread = %task.thread, "timer fired");
        metrics.0.timer_fired_count.fetch_add(1, Relaxed);
        callback.timer_timeout(task);
      }
    }
    debug!(discarded = tasks.len(), "lock timer stopped");
    metrics
      .0
      .timer_suppressed_count
      .fetch_add(tasks.len() as u64, Relaxed);
    tasks.len()
  })
}
