use super::timer::TimerHandle;
use super::ClientLockContext;
use super::ClientLockState;
use super::ServerLockLevel;
use crate::id::ClientId;
use crate::id::ThreadId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContextState {
  Holder(ServerLockLevel),
  GreedyHolder(ServerLockLevel),
  Pending(ServerLockLevel),
  TryPending(ServerLockLevel),
  // Waiters always come back as WRITE requests.
  Waiter,
}

impl ContextState {
  pub fn level(self) -> ServerLockLevel {
    match self {
      ContextState::Holder(l)
      | ContextState::GreedyHolder(l)
      | ContextState::Pending(l)
      | ContextState::TryPending(l) => l,
      ContextState::Waiter => ServerLockLevel::Write,
    }
  }

  pub fn is_holder(self) -> bool {
    matches!(
      self,
      ContextState::Holder(_) | ContextState::GreedyHolder(_)
    )
  }

  pub fn is_greedy_holder(self) -> bool {
    matches!(self, ContextState::GreedyHolder(_))
  }

  /// Both plain and try-lock requests.
  pub fn is_pending(self) -> bool {
    matches!(
      self,
      ContextState::Pending(_) | ContextState::TryPending(_)
    )
  }

  pub fn is_waiter(self) -> bool {
    self == ContextState::Waiter
  }

  pub fn is_write_holder(self) -> bool {
    matches!(
      self,
      ContextState::Holder(ServerLockLevel::Write) | ContextState::GreedyHolder(ServerLockLevel::Write)
    )
  }
}

/// One requester's entry in a ServerLock's arrival-ordered context list.
#[derive(Debug)]
pub struct ServerLockContext {
  client: ClientId,
  thread: ThreadId,
  state: ContextState,
  // Only meaningful for waiters and try-lock requests; negative means no timer.
  timeout_ms: i64,
  timer: Option<TimerHandle>,
}

impl ServerLockContext {
  pub(crate) fn new(client: ClientId, thread: ThreadId, state: ContextState) -> Self {
    Self {
      client,
      thread,
      state,
      timeout_ms: -1,
      timer: None,
    }
  }

  pub(crate) fn with_timer(mut self, timeout_ms: i64, timer: Option<TimerHandle>) -> Self {
    self.timeout_ms = timeout_ms;
    self.timer = timer;
    self
  }

  pub fn client(&self) -> ClientId {
    self.client
  }

  pub fn thread(&self) -> ThreadId {
    self.thread
  }

  pub fn state(&self) -> ContextState {
    self.state
  }

  pub fn timeout_ms(&self) -> i64 {
    self.timeout_ms
  }

  pub fn timer_id(&self) -> Option<u64> {
    self.timer.as_ref().map(|t| t.id())
  }

  pub fn is_requester(&self, client: ClientId, thread: ThreadId) -> bool {
    self.client == client && self.thread == thread
  }

  /// Cancels any armed timer. A timer that has already been taken by the timer thread will still find this context gone or changed under checkout and do nothing.
  pub(crate) fn cancel_timer(&mut self) {
    if let Some(timer) = self.timer.take() {
      timer.cancel();
    };
  }

  pub(crate) fn to_client_context(&self) -> ClientLockContext {
    let state = match self.state {
      ContextState::Holder(l) => ClientLockState::Holder(l),
      ContextState::GreedyHolder(l) => ClientLockState::GreedyHolder(l),
      ContextState::Pending(l) => ClientLockState::Pending(l),
      ContextState::TryPending(level) => ClientLockState::TryPending {
        level,
        timeout_ms: self.timeout_ms,
      },
      ContextState::Waiter => ClientLockState::Waiter {
        timeout_ms: self.timeout_ms,
      },
    };
    ClientLockContext {
      client: self.client,
      thread: self.thread,
      state,
    }
  }
}
