use super::context::ContextState;
use super::context::ServerLockContext;
use super::helper::LockHelper;
use super::notified_waiters::NotifiedWaiters;
use super::ClientLockContext;
use super::ClientLockState;
use super::LockResponse;
use super::NotifyAction;
use super::ServerLockLevel;
use crate::id::ClientId;
use crate::id::LockId;
use crate::id::ThreadId;
use crate::op::OpError;
use crate::op::OpResult;
use crate::LockPolicy;
use itertools::Itertools;
use std::sync::atomic::Ordering::Relaxed;
use tracing::debug;
use tracing::trace;
use tracing::warn;

#[cfg(test)]
mod tests;

/*

# Context layout

Every requester of a lock has at most one context, and all contexts live in one list laid out as:

  holders | pending and try-pending, in arrival order | waiters, in arrival order

New holders go to the front, new pending requests go just before the first waiter, and new waiters go to the back. This means a notified waiter lands after every request that was already pending, but keeps its order relative to waiters notified with it.

Admission only ever looks at the first pending context. If it can be awarded, it is, along with every READ directly behind it if it's a READ. A WRITE at the head blocks everything behind it, and a READ never skips over a WRITE that arrived earlier.

# Greedy leases

Under the greedy policy, an award that nobody else is queued for goes to the whole client (ThreadId::VM) instead of the requesting thread, so the client can serve its own threads without asking again. Once something from another client can't be awarded because of a lease, the lease holders are sent one recall, and give the lease back with `recall_commit`, listing what their threads actually hold, wait for, and want.

*/

#[derive(Debug)]
pub struct ServerLock {
  lock_id: LockId,
  contexts: Vec<ServerLockContext>,
  // Set once the current greedy holders have been sent a recall, so that more conflicting requests don't send it again.
  recall_in_progress: bool,
}

impl ServerLock {
  pub fn new(lock_id: LockId) -> Self {
    Self {
      lock_id,
      contexts: Vec::new(),
      recall_in_progress: false,
    }
  }

  pub fn lock_id(&self) -> &LockId {
    &self.lock_id
  }

  pub fn is_empty(&self) -> bool {
    self.contexts.is_empty()
  }

  /// In list order: holders, then pending requests, then waiters.
  pub fn iter(&self) -> impl Iterator<Item = &ServerLockContext> {
    self.contexts.iter()
  }

  pub fn first(&self) -> Option<&ServerLockContext> {
    self.contexts.first()
  }

  pub fn get(&self, client: ClientId, thread: ThreadId) -> Option<&ServerLockContext> {
    self.contexts.iter().find(|c| c.is_requester(client, thread))
  }

  pub fn holders_count(&self) -> usize {
    self.contexts.iter().filter(|c| c.state().is_holder()).count()
  }

  pub fn pending_count(&self) -> usize {
    self.contexts.iter().filter(|c| c.state().is_pending()).count()
  }

  pub fn waiters_count(&self) -> usize {
    self.contexts.iter().filter(|c| c.state().is_waiter()).count()
  }

  pub fn has_pending(&self) -> bool {
    self.contexts.iter().any(|c| c.state().is_pending())
  }

  pub fn has_waiters(&self) -> bool {
    self.contexts.iter().any(|c| c.state().is_waiter())
  }

  pub fn has_greedy_holders(&self) -> bool {
    self.contexts.iter().any(|c| c.state().is_greedy_holder())
  }

  pub fn is_recall_in_progress(&self) -> bool {
    self.recall_in_progress
  }

  pub fn holder_level(&self) -> Option<ServerLockLevel> {
    self
      .contexts
      .first()
      .filter(|c| c.state().is_holder())
      .map(|c| c.state().level())
  }

  pub fn lock(
    &mut self,
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
    helper: &LockHelper,
  ) -> OpResult<()> {
    if !self.validate_request(client, thread, level, helper)? {
      return Ok(());
    };
    self.add_pending(ServerLockContext::new(
      client,
      thread,
      ContextState::Pending(level),
    ));
    self.process_pending(helper);
    Ok(())
  }

  /// A non-positive timeout only succeeds if the lock can be awarded right now; otherwise the request is refused straight away.
  pub fn try_lock(
    &mut self,
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
    timeout_ms: i64,
    helper: &LockHelper,
  ) -> OpResult<()> {
    if !self.validate_request(client, thread, level, helper)? {
      return Ok(());
    };
    if timeout_ms <= 0 && !self.can_award_now(level) {
      self.refuse(client, thread, level, helper);
      return Ok(());
    };
    let timer =
      (timeout_ms > 0).then(|| helper.schedule_timer(&self.lock_id, client, thread, timeout_ms));
    self.add_pending(
      ServerLockContext::new(client, thread, ContextState::TryPending(level))
        .with_timer(timeout_ms, timer),
    );
    self.process_pending(helper);
    Ok(())
  }

  pub fn unlock(&mut self, client: ClientId, thread: ThreadId, helper: &LockHelper) {
    let Some(idx) = self.position(|c| c.is_requester(client, thread) && c.state().is_holder()) else {
      if self
        .contexts
        .iter()
        .any(|c| c.client() == client && c.state().is_greedy_holder())
      {
        // This unlock was sent before the client learnt about its lease. The lease comes back through a recall commit instead.
        debug!(lock_id = %self.lock_id, %client, %thread, "ignoring unlock under greedy lease");
        return;
      };
      panic!(
        "{client},{thread} is not a holder of {}: [{}]",
        self.lock_id,
        self.describe()
      );
    };
    let ctx = self.contexts.remove(idx);
    trace!(lock_id = %self.lock_id, %client, %thread, state = ?ctx.state(), "unlocked");
    self.refresh_recall_flag();
    self.process_pending(helper);
  }

  /// A negative timeout waits until notified or interrupted.
  pub fn wait(
    &mut self,
    client: ClientId,
    thread: ThreadId,
    timeout_ms: i64,
    helper: &LockHelper,
  ) -> OpResult<()> {
    let idx = self.monitor_holder_index(client, thread)?;
    self.contexts.remove(idx);
    self.refresh_recall_flag();
    let timer =
      (timeout_ms >= 0).then(|| helper.schedule_timer(&self.lock_id, client, thread, timeout_ms));
    self.add_waiter(
      ServerLockContext::new(client, thread, ContextState::Waiter).with_timer(timeout_ms, timer),
    );
    helper.metrics.0.wait_count.fetch_add(1, Relaxed);
    debug!(lock_id = %self.lock_id, %client, %thread, timeout_ms, "waiting");
    self.process_pending(helper);
    Ok(())
  }

  pub fn notify(
    &mut self,
    client: ClientId,
    thread: ThreadId,
    action: NotifyAction,
    notified: &mut NotifiedWaiters,
    helper: &LockHelper,
  ) -> OpResult<()> {
    self.monitor_holder_index(client, thread)?;
    let waiters = self.remove_waiters(action);
    helper.metrics.0.notify_count.fetch_add(1, Relaxed);
    helper
      .metrics
      .0
      .notified_waiter_count
      .fetch_add(waiters.len() as u64, Relaxed);
    debug!(lock_id = %self.lock_id, %client, %thread, %action, notified = waiters.len(), "notify");
    for mut waiter in waiters {
      waiter.cancel_timer();
      notified.add_notification(self.lock_id.clone(), waiter.client(), waiter.thread());
      self.add_pending(ServerLockContext::new(
        waiter.client(),
        waiter.thread(),
        ContextState::Pending(ServerLockLevel::Write),
      ));
    }
    Ok(())
  }

  pub fn interrupt(&mut self, client: ClientId, thread: ThreadId, helper: &LockHelper) {
    let Some(idx) = self.position(|c| c.is_requester(client, thread) && c.state().is_waiter()) else {
      warn!(lock_id = %self.lock_id, %client, %thread, "cannot interrupt as requester is not waiting");
      return;
    };
    let mut waiter = self.contexts.remove(idx);
    waiter.cancel_timer();
    self.add_pending(ServerLockContext::new(
      client,
      thread,
      ContextState::Pending(ServerLockLevel::Write),
    ));
    self.process_pending(helper);
  }

  pub fn query(&self, client: ClientId, thread: ThreadId, helper: &LockHelper) {
    let holders_and_waiters = self
      .contexts
      .iter()
      .filter(|c| !c.state().is_pending())
      .map(|c| c.to_client_context())
      .collect();
    helper.respond(LockResponse::Query {
      lock_id: self.lock_id.clone(),
      client,
      thread,
      holder_level: self.holder_level(),
      holders_and_waiters,
      pending_count: self.pending_count(),
    });
  }

  /// Applies an expired wait or try-lock timer. Does nothing if the context it was armed for has since been notified, awarded, interrupted or cleared.
  pub fn timer_timeout(
    &mut self,
    client: ClientId,
    thread: ThreadId,
    timer_id: u64,
    helper: &LockHelper,
  ) {
    let Some(idx) = self.position(|c| {
      c.is_requester(client, thread)
        && c.timer_id() == Some(timer_id)
        && matches!(c.state(), ContextState::Waiter | ContextState::TryPending(_))
    }) else {
      helper
        .metrics
        .0
        .timer_suppressed_count
        .fetch_add(1, Relaxed);
      trace!(lock_id = %self.lock_id, %client, %thread, timer_id, "timer has nothing to act on");
      return;
    };
    let ctx = self.contexts.remove(idx);
    match ctx.state() {
      ContextState::Waiter => {
        helper.metrics.0.wait_timeout_count.fetch_add(1, Relaxed);
        debug!(lock_id = %self.lock_id, %client, %thread, "wait timed out");
        helper.respond(LockResponse::WaitTimeout {
          lock_id: self.lock_id.clone(),
          client,
          thread,
        });
        self.add_pending(ServerLockContext::new(
          client,
          thread,
          ContextState::Pending(ServerLockLevel::Write),
        ));
      }
      ContextState::TryPending(level) => {
        helper
          .metrics
          .0
          .try_lock_timeout_count
          .fetch_add(1, Relaxed);
        self.refuse(client, thread, level, helper);
      }
      state => unreachable!("timer matched a {state:?} context"),
    };
    self.process_pending(helper);
  }

  /// Rebuilds a client's state after failover. Only holders and waiters are sent; pending requests are resent as normal requests.
  pub fn reestablish(&mut self, ctx: ClientLockContext, helper: &LockHelper) {
    let ClientLockContext {
      client,
      thread,
      state,
    } = ctx;
    assert!(
      self.get(client, thread).is_none(),
      "{client},{thread} already has state on {}: [{}]",
      self.lock_id,
      self.describe()
    );
    match state {
      ClientLockState::Holder(level) | ClientLockState::GreedyHolder(level) => {
        assert!(
          self.can_award(level),
          "{} could not be reestablished for {client},{thread} as it is already held: [{}]",
          self.lock_id,
          self.describe()
        );
        let state = match state {
          ClientLockState::GreedyHolder(_) => ContextState::GreedyHolder(level),
          _ => ContextState::Holder(level),
        };
        self.add_holder(ServerLockContext::new(client, thread, state));
      }
      ClientLockState::Waiter { timeout_ms } => {
        let timer = (timeout_ms >= 0)
          .then(|| helper.schedule_timer(&self.lock_id, client, thread, timeout_ms));
        self.add_waiter(
          ServerLockContext::new(client, thread, ContextState::Waiter)
            .with_timer(timeout_ms, timer),
        );
      }
      state => panic!("cannot reestablish {state:?} on {}", self.lock_id),
    };
  }

  /// Removes every context of the client, as on disconnect, and returns whether the lock is now empty.
  pub fn clear_state_for_client(&mut self, client: ClientId, helper: &LockHelper) -> bool {
    let before = self.contexts.len();
    self.contexts.retain_mut(|c| {
      if c.client() != client {
        return true;
      };
      c.cancel_timer();
      false
    });
    let cleared = before - self.contexts.len();
    if cleared > 0 {
      debug!(lock_id = %self.lock_id, %client, cleared, "cleared client state");
      self.refresh_recall_flag();
      self.process_pending(helper);
    };
    self.is_empty()
  }

  /// Takes back a client's greedy lease, replacing it with the contexts its threads actually have.
  pub fn recall_commit(
    &mut self,
    client: ClientId,
    contexts: Vec<ClientLockContext>,
    helper: &LockHelper,
  ) {
    let before = self.contexts.len();
    self
      .contexts
      .retain(|c| !(c.client() == client && c.state().is_greedy_holder()));
    if self.contexts.len() == before {
      warn!(lock_id = %self.lock_id, %client, "ignoring recall commit from a client without a greedy lease");
      return;
    };
    self.refresh_recall_flag();
    debug!(lock_id = %self.lock_id, %client, contexts = contexts.len(), "recall committed");

    for ctx in contexts {
      assert_eq!(
        ctx.client, client,
        "recall commit for {} carries a context of another client",
        self.lock_id
      );
      let thread = ctx.thread;
      match ctx.state {
        ClientLockState::Holder(level) | ClientLockState::GreedyHolder(level) => {
          assert!(
            self.can_award(level),
            "recall commit for {} reports a {level} holder that conflicts with [{}]",
            self.lock_id,
            self.describe()
          );
          self.add_holder(ServerLockContext::new(
            client,
            thread,
            ContextState::Holder(level),
          ));
        }
        ClientLockState::Pending(level) => {
          self.add_pending(ServerLockContext::new(
            client,
            thread,
            ContextState::Pending(level),
          ));
        }
        ClientLockState::TryPending { level, timeout_ms } => {
          let timer = (timeout_ms > 0)
            .then(|| helper.schedule_timer(&self.lock_id, client, thread, timeout_ms));
          self.add_pending(
            ServerLockContext::new(client, thread, ContextState::TryPending(level))
              .with_timer(timeout_ms, timer),
          );
        }
        ClientLockState::Waiter { timeout_ms } => {
          let timer = (timeout_ms >= 0)
            .then(|| helper.schedule_timer(&self.lock_id, client, thread, timeout_ms));
          self.add_waiter(
            ServerLockContext::new(client, thread, ContextState::Waiter)
              .with_timer(timeout_ms, timer),
          );
        }
      };
    }
    self.process_pending(helper);
  }

  fn position(&self, pred: impl Fn(&ServerLockContext) -> bool) -> Option<usize> {
    self.contexts.iter().position(pred)
  }

  fn describe(&self) -> String {
    self
      .contexts
      .iter()
      .map(|c| format!("{}/{}/{:?}", c.client(), c.thread(), c.state()))
      .join(", ")
  }

  // Returns false if the request should be dropped without effect.
  fn validate_request(
    &self,
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
    helper: &LockHelper,
  ) -> OpResult<bool> {
    if let Some(lease) = self
      .contexts
      .iter()
      .find(|c| c.client() == client && c.state().is_greedy_holder())
    {
      if lease.state().level() == ServerLockLevel::Write || level == ServerLockLevel::Read {
        debug!(lock_id = %self.lock_id, %client, %thread, %level, "ignoring request covered by greedy lease");
        return Ok(false);
      };
    };
    for ctx in self.contexts.iter().filter(|c| c.is_requester(client, thread)) {
      match ctx.state() {
        ContextState::Holder(held) | ContextState::GreedyHolder(held) => {
          if held == ServerLockLevel::Read && level == ServerLockLevel::Write {
            helper
              .metrics
              .0
              .upgrade_reject_count
              .fetch_add(1, Relaxed);
            return Err(OpError::LockUpgradeNotSupported {
              lock_id: self.lock_id.clone(),
              client,
              thread,
            });
          };
          panic!(
            "{client},{thread} requesting already held lock {}: [{}]",
            self.lock_id,
            self.describe()
          );
        }
        ContextState::Waiter => panic!(
          "{client},{thread} is already waiting on {}: [{}]",
          self.lock_id,
          self.describe()
        ),
        ContextState::Pending(_) | ContextState::TryPending(_) => {
          warn!(lock_id = %self.lock_id, %client, %thread, "ignoring duplicate lock request");
          return Ok(false);
        }
      };
    }
    Ok(true)
  }

  fn monitor_holder_index(&self, client: ClientId, thread: ThreadId) -> OpResult<usize> {
    let illegal = |reason| OpError::IllegalMonitorState {
      lock_id: self.lock_id.clone(),
      client,
      thread,
      reason,
    };
    let Some(idx) = self.position(|c| c.is_requester(client, thread) && c.state().is_holder()) else {
      return Err(illegal("no holder present"));
    };
    if !self.contexts[idx].state().is_write_holder() {
      return Err(illegal("holder not in correct state"));
    };
    Ok(idx)
  }

  fn remove_waiters(&mut self, action: NotifyAction) -> Vec<ServerLockContext> {
    match action {
      NotifyAction::One => self
        .position(|c| c.state().is_waiter())
        .map(|idx| vec![self.contexts.remove(idx)])
        .unwrap_or_default(),
      NotifyAction::All => {
        let (waiters, rest) = std::mem::take(&mut self.contexts)
          .into_iter()
          .partition(|c| c.state().is_waiter());
        self.contexts = rest;
        waiters
      }
    }
  }

  fn add_holder(&mut self, ctx: ServerLockContext) {
    self.contexts.insert(0, ctx);
  }

  fn add_pending(&mut self, ctx: ServerLockContext) {
    let idx = self
      .position(|c| c.state().is_waiter())
      .unwrap_or(self.contexts.len());
    self.contexts.insert(idx, ctx);
  }

  fn add_waiter(&mut self, ctx: ServerLockContext) {
    self.contexts.push(ctx);
  }

  fn can_award(&self, level: ServerLockLevel) -> bool {
    match level {
      ServerLockLevel::Read => matches!(self.holder_level(), None | Some(ServerLockLevel::Read)),
      ServerLockLevel::Write => self.holder_level().is_none(),
    }
  }

  fn can_award_now(&self, level: ServerLockLevel) -> bool {
    !self.has_pending() && self.can_award(level)
  }

  fn has_pending_from_other_clients(&self, client: ClientId) -> bool {
    self
      .contexts
      .iter()
      .any(|c| c.state().is_pending() && c.client() != client)
  }

  fn refresh_recall_flag(&mut self) {
    if !self.has_greedy_holders() {
      self.recall_in_progress = false;
    };
  }

  fn process_pending(&mut self, helper: &LockHelper) {
    let Some(idx) = self.position(|c| c.state().is_pending()) else {
      return;
    };
    let level = self.contexts[idx].state().level();
    if !self.can_award(level) {
      if helper.policy == LockPolicy::Greedy && self.has_greedy_holders() {
        self.recall(helper);
      };
      return;
    };
    match level {
      ServerLockLevel::Write => {
        let ctx = self.contexts.remove(idx);
        self.award(ctx, helper);
      }
      ServerLockLevel::Read => {
        let mut reads = Vec::new();
        while self.contexts.get(idx).map_or(false, |c| {
          c.state().is_pending() && c.state().level() == ServerLockLevel::Read
        }) {
          reads.push(self.contexts.remove(idx));
        }
        for ctx in reads {
          self.award(ctx, helper);
        }
      }
    };
  }

  fn award(&mut self, mut ctx: ServerLockContext, helper: &LockHelper) {
    ctx.cancel_timer();
    let client = ctx.client();
    let level = ctx.state().level();
    let greedy = helper.policy == LockPolicy::Greedy
      && !self.has_waiters()
      && !self.has_pending_from_other_clients(client);
    let (thread, state) = if greedy {
      if self
        .contexts
        .iter()
        .any(|c| c.client() == client && c.state().is_greedy_holder())
      {
        // Already covered by the lease granted to this client earlier in the same READ burst.
        return;
      };
      // The lease also covers everything else this client has queued.
      self.contexts.retain_mut(|c| {
        if c.client() != client || !c.state().is_pending() {
          return true;
        };
        c.cancel_timer();
        false
      });
      helper.metrics.0.greedy_award_count.fetch_add(1, Relaxed);
      (ThreadId::VM, ContextState::GreedyHolder(level))
    } else {
      (ctx.thread(), ContextState::Holder(level))
    };
    self.add_holder(ServerLockContext::new(client, thread, state));
    helper.metrics.0.lock_award_count.fetch_add(1, Relaxed);
    debug!(lock_id = %self.lock_id, %client, %thread, %level, greedy, "awarded lock");
    helper.respond(LockResponse::Award {
      lock_id: self.lock_id.clone(),
      client,
      thread,
      level,
    });
  }

  fn refuse(&self, client: ClientId, thread: ThreadId, level: ServerLockLevel, helper: &LockHelper) {
    helper.metrics.0.lock_refuse_count.fetch_add(1, Relaxed);
    debug!(lock_id = %self.lock_id, %client, %thread, %level, "refused lock");
    helper.respond(LockResponse::Refused {
      lock_id: self.lock_id.clone(),
      client,
      thread,
      level,
    });
  }

  fn recall(&mut self, helper: &LockHelper) {
    if self.recall_in_progress {
      return;
    };
    self.recall_in_progress = true;
    for c in self.contexts.iter().filter(|c| c.state().is_greedy_holder()) {
      helper.metrics.0.recall_count.fetch_add(1, Relaxed);
      debug!(lock_id = %self.lock_id, client = %c.client(), "recalling greedy lease");
      helper.respond(LockResponse::Recall {
        lock_id: self.lock_id.clone(),
        client: c.client(),
        thread: c.thread(),
        level: c.state().level(),
      });
    }
  }
}
