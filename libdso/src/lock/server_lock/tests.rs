use crate::id::ClientId;
use crate::id::LockId;
use crate::id::ThreadId;
use crate::lock::context::ContextState;
use crate::lock::helper::test_util::test_helper;
use crate::lock::notified_waiters::NotifiedWaiters;
use crate::lock::server_lock::ServerLock;
use crate::lock::ClientLockContext;
use crate::lock::ClientLockState;
use crate::lock::LockResponse;
use crate::lock::NotifyAction;
use crate::lock::ServerLockLevel::Read;
use crate::lock::ServerLockLevel::Write;
use crate::op::OpError;
use crate::LockPolicy;
use crossbeam_channel::Receiver;
use rand::thread_rng;
use rand::Rng;
use tracing_test::traced_test;

fn c(n: u64) -> ClientId {
  ClientId(n)
}

fn t(n: u64) -> ThreadId {
  ThreadId(n)
}

fn drain(rx: &Receiver<LockResponse>) -> Vec<LockResponse> {
  rx.try_iter().collect()
}

fn awarded(rx: &Receiver<LockResponse>) -> Vec<(ClientId, ThreadId)> {
  drain(rx)
    .into_iter()
    .filter_map(|r| match r {
      LockResponse::Award { client, thread, .. } => Some((client, thread)),
      _ => None,
    })
    .collect()
}

fn pending_requesters(lock: &ServerLock) -> Vec<(ClientId, ThreadId)> {
  lock
    .iter()
    .filter(|c| c.state().is_pending())
    .map(|c| (c.client(), c.thread()))
    .collect()
}

#[test]
#[traced_test]
fn test_read_holders_and_upgrade() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Read, &helper).unwrap();
  lock.lock(c(1), t(2), Read, &helper).unwrap();
  lock.lock(c(2), t(1), Read, &helper).unwrap();
  assert_eq!(lock.holders_count(), 3);
  assert_eq!(lock.holder_level(), Some(Read));
  assert_eq!(awarded(&rx).len(), 3);

  let res = lock.lock(c(1), t(1), Write, &helper);
  assert!(matches!(res, Err(OpError::LockUpgradeNotSupported { .. })));
  assert_eq!(lock.holders_count(), 3);
  assert_eq!(lock.pending_count(), 0);
  assert_eq!(helper.metrics.upgrade_reject_count(), 1);

  // A queued WRITE blocks later READs even though they're compatible with the holders.
  lock.lock(c(3), t(1), Write, &helper).unwrap();
  lock.lock(c(4), t(1), Read, &helper).unwrap();
  assert_eq!(lock.holders_count(), 3);
  assert_eq!(pending_requesters(&lock), vec![(c(3), t(1)), (c(4), t(1))]);
  assert!(awarded(&rx).is_empty());

  lock.unlock(c(1), t(1), &helper);
  lock.unlock(c(2), t(1), &helper);
  assert!(awarded(&rx).is_empty());
  lock.unlock(c(1), t(2), &helper);
  assert_eq!(awarded(&rx), vec![(c(3), t(1))]);
  assert_eq!(lock.holder_level(), Some(Write));

  lock.unlock(c(3), t(1), &helper);
  assert_eq!(awarded(&rx), vec![(c(4), t(1))]);
  lock.unlock(c(4), t(1), &helper);
  assert!(lock.is_empty());
}

#[test]
fn test_read_burst_stops_at_write() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.lock(c(2), t(1), Read, &helper).unwrap();
  lock.lock(c(3), t(1), Read, &helper).unwrap();
  lock.lock(c(4), t(1), Write, &helper).unwrap();
  lock.lock(c(5), t(1), Read, &helper).unwrap();
  assert_eq!(awarded(&rx), vec![(c(1), t(1))]);

  lock.unlock(c(1), t(1), &helper);
  assert_eq!(awarded(&rx), vec![(c(2), t(1)), (c(3), t(1))]);
  assert_eq!(lock.holders_count(), 2);
  assert_eq!(pending_requesters(&lock), vec![(c(4), t(1)), (c(5), t(1))]);
}

#[test]
fn test_duplicate_pending_request_is_ignored() {
  let (helper, _rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.lock(c(2), t(1), Write, &helper).unwrap();
  lock.lock(c(2), t(1), Write, &helper).unwrap();
  assert_eq!(lock.pending_count(), 1);
}

#[test]
#[should_panic]
fn test_unlock_by_non_holder_panics() {
  let (helper, _rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.unlock(c(2), t(1), &helper);
}

#[test]
fn test_illegal_monitor_state() {
  let (helper, _rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  let mut notified = NotifiedWaiters::new();

  // Nobody holds it.
  assert!(matches!(
    lock.wait(c(1), t(1), -1, &helper),
    Err(OpError::IllegalMonitorState {
      reason: "no holder present",
      ..
    })
  ));
  assert!(matches!(
    lock.notify(c(1), t(1), NotifyAction::One, &mut notified, &helper),
    Err(OpError::IllegalMonitorState { .. })
  ));

  // Held for READ.
  lock.lock(c(1), t(1), Read, &helper).unwrap();
  assert!(matches!(
    lock.wait(c(1), t(1), -1, &helper),
    Err(OpError::IllegalMonitorState {
      reason: "holder not in correct state",
      ..
    })
  ));
  assert!(matches!(
    lock.notify(c(1), t(1), NotifyAction::All, &mut notified, &helper),
    Err(OpError::IllegalMonitorState { .. })
  ));
  lock.unlock(c(1), t(1), &helper);

  // Held for WRITE by someone else.
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  assert!(lock.wait(c(2), t(1), -1, &helper).is_err());
  assert!(lock
    .notify(c(2), t(1), NotifyAction::One, &mut notified, &helper)
    .is_err());

  // A waiter no longer holds the lock.
  lock.wait(c(1), t(1), -1, &helper).unwrap();
  assert!(lock.wait(c(1), t(1), -1, &helper).is_err());
  assert!(notified.is_empty());
  assert_eq!(lock.waiters_count(), 1);
}

#[test]
#[traced_test]
fn test_wait_and_notify() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.wait(c(1), t(1), -1, &helper).unwrap();
  assert_eq!(lock.holders_count(), 0);
  assert_eq!(lock.waiters_count(), 1);
  assert_eq!(lock.get(c(1), t(1)).unwrap().timer_id(), None);

  lock.lock(c(2), t(1), Write, &helper).unwrap();
  let mut notified = NotifiedWaiters::new();
  lock
    .notify(c(2), t(1), NotifyAction::One, &mut notified, &helper)
    .unwrap();
  assert_eq!(lock.waiters_count(), 0);
  assert_eq!(lock.pending_count(), 1);
  assert_eq!(notified.for_client(c(1))[0].thread, t(1));
  assert_eq!(awarded(&rx), vec![(c(1), t(1)), (c(2), t(1))]);

  lock.unlock(c(2), t(1), &helper);
  assert_eq!(awarded(&rx), vec![(c(1), t(1))]);
  assert_eq!(lock.first().unwrap().state(), ContextState::Holder(Write));
}

#[test]
fn test_notify_one_in_arrival_order() {
  let (helper, _rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  for n in 1..=3 {
    lock.lock(c(2), t(n), Write, &helper).unwrap();
    lock.wait(c(2), t(n), -1, &helper).unwrap();
  }
  lock.lock(c(1), t(9), Write, &helper).unwrap();

  let mut notified = NotifiedWaiters::new();
  for _ in 0..4 {
    lock
      .notify(c(1), t(9), NotifyAction::One, &mut notified, &helper)
      .unwrap();
  }
  assert_eq!(notified.len(), 3);
  assert_eq!(lock.waiters_count(), 0);
  assert_eq!(pending_requesters(&lock), vec![
    (c(2), t(1)),
    (c(2), t(2)),
    (c(2), t(3))
  ]);
  assert_eq!(helper.metrics.notify_count(), 4);
  assert_eq!(helper.metrics.notified_waiter_count(), 3);
}

#[test]
fn test_notify_all() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  for n in 0..100 {
    lock.lock(c(1), t(n), Write, &helper).unwrap();
    lock.wait(c(1), t(n), -1, &helper).unwrap();
  }
  lock.lock(c(0), t(0), Write, &helper).unwrap();
  drain(&rx);

  let mut notified = NotifiedWaiters::new();
  lock
    .notify(c(0), t(0), NotifyAction::All, &mut notified, &helper)
    .unwrap();
  assert_eq!(notified.len(), 100);
  assert_eq!(lock.waiters_count(), 0);
  assert_eq!(lock.pending_count(), 100);

  lock.unlock(c(0), t(0), &helper);
  assert_eq!(awarded(&rx), vec![(c(1), t(0))]);
  assert_eq!(lock.holders_count(), 1);
  assert_eq!(lock.pending_count(), 99);
}

#[test]
fn test_notified_waiter_queues_after_existing_pending() {
  let (helper, _rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.wait(c(1), t(1), -1, &helper).unwrap();
  lock.lock(c(2), t(1), Write, &helper).unwrap();
  lock.lock(c(3), t(1), Write, &helper).unwrap();

  let mut notified = NotifiedWaiters::new();
  lock
    .notify(c(2), t(1), NotifyAction::One, &mut notified, &helper)
    .unwrap();
  assert_eq!(pending_requesters(&lock), vec![(c(3), t(1)), (c(1), t(1))]);
}

#[test]
fn test_timed_wait_reacquires_after_timeout() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.wait(c(1), t(1), 200, &helper).unwrap();
  let timer_id = lock.get(c(1), t(1)).unwrap().timer_id().unwrap();
  assert_eq!(lock.get(c(1), t(1)).unwrap().timeout_ms(), 200);
  drain(&rx);

  lock.timer_timeout(c(1), t(1), timer_id, &helper);
  let responses = drain(&rx);
  assert!(matches!(responses[0], LockResponse::WaitTimeout { .. }));
  assert!(matches!(
    responses[1],
    LockResponse::Award { level: Write, .. }
  ));
  assert_eq!(lock.first().unwrap().state(), ContextState::Holder(Write));
  assert_eq!(helper.metrics.wait_timeout_count(), 1);
}

#[test]
fn test_timed_out_waiter_stays_pending_while_contended() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.wait(c(1), t(1), 50, &helper).unwrap();
  lock.lock(c(2), t(1), Write, &helper).unwrap();
  let timer_id = lock.get(c(1), t(1)).unwrap().timer_id().unwrap();
  drain(&rx);

  lock.timer_timeout(c(1), t(1), timer_id, &helper);
  assert_eq!(pending_requesters(&lock), vec![(c(1), t(1))]);
  assert!(awarded(&rx).is_empty());
}

#[test]
fn test_notify_disarms_wait_timer() {
  let (helper, _rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.wait(c(1), t(1), 100, &helper).unwrap();
  let timer_id = lock.get(c(1), t(1)).unwrap().timer_id().unwrap();
  lock.lock(c(2), t(1), Write, &helper).unwrap();
  lock
    .notify(c(2), t(1), NotifyAction::All, &mut NotifiedWaiters::new(), &helper)
    .unwrap();

  lock.timer_timeout(c(1), t(1), timer_id, &helper);
  assert_eq!(lock.holders_count(), 1);
  assert_eq!(lock.pending_count(), 1);
  assert_eq!(lock.waiters_count(), 0);
  assert_eq!(helper.metrics.wait_timeout_count(), 0);
  assert_eq!(helper.metrics.timer_suppressed_count(), 1);
}

#[test]
fn test_try_lock() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.try_lock(c(1), t(1), Write, 0, &helper).unwrap();
  assert_eq!(awarded(&rx), vec![(c(1), t(1))]);

  lock.try_lock(c(2), t(1), Write, 0, &helper).unwrap();
  assert!(matches!(drain(&rx)[..], [LockResponse::Refused { .. }]));
  assert!(lock.get(c(2), t(1)).is_none());

  lock.try_lock(c(3), t(1), Write, 500, &helper).unwrap();
  let timer_id = lock.get(c(3), t(1)).unwrap().timer_id().unwrap();
  lock.timer_timeout(c(3), t(1), timer_id, &helper);
  assert!(matches!(drain(&rx)[..], [LockResponse::Refused { .. }]));
  assert!(lock.get(c(3), t(1)).is_none());
  assert_eq!(helper.metrics.try_lock_timeout_count(), 1);

  lock.try_lock(c(4), t(1), Write, 500, &helper).unwrap();
  let timer_id = lock.get(c(4), t(1)).unwrap().timer_id().unwrap();
  lock.unlock(c(1), t(1), &helper);
  assert_eq!(awarded(&rx), vec![(c(4), t(1))]);
  assert_eq!(lock.get(c(4), t(1)).unwrap().timer_id(), None);
  lock.timer_timeout(c(4), t(1), timer_id, &helper);
  assert_eq!(lock.holders_count(), 1);
  assert!(drain(&rx).is_empty());
  assert_eq!(helper.metrics.lock_refuse_count(), 2);
}

#[test]
fn test_zero_timeout_try_lock_respects_queue() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Read, &helper).unwrap();
  lock.lock(c(2), t(1), Write, &helper).unwrap();
  drain(&rx);
  // Compatible with the holder, but would jump the queued WRITE.
  lock.try_lock(c(3), t(1), Read, 0, &helper).unwrap();
  assert!(matches!(drain(&rx)[..], [LockResponse::Refused { .. }]));
}

#[test]
fn test_interrupt() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.wait(c(1), t(1), -1, &helper).unwrap();
  drain(&rx);

  lock.interrupt(c(1), t(1), &helper);
  assert_eq!(awarded(&rx), vec![(c(1), t(1))]);
  // Not waiting any more.
  lock.interrupt(c(1), t(1), &helper);
  assert_eq!(lock.holders_count(), 1);
}

#[test]
fn test_query() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.wait(c(1), t(1), 30, &helper).unwrap();
  lock.lock(c(2), t(1), Write, &helper).unwrap();
  lock.lock(c(3), t(1), Read, &helper).unwrap();
  drain(&rx);

  lock.query(c(4), t(1), &helper);
  let LockResponse::Query {
    client,
    holder_level,
    holders_and_waiters,
    pending_count,
    ..
  } = drain(&rx).remove(0)
  else {
    panic!("expected query response");
  };
  assert_eq!(client, c(4));
  assert_eq!(holder_level, Some(Write));
  assert_eq!(pending_count, 1);
  assert_eq!(holders_and_waiters, vec![
    ClientLockContext {
      client: c(2),
      thread: t(1),
      state: ClientLockState::Holder(Write),
    },
    ClientLockContext {
      client: c(1),
      thread: t(1),
      state: ClientLockState::Waiter { timeout_ms: 30 },
    },
  ]);
}

#[test]
fn test_reestablish() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.reestablish(
    ClientLockContext {
      client: c(1),
      thread: t(1),
      state: ClientLockState::Holder(Read),
    },
    &helper,
  );
  lock.reestablish(
    ClientLockContext {
      client: c(2),
      thread: t(1),
      state: ClientLockState::Holder(Read),
    },
    &helper,
  );
  lock.reestablish(
    ClientLockContext {
      client: c(3),
      thread: t(1),
      state: ClientLockState::Waiter { timeout_ms: 10 },
    },
    &helper,
  );
  assert_eq!(lock.holders_count(), 2);
  assert_eq!(lock.waiters_count(), 1);
  assert!(lock.get(c(3), t(1)).unwrap().timer_id().is_some());
  // Reestablished state is not announced.
  assert!(drain(&rx).is_empty());
}

#[test]
#[should_panic]
fn test_reestablish_conflicting_holder_panics() {
  let (helper, _rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.reestablish(
    ClientLockContext {
      client: c(1),
      thread: t(1),
      state: ClientLockState::Holder(Read),
    },
    &helper,
  );
  lock.reestablish(
    ClientLockContext {
      client: c(2),
      thread: t(1),
      state: ClientLockState::Holder(Write),
    },
    &helper,
  );
}

#[test]
fn test_clear_state_for_client() {
  let (helper, rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  lock.lock(c(1), t(2), Write, &helper).unwrap();
  lock.lock(c(2), t(1), Read, &helper).unwrap();
  lock.lock(c(2), t(2), Read, &helper).unwrap();
  drain(&rx);

  assert!(!lock.clear_state_for_client(c(1), &helper));
  assert_eq!(awarded(&rx), vec![(c(2), t(1)), (c(2), t(2))]);
  assert!(lock.iter().all(|ctx| ctx.client() == c(2)));

  assert!(!lock.clear_state_for_client(c(9), &helper));
  assert!(lock.clear_state_for_client(c(2), &helper));
}

#[test]
fn test_greedy_award_goes_to_client() {
  let (helper, rx) = test_helper(LockPolicy::Greedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  assert_eq!(awarded(&rx), vec![(c(1), ThreadId::VM)]);
  assert_eq!(
    lock.first().unwrap().state(),
    ContextState::GreedyHolder(Write)
  );

  // Covered by the lease.
  lock.lock(c(1), t(2), Write, &helper).unwrap();
  lock.unlock(c(1), t(1), &helper);
  assert_eq!(lock.holders_count(), 1);
  assert_eq!(lock.pending_count(), 0);
  assert_eq!(helper.metrics.greedy_award_count(), 1);
}

#[test]
#[traced_test]
fn test_greedy_recall_and_commit() {
  let (helper, rx) = test_helper(LockPolicy::Greedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  drain(&rx);

  lock.lock(c(2), t(1), Write, &helper).unwrap();
  assert_eq!(drain(&rx), vec![LockResponse::Recall {
    lock_id: LockId::str("a"),
    client: c(1),
    thread: ThreadId::VM,
    level: Write,
  }]);
  assert!(lock.is_recall_in_progress());
  lock.lock(c(3), t(1), Read, &helper).unwrap();
  assert!(drain(&rx).is_empty());
  assert_eq!(helper.metrics.recall_count(), 1);

  lock.recall_commit(
    c(1),
    vec![
      ClientLockContext {
        client: c(1),
        thread: t(5),
        state: ClientLockState::Holder(Write),
      },
      ClientLockContext {
        client: c(1),
        thread: t(6),
        state: ClientLockState::Pending(Write),
      },
    ],
    &helper,
  );
  assert!(!lock.is_recall_in_progress());
  assert_eq!(lock.first().unwrap().thread(), t(5));
  assert_eq!(pending_requesters(&lock), vec![
    (c(2), t(1)),
    (c(3), t(1)),
    (c(1), t(6))
  ]);

  // Others are still queued, so this is a plain award.
  lock.unlock(c(1), t(5), &helper);
  assert_eq!(awarded(&rx), vec![(c(2), t(1))]);
  assert_eq!(lock.first().unwrap().state(), ContextState::Holder(Write));
}

#[test]
fn test_greedy_read_lease_per_client() {
  let (helper, rx) = test_helper(LockPolicy::Greedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.reestablish(
    ClientLockContext {
      client: c(9),
      thread: t(1),
      state: ClientLockState::Holder(Write),
    },
    &helper,
  );
  lock.lock(c(1), t(1), Read, &helper).unwrap();
  lock.lock(c(1), t(2), Read, &helper).unwrap();
  lock.lock(c(2), t(1), Read, &helper).unwrap();
  assert!(drain(&rx).is_empty());

  lock.unlock(c(9), t(1), &helper);
  let mut got = awarded(&rx);
  got.sort();
  assert_eq!(got, vec![(c(1), ThreadId::VM), (c(2), ThreadId::VM)]);
  assert_eq!(lock.holders_count(), 2);
  assert!(lock.iter().all(|ctx| ctx.state().is_greedy_holder()));
}

#[test]
fn test_no_greedy_award_with_waiters() {
  let (helper, rx) = test_helper(LockPolicy::Greedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  lock.reestablish(
    ClientLockContext {
      client: c(2),
      thread: t(1),
      state: ClientLockState::Waiter { timeout_ms: -1 },
    },
    &helper,
  );
  lock.lock(c(1), t(1), Write, &helper).unwrap();
  assert_eq!(awarded(&rx), vec![(c(1), t(1))]);
  assert_eq!(lock.first().unwrap().state(), ContextState::Holder(Write));
}

#[test]
fn test_random_read_only_holders_match_outstanding() {
  let (helper, _rx) = test_helper(LockPolicy::NonGreedy);
  let mut lock = ServerLock::new(LockId::str("a"));
  let mut held = vec![false; 20];
  let mut rng = thread_rng();
  for _ in 0..2000 {
    let n = rng.gen_range(0..held.len());
    let (client, thread) = (c(n as u64 % 4), t(n as u64));
    if held[n] {
      lock.unlock(client, thread, &helper);
    } else {
      lock.lock(client, thread, Read, &helper).unwrap();
    };
    held[n] = !held[n];
    assert_eq!(lock.holders_count(), held.iter().filter(|h| **h).count());
    assert_eq!(lock.pending_count(), 0);
  }
}
