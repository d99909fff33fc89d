use clap::Parser;
use dashmap::DashMap;
use libdso::id::BatchId;
use libdso::id::ClientId;
use libdso::id::LockId;
use libdso::id::ObjectId;
use libdso::id::ThreadId;
use libdso::lock::notified_waiters::NotifiedWaiters;
use libdso::lock::LockResponse;
use libdso::lock::NotifyAction;
use libdso::lock::ServerLockLevel;
use libdso::txn::message::MemoryMessageFactory;
use libdso::txn::reader::TransactionBatchReader;
use libdso::txn::writer::TransactionBatchWriter;
use libdso::txn::ClientTransaction;
use libdso::txn::FieldValue;
use libdso::txn::SequenceGenerator;
use libdso::txn::TransactionIdGenerator;
use libdso::txn::TxnType;
use libdso::FoldingCfg;
use libdso::LockManager;
use libdso::LockManagerCfg;
use libdso::LockPolicy;
use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use stochastic_queue::stochastic_channel;
use stochastic_queue::StochasticMpmcRecvError;
use strum_macros::Display;
use tokio::fs::read_to_string;
use tokio::spawn;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::spawn_blocking;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing::info;
use tracing::trace;

/*

# Stochastic stress tester

Run this program with this env var for logging: RUST_LOG=<log level>,runtime=info,tokio=info
Use [tokio-console](https://github.com/tokio-rs/console#running-the-console) with the `instrumentation` feature to debug stuck tasks.

Many simulated client threads pick random lock tasks off one queue and run them against a single LockManager. Each lock has a shadow counter that is -1 while someone holds it for WRITE and the number of readers otherwise, so any award that breaks mutual exclusion trips an assertion straight away. Every WRITE critical section also records a transaction in its client's batch writer; a background flusher sends, reads back and acknowledges the batches, checking that nothing folded gets lost and that sequences only go up.

*/

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
  /// Path to the YAML configuration file.
  #[arg(long)]
  config: PathBuf,
}

#[derive(Deserialize)]
struct Config {
  /// Tasks to run in total.
  tasks: u64,

  /// Defaults to 4.
  clients: Option<u64>,

  /// Defaults to 8.
  threads_per_client: Option<u64>,

  /// Fewer locks means more contention. Defaults to 16.
  locks: Option<u64>,

  /// Defaults to true.
  folding: Option<bool>,

  /// Defaults to unlimited.
  fold_object_limit: Option<usize>,

  /// Defaults to unlimited.
  fold_lock_limit: Option<usize>,

  /// How often to send every client's batch. Defaults to 50 ms.
  flush_interval_ms: Option<u64>,
}

#[derive(Display)]
enum Task {
  Exclusive {
    lock_no: u64,
    objects: u64,
    wait_ms: Option<i64>,
    notify: bool,
  },
  Shared {
    lock_no: u64,
  },
  TryExclusive {
    lock_no: u64,
    timeout_ms: i64,
  },
}

#[derive(Default)]
struct TaskProgress {
  exclusive: AtomicU64,
  shared: AtomicU64,
  waited: AtomicU64,
  try_awarded: AtomicU64,
  try_refused: AtomicU64,
}

fn lock_id(lock_no: u64) -> LockId {
  LockId::str(format!("lock-{lock_no}"))
}

struct ClientState {
  factory: MemoryMessageFactory,
  sequences: SequenceGenerator,
  ids: TransactionIdGenerator,
  last_sequence: AtomicU64,
}

struct Ctx {
  mgr: LockManager,
  folding: FoldingCfg,
  // -1 while held for WRITE, otherwise the number of READ holders.
  lock_states: Vec<AtomicI64>,
  clients: Vec<ClientState>,
  writers: DashMap<ClientId, TransactionBatchWriter>,
  next_batch_id: AtomicU64,
  txns_added: AtomicU64,
  txns_applied: AtomicU64,
}

impl Ctx {
  fn new_writer(&self, client: ClientId) -> TransactionBatchWriter {
    TransactionBatchWriter::new(
      BatchId(self.next_batch_id.fetch_add(1, Ordering::Relaxed)),
      self.folding.clone(),
      self.mgr.metrics().clone(),
      Arc::new(self.clients[client.0 as usize].factory.clone()),
    )
  }

  fn enter_exclusive(&self, lock_no: u64) {
    let res = self.lock_states[lock_no as usize].compare_exchange(
      0,
      -1,
      Ordering::SeqCst,
      Ordering::SeqCst,
    );
    assert_eq!(res, Ok(0), "lock {lock_no} awarded for WRITE while held");
  }

  fn exit_exclusive(&self, lock_no: u64) {
    assert_eq!(
      self.lock_states[lock_no as usize].swap(0, Ordering::SeqCst),
      -1
    );
  }

  fn enter_shared(&self, lock_no: u64) {
    let prev = self.lock_states[lock_no as usize].fetch_add(1, Ordering::SeqCst);
    assert!(prev >= 0, "lock {lock_no} awarded for READ while held for WRITE");
  }

  fn exit_shared(&self, lock_no: u64) {
    let prev = self.lock_states[lock_no as usize].fetch_sub(1, Ordering::SeqCst);
    assert!(prev > 0);
  }

  fn record_transaction(&self, client: ClientId, lock_no: u64, objects: u64) {
    let mut txn = ClientTransaction::new(lock_id(lock_no), TxnType::Normal);
    for k in 0..objects {
      txn.field_changed(
        ObjectId(lock_no * 1000 + k),
        "counter",
        FieldValue::Int(k as i64),
      );
    }
    let state = &self.clients[client.0 as usize];
    let writer = self.writers.get(&client).expect("writer for client");
    writer.add_transaction(txn, &state.sequences, &state.ids);
    self.txns_added.fetch_add(1, Ordering::Relaxed);
  }

  /// Swaps in a fresh writer for every client, then sends, reads back and acknowledges everything the old one held.
  fn flush(&self) {
    for (c, state) in self.clients.iter().enumerate() {
      let client = ClientId(c as u64);
      let Some(old) = self.writers.insert(client, self.new_writer(client)) else {
        continue;
      };
      if old.is_empty() {
        continue;
      };
      old.send().expect("send batch");
      for sent in state.factory.take_sent() {
        let mut reader = TransactionBatchReader::new(&sent.data, client).expect("read back batch");
        assert_eq!(reader.batch_id(), old.batch_id());
        while let Some(txn) = reader.next_transaction() {
          let seq = txn.sequence_id().0;
          let last = state.last_sequence.swap(seq, Ordering::Relaxed);
          assert!(seq > last, "sequence went from {last} to {seq}");
          self
            .txns_applied
            .fetch_add(u64::from(txn.num_application_txn()), Ordering::Relaxed);
          old.remove_transaction(txn.transaction_id());
        }
      }
      assert!(old.is_empty());
      assert!(old.min_transaction_sequence().is_null());
    }
  }
}

struct Requester {
  client: ClientId,
  thread: ThreadId,
  responses: UnboundedReceiver<LockResponse>,
}

impl Requester {
  async fn next_response(&mut self) -> LockResponse {
    self.responses.recv().await.expect("response route closed")
  }

  // A timed out wait is told about the timeout first, then gets the lock back like any other request.
  async fn await_award(&mut self) {
    loop {
      match self.next_response().await {
        LockResponse::Award { .. } => return,
        LockResponse::WaitTimeout { .. } => continue,
        resp => panic!("unexpected lock response {resp:?}"),
      };
    }
  }
}

async fn run_task(ctx: &Ctx, r: &mut Requester, progress: &TaskProgress, t: Task) {
  match t {
    Task::Exclusive {
      lock_no,
      objects,
      wait_ms,
      notify,
    } => {
      let lock_id = lock_id(lock_no);
      ctx
        .mgr
        .lock(lock_id.clone(), r.client, r.thread, ServerLockLevel::Write)
        .unwrap();
      r.await_award().await;
      ctx.enter_exclusive(lock_no);
      ctx.record_transaction(r.client, lock_no, objects);
      if let Some(wait_ms) = wait_ms {
        ctx.exit_exclusive(lock_no);
        ctx
          .mgr
          .wait(&lock_id, r.client, r.thread, wait_ms)
          .unwrap();
        r.await_award().await;
        ctx.enter_exclusive(lock_no);
        progress.waited.fetch_add(1, Ordering::Relaxed);
      };
      if notify {
        let mut notified = NotifiedWaiters::new();
        ctx
          .mgr
          .notify(&lock_id, r.client, r.thread, NotifyAction::All, &mut notified)
          .unwrap();
        trace!(lock_no, notified = notified.len(), "notified waiters");
      };
      ctx.exit_exclusive(lock_no);
      ctx.mgr.unlock(lock_id, r.client, r.thread).unwrap();
      progress.exclusive.fetch_add(1, Ordering::Relaxed);
    }
    Task::Shared { lock_no } => {
      let lock_id = lock_id(lock_no);
      ctx
        .mgr
        .lock(lock_id.clone(), r.client, r.thread, ServerLockLevel::Read)
        .unwrap();
      r.await_award().await;
      ctx.enter_shared(lock_no);
      sleep(Duration::from_millis(1)).await;
      ctx.exit_shared(lock_no);
      ctx.mgr.unlock(lock_id, r.client, r.thread).unwrap();
      progress.shared.fetch_add(1, Ordering::Relaxed);
    }
    Task::TryExclusive {
      lock_no,
      timeout_ms,
    } => {
      let lock_id = lock_id(lock_no);
      ctx
        .mgr
        .try_lock(
          lock_id.clone(),
          r.client,
          r.thread,
          ServerLockLevel::Write,
          timeout_ms,
        )
        .unwrap();
      match r.next_response().await {
        LockResponse::Award { .. } => {
          ctx.enter_exclusive(lock_no);
          ctx.record_transaction(r.client, lock_no, 1);
          ctx.exit_exclusive(lock_no);
          ctx.mgr.unlock(lock_id, r.client, r.thread).unwrap();
          progress.try_awarded.fetch_add(1, Ordering::Relaxed);
        }
        LockResponse::Refused { .. } => {
          progress.try_refused.fetch_add(1, Ordering::Relaxed);
        }
        resp => panic!("unexpected lock response {resp:?}"),
      };
    }
  };
}

#[tokio::main]
async fn main() {
  #[cfg(feature = "instrumentation")]
  console_subscriber::init();
  #[cfg(not(feature = "instrumentation"))]
  tracing_subscriber::fmt::init();

  let cli = Cli::parse();
  let cfg: Config = serde_yaml::from_str(
    &read_to_string(cli.config)
      .await
      .expect("read config file"),
  )
  .expect("parse config file");
  let task_count = cfg.tasks;
  let client_count = cfg.clients.unwrap_or(4);
  let threads_per_client = cfg.threads_per_client.unwrap_or(8);
  let lock_count = cfg.locks.unwrap_or(16);
  let flush_interval = Duration::from_millis(cfg.flush_interval_ms.unwrap_or(50));
  let folding = FoldingCfg {
    enabled: cfg.folding.unwrap_or(true),
    object_limit: cfg.fold_object_limit.unwrap_or(0),
    lock_limit: cfg.fold_lock_limit.unwrap_or(0),
  };

  let (responses_sender, responses_receiver) = crossbeam_channel::unbounded();
  let mgr = LockManager::new(
    LockManagerCfg {
      policy: LockPolicy::NonGreedy,
    },
    responses_sender,
  );
  mgr.start();

  let ctx = Arc::new(Ctx {
    mgr: mgr.clone(),
    folding,
    lock_states: (0..lock_count).map(|_| AtomicI64::new(0)).collect(),
    clients: (0..client_count)
      .map(|_| ClientState {
        factory: MemoryMessageFactory::new(),
        sequences: SequenceGenerator::new(),
        ids: TransactionIdGenerator::new(),
        last_sequence: AtomicU64::new(0),
      })
      .collect(),
    writers: DashMap::new(),
    next_batch_id: AtomicU64::new(1),
    txns_added: AtomicU64::new(0),
    txns_applied: AtomicU64::new(0),
  });
  for c in 0..client_count {
    let client = ClientId(c);
    ctx.writers.insert(client, ctx.new_writer(client));
  }

  // Lock responses come from whichever thread made the change, so route each one to the task waiting for it.
  let routes = Arc::new(DashMap::<(ClientId, ThreadId), UnboundedSender<LockResponse>>::new());
  thread::spawn({
    let routes = routes.clone();
    move || {
      for resp in responses_receiver {
        let requester = resp.requester();
        match routes.get(&requester) {
          Some(route) => {
            let _ = route.send(resp);
          }
          None => trace!(client = %requester.0, thread = %requester.1, "no route for lock response"),
        };
      }
    }
  });

  let started = Instant::now();
  let progress = Arc::new(TaskProgress::default());
  let completed = Arc::new(AtomicU64::new(0));
  let complete = Arc::new(AtomicBool::new(false));

  let (tasks_sender, tasks_receiver) = stochastic_channel::<Task>();
  spawn_blocking({
    let tasks_sender = tasks_sender.clone();
    move || {
      let mut rng = thread_rng();
      for _ in 0..task_count {
        let lock_no = rng.gen_range(0..lock_count);
        let task = match rng.gen_range(0..10) {
          0..=4 => Task::Exclusive {
            lock_no,
            objects: rng.gen_range(1..=4),
            wait_ms: rng.gen_bool(0.1).then(|| rng.gen_range(0..20)),
            notify: rng.gen_bool(0.3),
          },
          5..=7 => Task::Shared { lock_no },
          _ => Task::TryExclusive {
            lock_no,
            timeout_ms: rng.gen_range(0..20),
          },
        };
        tasks_sender.send(task).unwrap();
      }
      info!(task_count, "sender complete");
    }
  })
  .await
  .unwrap();

  // Background loop to regularly print out progress.
  spawn({
    let complete = complete.clone();
    let progress = progress.clone();
    let mgr = mgr.clone();
    async move {
      while !complete.load(Ordering::Relaxed) {
        sleep(Duration::from_secs(10)).await;
        info!(
          exclusive = progress.exclusive.load(Ordering::Relaxed),
          shared = progress.shared.load(Ordering::Relaxed),
          waited = progress.waited.load(Ordering::Relaxed),
          try_awarded = progress.try_awarded.load(Ordering::Relaxed),
          try_refused = progress.try_refused.load(Ordering::Relaxed),
          live_locks = mgr.lock_count(),
          "progress"
        );
      }
    }
  });

  let flusher = spawn({
    let complete = complete.clone();
    let ctx = ctx.clone();
    async move {
      while !complete.load(Ordering::Relaxed) {
        sleep(flush_interval).await;
        ctx.flush();
      }
    }
  });

  let mut workers = Vec::new();
  for c in 0..client_count {
    for t in 0..threads_per_client {
      let (route_sender, route_receiver) = unbounded_channel();
      let mut requester = Requester {
        client: ClientId(c),
        thread: ThreadId(t),
        responses: route_receiver,
      };
      routes.insert((requester.client, requester.thread), route_sender);
      let ctx = ctx.clone();
      let progress = progress.clone();
      let completed = completed.clone();
      let complete = complete.clone();
      let tasks_receiver = tasks_receiver.clone();
      workers.push(spawn(async move {
        while !complete.load(Ordering::Relaxed) {
          // WARNING: We cannot use `recv_timeout` as it's blocking.
          let t = match tasks_receiver.try_recv() {
            Ok(Some(t)) => t,
            Err(StochasticMpmcRecvError::NoSenders) => break,
            Ok(None) => {
              sleep(Duration::from_millis(10)).await;
              continue;
            }
          };
          trace!(client = %requester.client, thread = %requester.thread, task_type = t.to_string(), "received task");
          run_task(&ctx, &mut requester, &progress, t).await;
          if completed.fetch_add(1, Ordering::Relaxed) + 1 == task_count {
            complete.store(true, Ordering::Relaxed);
          };
        }
      }));
    }
  }
  drop(tasks_sender);
  drop(tasks_receiver);
  for t in workers {
    t.await.unwrap();
  }
  complete.store(true, Ordering::Relaxed);
  flusher.await.unwrap();
  ctx.flush();

  assert!(ctx.lock_states.iter().all(|s| s.load(Ordering::SeqCst) == 0));
  assert_eq!(mgr.lock_count(), 0);
  let txns_added = ctx.txns_added.load(Ordering::Relaxed);
  assert_eq!(ctx.txns_applied.load(Ordering::Relaxed), txns_added);

  for (key, value) in mgr.metrics().all() {
    info!(key, value, "final metric");
  }

  let exec_sec = started.elapsed().as_secs_f64();
  let metrics = mgr.metrics();
  info!(
    execution_seconds = exec_sec,
    txns_added,
    txns_sent = txns_added - metrics.txn_folded_count(),
    tasks_per_sec = (task_count as f64) / exec_sec,
    "all done"
  );
}
