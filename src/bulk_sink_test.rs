//! Bulk sink test suite: batch sizing, flush timer, transactional rollback,
//! post-insert hook, and trigger semantics, exercised against an in-memory
//! store.

use crate::bulk_sink::{BulkSinkConfig, BulkStore, DbBulkSink, PostInsertHook, TargetTable};
use crate::error::FlowError;
use crate::flow::FlowGraph;
use crate::input_flow::FlowInput;
use crate::options::FlowOptions;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn quick_options() -> FlowOptions {
  FlowOptions::default()
    .with_flow_monitor(false)
    .with_monitor_interval(Duration::from_millis(50))
}

fn target() -> TargetTable {
  TargetTable::new("memory://test", "events").with_mapping("event-row")
}

/// Store-side failure injected by the mock.
#[derive(Debug)]
struct StoreFailure(&'static str);

impl std::fmt::Display for StoreFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "store failure: {}", self.0)
  }
}

impl std::error::Error for StoreFailure {}

/// Connection of the in-memory store: rows staged inside the transaction.
struct MemoryConn {
  staged: Vec<i64>,
}

/// In-memory [`BulkStore`] recording commits and rollbacks. A batch
/// containing `fail_on` fails its write.
struct MemoryStore {
  committed: Arc<Mutex<Vec<Vec<i64>>>>,
  rollbacks: Arc<AtomicUsize>,
  gate: Option<Arc<tokio::sync::Semaphore>>,
  fail_on: Option<i64>,
}

impl MemoryStore {
  fn new() -> Self {
    Self {
      committed: Arc::new(Mutex::new(Vec::new())),
      rollbacks: Arc::new(AtomicUsize::new(0)),
      gate: None,
      fail_on: None,
    }
  }

  fn failing_on(value: i64) -> Self {
    Self {
      fail_on: Some(value),
      ..Self::new()
    }
  }

  fn gated(gate: Arc<tokio::sync::Semaphore>) -> Self {
    Self {
      gate: Some(gate),
      ..Self::new()
    }
  }
}

#[async_trait]
impl BulkStore<i64> for MemoryStore {
  type Conn = MemoryConn;
  type Error = StoreFailure;

  async fn open(&self, _table: &TargetTable) -> Result<MemoryConn, StoreFailure> {
    Ok(MemoryConn { staged: Vec::new() })
  }

  async fn write(
    &self,
    conn: &mut MemoryConn,
    _table: &TargetTable,
    rows: &[i64],
  ) -> Result<(), StoreFailure> {
    if let Some(gate) = &self.gate {
      gate.acquire().await.expect("gate closed").forget();
    }
    if let Some(poison) = self.fail_on {
      if rows.contains(&poison) {
        return Err(StoreFailure("injected write failure"));
      }
    }
    conn.staged = rows.to_vec();
    Ok(())
  }

  async fn commit(&self, conn: &mut MemoryConn) -> Result<(), StoreFailure> {
    self
      .committed
      .lock()
      .unwrap()
      .push(std::mem::take(&mut conn.staged));
    Ok(())
  }

  async fn rollback(&self, conn: &mut MemoryConn) -> Result<(), StoreFailure> {
    self.rollbacks.fetch_add(1, Ordering::SeqCst);
    conn.staged.clear();
    Ok(())
  }
}

#[tokio::test]
async fn full_batches_write_immediately_and_the_timer_flushes_the_rest() {
  let store = MemoryStore::new();
  let committed = store.committed.clone();
  let sink = DbBulkSink::new(
    target(),
    store,
    quick_options(),
    BulkSinkConfig::default()
      .with_bulk_size(3)
      .with_flush_interval(Duration::from_millis(150))
      .with_name("timer-sink"),
  );

  sink.process(vec![1, 2, 3, 4], false).await.unwrap();
  tokio::time::sleep(Duration::from_millis(450)).await;
  assert_eq!(*committed.lock().unwrap(), vec![vec![1, 2, 3], vec![4]]);

  sink.signal_and_wait().await.unwrap();
  assert_eq!(*committed.lock().unwrap(), vec![vec![1, 2, 3], vec![4]]);
}

#[tokio::test]
async fn remainder_is_flushed_on_completion() {
  let store = MemoryStore::new();
  let committed = store.committed.clone();
  let sink = DbBulkSink::new(
    target(),
    store,
    quick_options(),
    BulkSinkConfig::default()
      .with_bulk_size(100)
      .with_name("remainder-sink"),
  );

  let count = sink.process(vec![7, 8, 9], true).await.unwrap();
  assert_eq!(count, 3);
  assert_eq!(*committed.lock().unwrap(), vec![vec![7, 8, 9]]);
}

#[tokio::test]
async fn failing_batch_rolls_back_and_fails_the_sink_only_once() {
  let store = MemoryStore::failing_on(3);
  let committed = store.committed.clone();
  let rollbacks = store.rollbacks.clone();

  let hook_batches: Arc<Mutex<Vec<Vec<i64>>>> = Arc::new(Mutex::new(Vec::new()));
  let hook_record = hook_batches.clone();
  let hook: PostInsertHook<i64, MemoryConn> = Arc::new(move |_conn, _table, batch| {
    let hook_record = hook_record.clone();
    let batch = batch.to_vec();
    Box::pin(async move {
      hook_record.lock().unwrap().push(batch);
      Ok(())
    })
  });

  let sink = DbBulkSink::with_hook(
    target(),
    store,
    quick_options(),
    BulkSinkConfig::default()
      .with_bulk_size(2)
      .with_name("rollback-sink"),
    hook,
  );

  sink
    .process(vec![1, 2, 3, 4], true)
    .await
    .expect_err("sink fails on the poisoned batch");

  let err = sink.completion().await.unwrap_err();
  assert!(matches!(err.innermost(), FlowError::Store { .. }));

  // Only the poisoned batch rolled back; the first batch committed and its
  // hook fired.
  assert_eq!(*committed.lock().unwrap(), vec![vec![1, 2]]);
  assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
  assert_eq!(*hook_batches.lock().unwrap(), vec![vec![1, 2]]);
}

#[tokio::test]
async fn trigger_before_any_item_emits_nothing() {
  let store = MemoryStore::new();
  let committed = store.committed.clone();
  let rollbacks = store.rollbacks.clone();
  let sink = DbBulkSink::new(
    target(),
    store,
    quick_options(),
    BulkSinkConfig::default()
      .with_bulk_size(4)
      .with_name("trigger-sink"),
  );

  sink.trigger_batch();
  sink.trigger_batch();
  tokio::time::sleep(Duration::from_millis(50)).await;

  sink.process(Vec::<i64>::new(), true).await.unwrap();
  assert!(committed.lock().unwrap().is_empty());
  assert_eq!(rollbacks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn explicit_trigger_flushes_a_partial_batch() {
  let store = MemoryStore::new();
  let committed = store.committed.clone();
  let sink = DbBulkSink::new(
    target(),
    store,
    quick_options(),
    BulkSinkConfig::default()
      .with_bulk_size(100)
      .with_name("manual-sink"),
  );

  sink.process(vec![5, 6], false).await.unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;
  sink.trigger_batch();
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(*committed.lock().unwrap(), vec![vec![5, 6]]);

  sink.signal_and_wait().await.unwrap();
}

#[tokio::test]
async fn buffer_status_reports_row_level_pressure() {
  let gate = Arc::new(tokio::sync::Semaphore::new(0));
  let store = MemoryStore::gated(gate.clone());
  let committed = store.committed.clone();
  let sink = DbBulkSink::new(
    target(),
    store,
    quick_options().with_bounded_capacity(Some(4)),
    BulkSinkConfig::default()
      .with_bulk_size(4)
      .with_name("pressure-sink"),
  );

  sink.process(0..8, false).await.unwrap();
  tokio::time::sleep(Duration::from_millis(100)).await;

  // One array is in flight (not counted), the other is queued; pending
  // arrays count as bulk_size rows each.
  let (queued_in, queued_out) = sink.buffer_status();
  assert_eq!(queued_out, 0);
  assert!(
    queued_in == 4 || queued_in == 8,
    "expected row-level pressure, saw {queued_in}"
  );

  gate.add_permits(2);
  sink.signal_and_wait().await.unwrap();
  assert_eq!(sink.buffer_status(), (0, 0));
  assert_eq!(
    *committed.lock().unwrap(),
    vec![(0..4).collect::<Vec<i64>>(), (4..8).collect::<Vec<i64>>()]
  );
}
