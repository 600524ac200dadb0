//! Primitive block test suite: endpoint close semantics, batching, fault
//! injection, and buffer accounting.

use crate::block::{ActionBlock, BatchBlock, BlockOptions, TransformBlock};
use crate::error::FlowError;
use std::sync::{Arc, Mutex};

fn batch_collector(batches: Arc<Mutex<Vec<Vec<i32>>>>) -> ActionBlock<Vec<i32>> {
  ActionBlock::new("batches", BlockOptions::default(), 1, move |batch| {
    let batches = batches.clone();
    async move {
      batches.lock().unwrap().push(batch);
      Ok(())
    }
  })
}

#[tokio::test]
async fn action_block_processes_then_completes_on_close() {
  let items = Arc::new(Mutex::new(Vec::new()));
  let sink = items.clone();
  let block = ActionBlock::new("sum", BlockOptions::default(), 1, move |value: i32| {
    let sink = sink.clone();
    async move {
      sink.lock().unwrap().push(value);
      Ok(())
    }
  });

  for value in [1, 2, 3] {
    block.input().send(value).await.unwrap();
  }
  block.input().complete();
  block.handle().completion().await.unwrap();
  assert_eq!(*items.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn send_after_complete_is_rejected() {
  let block = ActionBlock::<i32>::new("closed", BlockOptions::default(), 1, |_| async { Ok(()) });
  block.input().complete();
  let err = block.input().send(1).await.unwrap_err();
  assert!(matches!(err, FlowError::EndpointClosed { .. }));
  assert!(block.input().is_completed());
}

#[tokio::test]
async fn fault_injection_resolves_completion_with_injected_error() {
  let block = ActionBlock::<i32>::new("faulted", BlockOptions::default(), 1, |_| async { Ok(()) });
  block.handle().fault(Arc::new(FlowError::SiblingFailed {
    origin: "test".to_string(),
  }));
  let err = block.handle().completion().await.unwrap_err();
  assert!(matches!(err.as_ref(), FlowError::SiblingFailed { .. }));
}

#[tokio::test]
async fn transform_block_maps_items_in_order() {
  let block =
    TransformBlock::new("double", BlockOptions::default(), |value: i32| async move {
      Ok(value * 2)
    });
  let mut rx = block.output().take_receiver().expect("receiver unclaimed");

  for value in [1, 2, 3] {
    block.input().send(value).await.unwrap();
  }
  block.input().complete();

  let mut seen = Vec::new();
  while let Some(value) = rx.recv().await {
    seen.push(value);
  }
  assert_eq!(seen, vec![2, 4, 6]);
  block.handle().completion().await.unwrap();
}

#[tokio::test]
async fn batch_block_emits_full_batches_and_remainder() {
  let batches = Arc::new(Mutex::new(Vec::new()));
  let downstream = batch_collector(batches.clone());
  let batcher = BatchBlock::new(
    "batcher",
    BlockOptions::default(),
    3,
    downstream.input().clone(),
  );

  for value in 1..=7 {
    batcher.input().send(value).await.unwrap();
  }
  batcher.input().complete();

  batcher.handle().completion().await.unwrap();
  downstream.handle().completion().await.unwrap();
  assert_eq!(
    *batches.lock().unwrap(),
    vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]
  );
}

#[tokio::test]
async fn batch_trigger_flushes_partial_batch() {
  let batches = Arc::new(Mutex::new(Vec::new()));
  let downstream = batch_collector(batches.clone());
  let batcher = BatchBlock::new(
    "batcher",
    BlockOptions::default(),
    10,
    downstream.input().clone(),
  );

  batcher.input().send(1).await.unwrap();
  batcher.input().send(2).await.unwrap();
  // Give the worker time to pull both items before flushing.
  tokio::time::sleep(std::time::Duration::from_millis(50)).await;
  batcher.trigger();
  tokio::time::sleep(std::time::Duration::from_millis(50)).await;
  assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2]]);

  batcher.input().complete();
  batcher.handle().completion().await.unwrap();
  downstream.handle().completion().await.unwrap();
  assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2]]);
}

#[tokio::test]
async fn batch_trigger_before_any_item_emits_nothing() {
  let batches = Arc::new(Mutex::new(Vec::new()));
  let downstream = batch_collector(batches.clone());
  let batcher = BatchBlock::new(
    "batcher",
    BlockOptions::default(),
    4,
    downstream.input().clone(),
  );

  batcher.trigger();
  batcher.trigger();
  tokio::time::sleep(std::time::Duration::from_millis(50)).await;

  batcher.input().complete();
  batcher.handle().completion().await.unwrap();
  downstream.handle().completion().await.unwrap();
  assert!(batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn action_error_fails_the_block() {
  let block = ActionBlock::new("strict", BlockOptions::default(), 1, |value: i32| async move {
    if value < 0 {
      Err(FlowError::InvalidData {
        flow: "strict".to_string(),
      })
    } else {
      Ok(())
    }
  });

  block.input().send(1).await.unwrap();
  block.input().send(-1).await.unwrap();
  let err = block.handle().completion().await.unwrap_err();
  assert!(matches!(err.as_ref(), FlowError::InvalidData { .. }));
}

#[tokio::test]
async fn buffer_counters_track_queue_depth() {
  let gate = Arc::new(tokio::sync::Semaphore::new(0));
  let release = gate.clone();
  let block = ActionBlock::new("gated", BlockOptions::default(), 1, move |_: i32| {
    let gate = gate.clone();
    async move {
      gate.acquire().await.expect("gate closed").forget();
      Ok(())
    }
  });

  for value in 0..5 {
    block.input().send(value).await.unwrap();
  }
  tokio::time::sleep(std::time::Duration::from_millis(50)).await;
  let (queued_in, queued_out) = block.handle().buffer_status();
  assert_eq!(queued_out, 0);
  assert!(queued_in >= 4, "expected at least 4 queued, saw {queued_in}");

  release.add_permits(5);
  block.input().complete();
  block.handle().completion().await.unwrap();
  assert_eq!(block.handle().buffer_status(), (0, 0));
}
