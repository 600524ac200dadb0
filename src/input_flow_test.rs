//! Typed-input node test suite: iterator drivers, cancellation checks, and
//! completion signalling.

use crate::error::FlowError;
use crate::flow::FlowGraph;
use crate::input_flow::{FlowInput, InputFlow};
use crate::options::FlowOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn quick_options() -> FlowOptions {
  FlowOptions::default()
    .with_flow_monitor(false)
    .with_monitor_interval(Duration::from_millis(50))
}

fn collector(items: Arc<Mutex<Vec<i32>>>) -> InputFlow<i32> {
  InputFlow::from_action(quick_options(), move |value| {
    let items = items.clone();
    async move {
      items.lock().unwrap().push(value);
      Ok(())
    }
  })
}

#[tokio::test]
async fn process_returns_the_published_count() {
  let items = Arc::new(Mutex::new(Vec::new()));
  let node = collector(items.clone());

  let count = node.process(0..10, true).await.unwrap();
  assert_eq!(count, 10);
  assert_eq!(*items.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn pull_from_counts_and_respects_backpressure() {
  let items = Arc::new(Mutex::new(Vec::new()));
  let node = collector(items.clone());

  let token = CancellationToken::new();
  let count = node.pull_from(vec![5, 6, 7], &token).await.unwrap();
  assert_eq!(count, 3);

  node.signal_and_wait().await.unwrap();
  assert_eq!(*items.lock().unwrap(), vec![5, 6, 7]);
}

#[tokio::test]
async fn pull_from_stops_at_the_first_cancellation_check() {
  let items = Arc::new(Mutex::new(Vec::new()));
  let node = collector(items);

  let token = CancellationToken::new();
  token.cancel();
  let err = node.pull_from(vec![1, 2, 3], &token).await.unwrap_err();
  match err {
    FlowError::PullInterrupted { published, inner, .. } => {
      assert_eq!(published, 0);
      assert!(matches!(inner.as_ref(), FlowError::Canceled));
    }
    other => panic!("unexpected error: {other}"),
  }
}

#[tokio::test]
async fn process_multiple_sums_counts_and_signals_once() {
  let items = Arc::new(Mutex::new(Vec::new()));
  let node = collector(items.clone());

  let total = node
    .process_multiple(vec![vec![1, 2], vec![3], vec![4, 5, 6]], true)
    .await
    .unwrap();
  assert_eq!(total, 6);
  assert_eq!(*items.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn complete_closes_the_entry_point() {
  let items = Arc::new(Mutex::new(Vec::new()));
  let node = collector(items.clone());

  node.input_endpoint().send(9).await.unwrap();
  node.complete();
  node.completion().await.unwrap();
  assert_eq!(*items.lock().unwrap(), vec![9]);

  let err = node.input_endpoint().send(1).await.unwrap_err();
  assert!(matches!(err, FlowError::EndpointClosed { .. }));
}

#[tokio::test]
async fn action_failure_surfaces_through_process() {
  let node = InputFlow::from_action(quick_options(), |value: i32| async move {
    if value == 3 {
      Err(FlowError::InvalidData {
        flow: "strict".to_string(),
      })
    } else {
      Ok(())
    }
  });

  node.process(1..=5, true).await.expect_err("graph fails");
  // Whichever way the publication raced the worker failure, the completion
  // future carries the original error.
  let err = node.completion().await.unwrap_err();
  assert!(matches!(err.innermost(), FlowError::InvalidData { .. }));
}
