//! Graph node test suite: registration rules, completion aggregation, fault
//! propagation, external dependencies, and post-completion tasks.

use crate::block::{ActionBlock, BlockOptions};
use crate::dependency::ChildOptions;
use crate::error::FlowError;
use crate::flow::{Flow, FlowGraph};
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

fn collector_block(items: Arc<Mutex<Vec<i32>>>) -> ActionBlock<i32> {
  ActionBlock::new("collector", BlockOptions::default(), 1, move |value| {
    let items = items.clone();
    async move {
      items.lock().unwrap().push(value);
      Ok(())
    }
  })
}

#[tokio::test]
async fn completion_without_children_fails_after_grace_period() {
  let flow = Flow::new(quick_options());
  let result = flow.completion().await;
  let err = result.expect_err("childless flow must fail");
  assert!(matches!(
    err.innermost(),
    FlowError::NoChildRegistered { .. }
  ));
}

#[tokio::test]
async fn child_registered_during_grace_period_rescues_completion() {
  let flow = Flow::new(quick_options());
  let completion = flow.completion();

  let items = Arc::new(Mutex::new(Vec::new()));
  let block = collector_block(items.clone());
  block.input().send(7).await.unwrap();
  block.input().complete();
  flow.register_block(block.handle()).unwrap();

  completion.await.expect("flow should complete");
  assert_eq!(*items.lock().unwrap(), vec![7]);
}

#[tokio::test]
async fn duplicate_child_is_rejected_unless_allowed() {
  let flow = Flow::new(quick_options());
  let block = ActionBlock::<i32>::new("dup", BlockOptions::default(), 1, |_| async { Ok(()) });

  flow.register_block(block.handle()).unwrap();
  let err = flow.register_block(block.handle()).unwrap_err();
  assert!(matches!(err, FlowError::DuplicateChild { .. }));

  flow
    .register_block_with(
      block.handle(),
      ChildOptions::default().with_allow_duplicate(true),
    )
    .expect("duplicate with allow_duplicate is silently accepted");
  assert_eq!(flow.children().len(), 1);
}

#[tokio::test]
async fn registering_a_descendant_as_child_fails_synchronously() {
  let outer = Flow::named("outer", quick_options());
  let middle = Flow::named("middle", quick_options());
  let inner = Flow::named("inner", quick_options());

  outer.register_child(&middle).unwrap();
  middle.register_child(&inner).unwrap();

  let err = inner.register_child(&outer).unwrap_err();
  assert!(matches!(err, FlowError::CycleNotAllowed { .. }));
  let err = middle.register_child(&middle).unwrap_err();
  assert!(matches!(err, FlowError::CycleNotAllowed { .. }));
}

#[tokio::test]
async fn full_name_renders_parent_chain() {
  let outer = Flow::named("outer", quick_options());
  let inner = Flow::named("inner", quick_options());
  outer.register_child(&inner).unwrap();

  assert_eq!(outer.full_name(), "[outer]");
  assert_eq!(inner.full_name(), "([outer])->[inner]");
}

#[tokio::test]
async fn default_names_are_unique_per_type() {
  let first = Flow::new(quick_options());
  let second = Flow::new(quick_options());
  assert_ne!(first.name(), second.name());
  assert!(first.name().starts_with("Flow"));
}

#[tokio::test]
async fn child_fault_propagates_normalised_to_siblings() {
  let flow = Flow::named("parent", quick_options());

  let failing = ActionBlock::<i32>::new("failing", BlockOptions::default(), 1, |value| async move {
    if value == 13 {
      Err(FlowError::InvalidData {
        flow: "failing".to_string(),
      })
    } else {
      Ok(())
    }
  });
  let sibling = ActionBlock::<i32>::new("sibling", BlockOptions::default(), 1, |_| async { Ok(()) });

  flow.register_block(failing.handle()).unwrap();
  flow.register_block(sibling.handle()).unwrap();

  failing.input().send(13).await.unwrap();

  let err = flow.completion().await.expect_err("parent must fail");
  assert!(matches!(err.innermost(), FlowError::InvalidData { .. }));

  let sibling_err = sibling
    .handle()
    .completion()
    .await
    .expect_err("sibling observes a fault");
  assert!(matches!(
    sibling_err.as_ref(),
    FlowError::SiblingFailed { origin } if origin == "parent"
  ));
}

#[tokio::test]
async fn completion_resolves_exactly_once_for_all_observers() {
  let items = Arc::new(Mutex::new(Vec::new()));
  let flow = Flow::new(quick_options());
  let block = collector_block(items);
  flow.register_block(block.handle()).unwrap();

  let first = flow.completion();
  let second = flow.completion();
  block.input().complete();

  first.await.unwrap();
  second.await.unwrap();
  assert!(flow.completion().is_resolved());
}

#[tokio::test]
async fn post_tasks_run_in_registration_order_after_children() {
  let order = Arc::new(Mutex::new(Vec::new()));
  let flow = Flow::new(quick_options());
  let block = ActionBlock::<i32>::new("noop", BlockOptions::default(), 1, |_| async { Ok(()) });
  flow.register_block(block.handle()).unwrap();

  for tag in [1, 2, 3] {
    let order = order.clone();
    flow.register_post_task(async move {
      order.lock().unwrap().push(tag);
      Ok(())
    });
  }

  block.input().complete();
  flow.completion().await.unwrap();
  assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn failing_post_task_fails_completion_and_trips_cancellation() {
  let flow = Flow::new(quick_options());
  let block = ActionBlock::<i32>::new("noop", BlockOptions::default(), 1, |_| async { Ok(()) });
  flow.register_block(block.handle()).unwrap();

  let token = CancellationToken::new();
  flow.register_cancellation_token(token.clone());
  flow.register_post_task(async {
    Err(FlowError::InvalidData {
      flow: "post".to_string(),
    })
  });

  block.input().complete();
  let err = flow.completion().await.expect_err("post task failure");
  assert!(matches!(err.innermost(), FlowError::InvalidData { .. }));
  assert!(token.is_cancelled());
}

#[tokio::test]
async fn child_completion_callback_receives_result() {
  let observed = Arc::new(Mutex::new(None));
  let flow = Flow::new(quick_options());
  let block = ActionBlock::<i32>::new("noop", BlockOptions::default(), 1, |_| async { Ok(()) });

  let seen = observed.clone();
  flow
    .register_block_with(
      block.handle(),
      ChildOptions::default().with_on_complete(move |result| {
        *seen.lock().unwrap() = Some(result.is_ok());
      }),
    )
    .unwrap();

  block.input().complete();
  flow.completion().await.unwrap();
  assert_eq!(*observed.lock().unwrap(), Some(true));
}

#[tokio::test]
async fn buffer_status_sums_children() {
  let flow = Flow::new(quick_options());
  let gate = Arc::new(tokio::sync::Semaphore::new(0));
  let release = gate.clone();
  let block = ActionBlock::<i32>::new("slow", BlockOptions::default(), 1, move |_| {
    let gate = gate.clone();
    async move {
      gate.acquire().await.expect("gate closed").forget();
      Ok(())
    }
  });
  flow.register_block(block.handle()).unwrap();

  for value in 0..4 {
    block.input().send(value).await.unwrap();
  }
  // The worker holds one item in flight; the rest stay queued.
  tokio::time::sleep(Duration::from_millis(50)).await;
  let (queued_in, queued_out) = flow.buffer_status();
  assert_eq!(queued_out, 0);
  assert!(queued_in >= 3, "expected at least 3 queued, saw {queued_in}");
  assert_eq!(flow.buffered_count(), queued_in);

  block.input().complete();
  release.add_permits(4);
  flow.completion().await.unwrap();
  assert_eq!(flow.buffered_count(), 0);
}

#[tokio::test]
async fn external_dependency_joint_success_completes_the_node() {
  let items = Arc::new(Mutex::new(Vec::new()));
  let node = Flow::named("a", quick_options());
  let child = collector_block(items.clone());
  node.register_block(child.handle()).unwrap();

  let upstream = InputFlow::<i32>::from_action_named("b", quick_options(), |_| async { Ok(()) });
  node.register_dependency(&upstream).unwrap();

  child.input().send(1).await.unwrap();
  child.input().send(2).await.unwrap();

  // Completing the dependency closes the node's children and lets the whole
  // node resolve.
  upstream.process(vec![10, 20], true).await.unwrap();
  node.completion().await.expect("node completes after dependency");
  assert_eq!(*items.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn external_dependency_fault_faults_the_node_and_its_children() {
  let node = Flow::named("a", quick_options());
  let child = ActionBlock::<i32>::new("c", BlockOptions::default(), 1, |_| async { Ok(()) });
  node.register_block(child.handle()).unwrap();

  let upstream = InputFlow::<i32>::from_action_named("b", quick_options(), |value| async move {
    if value == 13 {
      Err(FlowError::InvalidData {
        flow: "b".to_string(),
      })
    } else {
      Ok(())
    }
  });
  node.register_dependency(&upstream).unwrap();

  upstream.process(vec![13], false).await.unwrap();
  let upstream_err = upstream.completion().await.expect_err("upstream fails");
  assert!(matches!(
    upstream_err.innermost(),
    FlowError::InvalidData { .. }
  ));

  let err = node.completion().await.expect_err("node is faulted");
  assert!(matches!(
    err.innermost(),
    FlowError::LinkedFlowFailed { .. }
  ));

  let child_err = child
    .handle()
    .completion()
    .await
    .expect_err("running child observes the linked fault");
  assert!(matches!(
    child_err.as_ref(),
    FlowError::LinkedFlowFailed { .. }
  ));
}

#[tokio::test]
async fn child_cannot_also_be_an_external_dependency() {
  let flow = Flow::new(quick_options());
  let child = Flow::new(quick_options());
  flow.register_child(&child).unwrap();
  let err = flow.register_dependency(&child).unwrap_err();
  assert!(matches!(err, FlowError::ChildAsDependency { .. }));
}

#[tokio::test]
async fn fault_keeps_original_error_at_the_faulted_node() {
  let flow = Flow::named("origin", quick_options());
  let block = ActionBlock::<i32>::new("worker", BlockOptions::default(), 1, |_| async { Ok(()) });
  flow.register_block(block.handle()).unwrap();

  flow.fault(FlowError::InvalidData {
    flow: "origin".to_string(),
  });

  let err = flow.completion().await.expect_err("faulted flow fails");
  assert!(matches!(err.innermost(), FlowError::InvalidData { .. }));

  // The child saw the normalised variant, not the original.
  let child_err = block.handle().completion().await.expect_err("child faulted");
  assert!(matches!(
    child_err.as_ref(),
    FlowError::SiblingFailed { origin } if origin == "origin"
  ));
}
