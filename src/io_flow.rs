//! Typed-input/output nodes: conditional routing to downstream graphs.
//!
//! [`IoFlow`] adds a typed egress endpoint to a typed-input node. Output
//! values are routed by a single pump task: routing predicates are tested in
//! link order, the first match wins, and order is preserved within every
//! link. Values matching no predicate are *leftovers*; exactly one leftover
//! policy may be installed, and installing it freezes the predicate list.
//!
//! Every link also wires completion: the upstream registers itself as an
//! external dependency of the target, so the target cannot complete before
//! the upstream does, and a watcher faults the upstream if the target fails
//! or cancels first.

use crate::block::{
  detached_handle, BlockHandle, ChannelRx, InputEndpoint, OutputEndpoint, TransformBlock,
};
use crate::completion::CompletionResult;
use crate::dependency::ChildOptions;
use crate::error::FlowError;
use crate::flow::{next_default_name, Flow, FlowCore, FlowGraph};
use crate::input_flow::FlowInput;
use crate::options::FlowOptions;
use crate::recorder::GarbageRecorder;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Notify;

type LinkEntry<U> = Box<dyn Fn(U) -> RouteAttempt<U> + Send + Sync>;

enum RouteAttempt<U> {
  /// The entry accepted the value; awaiting the future delivers it.
  Deliver(BoxFuture<'static, Result<(), FlowError>>),
  /// The entry declined; the value moves on to the next predicate.
  Pass(U),
}

enum LeftoverPolicy<U> {
  /// Deliver leftovers to a target graph.
  Target(LinkEntry<U>),
  /// Record leftovers in the garbage recorder and drop them.
  Null,
  /// Fail the whole graph on the first leftover.
  FailGraph,
}

struct RouterState<U> {
  entries: Vec<LinkEntry<U>>,
  leftover: Option<LeftoverPolicy<U>>,
}

struct Router<U> {
  state: StdMutex<RouterState<U>>,
  changed: Notify,
  frozen: AtomicBool,
}

impl<U> Router<U> {
  fn new() -> Self {
    Self {
      state: StdMutex::new(RouterState {
        entries: Vec::new(),
        leftover: None,
      }),
      changed: Notify::new(),
      frozen: AtomicBool::new(false),
    }
  }
}

enum Offered<U> {
  Deliver(BoxFuture<'static, Result<(), FlowError>>),
  Dropped(U),
  Fail,
  Park(U),
}

fn offer<U>(state: &RouterState<U>, mut item: U) -> Offered<U> {
  for entry in &state.entries {
    match entry(item) {
      RouteAttempt::Deliver(delivery) => return Offered::Deliver(delivery),
      RouteAttempt::Pass(back) => item = back,
    }
  }
  match &state.leftover {
    Some(LeftoverPolicy::Target(entry)) => match entry(item) {
      RouteAttempt::Deliver(delivery) => Offered::Deliver(delivery),
      RouteAttempt::Pass(back) => Offered::Park(back),
    },
    Some(LeftoverPolicy::Null) => Offered::Dropped(item),
    Some(LeftoverPolicy::FailGraph) => Offered::Fail,
    None => Offered::Park(item),
  }
}

async fn run_router<U: Send + 'static>(
  mut rx: ChannelRx<U>,
  router: Arc<Router<U>>,
  recorder: GarbageRecorder,
  out_count: Arc<AtomicUsize>,
  handle: BlockHandle,
  flow: String,
) -> CompletionResult {
  let cancel = handle.cancel_token();
  loop {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(handle.injected_or_canceled()),
      maybe = rx.recv() => {
        let Some(mut item) = maybe else { return Ok(()) };
        out_count.fetch_sub(1, Ordering::AcqRel);
        loop {
          let notified = router.changed.notified();
          let offered = {
            let state = router.state.lock().expect("router lock poisoned");
            offer(&state, item)
          };
          match offered {
            Offered::Deliver(delivery) => {
              delivery.await.map_err(Arc::new)?;
              break;
            }
            Offered::Dropped(value) => {
              recorder.record(&value);
              break;
            }
            Offered::Fail => {
              return Err(Arc::new(FlowError::InvalidData { flow: flow.clone() }));
            }
            // No predicate matched and no leftover policy exists yet; park
            // until the routing table changes.
            Offered::Park(value) => {
              item = value;
              tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(handle.injected_or_canceled()),
                _ = notified => {}
              }
            }
          }
        }
      }
    }
  }
}

/// Graph node with a typed entry point and a routed egress endpoint.
pub struct IoFlow<T, U> {
  flow: Flow,
  input: InputEndpoint<T>,
  output: OutputEndpoint<U>,
  router: Arc<Router<U>>,
  recorder: GarbageRecorder,
  pump_started: Arc<AtomicBool>,
}

impl<T, U> Clone for IoFlow<T, U> {
  fn clone(&self) -> Self {
    Self {
      flow: self.flow.clone(),
      input: self.input.clone(),
      output: self.output.clone(),
      router: self.router.clone(),
      recorder: self.recorder.clone(),
      pump_started: self.pump_started.clone(),
    }
  }
}

impl<T, U> IoFlow<T, U>
where
  T: Send + 'static,
  U: Send + 'static,
{
  /// Wraps an already-wired flow and its endpoints.
  pub fn new(flow: Flow, input: InputEndpoint<T>, output: OutputEndpoint<U>) -> Self {
    let entry = input.clone();
    flow.core().set_completer(Box::new(move || entry.complete()));
    Self {
      flow,
      input,
      output,
      router: Arc::new(Router::new()),
      recorder: GarbageRecorder::default(),
      pump_started: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Node running `transform` for every published item.
  pub fn from_transform<F, Fut>(options: FlowOptions, transform: F) -> Self
  where
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<U, FlowError>> + Send + 'static,
  {
    Self::from_transform_named(next_default_name("IoFlow"), options, transform)
  }

  /// Transforming node with an explicit name.
  pub fn from_transform_named<F, Fut>(
    name: impl Into<String>,
    options: FlowOptions,
    transform: F,
  ) -> Self
  where
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<U, FlowError>> + Send + 'static,
  {
    let name = name.into();
    let flow = Flow::named(name.clone(), options.clone());
    let block = TransformBlock::new(
      format!("{name}.transform"),
      options.to_execution_block_options(),
      transform,
    );
    flow
      .register_block(block.handle())
      .expect("fresh block cannot collide with an existing child");
    Self::new(flow, block.input().clone(), block.output().clone())
  }

  /// Recorder of leftover values dropped by
  /// [`link_left_to_null`](IoFlow::link_left_to_null).
  pub fn garbage_recorder(&self) -> &GarbageRecorder {
    &self.recorder
  }

  /// Routes all output values to `other`.
  pub fn link_to<G: FlowInput<U>>(&self, other: &G) -> Result<(), FlowError> {
    self.link_to_when(other, |_| true)
  }

  /// Alias for [`link_to`](IoFlow::link_to).
  pub fn go_to<G: FlowInput<U>>(&self, other: &G) -> Result<(), FlowError> {
    self.link_to(other)
  }

  /// Routes output values matching `predicate` to `other`.
  pub fn link_to_when<G, P>(&self, other: &G, predicate: P) -> Result<(), FlowError>
  where
    G: FlowInput<U>,
    P: Fn(&U) -> bool + Send + Sync + 'static,
  {
    self.transform_and_link(other, |item| item, predicate)
  }

  /// Routes matching values through `transform` before delivery.
  pub fn transform_and_link<V, G, F, P>(
    &self,
    other: &G,
    transform: F,
    predicate: P,
  ) -> Result<(), FlowError>
  where
    V: Send + 'static,
    G: FlowInput<V>,
    F: Fn(U) -> V + Send + Sync + 'static,
    P: Fn(&U) -> bool + Send + Sync + 'static,
  {
    self.check_frozen()?;
    self.ensure_pump();
    self.attach_target(other)?;
    let endpoint = other.input_endpoint().clone();
    let flow = self.name().to_string();
    let linked = other.name().to_string();
    self.push_entry(Box::new(move |item: U| {
      if !predicate(&item) {
        return RouteAttempt::Pass(item);
      }
      let value = transform(item);
      let endpoint = endpoint.clone();
      let flow = flow.clone();
      let linked = linked.clone();
      RouteAttempt::Deliver(Box::pin(async move {
        endpoint
          .send(value)
          .await
          .map_err(|_| FlowError::LinkedFlowFailed { flow, linked })
      }))
    }));
    Ok(())
  }

  /// Routes values projecting into `V` to `other`; values that do not
  /// project move on to later predicates.
  pub fn link_subtype_to<V, G>(&self, other: &G) -> Result<(), FlowError>
  where
    V: TryFrom<U, Error = U> + Send + 'static,
    G: FlowInput<V>,
  {
    self.check_frozen()?;
    self.ensure_pump();
    self.attach_target(other)?;
    let endpoint = other.input_endpoint().clone();
    let flow = self.name().to_string();
    let linked = other.name().to_string();
    self.push_entry(Box::new(move |item: U| match V::try_from(item) {
      Ok(value) => {
        let endpoint = endpoint.clone();
        let flow = flow.clone();
        let linked = linked.clone();
        RouteAttempt::Deliver(Box::pin(async move {
          endpoint
            .send(value)
            .await
            .map_err(|_| FlowError::LinkedFlowFailed { flow, linked })
        }))
      }
      Err(item) => RouteAttempt::Pass(item),
    }));
    Ok(())
  }

  /// Routes every value matching no predicate to `target`. Freezes the
  /// predicate list.
  pub fn link_left_to<G: FlowInput<U>>(&self, target: &G) -> Result<(), FlowError> {
    self.freeze()?;
    self.ensure_pump();
    self.attach_target(target)?;
    let endpoint = target.input_endpoint().clone();
    let flow = self.name().to_string();
    let linked = target.name().to_string();
    let entry: LinkEntry<U> = Box::new(move |item: U| {
      let endpoint = endpoint.clone();
      let flow = flow.clone();
      let linked = linked.clone();
      RouteAttempt::Deliver(Box::pin(async move {
        endpoint
          .send(item)
          .await
          .map_err(|_| FlowError::LinkedFlowFailed { flow, linked })
      }))
    });
    self
      .router
      .state
      .lock()
      .expect("router lock poisoned")
      .leftover = Some(LeftoverPolicy::Target(entry));
    self.router.changed.notify_waiters();
    Ok(())
  }

  /// Records and drops every value matching no predicate. Freezes the
  /// predicate list.
  pub fn link_left_to_null(&self) -> Result<(), FlowError> {
    self.freeze()?;
    self.ensure_pump();
    self
      .router
      .state
      .lock()
      .expect("router lock poisoned")
      .leftover = Some(LeftoverPolicy::Null);
    self.router.changed.notify_waiters();
    Ok(())
  }

  /// Fails the whole graph with [`FlowError::InvalidData`] on the first
  /// value matching no predicate. Freezes the predicate list.
  pub fn link_left_to_error(&self) -> Result<(), FlowError> {
    self.freeze()?;
    self.ensure_pump();
    self
      .router
      .state
      .lock()
      .expect("router lock poisoned")
      .leftover = Some(LeftoverPolicy::FailGraph);
    self.router.changed.notify_waiters();
    Ok(())
  }

  fn check_frozen(&self) -> Result<(), FlowError> {
    if self.router.frozen.load(Ordering::SeqCst) {
      return Err(FlowError::PredicatesFrozen {
        flow: self.name().to_string(),
      });
    }
    Ok(())
  }

  fn freeze(&self) -> Result<(), FlowError> {
    if self.router.frozen.swap(true, Ordering::SeqCst) {
      return Err(FlowError::PredicatesFrozen {
        flow: self.name().to_string(),
      });
    }
    Ok(())
  }

  fn push_entry(&self, entry: LinkEntry<U>) {
    self
      .router
      .state
      .lock()
      .expect("router lock poisoned")
      .entries
      .push(entry);
    self.router.changed.notify_waiters();
  }

  /// Registers `self` as an external dependency of the link target and
  /// watches the target: a target failing or canceling first faults `self`.
  fn attach_target<G: FlowGraph>(&self, other: &G) -> Result<(), FlowError> {
    other.core().register_node_dependency(self.core().clone())?;
    let self_core = self.core().clone();
    let self_completion = self.completion();
    let other_completion = other.completion();
    let linked = other.name().to_string();
    tokio::spawn(async move {
      tokio::select! {
        _ = self_completion => {}
        result = other_completion => {
          if let Err(err) = result {
            let fault = if err.is_cancellation() {
              FlowError::LinkedFlowCanceled {
                flow: self_core.name().to_string(),
                linked,
              }
            } else {
              FlowError::LinkedFlowFailed {
                flow: self_core.name().to_string(),
                linked,
              }
            };
            self_core.fault(Arc::new(fault));
          }
        }
      }
    });
    Ok(())
  }

  /// Starts the routing pump on first link. The pump is registered as a
  /// child so the node cannot complete before every output value was routed.
  fn ensure_pump(&self) {
    if self.pump_started.swap(true, Ordering::SeqCst) {
      return;
    }
    let Some(rx) = self.output.take_receiver() else {
      return;
    };
    let (handle, promise) = detached_handle(format!("{}.router", self.name()));
    self
      .flow
      .register_block_with(
        &handle,
        ChildOptions::default().with_display_name("router"),
      )
      .expect("router handle registers exactly once");
    let router = self.router.clone();
    let recorder = self.recorder.clone();
    let out_count = self.output.queued_counter();
    let flow_name = self.name().to_string();
    let worker_handle = handle.clone();
    tokio::spawn(async move {
      let result = run_router(rx, router, recorder, out_count, worker_handle, flow_name).await;
      promise.resolve(result);
    });
  }
}

impl<T, U> FlowGraph for IoFlow<T, U>
where
  T: Send + 'static,
  U: Send + 'static,
{
  fn core(&self) -> &Arc<FlowCore> {
    self.flow.core()
  }
}

impl<T, U> FlowInput<T> for IoFlow<T, U>
where
  T: Send + 'static,
  U: Send + 'static,
{
  fn input_endpoint(&self) -> &InputEndpoint<T> {
    &self.input
  }
}
