//! Graph nodes: composable units owning a sub-graph of children.
//!
//! A node aggregates the completion of its children into a single completion
//! future, propagates faults across siblings, drives completion from external
//! dependencies, runs post-completion tasks, and optionally monitors buffer
//! pressure. Nodes nest: a node registered as a child participates in its
//! parent's aggregation exactly like a primitive block.
//!
//! # Completion semantics
//!
//! A node's completion future resolves exactly once:
//!
//! 1. With no children, the node waits one monitor interval and then fails
//!    with [`FlowError::NoChildRegistered`].
//! 2. Otherwise it awaits every known child, re-checking for children
//!    registered while the await was in flight.
//! 3. Registered post-completion tasks run in registration order once all
//!    children succeeded.
//! 4. On any failure, every registered cancellation token is tripped, every
//!    non-completed child is faulted with a normalised sibling variant, and
//!    the future resolves with an [`FlowError::Aggregate`] carrying the
//!    original error.
//!
//! # Ownership
//!
//! The parent exclusively owns its children through the dependency list; the
//! child only keeps a weak back-reference used for
//! [`full_name`](FlowCore::full_name) rendering, so parent/child reference
//! cycles cannot form.

use crate::block::BlockHandle;
use crate::completion::{completion_pair, Completion, CompletionPromise};
use crate::dependency::{ChildOptions, Dependency, DependencyKind};
use crate::error::FlowError;
use crate::options::{FlowOptions, MonitorMode};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deferred async action run after all children resolve.
pub type PostTask = BoxFuture<'static, Result<(), FlowError>>;

static NAME_COUNTERS: OnceLock<StdMutex<HashMap<&'static str, u64>>> = OnceLock::new();

/// Returns `<tag><N>` with a process-wide monotonically increasing `N` per
/// tag.
pub(crate) fn next_default_name(tag: &'static str) -> String {
  let registry = NAME_COUNTERS.get_or_init(|| StdMutex::new(HashMap::new()));
  let mut guard = registry.lock().expect("name registry lock poisoned");
  let counter = guard.entry(tag).or_insert(0);
  *counter += 1;
  format!("{tag}{counter}")
}

/// Shared state of a graph node. Wrapper types ([`Flow`],
/// [`InputFlow`](crate::InputFlow), …) hold an `Arc<FlowCore>` and expose it
/// through [`FlowGraph::core`].
pub struct FlowCore {
  name: String,
  options: FlowOptions,
  self_weak: Weak<FlowCore>,
  children: StdMutex<Arc<Vec<Arc<Dependency>>>>,
  children_changed: Notify,
  parents: StdMutex<Vec<Weak<FlowCore>>>,
  externals: StdMutex<Arc<Vec<Arc<Dependency>>>>,
  externals_changed: Notify,
  post_tasks: StdMutex<VecDeque<PostTask>>,
  cancel_sources: StdMutex<Vec<CancellationToken>>,
  completion_future: Completion,
  promise: StdMutex<Option<CompletionPromise>>,
  aggregator_started: AtomicBool,
  externals_watch_started: AtomicBool,
  first_fault: OnceLock<Arc<FlowError>>,
  completer: OnceLock<Box<dyn Fn() + Send + Sync>>,
  status_override: OnceLock<Box<dyn Fn() -> (usize, usize) + Send + Sync>>,
}

impl FlowCore {
  pub(crate) fn new(name: String, options: FlowOptions) -> Arc<Self> {
    let (promise, completion_future) = completion_pair();
    let core = Arc::new_cyclic(|self_weak| FlowCore {
      name,
      options,
      self_weak: self_weak.clone(),
      children: StdMutex::new(Arc::new(Vec::new())),
      children_changed: Notify::new(),
      parents: StdMutex::new(Vec::new()),
      externals: StdMutex::new(Arc::new(Vec::new())),
      externals_changed: Notify::new(),
      post_tasks: StdMutex::new(VecDeque::new()),
      cancel_sources: StdMutex::new(Vec::new()),
      completion_future,
      promise: StdMutex::new(Some(promise)),
      aggregator_started: AtomicBool::new(false),
      externals_watch_started: AtomicBool::new(false),
      first_fault: OnceLock::new(),
      completer: OnceLock::new(),
      status_override: OnceLock::new(),
    });
    if core.options.flow_monitor || core.options.block_monitor {
      core.start_monitor();
    }
    core
  }

  /// Short name of this node.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Options the node was built with.
  pub fn options(&self) -> &FlowOptions {
    &self.options
  }

  /// Hierarchical name: `([parent|…])->[name]`, or `[name]` at the root.
  pub fn full_name(&self) -> String {
    let parents: Vec<String> = self.parents().iter().map(|p| p.full_name()).collect();
    if parents.is_empty() {
      format!("[{}]", self.name)
    } else {
      format!("({})->[{}]", parents.join("|"), self.name)
    }
  }

  /// Completion future of this node. Observing it starts the aggregation if
  /// no child registration already has.
  pub fn completion(&self) -> Completion {
    self.ensure_aggregator();
    self.completion_future.clone()
  }

  /// `(input, output)` queue depths summed over children, unless the owning
  /// node installed an override.
  pub fn buffer_status(&self) -> (usize, usize) {
    if let Some(status) = self.status_override.get() {
      return status();
    }
    let mut queued_in = 0;
    let mut queued_out = 0;
    for dep in self.children_snapshot().iter() {
      let (i, o) = dep.buffer_status();
      queued_in += i;
      queued_out += o;
    }
    (queued_in, queued_out)
  }

  /// Signals this node's entry closed: the typed input endpoint when the
  /// owning node installed one, otherwise every child's input.
  pub fn complete(&self) {
    if let Some(completer) = self.completer.get() {
      completer();
      return;
    }
    for dep in self.children_snapshot().iter() {
      dep.complete();
    }
  }

  /// Faults this node: the error is recorded as the node's failure cause and
  /// every non-completed child receives the normalised variant.
  pub fn fault(&self, err: Arc<FlowError>) {
    if self.first_fault.set(err.clone()).is_err() {
      return;
    }
    warn!(flow = %self.full_name(), error = %err, "dataflow faulted");
    let normalised = FlowError::normalised_for_descendants(&err, &self.name);
    self.fault_children(normalised);
  }

  fn fault_children(&self, normalised: Arc<FlowError>) {
    for dep in self.children_snapshot().iter() {
      if !dep.is_completed() {
        dep.fault(normalised.clone());
      }
    }
  }

  /// Registers another graph node as a child.
  pub fn register_node_child(
    &self,
    child: Arc<FlowCore>,
    options: ChildOptions,
  ) -> Result<(), FlowError> {
    if child.contains_core(self) {
      return Err(FlowError::CycleNotAllowed {
        flow: self.name.clone(),
        child: child.name.clone(),
      });
    }
    let id = Arc::as_ptr(&child) as usize;
    {
      let mut guard = self.children.lock().expect("children lock poisoned");
      if guard.iter().any(|d| d.id() == id) {
        if options.allow_duplicate {
          return Ok(());
        }
        return Err(FlowError::DuplicateChild {
          flow: self.name.clone(),
          child: child.name.clone(),
        });
      }
      child.add_parent(self.self_weak.clone());
      let dep = Arc::new(Dependency::from_graph(
        child,
        DependencyKind::Child,
        options.display_name,
        options.on_complete,
      ));
      let mut next = (**guard).clone();
      next.push(dep);
      *guard = Arc::new(next);
    }
    self.children_changed.notify_waiters();
    self.ensure_aggregator();
    Ok(())
  }

  /// Registers a primitive block as a child.
  pub fn register_block_child(
    &self,
    block: BlockHandle,
    options: ChildOptions,
  ) -> Result<(), FlowError> {
    let id = block.id();
    {
      let mut guard = self.children.lock().expect("children lock poisoned");
      if guard.iter().any(|d| d.id() == id) {
        if options.allow_duplicate {
          return Ok(());
        }
        return Err(FlowError::DuplicateChild {
          flow: self.name.clone(),
          child: block.name().to_string(),
        });
      }
      let dep = Arc::new(Dependency::from_block(
        block,
        DependencyKind::Child,
        options.display_name,
        options.on_complete,
      ));
      let mut next = (**guard).clone();
      next.push(dep);
      *guard = Arc::new(next);
    }
    self.children_changed.notify_waiters();
    self.ensure_aggregator();
    Ok(())
  }

  /// Registers another graph node as an external dependency: this node
  /// completes when all external dependencies jointly complete, and is
  /// faulted when any of them fails or cancels.
  pub fn register_node_dependency(&self, dependency: Arc<FlowCore>) -> Result<(), FlowError> {
    let id = Arc::as_ptr(&dependency) as usize;
    if self.children_snapshot().iter().any(|d| d.id() == id) {
      return Err(FlowError::ChildAsDependency {
        flow: self.name.clone(),
        child: dependency.name().to_string(),
      });
    }
    {
      let mut guard = self.externals.lock().expect("externals lock poisoned");
      if guard.iter().any(|d| d.id() == id) {
        return Ok(());
      }
      let dep = Arc::new(Dependency::from_graph(
        dependency,
        DependencyKind::External,
        None,
        None,
      ));
      let mut next = (**guard).clone();
      next.push(dep);
      *guard = Arc::new(next);
    }
    self.externals_changed.notify_waiters();
    self.ensure_externals_watch();
    Ok(())
  }

  /// Registers a primitive block as an external dependency.
  pub fn register_block_dependency(&self, block: BlockHandle) -> Result<(), FlowError> {
    let id = block.id();
    if self.children_snapshot().iter().any(|d| d.id() == id) {
      return Err(FlowError::ChildAsDependency {
        flow: self.name.clone(),
        child: block.name().to_string(),
      });
    }
    {
      let mut guard = self.externals.lock().expect("externals lock poisoned");
      if guard.iter().any(|d| d.id() == id) {
        return Ok(());
      }
      let dep = Arc::new(Dependency::from_block(
        block,
        DependencyKind::External,
        None,
        None,
      ));
      let mut next = (**guard).clone();
      next.push(dep);
      *guard = Arc::new(next);
    }
    self.externals_changed.notify_waiters();
    self.ensure_externals_watch();
    Ok(())
  }

  /// Appends a deferred task run after all children resolve successfully.
  pub fn register_post_task(&self, task: PostTask) {
    self
      .post_tasks
      .lock()
      .expect("post task lock poisoned")
      .push_back(task);
  }

  /// Registers a cancellation token tripped when this node's aggregation
  /// observes any failure.
  pub fn register_cancellation_token(&self, token: CancellationToken) {
    self
      .cancel_sources
      .lock()
      .expect("cancel sources lock poisoned")
      .push(token);
  }

  /// Upgraded parent nodes.
  pub fn parents(&self) -> Vec<Arc<FlowCore>> {
    self
      .parents
      .lock()
      .expect("parents lock poisoned")
      .iter()
      .filter_map(Weak::upgrade)
      .collect()
  }

  /// Current children snapshot.
  pub fn children_snapshot(&self) -> Arc<Vec<Arc<Dependency>>> {
    self.children.lock().expect("children lock poisoned").clone()
  }

  fn externals_snapshot(&self) -> Arc<Vec<Arc<Dependency>>> {
    self
      .externals
      .lock()
      .expect("externals lock poisoned")
      .clone()
  }

  /// True if this node is, or transitively contains, `other`.
  pub fn contains_core(&self, other: &FlowCore) -> bool {
    if std::ptr::eq(self, other) {
      return true;
    }
    self
      .children_snapshot()
      .iter()
      .any(|dep| dep.graph_core().is_some_and(|core| core.contains_core(other)))
  }

  fn add_parent(&self, parent: Weak<FlowCore>) {
    self
      .parents
      .lock()
      .expect("parents lock poisoned")
      .push(parent);
  }

  pub(crate) fn set_completer(&self, completer: Box<dyn Fn() + Send + Sync>) {
    let _ = self.completer.set(completer);
  }

  pub(crate) fn set_status_override(
    &self,
    status: Box<dyn Fn() -> (usize, usize) + Send + Sync>,
  ) {
    let _ = self.status_override.set(status);
  }

  fn resolve(&self, result: Result<(), Arc<FlowError>>) {
    if let Some(promise) = self.promise.lock().expect("promise lock poisoned").take() {
      promise.resolve(result);
      // Prime the shared future so peek() observes the resolution even
      // before any external observer polls it.
      let _ = self.completion_future.clone().now_or_never();
    }
  }

  fn ensure_aggregator(&self) {
    if self.aggregator_started.swap(true, Ordering::SeqCst) {
      return;
    }
    if let Some(core) = self.self_weak.upgrade() {
      tokio::spawn(core.run_aggregation());
    }
  }

  fn ensure_externals_watch(&self) {
    if self.externals_watch_started.swap(true, Ordering::SeqCst) {
      return;
    }
    if let Some(core) = self.self_weak.upgrade() {
      tokio::spawn(core.run_externals_watch());
    }
  }

  async fn run_aggregation(self: Arc<Self>) {
    if self.children_snapshot().is_empty() {
      tokio::time::sleep(self.options.monitor_interval).await;
      if self.children_snapshot().is_empty() {
        warn!(flow = %self.full_name(), "no child registered within one monitor interval");
        let _ = self.first_fault.set(Arc::new(FlowError::NoChildRegistered {
          flow: self.name.clone(),
        }));
        self.finish().await;
        return;
      }
    }

    let mut seen: HashSet<usize> = HashSet::new();
    let mut pending: FuturesUnordered<BoxFuture<'static, Result<(), Arc<FlowError>>>> =
      FuturesUnordered::new();
    loop {
      let notified = self.children_changed.notified();
      for dep in self.children_snapshot().iter() {
        if seen.insert(dep.id()) {
          let dep = dep.clone();
          pending.push(Box::pin(async move {
            let result = dep.completion().await;
            dep.notify_completion(&result);
            result
          }));
        }
      }
      if pending.is_empty() {
        // Snapshot equals live set at the moment every known child resolved.
        if self.children_snapshot().len() == seen.len() {
          break;
        }
        continue;
      }
      tokio::select! {
        maybe = pending.next(), if !pending.is_empty() => {
          if let Some(Err(err)) = maybe {
            if self.first_fault.set(err.clone()).is_ok() {
              let normalised = FlowError::normalised_for_descendants(&err, &self.name);
              self.fault_children(normalised);
            }
          }
        }
        _ = notified => {}
      }
    }

    self.finish().await;
  }

  async fn finish(&self) {
    if self.first_fault.get().is_none() {
      loop {
        let task = {
          self
            .post_tasks
            .lock()
            .expect("post task lock poisoned")
            .pop_front()
        };
        let Some(task) = task else { break };
        if let Err(err) = task.await {
          error!(flow = %self.full_name(), error = %err, "post-completion task failed");
          let _ = self.first_fault.set(Arc::new(err));
          break;
        }
      }
    }

    match self.first_fault.get() {
      None => {
        info!(flow = %self.full_name(), "dataflow completed");
        self.resolve(Ok(()));
      }
      Some(inner) => {
        for token in self
          .cancel_sources
          .lock()
          .expect("cancel sources lock poisoned")
          .iter()
        {
          token.cancel();
        }
        let aggregate = Arc::new(FlowError::Aggregate {
          flow: self.name.clone(),
          inner: inner.clone(),
        });
        error!(flow = %self.full_name(), error = %aggregate, "dataflow failed");
        self.resolve(Err(aggregate));
      }
    }
  }

  async fn run_externals_watch(self: Arc<Self>) {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut pending: FuturesUnordered<BoxFuture<'static, (String, Result<(), Arc<FlowError>>)>> =
      FuturesUnordered::new();
    let mut first_err: Option<(String, Arc<FlowError>)> = None;
    loop {
      let notified = self.externals_changed.notified();
      for dep in self.externals_snapshot().iter() {
        if seen.insert(dep.id()) {
          let dep = dep.clone();
          pending.push(Box::pin(async move {
            let name = dep.display_name().to_string();
            let result = dep.completion().await;
            dep.notify_completion(&result);
            (name, result)
          }));
        }
      }
      if pending.is_empty() {
        if self.externals_snapshot().len() == seen.len() {
          break;
        }
        continue;
      }
      tokio::select! {
        maybe = pending.next(), if !pending.is_empty() => {
          if let Some((name, Err(err))) = maybe {
            if first_err.is_none() {
              first_err = Some((name, err));
            }
          }
        }
        _ = notified => {}
      }
    }

    match first_err {
      None => {
        debug!(flow = %self.full_name(), "external dependencies completed");
        self.complete();
      }
      Some((linked, err)) => {
        let fault = if err.is_cancellation() {
          FlowError::LinkedFlowCanceled {
            flow: self.name.clone(),
            linked,
          }
        } else {
          FlowError::LinkedFlowFailed {
            flow: self.name.clone(),
            linked,
          }
        };
        self.fault(Arc::new(fault));
      }
    }
  }

  fn start_monitor(&self) {
    let weak = self.self_weak.clone();
    tokio::spawn(async move {
      loop {
        let interval = match weak.upgrade() {
          Some(core) => core.options.monitor_interval,
          None => break,
        };
        tokio::time::sleep(interval).await;
        let Some(core) = weak.upgrade() else { break };
        if core.completion_future.is_resolved() {
          break;
        }
        let verbose = core.options.monitor_mode == MonitorMode::Verbose;
        if core.options.flow_monitor {
          let (queued_in, queued_out) = core.buffer_status();
          if verbose || queued_in + queued_out > 0 {
            info!(flow = %core.full_name(), queued_in, queued_out, "buffer status");
          }
        }
        if core.options.block_monitor {
          for dep in core.children_snapshot().iter() {
            let (queued_in, queued_out) = dep.buffer_status();
            if verbose || queued_in + queued_out > 0 {
              info!(
                flow = %core.full_name(),
                child = %dep.display_name(),
                queued_in,
                queued_out,
                "child buffer status"
              );
            }
          }
        }
      }
    });
  }
}

/// Common surface of every graph node.
///
/// Implementors only provide [`core`](FlowGraph::core); everything else is
/// derived. Registration helpers are generic and therefore only callable on
/// sized types.
pub trait FlowGraph: Send + Sync {
  /// Shared node state.
  fn core(&self) -> &Arc<FlowCore>;

  /// Short name of the node.
  fn name(&self) -> &str {
    self.core().name()
  }

  /// Hierarchical name rendered through parent back-references.
  fn full_name(&self) -> String {
    self.core().full_name()
  }

  /// Options the node was built with.
  fn options(&self) -> &FlowOptions {
    self.core().options()
  }

  /// Completion future; resolves exactly once.
  fn completion(&self) -> Completion {
    self.core().completion()
  }

  /// `(input, output)` queue depths summed over children.
  fn buffer_status(&self) -> (usize, usize) {
    self.core().buffer_status()
  }

  /// Total buffered items.
  fn buffered_count(&self) -> usize {
    let (queued_in, queued_out) = self.buffer_status();
    queued_in + queued_out
  }

  /// Snapshot of the children list.
  fn children(&self) -> Vec<Arc<Dependency>> {
    self.core().children_snapshot().as_ref().clone()
  }

  /// Upgraded parent nodes.
  fn parents(&self) -> Vec<Arc<FlowCore>> {
    self.core().parents()
  }

  /// Signals this node's entry closed.
  fn complete(&self) {
    self.core().complete();
  }

  /// Faults this node and propagates a normalised variant to children.
  fn fault(&self, err: FlowError) {
    self.core().fault(Arc::new(err));
  }

  /// Registers another node as a child.
  fn register_child<G: FlowGraph>(&self, child: &G) -> Result<(), FlowError>
  where
    Self: Sized,
  {
    self
      .core()
      .register_node_child(child.core().clone(), ChildOptions::default())
  }

  /// Registers another node as a child with explicit options.
  fn register_child_with<G: FlowGraph>(
    &self,
    child: &G,
    options: ChildOptions,
  ) -> Result<(), FlowError>
  where
    Self: Sized,
  {
    self.core().register_node_child(child.core().clone(), options)
  }

  /// Registers a primitive block as a child.
  fn register_block(&self, block: &BlockHandle) -> Result<(), FlowError> {
    self
      .core()
      .register_block_child(block.clone(), ChildOptions::default())
  }

  /// Registers a primitive block as a child with explicit options.
  fn register_block_with(
    &self,
    block: &BlockHandle,
    options: ChildOptions,
  ) -> Result<(), FlowError> {
    self.core().register_block_child(block.clone(), options)
  }

  /// Registers another node as an external dependency.
  fn register_dependency<G: FlowGraph>(&self, dependency: &G) -> Result<(), FlowError>
  where
    Self: Sized,
  {
    self.core().register_node_dependency(dependency.core().clone())
  }

  /// Registers a primitive block as an external dependency.
  fn register_block_dependency(&self, block: &BlockHandle) -> Result<(), FlowError> {
    self.core().register_block_dependency(block.clone())
  }

  /// Registers a deferred task run after all children resolve.
  fn register_post_task<F>(&self, task: F)
  where
    F: Future<Output = Result<(), FlowError>> + Send + 'static,
    Self: Sized,
  {
    self.core().register_post_task(Box::pin(task));
  }

  /// Registers a cancellation token tripped on failure.
  fn register_cancellation_token(&self, token: CancellationToken) {
    self.core().register_cancellation_token(token);
  }
}

/// Plain container node: a graph of registered children with no typed
/// endpoints of its own.
#[derive(Clone)]
pub struct Flow {
  core: Arc<FlowCore>,
}

impl Flow {
  /// Creates a node with a generated name.
  pub fn new(options: FlowOptions) -> Self {
    Self::named(next_default_name("Flow"), options)
  }

  /// Creates a node with an explicit name.
  pub fn named(name: impl Into<String>, options: FlowOptions) -> Self {
    Self {
      core: FlowCore::new(name.into(), options),
    }
  }
}

impl FlowGraph for Flow {
  fn core(&self) -> &Arc<FlowCore> {
    &self.core
  }
}
