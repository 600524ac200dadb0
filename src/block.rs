//! Stage primitives: bounded-queue workers and their typed endpoints.
//!
//! A *block* owns an input queue, a worker task that consumes it, an optional
//! output queue, and a completion future. Graph nodes never touch the queues
//! directly; they aggregate [`BlockHandle`]s, which expose the type-erased
//! surface a node needs — completion, buffer counts, and fault injection.
//!
//! Three block shapes cover the framework:
//!
//! - [`ActionBlock`] — terminal worker running an async action per item, with
//!   a configurable concurrency bound.
//! - [`TransformBlock`] — maps items into a bounded output queue consumed by
//!   a downstream link router.
//! - [`BatchBlock`] — groups items into arrays of a fixed bulk size, emitting
//!   on a full batch, an explicit trigger, or input close.
//!
//! Workers honour fault injection *between* items, never mid-item: an
//! in-flight action always runs to its own conclusion so transactional work
//! is not torn.

use crate::completion::{completion_pair, Completion, CompletionPromise};
use crate::error::FlowError;
pub use crate::options::BlockOptions;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// Channel plumbing
// ---------------------------------------------------------------------------

/// Sender half abstracting bounded and unbounded queues.
pub(crate) enum ChannelTx<T> {
  Bounded(mpsc::Sender<T>),
  Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for ChannelTx<T> {
  fn clone(&self) -> Self {
    match self {
      ChannelTx::Bounded(tx) => ChannelTx::Bounded(tx.clone()),
      ChannelTx::Unbounded(tx) => ChannelTx::Unbounded(tx.clone()),
    }
  }
}

impl<T> ChannelTx<T> {
  pub(crate) async fn send(&self, item: T) -> Result<(), T> {
    match self {
      ChannelTx::Bounded(tx) => tx.send(item).await.map_err(|e| e.0),
      ChannelTx::Unbounded(tx) => tx.send(item).map_err(|e| e.0),
    }
  }
}

/// Receiver half abstracting bounded and unbounded queues.
pub(crate) enum ChannelRx<T> {
  Bounded(mpsc::Receiver<T>),
  Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> ChannelRx<T> {
  pub(crate) async fn recv(&mut self) -> Option<T> {
    match self {
      ChannelRx::Bounded(rx) => rx.recv().await,
      ChannelRx::Unbounded(rx) => rx.recv().await,
    }
  }
}

pub(crate) fn channel<T>(capacity: Option<usize>) -> (ChannelTx<T>, ChannelRx<T>) {
  match capacity {
    Some(bound) => {
      let (tx, rx) = mpsc::channel(bound.max(1));
      (ChannelTx::Bounded(tx), ChannelRx::Bounded(rx))
    }
    None => {
      let (tx, rx) = mpsc::unbounded_channel();
      (ChannelTx::Unbounded(tx), ChannelRx::Unbounded(rx))
    }
  }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Publish side of a block's input queue.
///
/// All publishers go through the shared endpoint, so [`complete`] closes the
/// queue for every holder at once: the worker drains what was already queued
/// and then finishes.
///
/// [`complete`]: InputEndpoint::complete
pub struct InputEndpoint<T> {
  inner: Arc<EndpointInner<T>>,
}

struct EndpointInner<T> {
  name: String,
  tx: StdMutex<Option<ChannelTx<T>>>,
  queued: Arc<AtomicUsize>,
}

impl<T> Clone for InputEndpoint<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T: Send + 'static> InputEndpoint<T> {
  fn new(name: String, tx: ChannelTx<T>, queued: Arc<AtomicUsize>) -> Self {
    Self {
      inner: Arc::new(EndpointInner {
        name,
        tx: StdMutex::new(Some(tx)),
        queued,
      }),
    }
  }

  /// Publishes one item, waiting for queue capacity when bounded.
  ///
  /// Fails with [`FlowError::EndpointClosed`] once the endpoint has been
  /// completed or its worker has gone away.
  pub async fn send(&self, item: T) -> Result<(), FlowError> {
    let tx = { self.inner.tx.lock().expect("endpoint lock poisoned").clone() };
    let Some(tx) = tx else {
      return Err(FlowError::EndpointClosed {
        endpoint: self.inner.name.clone(),
      });
    };
    self.inner.queued.fetch_add(1, Ordering::AcqRel);
    if tx.send(item).await.is_err() {
      self.inner.queued.fetch_sub(1, Ordering::AcqRel);
      return Err(FlowError::EndpointClosed {
        endpoint: self.inner.name.clone(),
      });
    }
    Ok(())
  }

  /// Declines further publication and lets the worker drain the queue.
  /// Idempotent.
  pub fn complete(&self) {
    self.inner.tx.lock().expect("endpoint lock poisoned").take();
  }

  /// True once [`complete`](InputEndpoint::complete) has been called.
  pub fn is_completed(&self) -> bool {
    self.inner.tx.lock().expect("endpoint lock poisoned").is_none()
  }

  /// Number of items currently queued behind this endpoint.
  pub fn queued(&self) -> usize {
    self.inner.queued.load(Ordering::Acquire)
  }
}

/// Consume side of a transform block's output queue.
///
/// The receiver is claimed exactly once, by the link router of the node that
/// owns the block.
pub struct OutputEndpoint<U> {
  inner: Arc<OutputInner<U>>,
}

struct OutputInner<U> {
  rx: StdMutex<Option<ChannelRx<U>>>,
  queued: Arc<AtomicUsize>,
}

impl<U> Clone for OutputEndpoint<U> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<U> OutputEndpoint<U> {
  fn new(rx: ChannelRx<U>, queued: Arc<AtomicUsize>) -> Self {
    Self {
      inner: Arc::new(OutputInner {
        rx: StdMutex::new(Some(rx)),
        queued,
      }),
    }
  }

  pub(crate) fn take_receiver(&self) -> Option<ChannelRx<U>> {
    self.inner.rx.lock().expect("endpoint lock poisoned").take()
  }

  pub(crate) fn queued_counter(&self) -> Arc<AtomicUsize> {
    self.inner.queued.clone()
  }

  /// Number of produced items not yet consumed downstream.
  pub fn queued(&self) -> usize {
    self.inner.queued.load(Ordering::Acquire)
  }
}

// ---------------------------------------------------------------------------
// Block handle
// ---------------------------------------------------------------------------

/// Type-erased surface of a block: what a graph node aggregates.
#[derive(Clone)]
pub struct BlockHandle {
  inner: Arc<BlockShared>,
}

struct BlockShared {
  name: String,
  completion: Completion,
  queued_in: Arc<AtomicUsize>,
  queued_out: Arc<AtomicUsize>,
  cancel: CancellationToken,
  injected: OnceLock<Arc<FlowError>>,
  close_input: Box<dyn Fn() + Send + Sync>,
}

impl BlockHandle {
  /// Display name of the block.
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Completion future of the block's worker.
  pub fn completion(&self) -> Completion {
    self.inner.completion.clone()
  }

  /// `(input, output)` queue depths.
  pub fn buffer_status(&self) -> (usize, usize) {
    (
      self.inner.queued_in.load(Ordering::Acquire),
      self.inner.queued_out.load(Ordering::Acquire),
    )
  }

  /// Injects a fault. The worker observes it before starting the next item
  /// and resolves its completion with the injected error.
  pub fn fault(&self, err: Arc<FlowError>) {
    let _ = self.inner.injected.set(err);
    self.inner.cancel.cancel();
  }

  /// Closes the block's input so the worker drains and finishes.
  pub fn complete(&self) {
    (self.inner.close_input)();
  }

  pub(crate) fn id(&self) -> usize {
    Arc::as_ptr(&self.inner) as usize
  }

  pub(crate) fn cancel_token(&self) -> CancellationToken {
    self.inner.cancel.clone()
  }

  pub(crate) fn injected_or_canceled(&self) -> Arc<FlowError> {
    self
      .inner
      .injected
      .get()
      .cloned()
      .unwrap_or_else(|| Arc::new(FlowError::Canceled))
  }
}

struct BlockParts {
  handle: BlockHandle,
  promise: CompletionPromise,
}

fn new_block_parts(
  name: String,
  queued_in: Arc<AtomicUsize>,
  queued_out: Arc<AtomicUsize>,
  close_input: Box<dyn Fn() + Send + Sync>,
) -> BlockParts {
  let (promise, completion) = completion_pair();
  let handle = BlockHandle {
    inner: Arc::new(BlockShared {
      name,
      completion,
      queued_in,
      queued_out,
      cancel: CancellationToken::new(),
      injected: OnceLock::new(),
      close_input,
    }),
  };
  BlockParts { handle, promise }
}

/// Handle/promise pair for workers that are not queue-fed blocks, such as
/// link routers. The handle participates in a node's aggregation like any
/// other block.
pub(crate) fn detached_handle(name: String) -> (BlockHandle, CompletionPromise) {
  let parts = new_block_parts(
    name,
    Arc::new(AtomicUsize::new(0)),
    Arc::new(AtomicUsize::new(0)),
    Box::new(|| {}),
  );
  (parts.handle, parts.promise)
}

// ---------------------------------------------------------------------------
// Action block
// ---------------------------------------------------------------------------

/// Terminal worker: runs an async action for every queued item.
///
/// `max_concurrency` bounds how many actions run at once; with a bound of 1
/// the block processes strictly in arrival order.
pub struct ActionBlock<T> {
  input: InputEndpoint<T>,
  handle: BlockHandle,
}

impl<T: Send + 'static> ActionBlock<T> {
  /// Spawns the worker and returns the block.
  pub fn new<F, Fut>(
    name: impl Into<String>,
    options: BlockOptions,
    max_concurrency: usize,
    action: F,
  ) -> Self
  where
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
  {
    let name = name.into();
    let queued_in = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = channel::<T>(options.bounded_capacity);
    let input = InputEndpoint::new(name.clone(), tx, queued_in.clone());

    let close_ep = input.clone();
    let parts = new_block_parts(
      name.clone(),
      queued_in.clone(),
      Arc::new(AtomicUsize::new(0)),
      Box::new(move || close_ep.complete()),
    );
    let handle = parts.handle.clone();
    let promise = parts.promise;
    let cancel = handle.cancel_token();
    let max_concurrency = max_concurrency.max(1);

    let worker_handle = handle.clone();
    tokio::spawn(async move {
      let mut inflight = FuturesUnordered::new();
      let mut closed = false;
      let mut faulted = false;
      let mut outcome: Result<(), Arc<FlowError>> = Ok(());
      loop {
        if (closed || faulted) && inflight.is_empty() {
          break;
        }
        tokio::select! {
          biased;
          _ = cancel.cancelled(), if !faulted => {
            faulted = true;
          }
          done = inflight.next(), if !inflight.is_empty() => {
            if let Some(Err(err)) = done {
              error!(block = %name, error = %err, "block action failed");
              if outcome.is_ok() {
                outcome = Err(Arc::new(err));
              }
              faulted = true;
            }
          }
          received = rx.recv(), if !closed && !faulted && inflight.len() < max_concurrency => {
            match received {
              Some(item) => {
                queued_in.fetch_sub(1, Ordering::AcqRel);
                inflight.push(action(item));
              }
              None => closed = true,
            }
          }
        }
      }
      if faulted && outcome.is_ok() {
        outcome = Err(worker_handle.injected_or_canceled());
      }
      promise.resolve(outcome);
    });

    Self { input, handle }
  }

  /// Publish side of the block.
  pub fn input(&self) -> &InputEndpoint<T> {
    &self.input
  }

  /// Type-erased handle for registration with a graph node.
  pub fn handle(&self) -> &BlockHandle {
    &self.handle
  }
}

// ---------------------------------------------------------------------------
// Transform block
// ---------------------------------------------------------------------------

/// Worker mapping each input item into an output queue.
pub struct TransformBlock<T, U> {
  input: InputEndpoint<T>,
  output: OutputEndpoint<U>,
  handle: BlockHandle,
}

impl<T: Send + 'static, U: Send + 'static> TransformBlock<T, U> {
  /// Spawns the worker and returns the block.
  pub fn new<F, Fut>(name: impl Into<String>, options: BlockOptions, transform: F) -> Self
  where
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<U, FlowError>> + Send + 'static,
  {
    let name = name.into();
    let queued_in = Arc::new(AtomicUsize::new(0));
    let queued_out = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = channel::<T>(options.bounded_capacity);
    let (out_tx, out_rx) = channel::<U>(options.bounded_capacity);
    let input = InputEndpoint::new(name.clone(), tx, queued_in.clone());
    let output = OutputEndpoint::new(out_rx, queued_out.clone());

    let close_ep = input.clone();
    let parts = new_block_parts(
      name.clone(),
      queued_in.clone(),
      queued_out.clone(),
      Box::new(move || close_ep.complete()),
    );
    let handle = parts.handle.clone();
    let promise = parts.promise;
    let cancel = handle.cancel_token();

    let worker_handle = handle.clone();
    tokio::spawn(async move {
      let mut outcome: Result<(), Arc<FlowError>> = Ok(());
      loop {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => {
            outcome = Err(worker_handle.injected_or_canceled());
            break;
          }
          received = rx.recv() => match received {
            Some(item) => {
              queued_in.fetch_sub(1, Ordering::AcqRel);
              match transform(item).await {
                Ok(value) => {
                  queued_out.fetch_add(1, Ordering::AcqRel);
                  if out_tx.send(value).await.is_err() {
                    queued_out.fetch_sub(1, Ordering::AcqRel);
                    outcome = Err(Arc::new(FlowError::EndpointClosed { endpoint: name.clone() }));
                    break;
                  }
                }
                Err(err) => {
                  error!(block = %name, error = %err, "block transform failed");
                  outcome = Err(Arc::new(err));
                  break;
                }
              }
            }
            None => break,
          }
        }
      }
      drop(out_tx);
      promise.resolve(outcome);
    });

    Self {
      input,
      output,
      handle,
    }
  }

  /// Publish side of the block.
  pub fn input(&self) -> &InputEndpoint<T> {
    &self.input
  }

  /// Output queue, consumed by the owning node's link router.
  pub fn output(&self) -> &OutputEndpoint<U> {
    &self.output
  }

  /// Type-erased handle for registration with a graph node.
  pub fn handle(&self) -> &BlockHandle {
    &self.handle
  }
}

// ---------------------------------------------------------------------------
// Batch block
// ---------------------------------------------------------------------------

/// Grouping worker: collects items into arrays of up to `bulk_size`.
///
/// A batch is emitted when it is full, when [`trigger`](BatchBlock::trigger)
/// fires on a non-empty buffer, and for whatever remains when the input
/// closes. Arrival order is preserved inside each batch and across batches.
pub struct BatchBlock<T> {
  input: InputEndpoint<T>,
  handle: BlockHandle,
  trigger: Arc<Notify>,
}

impl<T: Send + 'static> BatchBlock<T> {
  /// Spawns the worker; emitted batches are published to `downstream`, which
  /// is completed when this block finishes successfully.
  pub fn new(
    name: impl Into<String>,
    options: BlockOptions,
    bulk_size: usize,
    downstream: InputEndpoint<Vec<T>>,
  ) -> Self {
    let name = name.into();
    let bulk_size = bulk_size.max(1);
    let queued_in = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = channel::<T>(options.bounded_capacity);
    let input = InputEndpoint::new(name.clone(), tx, queued_in.clone());
    let trigger = Arc::new(Notify::new());

    let close_ep = input.clone();
    let parts = new_block_parts(
      name.clone(),
      queued_in.clone(),
      Arc::new(AtomicUsize::new(0)),
      Box::new(move || close_ep.complete()),
    );
    let handle = parts.handle.clone();
    let promise = parts.promise;
    let cancel = handle.cancel_token();
    let worker_trigger = trigger.clone();

    let worker_handle = handle.clone();
    tokio::spawn(async move {
      let mut buf: Vec<T> = Vec::with_capacity(bulk_size);
      let mut outcome: Result<(), Arc<FlowError>> = Ok(());
      'run: loop {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => {
            outcome = Err(worker_handle.injected_or_canceled());
            break 'run;
          }
          _ = worker_trigger.notified() => {
            if !buf.is_empty() {
              debug!(block = %name, rows = buf.len(), "batch flushed by trigger");
              let batch = std::mem::take(&mut buf);
              if let Err(err) = downstream.send(batch).await {
                outcome = Err(Arc::new(err));
                break 'run;
              }
            }
          }
          received = rx.recv() => match received {
            Some(item) => {
              queued_in.fetch_sub(1, Ordering::AcqRel);
              buf.push(item);
              if buf.len() >= bulk_size {
                let batch = std::mem::take(&mut buf);
                if let Err(err) = downstream.send(batch).await {
                  outcome = Err(Arc::new(err));
                  break 'run;
                }
              }
            }
            None => break 'run,
          }
        }
      }
      if outcome.is_ok() && !buf.is_empty() {
        let batch = std::mem::take(&mut buf);
        if let Err(err) = downstream.send(batch).await {
          outcome = Err(Arc::new(err));
        }
      }
      if outcome.is_ok() {
        downstream.complete();
      }
      promise.resolve(outcome);
    });

    Self {
      input,
      handle,
      trigger,
    }
  }

  /// Publish side of the block.
  pub fn input(&self) -> &InputEndpoint<T> {
    &self.input
  }

  /// Type-erased handle for registration with a graph node.
  pub fn handle(&self) -> &BlockHandle {
    &self.handle
  }

  /// Flushes the current buffer, if any. A trigger with an empty buffer is a
  /// no-op.
  pub fn trigger(&self) {
    self.trigger.notify_one();
  }

  pub(crate) fn trigger_handle(&self) -> Arc<Notify> {
    self.trigger.clone()
  }
}
