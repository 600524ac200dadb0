//! Typed-input nodes: graphs with a strongly typed entry point.
//!
//! [`InputFlow`] wraps a [`Flow`] whose entry is a single
//! [`InputEndpoint`]; the [`FlowInput`] trait carries the iterator drivers so
//! that any node with a typed entry point — including the bulk sink — accepts
//! the same publication API and can be the target of a link.

use crate::block::{ActionBlock, InputEndpoint};
use crate::error::FlowError;
use crate::flow::{next_default_name, Flow, FlowCore, FlowGraph};
use crate::options::FlowOptions;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// A node that accepts items of type `T` through a typed entry point.
pub trait FlowInput<T>: FlowGraph
where
  T: Send + 'static,
{
  /// The typed entry point of this node.
  fn input_endpoint(&self) -> &InputEndpoint<T>;

  /// Publishes every item of `items` sequentially, awaiting backpressure on
  /// a bounded entry queue. The token is checked between items; returns the
  /// number of items published.
  fn pull_from<I>(
    &self,
    items: I,
    token: &CancellationToken,
  ) -> impl Future<Output = Result<usize, FlowError>> + Send
  where
    I: IntoIterator<Item = T> + Send,
    I::IntoIter: Send,
    Self: Sized,
  {
    async move {
      let mut published = 0usize;
      for item in items {
        if token.is_cancelled() {
          warn!(flow = %self.name(), published, "publication canceled");
          return Err(FlowError::PullInterrupted {
            flow: self.name().to_string(),
            published,
            inner: Arc::new(FlowError::Canceled),
          });
        }
        if let Err(err) = self.input_endpoint().send(item).await {
          error!(flow = %self.name(), published, error = %err, "publication failed");
          return Err(FlowError::PullInterrupted {
            flow: self.name().to_string(),
            published,
            inner: Arc::new(err),
          });
        }
        published += 1;
      }
      Ok(published)
    }
  }

  /// Publishes an iterable and, when `complete_on_finish` is set, signals
  /// completion and awaits the whole graph. A fresh cancellation source is
  /// registered with the node so a failure elsewhere stops the publication
  /// between items.
  fn process<I>(
    &self,
    items: I,
    complete_on_finish: bool,
  ) -> impl Future<Output = Result<usize, FlowError>> + Send
  where
    I: IntoIterator<Item = T> + Send,
    I::IntoIter: Send,
    Self: Sized,
  {
    async move {
      let token = CancellationToken::new();
      self.register_cancellation_token(token.clone());
      let published = self.pull_from(items, &token).await?;
      if complete_on_finish {
        self.signal_and_wait().await?;
      }
      Ok(published)
    }
  }

  /// Sequentially publishes several iterables, then optionally signals
  /// completion. Returns the total item count.
  fn process_multiple<I, II>(
    &self,
    inputs: II,
    complete_on_finish: bool,
  ) -> impl Future<Output = Result<usize, FlowError>> + Send
  where
    I: IntoIterator<Item = T> + Send,
    I::IntoIter: Send,
    II: IntoIterator<Item = I> + Send,
    II::IntoIter: Send,
    Self: Sized,
  {
    async move {
      let mut total = 0usize;
      for items in inputs {
        total += self.process(items, false).await?;
      }
      if complete_on_finish {
        self.signal_and_wait().await?;
      }
      Ok(total)
    }
  }

  /// Completes the entry point and awaits the node's completion future.
  fn signal_and_wait(&self) -> impl Future<Output = Result<(), FlowError>> + Send
  where
    Self: Sized,
  {
    async move {
      self.input_endpoint().complete();
      self.completion().await.map_err(|err| (*err).clone())
    }
  }
}

/// Graph node with a typed entry point.
///
/// The wrapped [`Flow`] owns the children; completing this node closes the
/// entry endpoint so completion cascades through the internal graph.
pub struct InputFlow<T> {
  flow: Flow,
  input: InputEndpoint<T>,
}

impl<T> Clone for InputFlow<T> {
  fn clone(&self) -> Self {
    Self {
      flow: self.flow.clone(),
      input: self.input.clone(),
    }
  }
}

impl<T: Send + 'static> InputFlow<T> {
  /// Wraps an already-wired flow and its entry endpoint.
  pub fn new(flow: Flow, input: InputEndpoint<T>) -> Self {
    let entry = input.clone();
    flow.core().set_completer(Box::new(move || entry.complete()));
    Self { flow, input }
  }

  /// Terminal node running `action` for every published item.
  pub fn from_action<F, Fut>(options: FlowOptions, action: F) -> Self
  where
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
  {
    Self::from_action_named(next_default_name("InputFlow"), options, action)
  }

  /// Terminal node with an explicit name.
  pub fn from_action_named<F, Fut>(
    name: impl Into<String>,
    options: FlowOptions,
    action: F,
  ) -> Self
  where
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
  {
    let name = name.into();
    let flow = Flow::named(name.clone(), options.clone());
    let block = ActionBlock::new(
      format!("{name}.action"),
      options.to_execution_block_options(),
      1,
      action,
    );
    flow
      .register_block(block.handle())
      .expect("fresh block cannot collide with an existing child");
    Self::new(flow, block.input().clone())
  }
}

impl<T: Send + 'static> FlowGraph for InputFlow<T> {
  fn core(&self) -> &Arc<FlowCore> {
    self.flow.core()
  }
}

impl<T: Send + 'static> FlowInput<T> for InputFlow<T> {
  fn input_endpoint(&self) -> &InputEndpoint<T> {
    &self.input
  }
}
