//! One-shot, multi-observer completion futures.
//!
//! Every block and every graph node owns exactly one [`CompletionPromise`] and
//! hands out cloneable [`Completion`] futures. The promise resolves at most
//! once; dropping it unresolved resolves the future as canceled, so a worker
//! that panics or is aborted still settles its observers.

use crate::error::FlowError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Result a completion future resolves to. Shared between observers, so the
/// error is reference-counted.
pub type CompletionResult = Result<(), Arc<FlowError>>;

/// Cloneable future that resolves exactly once with the owner's outcome.
#[derive(Clone)]
pub struct Completion {
  inner: Shared<BoxFuture<'static, CompletionResult>>,
}

impl Completion {
  /// Returns the resolved result without awaiting, if the owner has settled.
  pub fn peek(&self) -> Option<&CompletionResult> {
    self.inner.peek()
  }

  /// Returns true once the owner has settled, successfully or not.
  pub fn is_resolved(&self) -> bool {
    self.peek().is_some()
  }
}

impl Future for Completion {
  type Output = CompletionResult;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.inner).poll(cx)
  }
}

/// Resolving side of a completion pair.
pub struct CompletionPromise {
  tx: Option<oneshot::Sender<CompletionResult>>,
}

impl CompletionPromise {
  /// Resolves the paired [`Completion`]. Consumes the promise; the result is
  /// final.
  pub fn resolve(mut self, result: CompletionResult) {
    if let Some(tx) = self.tx.take() {
      let _ = tx.send(result);
    }
  }
}

impl Drop for CompletionPromise {
  fn drop(&mut self) {
    if let Some(tx) = self.tx.take() {
      let _ = tx.send(Err(Arc::new(FlowError::Canceled)));
    }
  }
}

/// Creates a linked promise/future pair.
pub fn completion_pair() -> (CompletionPromise, Completion) {
  let (tx, rx) = oneshot::channel();
  let fut = async move {
    match rx.await {
      Ok(result) => result,
      // The sender was leaked without resolving; treat as cancellation.
      Err(_) => Err(Arc::new(FlowError::Canceled)),
    }
  }
  .boxed()
  .shared();
  (CompletionPromise { tx: Some(tx) }, Completion { inner: fut })
}
