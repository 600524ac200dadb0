//! Child and external-dependency wrappers aggregated by a graph node.
//!
//! A dependency is either a primitive block or another graph node. The node
//! only ever talks to the uniform [`Dependency`] surface: completion, buffer
//! status, fault injection, and input-close signalling.

use crate::block::BlockHandle;
use crate::completion::{Completion, CompletionResult};
use crate::error::FlowError;
use crate::flow::FlowCore;
use std::sync::Arc;

/// Callback invoked with a dependency's completion result.
pub type CompletionCallback = Box<dyn Fn(&CompletionResult) + Send + Sync>;

/// Where a dependency sits relative to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
  /// Registered child inside the owner's graph.
  Child,
  /// External dependency driving the owner's completion from outside.
  External,
}

/// Optional settings for a child registration.
#[derive(Default)]
pub struct ChildOptions {
  /// Display name used in logs; defaults to the child's own name.
  pub display_name: Option<String>,
  /// Silently accept a second registration of the same child.
  pub allow_duplicate: bool,
  /// Invoked once with the child's completion result.
  pub on_complete: Option<CompletionCallback>,
}

impl ChildOptions {
  /// Sets the display name.
  #[must_use]
  pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
    self.display_name = Some(name.into());
    self
  }

  /// Allows registering the same child twice.
  #[must_use]
  pub fn with_allow_duplicate(mut self, allow: bool) -> Self {
    self.allow_duplicate = allow;
    self
  }

  /// Sets the completion callback.
  #[must_use]
  pub fn with_on_complete<F>(mut self, callback: F) -> Self
  where
    F: Fn(&CompletionResult) + Send + Sync + 'static,
  {
    self.on_complete = Some(Box::new(callback));
    self
  }
}

pub(crate) enum DependencyTarget {
  Block(BlockHandle),
  Graph(Arc<FlowCore>),
}

/// A block or graph node participating in an owner's completion.
pub struct Dependency {
  target: DependencyTarget,
  kind: DependencyKind,
  display_name: String,
  on_complete: Option<CompletionCallback>,
}

impl Dependency {
  pub(crate) fn from_block(
    handle: BlockHandle,
    kind: DependencyKind,
    display_name: Option<String>,
    on_complete: Option<CompletionCallback>,
  ) -> Self {
    let display_name = display_name.unwrap_or_else(|| handle.name().to_string());
    Self {
      target: DependencyTarget::Block(handle),
      kind,
      display_name,
      on_complete,
    }
  }

  pub(crate) fn from_graph(
    core: Arc<FlowCore>,
    kind: DependencyKind,
    display_name: Option<String>,
    on_complete: Option<CompletionCallback>,
  ) -> Self {
    let display_name = display_name.unwrap_or_else(|| core.name().to_string());
    Self {
      target: DependencyTarget::Graph(core),
      kind,
      display_name,
      on_complete,
    }
  }

  /// Child or external.
  pub fn kind(&self) -> DependencyKind {
    self.kind
  }

  /// Name used in logs.
  pub fn display_name(&self) -> &str {
    &self.display_name
  }

  /// Completion future of the wrapped block or graph.
  pub fn completion(&self) -> Completion {
    match &self.target {
      DependencyTarget::Block(handle) => handle.completion(),
      DependencyTarget::Graph(core) => core.completion(),
    }
  }

  /// True once the wrapped unit has settled.
  pub fn is_completed(&self) -> bool {
    self.completion().is_resolved()
  }

  /// `(input, output)` queue depths, recursive for graph dependencies.
  pub fn buffer_status(&self) -> (usize, usize) {
    match &self.target {
      DependencyTarget::Block(handle) => handle.buffer_status(),
      DependencyTarget::Graph(core) => core.buffer_status(),
    }
  }

  /// Sends an already-normalised fault downward.
  pub(crate) fn fault(&self, err: Arc<FlowError>) {
    match &self.target {
      DependencyTarget::Block(handle) => handle.fault(err),
      DependencyTarget::Graph(core) => core.fault(err),
    }
  }

  /// Signals the wrapped unit's input closed.
  pub(crate) fn complete(&self) {
    match &self.target {
      DependencyTarget::Block(handle) => handle.complete(),
      DependencyTarget::Graph(core) => core.complete(),
    }
  }

  /// Referential identity of the wrapped unit, used for dedup and cycle
  /// checks.
  pub(crate) fn id(&self) -> usize {
    match &self.target {
      DependencyTarget::Block(handle) => handle.id(),
      DependencyTarget::Graph(core) => Arc::as_ptr(core) as usize,
    }
  }

  pub(crate) fn graph_core(&self) -> Option<&Arc<FlowCore>> {
    match &self.target {
      DependencyTarget::Graph(core) => Some(core),
      DependencyTarget::Block(_) => None,
    }
  }

  pub(crate) fn notify_completion(&self, result: &CompletionResult) {
    if let Some(callback) = &self.on_complete {
      callback(result);
    }
  }
}
