//! Error taxonomy for dataflow graphs.
//!
//! Errors fall into three families:
//!
//! - **Topology errors** are returned synchronously from wiring calls
//!   (duplicate child, cycle, linking after the predicate list froze).
//! - **Propagated errors** travel downward through [`fault`](crate::FlowGraph::fault)
//!   while a graph is running. They are normalised at the faulting node so that
//!   descendants see a sibling/linked variant rather than an ever-growing chain
//!   of unrelated causes; the original error is retained only at the
//!   originating node's completion future.
//! - **Terminal errors** surface through a node's completion future, wrapped in
//!   [`FlowError::Aggregate`] carrying exactly one inner error.

use std::sync::Arc;
use thiserror::Error;

/// Error type for all dataflow operations.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
  /// No child was registered within one monitor interval of observing completion.
  #[error("dataflow '{flow}' has no child registered")]
  NoChildRegistered {
    /// Name of the childless flow.
    flow: String,
  },

  /// The same block or graph was registered twice without `allow_duplicate`.
  #[error("'{child}' is already a child of dataflow '{flow}'")]
  DuplicateChild {
    /// Name of the flow the registration targeted.
    flow: String,
    /// Display name of the rejected child.
    child: String,
  },

  /// Registering the child would create a cycle in the parent/child relation.
  #[error("registering '{child}' as a child of '{flow}' would form a cycle")]
  CycleNotAllowed {
    /// Name of the flow the registration targeted.
    flow: String,
    /// Name of the rejected child graph.
    child: String,
  },

  /// An existing child was registered as an external dependency.
  #[error("'{child}' is a child of '{flow}' and cannot also be an external dependency")]
  ChildAsDependency {
    /// Name of the flow the registration targeted.
    flow: String,
    /// Display name of the rejected dependency.
    child: String,
  },

  /// A link was added after a leftover policy froze the predicate list.
  #[error("predicate list of dataflow '{flow}' is frozen; no further links can be added")]
  PredicatesFrozen {
    /// Name of the flow whose predicate list is frozen.
    flow: String,
  },

  /// A sibling unit inside the same parent failed.
  #[error("sibling unit in dataflow '{origin}' failed")]
  SiblingFailed {
    /// Name of the node that propagated the fault.
    origin: String,
  },

  /// A sibling unit inside the same parent was canceled.
  #[error("sibling unit in dataflow '{origin}' was canceled")]
  SiblingCanceled {
    /// Name of the node that propagated the fault.
    origin: String,
  },

  /// A linked upstream or dependent dataflow failed.
  #[error("dataflow '{linked}' linked to '{flow}' failed")]
  LinkedFlowFailed {
    /// Name of the faulted flow.
    flow: String,
    /// Name of the linked flow that failed.
    linked: String,
  },

  /// A linked upstream or dependent dataflow was canceled.
  #[error("dataflow '{linked}' linked to '{flow}' was canceled")]
  LinkedFlowCanceled {
    /// Name of the faulted flow.
    flow: String,
    /// Name of the linked flow that was canceled.
    linked: String,
  },

  /// An output value reached the leftover error sink.
  #[error("dataflow '{flow}' received data matching no routing predicate")]
  InvalidData {
    /// Name of the flow that rejected the value.
    flow: String,
  },

  /// The operation was canceled.
  #[error("operation canceled")]
  Canceled,

  /// Publication to an endpoint whose queue has been completed or torn down.
  #[error("input endpoint '{endpoint}' is closed")]
  EndpointClosed {
    /// Display name of the closed endpoint.
    endpoint: String,
  },

  /// Iterator publication stopped before the iterator was exhausted.
  #[error("publication into '{flow}' stopped after {published} item(s): {inner}")]
  PullInterrupted {
    /// Name of the flow being published to.
    flow: String,
    /// Number of items published before the stop.
    published: usize,
    /// The error that interrupted the publication.
    inner: Arc<FlowError>,
  },

  /// Store-side failure inside the bulk sink.
  #[error("store operation in dataflow '{flow}' failed: {inner}")]
  Store {
    /// Name of the sink that hit the store error.
    flow: String,
    /// The underlying store error.
    inner: Arc<dyn std::error::Error + Send + Sync>,
  },

  /// Aggregate wrapper resolved into a completion future; carries one inner error.
  #[error("dataflow '{flow}' failed: {inner}")]
  Aggregate {
    /// Name of the failed flow.
    flow: String,
    /// The single inner error the aggregate carries.
    inner: Arc<FlowError>,
  },
}

impl FlowError {
  /// Returns true for the propagated family, which passes through `fault`
  /// unchanged instead of being re-normalised at every level.
  pub fn is_propagated(&self) -> bool {
    matches!(
      self,
      FlowError::SiblingFailed { .. }
        | FlowError::SiblingCanceled { .. }
        | FlowError::LinkedFlowFailed { .. }
        | FlowError::LinkedFlowCanceled { .. }
    )
  }

  /// Returns true if this error, or the error an aggregate wraps, represents
  /// cancellation rather than failure.
  pub fn is_cancellation(&self) -> bool {
    match self {
      FlowError::Canceled
      | FlowError::SiblingCanceled { .. }
      | FlowError::LinkedFlowCanceled { .. } => true,
      FlowError::Aggregate { inner, .. } | FlowError::PullInterrupted { inner, .. } => {
        inner.is_cancellation()
      }
      _ => false,
    }
  }

  /// Unwraps aggregate layers down to the originating error.
  pub fn innermost(&self) -> &FlowError {
    match self {
      FlowError::Aggregate { inner, .. } | FlowError::PullInterrupted { inner, .. } => {
        inner.innermost()
      }
      other => other,
    }
  }

  /// Normalises an error for delivery to the descendants of `origin`.
  ///
  /// Propagated variants pass through unchanged; cancellation becomes
  /// [`FlowError::SiblingCanceled`]; everything else becomes
  /// [`FlowError::SiblingFailed`].
  pub(crate) fn normalised_for_descendants(err: &Arc<FlowError>, origin: &str) -> Arc<FlowError> {
    if err.is_propagated() {
      return err.clone();
    }
    if err.is_cancellation() {
      Arc::new(FlowError::SiblingCanceled {
        origin: origin.to_string(),
      })
    } else {
      Arc::new(FlowError::SiblingFailed {
        origin: origin.to_string(),
      })
    }
  }
}
