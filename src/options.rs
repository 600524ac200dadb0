//! Configuration for dataflow graphs and their primitive blocks.
//!
//! [`FlowOptions`] is attached to every graph node and controls queue bounds
//! and the periodic buffer monitor. Block constructors receive the narrower
//! [`BlockOptions`] projection.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of in-flight items a graph allows per primitive block.
pub const DEFAULT_BOUNDED_CAPACITY: usize = 100_000;

/// Default interval for the buffer monitor and for the no-child grace period.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Whether the monitor logs zero-valued buffer statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MonitorMode {
  /// Only non-zero buffer statuses are logged.
  #[default]
  Default,
  /// Zero-valued statuses are logged as well.
  Verbose,
}

/// Options applied to a graph node and projected onto its blocks.
#[derive(Debug, Clone)]
pub struct FlowOptions {
  /// Maximum in-flight items for each primitive block. `None` means the
  /// queues are unbounded.
  pub bounded_capacity: Option<usize>,
  /// Emit this node's aggregate buffer status every monitor interval.
  pub flow_monitor: bool,
  /// Emit every child's buffer status every monitor interval.
  pub block_monitor: bool,
  /// Whether zero-valued statuses are logged.
  pub monitor_mode: MonitorMode,
  /// Period of the buffer monitor; also the grace period a childless node is
  /// given before its completion fails.
  pub monitor_interval: Duration,
}

impl Default for FlowOptions {
  fn default() -> Self {
    Self {
      bounded_capacity: Some(DEFAULT_BOUNDED_CAPACITY),
      flow_monitor: true,
      block_monitor: false,
      monitor_mode: MonitorMode::Default,
      monitor_interval: DEFAULT_MONITOR_INTERVAL,
    }
  }
}

impl FlowOptions {
  /// Preset with both monitors enabled and zero statuses logged.
  #[must_use]
  pub fn verbose() -> Self {
    Self {
      flow_monitor: true,
      block_monitor: true,
      monitor_mode: MonitorMode::Verbose,
      ..Self::default()
    }
  }

  /// Sets the per-block in-flight bound. `None` disables bounding.
  #[must_use]
  pub fn with_bounded_capacity(mut self, capacity: Option<usize>) -> Self {
    self.bounded_capacity = capacity;
    self
  }

  /// Enables or disables the aggregate buffer monitor.
  #[must_use]
  pub fn with_flow_monitor(mut self, enabled: bool) -> Self {
    self.flow_monitor = enabled;
    self
  }

  /// Enables or disables the per-child buffer monitor.
  #[must_use]
  pub fn with_block_monitor(mut self, enabled: bool) -> Self {
    self.block_monitor = enabled;
    self
  }

  /// Sets whether zero-valued statuses are logged.
  #[must_use]
  pub fn with_monitor_mode(mut self, mode: MonitorMode) -> Self {
    self.monitor_mode = mode;
    self
  }

  /// Sets the monitor interval.
  #[must_use]
  pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
    self.monitor_interval = interval;
    self
  }

  /// Projection for grouping blocks (batchers).
  #[must_use]
  pub fn to_grouping_block_options(&self) -> BlockOptions {
    BlockOptions {
      bounded_capacity: self.bounded_capacity,
    }
  }

  /// Projection for execution blocks (actions and transforms).
  #[must_use]
  pub fn to_execution_block_options(&self) -> BlockOptions {
    BlockOptions {
      bounded_capacity: self.bounded_capacity,
    }
  }
}

/// Options for a single primitive block.
#[derive(Debug, Clone, Default)]
pub struct BlockOptions {
  /// Maximum queued items before publishers are backpressured. `None` means
  /// unbounded.
  pub bounded_capacity: Option<usize>,
}

impl BlockOptions {
  /// Sets the queue bound. `None` disables bounding.
  #[must_use]
  pub fn with_bounded_capacity(mut self, capacity: Option<usize>) -> Self {
    self.bounded_capacity = capacity;
    self
  }
}
