//! Recorder for output values dropped by the leftover policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::debug;

/// Counts dropped values by type name.
///
/// Attached to every typed-output node;
/// [`link_left_to_null`](crate::IoFlow::link_left_to_null) records each value
/// it discards here so operators can see how much output matched no routing
/// predicate.
#[derive(Clone, Default)]
pub struct GarbageRecorder {
  counts: Arc<StdMutex<HashMap<&'static str, u64>>>,
}

impl GarbageRecorder {
  /// Records one dropped value.
  pub fn record<V>(&self, _value: &V) {
    let type_name = std::any::type_name::<V>();
    let mut guard = self.counts.lock().expect("recorder lock poisoned");
    *guard.entry(type_name).or_insert(0) += 1;
    debug!(value_type = type_name, "output value dropped");
  }

  /// Total number of dropped values.
  pub fn dropped_total(&self) -> u64 {
    self
      .counts
      .lock()
      .expect("recorder lock poisoned")
      .values()
      .sum()
  }

  /// Number of dropped values of type `V`.
  pub fn dropped_of<V>(&self) -> u64 {
    self
      .counts
      .lock()
      .expect("recorder lock poisoned")
      .get(std::any::type_name::<V>())
      .copied()
      .unwrap_or(0)
  }

  /// Per-type counts.
  pub fn snapshot(&self) -> HashMap<String, u64> {
    self
      .counts
      .lock()
      .expect("recorder lock poisoned")
      .iter()
      .map(|(k, v)| (k.to_string(), *v))
      .collect()
  }
}
