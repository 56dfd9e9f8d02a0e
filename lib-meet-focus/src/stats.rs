use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

/// Process-wide counters. Cheap to bump from any thread; snapshotted as JSON
/// for the debug surface.
#[derive(Debug, Default)]
pub struct FocusStats {
  pub conferences_created: AtomicU64,
  pub conferences_ended: AtomicU64,
  pub participants: AtomicU64,
  pub participants_moved: AtomicU64,
  pub participants_requested_restart: AtomicU64,
  pub participants_ice_failed: AtomicU64,
  pub validation_failures: AtomicU64,
  pub bridge_selection_failures: AtomicU64,
}

impl FocusStats {
  pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  pub fn to_json(&self) -> Value {
    json!({
      "conferences_created": self.conferences_created.load(Ordering::Relaxed),
      "conferences_ended": self.conferences_ended.load(Ordering::Relaxed),
      "participants": self.participants.load(Ordering::Relaxed),
      "participants_moved": self.participants_moved.load(Ordering::Relaxed),
      "participants_requested_restart": self.participants_requested_restart.load(Ordering::Relaxed),
      "participants_ice_failed": self.participants_ice_failed.load(Ordering::Relaxed),
      "validation_failures": self.validation_failures.load(Ordering::Relaxed),
      "bridge_selection_failures": self.bridge_selection_failures.load(Ordering::Relaxed),
    })
  }
}
