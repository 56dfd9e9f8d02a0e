use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

/// Load and topology signals a bridge advertises about itself.
#[derive(Debug, Clone, Default)]
pub struct BridgeStatus {
  pub region: Option<String>,
  pub version: Option<String>,
  pub relay_id: Option<String>,
  pub stress: f64,
  pub packet_rate: u64,
  pub draining: bool,
  pub graceful_shutdown: bool,
  pub healthy: bool,
}

/// One known media bridge. Created on first discovery and never deleted;
/// health and load transitions re-enable or disable selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Bridge {
  pub jid: String,
  pub region: Option<String>,
  pub version: Option<String>,
  pub relay_id: Option<String>,
  stress: f64,
  packet_rate: u64,
  draining: bool,
  graceful_shutdown: bool,
  healthy: bool,
  last_failure: Option<Instant>,
}

impl Bridge {
  pub fn new(jid: impl Into<String>) -> Self {
    Self {
      jid: jid.into(),
      region: None,
      version: None,
      relay_id: None,
      stress: 0.0,
      packet_rate: 0,
      draining: false,
      graceful_shutdown: false,
      healthy: true,
      last_failure: None,
    }
  }

  pub fn apply_status(&mut self, status: BridgeStatus) {
    self.region = status.region.or_else(|| self.region.take());
    self.version = status.version.or_else(|| self.version.take());
    self.relay_id = status.relay_id.or_else(|| self.relay_id.take());
    self.stress = status.stress;
    self.packet_rate = status.packet_rate;
    self.draining = status.draining;
    self.graceful_shutdown = status.graceful_shutdown;
    self.healthy = status.healthy;
  }

  /// Record an observed failure; the bridge leaves selection until the
  /// quarantine window passes without a new failure.
  pub fn mark_failed(&mut self, now: Instant) {
    self.last_failure = Some(now);
  }

  pub fn set_healthy(&mut self, healthy: bool) {
    self.healthy = healthy;
    if healthy {
      self.last_failure = None;
    }
  }

  pub fn is_operational(&self, now: Instant, quarantine: Duration) -> bool {
    if !self.healthy {
      return false;
    }
    match self.last_failure {
      Some(failed_at) => now.duration_since(failed_at) >= quarantine,
      None => true,
    }
  }

  pub fn is_selectable(&self, now: Instant, quarantine: Duration) -> bool {
    self.is_operational(now, quarantine) && !self.draining && !self.graceful_shutdown
  }

  pub fn stress(&self) -> f64 {
    self.stress
  }

  pub fn is_draining(&self) -> bool {
    self.draining
  }

  pub fn has_capacity(&self, stress_threshold: f64) -> bool {
    self.stress < stress_threshold
  }

  /// Leading component of the advertised version, e.g. `2` for `2.3.17-g1a2b`.
  pub fn major_version(&self) -> Option<u64> {
    let version = self.version.as_deref()?;
    let digits: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
  }

  pub fn to_json(&self, now: Instant, quarantine: Duration) -> Value {
    json!({
      "jid": self.jid,
      "region": self.region,
      "version": self.version,
      "relay_id": self.relay_id,
      "stress": self.stress,
      "packet_rate": self.packet_rate,
      "draining": self.draining,
      "graceful_shutdown": self.graceful_shutdown,
      "operational": self.is_operational(now, quarantine),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const QUARANTINE: Duration = Duration::from_secs(60);

  #[tokio::test(start_paused = true)]
  async fn failed_bridge_recovers_after_quarantine() {
    let mut bridge = Bridge::new("jvb1.example.com");
    assert!(bridge.is_operational(Instant::now(), QUARANTINE));
    bridge.mark_failed(Instant::now());
    assert!(!bridge.is_operational(Instant::now(), QUARANTINE));
    tokio::time::advance(QUARANTINE).await;
    assert!(bridge.is_operational(Instant::now(), QUARANTINE));
  }

  #[tokio::test(start_paused = true)]
  async fn refailing_extends_the_quarantine() {
    let mut bridge = Bridge::new("jvb1.example.com");
    bridge.mark_failed(Instant::now());
    tokio::time::advance(Duration::from_secs(30)).await;
    bridge.mark_failed(Instant::now());
    tokio::time::advance(Duration::from_secs(45)).await;
    assert!(!bridge.is_operational(Instant::now(), QUARANTINE));
  }

  #[tokio::test(start_paused = true)]
  async fn healthy_signal_clears_failure_state() {
    let mut bridge = Bridge::new("jvb1.example.com");
    bridge.mark_failed(Instant::now());
    bridge.set_healthy(true);
    assert!(bridge.is_operational(Instant::now(), QUARANTINE));
  }

  #[test]
  fn major_version_parses_leading_digits() {
    let mut bridge = Bridge::new("jvb1.example.com");
    bridge.version = Some("2.3.17-g1a2b3c".to_owned());
    assert_eq!(bridge.major_version(), Some(2));
    bridge.version = Some("nightly".to_owned());
    assert_eq!(bridge.major_version(), None);
  }
}
