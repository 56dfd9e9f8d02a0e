use std::{
  collections::HashMap,
  fmt,
  sync::RwLock,
};

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
  bridge::{Bridge, BridgeStatus},
  config::BridgeConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionError {
  /// No operational, non-draining bridge matched the constraints.
  NoOperationalBridges,
  /// Candidates exist but all are over the stress threshold; the client
  /// should retry later.
  Overloaded,
}

impl fmt::Display for SelectionError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SelectionError::NoOperationalBridges => write!(f, "no operational bridges"),
      SelectionError::Overloaded => write!(f, "all bridges overloaded"),
    }
  }
}

impl std::error::Error for SelectionError {}

/// What the conference already runs on, as input to selection.
#[derive(Debug, Clone, Default)]
pub struct ConferenceBridges {
  /// bridge jid → participants currently on it.
  pub bridges: HashMap<String, usize>,
}

impl ConferenceBridges {
  pub fn contains(&self, jid: &str) -> bool {
    self.bridges.contains_key(jid)
  }
}

/// The process-wide registry of known bridges and the selection policy.
/// Reads are frequent and writes rare; the lock is never held across I/O
/// and no conference code is called under it.
pub struct BridgeSelector {
  config: BridgeConfig,
  bridges: RwLock<HashMap<String, Bridge>>,
}

impl BridgeSelector {
  pub fn new(config: BridgeConfig) -> Self {
    Self {
      config,
      bridges: RwLock::new(HashMap::new()),
    }
  }

  /// Record a bridge discovery or a status refresh.
  pub fn bridge_discovered(&self, jid: &str, status: BridgeStatus) {
    let mut bridges = self.bridges.write().unwrap();
    let bridge = bridges
      .entry(jid.to_owned())
      .or_insert_with(|| {
        info!(bridge = jid, "new bridge discovered");
        Bridge::new(jid)
      });
    bridge.apply_status(status);
  }

  /// Mark a bridge as failed after an RPC fault; it re-enters selection
  /// after the quarantine window unless it fails again.
  pub fn bridge_failed(&self, jid: &str) {
    let mut bridges = self.bridges.write().unwrap();
    if let Some(bridge) = bridges.get_mut(jid) {
      warn!(bridge = jid, "bridge marked non-operational");
      bridge.mark_failed(Instant::now());
    }
  }

  pub fn set_healthy(&self, jid: &str, healthy: bool) {
    let mut bridges = self.bridges.write().unwrap();
    if let Some(bridge) = bridges.get_mut(jid) {
      bridge.set_healthy(healthy);
    }
  }

  pub fn get(&self, jid: &str) -> Option<Bridge> {
    self.bridges.read().unwrap().get(jid).cloned()
  }

  pub fn is_operational(&self, jid: &str) -> bool {
    self
      .get(jid)
      .map(|bridge| bridge.is_operational(Instant::now(), self.config.quarantine()))
      .unwrap_or(false)
  }

  pub fn operational_count(&self) -> usize {
    let now = Instant::now();
    self
      .bridges
      .read()
      .unwrap()
      .values()
      .filter(|bridge| bridge.is_selectable(now, self.config.quarantine()))
      .count()
  }

  /// Pick the best bridge for a new participant.
  #[tracing::instrument(level = "debug", skip(self, conference))]
  pub fn select(
    &self,
    conference: &ConferenceBridges,
    participant_region: Option<&str>,
  ) -> Result<Bridge, SelectionError> {
    let now = Instant::now();
    let candidates: Vec<Bridge> = self
      .bridges
      .read()
      .unwrap()
      .values()
      .filter(|bridge| bridge.is_selectable(now, self.config.quarantine()))
      .cloned()
      .collect();
    let selected = rank_bridges(
      candidates,
      conference,
      participant_region,
      &self.config,
    )?;
    debug!(bridge = selected.jid.as_str(), "selected bridge");
    Ok(selected)
  }

  pub fn to_json(&self) -> Value {
    let now = Instant::now();
    Value::Array(
      self
        .bridges
        .read()
        .unwrap()
        .values()
        .map(|bridge| bridge.to_json(now, self.config.quarantine()))
        .collect(),
    )
  }
}

impl fmt::Debug for BridgeSelector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BridgeSelector")
      .field("bridges", &self.bridges.read().unwrap().len())
      .finish()
  }
}

/// The selection policy, pure given its inputs:
/// 1. exclude bridges on a different major version than the conference,
/// 2. prefer a conference bridge with capacity,
/// 3. prefer the participant's region,
/// 4. break ties by lowest stress, then by jid for determinism.
fn rank_bridges(
  mut candidates: Vec<Bridge>,
  conference: &ConferenceBridges,
  participant_region: Option<&str>,
  config: &BridgeConfig,
) -> Result<Bridge, SelectionError> {
  if config.version_pinning {
    let pinned = conference
      .bridges
      .keys()
      .filter_map(|jid| candidates.iter().find(|b| &b.jid == jid))
      .find_map(|bridge| bridge.major_version());
    if let Some(major) = pinned {
      candidates.retain(|bridge| match bridge.major_version() {
        Some(v) => v == major,
        None => false,
      });
    }
  }

  if candidates.is_empty() {
    return Err(SelectionError::NoOperationalBridges);
  }
  if !candidates
    .iter()
    .any(|bridge| bridge.has_capacity(config.stress_threshold))
  {
    return Err(SelectionError::Overloaded);
  }

  candidates.sort_by(|a, b| {
    let a_in_conf = conference.contains(&a.jid) && a.has_capacity(config.stress_threshold);
    let b_in_conf = conference.contains(&b.jid) && b.has_capacity(config.stress_threshold);
    let a_region = a.region.as_deref() == participant_region && participant_region.is_some();
    let b_region = b.region.as_deref() == participant_region && participant_region.is_some();
    b_in_conf
      .cmp(&a_in_conf)
      .then(b_region.cmp(&a_region))
      .then(a.stress().partial_cmp(&b.stress()).unwrap_or(std::cmp::Ordering::Equal))
      .then_with(|| a.jid.cmp(&b.jid))
  });

  Ok(candidates.into_iter().next().unwrap())
}

#[cfg(test)]
mod tests {
  use maplit::hashmap;

  use super::*;

  fn bridge(jid: &str, region: Option<&str>, version: &str, stress: f64) -> BridgeStatus {
    BridgeStatus {
      region: region.map(str::to_owned),
      version: Some(version.to_owned()),
      relay_id: Some(format!("relay-{}", jid)),
      stress,
      packet_rate: 0,
      draining: false,
      graceful_shutdown: false,
      healthy: true,
    }
  }

  fn selector() -> BridgeSelector {
    BridgeSelector::new(BridgeConfig::default())
  }

  #[tokio::test]
  async fn selects_lowest_stress_when_nothing_else_differs() {
    let selector = selector();
    selector.bridge_discovered("jvb1", bridge("jvb1", None, "2.1", 0.5));
    selector.bridge_discovered("jvb2", bridge("jvb2", None, "2.1", 0.1));
    let selected = selector
      .select(&ConferenceBridges::default(), None)
      .unwrap();
    assert_eq!(selected.jid, "jvb2");
  }

  #[tokio::test]
  async fn prefers_participant_region() {
    let selector = selector();
    selector.bridge_discovered("jvb1", bridge("jvb1", Some("eu-west"), "2.1", 0.5));
    selector.bridge_discovered("jvb2", bridge("jvb2", Some("us-east"), "2.1", 0.1));
    let selected = selector
      .select(&ConferenceBridges::default(), Some("eu-west"))
      .unwrap();
    assert_eq!(selected.jid, "jvb1");
  }

  #[tokio::test]
  async fn prefers_a_conference_bridge_with_capacity_over_region() {
    let selector = selector();
    selector.bridge_discovered("jvb1", bridge("jvb1", Some("eu-west"), "2.1", 0.2));
    selector.bridge_discovered("jvb2", bridge("jvb2", Some("us-east"), "2.1", 0.5));
    let conference = ConferenceBridges {
      bridges: hashmap! { "jvb2".to_owned() => 3 },
    };
    let selected = selector.select(&conference, Some("eu-west")).unwrap();
    assert_eq!(selected.jid, "jvb2");
  }

  #[tokio::test]
  async fn version_pinning_excludes_other_majors() {
    let selector = selector();
    selector.bridge_discovered("jvb1", bridge("jvb1", None, "2.1", 0.9));
    selector.bridge_discovered("jvb2", bridge("jvb2", None, "3.0", 0.1));
    let conference = ConferenceBridges {
      bridges: hashmap! { "jvb1".to_owned() => 1 },
    };
    // jvb1 is over stress but jvb2 is on another major: overloaded, not moved.
    assert_eq!(
      selector.select(&conference, None),
      Err(SelectionError::Overloaded)
    );
  }

  #[tokio::test]
  async fn draining_bridges_are_not_candidates() {
    let selector = selector();
    let mut status = bridge("jvb1", None, "2.1", 0.1);
    status.draining = true;
    selector.bridge_discovered("jvb1", status);
    assert_eq!(
      selector.select(&ConferenceBridges::default(), None),
      Err(SelectionError::NoOperationalBridges)
    );
  }

  #[tokio::test]
  async fn failed_bridges_are_not_candidates() {
    let selector = selector();
    selector.bridge_discovered("jvb1", bridge("jvb1", None, "2.1", 0.1));
    selector.bridge_failed("jvb1");
    assert_eq!(
      selector.select(&ConferenceBridges::default(), None),
      Err(SelectionError::NoOperationalBridges)
    );
  }

  #[tokio::test]
  async fn overloaded_when_all_over_threshold() {
    let selector = selector();
    selector.bridge_discovered("jvb1", bridge("jvb1", None, "2.1", 0.95));
    selector.bridge_discovered("jvb2", bridge("jvb2", None, "2.1", 0.85));
    assert_eq!(
      selector.select(&ConferenceBridges::default(), None),
      Err(SelectionError::Overloaded)
    );
  }
}
