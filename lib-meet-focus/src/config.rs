use std::time::Duration;

use serde::Deserialize;

/// Focus-wide configuration, read once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FocusConfig {
  /// Hold off invites until this many non-focus members are in the room.
  pub min_participants: usize,
  /// Grant ownership to the longest-present eligible member when the room
  /// has no owner.
  pub enable_auto_owner: bool,
  pub restart: RestartConfig,
  /// Batching delay curve for source signaling: `(participant_count,
  /// delay_ms)` steps, nondecreasing in both components.
  pub source_signaling_delays: Vec<DelayStep>,
  /// Let the bridge rewrite ssrcs and own source signaling for endpoints
  /// that support it.
  pub use_ssrc_rewriting: bool,
  /// Encode signaled sources as JSON for endpoints that support it.
  pub use_json_encoded_sources: bool,
  /// Strip SIM groups (and their dependent flows) from signaled sources.
  pub strip_simulcast: bool,
  pub bridge: BridgeConfig,
  /// Deadline for outbound IQs, in milliseconds.
  pub iq_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DelayStep {
  pub participants: usize,
  pub delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestartConfig {
  /// Minimum spacing between honored restart requests, in milliseconds.
  pub min_interval_ms: u64,
  /// Maximum honored restart requests per window.
  pub max_requests: usize,
  /// Sliding window over which `max_requests` applies, in milliseconds.
  pub window_ms: u64,
}

impl RestartConfig {
  pub fn min_interval(&self) -> Duration {
    Duration::from_millis(self.min_interval_ms)
  }

  pub fn window(&self) -> Duration {
    Duration::from_millis(self.window_ms)
  }
}

impl Default for RestartConfig {
  fn default() -> Self {
    Self {
      min_interval_ms: 10_000,
      max_requests: 3,
      window_ms: 300_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
  /// Forbid mixing bridge major versions within one conference.
  pub version_pinning: bool,
  /// How long a failed bridge stays out of selection before auto-recovery,
  /// in milliseconds.
  pub quarantine_ms: u64,
  /// Bridges at or above this stress level are not preferred and, when all
  /// candidates are above it, selection reports Overloaded.
  pub stress_threshold: f64,
  /// Deadline for bridge RPCs, in milliseconds.
  pub rpc_timeout_ms: u64,
}

impl BridgeConfig {
  pub fn quarantine(&self) -> Duration {
    Duration::from_millis(self.quarantine_ms)
  }

  pub fn rpc_timeout(&self) -> Duration {
    Duration::from_millis(self.rpc_timeout_ms)
  }
}

impl Default for BridgeConfig {
  fn default() -> Self {
    Self {
      version_pinning: true,
      quarantine_ms: 60_000,
      stress_threshold: 0.8,
      rpc_timeout_ms: 7_000,
    }
  }
}

impl FocusConfig {
  /// Larger conferences batch source signaling harder. The curve is
  /// evaluated as the last step at or below the given participant count.
  pub fn source_signaling_delay(&self, participant_count: usize) -> Duration {
    let mut delay = 0;
    for step in &self.source_signaling_delays {
      if participant_count >= step.participants {
        delay = delay.max(step.delay_ms);
      }
    }
    Duration::from_millis(delay)
  }

  pub fn iq_timeout(&self) -> Duration {
    Duration::from_millis(self.iq_timeout_ms)
  }
}

impl Default for FocusConfig {
  fn default() -> Self {
    Self {
      min_participants: 2,
      enable_auto_owner: true,
      restart: RestartConfig::default(),
      source_signaling_delays: vec![
        DelayStep {
          participants: 30,
          delay_ms: 500,
        },
        DelayStep {
          participants: 50,
          delay_ms: 1_000,
        },
        DelayStep {
          participants: 100,
          delay_ms: 2_000,
        },
      ],
      use_ssrc_rewriting: false,
      use_json_encoded_sources: false,
      strip_simulcast: true,
      bridge: BridgeConfig::default(),
      iq_timeout_ms: 5_000,
    }
  }
}
