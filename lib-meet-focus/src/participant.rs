use std::collections::{BTreeSet, VecDeque};

use serde_json::{json, Value};
use tokio::{task::JoinHandle, time::Instant};

use crate::{
  chatroom::{Capability, ChatRoomMember, MemberRole},
  config::{FocusConfig, RestartConfig},
  jingle::{JingleSession, SessionState},
  signaling::{SourceFilter, SourceSignaling},
  source::MediaType,
};

/// Token-bucket style limiter for restart requests: a minimum spacing
/// between honored requests plus a cap per sliding window.
#[derive(Debug)]
pub struct RateLimiter {
  config: RestartConfig,
  accepted: VecDeque<Instant>,
}

impl RateLimiter {
  pub fn new(config: RestartConfig) -> Self {
    Self {
      config,
      accepted: VecDeque::new(),
    }
  }

  pub fn accept(&mut self) -> bool {
    self.accept_at(Instant::now())
  }

  fn accept_at(&mut self, now: Instant) -> bool {
    let window = self.config.window();
    while let Some(oldest) = self.accepted.front() {
      if now.duration_since(*oldest) >= window {
        self.accepted.pop_front();
      }
      else {
        break;
      }
    }
    if let Some(last) = self.accepted.back() {
      if now.duration_since(*last) < self.config.min_interval() {
        return false;
      }
    }
    if self.accepted.len() >= self.config.max_requests {
      return false;
    }
    self.accepted.push_back(now);
    true
  }
}

/// The focus's model of one endpoint in the conference. Owned by exactly one
/// Conference; every mutation happens under that conference's lock.
#[derive(Debug)]
pub struct Participant {
  member: ChatRoomMember,
  created_at: Instant,
  session: Option<JingleSession>,
  pub(crate) signaling: SourceSignaling,
  restart_limiter: RateLimiter,
  /// Bumped on every (re)invite; lets a superseded invite task detect that
  /// it lost the race before committing anything.
  pub(crate) invite_generation: u64,
  pub(crate) invite_task: Option<JoinHandle<()>>,
  /// A source-update flush is already scheduled for this participant.
  pub(crate) flush_scheduled: bool,
  /// The bridge this participant's channels live on, if any.
  pub(crate) bridge: Option<String>,
  /// The colibri session id the last offer was built from.
  pub(crate) bridge_session_id: Option<String>,
}

impl Participant {
  pub fn new(member: ChatRoomMember, config: &FocusConfig) -> Self {
    let filter = Self::source_filter(&member, config);
    Self {
      member,
      created_at: Instant::now(),
      session: None,
      signaling: SourceSignaling::new(filter),
      restart_limiter: RateLimiter::new(config.restart.clone()),
      invite_generation: 0,
      invite_task: None,
      flush_scheduled: false,
      bridge: None,
      bridge_session_id: None,
    }
  }

  fn source_filter(member: &ChatRoomMember, config: &FocusConfig) -> SourceFilter {
    let mut media_types = BTreeSet::new();
    if member.capabilities.is_empty() || member.supports(Capability::Audio) {
      media_types.insert(MediaType::Audio);
    }
    if member.capabilities.is_empty() || member.supports(Capability::Video) {
      media_types.insert(MediaType::Video);
    }
    let bridge_authoritative =
      config.use_ssrc_rewriting && member.supports(Capability::SsrcRewriting);
    SourceFilter::new(media_types, config.strip_simulcast, bridge_authoritative)
  }

  pub fn endpoint_id(&self) -> &str {
    &self.member.endpoint_id
  }

  pub fn member(&self) -> &ChatRoomMember {
    &self.member
  }

  pub fn created_at(&self) -> Instant {
    self.created_at
  }

  /// Refresh the last-known presence summary.
  pub fn update_member(&mut self, member: ChatRoomMember) {
    self.member = member;
  }

  pub fn role(&self) -> MemberRole {
    self.member.role
  }

  pub fn is_visitor(&self) -> bool {
    self.member.is_visitor || self.member.role == MemberRole::Visitor
  }

  pub fn supports(&self, capability: Capability) -> bool {
    self.member.supports(capability)
  }

  /// The media this participant negotiates, from its advertised
  /// capabilities; endpoints that advertise nothing get both.
  pub fn offered_media(&self) -> Vec<MediaType> {
    let mut media = Vec::with_capacity(2);
    if self.member.capabilities.is_empty() || self.supports(Capability::Audio) {
      media.push(MediaType::Audio);
    }
    if self.member.capabilities.is_empty() || self.supports(Capability::Video) {
      media.push(MediaType::Video);
    }
    media
  }

  pub fn uses_json_sources(&self, config: &FocusConfig) -> bool {
    config.use_json_encoded_sources && self.supports(Capability::JsonSources)
  }

  pub fn session(&self) -> Option<&JingleSession> {
    self.session.as_ref()
  }

  pub fn session_mut(&mut self) -> Option<&mut JingleSession> {
    self.session.as_mut()
  }

  pub fn has_live_session(&self) -> bool {
    self
      .session
      .as_ref()
      .map(|s| s.state() != SessionState::Ended)
      .unwrap_or(false)
  }

  pub fn is_session_active(&self) -> bool {
    self.session.as_ref().map(JingleSession::is_active).unwrap_or(false)
  }

  /// Replace the current session (ending it internally) with a fresh one.
  pub fn replace_session(&mut self, session: JingleSession) {
    if let Some(old) = self.session.as_mut() {
      old.end();
    }
    self.session = Some(session);
  }

  pub fn end_session(&mut self) -> Option<JingleSession> {
    if let Some(session) = self.session.as_mut() {
      session.end();
    }
    self.session.take()
  }

  /// The single gate for honoring a restart request.
  pub fn accept_restart_request(&mut self) -> bool {
    self.restart_limiter.accept()
  }

  /// True while an invite task is running for this participant.
  pub fn has_inflight_invite(&self) -> bool {
    self
      .invite_task
      .as_ref()
      .map(|task| !task.is_finished())
      .unwrap_or(false)
  }

  pub fn abort_invite(&mut self) {
    if let Some(task) = self.invite_task.take() {
      task.abort();
    }
  }

  pub fn to_json(&self) -> Value {
    json!({
      "endpoint_id": self.member.endpoint_id,
      "muc_jid": self.member.muc_jid.to_string(),
      "role": serde_json::to_value(self.member.role).unwrap_or(Value::Null),
      "region": self.member.region,
      "stats_id": self.member.stats_id,
      "visitor": self.is_visitor(),
      "bridge": self.bridge,
      "session_state": self.session.as_ref().map(|s| format!("{:?}", s.state())),
      "sources": self.signaling.to_json(),
    })
  }
}
