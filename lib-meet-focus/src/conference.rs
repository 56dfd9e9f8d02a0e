use std::{
  collections::{HashMap, HashSet},
  fmt,
  sync::Arc,
};

use anyhow::Result;
use jid::{BareJid, FullJid};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
  chatroom::{
    Capability, ChatRoom, ChatRoomEvent, ChatRoomMember, MemberRole, PresenceExtension, RoomConfig,
  },
  colibri::{AllocationRequest, BridgeRpc, ColibriFault, ColibriSession, EndpointUpdate},
  config::FocusConfig,
  events::{ConferenceEvent, EventEmitter},
  jingle::{
    JingleAddr, JingleSender, JingleSession, Offer, OutboundJingle, RequestError, TerminateReason,
  },
  participant::Participant,
  selector::{BridgeSelector, ConferenceBridges},
  signaling::SourceUpdate,
  source::{ConferenceSourceMap, EndpointSourceSet, MediaType, Source, SsrcGroup},
  stats::FocusStats,
};

#[derive(Debug, Default)]
struct AvModerationState {
  enabled: bool,
  /// Canonicalized member identities allowed to unmute; see
  /// `ChatRoomMember::moderation_id`.
  whitelist: HashSet<String>,
}

#[derive(Debug, Default)]
struct AvModeration {
  audio: AvModerationState,
  video: AvModerationState,
}

impl AvModeration {
  fn state(&self, media_type: MediaType) -> &AvModerationState {
    match media_type {
      MediaType::Audio => &self.audio,
      MediaType::Video => &self.video,
    }
  }

  fn state_mut(&mut self, media_type: MediaType) -> &mut AvModerationState {
    match media_type {
      MediaType::Audio => &mut self.audio,
      MediaType::Video => &mut self.video,
    }
  }

  fn may_unmute(&self, media_type: MediaType, moderation_id: &str) -> bool {
    let state = self.state(media_type);
    !state.enabled || state.whitelist.contains(moderation_id)
  }
}

struct ConferenceInner {
  participants: HashMap<String, Participant>,
  /// The authoritative owner → sources view for the whole conference.
  sources: ConferenceSourceMap,
  colibri_sessions: HashMap<String, ColibriSession>,
  av_moderation: AvModeration,
  audio_senders: usize,
  video_senders: usize,
  ended: bool,
}

impl fmt::Debug for ConferenceInner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConferenceInner")
      .field("participants", &self.participants.len())
      .field("bridges", &self.colibri_sessions.len())
      .field("ended", &self.ended)
      .finish()
  }
}

/// One live conference: the authoritative state for a meeting and the
/// coordinator of participants, bridges, and signaling. All state mutations
/// are serialized through the inner lock; network round trips never happen
/// while it is held.
#[derive(Clone)]
pub struct Conference {
  room: BareJid,
  room_config: RoomConfig,
  config: Arc<FocusConfig>,
  chat_room: Arc<dyn ChatRoom>,
  jingle: Arc<dyn JingleSender>,
  bridge_rpc: Arc<dyn BridgeRpc>,
  selector: Arc<BridgeSelector>,
  stats: Arc<FocusStats>,
  events: EventEmitter,
  inner: Arc<Mutex<ConferenceInner>>,
}

impl fmt::Debug for Conference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Conference").field("room", &self.room).finish()
  }
}

impl Conference {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    room: BareJid,
    room_config: RoomConfig,
    config: Arc<FocusConfig>,
    chat_room: Arc<dyn ChatRoom>,
    jingle: Arc<dyn JingleSender>,
    bridge_rpc: Arc<dyn BridgeRpc>,
    selector: Arc<BridgeSelector>,
    stats: Arc<FocusStats>,
    events: EventEmitter,
  ) -> Self {
    FocusStats::bump(&stats.conferences_created);
    Self {
      room,
      room_config,
      config,
      chat_room,
      jingle,
      bridge_rpc,
      selector,
      stats,
      events,
      inner: Arc::new(Mutex::new(ConferenceInner {
        participants: HashMap::new(),
        sources: ConferenceSourceMap::new(),
        colibri_sessions: HashMap::new(),
        av_moderation: AvModeration::default(),
        audio_senders: 0,
        video_senders: 0,
        ended: false,
      })),
    }
  }

  pub fn room(&self) -> &BareJid {
    &self.room
  }

  pub fn meeting_id(&self) -> Option<&str> {
    self.room_config.meeting_id.as_deref()
  }

  /// Route a chat-room event to the corresponding operation.
  pub async fn handle_event(&self, event: ChatRoomEvent) {
    match event {
      ChatRoomEvent::Joined(member) => self.member_joined(member).await,
      ChatRoomEvent::Left(member) => self.member_left(&member).await,
      ChatRoomEvent::Kicked { member, .. } => self.member_left(&member).await,
      ChatRoomEvent::RoleChanged(member) | ChatRoomEvent::PresenceChanged(member) => {
        self.presence_changed(member).await
      },
      ChatRoomEvent::RoomDestroyed { reason } => {
        self
          .end(&reason.unwrap_or_else(|| "room destroyed".to_owned()))
          .await
      },
    }
  }

  #[tracing::instrument(level = "info", skip(self, member), fields(room = %self.room, endpoint = %member.endpoint_id))]
  pub async fn member_joined(&self, member: ChatRoomMember) {
    let endpoint_id = member.endpoint_id.clone();
    let (grant_owner, start_muted) = {
      let mut inner = self.inner.lock().await;
      if inner.ended || inner.participants.contains_key(&endpoint_id) {
        return;
      }
      info!("member joined");
      let first_member = inner.participants.is_empty();
      let participant = Participant::new(member, &self.config);
      inner.participants.insert(endpoint_id.clone(), participant);
      FocusStats::bump(&self.stats.participants);
      self.update_sender_counts(&mut inner);
      if inner.participants.len() >= self.config.min_participants {
        let pending: Vec<String> = inner
          .participants
          .iter()
          .filter(|(_, p)| p.session().is_none() && !p.has_inflight_invite())
          .map(|(id, _)| id.clone())
          .collect();
        for id in pending {
          self.start_invite(&mut inner, &id);
        }
      }
      let start_muted = if first_member
        && (self.room_config.start_audio_muted || self.room_config.start_video_muted)
      {
        Some(PresenceExtension::StartMuted {
          audio: self.room_config.start_audio_muted,
          video: self.room_config.start_video_muted,
        })
      }
      else {
        None
      };
      (self.auto_owner_candidate(&inner), start_muted)
    };
    if let Some(extension) = start_muted {
      if let Err(e) = self.chat_room.set_presence_extension(extension).await {
        warn!("failed to publish start-muted presence: {:#}", e);
      }
    }
    self.events.fire(&ConferenceEvent::ParticipantJoined {
      room: self.room.clone(),
      endpoint_id,
    });
    self.maybe_grant_ownership(grant_owner).await;
  }

  #[tracing::instrument(level = "info", skip(self, member), fields(room = %self.room, endpoint = %member.endpoint_id))]
  pub async fn member_left(&self, member: &ChatRoomMember) {
    let endpoint_id = member.endpoint_id.clone();
    let (terminate, session, grant_owner, should_end) = {
      let mut inner = self.inner.lock().await;
      let mut participant = match inner.participants.remove(&endpoint_id) {
        Some(participant) => participant,
        None => return,
      };
      info!("member left");
      participant.abort_invite();
      let terminate = if participant.has_live_session() {
        participant.session().map(|s| s.addr())
      }
      else {
        None
      };
      participant.end_session();
      let session = participant
        .bridge
        .as_ref()
        .and_then(|bridge| inner.colibri_sessions.get(bridge).cloned());
      if inner.sources.remove_owner(&endpoint_id).is_some() {
        self.queue_owner_removed(&mut inner, &endpoint_id);
      }
      self.update_sender_counts(&mut inner);
      let should_end = inner
        .participants
        .values()
        .all(|p| p.member().is_utility());
      (terminate, session, self.auto_owner_candidate(&inner), should_end)
    };
    self.events.fire(&ConferenceEvent::ParticipantLeft {
      room: self.room.clone(),
      endpoint_id: endpoint_id.clone(),
    });
    if let Some(addr) = terminate {
      if let Err(e) = self
        .jingle
        .send(
          &addr,
          OutboundJingle::SessionTerminate {
            reason: TerminateReason::Gone,
          },
        )
        .await
      {
        debug!("failed to send session-terminate to {}: {}", endpoint_id, e);
      }
    }
    if let Some(session) = session {
      if session.expire(&endpoint_id).await {
        self.remove_session_if_empty(&session).await;
      }
    }
    self.maybe_grant_ownership(grant_owner).await;
    if should_end {
      self.end("all members left").await;
    }
  }

  pub async fn member_kicked(&self, member: &ChatRoomMember) {
    self.member_left(member).await;
  }

  /// Refresh a member's advertised state (mute flags, role, source infos).
  #[tracing::instrument(level = "debug", skip(self, member), fields(room = %self.room, endpoint = %member.endpoint_id))]
  pub async fn presence_changed(&self, member: ChatRoomMember) {
    let (changes, grant_owner) = {
      let mut inner = self.inner.lock().await;
      let participant = match inner.participants.get_mut(&member.endpoint_id) {
        Some(participant) => participant,
        None => return,
      };
      participant.update_member(member);
      let changes = self.update_sender_counts(&mut inner);
      (changes, self.auto_owner_candidate(&inner))
    };
    for (media_type, count) in changes {
      self.events.fire(&ConferenceEvent::SenderCountChanged {
        room: self.room.clone(),
        media_type,
        count,
      });
    }
    self.maybe_grant_ownership(grant_owner).await;
  }

  /// Accept an endpoint's answer: validate its sources, activate the
  /// session, and fan the sources out to everyone else.
  #[tracing::instrument(level = "info", skip(self, sources, groups, transport), fields(room = %self.room, endpoint = endpoint_id))]
  pub async fn accept_session(
    &self,
    endpoint_id: &str,
    sid: &str,
    sources: Vec<Source>,
    groups: Vec<SsrcGroup>,
    transport: Option<Value>,
    initial_last_n: Option<u32>,
  ) -> Result<(), RequestError> {
    let (session, own_sources, update) = {
      let mut inner = self.inner.lock().await;
      let set = self.validate_advertised_sources(&inner, endpoint_id, sid, sources, groups)?;
      let participant = inner.participants.get_mut(endpoint_id).unwrap();
      match participant.session_mut() {
        Some(session) => session.accept()?,
        None => return Err(RequestError::ItemNotFound("no session".to_owned())),
      }
      if !set.is_empty() {
        inner.sources.add(endpoint_id, &set);
        self.queue_source_add(&mut inner, endpoint_id, &set);
      }
      // Anything queued for this endpoint while it was pending flushes now.
      let participant = inner.participants.get_mut(endpoint_id).unwrap();
      if participant.signaling.is_dirty() {
        self.schedule_flush(&mut inner, endpoint_id);
      }
      let participant = inner.participants.get(endpoint_id).unwrap();
      let session = participant
        .bridge
        .as_ref()
        .and_then(|bridge| inner.colibri_sessions.get(bridge).cloned());
      let own_sources = inner.sources.get(endpoint_id).cloned().unwrap_or_default();
      (
        session,
        own_sources,
        EndpointUpdate {
          transport,
          last_n: initial_last_n,
          ..Default::default()
        },
      )
    };
    if let Some(session) = session {
      let update = EndpointUpdate {
        sources: Some(own_sources),
        ..update
      };
      let result = session.update_endpoint(endpoint_id, update).await;
      self.handle_colibri_result(&session, result).await;
    }
    Ok(())
  }

  /// Incremental source-add from an endpoint.
  #[tracing::instrument(level = "debug", skip(self, sources, groups), fields(room = %self.room, endpoint = endpoint_id))]
  pub async fn add_source(
    &self,
    endpoint_id: &str,
    sid: &str,
    sources: Vec<Source>,
    groups: Vec<SsrcGroup>,
  ) -> Result<(), RequestError> {
    let (session, own_sources) = {
      let mut inner = self.inner.lock().await;
      let set = self.validate_advertised_sources(&inner, endpoint_id, sid, sources, groups)?;
      if set.is_empty() {
        return Err(RequestError::BadRequest("empty source-add".to_owned()));
      }
      inner.sources.add(endpoint_id, &set);
      self.queue_source_add(&mut inner, endpoint_id, &set);
      let participant = inner.participants.get(endpoint_id).unwrap();
      let session = participant
        .bridge
        .as_ref()
        .and_then(|bridge| inner.colibri_sessions.get(bridge).cloned());
      let own_sources = inner.sources.get(endpoint_id).cloned().unwrap_or_default();
      (session, own_sources)
    };
    if let Some(session) = session {
      let result = session.update_sources(endpoint_id, own_sources).await;
      self.handle_colibri_result(&session, result).await;
    }
    Ok(())
  }

  /// Incremental source-remove from an endpoint.
  #[tracing::instrument(level = "debug", skip(self, sources), fields(room = %self.room, endpoint = endpoint_id))]
  pub async fn remove_source(
    &self,
    endpoint_id: &str,
    sid: &str,
    sources: Vec<Source>,
  ) -> Result<(), RequestError> {
    let (session, own_sources) = {
      let mut inner = self.inner.lock().await;
      let participant = inner
        .participants
        .get(endpoint_id)
        .ok_or_else(|| RequestError::ItemNotFound("unknown participant".to_owned()))?;
      participant
        .session()
        .ok_or_else(|| RequestError::ItemNotFound("no session".to_owned()))?
        .check_sid(sid)?;
      let owned = inner.sources.get(endpoint_id);
      for source in &sources {
        if owned.and_then(|set| set.get(source.ssrc)).is_none() {
          FocusStats::bump(&self.stats.validation_failures);
          return Err(RequestError::BadRequest(format!(
            "cannot remove source not advertised: {}",
            source.ssrc
          )));
        }
      }
      let set: EndpointSourceSet = sources.into_iter().collect();
      inner.sources.remove(endpoint_id, &set);
      let remove_for_others = set;
      let ids: Vec<String> = inner
        .participants
        .keys()
        .filter(|id| id.as_str() != endpoint_id)
        .cloned()
        .collect();
      for id in ids {
        if let Some(other) = inner.participants.get_mut(&id) {
          other.signaling.source_remove(endpoint_id, &remove_for_others);
        }
        self.schedule_flush(&mut inner, &id);
      }
      let participant = inner.participants.get(endpoint_id).unwrap();
      let session = participant
        .bridge
        .as_ref()
        .and_then(|bridge| inner.colibri_sessions.get(bridge).cloned());
      let own_sources = inner.sources.get(endpoint_id).cloned().unwrap_or_default();
      (session, own_sources)
    };
    if let Some(session) = session {
      let result = session.update_sources(endpoint_id, own_sources).await;
      self.handle_colibri_result(&session, result).await;
    }
    Ok(())
  }

  /// Trickle or final ICE from the client, forwarded to the bridge.
  pub async fn transport_info(
    &self,
    endpoint_id: &str,
    sid: &str,
    transport: Value,
  ) -> Result<(), RequestError> {
    let session = {
      let inner = self.inner.lock().await;
      let participant = inner
        .participants
        .get(endpoint_id)
        .ok_or_else(|| RequestError::ItemNotFound("unknown participant".to_owned()))?;
      let current = participant
        .session()
        .ok_or_else(|| RequestError::ItemNotFound("no session".to_owned()))?;
      if let Err(e) = current.check_sid(sid) {
        // Gateways send transport-info slightly out of order on restart.
        if participant.member().is_jigasi {
          warn!("accepting out-of-order transport-info from jigasi endpoint");
        }
        else {
          return Err(e);
        }
      }
      participant
        .bridge
        .as_ref()
        .and_then(|bridge| inner.colibri_sessions.get(bridge).cloned())
    };
    if let Some(session) = session {
      let result = session.update_transport(endpoint_id, transport).await;
      self.handle_colibri_result(&session, result).await;
    }
    Ok(())
  }

  /// The endpoint reported ICE failure; rebuild its channels and re-invite,
  /// subject to the restart rate limit.
  #[tracing::instrument(level = "info", skip(self), fields(room = %self.room, endpoint = endpoint_id))]
  pub async fn ice_failed(&self, endpoint_id: &str, bridge_session_id: &str) {
    FocusStats::bump(&self.stats.participants_ice_failed);
    let session = {
      let mut inner = self.inner.lock().await;
      let participant = match inner.participants.get_mut(endpoint_id) {
        Some(participant) => participant,
        None => return,
      };
      if participant.bridge_session_id.as_deref() != Some(bridge_session_id) {
        debug!("ignoring ICE failure for stale bridge session");
        return;
      }
      if !participant.accept_restart_request() {
        warn!("ICE restart denied by rate limit");
        return;
      }
      let bridge = participant.bridge.take();
      participant.bridge_session_id = None;
      bridge.and_then(|bridge| inner.colibri_sessions.get(&bridge).cloned())
    };
    if let Some(session) = session {
      if session.expire(endpoint_id).await {
        self.remove_session_if_empty(&session).await;
      }
    }
    let mut inner = self.inner.lock().await;
    if inner.participants.contains_key(endpoint_id) && !inner.ended {
      self.start_invite(&mut inner, endpoint_id);
    }
  }

  /// Client-initiated session-terminate, optionally asking for a re-invite.
  #[tracing::instrument(level = "info", skip(self), fields(room = %self.room, endpoint = endpoint_id))]
  pub async fn terminate_session(
    &self,
    endpoint_id: &str,
    sid: &str,
    bridge_session_id: &str,
    reinvite: bool,
  ) -> Result<(), RequestError> {
    let (session, restart_denied) = {
      let mut inner = self.inner.lock().await;
      let participant = inner
        .participants
        .get_mut(endpoint_id)
        .ok_or_else(|| RequestError::ItemNotFound("unknown participant".to_owned()))?;
      participant
        .session()
        .ok_or_else(|| RequestError::ItemNotFound("no session".to_owned()))?
        .check_sid(sid)?;
      if participant.bridge_session_id.as_deref() != Some(bridge_session_id) {
        return Err(RequestError::InvalidBridgeSessionId);
      }
      if reinvite {
        FocusStats::bump(&self.stats.participants_requested_restart);
      }
      participant.abort_invite();
      participant.end_session();
      let restart_denied = reinvite && !participant.accept_restart_request();
      let bridge = participant.bridge.take();
      participant.bridge_session_id = None;
      if inner.sources.remove_owner(endpoint_id).is_some() {
        self.queue_owner_removed(&mut inner, endpoint_id);
      }
      let session = bridge.and_then(|bridge| inner.colibri_sessions.get(&bridge).cloned());
      (session, restart_denied)
    };
    if let Some(session) = session {
      if session.expire(endpoint_id).await {
        self.remove_session_if_empty(&session).await;
      }
    }
    if restart_denied {
      return Err(RequestError::ResourceConstraint(
        "restart requests rate limited".to_owned(),
      ));
    }
    if reinvite {
      let mut inner = self.inner.lock().await;
      if inner.participants.contains_key(endpoint_id) && !inner.ended {
        self.start_invite(&mut inner, endpoint_id);
      }
    }
    Ok(())
  }

  /// Enable A/V moderation for a media type: only the actor stays allowed
  /// to unmute; everyone else currently sending is muted.
  #[tracing::instrument(level = "info", skip(self), fields(room = %self.room))]
  pub async fn mute_all_participants(
    &self,
    media_type: MediaType,
    actor_id: &str,
  ) -> Result<(), RequestError> {
    let (extension, targets) = {
      let mut inner = self.inner.lock().await;
      let actor = inner
        .participants
        .get(actor_id)
        .ok_or_else(|| RequestError::ItemNotFound("unknown actor".to_owned()))?;
      if !actor.role().is_moderator() {
        return Err(RequestError::Forbidden(
          "only moderators may mute the room".to_owned(),
        ));
      }
      let actor_moderation_id = actor.member().moderation_id();
      let state = inner.av_moderation.state_mut(media_type);
      state.enabled = true;
      state.whitelist = HashSet::from([actor_moderation_id.clone()]);
      let extension = PresenceExtension::AvModeration {
        media_type,
        enabled: true,
        whitelist: vec![actor_moderation_id.clone()],
      };
      let targets = self.collect_mute_targets(&inner, media_type, &actor_moderation_id);
      (extension, targets)
    };
    self.publish_moderation(extension).await;
    self.apply_mutes(media_type, targets).await;
    Ok(())
  }

  /// A mute request from one member about another (or themselves).
  #[tracing::instrument(level = "debug", skip(self), fields(room = %self.room))]
  pub async fn handle_mute_request(
    &self,
    from_id: &str,
    target_id: &str,
    media_type: MediaType,
    mute: bool,
  ) -> Result<(), RequestError> {
    let (extension, targets) = {
      let mut inner = self.inner.lock().await;
      let from = inner
        .participants
        .get(from_id)
        .ok_or_else(|| RequestError::ItemNotFound("unknown sender".to_owned()))?;
      let target = inner
        .participants
        .get(target_id)
        .ok_or_else(|| RequestError::ItemNotFound("unknown target".to_owned()))?;
      let target_moderation_id = target.member().moderation_id();
      if from_id != target_id {
        if !from.role().is_moderator() {
          return Err(RequestError::Forbidden(
            "only moderators may mute others".to_owned(),
          ));
        }
        if !mute {
          return Err(RequestError::Forbidden(
            "remote unmute is not allowed".to_owned(),
          ));
        }
      }
      else if !mute
        && !inner
          .av_moderation
          .may_unmute(media_type, &target_moderation_id)
      {
        return Err(RequestError::Forbidden(
          "unmute requires moderator approval".to_owned(),
        ));
      }
      let extension = {
        let state = inner.av_moderation.state_mut(media_type);
        if state.enabled && from_id != target_id {
          // A moderator muting someone revokes their unmute approval.
          state.whitelist.remove(&target_moderation_id);
          Some(PresenceExtension::AvModeration {
            media_type,
            enabled: true,
            whitelist: state.whitelist.iter().cloned().collect(),
          })
        }
        else {
          None
        }
      };
      let target = inner.participants.get(target_id).unwrap();
      let plan = MuteTarget {
        endpoint_id: target_id.to_owned(),
        force_mutable: media_type == MediaType::Audio
          && target.supports(Capability::AudioMute),
        session: target
          .bridge
          .as_ref()
          .and_then(|bridge| inner.colibri_sessions.get(bridge).cloned()),
        addr: target.session().map(|s| s.addr()),
        mute,
      };
      (extension, vec![plan])
    };
    if let Some(extension) = extension {
      self.publish_moderation(extension).await;
    }
    self.apply_mutes(media_type, targets).await;
    Ok(())
  }

  /// Approve a member to unmute under A/V moderation.
  pub async fn allow_unmute(
    &self,
    actor_id: &str,
    target_id: &str,
    media_type: MediaType,
  ) -> Result<(), RequestError> {
    let extension = {
      let mut inner = self.inner.lock().await;
      let actor = inner
        .participants
        .get(actor_id)
        .ok_or_else(|| RequestError::ItemNotFound("unknown actor".to_owned()))?;
      if !actor.role().is_moderator() {
        return Err(RequestError::Forbidden(
          "only moderators may approve unmutes".to_owned(),
        ));
      }
      let target = inner
        .participants
        .get(target_id)
        .ok_or_else(|| RequestError::ItemNotFound("unknown target".to_owned()))?;
      let moderation_id = target.member().moderation_id();
      let state = inner.av_moderation.state_mut(media_type);
      state.whitelist.insert(moderation_id);
      PresenceExtension::AvModeration {
        media_type,
        enabled: state.enabled,
        whitelist: state.whitelist.iter().cloned().collect(),
      }
    };
    self.publish_moderation(extension).await;
    Ok(())
  }

  /// Replace the moderation extension on the focus presence in one stanza:
  /// drop the stale one by name, then add the current state.
  async fn publish_moderation(&self, extension: PresenceExtension) {
    let stale = extension.name().to_owned();
    if let Err(e) = self
      .chat_room
      .modify_presence(vec![extension], vec![stale])
      .await
    {
      warn!("failed to publish av-moderation presence: {:#}", e);
    }
  }

  /// Move one endpoint off its current bridge; used when draining.
  #[tracing::instrument(level = "info", skip(self), fields(room = %self.room, endpoint = endpoint_id))]
  pub async fn move_endpoint(&self, endpoint_id: &str, from_bridge: Option<&str>) -> bool {
    let session = {
      let mut inner = self.inner.lock().await;
      let participant = match inner.participants.get_mut(endpoint_id) {
        Some(participant) => participant,
        None => return false,
      };
      match (&participant.bridge, from_bridge) {
        (Some(current), Some(expected)) if current != expected => return false,
        (None, _) => return false,
        _ => {},
      }
      let bridge = participant.bridge.take();
      participant.bridge_session_id = None;
      FocusStats::bump(&self.stats.participants_moved);
      bridge.and_then(|bridge| inner.colibri_sessions.get(&bridge).cloned())
    };
    if let Some(session) = session {
      if session.expire(endpoint_id).await {
        self.remove_session_if_empty(&session).await;
      }
    }
    let mut inner = self.inner.lock().await;
    if inner.participants.contains_key(endpoint_id) && !inner.ended {
      self.start_invite(&mut inner, endpoint_id);
      true
    }
    else {
      false
    }
  }

  /// Move up to `count` endpoints off the given bridge. Returns how many
  /// moves were started.
  pub async fn move_endpoints(&self, bridge: &str, count: usize) -> usize {
    let ids: Vec<String> = {
      let inner = self.inner.lock().await;
      inner
        .participants
        .iter()
        .filter(|(_, p)| p.bridge.as_deref() == Some(bridge))
        .map(|(id, _)| id.clone())
        .take(count)
        .collect()
    };
    let mut moved = 0;
    for id in &ids {
      if self.move_endpoint(id, Some(bridge)).await {
        moved += 1;
      }
    }
    moved
  }

  /// The bridge is unhealthy: quarantine it and move everyone off.
  #[tracing::instrument(level = "info", skip(self), fields(room = %self.room, bridge = bridge_jid))]
  pub async fn handle_bridge_failure(&self, bridge_jid: &str) {
    self.selector.bridge_failed(bridge_jid);
    let (failed_session, stranded) = {
      let mut inner = self.inner.lock().await;
      let failed_session = match inner.colibri_sessions.remove(bridge_jid) {
        Some(session) => session,
        None => return,
      };
      let stranded: Vec<String> = inner
        .participants
        .iter()
        .filter(|(_, p)| p.bridge.as_deref() == Some(bridge_jid))
        .map(|(id, _)| id.clone())
        .collect();
      for id in &stranded {
        if let Some(participant) = inner.participants.get_mut(id) {
          participant.bridge = None;
          participant.bridge_session_id = None;
        }
      }
      FocusStats::add(&self.stats.participants_moved, stranded.len() as u64);
      for id in &stranded {
        self.start_invite(&mut inner, id);
      }
      (failed_session, stranded)
    };
    info!("moving {} participants off failed bridge", stranded.len());
    // Best-effort: the bridge may well be unreachable.
    tokio::spawn(async move { failed_session.close().await });
    self.update_relay_mesh().await;
  }

  /// The bridge forgot this conference: discard the local session and
  /// rebuild it on the same bridge. The bridge keeps its health.
  #[tracing::instrument(level = "info", skip(self, stale), fields(room = %self.room, bridge = %stale.bridge.jid))]
  pub async fn restart_bridge_session(&self, stale: &ColibriSession) {
    {
      let mut inner = self.inner.lock().await;
      match inner.colibri_sessions.get(&stale.bridge.jid) {
        Some(current) if current.id == stale.id => {
          inner.colibri_sessions.remove(&stale.bridge.jid);
        },
        _ => return,
      }
      let stranded: Vec<String> = inner
        .participants
        .iter()
        .filter(|(_, p)| p.bridge.as_deref() == Some(stale.bridge.jid.as_str()))
        .map(|(id, _)| id.clone())
        .collect();
      for id in &stranded {
        if let Some(participant) = inner.participants.get_mut(id) {
          participant.bridge = None;
          participant.bridge_session_id = None;
        }
      }
      for id in &stranded {
        self.start_invite(&mut inner, id);
      }
    }
    self.update_relay_mesh().await;
  }

  /// Tear the conference down: end every session, expire every bridge
  /// session best-effort, and notify listeners.
  #[tracing::instrument(level = "info", skip(self), fields(room = %self.room))]
  pub async fn end(&self, reason: &str) {
    let (addrs, sessions) = {
      let mut inner = self.inner.lock().await;
      if inner.ended {
        return;
      }
      inner.ended = true;
      let mut addrs = Vec::new();
      for (_, mut participant) in inner.participants.drain() {
        participant.abort_invite();
        if participant.has_live_session() {
          if let Some(session) = participant.session() {
            addrs.push(session.addr());
          }
        }
        participant.end_session();
      }
      inner.sources = ConferenceSourceMap::new();
      let sessions: Vec<ColibriSession> = inner.colibri_sessions.drain().map(|(_, s)| s).collect();
      (addrs, sessions)
    };
    info!(reason, "conference ended");
    for addr in addrs {
      if let Err(e) = self
        .jingle
        .send(
          &addr,
          OutboundJingle::SessionTerminate {
            reason: TerminateReason::Gone,
          },
        )
        .await
      {
        debug!("failed to send session-terminate: {}", e);
      }
    }
    for session in sessions {
      session.close().await;
    }
    if let Err(e) = self.chat_room.leave().await {
      debug!("failed to leave room: {:#}", e);
    }
    FocusStats::bump(&self.stats.conferences_ended);
    self.events.fire(&ConferenceEvent::Ended {
      room: self.room.clone(),
      reason: reason.to_owned(),
    });
  }

  pub async fn participant_count(&self) -> usize {
    self.inner.lock().await.participants.len()
  }

  pub async fn is_ended(&self) -> bool {
    self.inner.lock().await.ended
  }

  pub async fn debug_state(&self) -> Value {
    let inner = self.inner.lock().await;
    let mut sessions = Vec::new();
    for session in inner.colibri_sessions.values() {
      sessions.push(session.to_json().await);
    }
    json!({
      "room": self.room.to_string(),
      "meeting_id": self.room_config.meeting_id,
      "participants": inner
        .participants
        .values()
        .map(Participant::to_json)
        .collect::<Vec<_>>(),
      "sources": inner.sources.to_json(),
      "colibri_sessions": sessions,
      "audio_senders": inner.audio_senders,
      "video_senders": inner.video_senders,
      "ended": inner.ended,
    })
  }

  // --- invite pipeline ---------------------------------------------------

  /// Kick off (or replace) the invite task for one participant. The caller
  /// holds the conference lock.
  fn start_invite(&self, inner: &mut ConferenceInner, endpoint_id: &str) {
    let participant = match inner.participants.get_mut(endpoint_id) {
      Some(participant) => participant,
      None => return,
    };
    participant.abort_invite();
    participant.invite_generation += 1;
    let generation = participant.invite_generation;
    let this = self.clone();
    let id = endpoint_id.to_owned();
    let task = tokio::spawn(async move {
      if let Err(e) = this.run_invite(&id, generation).await {
        warn!("invite failed for {}: {:#}", id, e);
      }
    });
    if let Some(participant) = inner.participants.get_mut(endpoint_id) {
      participant.invite_task = Some(task);
    }
  }

  async fn run_invite(&self, endpoint_id: &str, generation: u64) -> Result<()> {
    // Snapshot what the pipeline needs, then release the lock for the
    // network round trips.
    let (region, replacing, media, json_sources, old_bridge, conference_bridges, force_muted) = {
      let inner = self.inner.lock().await;
      if inner.ended {
        return Ok(());
      }
      let participant = match inner.participants.get(endpoint_id) {
        Some(participant) => participant,
        None => return Ok(()),
      };
      if participant.invite_generation != generation {
        return Ok(());
      }
      let mut bridges = ConferenceBridges::default();
      for (jid, _) in inner.colibri_sessions.iter() {
        let count = inner
          .participants
          .values()
          .filter(|p| p.bridge.as_deref() == Some(jid.as_str()))
          .count();
        bridges.bridges.insert(jid.clone(), count);
      }
      let moderation_id = participant.member().moderation_id();
      let force_muted_audio = self.room_config.start_audio_muted
        || !inner.av_moderation.may_unmute(MediaType::Audio, &moderation_id);
      let force_muted_video = self.room_config.start_video_muted
        || !inner.av_moderation.may_unmute(MediaType::Video, &moderation_id);
      (
        participant.member().region.clone(),
        participant.has_live_session(),
        participant.offered_media(),
        participant.uses_json_sources(&self.config),
        participant.bridge.clone(),
        bridges,
        (force_muted_audio, force_muted_video),
      )
    };

    let bridge = match self.selector.select(&conference_bridges, region.as_deref()) {
      Ok(bridge) => bridge,
      Err(e) => {
        FocusStats::bump(&self.stats.bridge_selection_failures);
        warn!("bridge selection failed: {}", e);
        return Ok(());
      },
    };

    let (session, created_session) = {
      let mut inner = self.inner.lock().await;
      if inner.ended
        || inner
          .participants
          .get(endpoint_id)
          .map(|p| p.invite_generation != generation)
          .unwrap_or(true)
      {
        return Ok(());
      }
      let created = !inner.colibri_sessions.contains_key(&bridge.jid);
      let session = inner
        .colibri_sessions
        .entry(bridge.jid.clone())
        .or_insert_with(|| {
          ColibriSession::new(
            bridge.clone(),
            self.room.clone(),
            self.bridge_rpc.clone(),
            self.config.bridge.rpc_timeout(),
          )
        })
        .clone();
      (session, created)
    };

    let request = AllocationRequest {
      media: media.clone(),
      initial_sources: EndpointSourceSet::default(),
      initial_last_n: None,
      use_sctp: false,
      force_muted_audio: force_muted.0,
      force_muted_video: force_muted.1,
    };
    let allocation = match session.allocate(endpoint_id, request).await {
      Ok(allocation) => allocation,
      Err(ColibriFault::BadRequest(reason)) => {
        warn!("bridge rejected allocation: {}", reason);
        return Ok(());
      },
      Err(ColibriFault::StaleConference) => {
        self.restart_bridge_session(&session).await;
        return Ok(());
      },
      Err(ColibriFault::BridgeFailure(reason)) => {
        warn!("bridge failed during allocation: {}", reason);
        self.handle_bridge_failure(&session.bridge.jid).await;
        return Ok(());
      },
    };

    // Commit: the participant must still be there and this invite must not
    // have been superseded while we were allocating.
    let (addr, offer, old_session) = {
      let mut inner = self.inner.lock().await;
      let stale = inner.ended
        || inner
          .participants
          .get(endpoint_id)
          .map(|p| p.invite_generation != generation)
          .unwrap_or(true);
      if stale {
        drop(inner);
        debug!("invite superseded after allocation; expiring endpoint");
        if session.expire(endpoint_id).await {
          self.remove_session_if_empty(&session).await;
        }
        return Ok(());
      }
      let old_session = match &old_bridge {
        Some(old) if old != &bridge.jid => inner.colibri_sessions.get(old).cloned(),
        _ => None,
      };
      let mut others = inner.sources.clone();
      others.remove_owner(endpoint_id);
      let participant = inner.participants.get_mut(endpoint_id).unwrap();
      let initial_sources = participant.signaling.reset(others);
      let jingle_session =
        JingleSession::new(participant.member().muc_jid.clone(), json_sources);
      let addr = jingle_session.addr();
      participant.replace_session(jingle_session);
      participant.bridge = Some(bridge.jid.clone());
      participant.bridge_session_id = Some(session.id.clone());
      participant.flush_scheduled = false;
      let offer = Offer {
        media,
        sources: initial_sources,
        transport: allocation.transport,
        bridge_session_id: session.id.clone(),
        start_audio_muted: force_muted.0,
        start_video_muted: force_muted.1,
      };
      (addr, offer, old_session)
    };

    if let Some(old_session) = old_session {
      if old_session.expire(endpoint_id).await {
        self.remove_session_if_empty(&old_session).await;
      }
    }
    if created_session {
      self.update_relay_mesh().await;
    }

    let message = if replacing {
      OutboundJingle::TransportReplace(offer)
    }
    else {
      OutboundJingle::SessionInitiate(offer)
    };
    if let Err(e) = self.jingle.send(&addr, message).await {
      warn!("failed to send offer to {}: {}", endpoint_id, e);
    }
    Ok(())
  }

  // --- source fan-out ----------------------------------------------------

  /// Queue a source-add toward every other participant. Caller holds the
  /// lock; flushes are scheduled with the configured batching delay.
  fn queue_source_add(
    &self,
    inner: &mut ConferenceInner,
    owner: &str,
    set: &EndpointSourceSet,
  ) {
    let ids: Vec<String> = inner
      .participants
      .keys()
      .filter(|id| id.as_str() != owner)
      .cloned()
      .collect();
    for id in ids {
      if let Some(other) = inner.participants.get_mut(&id) {
        other.signaling.source_add(owner, set);
      }
      self.schedule_flush(inner, &id);
    }
  }

  fn queue_owner_removed(&self, inner: &mut ConferenceInner, owner: &str) {
    let ids: Vec<String> = inner
      .participants
      .keys()
      .filter(|id| id.as_str() != owner)
      .cloned()
      .collect();
    for id in ids {
      if let Some(other) = inner.participants.get_mut(&id) {
        other.signaling.owner_left(owner);
      }
      self.schedule_flush(inner, &id);
    }
  }

  /// Schedule a delayed flush of one participant's pending source deltas.
  /// Coalescing: while a flush is pending, further deltas just accumulate.
  fn schedule_flush(&self, inner: &mut ConferenceInner, endpoint_id: &str) {
    let participant_count = inner.participants.len();
    let participant = match inner.participants.get_mut(endpoint_id) {
      Some(participant) => participant,
      None => return,
    };
    if participant.flush_scheduled {
      return;
    }
    participant.flush_scheduled = true;
    let delay = self.config.source_signaling_delay(participant_count);
    let this = self.clone();
    let id = endpoint_id.to_owned();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      this.flush_source_updates(&id).await;
    });
  }

  async fn flush_source_updates(&self, endpoint_id: &str) {
    let (addr, updates) = {
      let mut inner = self.inner.lock().await;
      let participant = match inner.participants.get_mut(endpoint_id) {
        Some(participant) => participant,
        None => return,
      };
      participant.flush_scheduled = false;
      if !participant.is_session_active() {
        // Not yet active: the queue drains into the initial offer, or a
        // fresh flush is scheduled at session-accept.
        return;
      }
      let updates = participant.signaling.update();
      if updates.is_empty() {
        return;
      }
      let addr = match participant.session() {
        Some(session) => session.addr(),
        None => return,
      };
      (addr, updates)
    };
    for update in updates {
      let message = match update {
        SourceUpdate::Remove(map) => OutboundJingle::SourceRemove(map),
        SourceUpdate::Add(map) => OutboundJingle::SourceAdd(map),
      };
      if let Err(e) = self.jingle.send(&addr, message).await {
        // Losing one stanza must not wedge the queue; the next delta will
        // carry the full difference.
        warn!("failed to send source update to {}: {}", endpoint_id, e);
      }
    }
  }

  // --- shared helpers ----------------------------------------------------

  fn validate_advertised_sources(
    &self,
    inner: &ConferenceInner,
    endpoint_id: &str,
    sid: &str,
    sources: Vec<Source>,
    groups: Vec<SsrcGroup>,
  ) -> Result<EndpointSourceSet, RequestError> {
    let participant = inner
      .participants
      .get(endpoint_id)
      .ok_or_else(|| RequestError::ItemNotFound("unknown participant".to_owned()))?;
    participant
      .session()
      .ok_or_else(|| RequestError::ItemNotFound("no session".to_owned()))?
      .check_sid(sid)?;
    if participant.is_visitor() && !sources.is_empty() {
      FocusStats::bump(&self.stats.validation_failures);
      return Err(RequestError::Forbidden(
        "visitors may not advertise sources".to_owned(),
      ));
    }
    let set = EndpointSourceSet::validated(sources, groups).map_err(|e| {
      FocusStats::bump(&self.stats.validation_failures);
      RequestError::BadRequest(e.to_string())
    })?;
    for ssrc in set.ssrcs() {
      let conflict = inner
        .sources
        .iter()
        .any(|(owner, owned)| owner != endpoint_id && owned.get(ssrc).is_some());
      if conflict {
        FocusStats::bump(&self.stats.validation_failures);
        return Err(RequestError::BadRequest(format!(
          "ssrc {} is already advertised by another endpoint",
          ssrc
        )));
      }
    }
    Ok(set)
  }

  /// React to a failed colibri RPC according to its classification.
  async fn handle_colibri_result(
    &self,
    session: &ColibriSession,
    result: Result<(), ColibriFault>,
  ) {
    match result {
      Ok(()) => {},
      Err(ColibriFault::BadRequest(reason)) => {
        warn!("bridge rejected update: {}", reason);
      },
      Err(ColibriFault::StaleConference) => {
        self.restart_bridge_session(session).await;
      },
      Err(ColibriFault::BridgeFailure(reason)) => {
        warn!("bridge fault: {}", reason);
        self.handle_bridge_failure(&session.bridge.jid).await;
      },
    }
  }

  /// Drop a colibri session that became empty, expiring it on the bridge.
  async fn remove_session_if_empty(&self, session: &ColibriSession) {
    let removed = {
      let mut inner = self.inner.lock().await;
      if session.participant_count().await > 0 {
        false
      }
      else {
        match inner.colibri_sessions.get(&session.bridge.jid) {
          Some(current) if current.id == session.id => {
            inner.colibri_sessions.remove(&session.bridge.jid);
            true
          },
          _ => false,
        }
      }
    };
    if removed {
      session.close().await;
      self.update_relay_mesh().await;
    }
  }

  /// Re-derive the octo relay mesh: every bridge session relays to every
  /// other bridge in the conference. The per-bridge updates go out in
  /// parallel; a failure on one bridge does not block the others.
  async fn update_relay_mesh(&self) {
    let sessions: Vec<ColibriSession> = {
      let inner = self.inner.lock().await;
      inner.colibri_sessions.values().cloned().collect()
    };
    let updates = sessions.iter().map(|session| {
      let relays: Vec<String> = sessions
        .iter()
        .filter(|other| other.bridge.jid != session.bridge.jid)
        .filter_map(|other| other.bridge.relay_id.clone())
        .collect();
      async move {
        if let Err(e) = session.set_relays(relays).await {
          warn!("failed to set relays on {}: {}", session.bridge.jid, e);
        }
      }
    });
    futures::future::join_all(updates).await;
  }

  /// Recompute audio/video sender counts; returns the media types whose
  /// count changed, with the new counts.
  fn update_sender_counts(&self, inner: &mut ConferenceInner) -> Vec<(MediaType, usize)> {
    let audio = inner
      .participants
      .values()
      .filter(|p| !p.is_visitor() && !p.member().audio_muted)
      .count();
    let video = inner
      .participants
      .values()
      .filter(|p| !p.is_visitor() && !p.member().video_muted)
      .count();
    let mut changes = Vec::new();
    if audio != inner.audio_senders {
      inner.audio_senders = audio;
      changes.push((MediaType::Audio, audio));
    }
    if video != inner.video_senders {
      inner.video_senders = video;
      changes.push((MediaType::Video, video));
    }
    changes
  }

  /// Pick the longest-present eligible member for auto-owner, if the room
  /// currently has none.
  fn auto_owner_candidate(&self, inner: &ConferenceInner) -> Option<FullJid> {
    if !self.config.enable_auto_owner {
      return None;
    }
    if inner
      .participants
      .values()
      .any(|p| p.role() == MemberRole::Owner)
    {
      return None;
    }
    inner
      .participants
      .values()
      .filter(|p| !p.is_visitor() && !p.member().is_utility() && !p.member().is_jigasi)
      .min_by_key(|p| p.created_at())
      .map(|p| p.member().muc_jid.clone())
  }

  async fn maybe_grant_ownership(&self, candidate: Option<FullJid>) {
    if let Some(jid) = candidate {
      if let Err(e) = self.chat_room.grant_ownership(&jid).await {
        debug!("failed to grant ownership to {}: {:#}", jid, e);
      }
    }
  }

  fn collect_mute_targets(
    &self,
    inner: &ConferenceInner,
    media_type: MediaType,
    exempt_moderation_id: &str,
  ) -> Vec<MuteTarget> {
    inner
      .participants
      .iter()
      .filter(|(_, p)| {
        p.member().moderation_id() != exempt_moderation_id && !p.is_visitor()
      })
      .filter(|(_, p)| match media_type {
        MediaType::Audio => !p.member().audio_muted,
        MediaType::Video => !p.member().video_muted,
      })
      .map(|(id, p)| MuteTarget {
        endpoint_id: id.clone(),
        force_mutable: media_type == MediaType::Audio && p.supports(Capability::AudioMute),
        session: p
          .bridge
          .as_ref()
          .and_then(|bridge| inner.colibri_sessions.get(bridge).cloned()),
        addr: p.session().map(|s| s.addr()),
        mute: true,
      })
      .collect()
  }

  /// Effect mutes via the bridge where possible, and via the client's
  /// signaling channel otherwise. One failure never blocks the rest.
  async fn apply_mutes(&self, media_type: MediaType, targets: Vec<MuteTarget>) {
    for target in targets {
      if target.force_mutable {
        if let Some(session) = &target.session {
          let result = session
            .force_mute(&target.endpoint_id, media_type, target.mute)
            .await;
          self.handle_colibri_result(session, result).await;
          continue;
        }
      }
      if let Some(addr) = &target.addr {
        if let Err(e) = self
          .jingle
          .send(
            addr,
            OutboundJingle::Mute {
              media_type,
              mute: target.mute,
            },
          )
          .await
        {
          warn!("failed to signal mute to {}: {}", target.endpoint_id, e);
        }
      }
    }
  }
}

struct MuteTarget {
  endpoint_id: String,
  force_mutable: bool,
  session: Option<ColibriSession>,
  addr: Option<JingleAddr>,
  mute: bool,
}
