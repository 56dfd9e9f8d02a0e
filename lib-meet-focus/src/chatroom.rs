use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use jid::{BareJid, FullJid, Jid};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::source::{MediaType, VideoType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
  Owner,
  Moderator,
  Member,
  Visitor,
}

impl MemberRole {
  pub fn is_moderator(&self) -> bool {
    matches!(self, MemberRole::Owner | MemberRole::Moderator)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
  Audio,
  Video,
  Rtx,
  Red,
  Tcc,
  Remb,
  Sctp,
  SsrcRewriting,
  JsonSources,
  AudioMute,
}

/// Per-ssrc summary advertised in a member's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
  pub muted: bool,
  pub video_type: Option<VideoType>,
}

/// A chat-room occupant as reported by the room transport.
#[derive(Debug, Clone)]
pub struct ChatRoomMember {
  /// The MUC resource (nickname); doubles as the endpoint id.
  pub endpoint_id: String,
  pub muc_jid: FullJid,
  /// Present only when the room is non-anonymous.
  pub real_jid: Option<Jid>,
  pub role: MemberRole,
  pub stats_id: Option<String>,
  pub region: Option<String>,
  pub capabilities: HashSet<Capability>,
  pub source_infos: HashMap<u32, SourceInfo>,
  pub audio_muted: bool,
  pub video_muted: bool,
  pub is_jibri: bool,
  pub is_jigasi: bool,
  pub is_transcriber: bool,
  pub is_visitor: bool,
}

impl ChatRoomMember {
  pub fn supports(&self, capability: Capability) -> bool {
    self.capabilities.contains(&capability)
  }

  /// Recorders and transcribers join on behalf of the deployment rather than
  /// a human; they never hold the room open and never become owner.
  pub fn is_utility(&self) -> bool {
    self.is_jibri || self.is_transcriber
  }

  /// The canonical identity used for A/V moderation whitelists: the bare
  /// real JID when the room is non-anonymous, the occupant JID otherwise.
  pub fn moderation_id(&self) -> String {
    match &self.real_jid {
      Some(Jid::Full(full)) => BareJid::from(full.clone()).to_string(),
      Some(Jid::Bare(bare)) => bare.to_string(),
      None => BareJid::from(self.muc_jid.clone()).to_string(),
    }
  }
}

/// Events surfaced by the room transport, in room order.
#[derive(Debug, Clone)]
pub enum ChatRoomEvent {
  Joined(ChatRoomMember),
  Left(ChatRoomMember),
  Kicked {
    member: ChatRoomMember,
    actor: Option<String>,
    reason: Option<String>,
  },
  RoleChanged(ChatRoomMember),
  PresenceChanged(ChatRoomMember),
  RoomDestroyed {
    reason: Option<String>,
  },
}

/// A presence extension the focus publishes into the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceExtension {
  AvModeration {
    media_type: MediaType,
    enabled: bool,
    whitelist: Vec<String>,
  },
  StartMuted {
    audio: bool,
    video: bool,
  },
}

impl PresenceExtension {
  pub fn name(&self) -> &'static str {
    match self {
      PresenceExtension::AvModeration { .. } => "av_moderation",
      PresenceExtension::StartMuted { .. } => "startmuted",
    }
  }
}

/// Commands toward the room transport. Implementations carry the wire
/// format; the engine only sees this surface.
#[async_trait]
pub trait ChatRoom: Send + Sync {
  fn room_jid(&self) -> &BareJid;

  /// Occupy the room under the given nickname. Joining a room the focus
  /// already occupies is a no-op.
  async fn join(&self, nickname: &str) -> Result<()>;

  async fn leave(&self) -> Result<()>;

  /// Publish (or replace) a single extension on the focus's own presence.
  async fn set_presence_extension(&self, extension: PresenceExtension) -> Result<()>;

  /// Update the focus's own presence in one stanza: drop the named
  /// extensions, then add the given ones.
  async fn modify_presence(
    &self,
    to_add: Vec<PresenceExtension>,
    to_remove: Vec<String>,
  ) -> Result<()>;

  async fn grant_ownership(&self, member: &FullJid) -> Result<()>;

  /// Send an IQ through the room's connection and await the response.
  async fn send_iq(&self, iq: Value) -> Result<Value>;
}

/// Room configuration echoed from the MUC configuration form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomConfig {
  pub meeting_id: Option<String>,
  #[serde(default)]
  pub is_breakout_room: bool,
  pub breakout_main_room: Option<String>,
  /// `whois=anyone`: real JIDs are visible to everyone.
  #[serde(default)]
  pub non_anonymous: bool,
  #[serde(default)]
  pub start_audio_muted: bool,
  #[serde(default)]
  pub start_video_muted: bool,
}
