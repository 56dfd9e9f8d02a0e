mod bridge;
mod chatroom;
mod colibri;
mod conference;
mod config;
mod events;
mod jingle;
mod participant;
mod registry;
mod selector;
mod signaling;
mod source;
mod stats;
mod util;

pub use crate::{
  bridge::{Bridge, BridgeStatus},
  chatroom::{
    Capability, ChatRoom, ChatRoomEvent, ChatRoomMember, MemberRole, PresenceExtension,
    RoomConfig, SourceInfo,
  },
  colibri::{
    AllocationRequest, AllocationResponse, BridgeRpc, BridgeRpcError, ColibriFault,
    ColibriSession, EndpointUpdate,
  },
  conference::Conference,
  config::{BridgeConfig, DelayStep, FocusConfig, RestartConfig},
  events::{ConferenceEvent, EventEmitter},
  jingle::{
    BridgeTransport, IqSendError, JingleAddr, JingleSender, JingleSession, Offer, OutboundJingle,
    RequestError, SessionState, TerminateReason,
  },
  participant::Participant,
  registry::FocusRegistry,
  selector::{BridgeSelector, ConferenceBridges, SelectionError},
  signaling::{SourceFilter, SourceSignaling, SourceUpdate},
  source::{
    ConferenceSourceMap, EndpointSourceSet, MediaType, Semantics, Source, SourceError, SsrcGroup,
    VideoType,
  },
  stats::FocusStats,
};

/// Set up logging for a long-running focus process: `RUST_LOG` wins when
/// set, otherwise everything logs at the given level.
#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing(default_level: tracing::Level) {
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level.to_string()));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}
