use std::fmt;

use async_trait::async_trait;
use jid::FullJid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  source::{ConferenceSourceMap, MediaType},
  util::generate_id,
};

/// IQ-style error conditions returned to clients for failed requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
  BadRequest(String),
  ItemNotFound(String),
  Forbidden(String),
  ResourceConstraint(String),
  /// The request referenced a bridge session that is no longer current.
  InvalidBridgeSessionId,
  ServiceUnavailable(String),
}

impl RequestError {
  /// The defined-condition name as it appears on the wire.
  pub fn condition(&self) -> &'static str {
    match self {
      RequestError::BadRequest(_) => "bad-request",
      RequestError::ItemNotFound(_) => "item-not-found",
      RequestError::Forbidden(_) => "forbidden",
      RequestError::ResourceConstraint(_) => "resource-constraint",
      RequestError::InvalidBridgeSessionId => "item-not-found",
      RequestError::ServiceUnavailable(_) => "service-unavailable",
    }
  }
}

impl fmt::Display for RequestError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RequestError::BadRequest(reason)
      | RequestError::ItemNotFound(reason)
      | RequestError::Forbidden(reason)
      | RequestError::ResourceConstraint(reason)
      | RequestError::ServiceUnavailable(reason) => {
        write!(f, "{}: {}", self.condition(), reason)
      },
      RequestError::InvalidBridgeSessionId => write!(f, "invalid bridge session id"),
    }
  }
}

impl std::error::Error for RequestError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
  Replaced,
  Expired,
  ConnectivityError,
  Gone,
}

impl TerminateReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      TerminateReason::Replaced => "replaced",
      TerminateReason::Expired => "expired",
      TerminateReason::ConnectivityError => "connectivity-error",
      TerminateReason::Gone => "gone",
    }
  }
}

/// The transport descriptor returned by a bridge allocation. The concrete
/// wire shape is the bridge adapter's concern; the engine only forwards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTransport {
  pub bridge: String,
  pub payload: Value,
}

/// The initial (or replacement) offer toward one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
  pub media: Vec<MediaType>,
  pub sources: ConferenceSourceMap,
  pub transport: BridgeTransport,
  /// Identifies the bridge session the offer came from; echoed back by
  /// clients in session-terminate and ICE failure reports.
  pub bridge_session_id: String,
  pub start_audio_muted: bool,
  pub start_video_muted: bool,
}

/// Outbound signaling toward one endpoint's Jingle session.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundJingle {
  SessionInitiate(Offer),
  TransportReplace(Offer),
  SourceAdd(ConferenceSourceMap),
  SourceRemove(ConferenceSourceMap),
  SessionTerminate { reason: TerminateReason },
  /// Ask the client to mute itself; used when the bridge cannot force-mute.
  Mute { media_type: MediaType, mute: bool },
}

/// Addressing for an outbound Jingle message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JingleAddr {
  pub jid: FullJid,
  pub sid: String,
  /// Encode sources as JSON rather than SSMA elements.
  pub json_sources: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IqSendError {
  NotConnected,
  NoResponse,
  ErrorResponse(String),
}

impl fmt::Display for IqSendError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      IqSendError::NotConnected => write!(f, "not connected"),
      IqSendError::NoResponse => write!(f, "no response"),
      IqSendError::ErrorResponse(condition) => write!(f, "error response: {}", condition),
    }
  }
}

impl std::error::Error for IqSendError {}

/// Outgoing half of the Jingle adapter. The inbound half arrives as calls
/// into the conference engine from the transport's IQ dispatch.
#[async_trait]
pub trait JingleSender: Send + Sync {
  async fn send(&self, addr: &JingleAddr, message: OutboundJingle) -> Result<(), IqSendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Pending,
  Active,
  Ended,
}

/// One offer/answer negotiation with one endpoint. Transitions are one-way:
/// Pending → Active, and any state → Ended.
#[derive(Debug)]
pub struct JingleSession {
  sid: String,
  peer: FullJid,
  state: SessionState,
  use_json_sources: bool,
}

impl JingleSession {
  pub fn new(peer: FullJid, use_json_sources: bool) -> Self {
    Self {
      sid: generate_id(),
      peer,
      state: SessionState::Pending,
      use_json_sources,
    }
  }

  pub fn sid(&self) -> &str {
    &self.sid
  }

  pub fn peer(&self) -> &FullJid {
    &self.peer
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  pub fn is_active(&self) -> bool {
    self.state == SessionState::Active
  }

  pub fn addr(&self) -> JingleAddr {
    JingleAddr {
      jid: self.peer.clone(),
      sid: self.sid.clone(),
      json_sources: self.use_json_sources,
    }
  }

  /// Accept the offer (session-accept or transport-accept).
  pub fn accept(&mut self) -> Result<(), RequestError> {
    match self.state {
      SessionState::Pending => {
        self.state = SessionState::Active;
        Ok(())
      },
      SessionState::Active => Ok(()),
      SessionState::Ended => Err(RequestError::ItemNotFound(format!(
        "session {} already ended",
        self.sid
      ))),
    }
  }

  pub fn end(&mut self) {
    self.state = SessionState::Ended;
  }

  /// Check an incoming request's sid against this session.
  pub fn check_sid(&self, sid: &str) -> Result<(), RequestError> {
    if self.state != SessionState::Ended && sid == self.sid {
      Ok(())
    }
    else {
      Err(RequestError::ItemNotFound(format!("unknown session: {}", sid)))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn peer() -> FullJid {
    "room@conference.example.com/abcd1234".parse().unwrap()
  }

  #[test]
  fn accept_moves_pending_to_active_once() {
    let mut session = JingleSession::new(peer(), false);
    assert_eq!(session.state(), SessionState::Pending);
    session.accept().unwrap();
    assert_eq!(session.state(), SessionState::Active);
    // A re-sent accept is harmless.
    session.accept().unwrap();
    assert_eq!(session.state(), SessionState::Active);
  }

  #[test]
  fn ended_sessions_reject_accept() {
    let mut session = JingleSession::new(peer(), false);
    session.end();
    let err = session.accept().unwrap_err();
    assert_eq!(err.condition(), "item-not-found");
  }

  #[test]
  fn stale_sid_is_item_not_found() {
    let session = JingleSession::new(peer(), false);
    assert!(session.check_sid(session.sid()).is_ok());
    let err = session.check_sid("some-old-sid").unwrap_err();
    assert_eq!(err.condition(), "item-not-found");
  }

  #[test]
  fn sids_are_unique_per_session() {
    let a = JingleSession::new(peer(), false);
    let b = JingleSession::new(peer(), false);
    assert_ne!(a.sid(), b.sid());
  }
}
