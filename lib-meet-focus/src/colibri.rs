use std::{
  collections::{HashMap, HashSet},
  fmt,
  sync::Arc,
  time::Duration,
};

use async_trait::async_trait;
use jid::BareJid;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
  bridge::Bridge,
  jingle::BridgeTransport,
  source::{EndpointSourceSet, MediaType},
  util::generate_id,
};

/// Typed outcomes of a bridge RPC, as reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeRpcError {
  /// The request was malformed; deterministic and not the bridge's fault.
  BadRequest(String),
  /// The bridge no longer knows this conference.
  ConferenceNotFound,
  Timeout,
  Transport(String),
}

impl fmt::Display for BridgeRpcError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BridgeRpcError::BadRequest(reason) => write!(f, "bad request: {}", reason),
      BridgeRpcError::ConferenceNotFound => write!(f, "conference not found on bridge"),
      BridgeRpcError::Timeout => write!(f, "bridge RPC timed out"),
      BridgeRpcError::Transport(reason) => write!(f, "bridge transport error: {}", reason),
    }
  }
}

impl std::error::Error for BridgeRpcError {}

#[derive(Debug, Clone)]
pub struct AllocationRequest {
  pub media: Vec<MediaType>,
  pub initial_sources: EndpointSourceSet,
  pub initial_last_n: Option<u32>,
  pub use_sctp: bool,
  pub force_muted_audio: bool,
  pub force_muted_video: bool,
}

#[derive(Debug, Clone)]
pub struct AllocationResponse {
  /// The bridge-side conference id, opaque to us.
  pub conference_id: String,
  pub transport: BridgeTransport,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointUpdate {
  /// The endpoint's own sources, so the bridge can relay them.
  pub sources: Option<EndpointSourceSet>,
  /// Trickle or final ICE from the client, opaque to us.
  pub transport: Option<Value>,
  pub force_mute: Option<(MediaType, bool)>,
  pub last_n: Option<u32>,
}

/// The bridge RPC surface. Implementations own the wire codec and their own
/// request deadlines are advisory; the session applies the configured
/// deadline around every call. `allocate_endpoint` is an upsert: allocating
/// an endpoint id that already exists replaces its channels.
#[async_trait]
pub trait BridgeRpc: Send + Sync {
  async fn allocate_endpoint(
    &self,
    bridge: &str,
    conference_id: Option<&str>,
    room: &BareJid,
    endpoint_id: &str,
    request: AllocationRequest,
  ) -> Result<AllocationResponse, BridgeRpcError>;

  async fn update_endpoint(
    &self,
    bridge: &str,
    conference_id: &str,
    endpoint_id: &str,
    update: EndpointUpdate,
  ) -> Result<(), BridgeRpcError>;

  async fn expire_endpoint(
    &self,
    bridge: &str,
    conference_id: &str,
    endpoint_id: &str,
  ) -> Result<(), BridgeRpcError>;

  async fn expire_conference(&self, bridge: &str, conference_id: &str)
    -> Result<(), BridgeRpcError>;

  async fn set_relays(
    &self,
    bridge: &str,
    conference_id: &str,
    relays: Vec<String>,
  ) -> Result<(), BridgeRpcError>;
}

/// How the engine should react to a failed bridge RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColibriFault {
  /// Fail the one operation; the bridge is fine.
  BadRequest(String),
  /// The bridge forgot us; restart the conference's session with it.
  StaleConference,
  /// The bridge is unhealthy; move everyone off it.
  BridgeFailure(String),
}

impl From<BridgeRpcError> for ColibriFault {
  fn from(error: BridgeRpcError) -> Self {
    match error {
      BridgeRpcError::BadRequest(reason) => ColibriFault::BadRequest(reason),
      BridgeRpcError::ConferenceNotFound => ColibriFault::StaleConference,
      BridgeRpcError::Timeout => ColibriFault::BridgeFailure("timeout".to_owned()),
      BridgeRpcError::Transport(reason) => ColibriFault::BridgeFailure(reason),
    }
  }
}

impl fmt::Display for ColibriFault {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ColibriFault::BadRequest(reason) => write!(f, "bad request: {}", reason),
      ColibriFault::StaleConference => write!(f, "stale bridge conference"),
      ColibriFault::BridgeFailure(reason) => write!(f, "bridge failure: {}", reason),
    }
  }
}

impl std::error::Error for ColibriFault {}

struct ColibriSessionInner {
  conference_id: Option<String>,
  participants: HashSet<String>,
  relays: HashSet<String>,
}

/// The conference's handle to one bridge: which participants live there and
/// the allocate/update/expire conversation about them. Operations for the
/// same participant are serialized; different participants proceed in
/// parallel.
#[derive(Clone)]
pub struct ColibriSession {
  /// Local bridge-session id, carried in offers and echoed by clients.
  pub id: String,
  pub bridge: Bridge,
  room: BareJid,
  rpc: Arc<dyn BridgeRpc>,
  rpc_timeout: Duration,
  inner: Arc<Mutex<ColibriSessionInner>>,
  participant_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl fmt::Debug for ColibriSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ColibriSession")
      .field("id", &self.id)
      .field("bridge", &self.bridge.jid)
      .finish()
  }
}

impl ColibriSession {
  pub fn new(bridge: Bridge, room: BareJid, rpc: Arc<dyn BridgeRpc>, rpc_timeout: Duration) -> Self {
    Self {
      id: generate_id(),
      bridge,
      room,
      rpc,
      rpc_timeout,
      inner: Arc::new(Mutex::new(ColibriSessionInner {
        conference_id: None,
        participants: HashSet::new(),
        relays: HashSet::new(),
      })),
      participant_locks: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  async fn participant_lock(&self, endpoint_id: &str) -> Arc<Mutex<()>> {
    self
      .participant_locks
      .lock()
      .await
      .entry(endpoint_id.to_owned())
      .or_insert_with(|| Arc::new(Mutex::new(())))
      .clone()
  }

  async fn with_deadline<T>(
    &self,
    future: impl std::future::Future<Output = Result<T, BridgeRpcError>>,
  ) -> Result<T, BridgeRpcError> {
    match tokio::time::timeout(self.rpc_timeout, future).await {
      Ok(result) => result,
      Err(_) => Err(BridgeRpcError::Timeout),
    }
  }

  pub async fn conference_id(&self) -> Option<String> {
    self.inner.lock().await.conference_id.clone()
  }

  pub async fn participants(&self) -> Vec<String> {
    let inner = self.inner.lock().await;
    inner.participants.iter().cloned().collect()
  }

  pub async fn participant_count(&self) -> usize {
    self.inner.lock().await.participants.len()
  }

  pub async fn has_participant(&self, endpoint_id: &str) -> bool {
    self.inner.lock().await.participants.contains(endpoint_id)
  }

  /// Allocate channels for one endpoint. At most one allocation per
  /// endpoint is in flight at a time.
  #[tracing::instrument(level = "debug", skip(self, request), fields(bridge = %self.bridge.jid))]
  pub async fn allocate(
    &self,
    endpoint_id: &str,
    request: AllocationRequest,
  ) -> Result<AllocationResponse, ColibriFault> {
    let lock = self.participant_lock(endpoint_id).await;
    let _guard = lock.lock().await;
    let conference_id = self.conference_id().await;
    let response = self
      .with_deadline(self.rpc.allocate_endpoint(
        &self.bridge.jid,
        conference_id.as_deref(),
        &self.room,
        endpoint_id,
        request,
      ))
      .await;
    match response {
      Ok(response) => {
        let mut inner = self.inner.lock().await;
        inner.conference_id = Some(response.conference_id.clone());
        inner.participants.insert(endpoint_id.to_owned());
        Ok(response)
      },
      Err(BridgeRpcError::ConferenceNotFound) => {
        self.inner.lock().await.conference_id = None;
        Err(ColibriFault::StaleConference)
      },
      Err(error) => Err(error.into()),
    }
  }

  #[tracing::instrument(level = "debug", skip(self, update), fields(bridge = %self.bridge.jid))]
  pub async fn update_endpoint(
    &self,
    endpoint_id: &str,
    update: EndpointUpdate,
  ) -> Result<(), ColibriFault> {
    let lock = self.participant_lock(endpoint_id).await;
    let _guard = lock.lock().await;
    let conference_id = match self.conference_id().await {
      Some(conference_id) => conference_id,
      None => return Err(ColibriFault::StaleConference),
    };
    let result = self
      .with_deadline(self.rpc.update_endpoint(
        &self.bridge.jid,
        &conference_id,
        endpoint_id,
        update,
      ))
      .await;
    match result {
      Ok(()) => Ok(()),
      Err(BridgeRpcError::ConferenceNotFound) => {
        self.inner.lock().await.conference_id = None;
        Err(ColibriFault::StaleConference)
      },
      Err(error) => Err(error.into()),
    }
  }

  pub async fn update_sources(
    &self,
    endpoint_id: &str,
    sources: EndpointSourceSet,
  ) -> Result<(), ColibriFault> {
    self
      .update_endpoint(
        endpoint_id,
        EndpointUpdate {
          sources: Some(sources),
          ..Default::default()
        },
      )
      .await
  }

  pub async fn update_transport(
    &self,
    endpoint_id: &str,
    transport: Value,
  ) -> Result<(), ColibriFault> {
    self
      .update_endpoint(
        endpoint_id,
        EndpointUpdate {
          transport: Some(transport),
          ..Default::default()
        },
      )
      .await
  }

  pub async fn force_mute(
    &self,
    endpoint_id: &str,
    media_type: MediaType,
    mute: bool,
  ) -> Result<(), ColibriFault> {
    self
      .update_endpoint(
        endpoint_id,
        EndpointUpdate {
          force_mute: Some((media_type, mute)),
          ..Default::default()
        },
      )
      .await
  }

  /// Remove one endpoint from this session. Returns true when the session
  /// became empty and should be expired.
  #[tracing::instrument(level = "debug", skip(self), fields(bridge = %self.bridge.jid))]
  pub async fn expire(&self, endpoint_id: &str) -> bool {
    let lock = self.participant_lock(endpoint_id).await;
    let _guard = lock.lock().await;
    let conference_id = {
      let mut inner = self.inner.lock().await;
      if !inner.participants.remove(endpoint_id) {
        return inner.participants.is_empty();
      }
      inner.conference_id.clone()
    };
    if let Some(conference_id) = conference_id {
      if let Err(e) = self
        .with_deadline(
          self
            .rpc
            .expire_endpoint(&self.bridge.jid, &conference_id, endpoint_id),
        )
        .await
      {
        debug!("failed to expire endpoint {}: {}", endpoint_id, e);
      }
    }
    self.inner.lock().await.participants.is_empty()
  }

  /// Expire the whole session on the bridge, best-effort.
  #[tracing::instrument(level = "debug", skip(self), fields(bridge = %self.bridge.jid))]
  pub async fn close(&self) {
    let conference_id = {
      let mut inner = self.inner.lock().await;
      inner.participants.clear();
      inner.conference_id.take()
    };
    if let Some(conference_id) = conference_id {
      if let Err(e) = self
        .with_deadline(self.rpc.expire_conference(&self.bridge.jid, &conference_id))
        .await
      {
        warn!("failed to expire conference on {}: {}", self.bridge.jid, e);
      }
    }
  }

  /// Set the octo relay mesh toward the given peer bridges.
  pub async fn set_relays(&self, relays: Vec<String>) -> Result<(), ColibriFault> {
    let conference_id = {
      let mut inner = self.inner.lock().await;
      inner.relays = relays.iter().cloned().collect();
      match &inner.conference_id {
        Some(id) => id.clone(),
        None => return Ok(()),
      }
    };
    let result = self
      .with_deadline(self.rpc.set_relays(&self.bridge.jid, &conference_id, relays))
      .await;
    match result {
      Ok(()) => Ok(()),
      Err(BridgeRpcError::ConferenceNotFound) => {
        self.inner.lock().await.conference_id = None;
        Err(ColibriFault::StaleConference)
      },
      Err(error) => Err(error.into()),
    }
  }

  pub async fn to_json(&self) -> Value {
    let inner = self.inner.lock().await;
    json!({
      "id": self.id,
      "bridge": self.bridge.jid,
      "conference_id": inner.conference_id,
      "participants": inner.participants.iter().collect::<Vec<_>>(),
      "relays": inner.relays.iter().collect::<Vec<_>>(),
    })
  }
}
