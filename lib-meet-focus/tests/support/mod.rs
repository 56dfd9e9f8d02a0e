//! In-memory adapter implementations for driving the engine in tests.

use std::{
  collections::{HashMap, HashSet},
  sync::{Arc, Mutex},
  time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use jid::{BareJid, FullJid};
use lib_meet_focus::{
  AllocationRequest, AllocationResponse, BridgeRpc, BridgeRpcError, BridgeStatus, BridgeTransport,
  Capability, ChatRoom, ChatRoomMember, Conference, EndpointUpdate, FocusConfig, FocusRegistry,
  IqSendError, JingleAddr, JingleSender, MemberRole, OutboundJingle, PresenceExtension,
  RoomConfig,
};
use serde_json::json;
use tokio::sync::Semaphore;

pub const ROOM: &str = "testroom@conference.example.com";

pub fn member(endpoint_id: &str) -> ChatRoomMember {
  let muc_jid: FullJid = format!("{}/{}", ROOM, endpoint_id).parse().unwrap();
  ChatRoomMember {
    endpoint_id: endpoint_id.to_owned(),
    muc_jid,
    real_jid: Some(
      format!("{}@example.com/client", endpoint_id)
        .parse()
        .unwrap(),
    ),
    role: MemberRole::Member,
    stats_id: Some(format!("stats-{}", endpoint_id)),
    region: None,
    capabilities: HashSet::from([Capability::Audio, Capability::Video, Capability::AudioMute]),
    source_infos: HashMap::new(),
    audio_muted: false,
    video_muted: false,
    is_jibri: false,
    is_jigasi: false,
    is_transcriber: false,
    is_visitor: false,
  }
}

pub fn visitor(endpoint_id: &str) -> ChatRoomMember {
  let mut member = member(endpoint_id);
  member.role = MemberRole::Visitor;
  member.is_visitor = true;
  member
}

pub fn moderator(endpoint_id: &str) -> ChatRoomMember {
  let mut member = member(endpoint_id);
  member.role = MemberRole::Moderator;
  member
}

pub struct MockChatRoom {
  room: BareJid,
  pub joined_as: Mutex<Vec<String>>,
  pub iqs: Mutex<Vec<serde_json::Value>>,
  /// Returned for every `send_iq`; defaults to a default room config form.
  pub iq_response: Mutex<serde_json::Value>,
  pub extensions: Mutex<Vec<PresenceExtension>>,
  pub removed_extensions: Mutex<Vec<String>>,
  pub granted: Mutex<Vec<FullJid>>,
  pub left: Mutex<bool>,
}

impl MockChatRoom {
  pub fn new() -> Self {
    Self {
      room: ROOM.parse().unwrap(),
      joined_as: Mutex::new(Vec::new()),
      iqs: Mutex::new(Vec::new()),
      iq_response: Mutex::new(serde_json::to_value(RoomConfig::default()).unwrap()),
      extensions: Mutex::new(Vec::new()),
      removed_extensions: Mutex::new(Vec::new()),
      granted: Mutex::new(Vec::new()),
      left: Mutex::new(false),
    }
  }
}

#[async_trait]
impl ChatRoom for MockChatRoom {
  fn room_jid(&self) -> &BareJid {
    &self.room
  }

  async fn join(&self, nickname: &str) -> Result<()> {
    self.joined_as.lock().unwrap().push(nickname.to_owned());
    Ok(())
  }

  async fn leave(&self) -> Result<()> {
    *self.left.lock().unwrap() = true;
    Ok(())
  }

  async fn set_presence_extension(&self, extension: PresenceExtension) -> Result<()> {
    self.extensions.lock().unwrap().push(extension);
    Ok(())
  }

  async fn modify_presence(
    &self,
    to_add: Vec<PresenceExtension>,
    to_remove: Vec<String>,
  ) -> Result<()> {
    self.extensions.lock().unwrap().extend(to_add);
    self.removed_extensions.lock().unwrap().extend(to_remove);
    Ok(())
  }

  async fn grant_ownership(&self, member: &FullJid) -> Result<()> {
    self.granted.lock().unwrap().push(member.clone());
    Ok(())
  }

  async fn send_iq(&self, iq: serde_json::Value) -> Result<serde_json::Value> {
    self.iqs.lock().unwrap().push(iq);
    Ok(self.iq_response.lock().unwrap().clone())
  }
}

#[derive(Default)]
pub struct MockJingle {
  pub sent: Mutex<Vec<(JingleAddr, OutboundJingle)>>,
}

impl MockJingle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn drain(&self) -> Vec<(JingleAddr, OutboundJingle)> {
    std::mem::take(&mut *self.sent.lock().unwrap())
  }

  pub fn sent_to(&self, endpoint_id: &str) -> Vec<(JingleAddr, OutboundJingle)> {
    self
      .sent
      .lock()
      .unwrap()
      .iter()
      .filter(|(addr, _)| addr.jid.resource == endpoint_id)
      .cloned()
      .collect()
  }

  fn find(
    &self,
    predicate: impl Fn(&JingleAddr, &OutboundJingle) -> bool,
  ) -> Option<(JingleAddr, OutboundJingle)> {
    self
      .sent
      .lock()
      .unwrap()
      .iter()
      .find(|(addr, message)| predicate(addr, message))
      .cloned()
  }

  /// Poll (advancing virtual time) until a matching message was sent.
  pub async fn expect(
    &self,
    what: &str,
    predicate: impl Fn(&JingleAddr, &OutboundJingle) -> bool,
  ) -> (JingleAddr, OutboundJingle) {
    for _ in 0..1_000 {
      if let Some(found) = self.find(&predicate) {
        return found;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
      "never observed {}; sent: {:#?}",
      what,
      self.sent.lock().unwrap()
    );
  }
}

#[async_trait]
impl JingleSender for MockJingle {
  async fn send(&self, addr: &JingleAddr, message: OutboundJingle) -> Result<(), IqSendError> {
    self.sent.lock().unwrap().push((addr.clone(), message));
    Ok(())
  }
}

#[derive(Default)]
struct MockBridgeState {
  next_conference: u64,
  next_seq: u64,
  pub allocations: Vec<(String, String)>,
  pub updates: Vec<(String, String, EndpointUpdate)>,
  pub expired_endpoints: Vec<(String, String)>,
  pub expired_conferences: Vec<(String, String)>,
  pub relays: HashMap<String, Vec<String>>,
  fail_next_update: HashMap<String, BridgeRpcError>,
}

#[derive(Default)]
pub struct MockBridgeRpc {
  state: Mutex<MockBridgeState>,
  gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl MockBridgeRpc {
  pub fn new() -> Self {
    Self::default()
  }

  /// Block the next allocation(s) for an endpoint until released.
  pub fn hold_allocations_for(&self, endpoint_id: &str) {
    self
      .gates
      .lock()
      .unwrap()
      .insert(endpoint_id.to_owned(), Arc::new(Semaphore::new(0)));
  }

  pub fn release_allocations_for(&self, endpoint_id: &str) {
    if let Some(gate) = self.gates.lock().unwrap().remove(endpoint_id) {
      gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
  }

  pub fn fail_next_update(&self, bridge: &str, error: BridgeRpcError) {
    self
      .state
      .lock()
      .unwrap()
      .fail_next_update
      .insert(bridge.to_owned(), error);
  }

  pub fn allocation_count(&self, bridge: &str) -> usize {
    self
      .state
      .lock()
      .unwrap()
      .allocations
      .iter()
      .filter(|(b, _)| b == bridge)
      .count()
  }

  pub fn expired_endpoints(&self) -> Vec<(String, String)> {
    self.state.lock().unwrap().expired_endpoints.clone()
  }

  pub fn expired_conferences(&self) -> Vec<(String, String)> {
    self.state.lock().unwrap().expired_conferences.clone()
  }

  pub fn relays(&self, bridge: &str) -> Option<Vec<String>> {
    self.state.lock().unwrap().relays.get(bridge).cloned()
  }

  pub fn force_mutes(&self) -> Vec<(String, String)> {
    self
      .state
      .lock()
      .unwrap()
      .updates
      .iter()
      .filter(|(_, _, update)| update.force_mute.is_some())
      .map(|(bridge, endpoint, _)| (bridge.clone(), endpoint.clone()))
      .collect()
  }
}

#[async_trait]
impl BridgeRpc for MockBridgeRpc {
  async fn allocate_endpoint(
    &self,
    bridge: &str,
    conference_id: Option<&str>,
    _room: &BareJid,
    endpoint_id: &str,
    _request: AllocationRequest,
  ) -> Result<AllocationResponse, BridgeRpcError> {
    let gate = self.gates.lock().unwrap().get(endpoint_id).cloned();
    if let Some(gate) = gate {
      let permit = gate.acquire().await.expect("gate closed");
      permit.forget();
    }
    let mut state = self.state.lock().unwrap();
    let conference_id = match conference_id {
      Some(id) => id.to_owned(),
      None => {
        state.next_conference += 1;
        format!("conf-{}-{}", bridge, state.next_conference)
      },
    };
    state.next_seq += 1;
    let seq = state.next_seq;
    state
      .allocations
      .push((bridge.to_owned(), endpoint_id.to_owned()));
    Ok(AllocationResponse {
      conference_id: conference_id.clone(),
      transport: BridgeTransport {
        bridge: bridge.to_owned(),
        payload: json!({ "conference": conference_id, "seq": seq }),
      },
    })
  }

  async fn update_endpoint(
    &self,
    bridge: &str,
    _conference_id: &str,
    endpoint_id: &str,
    update: EndpointUpdate,
  ) -> Result<(), BridgeRpcError> {
    let mut state = self.state.lock().unwrap();
    if let Some(error) = state.fail_next_update.remove(bridge) {
      return Err(error);
    }
    state
      .updates
      .push((bridge.to_owned(), endpoint_id.to_owned(), update));
    Ok(())
  }

  async fn expire_endpoint(
    &self,
    bridge: &str,
    _conference_id: &str,
    endpoint_id: &str,
  ) -> Result<(), BridgeRpcError> {
    self
      .state
      .lock()
      .unwrap()
      .expired_endpoints
      .push((bridge.to_owned(), endpoint_id.to_owned()));
    Ok(())
  }

  async fn expire_conference(
    &self,
    bridge: &str,
    conference_id: &str,
  ) -> Result<(), BridgeRpcError> {
    self
      .state
      .lock()
      .unwrap()
      .expired_conferences
      .push((bridge.to_owned(), conference_id.to_owned()));
    Ok(())
  }

  async fn set_relays(
    &self,
    bridge: &str,
    _conference_id: &str,
    relays: Vec<String>,
  ) -> Result<(), BridgeRpcError> {
    self
      .state
      .lock()
      .unwrap()
      .relays
      .insert(bridge.to_owned(), relays);
    Ok(())
  }
}

pub struct Fixture {
  pub registry: Arc<FocusRegistry>,
  pub conference: Conference,
  pub chat_room: Arc<MockChatRoom>,
  pub jingle: Arc<MockJingle>,
  pub rpc: Arc<MockBridgeRpc>,
}

impl Fixture {
  pub async fn new(config: FocusConfig) -> Self {
    Self::with_room_config(config, RoomConfig::default()).await
  }

  pub async fn with_room_config(config: FocusConfig, room_config: RoomConfig) -> Self {
    let config = Arc::new(config);
    let selector = Arc::new(lib_meet_focus::BridgeSelector::new(config.bridge.clone()));
    let rpc = Arc::new(MockBridgeRpc::new());
    let jingle = Arc::new(MockJingle::new());
    let registry = FocusRegistry::new(
      config,
      selector,
      rpc.clone(),
      jingle.clone(),
      Arc::new(lib_meet_focus::FocusStats::default()),
    );
    let chat_room = Arc::new(MockChatRoom::new());
    *chat_room.iq_response.lock().unwrap() = serde_json::to_value(room_config).unwrap();
    let conference = registry
      .conference_request(chat_room.clone())
      .await
      .expect("conference starts");
    Self {
      registry,
      conference,
      chat_room,
      jingle,
      rpc,
    }
  }

  pub fn register_bridge(&self, jid: &str, region: Option<&str>) {
    self.register_bridge_with_stress(jid, region, 0.1);
  }

  pub fn register_bridge_with_stress(&self, jid: &str, region: Option<&str>, stress: f64) {
    self.registry.selector().bridge_discovered(
      jid,
      BridgeStatus {
        region: region.map(str::to_owned),
        version: Some("2.3".to_owned()),
        relay_id: Some(format!("relay-{}", jid)),
        stress,
        packet_rate: 0,
        draining: false,
        graceful_shutdown: false,
        healthy: true,
      },
    );
  }
}

/// Poll (advancing virtual time) until the condition holds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
  for _ in 0..1_000 {
    if condition() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("condition never held: {}", what);
}
