use std::{
  collections::HashMap,
  sync::{Arc, Mutex, Weak},
};

use anyhow::{Context, Result};
use jid::BareJid;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
  chatroom::{ChatRoom, RoomConfig},
  colibri::BridgeRpc,
  conference::Conference,
  config::FocusConfig,
  events::{ConferenceEvent, EventEmitter},
  jingle::JingleSender,
  selector::BridgeSelector,
  stats::FocusStats,
};

/// The nickname under which the focus occupies every room.
const FOCUS_NICKNAME: &str = "focus";

/// The process-wide collection of live conferences, keyed by room. The lock
/// is held only across insert/remove/lookup; conference work happens outside
/// it.
pub struct FocusRegistry {
  config: Arc<FocusConfig>,
  selector: Arc<BridgeSelector>,
  bridge_rpc: Arc<dyn BridgeRpc>,
  jingle: Arc<dyn JingleSender>,
  stats: Arc<FocusStats>,
  events: EventEmitter,
  conferences: Mutex<HashMap<BareJid, Conference>>,
}

impl FocusRegistry {
  pub fn new(
    config: Arc<FocusConfig>,
    selector: Arc<BridgeSelector>,
    bridge_rpc: Arc<dyn BridgeRpc>,
    jingle: Arc<dyn JingleSender>,
    stats: Arc<FocusStats>,
  ) -> Arc<Self> {
    let registry = Arc::new(Self {
      config,
      selector,
      bridge_rpc,
      jingle,
      stats,
      events: EventEmitter::new(),
      conferences: Mutex::new(HashMap::new()),
    });
    let weak: Weak<FocusRegistry> = Arc::downgrade(&registry);
    registry.events.subscribe(move |event| {
      if let ConferenceEvent::Ended { room, .. } = event {
        if let Some(registry) = weak.upgrade() {
          registry.remove(room);
        }
      }
    });
    registry
  }

  pub fn events(&self) -> &EventEmitter {
    &self.events
  }

  pub fn stats(&self) -> &FocusStats {
    &self.stats
  }

  pub fn selector(&self) -> &BridgeSelector {
    &self.selector
  }

  /// Get the conference for a room, creating it on the first allocation
  /// request: join the room as the focus, read the room's configuration
  /// form, and start the conference.
  pub async fn conference_request(&self, chat_room: Arc<dyn ChatRoom>) -> Result<Conference> {
    let room = chat_room.room_jid().clone();
    if let Some(existing) = self.get(&room) {
      return Ok(existing);
    }
    chat_room
      .join(FOCUS_NICKNAME)
      .await
      .with_context(|| format!("failed to join {}", room))?;
    let room_config = match chat_room.send_iq(room_config_query(&room)).await {
      Ok(form) => serde_json::from_value(form).unwrap_or_else(|e| {
        debug!("unparseable room configuration form: {}", e);
        RoomConfig::default()
      }),
      Err(e) => {
        debug!("failed to fetch room configuration: {:#}", e);
        RoomConfig::default()
      },
    };
    let mut conferences = self.conferences.lock().unwrap();
    let conference = conferences
      .entry(room.clone())
      .or_insert_with(|| {
        info!(room = %room, "starting conference");
        Conference::new(
          room,
          room_config,
          self.config.clone(),
          chat_room,
          self.jingle.clone(),
          self.bridge_rpc.clone(),
          self.selector.clone(),
          self.stats.clone(),
          self.events.clone(),
        )
      })
      .clone();
    Ok(conference)
  }

  pub fn get(&self, room: &BareJid) -> Option<Conference> {
    self.conferences.lock().unwrap().get(room).cloned()
  }

  fn remove(&self, room: &BareJid) {
    if self.conferences.lock().unwrap().remove(room).is_some() {
      info!(room = %room, "conference removed");
    }
  }

  pub fn conference_count(&self) -> usize {
    self.conferences.lock().unwrap().len()
  }

  /// A JSON snapshot of every live conference, for the debug surface.
  pub async fn debug_state(&self) -> Value {
    let conferences: Vec<Conference> =
      self.conferences.lock().unwrap().values().cloned().collect();
    let mut states = Vec::with_capacity(conferences.len());
    for conference in conferences {
      states.push(conference.debug_state().await);
    }
    json!({
      "conferences": states,
      "bridges": self.selector.to_json(),
      "stats": self.stats.to_json(),
    })
  }
}

fn room_config_query(room: &BareJid) -> Value {
  json!({
    "type": "get",
    "to": room.to_string(),
    "query": "http://jabber.org/protocol/muc#roomconfig",
  })
}

impl std::fmt::Debug for FocusRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FocusRegistry")
      .field("conferences", &self.conference_count())
      .finish()
  }
}
