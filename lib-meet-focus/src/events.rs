use std::sync::{Arc, Mutex};

use jid::BareJid;

use crate::source::MediaType;

#[derive(Debug, Clone)]
pub enum ConferenceEvent {
  ParticipantJoined {
    room: BareJid,
    endpoint_id: String,
  },
  ParticipantLeft {
    room: BareJid,
    endpoint_id: String,
  },
  SenderCountChanged {
    room: BareJid,
    media_type: MediaType,
    count: usize,
  },
  Ended {
    room: BareJid,
    reason: String,
  },
}

type Listener = Arc<dyn Fn(&ConferenceEvent) + Send + Sync>;

/// A synchronous event emitter. The subscriber list is snapshotted under a
/// short lock and listeners run outside it, so a listener may subscribe or
/// mutate the owner without deadlocking.
#[derive(Clone, Default)]
pub struct EventEmitter {
  listeners: Arc<Mutex<Vec<Listener>>>,
}

impl EventEmitter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe(&self, listener: impl Fn(&ConferenceEvent) + Send + Sync + 'static) {
    self.listeners.lock().unwrap().push(Arc::new(listener));
  }

  pub fn fire(&self, event: &ConferenceEvent) {
    let snapshot: Vec<Listener> = self.listeners.lock().unwrap().clone();
    for listener in snapshot {
      listener(event);
    }
  }
}

impl std::fmt::Debug for EventEmitter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventEmitter").finish()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  #[test]
  fn listeners_receive_events() {
    let emitter = EventEmitter::new();
    let count = Arc::new(AtomicUsize::new(0));
    let count_ = count.clone();
    emitter.subscribe(move |_| {
      count_.fetch_add(1, Ordering::SeqCst);
    });
    let room: BareJid = "room@conference.example.com".parse().unwrap();
    emitter.fire(&ConferenceEvent::Ended {
      room,
      reason: "empty".to_owned(),
    });
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn a_listener_may_subscribe_during_dispatch() {
    let emitter = EventEmitter::new();
    let emitter_ = emitter.clone();
    emitter.subscribe(move |_| {
      emitter_.subscribe(|_| {});
    });
    let room: BareJid = "room@conference.example.com".parse().unwrap();
    emitter.fire(&ConferenceEvent::Ended {
      room,
      reason: "empty".to_owned(),
    });
  }
}
