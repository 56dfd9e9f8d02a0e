use std::collections::BTreeSet;

use crate::source::{ConferenceSourceMap, EndpointSourceSet, MediaType};

/// The per-receiver projection of conference sources. This is the only place
/// where capability filtering is applied; everything downstream sends the
/// returned maps verbatim.
#[derive(Debug, Clone)]
pub struct SourceFilter {
  media_types: BTreeSet<MediaType>,
  strip_simulcast: bool,
  /// With ssrc rewriting the bridge is authoritative for source signaling
  /// and the focus emits nothing about other endpoints' sources.
  bridge_authoritative: bool,
}

impl SourceFilter {
  pub fn new(
    media_types: BTreeSet<MediaType>,
    strip_simulcast: bool,
    bridge_authoritative: bool,
  ) -> Self {
    Self {
      media_types,
      strip_simulcast,
      bridge_authoritative,
    }
  }

  pub fn apply(&self, map: &ConferenceSourceMap) -> ConferenceSourceMap {
    if self.bridge_authoritative {
      return ConferenceSourceMap::new();
    }
    let filtered = map.filter_media(&self.media_types);
    if self.strip_simulcast {
      filtered.strip_simulcast()
    }
    else {
      filtered
    }
  }
}

/// A minimal delta to signal to one endpoint: at most one Remove followed by
/// at most one Add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceUpdate {
  Remove(ConferenceSourceMap),
  Add(ConferenceSourceMap),
}

/// Tracks what has been signaled to one endpoint versus what we intend to
/// signal, and produces minimal deltas between the two.
#[derive(Debug)]
pub struct SourceSignaling {
  signaled: ConferenceSourceMap,
  updated: ConferenceSourceMap,
  filter: SourceFilter,
}

impl SourceSignaling {
  pub fn new(filter: SourceFilter) -> Self {
    Self {
      signaled: ConferenceSourceMap::new(),
      updated: ConferenceSourceMap::new(),
      filter,
    }
  }

  pub fn source_add(&mut self, owner: &str, set: &EndpointSourceSet) {
    self.updated.add(owner, set);
  }

  pub fn source_remove(&mut self, owner: &str, set: &EndpointSourceSet) {
    self.updated.remove(owner, set);
  }

  pub fn owner_left(&mut self, owner: &str) {
    self.updated.remove_owner(owner);
  }

  /// True when there is something to flush.
  pub fn is_dirty(&self) -> bool {
    self.signaled != self.updated
  }

  /// Compute the pending delta, advance `signaled` to `updated`, and return
  /// the filtered Remove/Add pair (Remove first).
  pub fn update(&mut self) -> Vec<SourceUpdate> {
    let signaled = self.filter.apply(&self.signaled);
    let updated = self.filter.apply(&self.updated);
    let to_remove = signaled.minus(&updated);
    let to_add = updated.minus(&signaled);
    self.signaled = self.updated.clone();
    let mut result = Vec::with_capacity(2);
    if !to_remove.is_empty() {
      result.push(SourceUpdate::Remove(to_remove));
    }
    if !to_add.is_empty() {
      result.push(SourceUpdate::Add(to_add));
    }
    result
  }

  /// Force both views to `sources`, as happens when a session is
  /// (re)established, and return the filtered map for the initial offer.
  pub fn reset(&mut self, sources: ConferenceSourceMap) -> ConferenceSourceMap {
    self.signaled = sources.clone();
    self.updated = sources;
    self.filter.apply(&self.signaled)
  }

  pub fn to_json(&self) -> serde_json::Value {
    serde_json::json!({
      "signaled": self.signaled.to_json(),
      "updated": self.updated.to_json(),
    })
  }
}

#[cfg(test)]
mod tests {
  use maplit::btreeset;

  use super::*;
  use crate::source::{Semantics, Source, SsrcGroup};

  fn full_filter() -> SourceFilter {
    SourceFilter::new(
      btreeset![MediaType::Audio, MediaType::Video],
      false,
      false,
    )
  }

  fn audio_video_set(audio: u32, video: u32) -> EndpointSourceSet {
    vec![
      Source::new(audio, MediaType::Audio),
      Source::new(video, MediaType::Video),
    ]
    .into_iter()
    .collect()
  }

  #[test]
  fn no_change_yields_no_updates() {
    let mut signaling = SourceSignaling::new(full_filter());
    signaling.reset(ConferenceSourceMap::of("a", audio_video_set(1, 2)));
    assert!(!signaling.is_dirty());
    assert!(signaling.update().is_empty());
  }

  #[test]
  fn delta_is_at_most_remove_then_add() {
    let mut signaling = SourceSignaling::new(full_filter());
    signaling.reset(ConferenceSourceMap::of("a", audio_video_set(1, 2)));
    signaling.owner_left("a");
    signaling.source_add("b", &audio_video_set(10, 20));
    let updates = signaling.update();
    assert_eq!(updates.len(), 2);
    assert!(matches!(updates[0], SourceUpdate::Remove(_)));
    assert!(matches!(updates[1], SourceUpdate::Add(_)));
    // Applying the delta to the old signaled view yields the new one.
    assert!(signaling.update().is_empty());
  }

  #[test]
  fn add_then_remove_within_a_window_cancels_out() {
    let mut signaling = SourceSignaling::new(full_filter());
    signaling.reset(ConferenceSourceMap::of("a", audio_video_set(1, 2)));
    let extra: EndpointSourceSet = vec![Source::new(3, MediaType::Video)].into_iter().collect();
    signaling.source_add("a", &extra);
    signaling.source_remove("a", &extra);
    assert!(signaling.update().is_empty());
  }

  #[test]
  fn audio_only_receiver_never_sees_video() {
    let filter = SourceFilter::new(btreeset![MediaType::Audio], false, false);
    let mut signaling = SourceSignaling::new(filter);
    signaling.source_add("a", &audio_video_set(1, 2));
    let updates = signaling.update();
    assert_eq!(updates.len(), 1);
    match &updates[0] {
      SourceUpdate::Add(map) => {
        assert_eq!(
          map.get("a").unwrap().ssrcs().collect::<Vec<_>>(),
          vec![1]
        );
      },
      other => panic!("unexpected update: {:?}", other),
    }
  }

  #[test]
  fn simulcast_is_stripped_when_configured() {
    let filter = SourceFilter::new(
      btreeset![MediaType::Audio, MediaType::Video],
      true,
      false,
    );
    let mut signaling = SourceSignaling::new(filter);
    let set = EndpointSourceSet::validated(
      vec![
        Source::new(1, MediaType::Video),
        Source::new(2, MediaType::Video),
        Source::new(3, MediaType::Video),
      ],
      vec![SsrcGroup::new(Semantics::Sim, vec![1, 2, 3])],
    )
    .unwrap();
    signaling.source_add("a", &set);
    let updates = signaling.update();
    match &updates[0] {
      SourceUpdate::Add(map) => {
        assert_eq!(
          map.get("a").unwrap().ssrcs().collect::<Vec<_>>(),
          vec![1]
        );
      },
      other => panic!("unexpected update: {:?}", other),
    }
  }

  #[test]
  fn bridge_authoritative_receiver_gets_nothing() {
    let filter = SourceFilter::new(
      btreeset![MediaType::Audio, MediaType::Video],
      false,
      true,
    );
    let mut signaling = SourceSignaling::new(filter);
    signaling.source_add("a", &audio_video_set(1, 2));
    assert!(signaling.update().is_empty());
    let offer = signaling.reset(ConferenceSourceMap::of("a", audio_video_set(1, 2)));
    assert!(offer.is_empty());
  }

  #[test]
  fn reset_empties_the_queue() {
    let mut signaling = SourceSignaling::new(full_filter());
    signaling.source_add("a", &audio_video_set(1, 2));
    assert!(signaling.is_dirty());
    let offer = signaling.reset(ConferenceSourceMap::of("a", audio_video_set(1, 2)));
    assert_eq!(offer.get("a").unwrap().ssrcs().collect::<Vec<_>>(), vec![1, 2]);
    assert!(!signaling.is_dirty());
    assert!(signaling.update().is_empty());
  }
}
