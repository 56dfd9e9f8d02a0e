use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
  hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
  Audio,
  Video,
}

impl MediaType {
  pub fn muted_presence_element_name(&self) -> &'static str {
    match self {
      MediaType::Audio => "audiomuted",
      MediaType::Video => "videomuted",
    }
  }
}

impl fmt::Display for MediaType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MediaType::Audio => write!(f, "audio"),
      MediaType::Video => write!(f, "video"),
    }
  }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoType {
  Camera,
  Desktop,
  None,
}

/// One RTP stream advertised by an endpoint. Identity is the ssrc: two
/// sources with the same ssrc are the same source, and the later write wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
  pub ssrc: u32,
  pub media_type: MediaType,
  pub name: Option<String>,
  pub video_type: Option<VideoType>,
  pub muted: bool,
  pub msid: Option<String>,
}

impl Source {
  pub fn new(ssrc: u32, media_type: MediaType) -> Self {
    Self {
      ssrc,
      media_type,
      name: None,
      video_type: None,
      muted: false,
      msid: None,
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_video_type(mut self, video_type: VideoType) -> Self {
    self.video_type = Some(video_type);
    self
  }
}

impl PartialEq for Source {
  fn eq(&self, other: &Self) -> bool {
    self.ssrc == other.ssrc
  }
}

impl Eq for Source {}

impl Hash for Source {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.ssrc.hash(state);
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Semantics {
  #[serde(rename = "FID")]
  Fid,
  #[serde(rename = "SIM")]
  Sim,
  #[serde(rename = "FEC-FR")]
  FecFr,
}

impl fmt::Display for Semantics {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Semantics::Fid => write!(f, "FID"),
      Semantics::Sim => write!(f, "SIM"),
      Semantics::FecFr => write!(f, "FEC-FR"),
    }
  }
}

/// A grouping of ssrcs, e.g. a simulcast group or an RTX flow pairing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SsrcGroup {
  pub semantics: Semantics,
  pub ssrcs: Vec<u32>,
}

impl SsrcGroup {
  pub fn new(semantics: Semantics, ssrcs: impl Into<Vec<u32>>) -> Self {
    Self {
      semantics,
      ssrcs: ssrcs.into(),
    }
  }

  pub fn contains(&self, ssrc: u32) -> bool {
    self.ssrcs.contains(&ssrc)
  }

  fn intersects(&self, ssrcs: &BTreeSet<u32>) -> bool {
    self.ssrcs.iter().any(|ssrc| ssrcs.contains(ssrc))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
  DuplicateSsrc(u32),
  EmptyGroup(Semantics),
  GroupWithUnknownSsrc(Semantics, u32),
  MultipleVideoSources(VideoType),
}

impl fmt::Display for SourceError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourceError::DuplicateSsrc(ssrc) => write!(f, "duplicate ssrc: {}", ssrc),
      SourceError::EmptyGroup(semantics) => write!(f, "empty {} group", semantics),
      SourceError::GroupWithUnknownSsrc(semantics, ssrc) => {
        write!(f, "{} group references unknown ssrc: {}", semantics, ssrc)
      },
      SourceError::MultipleVideoSources(video_type) => {
        write!(f, "more than one {:?} video source", video_type)
      },
    }
  }
}

impl std::error::Error for SourceError {}

/// The sources and ssrc-groups advertised by a single endpoint. Immutable:
/// all operations return a new set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSourceSet {
  sources: BTreeMap<u32, Source>,
  groups: Vec<SsrcGroup>,
}

impl EndpointSourceSet {
  /// Validate an endpoint-advertised set: unique ssrcs, groups referencing
  /// only known ssrcs, at most one camera and one desktop video source.
  pub fn validated(
    sources: impl IntoIterator<Item = Source>,
    groups: impl IntoIterator<Item = SsrcGroup>,
  ) -> Result<Self, SourceError> {
    let mut by_ssrc = BTreeMap::new();
    let mut cameras = 0;
    let mut desktops = 0;
    for source in sources {
      if source.media_type == MediaType::Video {
        match source.video_type {
          Some(VideoType::Camera) => cameras += 1,
          Some(VideoType::Desktop) => desktops += 1,
          _ => {},
        }
      }
      let ssrc = source.ssrc;
      if by_ssrc.insert(ssrc, source).is_some() {
        return Err(SourceError::DuplicateSsrc(ssrc));
      }
    }
    if cameras > 1 {
      return Err(SourceError::MultipleVideoSources(VideoType::Camera));
    }
    if desktops > 1 {
      return Err(SourceError::MultipleVideoSources(VideoType::Desktop));
    }
    let mut seen_groups = Vec::new();
    for group in groups {
      if group.ssrcs.is_empty() {
        return Err(SourceError::EmptyGroup(group.semantics));
      }
      if let Some(unknown) = group.ssrcs.iter().find(|ssrc| !by_ssrc.contains_key(ssrc)) {
        return Err(SourceError::GroupWithUnknownSsrc(group.semantics, *unknown));
      }
      if !seen_groups.contains(&group) {
        seen_groups.push(group);
      }
    }
    Ok(Self {
      sources: by_ssrc,
      groups: seen_groups,
    })
  }

  /// Assemble a set from parts already known to be consistent (e.g. the
  /// output of a filter over a validated set).
  pub(crate) fn from_parts(sources: BTreeMap<u32, Source>, groups: Vec<SsrcGroup>) -> Self {
    Self { sources, groups }
  }

  pub fn is_empty(&self) -> bool {
    self.sources.is_empty()
  }

  pub fn len(&self) -> usize {
    self.sources.len()
  }

  pub fn ssrcs(&self) -> impl Iterator<Item = u32> + '_ {
    self.sources.keys().copied()
  }

  pub fn sources(&self) -> impl Iterator<Item = &Source> {
    self.sources.values()
  }

  pub fn groups(&self) -> &[SsrcGroup] {
    &self.groups
  }

  pub fn get(&self, ssrc: u32) -> Option<&Source> {
    self.sources.get(&ssrc)
  }

  pub fn has_media(&self, media_type: MediaType) -> bool {
    self.sources.values().any(|s| s.media_type == media_type)
  }

  /// Union with `other`; on ssrc collision the source from `other` wins.
  pub fn union(&self, other: &Self) -> Self {
    let mut sources = self.sources.clone();
    for source in other.sources.values() {
      sources.insert(source.ssrc, source.clone());
    }
    let mut groups = self.groups.clone();
    for group in &other.groups {
      if !groups.contains(group) {
        groups.push(group.clone());
      }
    }
    Self { sources, groups }
  }

  /// Remove the ssrcs of `other` from this set, dropping any group that
  /// references a removed ssrc.
  pub fn minus(&self, other: &Self) -> Self {
    let removed: BTreeSet<u32> = other.ssrcs().collect();
    self.without_ssrcs(&removed)
  }

  fn without_ssrcs(&self, removed: &BTreeSet<u32>) -> Self {
    let sources = self
      .sources
      .iter()
      .filter(|(ssrc, _)| !removed.contains(ssrc))
      .map(|(ssrc, source)| (*ssrc, source.clone()))
      .collect();
    let groups = self
      .groups
      .iter()
      .filter(|group| !group.intersects(removed))
      .cloned()
      .collect();
    Self { sources, groups }
  }

  /// Keep only sources of the given media types. Groups survive only if all
  /// of their ssrcs survive.
  pub fn filter_media(&self, media_types: &BTreeSet<MediaType>) -> Self {
    let removed: BTreeSet<u32> = self
      .sources
      .values()
      .filter(|s| !media_types.contains(&s.media_type))
      .map(|s| s.ssrc)
      .collect();
    self.without_ssrcs(&removed)
  }

  /// Strip simulcast: keep the first ssrc of each SIM group, drop the other
  /// encodings together with any group (and its RTX flows) built on them.
  pub fn strip_simulcast(&self) -> Self {
    let mut removed: BTreeSet<u32> = BTreeSet::new();
    for group in &self.groups {
      if group.semantics == Semantics::Sim {
        removed.extend(group.ssrcs.iter().skip(1).copied());
      }
    }
    if removed.is_empty() {
      return self.clone();
    }
    for group in &self.groups {
      if group.semantics != Semantics::Sim && group.intersects(&removed) {
        removed.extend(group.ssrcs.iter().copied());
      }
    }
    let sources = self
      .sources
      .iter()
      .filter(|(ssrc, _)| !removed.contains(ssrc))
      .map(|(ssrc, source)| (*ssrc, source.clone()))
      .collect();
    let groups = self
      .groups
      .iter()
      .filter(|group| group.semantics != Semantics::Sim && !group.intersects(&removed))
      .cloned()
      .collect();
    Self { sources, groups }
  }

  pub fn to_json(&self) -> Value {
    json!({
      "sources": self
        .sources
        .values()
        .map(|s| {
          json!({
            "ssrc": s.ssrc,
            "media_type": s.media_type,
            "name": s.name,
            "video_type": s.video_type,
            "muted": s.muted,
            "msid": s.msid,
          })
        })
        .collect::<Vec<_>>(),
      "groups": self
        .groups
        .iter()
        .map(|g| json!({ "semantics": g.semantics.to_string(), "ssrcs": g.ssrcs }))
        .collect::<Vec<_>>(),
    })
  }
}

impl FromIterator<Source> for EndpointSourceSet {
  fn from_iter<I: IntoIterator<Item = Source>>(iter: I) -> Self {
    Self {
      sources: iter.into_iter().map(|s| (s.ssrc, s)).collect(),
      groups: Vec::new(),
    }
  }
}

/// The sources of a whole conference, keyed by the owning endpoint id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConferenceSourceMap {
  owners: BTreeMap<String, EndpointSourceSet>,
}

impl ConferenceSourceMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn of(owner: impl Into<String>, set: EndpointSourceSet) -> Self {
    let mut map = Self::new();
    map.add(owner, &set);
    map
  }

  pub fn is_empty(&self) -> bool {
    self.owners.is_empty()
  }

  pub fn owners(&self) -> impl Iterator<Item = &String> {
    self.owners.keys()
  }

  pub fn get(&self, owner: &str) -> Option<&EndpointSourceSet> {
    self.owners.get(owner)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &EndpointSourceSet)> {
    self.owners.iter()
  }

  pub fn source_count(&self) -> usize {
    self.owners.values().map(|set| set.len()).sum()
  }

  pub fn add(&mut self, owner: impl Into<String>, set: &EndpointSourceSet) {
    if set.is_empty() {
      return;
    }
    let owner = owner.into();
    let merged = match self.owners.get(&owner) {
      Some(existing) => existing.union(set),
      None => set.clone(),
    };
    self.owners.insert(owner, merged);
  }

  pub fn add_map(&mut self, other: &ConferenceSourceMap) {
    for (owner, set) in &other.owners {
      self.add(owner.clone(), set);
    }
  }

  pub fn remove(&mut self, owner: &str, set: &EndpointSourceSet) {
    if let Some(existing) = self.owners.get(owner) {
      let remaining = existing.minus(set);
      if remaining.is_empty() {
        self.owners.remove(owner);
      }
      else {
        self.owners.insert(owner.to_owned(), remaining);
      }
    }
  }

  pub fn remove_map(&mut self, other: &ConferenceSourceMap) {
    for (owner, set) in &other.owners {
      self.remove(owner, set);
    }
  }

  pub fn remove_owner(&mut self, owner: &str) -> Option<EndpointSourceSet> {
    self.owners.remove(owner)
  }

  /// `self − other`, owner by owner.
  pub fn minus(&self, other: &ConferenceSourceMap) -> Self {
    let mut result = self.clone();
    result.remove_map(other);
    result
  }

  pub fn filter_media(&self, media_types: &BTreeSet<MediaType>) -> Self {
    let owners = self
      .owners
      .iter()
      .map(|(owner, set)| (owner.clone(), set.filter_media(media_types)))
      .filter(|(_, set)| !set.is_empty())
      .collect();
    Self { owners }
  }

  pub fn strip_simulcast(&self) -> Self {
    let owners = self
      .owners
      .iter()
      .map(|(owner, set)| (owner.clone(), set.strip_simulcast()))
      .filter(|(_, set)| !set.is_empty())
      .collect();
    Self { owners }
  }

  pub fn to_json(&self) -> Value {
    Value::Object(
      self
        .owners
        .iter()
        .map(|(owner, set)| (owner.clone(), set.to_json()))
        .collect(),
    )
  }
}

impl fmt::Display for ConferenceSourceMap {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_json())
  }
}

#[cfg(test)]
mod tests {
  use maplit::btreeset;

  use super::*;

  fn audio(ssrc: u32) -> Source {
    Source::new(ssrc, MediaType::Audio)
  }

  fn video(ssrc: u32) -> Source {
    Source::new(ssrc, MediaType::Video)
  }

  fn simulcast_set() -> EndpointSourceSet {
    EndpointSourceSet::validated(
      vec![
        video(1).with_video_type(VideoType::Camera),
        video(2),
        video(3),
        video(11),
        video(12),
        video(13),
        audio(100),
      ],
      vec![
        SsrcGroup::new(Semantics::Sim, vec![1, 2, 3]),
        SsrcGroup::new(Semantics::Fid, vec![1, 11]),
        SsrcGroup::new(Semantics::Fid, vec![2, 12]),
        SsrcGroup::new(Semantics::Fid, vec![3, 13]),
      ],
    )
    .unwrap()
  }

  #[test]
  fn validation_rejects_duplicate_ssrc() {
    let result = EndpointSourceSet::validated(vec![audio(1), video(1)], vec![]);
    assert_eq!(result, Err(SourceError::DuplicateSsrc(1)));
  }

  #[test]
  fn validation_rejects_group_with_unknown_ssrc() {
    let result = EndpointSourceSet::validated(
      vec![video(1)],
      vec![SsrcGroup::new(Semantics::Fid, vec![1, 2])],
    );
    assert_eq!(
      result,
      Err(SourceError::GroupWithUnknownSsrc(Semantics::Fid, 2))
    );
  }

  #[test]
  fn validation_rejects_two_cameras() {
    let result = EndpointSourceSet::validated(
      vec![
        video(1).with_video_type(VideoType::Camera),
        video(2).with_video_type(VideoType::Camera),
      ],
      vec![],
    );
    assert_eq!(
      result,
      Err(SourceError::MultipleVideoSources(VideoType::Camera))
    );
  }

  #[test]
  fn add_then_remove_is_identity() {
    let a: EndpointSourceSet = vec![audio(1), video(2)].into_iter().collect();
    let b: EndpointSourceSet = vec![audio(10), video(20)].into_iter().collect();
    let mut map = ConferenceSourceMap::new();
    map.add("a", &a);
    let before = map.clone();
    map.add("b", &b);
    map.remove("b", &b);
    assert_eq!(map, before);
  }

  #[test]
  fn add_is_idempotent() {
    let a: EndpointSourceSet = vec![audio(1), video(2)].into_iter().collect();
    let mut map = ConferenceSourceMap::new();
    map.add("a", &a);
    let once = map.clone();
    map.add("a", &a);
    assert_eq!(map, once);
  }

  #[test]
  fn removing_a_source_removes_groups_referencing_it() {
    let set = simulcast_set();
    let removed: EndpointSourceSet = vec![video(2)].into_iter().collect();
    let remaining = set.minus(&removed);
    assert!(remaining.get(2).is_none());
    assert!(!remaining
      .groups()
      .iter()
      .any(|group| group.contains(2)));
    // The unrelated FID group survives.
    assert!(remaining
      .groups()
      .contains(&SsrcGroup::new(Semantics::Fid, vec![1, 11])));
  }

  #[test]
  fn filter_media_keeps_only_requested_types() {
    let set = simulcast_set();
    let audio_only = set.filter_media(&btreeset![MediaType::Audio]);
    assert_eq!(audio_only.ssrcs().collect::<Vec<_>>(), vec![100]);
    assert!(audio_only.groups().is_empty());
  }

  #[test]
  fn filter_commutes_with_minus() {
    let a = simulcast_set();
    let b: EndpointSourceSet = vec![video(2), video(12)].into_iter().collect();
    let media = btreeset![MediaType::Video];
    let lhs = a.filter_media(&media).minus(&b.filter_media(&media));
    let rhs = a.minus(&b).filter_media(&media);
    assert_eq!(
      lhs.ssrcs().collect::<Vec<_>>(),
      rhs.ssrcs().collect::<Vec<_>>()
    );
  }

  #[test]
  fn strip_simulcast_keeps_primary_encoding_and_its_rtx() {
    let stripped = simulcast_set().strip_simulcast();
    assert_eq!(stripped.ssrcs().collect::<Vec<_>>(), vec![1, 11, 100]);
    assert_eq!(
      stripped.groups(),
      &[SsrcGroup::new(Semantics::Fid, vec![1, 11])]
    );
  }

  #[test]
  fn strip_simulcast_without_sim_groups_is_identity() {
    let set: EndpointSourceSet = vec![audio(1), video(2)].into_iter().collect();
    assert_eq!(set.strip_simulcast(), set);
  }

  #[test]
  fn map_minus_drops_empty_owners() {
    let a: EndpointSourceSet = vec![audio(1)].into_iter().collect();
    let mut map = ConferenceSourceMap::new();
    map.add("a", &a);
    let diff = map.minus(&map.clone());
    assert!(diff.is_empty());
  }

  #[test]
  fn later_write_wins_on_same_ssrc() {
    let first: EndpointSourceSet = vec![video(7).with_video_type(VideoType::Camera)]
      .into_iter()
      .collect();
    let second: EndpointSourceSet = vec![video(7).with_video_type(VideoType::Desktop)]
      .into_iter()
      .collect();
    let merged = first.union(&second);
    assert_eq!(merged.get(7).unwrap().video_type, Some(VideoType::Desktop));
  }

  #[test]
  fn json_projection_lists_owners() {
    let a: EndpointSourceSet = vec![audio(1)].into_iter().collect();
    let map = ConferenceSourceMap::of("abcd1234", a);
    let json = map.to_json();
    assert!(json.get("abcd1234").is_some());
  }
}
