//! In-memory resource model: [`Thing`], [`Point`], [`Value`], and the diff
//! algebra the [`crate::stash`] uses to describe what changed since the
//! last flush.
//!
//! Grounded on `original_source/src/Ioticiser/Stash/{ResourceBase,Thing,Point}.py`
//! and `original_source/3rd/IoticAgent/IOT/{Thing,Point}.py`: a thing/point
//! owns a lock-guarded state blob plus an ordered, deduplicated list of
//! change markers. Where the original keys its change list and diff dicts
//! by string-prefix convention (`"label:" + lang`), this crate uses a
//! closed `Change` enum instead (spec.md §9's note to prefer tagged
//! variants over stringly-typed dispatch).

pub mod remote;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::validate::{self, ValidationError};

/// An atomic, deduplicated marker of one field having changed since the
/// last flush. Order of first insertion is preserved so the flush pool can
/// apply changes in the same sequence the original Python `ThreadPool`
/// iterates its diff dict (e.g. `public=false` before other metadata,
/// `public=true` only at the very end).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Change {
    Label(String),
    Description(String),
    Tags,
    Public,
    Location,
    Recent,
    Value(String),
    ValueShare(String),
    ShareData,
    ShareTime,
}

/// Whether a [`Point`] is a feed (thing-to-subscribers) or a control
/// (subscribers-to-thing). Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointKind {
    Feed,
    Control,
}

impl PointKind {
    /// Resource code used on the wire for a create/meta request concerning
    /// this point kind (spec.md §6.1).
    #[must_use]
    pub fn resource_code(self) -> i64 {
        match self {
            Self::Feed => crate::constants::RESOURCE_FEED,
            Self::Control => crate::constants::RESOURCE_CONTROL,
        }
    }

    #[must_use]
    pub fn meta_resource_code(self) -> i64 {
        match self {
            Self::Feed => crate::constants::RESOURCE_FEED_META,
            Self::Control => crate::constants::RESOURCE_CONTROL_META,
        }
    }

    #[must_use]
    pub fn tag_meta_resource_code(self) -> i64 {
        match self {
            Self::Feed => crate::constants::RESOURCE_FEED_TAG_META,
            Self::Control => crate::constants::RESOURCE_CONTROL_TAG_META,
        }
    }
}

/// Raw share payload: bytes plus the MIME type they were encoded with.
/// Distinct from "unset" (`None`), matching spec.md §3's note that a
/// value's held data must be distinguishable from having no data at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareData {
    pub data: Vec<u8>,
    pub mime: String,
}

/// A single typed, optionally unit-bearing data slot attached to a
/// [`Point`] (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub label: String,
    pub vtype: String,
    pub lang: Option<String>,
    pub description: Option<String>,
    pub unit: Option<String>,
    /// Share payload attached via `create_value(..., data=...)`. Collected
    /// across all of a point's values by the flush pool into a single
    /// value-scoped share (spec.md §4.F/§4.G); never persisted to the
    /// stash snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_share: Option<ShareData>,
}

/// Pending point-scoped share (`Point::share`): at least one of `data`/
/// `time` is set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SharePayload {
    pub data: Option<ShareData>,
    pub time: Option<DateTime<Utc>>,
}

struct PointState {
    new: bool,
    guid: Option<String>,
    labels: HashMap<String, String>,
    descriptions: HashMap<String, String>,
    tags: HashSet<String>,
    values: HashMap<String, Value>,
    recent_config: i32,
    pending_share: Option<SharePayload>,
    changes: Vec<Change>,
}

/// A feed or control belonging to a [`Thing`].
///
/// Setters validate their arguments and record [`Change`] markers under an
/// internal lock, mirroring `ResourceBase`/`Point.py`'s `with self.lock:`
/// pattern — from a caller's perspective a point's mutation methods are
/// atomic even though nothing here is `Send`-unsafe to call concurrently.
pub struct Point {
    pid: String,
    kind: PointKind,
    state: Mutex<PointState>,
}

impl std::fmt::Debug for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Point").field("pid", &self.pid).field("kind", &self.kind).finish()
    }
}

impl Point {
    #[must_use]
    pub fn new(pid: &str, kind: PointKind, new: bool) -> Self {
        Self {
            pid: pid.to_string(),
            kind,
            state: Mutex::new(PointState {
                new,
                guid: None,
                labels: HashMap::new(),
                descriptions: HashMap::new(),
                tags: HashSet::new(),
                values: HashMap::new(),
                recent_config: 0,
                pending_share: None,
                changes: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn pid(&self) -> &str {
        &self.pid
    }

    #[must_use]
    pub fn kind(&self) -> PointKind {
        self.kind
    }

    #[must_use]
    pub fn guid(&self) -> Option<String> {
        self.state.lock().expect("point state mutex poisoned").guid.clone()
    }

    pub fn set_guid(&self, guid: String) {
        self.state.lock().expect("point state mutex poisoned").guid = Some(guid);
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        self.state.lock().expect("point state mutex poisoned").new
    }

    /// Sets a label for the given language (`None`/`""` means unlabelled
    /// default language), recording `Change::Label` only if the value
    /// actually differs from what is already stored.
    pub fn set_label(&self, label: &str, lang: Option<&str>) -> Result<(), ValidationError> {
        let label = validate::label(label)?;
        let lang = normalise_lang(lang)?;
        let mut state = self.state.lock().expect("point state mutex poisoned");
        let changed = state.labels.get(&lang) != Some(&label);
        state.labels.insert(lang.clone(), label);
        if changed {
            record_change(&mut state.changes, Change::Label(lang));
        }
        Ok(())
    }

    pub fn set_description(&self, description: &str, lang: Option<&str>) -> Result<(), ValidationError> {
        let description = validate::description(description)?;
        let lang = normalise_lang(lang)?;
        let mut state = self.state.lock().expect("point state mutex poisoned");
        let changed = state.descriptions.get(&lang) != Some(&description);
        state.descriptions.insert(lang.clone(), description);
        if changed {
            record_change(&mut state.changes, Change::Description(lang));
        }
        Ok(())
    }

    /// Adds one or more tags, recording `Change::Tags` only if at least
    /// one of them was not already present (spec.md: tags are additive —
    /// there is no remove-tag operation).
    pub fn create_tag<S: AsRef<str>>(&self, raw_tags: &[S]) -> Result<(), ValidationError> {
        let raw: Vec<String> = raw_tags.iter().map(|s| s.as_ref().to_string()).collect();
        let new_tags = validate::tags(&raw)?;
        let mut state = self.state.lock().expect("point state mutex poisoned");
        let added = new_tags.iter().any(|t| !state.tags.contains(t));
        state.tags.extend(new_tags);
        if added {
            record_change(&mut state.changes, Change::Tags);
        }
        Ok(())
    }

    /// Defines or updates a value slot. `data`, if given, is recorded as a
    /// value-scoped pending share and flagged with `Change::ValueShare`
    /// independently of whether the value's own metadata changed (spec.md
    /// §4.E).
    pub fn create_value(
        &self,
        label: &str,
        vtype: &str,
        lang: Option<&str>,
        description: Option<&str>,
        unit: Option<&str>,
        data: Option<ShareData>,
    ) -> Result<(), ValidationError> {
        let label_s = validate::label(label)?;
        let vtype = validate::value_type(vtype)?;
        let lang = lang.map(validate::language).transpose()?;
        let description = description.map(validate::description).transpose()?;
        let unit = unit.map(validate::unit_url).transpose()?;

        let mut state = self.state.lock().expect("point state mutex poisoned");
        let existing = state.values.get(&label_s).cloned();
        let new_meta_differs = match &existing {
            None => true,
            Some(v) => (v.vtype.as_str(), &v.lang, &v.description, &v.unit) != (vtype.as_str(), &lang, &description, &unit),
        };

        let value = state.values.entry(label_s.clone()).or_insert_with(|| Value {
            label: label_s.clone(),
            vtype: vtype.clone(),
            lang: lang.clone(),
            description: description.clone(),
            unit: unit.clone(),
            pending_share: None,
        });
        if new_meta_differs {
            value.vtype = vtype;
            value.lang = lang;
            value.description = description;
            value.unit = unit;
            record_change(&mut state.changes, Change::Value(label_s.clone()));
        }
        if let Some(data) = data {
            state.values.get_mut(&label_s).expect("just inserted").pending_share = Some(data);
            record_change(&mut state.changes, Change::ValueShare(label_s));
        }
        Ok(())
    }

    /// Schedules a point-scoped share. At least one of `data`/`time` must
    /// be given.
    pub fn share(&self, data: Option<ShareData>, time: Option<DateTime<Utc>>) -> Result<(), ValidationError> {
        if data.is_none() && time.is_none() {
            return Err(ValidationError { field: "share", reason: "data or time required".into() });
        }
        let mut state = self.state.lock().expect("point state mutex poisoned");
        let payload = state.pending_share.get_or_insert_with(SharePayload::default);
        if let Some(data) = data {
            payload.data = Some(data);
            record_change(&mut state.changes, Change::ShareData);
        }
        if let Some(time) = time {
            payload.time = Some(time);
            record_change(&mut state.changes, Change::ShareTime);
        }
        Ok(())
    }

    /// Sets the recent-sample retention count: negative means "container
    /// maximum", zero disables recent-data, positive is a literal count.
    pub fn set_recent_config(&self, max_samples: i32) {
        let mut state = self.state.lock().expect("point state mutex poisoned");
        if state.recent_config != max_samples {
            state.recent_config = max_samples;
            record_change(&mut state.changes, Change::Recent);
        }
    }

    #[must_use]
    pub fn values(&self) -> HashMap<String, Value> {
        self.state.lock().expect("point state mutex poisoned").values.clone()
    }

    #[must_use]
    pub fn tags(&self) -> HashSet<String> {
        self.state.lock().expect("point state mutex poisoned").tags.clone()
    }

    #[must_use]
    pub fn recent_config(&self) -> i32 {
        self.state.lock().expect("point state mutex poisoned").recent_config
    }

    /// Takes (and clears) the accumulated change list, along with a
    /// snapshot of the state needed to build a [`PointDiff`].
    fn take_diff(&self) -> Option<PointDiff> {
        let mut state = self.state.lock().expect("point state mutex poisoned");
        let is_new = state.new;
        if state.changes.is_empty() && !is_new {
            return None;
        }
        let mut diff = PointDiff {
            pid: self.pid.clone(),
            kind: self.kind,
            new: is_new,
            tags: None,
            labels: None,
            descriptions: None,
            recent_config: None,
            share_data: None,
            share_time: None,
            values: HashMap::new(),
        };
        if is_new {
            diff.tags = Some(state.tags.clone());
            diff.labels = Some(state.labels.clone());
            diff.descriptions = Some(state.descriptions.clone());
            diff.recent_config = Some(state.recent_config);
            for (label, value) in &state.values {
                diff.values.insert(label.clone(), ValueDiff::full(value));
            }
        } else {
            for change in state.changes.clone() {
                match change {
                    Change::Tags => diff.tags = Some(state.tags.clone()),
                    Change::Label(lang) => {
                        diff.labels
                            .get_or_insert_with(HashMap::new)
                            .insert(lang.clone(), state.labels.get(&lang).cloned().unwrap_or_default());
                    }
                    Change::Description(lang) => {
                        diff.descriptions
                            .get_or_insert_with(HashMap::new)
                            .insert(lang.clone(), state.descriptions.get(&lang).cloned().unwrap_or_default());
                    }
                    Change::Recent => diff.recent_config = Some(state.recent_config),
                    Change::ShareData => {
                        if let Some(p) = &state.pending_share {
                            diff.share_data = p.data.as_ref().map(|d| d.clone());
                        }
                    }
                    Change::ShareTime => {
                        if let Some(p) = &state.pending_share {
                            diff.share_time = p.time;
                        }
                    }
                    Change::Value(label) => {
                        if let Some(v) = state.values.get(&label) {
                            diff.values.entry(label).or_insert_with(|| ValueDiff::meta_only(v));
                        }
                    }
                    Change::ValueShare(label) => {
                        if let Some(v) = state.values.get(&label) {
                            let entry = diff.values.entry(label.clone()).or_insert_with(ValueDiff::default);
                            entry.share_data = v.pending_share.clone();
                        }
                    }
                    Change::Public | Change::Location => unreachable!("thing-level change marker on a point"),
                }
            }
        }
        state.changes.clear();
        state.new = false;
        Some(diff)
    }
}

fn normalise_lang(lang: Option<&str>) -> Result<String, ValidationError> {
    match lang {
        None | Some("") => Ok(String::new()),
        Some(l) => validate::language(l),
    }
}

fn record_change(changes: &mut Vec<Change>, change: Change) {
    if !changes.contains(&change) {
        changes.push(change);
    }
}

struct ThingState {
    new: bool,
    guid: Option<String>,
    agent_id: Option<String>,
    public: bool,
    labels: HashMap<String, String>,
    descriptions: HashMap<String, String>,
    tags: HashSet<String>,
    location: Option<(f64, f64)>,
    points: HashMap<String, Point>,
    changes: Vec<Change>,
}

/// A named, optionally public, tagged and described logical device; owner
/// of zero or more [`Point`]s (spec.md §3).
pub struct Thing {
    lid: String,
    state: Mutex<ThingState>,
}

impl std::fmt::Debug for Thing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thing").field("lid", &self.lid).finish()
    }
}

impl Thing {
    /// Creates a brand-new (never-flushed) Thing.
    pub fn new(lid: &str) -> Result<Self, ValidationError> {
        let lid = validate::identifier("lid", lid)?;
        Ok(Self {
            lid,
            state: Mutex::new(ThingState {
                new: true,
                guid: None,
                agent_id: None,
                public: false,
                labels: HashMap::new(),
                descriptions: HashMap::new(),
                tags: HashSet::new(),
                location: None,
                points: HashMap::new(),
                changes: Vec::new(),
            }),
        })
    }

    /// Reconstructs a Thing from a stash snapshot (not new; no pending
    /// changes).
    #[must_use]
    pub fn from_snapshot(lid: &str, snapshot: &ThingSnapshot) -> Self {
        let mut points = HashMap::new();
        for (pid, psnap) in &snapshot.points {
            let point = Point::new(pid, psnap.kind, false);
            {
                let mut state = point.state.lock().expect("point state mutex poisoned");
                state.guid.clone_from(&psnap.guid);
                state.labels.clone_from(&psnap.labels);
                state.descriptions.clone_from(&psnap.descriptions);
                state.tags.clone_from(&psnap.tags);
                state.recent_config = psnap.recent_config;
                for (label, vsnap) in &psnap.values {
                    state.values.insert(
                        label.clone(),
                        Value {
                            label: label.clone(),
                            vtype: vsnap.vtype.clone(),
                            lang: vsnap.lang.clone(),
                            description: vsnap.description.clone(),
                            unit: vsnap.unit.clone(),
                            pending_share: None,
                        },
                    );
                }
            }
            points.insert(pid.clone(), point);
        }
        Self {
            lid: lid.to_string(),
            state: Mutex::new(ThingState {
                new: false,
                guid: snapshot.guid.clone(),
                agent_id: None,
                public: snapshot.public,
                labels: snapshot.labels.clone(),
                descriptions: snapshot.descriptions.clone(),
                tags: snapshot.tags.clone(),
                location: snapshot.location,
                points,
                changes: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn lid(&self) -> &str {
        &self.lid
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        self.state.lock().expect("thing state mutex poisoned").new
    }

    #[must_use]
    pub fn guid(&self) -> Option<String> {
        self.state.lock().expect("thing state mutex poisoned").guid.clone()
    }

    pub fn set_guid(&self, guid: String) {
        self.state.lock().expect("thing state mutex poisoned").guid = Some(guid);
    }

    pub fn set_agent_id(&self, agent_id: String) {
        self.state.lock().expect("thing state mutex poisoned").agent_id = Some(agent_id);
    }

    #[must_use]
    pub fn public(&self) -> bool {
        self.state.lock().expect("thing state mutex poisoned").public
    }

    pub fn set_public(&self, public: bool) {
        let mut state = self.state.lock().expect("thing state mutex poisoned");
        if state.public != public {
            state.public = public;
            record_change(&mut state.changes, Change::Public);
        }
    }

    pub fn set_label(&self, label: &str, lang: Option<&str>) -> Result<(), ValidationError> {
        let label = validate::label(label)?;
        let lang = normalise_lang(lang)?;
        let mut state = self.state.lock().expect("thing state mutex poisoned");
        let changed = state.labels.get(&lang) != Some(&label);
        state.labels.insert(lang.clone(), label);
        if changed {
            record_change(&mut state.changes, Change::Label(lang));
        }
        Ok(())
    }

    pub fn set_description(&self, description: &str, lang: Option<&str>) -> Result<(), ValidationError> {
        let description = validate::description(description)?;
        let lang = normalise_lang(lang)?;
        let mut state = self.state.lock().expect("thing state mutex poisoned");
        let changed = state.descriptions.get(&lang) != Some(&description);
        state.descriptions.insert(lang.clone(), description);
        if changed {
            record_change(&mut state.changes, Change::Description(lang));
        }
        Ok(())
    }

    pub fn create_tag<S: AsRef<str>>(&self, raw_tags: &[S]) -> Result<(), ValidationError> {
        let raw: Vec<String> = raw_tags.iter().map(|s| s.as_ref().to_string()).collect();
        let new_tags = validate::tags(&raw)?;
        let mut state = self.state.lock().expect("thing state mutex poisoned");
        let added = new_tags.iter().any(|t| !state.tags.contains(t));
        state.tags.extend(new_tags);
        if added {
            record_change(&mut state.changes, Change::Tags);
        }
        Ok(())
    }

    pub fn set_location(&self, lat: f64, lon: f64) -> Result<(), ValidationError> {
        let loc = validate::location(lat, lon)?;
        let mut state = self.state.lock().expect("thing state mutex poisoned");
        if state.location != Some(loc) {
            state.location = Some(loc);
            record_change(&mut state.changes, Change::Location);
        }
        Ok(())
    }

    #[must_use]
    pub fn location(&self) -> Option<(f64, f64)> {
        self.state.lock().expect("thing state mutex poisoned").location
    }

    /// Returns the point with the given id, creating it (as the given
    /// kind) if it does not yet exist. Mirrors `Thing.create_point`: an
    /// existing point's kind is never changed by this call.
    pub fn create_point(&self, pid: &str, kind: PointKind) -> Result<(), ValidationError> {
        let pid = validate::identifier("pid", pid)?;
        let mut state = self.state.lock().expect("thing state mutex poisoned");
        state.points.entry(pid.clone()).or_insert_with(|| Point::new(&pid, kind, true));
        Ok(())
    }

    pub fn create_feed(&self, pid: &str) -> Result<(), ValidationError> {
        self.create_point(pid, PointKind::Feed)
    }

    pub fn create_control(&self, pid: &str) -> Result<(), ValidationError> {
        self.create_point(pid, PointKind::Control)
    }

    /// Runs `f` with shared access to the point `pid`, if it exists.
    pub fn with_point<R>(&self, pid: &str, f: impl FnOnce(&Point) -> R) -> Option<R> {
        let state = self.state.lock().expect("thing state mutex poisoned");
        state.points.get(pid).map(f)
    }

    #[must_use]
    pub fn labels(&self) -> HashMap<String, String> {
        self.state.lock().expect("thing state mutex poisoned").labels.clone()
    }

    #[must_use]
    pub fn tags(&self) -> HashSet<String> {
        self.state.lock().expect("thing state mutex poisoned").tags.clone()
    }

    /// `true` if anything (on the thing itself or any of its points) has
    /// changed since the last flush.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        let state = self.state.lock().expect("thing state mutex poisoned");
        state.new || !state.changes.is_empty() || state.points.values().any(|p| {
            let ps = p.state.lock().expect("point state mutex poisoned");
            ps.new || !ps.changes.is_empty()
        })
    }

    /// Computes the minimal [`ThingDiff`] describing everything that has
    /// changed since the last flush, clearing every change marker (on the
    /// thing and on each of its points) as it goes. Returns `None` if
    /// nothing changed (spec.md §4.F "Diff algebra").
    pub fn take_diff(&self) -> Option<ThingDiff> {
        let mut state = self.state.lock().expect("thing state mutex poisoned");
        let point_diffs: HashMap<String, PointDiff> = state
            .points
            .values()
            .filter_map(|p| p.take_diff().map(|d| (p.pid.clone(), d)))
            .collect();

        if state.changes.is_empty() && !state.new && point_diffs.is_empty() {
            return None;
        }

        let mut diff = ThingDiff {
            lid: self.lid.clone(),
            public: None,
            tags: None,
            location: None,
            labels: None,
            descriptions: None,
            points: point_diffs,
        };

        if state.new {
            diff.tags = Some(state.tags.clone());
            diff.location = Some((state.location.map(|l| l.0), state.location.map(|l| l.1)));
            diff.labels = Some(state.labels.clone());
            diff.descriptions = Some(state.descriptions.clone());
            if state.changes.contains(&Change::Public) {
                diff.public = Some(state.public);
            }
        } else {
            for change in state.changes.clone() {
                match change {
                    Change::Public => diff.public = Some(state.public),
                    Change::Tags => diff.tags = Some(state.tags.clone()),
                    Change::Location => {
                        diff.location = Some((state.location.map(|l| l.0), state.location.map(|l| l.1)));
                    }
                    Change::Label(lang) => {
                        diff.labels
                            .get_or_insert_with(HashMap::new)
                            .insert(lang.clone(), state.labels.get(&lang).cloned().unwrap_or_default());
                    }
                    Change::Description(lang) => {
                        diff.descriptions
                            .get_or_insert_with(HashMap::new)
                            .insert(lang.clone(), state.descriptions.get(&lang).cloned().unwrap_or_default());
                    }
                    Change::Recent | Change::Value(_) | Change::ValueShare(_) | Change::ShareData | Change::ShareTime => {
                        unreachable!("point-level change marker on a thing")
                    }
                }
            }
        }

        state.changes.clear();
        state.new = false;
        Some(diff)
    }
}

impl ValueDiff {
    fn full(value: &Value) -> Self {
        Self {
            vtype: Some(value.vtype.clone()),
            lang: value.lang.clone(),
            description: value.description.clone(),
            unit: value.unit.clone(),
            share_data: value.pending_share.clone(),
        }
    }

    fn meta_only(value: &Value) -> Self {
        Self {
            vtype: Some(value.vtype.clone()),
            lang: value.lang.clone(),
            description: value.description.clone(),
            unit: value.unit.clone(),
            share_data: None,
        }
    }
}

/// Per-value diff entry: present either because the value's own metadata
/// changed (`vtype` is `Some`) or because a value-scoped share was
/// attached (`share_data` is `Some`) — or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueDiff {
    pub vtype: Option<String>,
    pub lang: Option<String>,
    pub description: Option<String>,
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_data: Option<ShareData>,
}

/// Per-point diff entry, following `Stash.__calc_diff_point`'s field
/// layout but with typed optionals instead of conditionally-present dict
/// keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDiff {
    pub pid: String,
    pub kind: PointKind,
    pub new: bool,
    pub tags: Option<HashSet<String>>,
    pub labels: Option<HashMap<String, String>>,
    pub descriptions: Option<HashMap<String, String>>,
    pub recent_config: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_data: Option<ShareData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_time: Option<DateTime<Utc>>,
    pub values: HashMap<String, ValueDiff>,
}

/// Per-thing diff entry: the minimal description of what changed since
/// the last flush, or — for a never-flushed thing — a full description
/// (spec.md §4.F "Diff algebra").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThingDiff {
    pub lid: String,
    pub public: Option<bool>,
    pub tags: Option<HashSet<String>>,
    pub location: Option<(Option<f64>, Option<f64>)>,
    pub labels: Option<HashMap<String, String>>,
    pub descriptions: Option<HashMap<String, String>>,
    pub points: HashMap<String, PointDiff>,
}

/// Persisted, container-acknowledged state of one value (spec.md §3 Stash
/// on-disk layout). Share data is deliberately absent: it is never
/// persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueSnapshot {
    pub vtype: Option<String>,
    pub lang: Option<String>,
    pub description: Option<String>,
    pub unit: Option<String>,
}

/// Persisted, container-acknowledged state of one point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointSnapshot {
    pub pid: String,
    pub kind: PointKind,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub descriptions: HashMap<String, String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub recent_config: i32,
    #[serde(default)]
    pub values: HashMap<String, ValueSnapshot>,
}

/// Persisted, container-acknowledged state of one thing — the `things`
/// entry in the stash file (spec.md §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThingSnapshot {
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub descriptions: HashMap<String, String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub location: Option<(f64, f64)>,
    #[serde(default)]
    pub points: HashMap<String, PointSnapshot>,
}

impl ThingSnapshot {
    /// Merges an applied [`ThingDiff`] into this snapshot, following
    /// `Stash.__complete_cb`: labels/descriptions are merged key-wise,
    /// everything else (tags, public, location) replaces outright, and
    /// share data/time are dropped (never persisted).
    pub fn merge_diff(&mut self, diff: &ThingDiff) {
        if let Some(public) = diff.public {
            self.public = public;
        }
        if let Some(tags) = &diff.tags {
            self.tags.clone_from(tags);
        }
        if let Some((lat, lon)) = diff.location {
            self.location = lat.zip(lon);
        }
        if let Some(labels) = &diff.labels {
            self.labels.extend(labels.clone());
        }
        if let Some(descriptions) = &diff.descriptions {
            self.descriptions.extend(descriptions.clone());
        }
        for (pid, pdiff) in &diff.points {
            let entry = self.points.entry(pid.clone()).or_insert_with(|| PointSnapshot {
                pid: pid.clone(),
                kind: pdiff.kind,
                guid: None,
                labels: HashMap::new(),
                descriptions: HashMap::new(),
                tags: HashSet::new(),
                recent_config: 0,
                values: HashMap::new(),
            });
            if let Some(tags) = &pdiff.tags {
                entry.tags.clone_from(tags);
            }
            if let Some(recent) = pdiff.recent_config {
                entry.recent_config = recent;
            }
            if let Some(labels) = &pdiff.labels {
                entry.labels.extend(labels.clone());
            }
            if let Some(descriptions) = &pdiff.descriptions {
                entry.descriptions.extend(descriptions.clone());
            }
            for (label, vdiff) in &pdiff.values {
                let ventry = entry.values.entry(label.clone()).or_default();
                if vdiff.vtype.is_some() {
                    ventry.vtype.clone_from(&vdiff.vtype);
                    ventry.lang.clone_from(&vdiff.lang);
                    ventry.description.clone_from(&vdiff.description);
                    ventry.unit.clone_from(&vdiff.unit);
                }
                // vdiff.share_data is intentionally ignored: share payloads
                // are never persisted to the snapshot.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_thing_has_full_diff() {
        let thing = Thing::new("t1").unwrap();
        thing.set_label("Temperature Sensor", None).unwrap();
        thing.create_tag(&["outdoor"]).unwrap();
        let diff = thing.take_diff().unwrap();
        assert_eq!(diff.lid, "t1");
        assert!(diff.labels.is_some());
        assert!(diff.tags.is_some());
        assert!(thing.take_diff().is_none(), "second take_diff with no changes should be None");
    }

    #[test]
    fn test_existing_thing_diff_is_minimal() {
        let snapshot = ThingSnapshot {
            public: false,
            labels: HashMap::from([(String::new(), "old".to_string())]),
            ..Default::default()
        };
        let thing = Thing::from_snapshot("t1", &snapshot);
        assert!(!thing.is_new());
        thing.set_public(true);
        let diff = thing.take_diff().unwrap();
        assert_eq!(diff.public, Some(true));
        assert!(diff.labels.is_none(), "unrelated label should not appear in the diff");
    }

    #[test]
    fn test_no_changes_yields_no_diff() {
        let snapshot = ThingSnapshot::default();
        let thing = Thing::from_snapshot("t1", &snapshot);
        assert!(thing.take_diff().is_none());
    }

    #[test]
    fn test_point_value_and_share_markers() {
        let thing = Thing::new("t1").unwrap();
        thing.create_feed("temp").unwrap();
        thing
            .with_point("temp", |p| p.create_value("reading", "float", None, None, None, None))
            .unwrap()
            .unwrap();
        let diff = thing.take_diff().unwrap();
        let pdiff = &diff.points["temp"];
        assert!(pdiff.values.contains_key("reading"));
    }

    #[test]
    fn test_value_share_data_collected_separately_from_meta() {
        let thing = Thing::new("t1").unwrap();
        thing.create_feed("temp").unwrap();
        thing
            .with_point("temp", |p| {
                p.create_value("reading", "float", None, None, None, None).unwrap();
                p.create_value(
                    "reading",
                    "float",
                    None,
                    None,
                    None,
                    Some(ShareData { data: b"1.0".to_vec(), mime: "idx/2".to_string() }),
                )
            })
            .unwrap()
            .unwrap();
        let diff = thing.take_diff().unwrap();
        let vdiff = &diff.points["temp"].values["reading"];
        assert!(vdiff.share_data.is_some());
    }

    #[test]
    fn test_merge_diff_drops_share_data() {
        let mut snapshot = ThingSnapshot::default();
        let diff = ThingDiff {
            lid: "t1".into(),
            public: Some(true),
            tags: None,
            location: None,
            labels: None,
            descriptions: None,
            points: HashMap::from([(
                "temp".into(),
                PointDiff {
                    pid: "temp".into(),
                    kind: PointKind::Feed,
                    new: true,
                    tags: None,
                    labels: None,
                    descriptions: None,
                    recent_config: Some(0),
                    share_data: Some(ShareData { data: vec![1], mime: "idx/2".into() }),
                    share_time: None,
                    values: HashMap::new(),
                },
            )]),
        };
        snapshot.merge_diff(&diff);
        assert!(snapshot.public);
        // share_data on the point diff has no snapshot counterpart by design;
        // nothing to assert beyond "merge_diff does not panic".
    }

    #[test]
    fn test_tag_validation_rejects_short_tag() {
        let thing = Thing::new("t1").unwrap();
        assert!(thing.create_tag(&["ab"]).is_err());
    }

    #[test]
    fn test_location_roundtrip() {
        let thing = Thing::new("t1").unwrap();
        thing.set_location(51.5, -0.1).unwrap();
        assert_eq!(thing.location(), Some((51.5, -0.1)));
        assert!(thing.set_location(200.0, 0.0).is_err());
    }
}
