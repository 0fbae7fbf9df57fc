//! Presets: a condition set plus a visual payload.
//!
//! A [`Preset`] is loaded once from a JSON file, then shared read-only as an
//! `Arc<Preset>` between the catalog and every assignment that references it.
//! The payload is a closed set of variants: body morph intensities, or an
//! ordered list of surface overlays.
//!
//! Applying a preset always removes whatever the engine previously put on the
//! character for that category first, so applying twice leaves the character
//! in the same state as applying once.

use crate::actor::{Actor, FormId, Gender};
use crate::conditions::{CoincidenceLevel, ConditionSet, Filter};
use crate::host::Capabilities;
use crate::validation::OverlayValidator;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Folder-level condition file shared by every preset in the folder.
pub const FOLDER_CONDITIONS_FILE: &str = "conds.json";

/// Suffix of a per-preset condition file: `<stem>_conds.json`.
pub const CONDITIONS_SUFFIX: &str = "_conds.json";

// ============================================================================
// Errors
// ============================================================================

/// Why a preset file could not be turned into a preset.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} is a condition companion file, not a preset")]
    Companion(PathBuf),

    #[error("unsupported preset file type: {0}")]
    Unsupported(PathBuf),

    #[error("preset {0} has no conditions")]
    NoConditions(String),

    #[error("preset {0} has an empty payload")]
    EmptyPayload(String),
}

// ============================================================================
// Category
// ============================================================================

/// The slot a preset occupies. A character holds at most one preset per
/// category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    BodyMorphs,
    BodyHairs,
    Nails,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::BodyMorphs, Category::BodyHairs, Category::Nails];

    pub fn name(self) -> &'static str {
        match self {
            Category::BodyMorphs => "BodyMorphs",
            Category::BodyHairs => "BodyHairs",
            Category::Nails => "Nails",
        }
    }

    /// True for categories whose payload is overlays.
    pub fn is_overlay(self) -> bool {
        !matches!(self, Category::BodyMorphs)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown category: {}", s))
    }
}

// ============================================================================
// Overlay descriptor
// ============================================================================

/// One overlay to place on a character.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub template: String,
    pub tint: [f32; 4],
    pub offset_uv: [f32; 2],
    pub scale_uv: [f32; 2],
    pub priority: i32,
}

impl Overlay {
    pub const DEFAULT_TINT: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
    pub const DEFAULT_OFFSET: [f32; 2] = [0.0, 0.0];
    pub const DEFAULT_SCALE: [f32; 2] = [1.0, 1.0];

    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            tint: Self::DEFAULT_TINT,
            offset_uv: Self::DEFAULT_OFFSET,
            scale_uv: Self::DEFAULT_SCALE,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Parse one descriptor. Malformed optional fields fall back to their
    /// defaults; a missing template id drops the overlay.
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let template = obj
            .get("template")
            .or_else(|| obj.get("id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty());
        let Some(template) = template else {
            warn!("overlay entry without template id skipped");
            return None;
        };

        let mut overlay = Overlay::new(template);
        if let Some(tint) = obj.get("tint") {
            overlay.tint = float_array(tint).unwrap_or_else(|| {
                warn!(overlay = %template, "malformed tint, using default");
                Self::DEFAULT_TINT
            });
        }
        if let Some(offset) = obj.get("offsetUV") {
            overlay.offset_uv = float_array(offset).unwrap_or_else(|| {
                warn!(overlay = %template, "malformed offsetUV, using default");
                Self::DEFAULT_OFFSET
            });
        }
        if let Some(scale) = obj.get("scaleUV") {
            overlay.scale_uv = float_array(scale).unwrap_or_else(|| {
                warn!(overlay = %template, "malformed scaleUV, using default");
                Self::DEFAULT_SCALE
            });
        }
        if let Some(priority) = obj.get("priority") {
            overlay.priority = priority
                .as_i64()
                .and_then(|p| i32::try_from(p).ok())
                .unwrap_or_else(|| {
                    warn!(overlay = %template, "malformed priority, using 0");
                    0
                });
        }
        Some(overlay)
    }
}

fn float_array<const N: usize>(value: &Value) -> Option<[f32; N]> {
    let items = value.as_array()?;
    if items.len() != N {
        return None;
    }
    let mut out = [0.0f32; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item.as_f64()? as f32;
    }
    Some(out)
}

// ============================================================================
// Known overlay registry
// ============================================================================

/// Every overlay template a category's presets can add, per gender.
///
/// Removing an overlay preset strips any of these from the character, which
/// also cleans up overlays left by a previously assigned preset.
#[derive(Debug, Default)]
pub struct KnownOverlays {
    by_gender: Mutex<BTreeMap<Gender, BTreeSet<String>>>,
}

impl KnownOverlays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register templates for one gender, or for both when `gender` is `None`.
    pub fn register<'a>(
        &self,
        gender: Option<Gender>,
        templates: impl IntoIterator<Item = &'a str>,
    ) {
        let genders = match gender {
            Some(g) => vec![g],
            None => vec![Gender::Male, Gender::Female],
        };
        let templates: Vec<&str> = templates.into_iter().collect();
        let mut by_gender = self.by_gender.lock();
        for g in genders {
            let set = by_gender.entry(g).or_default();
            set.extend(templates.iter().map(|t| t.to_string()));
        }
    }

    pub fn templates(&self, gender: Gender) -> BTreeSet<String> {
        self.by_gender.lock().get(&gender).cloned().unwrap_or_default()
    }

    /// Every registered template regardless of gender.
    pub fn all(&self) -> BTreeSet<String> {
        self.by_gender.lock().values().flatten().cloned().collect()
    }

    /// Drop templates not in `valid`.
    pub fn retain(&self, valid: &HashSet<String>) {
        for set in self.by_gender.lock().values_mut() {
            set.retain(|t| valid.contains(t));
        }
    }

    pub fn clear(&self) {
        self.by_gender.lock().clear();
    }
}

// ============================================================================
// Re-entrancy guard
// ============================================================================

/// Characters with an apply or remove in progress.
///
/// Presets of one category write the same slots on a character, so a catalog
/// hands every preset of a category the same guard.
#[derive(Debug, Default)]
pub struct InFlight {
    active: Mutex<HashSet<FormId>>,
}

/// Releases the character when dropped.
struct InFlightGuard<'a> {
    owner: &'a InFlight,
    id: FormId,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_enter(&self, id: FormId) -> Option<InFlightGuard<'_>> {
        self.active
            .lock()
            .insert(id)
            .then_some(InFlightGuard { owner: self, id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.active.lock().remove(&self.id);
    }
}

// ============================================================================
// Preset
// ============================================================================

/// What a preset changes on a character.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Morph name to intensity.
    Morphs(BTreeMap<String, f32>),
    Overlays {
        add: Vec<Overlay>,
        /// Templates to strip on removal in addition to the added ones.
        remove: Vec<String>,
    },
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Morphs(morphs) => morphs.is_empty(),
            Payload::Overlays { add, .. } => add.is_empty(),
        }
    }
}

/// An immutable named bundle of conditions and payload.
#[derive(Debug)]
pub struct Preset {
    id: String,
    category: Category,
    conditions: ConditionSet,
    payload: Payload,
    known: Arc<KnownOverlays>,
    in_flight: Arc<InFlight>,
}

impl Preset {
    /// A body morph preset.
    pub fn morphs(
        id: impl Into<String>,
        conditions: ConditionSet,
        morphs: impl IntoIterator<Item = (String, f32)>,
    ) -> Self {
        Self::new(
            id,
            Category::BodyMorphs,
            conditions,
            Payload::Morphs(morphs.into_iter().collect()),
        )
    }

    /// An overlay preset for `category`.
    pub fn overlays(
        id: impl Into<String>,
        category: Category,
        conditions: ConditionSet,
        add: Vec<Overlay>,
        remove: Vec<String>,
    ) -> Self {
        Self::new(id, category, conditions, Payload::Overlays { add, remove })
    }

    fn new(
        id: impl Into<String>,
        category: Category,
        conditions: ConditionSet,
        payload: Payload,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            conditions,
            payload,
            known: Arc::new(KnownOverlays::new()),
            in_flight: Arc::new(InFlight::new()),
        }
    }

    /// Share a category-wide overlay registry and register this preset's
    /// templates in it.
    pub fn with_known_overlays(mut self, known: Arc<KnownOverlays>) -> Self {
        if let Payload::Overlays { add, .. } = &self.payload {
            known.register(self.conditions.gender, add.iter().map(|o| o.template.as_str()));
        }
        self.known = known;
        self
    }

    /// Share a re-entrancy guard with the other presets of this category.
    pub fn with_in_flight(mut self, in_flight: Arc<InFlight>) -> Self {
        self.in_flight = in_flight;
        self
    }

    #[cfg(test)]
    pub(crate) fn shares_in_flight(&self, other: &Preset) -> bool {
        Arc::ptr_eq(&self.in_flight, &other.in_flight)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn conditions(&self) -> &ConditionSet {
        &self.conditions
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty() || self.payload.is_empty()
    }

    pub fn check(&self, actor: &Actor, filter: Filter) -> CoincidenceLevel {
        self.conditions.check(actor, filter)
    }

    /// Put this preset's payload on the character.
    ///
    /// Returns false without touching the character when another apply or
    /// remove sharing this preset's guard is running for the same character, when the
    /// character's gender does not fit, or when it is not fully loaded yet.
    pub fn apply(&self, actor: &Actor, caps: &Capabilities) -> bool {
        let Some(_guard) = self.in_flight.try_enter(actor.form_id) else {
            debug!(preset = %self.id, form_id = %actor.form_id, "apply already in progress");
            return false;
        };

        // Manual assignment only has to respect gender.
        if !self.conditions.matches(actor, Filter::GENDER) {
            debug!(preset = %self.id, form_id = %actor.form_id, "gender does not fit preset");
            return false;
        }

        if !actor.fully_loaded {
            debug!(preset = %self.id, form_id = %actor.form_id, "character not fully loaded");
            return false;
        }

        self.remove_unguarded(actor, caps);

        match &self.payload {
            Payload::Morphs(morphs) => {
                let mut applied = false;
                for (name, value) in morphs {
                    applied |= caps.morphs.set_morph(actor, name, *value);
                }
                applied
            }
            Payload::Overlays { add, .. } => {
                let mut applied = false;
                for overlay in add {
                    applied |= caps.overlays.add_overlay(actor, overlay);
                }
                applied
            }
        }
    }

    /// Strip everything of this preset's category the engine put on the
    /// character.
    pub fn remove(&self, actor: &Actor, caps: &Capabilities) -> bool {
        let Some(_guard) = self.in_flight.try_enter(actor.form_id) else {
            debug!(preset = %self.id, form_id = %actor.form_id, "remove already in progress");
            return false;
        };
        self.remove_unguarded(actor, caps)
    }

    fn remove_unguarded(&self, actor: &Actor, caps: &Capabilities) -> bool {
        if !actor.fully_loaded {
            return false;
        }
        match &self.payload {
            Payload::Morphs(_) => caps.morphs.remove_morphs(actor),
            Payload::Overlays { add, remove } => {
                let mut targets = self.known.templates(actor.gender);
                targets.extend(add.iter().map(|o| o.template.clone()));
                targets.extend(remove.iter().cloned());

                let mut removed = false;
                for applied in caps.overlays.overlays(actor) {
                    if targets.contains(&applied.template) {
                        removed |= caps.overlays.remove_overlay(actor, applied.uid);
                    }
                }
                removed
            }
        }
    }

    /// Resolve whether this preset is usable.
    pub fn is_valid_async(&self, validator: &dyn OverlayValidator) -> BoxFuture<'static, bool> {
        if self.is_empty() {
            return future::ready(false).boxed();
        }
        match &self.payload {
            Payload::Morphs(_) => future::ready(!self.conditions.empty()).boxed(),
            Payload::Overlays { add, .. } => {
                let checks: Vec<_> = add.iter().map(|o| validator.is_valid(&o.template)).collect();
                async move { future::join_all(checks).await.into_iter().all(|ok| ok) }.boxed()
            }
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load a preset of `category` from a JSON file.
    pub fn load(path: &Path, category: Category) -> Result<Self, LoadError> {
        if is_companion_file(path) {
            return Err(LoadError::Companion(path.to_path_buf()));
        }
        if !has_json_extension(path) {
            return Err(LoadError::Unsupported(path.to_path_buf()));
        }

        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let value = read_json(path)?;
        let mut conditions = resolve_conditions(path, &value);

        let payload = if category.is_overlay() {
            let add = value
                .get("add")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Overlay::from_json).collect())
                .unwrap_or_default();
            let remove = value
                .get("remove")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Payload::Overlays { add, remove }
        } else {
            if let Some(gender) = value.get("Gender").and_then(Value::as_i64) {
                if let Some(gender) = Gender::from_code(gender) {
                    conditions.gender = Some(gender);
                }
            }
            Payload::Morphs(parse_morphs(&id, &value))
        };

        if payload.is_empty() {
            return Err(LoadError::EmptyPayload(id));
        }
        if conditions.empty() {
            return Err(LoadError::NoConditions(id));
        }

        Ok(Self::new(id, category, conditions, payload))
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} [{}]", self.id, self.category)?;
        writeln!(f, "  conditions: {}", self.conditions)?;
        match &self.payload {
            Payload::Morphs(morphs) => {
                for (name, value) in morphs {
                    writeln!(f, "  morph {} = {:.3}", name, value)?;
                }
            }
            Payload::Overlays { add, remove } => {
                for overlay in add {
                    writeln!(
                        f,
                        "  overlay {} priority={} tint={:?}",
                        overlay.template, overlay.priority, overlay.tint
                    )?;
                }
                if !remove.is_empty() {
                    writeln!(f, "  removes: {}", remove.join(", "))?;
                }
            }
        }
        Ok(())
    }
}

/// True for `conds.json` and `<stem>_conds.json`.
pub fn is_companion_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy().to_ascii_lowercase();
            name == FOLDER_CONDITIONS_FILE || name.ends_with(CONDITIONS_SUFFIX)
        })
        .unwrap_or(false)
}

pub(crate) fn has_json_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn read_json(path: &Path) -> Result<Value, LoadError> {
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Conditions come from `<stem>_conds.json`, then the preset's own
/// `"conditions"` object, then the folder's `conds.json`.
fn resolve_conditions(path: &Path, value: &Value) -> ConditionSet {
    let sibling = path.file_stem().map(|stem| {
        path.with_file_name(format!("{}{}", stem.to_string_lossy(), CONDITIONS_SUFFIX))
    });
    if let Some(conditions) = sibling.as_deref().and_then(load_companion) {
        return conditions;
    }

    if let Some(embedded) = value.get("conditions") {
        match ConditionSet::from_json(embedded) {
            Ok(conditions) => return conditions,
            Err(err) => warn!(path = %path.display(), error = %err, "invalid embedded conditions"),
        }
    }

    path.parent()
        .map(|dir| dir.join(FOLDER_CONDITIONS_FILE))
        .as_deref()
        .and_then(load_companion)
        .unwrap_or_default()
}

fn load_companion(path: &Path) -> Option<ConditionSet> {
    if !path.is_file() {
        return None;
    }
    let parsed = read_json(path).and_then(|value| {
        ConditionSet::from_json(&value).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            source,
        })
    });
    match parsed {
        Ok(conditions) => Some(conditions),
        Err(err) => {
            warn!(error = %err, "ignoring condition file");
            None
        }
    }
}

fn parse_morphs(id: &str, value: &Value) -> BTreeMap<String, f32> {
    let Some(morphs) = value.get("BodyMorphs").and_then(Value::as_object) else {
        return BTreeMap::new();
    };
    morphs
        .iter()
        .filter_map(|(name, intensity)| match intensity.as_f64() {
            Some(v) => Some((name.clone(), v as f32)),
            None => {
                warn!(preset = %id, morph = %name, "non-numeric morph value skipped");
                None
            }
        })
        .collect()
}
