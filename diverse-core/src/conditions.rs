//! Condition sets and match scoring.
//!
//! A [`ConditionSet`] describes which characters a preset is meant for. Checking
//! it against an [`Actor`] yields a [`CoincidenceLevel`]: how *specifically*
//! the preset matched. The selector uses that score to prefer a preset aimed at
//! raiders over one that merely says "female".
//!
//! ```text
//!   gender ──► identity ──► keywords ──► factions ──► score
//!     │           │  match ⇒ FULL
//!     └───────────┴─── any mismatch ⇒ NONE
//! ```

use crate::actor::{Actor, FormId, FormRef, Gender};
use serde::de::Error as _;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use tracing::warn;

// ============================================================================
// Coincidence level
// ============================================================================

/// Match score. Numeric order is match specificity.
///
/// The individual flags combine; a set containing `KEYWORDS` always outranks
/// `FACTIONS | GENDER`. `FULL` is reserved for exact identity matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CoincidenceLevel(u8);

impl CoincidenceLevel {
    pub const NONE: Self = Self(0);
    pub const GENDER: Self = Self(1);
    pub const FACTIONS: Self = Self(2);
    pub const KEYWORDS: Self = Self(4);
    pub const FULL: Self = Self(u8::MAX);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CoincidenceLevel {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CoincidenceLevel {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for CoincidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            return write!(f, "none");
        }
        if *self == Self::FULL {
            return write!(f, "full");
        }
        let mut names = Vec::new();
        if self.contains(Self::GENDER) {
            names.push("gender");
        }
        if self.contains(Self::FACTIONS) {
            names.push("factions");
        }
        if self.contains(Self::KEYWORDS) {
            names.push("keywords");
        }
        write!(f, "{}", names.join("|"))
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Selects which checks [`ConditionSet::check`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Filter(u8);

impl Filter {
    pub const NONE: Self = Self(0);
    pub const GENDER: Self = Self(1 << 0);
    pub const FORM_ID: Self = Self(1 << 1);
    pub const EDITOR_ID: Self = Self(1 << 2);
    pub const HAS_KEYWORD: Self = Self(1 << 3);
    pub const HAS_NOT_KEYWORD: Self = Self(1 << 4);
    pub const IN_FACTION: Self = Self(1 << 5);
    pub const NOT_IN_FACTION: Self = Self(1 << 6);
    pub const ALL: Self = Self(0x7F);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Filter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for Filter {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::ALL
    }
}

// ============================================================================
// Condition set
// ============================================================================

/// The matching rule attached to a preset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConditionSet {
    pub gender: Option<Gender>,
    pub form_id: Option<FormId>,
    pub editor_id: Option<String>,
    /// Match `editor_id` as a substring instead of exactly.
    pub editor_id_contains: bool,
    pub has_keywords: BTreeSet<FormRef>,
    pub has_not_keywords: BTreeSet<FormRef>,
    pub in_factions: BTreeSet<FormRef>,
    pub not_in_factions: BTreeSet<FormRef>,
}

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gender(mut self, gender: Gender) -> Self {
        self.gender = Some(gender);
        self
    }

    pub fn with_form_id(mut self, form_id: FormId) -> Self {
        self.form_id = Some(form_id);
        self
    }

    pub fn with_editor_id(mut self, editor_id: impl Into<String>, contains: bool) -> Self {
        self.editor_id = Some(editor_id.into());
        self.editor_id_contains = contains;
        self
    }

    pub fn with_keyword(mut self, keyword: FormRef) -> Self {
        self.has_keywords.insert(keyword);
        self
    }

    pub fn without_keyword(mut self, keyword: FormRef) -> Self {
        self.has_not_keywords.insert(keyword);
        self
    }

    pub fn with_faction(mut self, faction: FormRef) -> Self {
        self.in_factions.insert(faction);
        self
    }

    pub fn without_faction(mut self, faction: FormRef) -> Self {
        self.not_in_factions.insert(faction);
        self
    }

    /// True when no constraint is set at all.
    pub fn empty(&self) -> bool {
        *self == Self::default()
    }

    /// Score how specifically this set matches `actor`.
    ///
    /// Only the checks named in `filter` run. Any failed constraint yields
    /// `NONE`; a matching form id or editor id yields `FULL` immediately.
    pub fn check(&self, actor: &Actor, filter: Filter) -> CoincidenceLevel {
        self.evaluate(actor, filter).unwrap_or(CoincidenceLevel::NONE)
    }

    /// True when no constraint selected by `filter` rejects `actor`.
    ///
    /// Unlike [`check`](Self::check) this distinguishes "rejected" from
    /// "accepted without any scoring constraint", so an empty set matches
    /// every character.
    pub fn matches(&self, actor: &Actor, filter: Filter) -> bool {
        self.evaluate(actor, filter).is_some()
    }

    fn evaluate(&self, actor: &Actor, filter: Filter) -> Option<CoincidenceLevel> {
        let mut level = CoincidenceLevel::NONE;

        if filter.contains(Filter::GENDER) {
            if let Some(gender) = self.gender {
                if gender != actor.gender {
                    return None;
                }
                level |= CoincidenceLevel::GENDER;
            }
        }

        if filter.contains(Filter::FORM_ID) {
            if let Some(form_id) = self.form_id {
                return (form_id == actor.form_id).then_some(CoincidenceLevel::FULL);
            }
        }

        if filter.contains(Filter::EDITOR_ID) {
            if let Some(editor_id) = &self.editor_id {
                let hit = if self.editor_id_contains {
                    actor.editor_id.contains(editor_id.as_str())
                } else {
                    actor.editor_id == *editor_id
                };
                return hit.then_some(CoincidenceLevel::FULL);
            }
        }

        if filter.contains(Filter::HAS_KEYWORD) && !self.has_keywords.is_empty() {
            if !self.has_keywords.iter().any(|k| actor.has_keyword(k)) {
                return None;
            }
            level |= CoincidenceLevel::KEYWORDS;
        }

        if filter.contains(Filter::HAS_NOT_KEYWORD) && !self.has_not_keywords.is_empty() {
            if self.has_not_keywords.iter().any(|k| actor.has_keyword(k)) {
                return None;
            }
            level |= CoincidenceLevel::KEYWORDS;
        }

        if filter.contains(Filter::IN_FACTION) && !self.in_factions.is_empty() {
            if !self.in_factions.iter().any(|f| actor.in_faction(f)) {
                return None;
            }
            level |= CoincidenceLevel::FACTIONS;
        }

        if filter.contains(Filter::NOT_IN_FACTION) && !self.not_in_factions.is_empty() {
            if self.not_in_factions.iter().any(|f| actor.in_faction(f)) {
                return None;
            }
            level |= CoincidenceLevel::FACTIONS;
        }

        Some(level)
    }

    /// Parse the JSON condition schema. Bad entries are logged and skipped.
    ///
    /// Only a document that is not an object at all is an error.
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        let fields = value.as_object().ok_or_else(|| {
            serde_json::Error::custom(format!("expected a condition object, found {}", value))
        })?;
        Ok(RawConditions { fields }.into_conditions())
    }
}

impl fmt::Display for ConditionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty() {
            return write!(f, "any");
        }
        let mut parts = Vec::new();
        if let Some(gender) = self.gender {
            parts.push(format!("gender={}", gender));
        }
        if let Some(form_id) = self.form_id {
            parts.push(format!("formID={}", form_id));
        }
        if let Some(editor_id) = &self.editor_id {
            let op = if self.editor_id_contains { "~" } else { "=" };
            parts.push(format!("editorID{}{}", op, editor_id));
        }
        let mut list = |name: &str, set: &BTreeSet<FormRef>| {
            if !set.is_empty() {
                let items: Vec<String> = set.iter().map(ToString::to_string).collect();
                parts.push(format!("{}=[{}]", name, items.join(",")));
            }
        };
        list("hasKeyword", &self.has_keywords);
        list("hasNotKeyword", &self.has_not_keywords);
        list("inFaction", &self.in_factions);
        list("notInFaction", &self.not_in_factions);
        write!(f, "{}", parts.join(" "))
    }
}

// ============================================================================
// File schema
// ============================================================================

/// Typed view over a condition object. A field of the wrong type is logged and
/// treated as absent; it never discards the sibling fields.
struct RawConditions<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> RawConditions<'a> {
    fn field(&self, name: &'static str) -> Option<&'a Value> {
        self.fields.get(name).filter(|value| !value.is_null())
    }

    fn mistyped(name: &'static str, expected: &'static str, value: &Value) {
        warn!(field = name, expected, value = %value, "ignoring mistyped condition field");
    }

    fn gender(&self) -> Option<Gender> {
        let value = self.field("gender")?;
        match value.as_i64() {
            Some(code) => Gender::from_code(code),
            None => {
                Self::mistyped("gender", "integer", value);
                None
            }
        }
    }

    fn string(&self, name: &'static str) -> Option<&'a str> {
        let value = self.field(name)?;
        let text = value.as_str();
        if text.is_none() {
            Self::mistyped(name, "string", value);
        }
        text
    }

    fn flag(&self, name: &'static str) -> bool {
        match self.field(name) {
            None => false,
            Some(value) => value.as_bool().unwrap_or_else(|| {
                Self::mistyped(name, "boolean", value);
                false
            }),
        }
    }

    fn form_id(&self) -> Option<FormId> {
        let text = self.string("formID")?;
        let parsed = FormId::parse_hex(text);
        if parsed.is_none() {
            warn!(form_id = %text, "ignoring unparsable formID condition");
        }
        parsed
    }

    fn refs(&self, name: &'static str) -> BTreeSet<FormRef> {
        let Some(value) = self.field(name) else {
            return BTreeSet::new();
        };
        let Some(entries) = value.as_array() else {
            Self::mistyped(name, "array", value);
            return BTreeSet::new();
        };
        entries
            .iter()
            .filter_map(|entry| {
                let parsed = entry.as_str().and_then(FormRef::parse);
                if parsed.is_none() {
                    warn!(field = name, entry = %entry, "skipping malformed reference");
                }
                parsed
            })
            .collect()
    }

    fn into_conditions(self) -> ConditionSet {
        ConditionSet {
            gender: self.gender(),
            form_id: self.form_id(),
            editor_id: self.string("editorID").filter(|id| !id.is_empty()).map(String::from),
            editor_id_contains: self.flag("editorIdContains"),
            has_keywords: self.refs("hasKeyword"),
            has_not_keywords: self.refs("hasNotKeyword"),
            in_factions: self.refs("inFaction"),
            not_in_factions: self.refs("notInFaction"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raider_kw() -> FormRef {
        FormRef::new("Fallout4.esm", 0x06B4A3)
    }

    fn settler_faction() -> FormRef {
        FormRef::new("Fallout4.esm", 0x0337F3)
    }

    fn female() -> Actor {
        Actor::new(FormId(0x0001_0001), Gender::Female).with_editor_id("EncRaiderFemale01")
    }

    #[test]
    fn test_empty_set_matches_everyone() {
        let set = ConditionSet::default();
        assert!(set.empty());
        assert!(set.matches(&female(), Filter::ALL));
        assert_eq!(set.check(&female(), Filter::ALL), CoincidenceLevel::NONE);
    }

    #[test]
    fn test_gender_mismatch_short_circuits() {
        // Even a matching form id cannot rescue a wrong gender.
        let set = ConditionSet::new()
            .with_gender(Gender::Male)
            .with_form_id(FormId(0x0001_0001))
            .with_keyword(raider_kw());
        let actor = female().with_keyword(raider_kw());
        assert_eq!(set.check(&actor, Filter::ALL), CoincidenceLevel::NONE);
        assert!(!set.matches(&actor, Filter::ALL));
    }

    #[test]
    fn test_form_id_match_is_full() {
        let set = ConditionSet::new()
            .with_form_id(FormId(0x0001_0001))
            .with_keyword(raider_kw());
        // Keyword would fail, but identity returns first.
        assert_eq!(set.check(&female(), Filter::ALL), CoincidenceLevel::FULL);
    }

    #[test]
    fn test_form_id_mismatch_is_none() {
        let set = ConditionSet::new().with_form_id(FormId(0x0002_0002));
        assert_eq!(set.check(&female(), Filter::ALL), CoincidenceLevel::NONE);
    }

    #[test]
    fn test_identity_skipped_when_filtered_out() {
        let set = ConditionSet::new()
            .with_gender(Gender::Female)
            .with_form_id(FormId(0x0002_0002));
        assert_eq!(set.check(&female(), Filter::GENDER), CoincidenceLevel::GENDER);
    }

    #[test]
    fn test_editor_id_exact_and_contains() {
        let exact = ConditionSet::new().with_editor_id("EncRaider", false);
        assert_eq!(exact.check(&female(), Filter::ALL), CoincidenceLevel::NONE);
        let contains = ConditionSet::new().with_editor_id("EncRaider", true);
        assert_eq!(contains.check(&female(), Filter::ALL), CoincidenceLevel::FULL);
    }

    #[test]
    fn test_flags_accumulate() {
        let set = ConditionSet::new()
            .with_gender(Gender::Female)
            .with_keyword(raider_kw())
            .with_faction(settler_faction());
        let actor = female().with_keyword(raider_kw()).with_faction(settler_faction());
        let level = set.check(&actor, Filter::ALL);
        assert_eq!(
            level,
            CoincidenceLevel::GENDER | CoincidenceLevel::KEYWORDS | CoincidenceLevel::FACTIONS
        );
        assert!(level < CoincidenceLevel::FULL);
    }

    #[test]
    fn test_forbidden_keyword_rejects() {
        let set = ConditionSet::new().without_keyword(raider_kw());
        assert_eq!(
            set.check(&female().with_keyword(raider_kw()), Filter::ALL),
            CoincidenceLevel::NONE
        );
        assert_eq!(set.check(&female(), Filter::ALL), CoincidenceLevel::KEYWORDS);
    }

    #[test]
    fn test_required_faction_any_of() {
        let set = ConditionSet::new()
            .with_faction(settler_faction())
            .with_faction(FormRef::new("Fallout4.esm", 0x1));
        let actor = female().with_faction(settler_faction());
        assert_eq!(set.check(&actor, Filter::ALL), CoincidenceLevel::FACTIONS);
        assert_eq!(set.check(&female(), Filter::ALL), CoincidenceLevel::NONE);
    }

    #[test]
    fn test_keywords_outrank_factions_and_gender() {
        let gender_and_factions = CoincidenceLevel::FACTIONS | CoincidenceLevel::GENDER;
        assert!(CoincidenceLevel::KEYWORDS > gender_and_factions);
        assert!(CoincidenceLevel::FACTIONS > CoincidenceLevel::GENDER);
    }

    #[test]
    fn test_from_json() {
        let set = ConditionSet::from_json(&json!({
            "gender": 1,
            "hasKeyword": ["Fallout4.esm:0x0006B4A3", "nonsense"],
            "notInFaction": ["Fallout4.esm:337F3"],
            "editorID": "",
        }))
        .unwrap();
        assert_eq!(set.gender, Some(Gender::Female));
        assert_eq!(set.has_keywords.len(), 1);
        assert!(set.not_in_factions.contains(&settler_faction()));
        assert_eq!(set.editor_id, None);
    }

    #[test]
    fn test_from_json_negative_gender_is_unset() {
        let set = ConditionSet::from_json(&json!({"gender": -1})).unwrap();
        assert!(set.empty());
    }

    #[test]
    fn test_from_json_mistyped_field_keeps_the_rest() {
        let set = ConditionSet::from_json(&json!({
            "gender": 1,
            "hasKeyword": "Fallout4.esm:6B4A3",
            "inFaction": ["Fallout4.esm:337F3"],
        }))
        .unwrap();
        assert_eq!(set.gender, Some(Gender::Female));
        assert!(set.has_keywords.is_empty());
        assert!(set.in_factions.contains(&settler_faction()));

        let set = ConditionSet::from_json(&json!({"gender": 1, "formID": 1234})).unwrap();
        assert_eq!(set.gender, Some(Gender::Female));
        assert_eq!(set.form_id, None);

        let set = ConditionSet::from_json(&json!({
            "gender": "female",
            "editorID": "EncRaider",
            "editorIdContains": "yes",
            "hasNotKeyword": [7, "Fallout4.esm:6B4A3"],
        }))
        .unwrap();
        assert_eq!(set.gender, None);
        assert_eq!(set.editor_id.as_deref(), Some("EncRaider"));
        assert!(!set.editor_id_contains);
        assert_eq!(set.has_not_keywords.len(), 1);
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(ConditionSet::from_json(&json!(["gender", 1])).is_err());
        assert!(ConditionSet::from_json(&json!({"gender": null})).unwrap().empty());
    }

    #[test]
    fn test_display() {
        let set = ConditionSet::new().with_gender(Gender::Male).with_keyword(raider_kw());
        assert_eq!(set.to_string(), "gender=male hasKeyword=[fallout4.esm:06B4A3]");
        assert_eq!(ConditionSet::new().to_string(), "any");
    }
}
