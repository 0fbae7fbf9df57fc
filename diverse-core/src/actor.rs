//! Character identity and the actor snapshot that condition matching reads.
//!
//! The engine never talks to the game directly. Hosts describe a character
//! with an [`Actor`] value (identity, gender, keyword tags, faction
//! memberships, load state) and the rest of the crate only ever reads that.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Only the low 24 bits of a form id identify a record inside its source
/// file. The high byte is the load-order slot and shifts between sessions.
pub const LOCAL_ID_MASK: u32 = 0x00FF_FFFF;

// ============================================================================
// Identity
// ============================================================================

/// Stable numeric handle identifying a character (or any record) in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormId(pub u32);

impl FormId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// The record id with the load-order byte stripped.
    pub fn local(self) -> u32 {
        self.0 & LOCAL_ID_MASK
    }

    /// Parse a hex string such as `"0x0001F2A3"`, `"x1F2A3"` or `"1f2a3"`.
    pub fn parse_hex(text: &str) -> Option<Self> {
        parse_hex_u32(text).map(Self)
    }
}

impl fmt::Display for FormId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl From<u32> for FormId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

pub(crate) fn parse_hex_u32(text: &str) -> Option<u32> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .or_else(|| trimmed.strip_prefix('x'))
        .or_else(|| trimmed.strip_prefix('X'))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    // Padded ids like "0x000001F2A3" overflow from_str_radix otherwise.
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Some(0);
    }
    u32::from_str_radix(digits, 16).ok()
}

// ============================================================================
// Source-qualified references
// ============================================================================

/// A keyword or faction reference qualified by the file that defines it.
///
/// Written in data files as `"Fallout4.esm:0x0001F2A3"`. Only the low 24 bits
/// of the id are kept, so references survive load-order changes. Source names
/// compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormRef {
    source: String,
    local_id: u32,
}

impl FormRef {
    pub fn new(source: impl AsRef<str>, id: u32) -> Self {
        Self {
            source: source.as_ref().trim().to_ascii_lowercase(),
            local_id: id & LOCAL_ID_MASK,
        }
    }

    /// Parse `"source:hexid"`. Returns `None` when the id part is missing or
    /// not hex.
    pub fn parse(text: &str) -> Option<Self> {
        let (source, id) = text.rsplit_once(':')?;
        let id = parse_hex_u32(id)?;
        Some(Self::new(source, id))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }
}

impl fmt::Display for FormRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:06X}", self.source, self.local_id)
    }
}

// ============================================================================
// Gender
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    /// Decode the integer encoding used by data files: negative means unset,
    /// zero is male, anything else is female.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            c if c < 0 => None,
            0 => Some(Gender::Male),
            _ => Some(Gender::Female),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Gender::Male => 0,
            Gender::Female => 1,
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Male => write!(f, "male"),
            Gender::Female => write!(f, "female"),
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

/// A read-only view of one character, as supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub form_id: FormId,
    /// The base record this character was spawned from, if any.
    pub template_id: Option<FormId>,
    pub editor_id: String,
    pub gender: Gender,
    pub keywords: BTreeSet<FormRef>,
    pub factions: BTreeSet<FormRef>,
    /// False while the character's 3D/body data is still streaming in.
    pub fully_loaded: bool,
}

impl Actor {
    pub fn new(form_id: FormId, gender: Gender) -> Self {
        Self {
            form_id,
            template_id: None,
            editor_id: String::new(),
            gender,
            keywords: BTreeSet::new(),
            factions: BTreeSet::new(),
            fully_loaded: true,
        }
    }

    pub fn with_editor_id(mut self, editor_id: impl Into<String>) -> Self {
        self.editor_id = editor_id.into();
        self
    }

    pub fn with_template(mut self, template_id: FormId) -> Self {
        self.template_id = Some(template_id);
        self
    }

    pub fn with_keyword(mut self, keyword: FormRef) -> Self {
        self.keywords.insert(keyword);
        self
    }

    pub fn with_faction(mut self, faction: FormRef) -> Self {
        self.factions.insert(faction);
        self
    }

    pub fn with_fully_loaded(mut self, loaded: bool) -> Self {
        self.fully_loaded = loaded;
        self
    }

    pub fn has_keyword(&self, keyword: &FormRef) -> bool {
        self.keywords.contains(keyword)
    }

    pub fn in_faction(&self, faction: &FormRef) -> bool {
        self.factions.contains(faction)
    }
}

/// Serialized description of an actor, used by tooling and test fixtures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorSpec {
    #[serde(rename = "formID")]
    pub form_id: String,
    #[serde(default, rename = "templateID")]
    pub template_id: Option<String>,
    #[serde(default, rename = "editorID")]
    pub editor_id: String,
    pub gender: Gender,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub factions: Vec<String>,
    #[serde(default = "default_loaded", rename = "fullyLoaded")]
    pub fully_loaded: bool,
}

fn default_loaded() -> bool {
    true
}

impl ActorSpec {
    /// Build the runtime actor. Unparsable ids and references are dropped.
    pub fn to_actor(&self) -> Option<Actor> {
        let form_id = FormId::parse_hex(&self.form_id)?;
        let mut actor = Actor::new(form_id, self.gender)
            .with_editor_id(self.editor_id.clone())
            .with_fully_loaded(self.fully_loaded);
        actor.template_id = self.template_id.as_deref().and_then(FormId::parse_hex);
        actor.keywords = self.keywords.iter().filter_map(|k| FormRef::parse(k)).collect();
        actor.factions = self.factions.iter().filter_map(|f| FormRef::parse(f)).collect();
        Some(actor)
    }
}
