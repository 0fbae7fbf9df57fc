//! Traits through which the engine reaches the game.
//!
//! Everything here is implemented by the embedding host. The crate ships
//! in-memory implementations in [`crate::testing`].

use crate::actor::{Actor, FormId, FormRef};
use crate::preset::{Category, Overlay};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Resolves identities to live character snapshots.
pub trait ActorLookup: Send + Sync {
    /// The current state of a character, or `None` if it is not loaded.
    fn lookup(&self, id: FormId) -> Option<Actor>;

    /// Map an identity read from a snapshot to this session's identity.
    ///
    /// Load-order changes between sessions can shift the high byte.
    fn resolve_persisted(&self, id: FormId) -> Option<FormId>;

    /// Map a source-qualified reference to a runtime identity.
    ///
    /// The default only knows the base game file, which always occupies
    /// load-order slot zero.
    fn resolve_ref(&self, form: &FormRef) -> Option<FormId> {
        (form.source() == BASE_GAME_SOURCE).then(|| FormId(form.local_id()))
    }
}

/// Source name of the base game file, in the lowercase form [`FormRef`] keeps.
pub const BASE_GAME_SOURCE: &str = "fallout4.esm";

/// Body morph capability.
pub trait MorphApplier: Send + Sync {
    /// Set one morph on the character, owned by this engine.
    fn set_morph(&self, actor: &Actor, name: &str, value: f32) -> bool;

    /// Remove every morph this engine set on the character.
    fn remove_morphs(&self, actor: &Actor) -> bool;
}

/// An overlay currently applied to a character.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOverlay {
    pub uid: u32,
    pub template: String,
}

/// Surface overlay capability.
pub trait OverlayApplier: Send + Sync {
    fn add_overlay(&self, actor: &Actor, overlay: &Overlay) -> bool;

    fn remove_overlay(&self, actor: &Actor, uid: u32) -> bool;

    fn overlays(&self, actor: &Actor) -> Vec<AppliedOverlay>;
}

/// Host lifecycle notifications.
pub trait LifecycleEvents: Send + Sync {
    /// Register a handler for "character became active". Returns a token for
    /// [`unsubscribe_active`](Self::unsubscribe_active).
    fn subscribe_active(&self, handler: Box<dyn Fn(FormId) + Send + Sync>) -> u64;

    fn unsubscribe_active(&self, token: u64) -> bool;
}

/// String key-value configuration, keyed `"SECTION/key"`.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Whether a character may receive presets, per category.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Exclusion {
    #[default]
    None,
    All,
    Categories(BTreeSet<Category>),
}

impl Exclusion {
    pub fn excludes(&self, category: Category) -> bool {
        match self {
            Exclusion::None => false,
            Exclusion::All => true,
            Exclusion::Categories(set) => set.contains(&category),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Exclusion::All)
    }
}

/// Decides which characters are eligible for automatic presets.
pub trait Eligibility: Send + Sync {
    fn exclusion(&self, actor: &Actor) -> Exclusion;
}

/// Every character is eligible.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllEligible;

impl Eligibility for AllEligible {
    fn exclusion(&self, _actor: &Actor) -> Exclusion {
        Exclusion::None
    }
}

/// The capabilities presets need to change a character.
#[derive(Clone)]
pub struct Capabilities {
    pub morphs: Arc<dyn MorphApplier>,
    pub overlays: Arc<dyn OverlayApplier>,
}

impl Capabilities {
    pub fn new(morphs: Arc<dyn MorphApplier>, overlays: Arc<dyn OverlayApplier>) -> Self {
        Self { morphs, overlays }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_excludes() {
        assert!(!Exclusion::None.excludes(Category::Nails));
        assert!(Exclusion::All.excludes(Category::BodyMorphs));
        let partial = Exclusion::Categories([Category::BodyHairs].into_iter().collect());
        assert!(partial.excludes(Category::BodyHairs));
        assert!(!partial.excludes(Category::BodyMorphs));
        assert!(!partial.is_all());
    }
}
