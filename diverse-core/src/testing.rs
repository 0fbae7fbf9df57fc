//! Testing utilities for the preset engine.
//!
//! This module provides an in-memory stand-in for the game:
//! - `TestWorld` implements every host trait (actor lookup, morph and overlay
//!   capabilities, lifecycle events) and records what presets did
//! - Fixture helpers for building actors and presets tersely

use crate::actor::{Actor, FormId, FormRef, Gender};
use crate::conditions::ConditionSet;
use crate::host::{
    ActorLookup, AppliedOverlay, Capabilities, LifecycleEvents, MorphApplier, OverlayApplier,
    BASE_GAME_SOURCE,
};
use crate::preset::{Category, Overlay, Preset};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type ActiveHandler = Arc<dyn Fn(FormId) + Send + Sync>;

#[derive(Default)]
struct WorldState {
    actors: Mutex<HashMap<FormId, Actor>>,
    remapped: Mutex<HashMap<FormId, FormId>>,
    plugins: Mutex<HashMap<String, u8>>,
    forgotten: Mutex<HashSet<FormId>>,
    morphs: Mutex<HashMap<FormId, BTreeMap<String, f32>>>,
    overlays: Mutex<HashMap<FormId, Vec<AppliedOverlay>>>,
    handlers: Mutex<Vec<(u64, ActiveHandler)>>,
    next_uid: AtomicU32,
    next_token: AtomicU64,
    morph_writes: AtomicUsize,
    overlay_writes: AtomicUsize,
}

/// A scripted game world. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct TestWorld {
    state: Arc<WorldState>,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities that write into this world.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::new(Arc::new(self.clone()), Arc::new(self.clone()))
    }

    // ========================================================================
    // Actors
    // ========================================================================

    pub fn add_actor(&self, actor: Actor) {
        self.state.actors.lock().insert(actor.form_id, actor);
    }

    pub fn actor(&self, id: FormId) -> Option<Actor> {
        self.state.actors.lock().get(&id).cloned()
    }

    /// Make a persisted identity resolve to a different live identity.
    pub fn remap(&self, persisted: FormId, live: FormId) {
        self.state.remapped.lock().insert(persisted, live);
    }

    /// Place a plugin at a load-order slot so its references resolve.
    pub fn add_plugin(&self, name: &str, slot: u8) {
        self.state.plugins.lock().insert(name.to_ascii_lowercase(), slot);
    }

    /// Make a persisted identity unresolvable, as if its plugin was removed.
    pub fn forget(&self, persisted: FormId) {
        self.state.forgotten.lock().insert(persisted);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Fire "character became active" to every registered handler.
    pub fn activate(&self, id: FormId) {
        let handlers: Vec<ActiveHandler> = self
            .state
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(id);
        }
    }

    pub fn lifecycle_handlers(&self) -> usize {
        self.state.handlers.lock().len()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn morphs_of(&self, id: FormId) -> BTreeMap<String, f32> {
        self.state.morphs.lock().get(&id).cloned().unwrap_or_default()
    }

    /// Templates currently on the character, sorted.
    pub fn overlay_templates(&self, id: FormId) -> Vec<String> {
        let mut templates: Vec<String> = self
            .state
            .overlays
            .lock()
            .get(&id)
            .map(|list| list.iter().map(|o| o.template.clone()).collect())
            .unwrap_or_default();
        templates.sort();
        templates
    }

    /// Put an overlay on the character that no preset knows about.
    pub fn add_foreign_overlay(&self, id: FormId, template: &str) {
        let uid = self.state.next_uid.fetch_add(1, Ordering::SeqCst);
        self.state
            .overlays
            .lock()
            .entry(id)
            .or_default()
            .push(AppliedOverlay {
                uid,
                template: template.to_string(),
            });
    }

    /// Total `set_morph` calls so far.
    pub fn morph_writes(&self) -> usize {
        self.state.morph_writes.load(Ordering::SeqCst)
    }

    /// Total `add_overlay` calls so far.
    pub fn overlay_writes(&self) -> usize {
        self.state.overlay_writes.load(Ordering::SeqCst)
    }
}

impl ActorLookup for TestWorld {
    fn lookup(&self, id: FormId) -> Option<Actor> {
        self.actor(id)
    }

    fn resolve_persisted(&self, id: FormId) -> Option<FormId> {
        if self.state.forgotten.lock().contains(&id) {
            return None;
        }
        Some(self.state.remapped.lock().get(&id).copied().unwrap_or(id))
    }

    fn resolve_ref(&self, form: &FormRef) -> Option<FormId> {
        if form.source() == BASE_GAME_SOURCE {
            return Some(FormId(form.local_id()));
        }
        let slot = *self.state.plugins.lock().get(form.source())?;
        Some(FormId((u32::from(slot) << 24) | form.local_id()))
    }
}

impl MorphApplier for TestWorld {
    fn set_morph(&self, actor: &Actor, name: &str, value: f32) -> bool {
        self.state.morph_writes.fetch_add(1, Ordering::SeqCst);
        self.state
            .morphs
            .lock()
            .entry(actor.form_id)
            .or_default()
            .insert(name.to_string(), value);
        true
    }

    fn remove_morphs(&self, actor: &Actor) -> bool {
        self.state.morphs.lock().remove(&actor.form_id).is_some()
    }
}

impl OverlayApplier for TestWorld {
    fn add_overlay(&self, actor: &Actor, overlay: &Overlay) -> bool {
        self.state.overlay_writes.fetch_add(1, Ordering::SeqCst);
        self.add_foreign_overlay(actor.form_id, &overlay.template);
        true
    }

    fn remove_overlay(&self, actor: &Actor, uid: u32) -> bool {
        let mut overlays = self.state.overlays.lock();
        let Some(list) = overlays.get_mut(&actor.form_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|o| o.uid != uid);
        list.len() != before
    }

    fn overlays(&self, actor: &Actor) -> Vec<AppliedOverlay> {
        self.state
            .overlays
            .lock()
            .get(&actor.form_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl LifecycleEvents for TestWorld {
    fn subscribe_active(&self, handler: Box<dyn Fn(FormId) + Send + Sync>) -> u64 {
        let token = self.state.next_token.fetch_add(1, Ordering::SeqCst);
        self.state.handlers.lock().push((token, Arc::from(handler)));
        token
    }

    fn unsubscribe_active(&self, token: u64) -> bool {
        let mut handlers = self.state.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(t, _)| *t != token);
        handlers.len() != before
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// A keyword or faction in the base game file.
pub fn base_ref(id: u32) -> FormRef {
    FormRef::new(BASE_GAME_SOURCE, id)
}

pub fn female(id: u32) -> Actor {
    Actor::new(FormId(id), Gender::Female)
}

pub fn male(id: u32) -> Actor {
    Actor::new(FormId(id), Gender::Male)
}

/// A single-morph preset.
pub fn morph_preset(id: &str, conditions: ConditionSet) -> Preset {
    Preset::morphs(id, conditions, [(format!("{}_morph", id), 0.5)])
}

/// A single-overlay preset whose template shares the preset's id.
pub fn overlay_preset(id: &str, category: Category, conditions: ConditionSet) -> Preset {
    Preset::overlays(id, category, conditions, vec![Overlay::new(id)], Vec::new())
}
