//! Per-character assignment store.
//!
//! The store remembers which presets each character received, re-applies
//! them whenever the character becomes active, and persists them in save
//! files.
//!
//! ```text
//!                catalog validated ─┐
//!                                   ├─► Ready ──► reset() ──► NotReady
//!             snapshot restored  ───┘
//!
//!   character active ─┬─ NotReady ─► deferred queue (drained on Ready)
//!                     └─ Ready ────► existing assignment? apply
//!                                    else select, record, apply
//! ```
//!
//! Construction is two-phase: build the [`Catalog`] first, then hand it to
//! [`AssignmentStore::new`] together with the host collaborators. The store
//! subscribes to the catalog itself and only holds weak references in its
//! callbacks, so dropping the last store handle releases everything.

use crate::actor::FormId;
use crate::assignment::AssignmentSet;
use crate::catalog::{Catalog, ValidationReport};
use crate::deferred::DeferredQueue;
use crate::events::{SubscriptionId, Subscribers};
use crate::host::{ActorLookup, AllEligible, Capabilities, Eligibility, LifecycleEvents};
use crate::persist::{self, PersistError, SnapshotRecord};
use crate::preset::Preset;
use crate::selector::Selector;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// What handling one "character became active" notification did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The store was not ready; the character was queued.
    Deferred,
    /// The identity did not resolve to a character.
    Unknown,
    /// The character is fully excluded.
    Excluded,
    /// An existing assignment was re-applied.
    Reapplied { applied: bool },
    /// A new assignment was selected and recorded.
    Assigned { applied: bool },
    /// No preset matched the character.
    NoMatch,
}

/// Host collaborators the store works through.
#[derive(Clone)]
pub struct StoreDeps {
    pub actors: Arc<dyn ActorLookup>,
    pub capabilities: Capabilities,
    pub eligibility: Arc<dyn Eligibility>,
}

impl StoreDeps {
    pub fn new(actors: Arc<dyn ActorLookup>, capabilities: Capabilities) -> Self {
        Self {
            actors,
            capabilities,
            eligibility: Arc::new(AllEligible),
        }
    }

    pub fn with_eligibility(mut self, eligibility: Arc<dyn Eligibility>) -> Self {
        self.eligibility = eligibility;
        self
    }
}

struct StoreState {
    catalog: Catalog,
    selector: Selector,
    deps: StoreDeps,
    assignments: Mutex<HashMap<FormId, AssignmentSet>>,
    deferred: DeferredQueue,
    restored: AtomicBool,
    on_restored: Subscribers<usize>,
    on_character_active: Subscribers<FormId>,
    validated_subscription: Mutex<Option<SubscriptionId>>,
    lifecycle: Mutex<Option<(Arc<dyn LifecycleEvents>, u64)>>,
}

/// Shared handle to the assignment store. Clones refer to the same store.
#[derive(Clone)]
pub struct AssignmentStore {
    state: Arc<StoreState>,
}

impl fmt::Debug for AssignmentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssignmentStore")
            .field("assignments", &self.len())
            .field("pending", &self.pending_len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl AssignmentStore {
    /// Wire a store to an existing catalog.
    pub fn new(catalog: Catalog, deps: StoreDeps) -> Self {
        let state = Arc::new(StoreState {
            selector: Selector::new(catalog.clone()),
            catalog,
            deps,
            assignments: Mutex::new(HashMap::new()),
            deferred: DeferredQueue::new(),
            restored: AtomicBool::new(false),
            on_restored: Subscribers::new(),
            on_character_active: Subscribers::new(),
            validated_subscription: Mutex::new(None),
            lifecycle: Mutex::new(None),
        });

        let weak: Weak<StoreState> = Arc::downgrade(&state);
        let id = state.catalog.subscribe_validated(move |report| {
            if let Some(state) = weak.upgrade() {
                state.catalog_validated(report);
            }
        });
        *state.validated_subscription.lock() = Some(id);

        Self { state }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.state.catalog
    }

    /// Ready once the catalog is validated and a snapshot has been restored.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Handle "character became active".
    pub fn on_character_active(&self, id: FormId) -> Activation {
        self.state.character_active(id)
    }

    /// Register with the host's lifecycle events. Replaces any previous
    /// registration.
    pub fn attach(&self, events: Arc<dyn LifecycleEvents>) {
        self.detach();
        let weak = Arc::downgrade(&self.state);
        let token = events.subscribe_active(Box::new(move |id| {
            if let Some(state) = weak.upgrade() {
                state.character_active(id);
            }
        }));
        *self.state.lifecycle.lock() = Some((events, token));
    }

    /// Stop receiving host lifecycle events.
    pub fn detach(&self) -> bool {
        self.state.detach()
    }

    /// Drain deferred characters if ready. Returns how many were processed.
    pub fn flush_deferred(&self) -> usize {
        self.state.flush_if_ready()
    }

    /// Forget all assignments and wait for the next restore.
    pub fn reset(&self) {
        self.state.assignments.lock().clear();
        self.state.restored.store(false, Ordering::SeqCst);
        info!("assignment store reset");
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Replace all assignments with those in a snapshot. Never fails:
    /// unreadable snapshots restore nothing. Returns how many characters
    /// were restored.
    pub fn restore(&self, bytes: &[u8]) -> usize {
        self.restore_records(persist::decode(bytes))
    }

    /// Replace all assignments with decoded records.
    pub fn restore_records(&self, records: Vec<SnapshotRecord>) -> usize {
        let index: HashMap<String, Arc<Preset>> = self
            .state
            .catalog
            .presets()
            .into_iter()
            .map(|p| (p.id().to_string(), p))
            .collect();

        let mut restored = HashMap::new();
        for record in records {
            let Some(id) = self.state.deps.actors.resolve_persisted(FormId(record.form_id)) else {
                warn!(form_id = %FormId(record.form_id), "persisted identity no longer resolves");
                continue;
            };
            let mut set = AssignmentSet::new();
            for preset_id in &record.presets {
                match index.get(preset_id) {
                    Some(preset) => {
                        set.insert(preset.clone());
                    }
                    None => warn!(form_id = %id, preset = %preset_id, "unknown preset in snapshot"),
                }
            }
            if !set.is_empty() {
                restored.insert(id, set);
            }
        }

        let count = restored.len();
        *self.state.assignments.lock() = restored;
        self.state.restored.store(true, Ordering::SeqCst);
        info!(count, "assignments restored");

        self.state.on_restored.emit(&count);
        self.state.flush_if_ready();
        count
    }

    /// Encode all assignments, sorted by identity.
    pub fn snapshot(&self) -> Result<Vec<u8>, PersistError> {
        persist::encode(&self.records())
    }

    /// Current assignments as snapshot records, sorted by identity.
    pub fn records(&self) -> Vec<SnapshotRecord> {
        let mut records: Vec<SnapshotRecord> = self
            .state
            .assignments
            .lock()
            .iter()
            .map(|(id, set)| SnapshotRecord::new(id.raw(), set.preset_ids()))
            .collect();
        records.sort();
        records
    }

    // ========================================================================
    // Manual assignment
    // ========================================================================

    /// Put `preset` in the character's slot for its category, returning the
    /// preset it replaced.
    pub fn update_assignment(&self, id: FormId, preset: Arc<Preset>) -> Option<Arc<Preset>> {
        debug!(form_id = %id, preset = %preset.id(), "assignment updated");
        self.state
            .assignments
            .lock()
            .entry(id)
            .or_default()
            .insert(preset)
    }

    /// Apply the character's recorded presets. True if any applied.
    pub fn apply_assignment(&self, id: FormId) -> bool {
        let Some(set) = self.assignment(id) else {
            return false;
        };
        let Some(actor) = self.state.deps.actors.lookup(id) else {
            return false;
        };
        set.apply(&actor, &self.state.deps.capabilities, |_| false)
    }

    pub fn assignment(&self, id: FormId) -> Option<AssignmentSet> {
        self.state.assignments.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: FormId) -> bool {
        self.state.assignments.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.assignments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.state.deferred.len()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Called with the number of restored characters after each restore.
    pub fn subscribe_restored(
        &self,
        handler: impl Fn(&usize) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.state.on_restored.subscribe(handler)
    }

    pub fn unsubscribe_restored(&self, id: SubscriptionId) -> bool {
        self.state.on_restored.unsubscribe(id)
    }

    /// Re-emission of every "character became active" notification.
    pub fn subscribe_character_active(
        &self,
        handler: impl Fn(&FormId) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.state.on_character_active.subscribe(handler)
    }

    pub fn unsubscribe_character_active(&self, id: SubscriptionId) -> bool {
        self.state.on_character_active.unsubscribe(id)
    }
}

impl StoreState {
    fn is_ready(&self) -> bool {
        self.catalog.is_validated() && self.restored.load(Ordering::SeqCst)
    }

    fn character_active(&self, id: FormId) -> Activation {
        self.on_character_active.emit(&id);

        if !self.is_ready() {
            if self.deps.actors.lookup(id).is_none() {
                return Activation::Unknown;
            }
            self.deferred.push(id);
            // Readiness may have flipped between the check and the push.
            self.flush_if_ready();
            return Activation::Deferred;
        }
        self.activate(id)
    }

    fn activate(&self, id: FormId) -> Activation {
        let Some(actor) = self.deps.actors.lookup(id) else {
            return Activation::Unknown;
        };
        let exclusion = self.deps.eligibility.exclusion(&actor);
        if exclusion.is_all() {
            debug!(form_id = %id, "character excluded");
            return Activation::Excluded;
        }
        let caps = &self.deps.capabilities;

        let existing = self.assignments.lock().get(&id).cloned();
        if let Some(set) = existing {
            let applied = set.apply(&actor, caps, |c| exclusion.excludes(c));
            return Activation::Reapplied { applied };
        }

        let selected = self
            .selector
            .select_excluding(&actor, &exclusion, &mut rand::thread_rng());
        if selected.is_empty() {
            return Activation::NoMatch;
        }

        // Another thread may have assigned this character meanwhile.
        let set = self
            .assignments
            .lock()
            .entry(id)
            .or_insert(selected)
            .clone();
        let applied = set.apply(&actor, caps, |c| exclusion.excludes(c));
        debug!(form_id = %id, presets = ?set.preset_ids(), applied, "character assigned");
        Activation::Assigned { applied }
    }

    fn flush_if_ready(&self) -> usize {
        if !self.is_ready() {
            return 0;
        }
        let count = self.deferred.flush(|id| {
            self.activate(id);
        });
        if count > 0 {
            info!(count, "deferred characters processed");
        }
        count
    }

    fn catalog_validated(&self, _report: &ValidationReport) {
        let index: HashMap<String, Arc<Preset>> = self
            .catalog
            .presets()
            .into_iter()
            .map(|p| (p.id().to_string(), p))
            .collect();

        let mut dropped = 0usize;
        {
            let mut assignments = self.assignments.lock();
            for set in assignments.values_mut() {
                let current: Vec<Arc<Preset>> = set.iter().cloned().collect();
                let mut rebuilt = AssignmentSet::new();
                for preset in current {
                    match index.get(preset.id()) {
                        Some(live) => {
                            rebuilt.insert(live.clone());
                        }
                        None => dropped += 1,
                    }
                }
                *set = rebuilt;
            }
            assignments.retain(|_, set| !set.is_empty());
        }
        if dropped > 0 {
            warn!(dropped, "assignments referenced presets no longer in the catalog");
        }

        self.flush_if_ready();
    }

    fn detach(&self) -> bool {
        let registration = self.lifecycle.lock().take();
        match registration {
            Some((events, token)) => events.unsubscribe_active(token),
            None => false,
        }
    }
}

impl Drop for StoreState {
    fn drop(&mut self) {
        if let Some(id) = self.validated_subscription.get_mut().take() {
            self.catalog.unsubscribe_validated(id);
        }
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Gender;
    use crate::conditions::ConditionSet;
    use crate::executor::InlineExecutor;
    use crate::testing::{female, male, morph_preset, TestWorld};
    use crate::validation::AcceptAll;

    fn setup(presets: Vec<Preset>) -> (TestWorld, Catalog, AssignmentStore) {
        let world = TestWorld::new();
        let catalog = Catalog::from_presets(presets, Arc::new(AcceptAll), Arc::new(InlineExecutor));
        let deps = StoreDeps::new(Arc::new(world.clone()), world.capabilities());
        let store = AssignmentStore::new(catalog.clone(), deps);
        (world, catalog, store)
    }

    fn female_morph(id: &str) -> Preset {
        morph_preset(id, ConditionSet::new().with_gender(Gender::Female))
    }

    #[test]
    fn test_not_ready_until_both_events() {
        let (world, catalog, store) = setup(vec![female_morph("F")]);
        world.add_actor(female(1));

        assert_eq!(store.on_character_active(FormId(1)), Activation::Deferred);
        catalog.validate_presets().wait();
        assert!(!store.is_ready());
        assert_eq!(store.pending_len(), 1);

        store.restore(&[]);
        assert!(store.is_ready());
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.assignment(FormId(1)).unwrap().preset_ids(), vec!["F"]);
        assert!(!world.morphs_of(FormId(1)).is_empty());
    }

    #[test]
    fn test_unknown_identity_not_queued() {
        let (_world, _catalog, store) = setup(vec![female_morph("F")]);
        assert_eq!(store.on_character_active(FormId(99)), Activation::Unknown);
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn test_existing_assignment_reapplied() {
        let (world, catalog, store) = setup(vec![female_morph("F")]);
        catalog.validate_presets().wait();
        store.restore(&[]);
        world.add_actor(female(1));

        assert_eq!(
            store.on_character_active(FormId(1)),
            Activation::Assigned { applied: true }
        );
        assert_eq!(
            store.on_character_active(FormId(1)),
            Activation::Reapplied { applied: true }
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_no_match_records_nothing() {
        let (world, catalog, store) = setup(vec![female_morph("F")]);
        catalog.validate_presets().wait();
        store.restore(&[]);
        world.add_actor(male(2));
        assert_eq!(store.on_character_active(FormId(2)), Activation::NoMatch);
        assert!(!store.contains(FormId(2)));
    }

    #[test]
    fn test_character_active_reemitted() {
        let (_world, _catalog, store) = setup(vec![]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        store.subscribe_character_active(move |id| s.lock().push(*id));
        store.on_character_active(FormId(5));
        assert_eq!(*seen.lock(), vec![FormId(5)]);
    }

    #[test]
    fn test_update_and_apply_assignment() {
        let (world, catalog, store) = setup(vec![female_morph("F"), female_morph("G")]);
        world.add_actor(female(3));
        let f = catalog.get("F").unwrap();
        let g = catalog.get("G").unwrap();

        assert!(store.update_assignment(FormId(3), f).is_none());
        let replaced = store.update_assignment(FormId(3), g).unwrap();
        assert_eq!(replaced.id(), "F");
        assert!(store.apply_assignment(FormId(3)));
        assert!(world.morphs_of(FormId(3)).contains_key("G_morph"));
        assert!(!store.apply_assignment(FormId(4)));
    }

    #[test]
    fn test_reset_returns_to_not_ready() {
        let (world, catalog, store) = setup(vec![female_morph("F")]);
        catalog.validate_presets().wait();
        store.restore(&[]);
        world.add_actor(female(1));
        store.on_character_active(FormId(1));
        assert_eq!(store.len(), 1);

        store.reset();
        assert!(!store.is_ready());
        assert!(store.is_empty());
        assert_eq!(store.on_character_active(FormId(1)), Activation::Deferred);
    }

    #[test]
    fn test_attach_and_detach() {
        let (world, catalog, store) = setup(vec![female_morph("F")]);
        catalog.validate_presets().wait();
        store.restore(&[]);
        world.add_actor(female(1));

        store.attach(Arc::new(world.clone()));
        assert_eq!(world.lifecycle_handlers(), 1);
        world.activate(FormId(1));
        assert!(store.contains(FormId(1)));

        assert!(store.detach());
        assert_eq!(world.lifecycle_handlers(), 0);
    }

    #[test]
    fn test_dropping_store_unsubscribes() {
        let (world, catalog, store) = setup(vec![female_morph("F")]);
        store.attach(Arc::new(world.clone()));
        drop(store);
        assert_eq!(world.lifecycle_handlers(), 0);
        // Validation must not reach the dropped store.
        assert!(catalog.validate_presets().wait().is_some());
    }
}
