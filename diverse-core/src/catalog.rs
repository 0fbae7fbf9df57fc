//! The catalog of presets eligible for selection.
//!
//! # Lifecycle
//!
//! ```text
//!   load / reload ──► presets (unvalidated)
//!        │
//!   validate_presets ──► executor task ──► join all preset checks
//!                                              │
//!                 lock, keep valid presets, mark validated, unlock
//!                                              │
//!                               fire "validated" subscribers
//! ```
//!
//! Validation never holds the preset lock while awaiting checks. A run that
//! finishes after a newer run (or a reload) started is discarded.

use crate::actor::Actor;
use crate::conditions::{CoincidenceLevel, Filter};
use crate::config::EngineConfig;
use crate::events::{SubscriptionId, Subscribers};
use crate::executor::TaskExecutor;
use crate::preset::{
    has_json_extension, is_companion_file, Category, InFlight, KnownOverlays, Preset,
};
use crate::validation::OverlayValidator;
use futures::channel::oneshot;
use futures::future::{join_all, FutureExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, error, info, warn};

/// Outcome of one validation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub generation: u64,
    /// Ids of presets that passed and are now live.
    pub kept: Vec<String>,
    /// Ids of presets that failed and were removed.
    pub dropped: Vec<String>,
    /// True when a newer run or reload made this result obsolete.
    pub superseded: bool,
}

/// Resolves when a validation run completes. `None` if the executor dropped
/// the task.
pub struct ValidationHandle {
    rx: oneshot::Receiver<ValidationReport>,
}

impl Future for ValidationHandle {
    type Output = Option<ValidationReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

impl ValidationHandle {
    /// Block the calling thread until the run completes.
    pub fn wait(self) -> Option<ValidationReport> {
        futures::executor::block_on(self)
    }
}

struct CatalogState {
    /// Sorted by (category, id).
    presets: Mutex<Vec<Arc<Preset>>>,
    known: BTreeMap<Category, Arc<KnownOverlays>>,
    /// One apply/remove guard per category.
    guards: BTreeMap<Category, Arc<InFlight>>,
    validated: AtomicBool,
    generation: AtomicU64,
    on_validated: Subscribers<ValidationReport>,
    validator: Arc<dyn OverlayValidator>,
    executor: Arc<dyn TaskExecutor>,
}

/// Shared handle to the preset catalog. Clones refer to the same catalog.
#[derive(Clone)]
pub struct Catalog {
    state: Arc<CatalogState>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("presets", &self.len())
            .field("validated", &self.is_validated())
            .finish()
    }
}

impl Catalog {
    /// An empty catalog.
    pub fn new(validator: Arc<dyn OverlayValidator>, executor: Arc<dyn TaskExecutor>) -> Self {
        let known = Category::ALL
            .into_iter()
            .filter(|c| c.is_overlay())
            .map(|c| (c, Arc::new(KnownOverlays::new())))
            .collect();
        let guards = Category::ALL
            .into_iter()
            .map(|c| (c, Arc::new(InFlight::new())))
            .collect();
        Self {
            state: Arc::new(CatalogState {
                presets: Mutex::new(Vec::new()),
                known,
                guards,
                validated: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                on_validated: Subscribers::new(),
                validator,
                executor,
            }),
        }
    }

    /// Scan the configured folders.
    pub fn load(
        config: &EngineConfig,
        validator: Arc<dyn OverlayValidator>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let catalog = Self::new(validator, executor);
        catalog.reload(config);
        catalog
    }

    /// Build from in-memory presets.
    pub fn from_presets(
        presets: impl IntoIterator<Item = Preset>,
        validator: Arc<dyn OverlayValidator>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let catalog = Self::new(validator, executor);
        let loaded = presets.into_iter().map(|p| catalog.attach_shared(p)).collect();
        catalog.replace(loaded);
        catalog
    }

    /// Rescan sources. The catalog becomes unvalidated and any running
    /// validation is superseded.
    pub fn reload(&self, config: &EngineConfig) {
        self.begin_reload();

        let mut loaded = Vec::new();
        for category in Category::ALL {
            let folders = match config.folders(category) {
                Ok(folders) => folders,
                Err(err) => {
                    error!(error = %err, "configuration error, category has no presets");
                    continue;
                }
            };
            for folder in folders {
                self.scan_folder(&folder, category, &mut loaded);
            }
        }
        info!(count = loaded.len(), "presets loaded");
        self.replace(loaded);
    }

    fn scan_folder(&self, folder: &Path, category: Category, out: &mut Vec<Preset>) {
        let entries = match fs::read_dir(folder) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %folder.display(), error = %err, "cannot read preset folder");
                return;
            }
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && has_json_extension(path) && !is_companion_file(path))
            .collect();
        files.sort();

        for path in files {
            match Preset::load(&path, category) {
                Ok(preset) => {
                    debug!(preset = %preset.id(), category = %category, "preset loaded");
                    out.push(self.attach_shared(preset));
                }
                Err(err) => warn!(error = %err, "preset skipped"),
            }
        }
    }

    /// Hand the preset its category's overlay registry and guard.
    fn attach_shared(&self, preset: Preset) -> Preset {
        let category = preset.category();
        let preset = match self.state.guards.get(&category) {
            Some(guard) => preset.with_in_flight(guard.clone()),
            None => preset,
        };
        match self.state.known.get(&category) {
            Some(known) => preset.with_known_overlays(known.clone()),
            None => preset,
        }
    }

    /// Supersede running validations, then empty the overlay registries for
    /// the rescan.
    fn begin_reload(&self) {
        self.invalidate();
        for known in self.state.known.values() {
            known.clear();
        }
    }

    /// Supersede any running validation. Taken under the presets lock so a
    /// publish either finishes first or sees the new generation.
    fn invalidate(&self) {
        let _presets = self.state.presets.lock();
        self.state.validated.store(false, Ordering::SeqCst);
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn replace(&self, loaded: Vec<Preset>) {
        let mut seen = HashSet::new();
        let mut presets: Vec<Arc<Preset>> = Vec::with_capacity(loaded.len());
        for preset in loaded {
            if !seen.insert(preset.id().to_string()) {
                warn!(preset = %preset.id(), "duplicate preset id skipped");
                continue;
            }
            presets.push(Arc::new(preset));
        }
        presets.sort_by(|a, b| (a.category(), a.id()).cmp(&(b.category(), b.id())));

        let mut current = self.state.presets.lock();
        *current = presets;
        self.state.validated.store(false, Ordering::SeqCst);
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Start asynchronous validation of every preset on the executor.
    ///
    /// May be called again at any time; only the most recent run publishes.
    pub fn validate_presets(&self) -> ValidationHandle {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot: Vec<Arc<Preset>> = self.state.presets.lock().clone();
        let validator = self.state.validator.clone();

        let checks: Vec<_> = snapshot
            .iter()
            .map(|preset| preset.is_valid_async(validator.as_ref()))
            .collect();
        let template_checks: Vec<_> = self
            .state
            .known
            .values()
            .map(|known| {
                let templates: Vec<String> = known.all().into_iter().collect();
                let futures: Vec<_> = templates.iter().map(|t| validator.is_valid(t)).collect();
                (known.clone(), templates, futures)
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        let state = self.state.clone();
        let task = async move {
            let results = join_all(checks).await;
            let mut templates = Vec::with_capacity(template_checks.len());
            for (known, ids, futures) in template_checks {
                let valid = join_all(futures).await;
                templates.push((known, ids, valid));
            }
            let report = state.publish(generation, snapshot, results, templates);
            let _ = tx.send(report);
        };

        debug!(generation, "validation started");
        self.state.executor.spawn(task.boxed());
        ValidationHandle { rx }
    }

    pub fn is_validated(&self) -> bool {
        self.state.validated.load(Ordering::SeqCst)
    }

    /// Register for "validated" notifications.
    pub fn subscribe_validated(
        &self,
        handler: impl Fn(&ValidationReport) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.state.on_validated.subscribe(handler)
    }

    pub fn subscribe_validated_once(
        &self,
        handler: impl Fn(&ValidationReport) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.state.on_validated.subscribe_once(handler)
    }

    pub fn unsubscribe_validated(&self, id: SubscriptionId) -> bool {
        self.state.on_validated.unsubscribe(id)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn get(&self, id: &str) -> Option<Arc<Preset>> {
        self.state
            .presets
            .lock()
            .iter()
            .find(|p| p.id() == id)
            .cloned()
    }

    /// All presets whose conditions match `actor` with a non-NONE score.
    pub fn matching(&self, actor: &Actor) -> Vec<Arc<Preset>> {
        self.matching_by(actor, |_| true)
    }

    /// Like [`matching`](Self::matching), additionally filtered by `predicate`.
    pub fn matching_by(
        &self,
        actor: &Actor,
        predicate: impl Fn(&Preset) -> bool,
    ) -> Vec<Arc<Preset>> {
        self.presets()
            .into_iter()
            .filter(|p| p.check(actor, Filter::ALL) != CoincidenceLevel::NONE && predicate(p))
            .collect()
    }

    /// Snapshot of all presets, sorted by (category, id).
    pub fn presets(&self) -> Vec<Arc<Preset>> {
        self.state.presets.lock().clone()
    }

    pub fn of_category(&self, category: Category) -> Vec<Arc<Preset>> {
        self.state
            .presets
            .lock()
            .iter()
            .filter(|p| p.category() == category)
            .cloned()
            .collect()
    }

    /// Categories that currently have at least one preset, in order.
    pub fn categories(&self) -> Vec<Category> {
        let mut categories: Vec<Category> = self
            .state
            .presets
            .lock()
            .iter()
            .map(|p| p.category())
            .collect();
        categories.dedup();
        categories
    }

    /// Known overlay templates registered for an overlay category.
    pub fn known_overlays(&self, category: Category) -> Option<Arc<KnownOverlays>> {
        self.state.known.get(&category).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.presets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CatalogState {
    fn publish(
        &self,
        generation: u64,
        snapshot: Vec<Arc<Preset>>,
        results: Vec<bool>,
        templates: Vec<(Arc<KnownOverlays>, Vec<String>, Vec<bool>)>,
    ) -> ValidationReport {
        let mut report = ValidationReport {
            generation,
            ..Default::default()
        };
        let mut live = Vec::with_capacity(snapshot.len());
        for (preset, valid) in snapshot.into_iter().zip(results) {
            if valid {
                report.kept.push(preset.id().to_string());
                live.push(preset);
            } else {
                warn!(preset = %preset.id(), "preset failed validation");
                report.dropped.push(preset.id().to_string());
            }
        }

        {
            let mut presets = self.presets.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                report.superseded = true;
            } else {
                *presets = live;
                self.validated.store(true, Ordering::SeqCst);
                // Lock order is presets, then registry.
                for (known, ids, valid) in templates {
                    let keep: HashSet<String> = ids
                        .into_iter()
                        .zip(valid)
                        .filter_map(|(id, ok)| ok.then_some(id))
                        .collect();
                    known.retain(&keep);
                }
            }
        }

        if report.superseded {
            debug!(generation, "validation result superseded");
            return report;
        }

        info!(
            kept = report.kept.len(),
            dropped = report.dropped.len(),
            "presets validated"
        );
        self.on_validated.emit(&report);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Gender;
    use crate::conditions::ConditionSet;
    use crate::executor::InlineExecutor;
    use crate::testing::{base_ref, female, morph_preset, overlay_preset};
    use crate::validation::{AcceptAll, StaticValidator};
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn inline() -> Arc<dyn TaskExecutor> {
        Arc::new(InlineExecutor)
    }

    fn female_only() -> ConditionSet {
        ConditionSet::new().with_gender(Gender::Female)
    }

    #[test]
    fn test_validation_drops_invalid_and_fires_once() {
        let catalog = Catalog::from_presets(
            vec![
                overlay_preset("Chest", Category::BodyHairs, female_only()),
                overlay_preset("Back", Category::BodyHairs, female_only()),
                morph_preset("curvy", female_only()),
            ],
            Arc::new(StaticValidator::new(["Chest"])),
            inline(),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        catalog.subscribe_validated_once(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!catalog.is_validated());
        let report = catalog.validate_presets().wait().unwrap();
        assert!(catalog.is_validated());
        assert!(!report.superseded);
        assert_eq!(report.dropped, vec!["Back".to_string()]);
        assert!(catalog.get("Back").is_none());
        assert!(catalog.get("Chest").is_some());

        catalog.validate_presets().wait().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_validation_prunes_known_overlays() {
        let catalog = Catalog::from_presets(
            vec![
                overlay_preset("Chest", Category::BodyHairs, female_only()),
                overlay_preset("Back", Category::BodyHairs, female_only()),
            ],
            Arc::new(StaticValidator::new(["Chest"])),
            inline(),
        );
        let known = catalog.known_overlays(Category::BodyHairs).unwrap();
        assert_eq!(known.templates(Gender::Female).len(), 2);
        catalog.validate_presets().wait();
        assert_eq!(
            known.templates(Gender::Female).into_iter().collect::<Vec<_>>(),
            vec!["Chest".to_string()]
        );
    }

    type Parked = Arc<Mutex<Option<BoxFuture<'static, ()>>>>;

    /// Holds spawned tasks until the test runs them.
    struct Parking(Parked);

    impl TaskExecutor for Parking {
        fn spawn(&self, task: BoxFuture<'static, ()>) {
            *self.0.lock() = Some(task);
        }
    }

    #[test]
    fn test_superseded_run_is_ignored() {
        let parked: Parked = Arc::new(Mutex::new(None));
        let catalog = Catalog::from_presets(
            vec![morph_preset("curvy", female_only())],
            Arc::new(AcceptAll),
            Arc::new(Parking(parked.clone())),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        catalog.subscribe_validated(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let handle = catalog.validate_presets();
        catalog.replace(vec![morph_preset("other", female_only())]);

        let task = parked.lock().take().unwrap();
        futures::executor::block_on(task);
        let report = handle.wait().unwrap();
        assert!(report.superseded);
        assert!(!catalog.is_validated());
        assert!(catalog.get("other").is_some());
        assert!(catalog.get("curvy").is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_prune_after_reload_started_is_superseded() {
        let parked: Parked = Arc::new(Mutex::new(None));
        let catalog = Catalog::from_presets(
            vec![overlay_preset("Chest", Category::BodyHairs, female_only())],
            Arc::new(StaticValidator::new(["Chest"])),
            Arc::new(Parking(parked.clone())),
        );
        let handle = catalog.validate_presets();

        // The rescan registers a template the parked run never saw.
        catalog.begin_reload();
        let rescanned = catalog.attach_shared(overlay_preset(
            "Arms",
            Category::BodyHairs,
            female_only(),
        ));

        let task = parked.lock().take().unwrap();
        futures::executor::block_on(task);
        let report = handle.wait().unwrap();
        assert!(report.superseded);
        assert!(!catalog.is_validated());
        let known = catalog.known_overlays(Category::BodyHairs).unwrap();
        assert!(known.templates(Gender::Female).contains("Arms"));

        catalog.replace(vec![rescanned]);
        assert!(catalog.get("Arms").is_some());
        assert!(known.templates(Gender::Female).contains("Arms"));
    }

    #[test]
    fn test_same_category_presets_share_guard() {
        let catalog = Catalog::from_presets(
            vec![
                overlay_preset("Chest", Category::BodyHairs, female_only()),
                overlay_preset("Back", Category::BodyHairs, female_only()),
                overlay_preset("Red", Category::Nails, female_only()),
                morph_preset("curvy", female_only()),
            ],
            Arc::new(AcceptAll),
            inline(),
        );
        let chest = catalog.get("Chest").unwrap();
        assert!(chest.shares_in_flight(&catalog.get("Back").unwrap()));
        assert!(!chest.shares_in_flight(&catalog.get("Red").unwrap()));
        assert!(!chest.shares_in_flight(&catalog.get("curvy").unwrap()));
    }

    #[test]
    fn test_dropped_task_yields_none() {
        let parked: Parked = Arc::new(Mutex::new(None));
        let catalog = Catalog::from_presets(
            vec![morph_preset("curvy", female_only())],
            Arc::new(AcceptAll),
            Arc::new(Parking(parked.clone())),
        );
        let handle = catalog.validate_presets();
        parked.lock().take();
        assert!(handle.wait().is_none());
    }

    #[test]
    fn test_matching_sorted_and_filtered() {
        let raider = base_ref(0x6B4A3);
        let catalog = Catalog::from_presets(
            vec![
                overlay_preset("nails", Category::Nails, female_only()),
                morph_preset("b", female_only()),
                morph_preset("a", ConditionSet::new().with_keyword(raider.clone())),
                morph_preset("male", ConditionSet::new().with_gender(Gender::Male)),
            ],
            Arc::new(AcceptAll),
            inline(),
        );
        let actor = female(1).with_keyword(raider);
        let ids: Vec<String> = catalog
            .matching(&actor)
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "nails"]);

        let overlays = catalog.matching_by(&actor, |p| p.category().is_overlay());
        assert_eq!(overlays.len(), 1);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let catalog = Catalog::from_presets(
            vec![
                morph_preset("dup", female_only()),
                overlay_preset("dup", Category::Nails, female_only()),
            ],
            Arc::new(AcceptAll),
            inline(),
        );
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("dup").unwrap().category(), Category::BodyMorphs);
    }

    #[test]
    fn test_load_from_folders() {
        let dir = TempDir::new().unwrap();
        let morphs = dir.path().join("morphs");
        let hairs = dir.path().join("hairs");
        fs::create_dir_all(&morphs).unwrap();
        fs::create_dir_all(&hairs).unwrap();
        fs::write(morphs.join("conds.json"), r#"{"gender": 1}"#).unwrap();
        fs::write(morphs.join("slim.json"), r#"{"BodyMorphs": {"Waist": -0.3}}"#).unwrap();
        fs::write(morphs.join("bad.json"), r#"{"BodyMorphs": {}}"#).unwrap();
        fs::write(morphs.join("notes.txt"), "ignored").unwrap();
        fs::write(
            hairs.join("light.json"),
            r#"{"add": [{"id": "Arms"}], "conditions": {"gender": 0}}"#,
        )
        .unwrap();

        let config = EngineConfig::new()
            .with_folder(Category::BodyMorphs, &morphs)
            .with_folder(Category::BodyHairs, &hairs)
            .with_folder(Category::Nails, dir.path().join("missing"));
        let catalog = Catalog::load(&config, Arc::new(AcceptAll), inline());

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.categories(), vec![Category::BodyMorphs, Category::BodyHairs]);
        assert_eq!(catalog.of_category(Category::BodyMorphs).len(), 1);
        let known = catalog.known_overlays(Category::BodyHairs).unwrap();
        assert!(known.templates(Gender::Male).contains("Arms"));
        assert!(known.templates(Gender::Female).is_empty());
    }
}
