//! Overlay asset validation.
//!
//! Overlay presets reference overlay templates by id. A template is usable
//! only when the game actually ships one of the material files it names, so
//! presets are validated against the overlay definitions on disk before they
//! enter the catalog.
//!
//! Definitions live in `<overlays_root>/<mod>/overlays.json`:
//!
//! ```json
//! [{ "id": "BodyHair_Chest", "slots": [{ "material": "Overlays/Hair/Chest.bgsm" }] }]
//! ```

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default time before the definition scan is considered stale.
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(30);

/// Answers whether an overlay template id can be applied.
pub trait OverlayValidator: Send + Sync {
    fn is_valid(&self, template: &str) -> BoxFuture<'static, bool>;
}

/// Accepts every template.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl OverlayValidator for AcceptAll {
    fn is_valid(&self, _template: &str) -> BoxFuture<'static, bool> {
        future::ready(true).boxed()
    }
}

/// Accepts exactly the templates it was built with.
#[derive(Debug, Clone, Default)]
pub struct StaticValidator {
    valid: HashSet<String>,
}

impl StaticValidator {
    pub fn new<I, S>(valid: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            valid: valid.into_iter().map(Into::into).collect(),
        }
    }
}

impl OverlayValidator for StaticValidator {
    fn is_valid(&self, template: &str) -> BoxFuture<'static, bool> {
        future::ready(self.valid.contains(template)).boxed()
    }
}

// ============================================================================
// Filesystem validator
// ============================================================================

#[derive(Debug, Deserialize)]
struct OverlayDefinition {
    id: String,
    #[serde(default)]
    slots: Vec<OverlaySlot>,
}

#[derive(Debug, Deserialize)]
struct OverlaySlot {
    material: Option<String>,
}

struct ScanState {
    valid: Arc<HashSet<String>>,
    scanned_at: Option<Instant>,
}

struct FsInner {
    overlays_root: PathBuf,
    materials_root: PathBuf,
    refresh: Duration,
    state: Mutex<ScanState>,
}

/// Validates template ids against overlay definitions and material files on
/// disk. The scan is cached for the refresh interval; callers arriving while
/// a rescan is running wait for it instead of starting another.
#[derive(Clone)]
pub struct FsOverlayValidator {
    inner: Arc<FsInner>,
}

impl FsOverlayValidator {
    pub fn new(overlays_root: impl Into<PathBuf>, materials_root: impl Into<PathBuf>) -> Self {
        Self::with_refresh(overlays_root, materials_root, DEFAULT_REFRESH)
    }

    pub fn with_refresh(
        overlays_root: impl Into<PathBuf>,
        materials_root: impl Into<PathBuf>,
        refresh: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(FsInner {
                overlays_root: overlays_root.into(),
                materials_root: materials_root.into(),
                refresh,
                state: Mutex::new(ScanState {
                    valid: Arc::new(HashSet::new()),
                    scanned_at: None,
                }),
            }),
        }
    }

    /// All currently valid template ids, rescanning if stale.
    pub fn valid_ids(&self) -> Arc<HashSet<String>> {
        self.inner.current()
    }
}

impl FsInner {
    fn current(&self) -> Arc<HashSet<String>> {
        let mut state = self.state.lock();
        let stale = state
            .scanned_at
            .map_or(true, |at| at.elapsed() >= self.refresh);
        if stale {
            state.valid = Arc::new(self.scan());
            state.scanned_at = Some(Instant::now());
        }
        state.valid.clone()
    }

    fn scan(&self) -> HashSet<String> {
        let mut valid = HashSet::new();
        let entries = match fs::read_dir(&self.overlays_root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    path = %self.overlays_root.display(),
                    error = %err,
                    "cannot read overlays folder"
                );
                return valid;
            }
        };

        for entry in entries.flatten() {
            let definition = entry.path().join("overlays.json");
            if definition.is_file() {
                self.scan_definition(&definition, &mut valid);
            }
        }
        info!(count = valid.len(), "overlay definitions scanned");
        valid
    }

    fn scan_definition(&self, path: &Path, valid: &mut HashSet<String>) {
        let parsed = fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                serde_json::from_str::<Vec<OverlayDefinition>>(&text).map_err(|e| e.to_string())
            });
        let definitions = match parsed {
            Ok(definitions) => definitions,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping overlay definition file");
                return;
            }
        };

        for definition in definitions {
            if definition.id.is_empty() {
                continue;
            }
            let found = definition
                .slots
                .iter()
                .filter_map(|slot| slot.material.as_deref())
                .any(|material| {
                    let exists =
                        !material.is_empty() && self.materials_root.join(material).is_file();
                    if !exists {
                        debug!(overlay = %definition.id, material, "material file not found");
                    }
                    exists
                });
            if found {
                valid.insert(definition.id);
            }
        }
    }
}

impl OverlayValidator for FsOverlayValidator {
    fn is_valid(&self, template: &str) -> BoxFuture<'static, bool> {
        let inner = self.inner.clone();
        let template = template.to_string();
        match tokio::runtime::Handle::try_current() {
            // The scan walks the filesystem under the state lock.
            Ok(runtime) => {
                let scan = runtime.spawn_blocking(move || inner.current().contains(&template));
                async move {
                    scan.await.unwrap_or_else(|err| {
                        warn!(error = %err, "overlay scan task failed");
                        false
                    })
                }
                .boxed()
            }
            Err(_) => async move { inner.current().contains(&template) }.boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use tempfile::TempDir;

    fn fixture(refresh: Duration) -> (TempDir, FsOverlayValidator) {
        let dir = TempDir::new().unwrap();
        let overlays = dir.path().join("Overlays");
        let materials = dir.path().join("materials");
        fs::create_dir_all(overlays.join("HairMod")).unwrap();
        fs::create_dir_all(materials.join("hair")).unwrap();
        fs::write(materials.join("hair/chest.bgsm"), b"").unwrap();
        fs::write(
            overlays.join("HairMod/overlays.json"),
            r#"[
                {"id": "Chest", "slots": [
                    {"material": "hair/missing.bgsm"},
                    {"material": "hair/chest.bgsm"}
                ]},
                {"id": "Back", "slots": [{"material": "hair/back.bgsm"}]},
                {"id": "NoSlots"}
            ]"#,
        )
        .unwrap();
        let validator = FsOverlayValidator::with_refresh(overlays, materials, refresh);
        (dir, validator)
    }

    #[test]
    fn test_valid_when_any_material_exists() {
        let (_dir, validator) = fixture(DEFAULT_REFRESH);
        assert!(block_on(validator.is_valid("Chest")));
        assert!(!block_on(validator.is_valid("Back")));
        assert!(!block_on(validator.is_valid("NoSlots")));
        assert!(!block_on(validator.is_valid("Unknown")));
    }

    #[test]
    fn test_scan_is_cached_until_refresh() {
        let (dir, cached) = fixture(Duration::from_secs(3600));
        assert!(!block_on(cached.is_valid("Back")));
        fs::write(dir.path().join("materials/hair/back.bgsm"), b"").unwrap();
        assert!(!block_on(cached.is_valid("Back")));

        let (dir, eager) = fixture(Duration::ZERO);
        assert!(!block_on(eager.is_valid("Back")));
        fs::write(dir.path().join("materials/hair/back.bgsm"), b"").unwrap();
        assert!(block_on(eager.is_valid("Back")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scan_inside_runtime() {
        let (_dir, validator) = fixture(Duration::ZERO);
        let (chest, back) = futures::join!(validator.is_valid("Chest"), validator.is_valid("Back"));
        assert!(chest);
        assert!(!back);
    }

    #[tokio::test]
    async fn test_scan_inside_current_thread_runtime() {
        let (_dir, validator) = fixture(DEFAULT_REFRESH);
        assert!(validator.is_valid("Chest").await);
        assert!(!validator.is_valid("Unknown").await);
    }

    #[test]
    fn test_missing_root_yields_nothing() {
        let validator = FsOverlayValidator::new("/nonexistent/overlays", "/nonexistent/materials");
        assert!(validator.valid_ids().is_empty());
    }

    #[test]
    fn test_static_validator() {
        let validator = StaticValidator::new(["A"]);
        assert!(block_on(validator.is_valid("A")));
        assert!(!block_on(validator.is_valid("B")));
    }
}
