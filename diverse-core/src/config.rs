//! Engine configuration.
//!
//! Paths to preset folders, exclusion lists and overlay assets. Hosts build
//! an [`EngineConfig`] from their own key-value settings through
//! [`ConfigSource`]; tooling reads it from a JSON file.

use crate::host::ConfigSource;
use crate::preset::Category;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const KEY_BODYMORPHS_FOLDERS: &str = "PATH/sBodymorphsFolders";
pub const KEY_BODYHAIRS_FOLDERS: &str = "PATH/sBodyhairsFolders";
pub const KEY_NAILS_FOLDERS: &str = "PATH/sNailsFolders";
pub const KEY_EXCLUSIONS: &str = "PATH/sExclusions";
pub const KEY_OVERLAYS_ROOT: &str = "PATH/sOverlaysRoot";
pub const KEY_MATERIALS_ROOT: &str = "PATH/sMaterialsRoot";
pub const KEY_OVERLAY_REFRESH: &str = "GENERAL/iOverlayRefreshSeconds";

const DEFAULT_REFRESH_SECS: u64 = 30;

/// Errors from configuration handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no folders configured for {0}")]
    EmptyFolderList(Category),
}

/// Where the engine finds its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bodymorphs_folders: Vec<PathBuf>,
    pub bodyhairs_folders: Vec<PathBuf>,
    pub nails_folders: Vec<PathBuf>,
    pub exclusion_folders: Vec<PathBuf>,
    pub overlays_root: Option<PathBuf>,
    pub materials_root: Option<PathBuf>,
    pub overlay_refresh_secs: u64,
    /// Relative paths are resolved against this directory.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bodymorphs_folders: Vec::new(),
            bodyhairs_folders: Vec::new(),
            nails_folders: Vec::new(),
            exclusion_folders: Vec::new(),
            overlays_root: None,
            materials_root: None,
            overlay_refresh_secs: DEFAULT_REFRESH_SECS,
            base_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a preset folder for a category.
    pub fn with_folder(mut self, category: Category, folder: impl Into<PathBuf>) -> Self {
        self.folders_mut(category).push(folder.into());
        self
    }

    pub fn with_exclusion_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.exclusion_folders.push(folder.into());
        self
    }

    pub fn with_overlays_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.overlays_root = Some(root.into());
        self
    }

    pub fn with_materials_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.materials_root = Some(root.into());
        self
    }

    pub fn with_overlay_refresh(mut self, refresh: Duration) -> Self {
        self.overlay_refresh_secs = refresh.as_secs();
        self
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn folders_mut(&mut self, category: Category) -> &mut Vec<PathBuf> {
        match category {
            Category::BodyMorphs => &mut self.bodymorphs_folders,
            Category::BodyHairs => &mut self.bodyhairs_folders,
            Category::Nails => &mut self.nails_folders,
        }
    }

    /// Resolved preset folders for a category.
    pub fn folders(&self, category: Category) -> Result<Vec<PathBuf>, ConfigError> {
        let folders = match category {
            Category::BodyMorphs => &self.bodymorphs_folders,
            Category::BodyHairs => &self.bodyhairs_folders,
            Category::Nails => &self.nails_folders,
        };
        if folders.is_empty() {
            return Err(ConfigError::EmptyFolderList(category));
        }
        Ok(folders.iter().map(|f| self.resolve(f)).collect())
    }

    pub fn exclusion_folders(&self) -> Vec<PathBuf> {
        self.exclusion_folders.iter().map(|f| self.resolve(f)).collect()
    }

    pub fn overlays_root(&self) -> Option<PathBuf> {
        self.overlays_root.as_deref().map(|p| self.resolve(p))
    }

    pub fn materials_root(&self) -> Option<PathBuf> {
        self.materials_root.as_deref().map(|p| self.resolve(p))
    }

    pub fn overlay_refresh(&self) -> Duration {
        Duration::from_secs(self.overlay_refresh_secs)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    // ========================================================================
    // Sources
    // ========================================================================

    /// Read settings from the host's key-value configuration.
    ///
    /// Folder lists are comma separated. Missing keys leave defaults.
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let list = |key: &str| -> Vec<PathBuf> {
            source
                .get(key)
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default()
        };
        let single = |key: &str| {
            source
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };

        let overlay_refresh_secs = match source.get(KEY_OVERLAY_REFRESH) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(
                    key = KEY_OVERLAY_REFRESH,
                    value = %raw,
                    "invalid refresh interval, using default"
                );
                DEFAULT_REFRESH_SECS
            }),
            None => DEFAULT_REFRESH_SECS,
        };

        Self {
            bodymorphs_folders: list(KEY_BODYMORPHS_FOLDERS),
            bodyhairs_folders: list(KEY_BODYHAIRS_FOLDERS),
            nails_folders: list(KEY_NAILS_FOLDERS),
            exclusion_folders: list(KEY_EXCLUSIONS),
            overlays_root: single(KEY_OVERLAYS_ROOT),
            materials_root: single(KEY_MATERIALS_ROOT),
            overlay_refresh_secs,
            base_dir: None,
        }
    }

    /// Load from a JSON file. Relative paths resolve against the file's
    /// directory.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: EngineConfig = serde_json::from_str(&text)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }
}

/// A [`ConfigSource`] backed by a map.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_source_splits_lists() {
        let source = MapConfig::new()
            .with(KEY_BODYMORPHS_FOLDERS, " Presets/A , Presets/B,,")
            .with(KEY_EXCLUSIONS, "Excl")
            .with(KEY_OVERLAY_REFRESH, "5");
        let config = EngineConfig::from_source(&source);
        assert_eq!(
            config.folders(Category::BodyMorphs).unwrap(),
            vec![PathBuf::from("Presets/A"), PathBuf::from("Presets/B")]
        );
        assert_eq!(config.exclusion_folders(), vec![PathBuf::from("Excl")]);
        assert_eq!(config.overlay_refresh(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_folder_list_is_error() {
        let config = EngineConfig::new();
        assert!(matches!(
            config.folders(Category::Nails),
            Err(ConfigError::EmptyFolderList(Category::Nails))
        ));
    }

    #[test]
    fn test_bad_refresh_falls_back() {
        let source = MapConfig::new().with(KEY_OVERLAY_REFRESH, "soon");
        assert_eq!(EngineConfig::from_source(&source).overlay_refresh_secs, DEFAULT_REFRESH_SECS);
    }

    #[test]
    fn test_from_json_file_resolves_relative() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diverse.json");
        std::fs::write(
            &path,
            r#"{"bodyhairs_folders": ["hairs", "/abs/hairs"], "overlays_root": "Overlays"}"#,
        )
        .unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(
            config.folders(Category::BodyHairs).unwrap(),
            vec![dir.path().join("hairs"), PathBuf::from("/abs/hairs")]
        );
        assert_eq!(config.overlays_root(), Some(dir.path().join("Overlays")));
        assert_eq!(config.overlay_refresh_secs, DEFAULT_REFRESH_SECS);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .with_folder(Category::BodyMorphs, "m")
            .with_base_dir("/data");
        assert_eq!(
            config.folders(Category::BodyMorphs).unwrap(),
            vec![PathBuf::from("/data/m")]
        );
    }
}
