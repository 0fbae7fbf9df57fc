//! Characters that must not receive automatic presets.
//!
//! Exclusion files list characters (or the base records they spawn from)
//! and which categories they are excluded from:
//!
//! ```json
//! { "formid": ["0x0001A4D7"], "plugin": "Fallout4.esm", "exclusionflags": ["BodyHairs"] }
//! ```
//!
//! Keys are case-insensitive. A file may hold one object or an array of
//! them. No flags, an empty list, `"all"`, or every category means full
//! exclusion.

use crate::actor::{Actor, FormId, FormRef};
use crate::host::{ActorLookup, Eligibility, Exclusion, BASE_GAME_SOURCE};
use crate::preset::{has_json_extension, Category, LoadError};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Loaded exclusion entries keyed by runtime identity.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    entries: HashMap<FormId, Exclusion>,
}

impl ExclusionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: FormId, exclusion: Exclusion) {
        self.entries.insert(id, exclusion);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load every `.json` file in each folder. Unreadable files are logged.
    pub fn load_folders(folders: &[PathBuf], resolver: &dyn ActorLookup) -> Self {
        let mut list = Self::new();
        for folder in folders {
            let entries = match fs::read_dir(folder) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %folder.display(), error = %err, "cannot read exclusion folder");
                    continue;
                }
            };
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_file() && has_json_extension(p))
                .collect();
            files.sort();
            for file in files {
                if let Err(err) = list.load_file(&file, resolver) {
                    warn!(error = %err, "exclusion file skipped");
                }
            }
        }
        info!(count = list.len(), "exclusions loaded");
        list
    }

    /// Load one exclusion file, returning how many identities it added.
    pub fn load_file(
        &mut self,
        path: &Path,
        resolver: &dyn ActorLookup,
    ) -> Result<usize, LoadError> {
        let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        let objects: Vec<&Map<String, Value>> = match &value {
            Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
            Value::Object(obj) => vec![obj],
            _ => {
                warn!(path = %path.display(), "exclusion root is neither object nor array");
                Vec::new()
            }
        };

        let mut added = 0;
        for obj in objects {
            added += self.load_object(obj, resolver);
        }
        Ok(added)
    }

    fn load_object(&mut self, obj: &Map<String, Value>, resolver: &dyn ActorLookup) -> usize {
        let Some(ids) = get_ci(obj, "formid").and_then(Value::as_array) else {
            warn!("exclusion entry without formid array");
            return 0;
        };
        let plugin = get_ci(obj, "plugin")
            .and_then(Value::as_str)
            .unwrap_or(BASE_GAME_SOURCE);
        let exclusion = parse_flags(get_ci(obj, "exclusionflags"));

        let mut added = 0;
        for raw in ids.iter().filter_map(Value::as_str) {
            let resolved = FormRef::parse(&format!("{}:{}", plugin, raw))
                .and_then(|form| resolver.resolve_ref(&form));
            match resolved {
                Some(id) => {
                    self.entries.insert(id, exclusion.clone());
                    added += 1;
                }
                None => warn!(form_id = %raw, plugin, "unresolvable exclusion entry"),
            }
        }
        added
    }

    /// Exclusion state of a character, checking its own identity first and
    /// then the base record it was spawned from.
    pub fn lookup(&self, actor: &Actor) -> Exclusion {
        self.entries
            .get(&actor.form_id)
            .or_else(|| actor.template_id.and_then(|t| self.entries.get(&t)))
            .cloned()
            .unwrap_or_default()
    }
}

impl Eligibility for ExclusionList {
    fn exclusion(&self, actor: &Actor) -> Exclusion {
        self.lookup(actor)
    }
}

fn get_ci<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn parse_flags(value: Option<&Value>) -> Exclusion {
    let Some(flags) = value.and_then(Value::as_array) else {
        return Exclusion::All;
    };
    let names: Vec<&str> = flags.iter().filter_map(Value::as_str).collect();
    if names.iter().any(|n| n.eq_ignore_ascii_case("all")) {
        return Exclusion::All;
    }

    let mut categories = BTreeSet::new();
    for name in names {
        match name.parse::<Category>() {
            Ok(category) => {
                categories.insert(category);
            }
            Err(_) => warn!(flag = %name, "unknown exclusion flag"),
        }
    }
    if categories.is_empty() || categories.len() == Category::ALL.len() {
        Exclusion::All
    } else {
        Exclusion::Categories(categories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{female, TestWorld};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_flag_semantics() {
        assert_eq!(parse_flags(None), Exclusion::All);
        assert_eq!(parse_flags(Some(&json!([]))), Exclusion::All);
        assert_eq!(parse_flags(Some(&json!(["BodyHairs", "ALL"]))), Exclusion::All);
        assert_eq!(
            parse_flags(Some(&json!(["bodymorphs", "bodyhairs", "nails"]))),
            Exclusion::All
        );
        assert_eq!(parse_flags(Some(&json!(["hats"]))), Exclusion::All);
        assert_eq!(
            parse_flags(Some(&json!(["Nails", "hats"]))),
            Exclusion::Categories([Category::Nails].into_iter().collect())
        );
    }

    #[test]
    fn test_load_file_and_lookup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("excl.json");
        fs::write(
            &path,
            r#"[
                {"FormID": ["0x0001A4D7"], "ExclusionFlags": ["BodyHairs"]},
                {"formid": ["0x000800"], "plugin": "DLCCoast.esm"},
                {"formid": ["0x000900"], "plugin": "Unknown.esp"},
                {"plugin": "NoIds.esp"}
            ]"#,
        )
        .unwrap();

        let world = TestWorld::new();
        world.add_plugin("DLCCoast.esm", 0x03);
        let mut list = ExclusionList::new();
        assert_eq!(list.load_file(&path, &world).unwrap(), 2);

        let partial = list.lookup(&female(0x0001_A4D7));
        assert!(partial.excludes(Category::BodyHairs));
        assert!(!partial.excludes(Category::BodyMorphs));

        // Matched through the base record.
        let spawned = female(0xFF00_0001).with_template(FormId(0x0300_0800));
        assert!(list.lookup(&spawned).is_all());

        assert_eq!(list.lookup(&female(0x42)), Exclusion::None);
    }

    #[test]
    fn test_load_folders_skips_bad_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.json"), r#"{"formid": ["0x10"]}"#).unwrap();
        fs::write(dir.path().join("b.json"), "not json").unwrap();
        fs::write(dir.path().join("c.txt"), r#"{"formid": ["0x20"]}"#).unwrap();

        let list = ExclusionList::load_folders(&[dir.path().to_path_buf()], &TestWorld::new());
        assert_eq!(list.len(), 1);
        assert!(list.exclusion(&female(0x10)).is_all());
    }
}
