//! Catalog – two layers merged at read time
//! =========================================
//!
//! The built-in catalog ships inside the binary (`builtin_models.json`). The
//! user catalog lives at `<cache>/user_models.json` and can be edited by
//! hand or through `register`; it is re-read whenever its mtime changes, so
//! external edits show up without a restart.
//!
//! Merging never shadows: user entries are published under the reserved
//! `user.` prefix, which registration rejects in stored names.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

use crate::{
    entry::{ModelEntry, USER_PREFIX},
    error::{ModelsError, ModelsResult},
};

const BUILTIN_JSON: &str = include_str!("builtin_models.json");

/// On-disk shape of `user_models.json` (and of the embedded catalog).
#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    models: Vec<ModelEntry>,
}

fn builtin() -> &'static BTreeMap<String, ModelEntry> {
    static BUILTIN: OnceLock<BTreeMap<String, ModelEntry>> = OnceLock::new();
    BUILTIN.get_or_init(|| {
        let file: CatalogFile =
            serde_json::from_str(BUILTIN_JSON).expect("embedded catalog is valid JSON");
        file.models
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect()
    })
}

/// The user-editable catalog layer. Single writer; readers tolerate
/// staleness up to the next mtime check.
#[derive(Debug)]
pub struct UserCatalog {
    path: PathBuf,
    mtime: Option<SystemTime>,
    entries: BTreeMap<String, ModelEntry>,
}

impl UserCatalog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            mtime: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file when its mtime moved (or it appeared/vanished).
    pub fn refresh_if_stale(&mut self) -> ModelsResult<bool> {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();

        if mtime == self.mtime && mtime.is_some() {
            return Ok(false);
        }

        self.entries = match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                let file: CatalogFile =
                    serde_json::from_str(&raw).map_err(|e| ModelsError::MalformedCatalog {
                        reason: format!("{}: {e}", self.path.display()),
                    })?;
                file.models
                    .into_iter()
                    .map(|entry| (entry.name.clone(), entry))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(ModelsError::file_system("read user catalog", &self.path, e)),
        };
        self.mtime = mtime;
        crate::debug!(
            "user catalog refreshed: {} entries from {}",
            self.entries.len(),
            self.path.display()
        );
        Ok(true)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn insert(&mut self, entry: ModelEntry) -> ModelsResult<()> {
        self.entries.insert(entry.name.clone(), entry);
        self.persist()
    }

    pub fn remove(&mut self, name: &str) -> ModelsResult<bool> {
        let removed = self.entries.remove(name).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Write-temp-then-rename so a concurrent reader never observes a
    /// half-written file.
    fn persist(&mut self) -> ModelsResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ModelsError::file_system("create cache directory", parent, e))?;
        }

        let file = CatalogFile {
            models: self.entries.values().cloned().collect(),
        };
        let raw = serde_json::to_string_pretty(&file).map_err(|e| {
            ModelsError::MalformedCatalog {
                reason: format!("serialize user catalog: {e}"),
            }
        })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .map_err(|e| ModelsError::file_system("write user catalog", &tmp, e))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| ModelsError::file_system("replace user catalog", &self.path, e))?;

        self.mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        Ok(())
    }
}

/// Built-in ∪ user view. Owns the user layer; the built-in layer is static.
#[derive(Debug)]
pub struct Catalog {
    user: UserCatalog,
}

impl Catalog {
    pub fn new(user_path: PathBuf) -> Self {
        Self {
            user: UserCatalog::new(user_path),
        }
    }

    pub fn user(&self) -> &UserCatalog {
        &self.user
    }

    pub fn user_mut(&mut self) -> &mut UserCatalog {
        &mut self.user
    }

    /// The merged namespace: built-in entries under their own names, user
    /// entries under `user.<name>`.
    pub fn merged(&mut self) -> ModelsResult<BTreeMap<String, ModelEntry>> {
        self.user.refresh_if_stale()?;

        let mut merged = builtin().clone();
        for (name, entry) in &self.user.entries {
            let mut entry = entry.clone();
            let merged_name = format!("{USER_PREFIX}{name}");
            entry.name = merged_name.clone();
            merged.insert(merged_name, entry);
        }
        Ok(merged)
    }

    /// Resolve one name in the merged namespace.
    pub fn get(&mut self, name: &str) -> ModelsResult<Option<ModelEntry>> {
        if let Some(bare) = name.strip_prefix(USER_PREFIX) {
            self.user.refresh_if_stale()?;
            return Ok(self.user.entries.get(bare).map(|entry| {
                let mut entry = entry.clone();
                entry.name = name.to_owned();
                entry
            }));
        }
        Ok(builtin().get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::entry::{Checkpoint, Recipe};

    fn sample_entry(name: &str) -> ModelEntry {
        ModelEntry {
            name: name.into(),
            checkpoint: Checkpoint::try_new("org/repo-GGUF:q4_k_m").unwrap(),
            recipe: Recipe::LlamaCpp,
            labels: BTreeSet::new(),
            mmproj: None,
            suggested: false,
        }
    }

    #[test]
    fn builtin_catalog_parses_and_is_nonempty() {
        assert!(!builtin().is_empty());
        // Names are the map keys.
        for (name, entry) in builtin() {
            assert_eq!(name, &entry.name);
            assert!(!name.starts_with(USER_PREFIX));
        }
    }

    #[test]
    fn merged_applies_user_prefix() {
        let td = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::new(td.path().join("user_models.json"));

        catalog.user_mut().refresh_if_stale().unwrap();
        catalog.user_mut().insert(sample_entry("my-model")).unwrap();

        let merged = catalog.merged().unwrap();
        assert!(merged.contains_key("user.my-model"));
        assert!(!merged.contains_key("my-model") || builtin().contains_key("my-model"));

        let entry = catalog.get("user.my-model").unwrap().unwrap();
        assert_eq!(entry.name, "user.my-model");
    }

    #[test]
    fn external_edit_is_picked_up_via_mtime() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("user_models.json");
        let mut catalog = Catalog::new(path.clone());
        assert!(catalog.merged().unwrap().keys().all(|k| !k.starts_with(USER_PREFIX)));

        // Simulate an external writer.
        let file = CatalogFile {
            models: vec![sample_entry("edited-in")],
        };
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let merged = catalog.merged().unwrap();
        assert!(merged.contains_key("user.edited-in"));
    }

    #[test]
    fn remove_round_trips_to_pre_registration_view() {
        let td = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::new(td.path().join("user_models.json"));

        let before = catalog.merged().unwrap();
        catalog.user_mut().insert(sample_entry("transient")).unwrap();
        assert!(catalog.merged().unwrap().contains_key("user.transient"));

        assert!(catalog.user_mut().remove("transient").unwrap());
        assert_eq!(catalog.merged().unwrap(), before);
    }

    #[test]
    fn malformed_user_catalog_is_an_error() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("user_models.json");
        std::fs::write(&path, "{not json").unwrap();

        let mut catalog = Catalog::new(path);
        assert!(matches!(
            catalog.merged(),
            Err(ModelsError::MalformedCatalog { .. })
        ));
    }
}
