//! ModelRegistry – the high-level model management surface
//! =======================================================
//!
//! Sits on top of [`Catalog`] + [`HubCache`] + [`Fetcher`] and answers the
//! gateway's registry endpoints:
//!
//! * `list_supported` – merged catalog filtered to recipes this host can run.
//! * `list_downloaded` – supported ∩ on-disk presence.
//! * `register_user` / `delete` – user catalog mutations.
//! * `pull` – resolve the file list for an entry, download each with resume,
//!   and emit [`DownloadEvent`]s the gateway re-frames as SSE.

use std::{collections::BTreeMap, path::PathBuf, sync::Mutex};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    catalog::Catalog,
    entry::{CheckpointSource, ModelEntry, Recipe, USER_PREFIX},
    error::{ModelsError, ModelsResult},
    fetch::{CancelToken, Fetcher},
    hub::{self, HubCache, DEFAULT_REVISION},
};

const HF_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Cancelled,
    Error,
}

/// One progress tick of a pull, shaped for the `/pull` SSE stream.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadEvent {
    pub model_name: String,
    pub file: String,
    pub file_index: usize,
    pub total_files: usize,
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub percent: Option<u8>,
    pub status: DownloadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// When set, a pull with every file already on disk is a no-op.
    pub do_not_upgrade: bool,
    pub cancel: CancelToken,
}

/// One file the pull plan wants on disk.
#[derive(Debug, Clone)]
struct PlannedFile {
    url: String,
    dest: PathBuf,
    display: String,
}

#[derive(Debug)]
pub struct ModelRegistry {
    cache: HubCache,
    catalog: Mutex<Catalog>,
    fetcher: Fetcher,
    endpoint: String,
}

impl ModelRegistry {
    pub fn new(cache: HubCache) -> Self {
        let catalog = Catalog::new(cache.user_models_path());
        Self {
            cache,
            catalog: Mutex::new(catalog),
            fetcher: Fetcher::default(),
            endpoint: HF_ENDPOINT.to_owned(),
        }
    }

    /// Point the registry at a different hub endpoint (tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn cache(&self) -> &HubCache {
        &self.cache
    }

    /// Merged catalog filtered to recipes with a supported backend here.
    pub fn list_supported(&self) -> ModelsResult<BTreeMap<String, ModelEntry>> {
        let mut catalog = self.catalog.lock().expect("catalog lock poisoned");
        let merged = catalog.merged()?;
        Ok(merged
            .into_iter()
            .filter(|(_, entry)| entry.recipe.supported_on_host())
            .collect())
    }

    /// Supported entries whose artifacts are present on disk.
    pub fn list_downloaded(&self) -> ModelsResult<BTreeMap<String, ModelEntry>> {
        Ok(self
            .list_supported()?
            .into_iter()
            .filter(|(_, entry)| self.is_downloaded(entry))
            .collect())
    }

    pub fn get(&self, name: &str) -> ModelsResult<ModelEntry> {
        let mut catalog = self.catalog.lock().expect("catalog lock poisoned");
        catalog.get(name)?.ok_or_else(|| ModelsError::UnknownModel {
            name: name.to_owned(),
        })
    }

    /// Validate and persist a user entry. The stored name is bare; the
    /// merged view publishes it as `user.<name>`.
    pub fn register_user(&self, entry: ModelEntry) -> ModelsResult<String> {
        entry.validate_for_registration()?;

        let mut catalog = self.catalog.lock().expect("catalog lock poisoned");
        let merged = catalog.merged()?;
        let merged_name = format!("{USER_PREFIX}{}", entry.name);
        if merged.contains_key(&merged_name) || merged.contains_key(&entry.name) {
            return Err(ModelsError::DuplicateModel { name: entry.name });
        }

        catalog.user_mut().insert(entry)?;
        crate::info!("registered user model '{merged_name}'");
        Ok(merged_name)
    }

    /// Remove artifacts; user entries also lose their catalog row.
    pub fn delete(&self, name: &str) -> ModelsResult<()> {
        let entry = self.get(name)?;

        match entry.checkpoint.source() {
            CheckpointSource::Hub { org, repo, .. } => {
                let dir = match entry.recipe {
                    Recipe::Flm => self.cache.flm_model_dir(repo),
                    _ => self.cache.repo_dir(org, repo),
                };
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)
                        .map_err(|e| ModelsError::file_system("remove model artifacts", &dir, e))?;
                }
            }
            // Local directories are user-owned; never delete them.
            CheckpointSource::LocalDir(_) => {}
        }

        if let Some(bare) = name.strip_prefix(USER_PREFIX) {
            let mut catalog = self.catalog.lock().expect("catalog lock poisoned");
            catalog.user_mut().remove(bare)?;
        }
        crate::info!("deleted model '{name}'");
        Ok(())
    }

    /// Offline presence check for one entry.
    pub fn is_downloaded(&self, entry: &ModelEntry) -> bool {
        match entry.checkpoint.source() {
            CheckpointSource::LocalDir(dir) => dir.is_dir(),
            CheckpointSource::Hub { org, repo, variant } => match entry.recipe {
                Recipe::LlamaCpp => {
                    let Some(snapshot) = self.cache.resolve_snapshot(org, repo) else {
                        return false;
                    };
                    let variant = variant.as_deref().unwrap_or_default();
                    if hub::find_gguf(&snapshot, variant).is_none() {
                        return false;
                    }
                    match &entry.mmproj {
                        Some(mmproj) => snapshot.join(mmproj).is_file(),
                        None => true,
                    }
                }
                Recipe::OgaCpu | Recipe::OgaHybrid | Recipe::OgaNpu => self
                    .cache
                    .resolve_snapshot(org, repo)
                    .map(|dir| hub::dir_is_nonempty(&dir))
                    .unwrap_or(false),
                Recipe::Flm => hub::dir_is_nonempty(&self.cache.flm_model_dir(repo)),
            },
        }
    }

    /// Download every file the entry needs, emitting progress events.
    /// Idempotent with `do_not_upgrade`: nothing is transferred when the
    /// plan is already on disk.
    pub async fn pull(
        &self,
        name: &str,
        opts: &PullOptions,
        events: &UnboundedSender<DownloadEvent>,
    ) -> ModelsResult<()> {
        let entry = self.get(name)?;
        if !entry.recipe.supported_on_host() {
            return Err(ModelsError::UnsupportedRecipe {
                recipe: entry.recipe.to_string(),
            });
        }

        let plan = self.plan_files(&entry).await?;
        let total_files = plan.len();

        if opts.do_not_upgrade && plan.iter().all(|f| f.dest.is_file()) {
            crate::debug!("pull of '{name}' is a no-op; all {total_files} files present");
            let _ = events.send(DownloadEvent {
                model_name: name.to_owned(),
                file: String::new(),
                file_index: total_files,
                total_files,
                bytes_downloaded: 0,
                bytes_total: Some(0),
                percent: Some(100),
                status: DownloadStatus::Completed,
                message: Some("already downloaded".into()),
            });
            return Ok(());
        }

        for (index, file) in plan.iter().enumerate() {
            if opts.do_not_upgrade && file.dest.is_file() {
                continue;
            }
            crate::info!("pulling {} -> {}", file.url, file.dest.display());

            let emit = |bytes: u64, total: Option<u64>, status: DownloadStatus, message: Option<String>| {
                let percent = total
                    .filter(|t| *t > 0)
                    .map(|t| ((bytes.saturating_mul(100)) / t).min(100) as u8);
                let _ = events.send(DownloadEvent {
                    model_name: name.to_owned(),
                    file: file.display.clone(),
                    file_index: index + 1,
                    total_files,
                    bytes_downloaded: bytes,
                    bytes_total: total,
                    percent,
                    status,
                    message,
                });
            };

            let result = self
                .fetcher
                .download(&file.url, &file.dest, &opts.cancel, |bytes, total| {
                    emit(bytes, total, DownloadStatus::Downloading, None)
                })
                .await;

            if let Err(e) = result {
                let status = match &e {
                    crate::fetch::FetchError::Cancelled { .. } => DownloadStatus::Cancelled,
                    _ => DownloadStatus::Error,
                };
                emit(0, None, status, Some(e.to_string()));
                return Err(e.into());
            }
        }

        let _ = events.send(DownloadEvent {
            model_name: name.to_owned(),
            file: String::new(),
            file_index: total_files,
            total_files,
            bytes_downloaded: 0,
            bytes_total: None,
            percent: Some(100),
            status: DownloadStatus::Completed,
            message: None,
        });
        Ok(())
    }

    /// Resolve the list of files an entry needs on disk.
    async fn plan_files(&self, entry: &ModelEntry) -> ModelsResult<Vec<PlannedFile>> {
        let (org, repo, variant) = match entry.checkpoint.source() {
            // Nothing to fetch for local checkpoints.
            CheckpointSource::LocalDir(_) => return Ok(Vec::new()),
            CheckpointSource::Hub { org, repo, variant } => (org, repo, variant.as_deref()),
        };

        let mut plan = Vec::new();
        match entry.recipe {
            Recipe::LlamaCpp => {
                let snapshot = self.cache.snapshot_dir(org, repo, DEFAULT_REVISION);
                let file = self.resolve_gguf_name(org, repo, variant).await?;
                plan.push(self.planned(org, repo, &file, snapshot.join(&file)));
                if let Some(mmproj) = &entry.mmproj {
                    plan.push(self.planned(org, repo, mmproj, snapshot.join(mmproj)));
                }
            }
            Recipe::OgaCpu | Recipe::OgaHybrid | Recipe::OgaNpu => {
                let snapshot = self.cache.snapshot_dir(org, repo, DEFAULT_REVISION);
                for file in self.list_repo_files(org, repo).await? {
                    plan.push(self.planned(org, repo, &file, snapshot.join(&file)));
                }
            }
            Recipe::Flm => {
                let dir = self.cache.flm_model_dir(repo);
                for file in self.list_repo_files(org, repo).await? {
                    plan.push(self.planned(org, repo, &file, dir.join(&file)));
                }
            }
        }
        Ok(plan)
    }

    fn planned(&self, org: &str, repo: &str, rfilename: &str, dest: PathBuf) -> PlannedFile {
        PlannedFile {
            url: format!(
                "{}/{org}/{repo}/resolve/{DEFAULT_REVISION}/{rfilename}",
                self.endpoint
            ),
            dest,
            display: rfilename.to_owned(),
        }
    }

    /// A variant either names the `.gguf` file directly or is a quant tag
    /// matched against the repo's file listing.
    async fn resolve_gguf_name(
        &self,
        org: &str,
        repo: &str,
        variant: Option<&str>,
    ) -> ModelsResult<String> {
        let variant = variant.ok_or_else(|| ModelsError::MalformedCatalog {
            reason: format!("GGUF checkpoint {org}/{repo} has no variant"),
        })?;
        if variant.to_ascii_lowercase().ends_with(".gguf") {
            return Ok(variant.to_owned());
        }

        let want = variant.to_ascii_lowercase();
        let files = self.list_repo_files(org, repo).await?;
        files
            .iter()
            .find(|f| {
                let lower = f.to_ascii_lowercase();
                lower.ends_with(".gguf") && lower.contains(&want)
            })
            .cloned()
            .ok_or_else(|| ModelsError::MalformedCatalog {
                reason: format!("no .gguf file matching '{variant}' in {org}/{repo}"),
            })
    }

    async fn list_repo_files(&self, org: &str, repo: &str) -> ModelsResult<Vec<String>> {
        let url = format!("{}/api/models/{org}/{repo}", self.endpoint);
        let info = self.fetcher.get_json(&url).await?;
        let siblings = info
            .get("siblings")
            .and_then(|s| s.as_array())
            .ok_or_else(|| ModelsError::MalformedCatalog {
                reason: format!("repo info for {org}/{repo} has no siblings list"),
            })?;
        Ok(siblings
            .iter()
            .filter_map(|s| s.get("rfilename").and_then(|f| f.as_str()))
            .filter(|f| !f.starts_with('.'))
            .map(|f| f.to_owned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::entry::{Checkpoint, Label};

    fn registry(td: &tempfile::TempDir) -> ModelRegistry {
        ModelRegistry::new(HubCache::new(td.path().to_path_buf()))
    }

    fn user_entry(name: &str) -> ModelEntry {
        ModelEntry {
            name: name.into(),
            checkpoint: Checkpoint::try_new("org/some-repo-GGUF:q4_k_m").unwrap(),
            recipe: Recipe::LlamaCpp,
            labels: BTreeSet::new(),
            mmproj: None,
            suggested: false,
        }
    }

    #[test]
    fn register_then_list_then_delete_round_trip() {
        let td = tempfile::tempdir().unwrap();
        let registry = registry(&td);

        let before: Vec<String> = registry.list_supported().unwrap().into_keys().collect();

        let merged_name = registry.register_user(user_entry("custom")).unwrap();
        assert_eq!(merged_name, "user.custom");

        let supported = registry.list_supported().unwrap();
        assert!(supported.contains_key("user.custom"));

        registry.delete("user.custom").unwrap();
        let after: Vec<String> = registry.list_supported().unwrap().into_keys().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let td = tempfile::tempdir().unwrap();
        let registry = registry(&td);

        registry.register_user(user_entry("dup")).unwrap();
        assert!(matches!(
            registry.register_user(user_entry("dup")),
            Err(ModelsError::DuplicateModel { .. })
        ));
    }

    #[test]
    fn registration_rejects_user_prefix_in_input() {
        let td = tempfile::tempdir().unwrap();
        let registry = registry(&td);
        assert!(registry.register_user(user_entry("user.sneaky")).is_err());
    }

    #[test]
    fn downloaded_requires_matching_gguf_and_mmproj() {
        let td = tempfile::tempdir().unwrap();
        let registry = registry(&td);

        let mut entry = user_entry("vision");
        entry.labels.insert(Label::Vision);
        entry.mmproj = Some("mmproj-model-f16.gguf".into());

        assert!(!registry.is_downloaded(&entry));

        let snapshot = registry
            .cache()
            .snapshot_dir("org", "some-repo-GGUF", DEFAULT_REVISION);
        std::fs::create_dir_all(&snapshot).unwrap();
        std::fs::write(snapshot.join("some-repo-q4_k_m.gguf"), b"gguf").unwrap();
        assert!(!registry.is_downloaded(&entry), "mmproj still missing");

        std::fs::write(snapshot.join("mmproj-model-f16.gguf"), b"gguf").unwrap();
        assert!(registry.is_downloaded(&entry));
    }

    #[tokio::test]
    async fn pull_resolves_variant_downloads_and_reports_progress() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/models/org/some-repo-GGUF")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "siblings": [
                        {"rfilename": ".gitattributes"},
                        {"rfilename": "README.md"},
                        {"rfilename": "some-repo-Q4_K_M.gguf"},
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/org/some-repo-GGUF/resolve/main/some-repo-Q4_K_M.gguf")
            .with_status(200)
            .with_body(b"weights")
            .create_async()
            .await;

        let td = tempfile::tempdir().unwrap();
        let registry = registry(&td).with_endpoint(server.url());
        registry.register_user(user_entry("pullable")).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry
            .pull("user.pullable", &PullOptions::default(), &tx)
            .await
            .unwrap();
        drop(tx);

        let mut statuses = Vec::new();
        while let Some(event) = rx.recv().await {
            statuses.push(event.status);
        }
        assert!(statuses.contains(&DownloadStatus::Downloading));
        assert_eq!(statuses.last(), Some(&DownloadStatus::Completed));

        let entry = registry.get("user.pullable").unwrap();
        assert!(registry.is_downloaded(&entry));

        // Second pull with do_not_upgrade transfers nothing.
        let opts = PullOptions {
            do_not_upgrade: true,
            cancel: CancelToken::new(),
        };
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.pull("user.pullable", &opts, &tx).await.unwrap();
        drop(tx);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, DownloadStatus::Completed);
        assert_eq!(event.bytes_downloaded, 0);
    }

    #[test]
    fn unknown_model_errors() {
        let td = tempfile::tempdir().unwrap();
        let registry = registry(&td);
        assert!(matches!(
            registry.get("no-such-model"),
            Err(ModelsError::UnknownModel { .. })
        ));
    }
}
