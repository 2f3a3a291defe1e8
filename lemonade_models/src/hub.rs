//! Hub cache – on-disk layout
//! ==========================
//!
//! All artifacts live under one per-user cache root (`~/.cache/lemonade` on
//! Linux, `%LOCALAPPDATA%\lemonade` on Windows). Hub checkpoints use the
//! Hugging Face hub convention so artifacts downloaded by other tools are
//! found too:
//!
//! ```text
//! <root>/hub/models--{org}--{repo}/snapshots/{rev}/<files>
//! <root>/flm/<repo>/…              FastLM cache
//! <root>/user_models.json          user catalog
//! <root>/lemonade-router.pid       serve discovery file
//! ```

use std::path::{Path, PathBuf};

use crate::error::{ModelsError, ModelsResult};

/// Revision directory used for files we download ourselves. Hub snapshots
/// produced by other tools carry a commit hash instead; [`HubCache::resolve_snapshot`]
/// accepts either.
pub const DEFAULT_REVISION: &str = "main";

#[derive(Debug, Clone)]
pub struct HubCache {
    root: PathBuf,
}

impl HubCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The platform cache directory for this tool.
    pub fn default_root() -> ModelsResult<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "lemonade").ok_or_else(|| {
            ModelsError::file_system(
                "locate user cache directory",
                "lemonade",
                std::io::Error::new(std::io::ErrorKind::NotFound, "no home directory"),
            )
        })?;
        Ok(dirs.cache_dir().to_path_buf())
    }

    pub fn from_default_root() -> ModelsResult<Self> {
        Ok(Self::new(Self::default_root()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user_models_path(&self) -> PathBuf {
        self.root.join("user_models.json")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.root.join("lemonade-router.pid")
    }

    pub fn lock_path(&self, tag: &str) -> PathBuf {
        self.root.join(format!("{tag}.lock"))
    }

    /// `org/repo` → `hub/models--org--repo`, slashes replaced the way the
    /// hub cache does it.
    pub fn repo_dir(&self, org: &str, repo: &str) -> PathBuf {
        self.root.join("hub").join(format!("models--{org}--{repo}"))
    }

    pub fn snapshot_dir(&self, org: &str, repo: &str, rev: &str) -> PathBuf {
        self.repo_dir(org, repo).join("snapshots").join(rev)
    }

    /// The snapshot directory to hand a backend: prefers [`DEFAULT_REVISION`],
    /// otherwise the single hash directory another downloader left behind.
    pub fn resolve_snapshot(&self, org: &str, repo: &str) -> Option<PathBuf> {
        let main = self.snapshot_dir(org, repo, DEFAULT_REVISION);
        if main.is_dir() {
            return Some(main);
        }

        let snapshots = self.repo_dir(org, repo).join("snapshots");
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(&snapshots)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs.into_iter().next()
    }

    pub fn flm_dir(&self) -> PathBuf {
        self.root.join("flm")
    }

    pub fn flm_model_dir(&self, repo: &str) -> PathBuf {
        self.flm_dir().join(repo)
    }
}

/// Find a `.gguf` file in `dir` matching `variant`. The variant is either a
/// concrete filename or a quant tag matched case-insensitively against the
/// file names.
pub fn find_gguf(dir: &Path, variant: &str) -> Option<PathBuf> {
    let want = variant.to_ascii_lowercase();
    if want.ends_with(".gguf") {
        let direct = dir.join(variant);
        return direct.is_file().then_some(direct);
    }

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| {
                        let lower = n.to_ascii_lowercase();
                        lower.ends_with(".gguf")
                            && !lower.starts_with("mmproj")
                            && (want.is_empty() || lower.contains(&want))
                    })
                    .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

pub fn dir_is_nonempty(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
