//! Catalog entries
//! ===============
//!
//! [`ModelEntry`] is the unit stored in both the built-in and the user
//! catalog. The interesting part is [`Checkpoint`]: a validated
//! `org/repo[:variant]` hub reference *or* an absolute local directory, with
//! the rule that anything naming a GGUF artifact must pin a `:variant` so the
//! downloader can pick one concrete file.

use std::{collections::BTreeSet, fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

/// Reserved prefix applied to user-registered entries when merging the two
/// catalog layers into one namespace.
pub const USER_PREFIX: &str = "user.";

#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("model name is empty")]
    EmptyName,

    #[error("model name '{name}' must not carry the reserved '{prefix}' prefix")]
    ReservedPrefix { name: String, prefix: &'static str },

    #[error("checkpoint is empty")]
    EmptyCheckpoint,

    #[error("checkpoint '{checkpoint}': expected 'org/repo[:variant]' or an absolute directory")]
    MalformedCheckpoint { checkpoint: String },

    #[error("checkpoint '{checkpoint}': GGUF checkpoints must pin a ':variant'")]
    MissingVariant { checkpoint: String },

    #[error("unknown recipe '{recipe}'")]
    UnknownRecipe { recipe: String },

    #[error("GGUF vision models require an mmproj file")]
    MissingMmproj,
}

/// Selects which backend implementation is spawned for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Recipe {
    #[serde(rename = "llamacpp")]
    LlamaCpp,
    #[serde(rename = "flm")]
    Flm,
    #[serde(rename = "oga-cpu")]
    OgaCpu,
    #[serde(rename = "oga-hybrid")]
    OgaHybrid,
    #[serde(rename = "oga-npu")]
    OgaNpu,
}

impl Recipe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recipe::LlamaCpp => "llamacpp",
            Recipe::Flm => "flm",
            Recipe::OgaCpu => "oga-cpu",
            Recipe::OgaHybrid => "oga-hybrid",
            Recipe::OgaNpu => "oga-npu",
        }
    }

    /// Whether the backend this recipe selects can run on the current host.
    /// The NPU and hybrid execution modes need the vendor runtime, which only
    /// ships for Windows on Ryzen AI silicon.
    pub fn supported_on_host(&self) -> bool {
        match self {
            Recipe::LlamaCpp | Recipe::OgaCpu => true,
            Recipe::Flm => cfg!(any(target_os = "windows", target_os = "linux")),
            Recipe::OgaHybrid | Recipe::OgaNpu => cfg!(target_os = "windows"),
        }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recipe {
    type Err = EntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llamacpp" => Ok(Recipe::LlamaCpp),
            "flm" => Ok(Recipe::Flm),
            "oga-cpu" => Ok(Recipe::OgaCpu),
            "oga-hybrid" => Ok(Recipe::OgaHybrid),
            "oga-npu" => Ok(Recipe::OgaNpu),
            other => Err(EntryError::UnknownRecipe {
                recipe: other.to_owned(),
            }),
        }
    }
}

/// Capability/feature tags attached to a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Reasoning,
    Vision,
    Embeddings,
    Reranking,
    Custom,
}

/// Where a checkpoint's weights live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CheckpointSource {
    /// Hub reference `org/repo` with an optional `:variant` suffix. The
    /// variant is either a concrete `.gguf` filename or a quantization tag
    /// matched against the repo's file list.
    Hub {
        org: String,
        repo: String,
        variant: Option<String>,
    },
    /// Absolute path to a local model directory; never downloaded.
    LocalDir(PathBuf),
}

/// A validated checkpoint string. Keeps the raw form for display and the
/// parsed [`CheckpointSource`] for resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checkpoint {
    raw: String,
    source: CheckpointSource,
}

impl Checkpoint {
    pub fn try_new<S: AsRef<str>>(raw: S) -> Result<Self, EntryError> {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            return Err(EntryError::EmptyCheckpoint);
        }

        let path = std::path::Path::new(raw);
        if path.is_absolute() {
            return Ok(Self {
                raw: raw.to_owned(),
                source: CheckpointSource::LocalDir(path.to_path_buf()),
            });
        }

        let (repo_id, variant) = match raw.split_once(':') {
            Some((repo_id, variant)) if !variant.is_empty() => (repo_id, Some(variant)),
            Some(_) => {
                return Err(EntryError::MalformedCheckpoint {
                    checkpoint: raw.to_owned(),
                });
            }
            None => (raw, None),
        };

        let (org, repo) = repo_id
            .split_once('/')
            .filter(|(org, repo)| !org.is_empty() && !repo.is_empty() && !repo.contains('/'))
            .ok_or_else(|| EntryError::MalformedCheckpoint {
                checkpoint: raw.to_owned(),
            })?;

        // A GGUF repo without a pinned variant is ambiguous: the downloader
        // would not know which quantization to fetch.
        if raw.to_ascii_lowercase().contains("gguf") && variant.is_none() {
            return Err(EntryError::MissingVariant {
                checkpoint: raw.to_owned(),
            });
        }

        Ok(Self {
            raw: raw.to_owned(),
            source: CheckpointSource::Hub {
                org: org.to_owned(),
                repo: repo.to_owned(),
                variant: variant.map(|v| v.to_owned()),
            },
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn source(&self) -> &CheckpointSource {
        &self.source
    }

    /// `org/repo` without the variant suffix; `None` for local directories.
    pub fn repo_id(&self) -> Option<String> {
        match &self.source {
            CheckpointSource::Hub { org, repo, .. } => Some(format!("{org}/{repo}")),
            CheckpointSource::LocalDir(_) => None,
        }
    }

    pub fn variant(&self) -> Option<&str> {
        match &self.source {
            CheckpointSource::Hub { variant, .. } => variant.as_deref(),
            CheckpointSource::LocalDir(_) => None,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for Checkpoint {
    type Error = EntryError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::try_new(raw)
    }
}

impl From<Checkpoint> for String {
    fn from(c: Checkpoint) -> String {
        c.raw
    }
}

/// One catalog row: everything needed to download and load a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub checkpoint: Checkpoint,
    pub recipe: Recipe,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<Label>,
    /// Multimodal projector file; required for GGUF vision models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<String>,
    #[serde(default)]
    pub suggested: bool,
}

impl ModelEntry {
    /// Validate an entry as supplied by a user registration. Catalog names
    /// are stored *without* the `user.` prefix; the prefix is applied when
    /// the two layers are merged.
    pub fn validate_for_registration(&self) -> Result<(), EntryError> {
        if self.name.trim().is_empty() {
            return Err(EntryError::EmptyName);
        }
        if self.name.starts_with(USER_PREFIX) {
            return Err(EntryError::ReservedPrefix {
                name: self.name.clone(),
                prefix: USER_PREFIX,
            });
        }
        if self.recipe == Recipe::LlamaCpp
            && self.labels.contains(&Label::Vision)
            && self.mmproj.is_none()
        {
            return Err(EntryError::MissingMmproj);
        }
        Ok(())
    }

    pub fn has_label(&self, label: Label) -> bool {
        self.labels.contains(&label)
    }
}
