//! Backend capability surface
//! ==========================
//!
//! A [`Backend`] wraps one flavor of inference server subprocess behind a
//! uniform contract: synchronous `load` (spawn + readiness wait, may take
//! 30–60 s), idempotent `unload`, a stable loopback address, a capability
//! set, and per-capability upstream routes the gateway proxies to.
//!
//! Three concrete flavors exist: [`llamacpp::LlamaCppBackend`] for GGUF
//! models, [`oga::OgaBackend`] for the vendor NPU/hybrid/CPU server, and
//! [`flm::FlmBackend`] for FastLM.

pub mod client;
pub mod flm;
pub mod llamacpp;
pub mod oga;

use std::{collections::BTreeSet, fmt, path::PathBuf, time::Duration};

use lemonade_models::{CancelToken, Label, ModelEntry, Recipe};
use serde::Serialize;

use crate::{
    config::DEFAULT_READY_TIMEOUT,
    error::{RouterError, RouterResult},
    process::{BackendProcessGuard, LineSink, ProcessError, DEFAULT_GRACE},
};
use client::{BackendHttp, HealthProbe};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One operation a backend may (or may not) implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Chat,
    Completion,
    Responses,
    Embeddings,
    Reranking,
    Transcription,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Chat => "chat",
            Capability::Completion => "completion",
            Capability::Responses => "responses",
            Capability::Embeddings => "embeddings",
            Capability::Reranking => "reranking",
            Capability::Transcription => "transcription",
        };
        f.write_str(s)
    }
}

/// Everything a backend needs to bring one model up.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub entry: ModelEntry,
    pub ctx_size: u32,
}

impl LoadRequest {
    /// Two requests describe the same load when name, checkpoint and recipe
    /// agree; a repeated load of the active triple is a no-op upstream.
    pub fn same_model(&self, model: &LoadedModel) -> bool {
        self.entry.name == model.name
            && self.entry.checkpoint.as_str() == model.checkpoint
            && self.entry.recipe == model.recipe
    }
}

/// Exists exactly while a backend subprocess is alive and past readiness.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadedModel {
    pub name: String,
    pub checkpoint: String,
    pub recipe: Recipe,
    pub labels: BTreeSet<Label>,
    pub backend_address: String,
}

/// What the router hands the gateway for one validated dispatch.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    /// Fully-qualified upstream URL for the operation.
    pub url: String,
    pub model_name: String,
    pub recipe: Recipe,
}

/// Uniform surface over a running (or empty) inference server.
pub trait Backend: Send + Sync + fmt::Debug {
    fn recipe(&self) -> Recipe;

    fn capabilities(&self) -> &'static [Capability];

    /// Upstream route for an operation; `None` when unsupported.
    fn route(&self, op: Capability) -> Option<&'static str>;

    /// Spawn the subprocess and block until its health endpoint answers, up
    /// to the ready timeout. On failure the child is killed, never leaked.
    fn load(&mut self, req: &LoadRequest, cancel: &CancelToken) -> RouterResult<LoadedModel>;

    /// Idempotent teardown of the subprocess.
    fn unload(&mut self);

    /// `http://127.0.0.1:<port>` while loaded.
    fn address(&self) -> Option<String>;

    fn is_alive(&self) -> bool;

    /// Feed one line of child stdout through the backend's telemetry
    /// pattern.
    fn parse_telemetry(&self, line: &str);
}

/// Pidfile used for a backend slot, always under `<cache>/backends/`.
pub(crate) fn backend_pidfile(cache_root: &std::path::Path, recipe: Recipe, port: u16) -> PathBuf {
    let tag = sanitize_filename::sanitize(format!("{recipe}_{port}").to_ascii_lowercase());
    cache_root.join("backends").join(format!("{tag}.pid"))
}

/// Spawn `cmd` and poll the health endpoint until ready. On timeout,
/// cancellation, or child death the process is torn down before returning.
pub(crate) fn launch_and_wait_ready(
    cmd: std::process::Command,
    pidfile: PathBuf,
    client: &BackendHttp,
    cancel: &CancelToken,
    stdout_sink: LineSink,
) -> RouterResult<BackendProcessGuard> {
    let stderr_sink: LineSink = Box::new(|line: &str| crate::debug!("backend stderr: {line}"));

    let guard = BackendProcessGuard::spawn(cmd, &pidfile, stdout_sink, stderr_sink).map_err(
        |e| match e {
            ProcessError::SpawnFailed { .. } => RouterError::BackendFailed(e.to_string()),
            other => other.into(),
        },
    )?;

    let deadline = std::time::Instant::now() + DEFAULT_READY_TIMEOUT;
    loop {
        if cancel.is_cancelled() {
            let _ = guard.stop(DEFAULT_GRACE);
            return Err(RouterError::LoadCancelled);
        }
        if !guard.is_alive() {
            let _ = guard.stop(DEFAULT_GRACE);
            return Err(RouterError::BackendFailed(
                "backend process exited during startup".into(),
            ));
        }
        match client.health() {
            HealthProbe::Ready => return Ok(guard),
            HealthProbe::Loading | HealthProbe::Offline(_) => {
                if std::time::Instant::now() >= deadline {
                    let _ = guard.stop(DEFAULT_GRACE);
                    return Err(RouterError::BackendStartTimeout {
                        elapsed: DEFAULT_READY_TIMEOUT,
                    });
                }
                std::thread::sleep(READY_POLL_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_pidfile_is_sanitized_and_scoped() {
        let pf = backend_pidfile(std::path::Path::new("/cache"), Recipe::LlamaCpp, 8123);
        assert_eq!(pf, PathBuf::from("/cache/backends/llamacpp_8123.pid"));
    }

    #[test]
    fn same_model_compares_the_triple() {
        let entry = ModelEntry {
            name: "m".into(),
            checkpoint: lemonade_models::Checkpoint::try_new("org/repo").unwrap(),
            recipe: Recipe::OgaCpu,
            labels: BTreeSet::new(),
            mmproj: None,
            suggested: false,
        };
        let req = LoadRequest {
            entry: entry.clone(),
            ctx_size: 4096,
        };
        let mut model = LoadedModel {
            name: "m".into(),
            checkpoint: "org/repo".into(),
            recipe: Recipe::OgaCpu,
            labels: BTreeSet::new(),
            backend_address: "http://127.0.0.1:1".into(),
        };
        assert!(req.same_model(&model));
        model.recipe = Recipe::Flm;
        assert!(!req.same_model(&model));
    }
}
