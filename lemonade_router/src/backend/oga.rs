//! Vendor OGA backend (NPU / hybrid / CPU execution)
//!
//! The vendor server takes a resolved model *directory* (a hub snapshot)
//! rather than a single file, plus an execution-mode flag. Chat-shaped
//! capabilities only.

use std::{
    path::PathBuf,
    process::Command,
    sync::{Arc, OnceLock},
};

use lemonade_models::{CancelToken, CheckpointSource, HubCache, Recipe};
use regex::Regex;

use super::{
    backend_pidfile, client::BackendHttp, launch_and_wait_ready, Backend, Capability,
    LoadRequest, LoadedModel,
};
use crate::{
    error::{RouterError, RouterResult},
    process::{BackendProcessGuard, DEFAULT_GRACE},
    telemetry::Telemetry,
};

#[cfg(not(windows))]
const EXECUTABLE: &str = "oga-server";
#[cfg(windows)]
const EXECUTABLE: &str = "oga-server.exe";

const CAPABILITIES: &[Capability] = &[
    Capability::Chat,
    Capability::Completion,
    Capability::Responses,
];

/// Which execution provider the vendor server should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Npu,
    Hybrid,
    Cpu,
}

impl ExecutionMode {
    pub fn from_recipe(recipe: Recipe) -> Option<Self> {
        match recipe {
            Recipe::OgaNpu => Some(ExecutionMode::Npu),
            Recipe::OgaHybrid => Some(ExecutionMode::Hybrid),
            Recipe::OgaCpu => Some(ExecutionMode::Cpu),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Npu => "npu",
            ExecutionMode::Hybrid => "hybrid",
            ExecutionMode::Cpu => "cpu",
        }
    }
}

#[derive(Debug)]
struct Running {
    guard: BackendProcessGuard,
    client: BackendHttp,
    model: LoadedModel,
}

#[derive(Debug)]
pub struct OgaBackend {
    cache: HubCache,
    mode: ExecutionMode,
    recipe: Recipe,
    telemetry: Arc<Telemetry>,
    running: Option<Running>,
}

impl OgaBackend {
    pub fn new(cache: HubCache, recipe: Recipe, telemetry: Arc<Telemetry>) -> RouterResult<Self> {
        let mode = ExecutionMode::from_recipe(recipe).ok_or(RouterError::InvalidConfig {
            field: "recipe",
            reason: format!("'{recipe}' is not an OGA recipe"),
        })?;
        Ok(Self {
            cache,
            mode,
            recipe,
            telemetry,
            running: None,
        })
    }

    fn executable(&self) -> PathBuf {
        let bundled = self.cache.root().join("bin").join("oga").join(EXECUTABLE);
        if bundled.is_file() {
            bundled
        } else {
            PathBuf::from(EXECUTABLE)
        }
    }

    /// The model directory handed to the server: a resolved hub snapshot or
    /// a user-supplied local directory.
    fn resolve_model_dir(&self, req: &LoadRequest) -> RouterResult<PathBuf> {
        match req.entry.checkpoint.source() {
            CheckpointSource::Hub { org, repo, .. } => {
                self.cache.resolve_snapshot(org, repo).ok_or_else(|| {
                    RouterError::BackendFailed(format!(
                        "artifacts for '{}' not found; pull the model first",
                        req.entry.name
                    ))
                })
            }
            CheckpointSource::LocalDir(dir) => Ok(dir.clone()),
        }
    }

    fn build_args(req: &LoadRequest, port: u16, model_dir: &PathBuf, mode: ExecutionMode) -> Vec<String> {
        vec![
            "-m".into(),
            model_dir.display().to_string(),
            "--execution".into(),
            mode.as_str().into(),
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
            "--ctx-size".into(),
            req.ctx_size.to_string(),
        ]
    }
}

impl Backend for OgaBackend {
    fn recipe(&self) -> Recipe {
        self.recipe
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn route(&self, op: Capability) -> Option<&'static str> {
        match op {
            Capability::Chat => Some("/v1/chat/completions"),
            Capability::Completion => Some("/v1/completions"),
            Capability::Responses => Some("/v1/responses"),
            _ => None,
        }
    }

    fn load(&mut self, req: &LoadRequest, cancel: &CancelToken) -> RouterResult<LoadedModel> {
        self.unload();

        let model_dir = self.resolve_model_dir(req)?;
        let client = BackendHttp::on_free_port()?;

        let mut cmd = Command::new(self.executable());
        cmd.args(Self::build_args(req, client.port(), &model_dir, self.mode));

        let pidfile = backend_pidfile(self.cache.root(), self.recipe, client.port());
        let telemetry = Arc::clone(&self.telemetry);
        let sink: crate::process::LineSink = Box::new(move |line| parse_line(&telemetry, line));

        let guard = launch_and_wait_ready(cmd, pidfile, &client, cancel, sink)?;

        let model = LoadedModel {
            name: req.entry.name.clone(),
            checkpoint: req.entry.checkpoint.as_str().to_owned(),
            recipe: self.recipe,
            labels: req.entry.labels.clone(),
            backend_address: client.base_url().to_owned(),
        };
        self.running = Some(Running {
            guard,
            client,
            model: model.clone(),
        });
        Ok(model)
    }

    fn unload(&mut self) {
        if let Some(running) = self.running.take() {
            crate::info!("unloading '{}'", running.model.name);
            if let Err(e) = running.guard.stop(DEFAULT_GRACE) {
                crate::error!("failed to stop oga-server: {e}");
            }
        }
    }

    fn address(&self) -> Option<String> {
        self.running
            .as_ref()
            .map(|r| r.client.base_url().to_owned())
    }

    fn is_alive(&self) -> bool {
        self.running.as_ref().map(|r| r.guard.is_alive()).unwrap_or(false)
    }

    fn parse_telemetry(&self, line: &str) {
        parse_line(&self.telemetry, line);
    }
}

impl Drop for OgaBackend {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Vendor server stat lines:
///
/// ```text
/// Prompt processing: 15 tokens in 116.71 ms
/// Token generation: 99 tokens in 1367.68 ms (72.38 tok/s)
/// ```
fn parse_line(telemetry: &Telemetry, line: &str) {
    static PROMPT_RE: OnceLock<Regex> = OnceLock::new();
    static GEN_RE: OnceLock<Regex> = OnceLock::new();

    let prompt_re = PROMPT_RE.get_or_init(|| {
        Regex::new(r"Prompt processing:\s*([0-9]+)\s*tokens in\s*([0-9.]+)\s*ms")
            .expect("static regex compiles")
    });
    let gen_re = GEN_RE.get_or_init(|| {
        Regex::new(r"Token generation:\s*([0-9]+)\s*tokens in\s*([0-9.]+)\s*ms\s*\(([0-9.]+)\s*tok/s\)")
            .expect("static regex compiles")
    });

    if let Some(caps) = prompt_re.captures(line) {
        let (Ok(tokens), Ok(ms)) = (caps[1].parse::<u64>(), caps[2].parse::<f64>()) else {
            return;
        };
        telemetry.record_prompt(tokens, ms);
    } else if let Some(caps) = gen_re.captures(line) {
        let (Ok(tokens), Ok(ms), Ok(tps)) = (
            caps[1].parse::<u64>(),
            caps[2].parse::<f64>(),
            caps[3].parse::<f64>(),
        ) else {
            return;
        };
        let per_token = if tokens > 0 { ms / tokens as f64 } else { 0.0 };
        telemetry.record_decode(tokens, per_token, tps);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use lemonade_models::{Checkpoint, ModelEntry};

    use super::*;

    #[test]
    fn execution_mode_from_recipe() {
        assert_eq!(
            ExecutionMode::from_recipe(Recipe::OgaNpu),
            Some(ExecutionMode::Npu)
        );
        assert_eq!(
            ExecutionMode::from_recipe(Recipe::OgaHybrid),
            Some(ExecutionMode::Hybrid)
        );
        assert_eq!(
            ExecutionMode::from_recipe(Recipe::OgaCpu),
            Some(ExecutionMode::Cpu)
        );
        assert_eq!(ExecutionMode::from_recipe(Recipe::LlamaCpp), None);
    }

    #[test]
    fn build_args_pass_model_dir_and_mode() {
        let req = LoadRequest {
            entry: ModelEntry {
                name: "hybrid-model".into(),
                checkpoint: Checkpoint::try_new("amd/some-onnx-hybrid").unwrap(),
                recipe: Recipe::OgaHybrid,
                labels: BTreeSet::new(),
                mmproj: None,
                suggested: false,
            },
            ctx_size: 2048,
        };
        let dir = PathBuf::from("/cache/hub/models--amd--some-onnx-hybrid/snapshots/main");
        let args = OgaBackend::build_args(&req, 9001, &dir, ExecutionMode::Hybrid);

        assert!(args.windows(2).any(|w| w[0] == "-m" && w[1].contains("models--amd--some-onnx-hybrid")));
        assert!(args.windows(2).any(|w| w == ["--execution", "hybrid"]));
        assert!(args.windows(2).any(|w| w == ["--port", "9001"]));
        assert!(args.windows(2).any(|w| w == ["--ctx-size", "2048"]));
    }

    #[test]
    fn embeddings_and_reranking_are_unsupported() {
        let backend = OgaBackend::new(
            HubCache::new(PathBuf::from("/cache")),
            Recipe::OgaNpu,
            Arc::new(Telemetry::new()),
        )
        .unwrap();
        assert_eq!(backend.route(Capability::Embeddings), None);
        assert_eq!(backend.route(Capability::Reranking), None);
        assert!(backend.route(Capability::Chat).is_some());
    }

    #[test]
    fn telemetry_parses_stat_lines() {
        let telemetry = Telemetry::new();
        parse_line(&telemetry, "Prompt processing: 15 tokens in 116.71 ms");
        parse_line(&telemetry, "Token generation: 99 tokens in 1367.68 ms (72.38 tok/s)");

        let snap = telemetry.snapshot();
        assert_eq!(snap.input_tokens, Some(15));
        assert_eq!(snap.output_tokens, Some(99));
        assert_eq!(snap.tokens_per_second, Some(72.38));
    }
}
