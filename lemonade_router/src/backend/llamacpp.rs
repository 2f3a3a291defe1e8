//! GGUF backend – llama-server
//! ===========================
//!
//! Spawns `llama-server` against a concrete `.gguf` file from the hub cache
//! (or a local directory), with the build flavor (vulkan/rocm/metal/cpu)
//! selecting which bundled binary runs. The widest capability set of the
//! three backends: chat, completion, responses, embeddings and reranking.

use std::{
    path::PathBuf,
    process::Command,
    sync::{Arc, OnceLock},
};

use lemonade_models::{hub, CancelToken, CheckpointSource, HubCache, Label, Recipe};
use regex::Regex;

use super::{
    backend_pidfile, client::BackendHttp, launch_and_wait_ready, Backend, Capability,
    LoadRequest, LoadedModel,
};
use crate::{
    config::LlamaCppFlavor,
    error::{RouterError, RouterResult},
    process::{BackendProcessGuard, DEFAULT_GRACE},
    telemetry::Telemetry,
};

#[cfg(not(windows))]
const EXECUTABLE: &str = "llama-server";
#[cfg(windows)]
const EXECUTABLE: &str = "llama-server.exe";

const CAPABILITIES: &[Capability] = &[
    Capability::Chat,
    Capability::Completion,
    Capability::Responses,
    Capability::Embeddings,
    Capability::Reranking,
];

#[derive(Debug)]
struct Running {
    guard: BackendProcessGuard,
    client: BackendHttp,
    model: LoadedModel,
}

#[derive(Debug)]
pub struct LlamaCppBackend {
    cache: HubCache,
    flavor: LlamaCppFlavor,
    extra_args: Option<String>,
    telemetry: Arc<Telemetry>,
    running: Option<Running>,
}

impl LlamaCppBackend {
    pub fn new(
        cache: HubCache,
        flavor: LlamaCppFlavor,
        extra_args: Option<String>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            cache,
            flavor,
            extra_args,
            telemetry,
            running: None,
        }
    }

    /// Bundled binary for the selected flavor, falling back to `PATH`.
    fn executable(&self) -> PathBuf {
        let bundled = self
            .cache
            .root()
            .join("bin")
            .join("llamacpp")
            .join(self.flavor.as_str())
            .join(EXECUTABLE);
        if bundled.is_file() {
            bundled
        } else {
            PathBuf::from(EXECUTABLE)
        }
    }

    /// Locate the concrete model (and optional mmproj) files on disk.
    fn resolve_files(&self, req: &LoadRequest) -> RouterResult<(PathBuf, Option<PathBuf>)> {
        let entry = &req.entry;
        let dir = match entry.checkpoint.source() {
            CheckpointSource::Hub { org, repo, .. } => {
                self.cache.resolve_snapshot(org, repo).ok_or_else(|| {
                    RouterError::BackendFailed(format!(
                        "artifacts for '{}' not found; pull the model first",
                        entry.name
                    ))
                })?
            }
            CheckpointSource::LocalDir(dir) => dir.clone(),
        };

        let variant = entry.checkpoint.variant().unwrap_or_default();
        let model_file = hub::find_gguf(&dir, variant).ok_or_else(|| {
            RouterError::BackendFailed(format!(
                "no .gguf matching '{variant}' under {}",
                dir.display()
            ))
        })?;

        let mmproj_file = match &entry.mmproj {
            Some(mmproj) => {
                let path = dir.join(mmproj);
                if !path.is_file() {
                    return Err(RouterError::BackendFailed(format!(
                        "mmproj file '{mmproj}' not found under {}",
                        dir.display()
                    )));
                }
                Some(path)
            }
            None => None,
        };

        Ok((model_file, mmproj_file))
    }

    fn build_args(
        req: &LoadRequest,
        port: u16,
        model_file: &PathBuf,
        mmproj_file: Option<&PathBuf>,
        extra_args: Option<&str>,
    ) -> Vec<String> {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(4);

        let mut args = vec![
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
            "--ctx-size".into(),
            req.ctx_size.to_string(),
            "--model".into(),
            model_file.display().to_string(),
            "--threads".into(),
            threads.to_string(),
            "--no-webui".into(),
        ];
        if let Some(mmproj) = mmproj_file {
            args.push("--mmproj".into());
            args.push(mmproj.display().to_string());
        }
        if req.entry.has_label(Label::Embeddings) {
            args.push("--embeddings".into());
        }
        if req.entry.has_label(Label::Reranking) {
            args.push("--reranking".into());
        }
        if let Some(extra) = extra_args {
            args.extend(extra.split_whitespace().map(String::from));
        }
        args
    }
}

impl Backend for LlamaCppBackend {
    fn recipe(&self) -> Recipe {
        Recipe::LlamaCpp
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn route(&self, op: Capability) -> Option<&'static str> {
        match op {
            Capability::Chat => Some("/v1/chat/completions"),
            Capability::Completion => Some("/v1/completions"),
            Capability::Responses => Some("/v1/responses"),
            Capability::Embeddings => Some("/v1/embeddings"),
            Capability::Reranking => Some("/v1/rerank"),
            Capability::Transcription => None,
        }
    }

    fn load(&mut self, req: &LoadRequest, cancel: &CancelToken) -> RouterResult<LoadedModel> {
        self.unload();

        let (model_file, mmproj_file) = self.resolve_files(req)?;
        let client = BackendHttp::on_free_port()?;

        let mut cmd = Command::new(self.executable());
        cmd.args(Self::build_args(
            req,
            client.port(),
            &model_file,
            mmproj_file.as_ref(),
            self.extra_args.as_deref(),
        ));

        let pidfile = backend_pidfile(self.cache.root(), Recipe::LlamaCpp, client.port());
        let telemetry = Arc::clone(&self.telemetry);
        let sink: crate::process::LineSink = Box::new(move |line| parse_line(&telemetry, line));

        let guard = launch_and_wait_ready(cmd, pidfile, &client, cancel, sink)?;

        let model = LoadedModel {
            name: req.entry.name.clone(),
            checkpoint: req.entry.checkpoint.as_str().to_owned(),
            recipe: Recipe::LlamaCpp,
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
                crate::error!("failed to stop llama-server: {e}");
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

impl Drop for LlamaCppBackend {
    fn drop(&mut self) {
        self.unload();
    }
}

/// llama.cpp perf lines:
///
/// ```text
/// prompt eval time =     116.71 ms /    15 tokens (    7.78 ms per token, ...)
///        eval time =    1367.68 ms /    99 runs   (   13.82 ms per token,    72.38 tokens per second)
/// ```
fn parse_line(telemetry: &Telemetry, line: &str) {
    static PROMPT_RE: OnceLock<Regex> = OnceLock::new();
    static EVAL_RE: OnceLock<Regex> = OnceLock::new();

    let prompt_re = PROMPT_RE.get_or_init(|| {
        Regex::new(r"prompt eval time\s*=\s*([0-9.]+)\s*ms\s*/\s*([0-9]+)\s*tokens")
            .expect("static regex compiles")
    });
    let eval_re = EVAL_RE.get_or_init(|| {
        Regex::new(
            r"eval time\s*=\s*([0-9.]+)\s*ms\s*/\s*([0-9]+)\s*(?:runs|tokens)\s*\(\s*([0-9.]+)\s*ms per token,\s*([0-9.]+)\s*tokens per second",
        )
        .expect("static regex compiles")
    });

    if let Some(caps) = prompt_re.captures(line) {
        let (Ok(ms), Ok(tokens)) = (caps[1].parse::<f64>(), caps[2].parse::<u64>()) else {
            return;
        };
        telemetry.record_prompt(tokens, ms);
    } else if !line.contains("prompt eval") {
        if let Some(caps) = eval_re.captures(line) {
            let (Ok(tokens), Ok(per_token), Ok(tps)) = (
                caps[2].parse::<u64>(),
                caps[3].parse::<f64>(),
                caps[4].parse::<f64>(),
            ) else {
                return;
            };
            telemetry.record_decode(tokens, per_token, tps);
        }
    }
}
