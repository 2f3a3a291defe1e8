//! FastLM backend
//!
//! FastLM manages its own cache directory (pointed at ours via `FLM_HOME`)
//! and is started as `flm serve <org/repo>`. Chat-shaped capabilities only.

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
const EXECUTABLE: &str = "flm";
#[cfg(windows)]
const EXECUTABLE: &str = "flm.exe";

const CAPABILITIES: &[Capability] = &[
    Capability::Chat,
    Capability::Completion,
    Capability::Responses,
];

#[derive(Debug)]
struct Running {
    guard: BackendProcessGuard,
    client: BackendHttp,
    model: LoadedModel,
}

#[derive(Debug)]
pub struct FlmBackend {
    cache: HubCache,
    telemetry: Arc<Telemetry>,
    running: Option<Running>,
}

impl FlmBackend {
    pub fn new(cache: HubCache, telemetry: Arc<Telemetry>) -> Self {
        Self {
            cache,
            telemetry,
            running: None,
        }
    }

    fn executable(&self) -> PathBuf {
        let bundled = self.cache.root().join("bin").join("flm").join(EXECUTABLE);
        if bundled.is_file() {
            bundled
        } else {
            PathBuf::from(EXECUTABLE)
        }
    }

    fn build_args(checkpoint: &str, port: u16) -> Vec<String> {
        vec![
            "serve".into(),
            checkpoint.into(),
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
        ]
    }
}

impl Backend for FlmBackend {
    fn recipe(&self) -> Recipe {
        Recipe::Flm
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

        let repo_id = match req.entry.checkpoint.source() {
            CheckpointSource::Hub { org, repo, .. } => format!("{org}/{repo}"),
            CheckpointSource::LocalDir(_) => {
                return Err(RouterError::BackendFailed(
                    "the flm recipe requires an org/repo checkpoint".into(),
                ));
            }
        };

        let client = BackendHttp::on_free_port()?;

        let mut cmd = Command::new(self.executable());
        cmd.args(Self::build_args(&repo_id, client.port()));
        cmd.env("FLM_HOME", self.cache.flm_dir());

        let pidfile = backend_pidfile(self.cache.root(), Recipe::Flm, client.port());
        let telemetry = Arc::clone(&self.telemetry);
        let sink: crate::process::LineSink = Box::new(move |line| parse_line(&telemetry, line));

        let guard = launch_and_wait_ready(cmd, pidfile, &client, cancel, sink)?;

        let model = LoadedModel {
            name: req.entry.name.clone(),
            checkpoint: req.entry.checkpoint.as_str().to_owned(),
            recipe: Recipe::Flm,
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
                crate::error!("failed to stop flm: {e}");
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

impl Drop for FlmBackend {
    fn drop(&mut self) {
        self.unload();
    }
}

/// FastLM stat line:
///
/// ```text
/// [PERF] ttft=116.71ms prompt_tokens=15 tokens=99 tps=72.38
/// ```
fn parse_line(telemetry: &Telemetry, line: &str) {
    static PERF_RE: OnceLock<Regex> = OnceLock::new();

    let perf_re = PERF_RE.get_or_init(|| {
        Regex::new(
            r"\[PERF\]\s*ttft=([0-9.]+)ms\s*prompt_tokens=([0-9]+)\s*tokens=([0-9]+)\s*tps=([0-9.]+)",
        )
        .expect("static regex compiles")
    });

    if let Some(caps) = perf_re.captures(line) {
        let (Ok(ttft), Ok(prompt), Ok(tokens), Ok(tps)) = (
            caps[1].parse::<f64>(),
            caps[2].parse::<u64>(),
            caps[3].parse::<u64>(),
            caps[4].parse::<f64>(),
        ) else {
            return;
        };
        telemetry.record_prompt(prompt, ttft);
        let per_token = if tokens > 0 && tps > 0.0 {
            1000.0 / tps
        } else {
            0.0
        };
        telemetry.record_decode(tokens, per_token, tps);
    }
}
