//! Ephemeral CLI commands (`list`, `pull`, `delete`, `status`, `stop`)
//! ===================================================================
//!
//! These must succeed alongside a running `serve`: they detect it through
//! the PID-port discovery file and forward over HTTP, falling back to
//! operating on the local cache/catalog directly when nothing is running.

use std::time::Duration;

use lemonade_models::{DownloadEvent, Fetcher, HubCache, ModelRegistry, PullOptions};
use lemonade_router::{process, InstanceLock};
use serde_json::json;

use crate::cli::RegisterArgs;
use crate::routes::models::RegisterRequest;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
/// A forwarded pull streams for as long as the download runs.
const PULL_TIMEOUT: Duration = Duration::from_secs(6 * 3600);

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start async runtime: {e}"))
}

fn cache() -> Result<HubCache, String> {
    HubCache::from_default_root().map_err(|e| e.to_string())
}

/// `status` – one line of JSON, grep-friendly.
pub fn status() -> Result<(), String> {
    let cache = cache()?;
    match InstanceLock::discover(&cache) {
        Some((pid, port)) => println!("{}", json!({ "running": true, "port": port, "pid": pid })),
        None => println!("{}", json!({ "running": false })),
    }
    Ok(())
}

/// `stop` – polite-then-forceful against the recorded server PID.
pub fn stop() -> Result<(), String> {
    let cache = cache()?;
    match InstanceLock::discover(&cache) {
        Some((pid, port)) => {
            process::kill_pids(&[pid], process::DEFAULT_GRACE).map_err(|e| e.to_string())?;
            println!("stopped server on port {port} (PID {pid})");
            Ok(())
        }
        None => {
            println!("no server is running");
            Ok(())
        }
    }
}

/// `list` – forwarded when a server runs (its catalog view is live),
/// local otherwise.
pub fn list() -> Result<(), String> {
    let cache = cache()?;

    if let Some((_, port)) = InstanceLock::discover(&cache) {
        let rt = runtime()?;
        let models = rt
            .block_on(async {
                Fetcher::default()
                    .get_json(&format!("http://127.0.0.1:{port}/api/v1/models"))
                    .await
            })
            .map_err(|e| format!("failed to query running server: {e}"))?;

        let empty = Vec::new();
        for model in models["data"].as_array().unwrap_or(&empty) {
            let downloaded = if model["downloaded"].as_bool().unwrap_or(false) {
                "downloaded"
            } else {
                "-"
            };
            println!(
                "{:<40} {:<12} {}",
                model["id"].as_str().unwrap_or("?"),
                model["recipe"].as_str().unwrap_or("?"),
                downloaded,
            );
        }
        return Ok(());
    }

    let registry = ModelRegistry::new(cache);
    let supported = registry.list_supported().map_err(|e| e.to_string())?;
    for (name, entry) in &supported {
        let downloaded = if registry.is_downloaded(entry) {
            "downloaded"
        } else {
            "-"
        };
        println!("{:<40} {:<12} {}", name, entry.recipe, downloaded);
    }
    Ok(())
}

/// `pull` – optionally registers a user model first (when `--checkpoint`
/// is given), then downloads, forwarding to a running server when present.
pub fn pull(model: &str, register: RegisterArgs) -> Result<(), String> {
    let cache = cache()?;
    let rt = runtime()?;

    let register_req = build_register_request(model, &register)?;

    if let Some((_, port)) = InstanceLock::discover(&cache) {
        return rt.block_on(forward_pull(port, model, register_req));
    }

    let registry = ModelRegistry::new(cache);
    let name = match register_req {
        Some(req) => {
            let entry = req.into_entry().map_err(|e| e.to_string())?;
            registry.register_user(entry).map_err(|e| e.to_string())?
        }
        None => model.to_owned(),
    };

    rt.block_on(async {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DownloadEvent>();
        let printer = tokio::spawn(async move {
            let mut last_percent = None;
            while let Some(event) = rx.recv().await {
                if event.percent != last_percent {
                    last_percent = event.percent;
                    if let Some(percent) = event.percent {
                        println!("{} [{}/{}] {percent}%", event.file, event.file_index, event.total_files);
                    }
                }
            }
        });
        let result = registry.pull(&name, &PullOptions::default(), &tx).await;
        drop(tx);
        let _ = printer.await;
        result.map_err(|e| e.to_string())
    })?;

    println!("{name} pulled");
    Ok(())
}

async fn forward_pull(
    port: u16,
    model: &str,
    register_req: Option<RegisterRequest>,
) -> Result<(), String> {
    let fetcher = Fetcher::default();
    let base = format!("http://127.0.0.1:{port}/api/v1");

    let name = match register_req {
        Some(req) => {
            let body = json!({
                "name": req.name,
                "checkpoint": req.checkpoint,
                "recipe": req.recipe,
                "labels": req.labels,
                "mmproj": req.mmproj,
            });
            let resp = fetcher
                .post_json(&format!("{base}/register"), &body, FORWARD_TIMEOUT)
                .await
                .map_err(|e| format!("register failed: {e}"))?;
            resp["registered"]
                .as_str()
                .unwrap_or(model)
                .to_owned()
        }
        None => model.to_owned(),
    };

    let body = json!({ "model": name });
    fetcher
        .post_stream(&format!("{base}/pull"), &body, PULL_TIMEOUT, |chunk| {
            // progress frames are printed as they arrive
            print!("{}", String::from_utf8_lossy(chunk));
            true
        })
        .await
        .map_err(|e| format!("pull failed: {e}"))?;
    println!("{name} pulled");
    Ok(())
}

/// `delete` – forwarded or local.
pub fn delete(model: &str) -> Result<(), String> {
    let cache = cache()?;

    if let Some((_, port)) = InstanceLock::discover(&cache) {
        let rt = runtime()?;
        let url = format!("http://127.0.0.1:{port}/api/v1/models/{model}");
        rt.block_on(async {
            let client = reqwest::Client::new();
            let resp = client
                .delete(&url)
                .timeout(FORWARD_TIMEOUT)
                .send()
                .await
                .map_err(|e| format!("delete failed: {e}"))?;
            if !resp.status().is_success() {
                return Err(format!("delete failed: HTTP {}", resp.status()));
            }
            Ok(())
        })?;
    } else {
        let registry = ModelRegistry::new(cache);
        registry.delete(model).map_err(|e| e.to_string())?;
    }

    println!("{model} deleted");
    Ok(())
}

fn build_register_request(
    model: &str,
    register: &RegisterArgs,
) -> Result<Option<RegisterRequest>, String> {
    let Some(checkpoint) = &register.checkpoint else {
        if register.recipe.is_some() || register.mmproj.is_some() {
            return Err("--recipe/--mmproj require --checkpoint".into());
        }
        return Ok(None);
    };
    let recipe = register
        .recipe
        .clone()
        .ok_or_else(|| "--checkpoint requires --recipe".to_owned())?;

    let mut labels = Vec::new();
    if register.reasoning {
        labels.push("reasoning".to_owned());
    }
    if register.vision {
        labels.push("vision".to_owned());
    }
    if register.embedding {
        labels.push("embeddings".to_owned());
    }
    if register.reranking {
        labels.push("reranking".to_owned());
    }

    Ok(Some(RegisterRequest {
        name: model.to_owned(),
        checkpoint: checkpoint.clone(),
        recipe,
        labels,
        mmproj: register.mmproj.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_needs_both_checkpoint_and_recipe() {
        let none = build_register_request("m", &RegisterArgs::default()).unwrap();
        assert!(none.is_none());

        let only_recipe = RegisterArgs {
            recipe: Some("llamacpp".into()),
            ..Default::default()
        };
        assert!(build_register_request("m", &only_recipe).is_err());

        let only_checkpoint = RegisterArgs {
            checkpoint: Some("org/repo".into()),
            ..Default::default()
        };
        assert!(build_register_request("m", &only_checkpoint).is_err());

        let both = RegisterArgs {
            checkpoint: Some("org/repo".into()),
            recipe: Some("oga-cpu".into()),
            vision: true,
            ..Default::default()
        };
        let req = build_register_request("m", &both).unwrap().unwrap();
        assert_eq!(req.labels, vec!["vision"]);
    }
}
