//! lemonade-server CLI surface
//! ===========================
//!
//! Global flags feed [`ServerConfig`] with CLI-over-env-over-default
//! precedence. `--max-loaded-models` takes 1, 3 or 4 positive integers
//! (`N`, `N E R`, or `N E R A`); other arities are usage errors (exit 2).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use lemonade_router::{LogLevel, MaxLoaded, RouterError, ServerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "lemonade-server",
    version,
    disable_version_flag = true,
    about = "Local LLM serving gateway"
)]
pub struct Cli {
    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Port for the HTTP gateway (realtime WebSocket binds port + 100)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Host to bind; defaults to loopback
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Context size passed to the backend
    #[arg(long = "ctx-size", global = true)]
    pub ctx_size: Option<u32>,

    /// llama.cpp build flavor
    #[arg(long = "llamacpp", global = true, value_parser = ["vulkan", "rocm", "metal", "cpu"])]
    pub llamacpp: Option<String>,

    /// Opaque extra arguments appended to the llama-server argv
    #[arg(long = "llamacpp-args", global = true)]
    pub llamacpp_args: Option<String>,

    /// Write logs to this file instead of the cache log directory
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// error | warning | info | debug | trace
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Max loaded models: N, or N E R, or N E R A
    #[arg(long = "max-loaded-models", global = true, num_args = 1.., value_name = "N")]
    pub max_loaded_models: Option<Vec<u32>>,

    /// Run headless (no system tray)
    #[arg(long = "no-tray", global = true)]
    pub no_tray: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the persistent gateway
    Serve,
    /// Start the gateway with a model loaded
    Run {
        /// Model name from the catalog
        model: String,
    },
    /// List supported and downloaded models
    List,
    /// Download a model's artifacts
    Pull {
        /// Model name from the catalog (or a new name with --checkpoint)
        model: String,
        #[command(flatten)]
        register: RegisterArgs,
    },
    /// Delete a model's artifacts (and its catalog row for user models)
    Delete {
        model: String,
    },
    /// Report whether a gateway is running
    Status,
    /// Stop a running gateway
    Stop,
}

/// `pull` can register a user model on the fly.
#[derive(Debug, Args, Default)]
pub struct RegisterArgs {
    /// Checkpoint `org/repo[:variant]` for a new user model
    #[arg(long)]
    pub checkpoint: Option<String>,

    /// Recipe for a new user model
    #[arg(long, value_parser = ["llamacpp", "flm", "oga-cpu", "oga-hybrid", "oga-npu"])]
    pub recipe: Option<String>,

    /// Multimodal projector file name
    #[arg(long)]
    pub mmproj: Option<String>,

    #[arg(long)]
    pub reasoning: bool,

    #[arg(long)]
    pub vision: bool,

    #[arg(long)]
    pub embedding: bool,

    #[arg(long)]
    pub reranking: bool,
}

impl GlobalArgs {
    /// defaults < environment < CLI flags.
    pub fn resolve_config(&self) -> Result<ServerConfig, RouterError> {
        let mut config = ServerConfig::default();
        config.apply_env()?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(ctx_size) = self.ctx_size {
            config.ctx_size = ctx_size;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.parse::<LogLevel>()?;
        }
        if let Some(flavor) = &self.llamacpp {
            config.llamacpp_backend = flavor.parse()?;
        }
        if let Some(args) = &self.llamacpp_args {
            config.llamacpp_extra_args = Some(args.clone());
        }
        if let Some(values) = &self.max_loaded_models {
            config.max_loaded = MaxLoaded::try_from_values(values)?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_globals() {
        let cli = Cli::try_parse_from([
            "lemonade-server",
            "serve",
            "--port",
            "9000",
            "--ctx-size",
            "2048",
            "--llamacpp",
            "cpu",
        ])
        .unwrap();
        assert!(matches!(cli.cmd, Command::Serve));

        let config = cli.global.resolve_config().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.ctx_size, 2048);
    }

    #[test]
    fn max_loaded_models_arity_is_validated() {
        for values in [vec!["1"], vec!["1", "2", "3"], vec!["1", "2", "3", "4"]] {
            let mut argv = vec!["lemonade-server", "serve", "--max-loaded-models"];
            argv.extend(values.iter().copied());
            let cli = Cli::try_parse_from(argv).unwrap();
            assert!(cli.global.resolve_config().is_ok(), "{values:?}");
        }

        for values in [vec!["1", "2"], vec!["1", "2", "3", "4", "5"]] {
            let mut argv = vec!["lemonade-server", "serve", "--max-loaded-models"];
            argv.extend(values.iter().copied());
            let cli = Cli::try_parse_from(argv).unwrap();
            assert!(cli.global.resolve_config().is_err(), "{values:?}");
        }
    }

    #[test]
    fn pull_accepts_registration_flags() {
        let cli = Cli::try_parse_from([
            "lemonade-server",
            "pull",
            "my-model",
            "--checkpoint",
            "org/repo-GGUF:q4_k_m",
            "--recipe",
            "llamacpp",
            "--vision",
            "--mmproj",
            "mmproj.gguf",
        ])
        .unwrap();
        match cli.cmd {
            Command::Pull { model, register } => {
                assert_eq!(model, "my-model");
                assert_eq!(register.recipe.as_deref(), Some("llamacpp"));
                assert!(register.vision);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_llamacpp_flavor() {
        assert!(Cli::try_parse_from([
            "lemonade-server",
            "serve",
            "--llamacpp",
            "cuda"
        ])
        .is_err());
    }
}
