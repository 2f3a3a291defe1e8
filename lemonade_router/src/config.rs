//! Server configuration
//! ====================
//!
//! Precedence is defaults < environment < CLI flags: [`ServerConfig::default`]
//! gives the baseline, [`ServerConfig::apply_env`] folds in `LEMONADE_*`
//! variables, and the CLI layer overwrites whatever the user passed
//! explicitly.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::RouterError;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CTX_SIZE: u32 = 4096;
/// How long a backend may take to become healthy after spawn.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The directive handed to `tracing_subscriber::EnvFilter`.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Warning => "warning",
            other => other.as_filter_str(),
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(RouterError::InvalidConfig {
                field: "log_level",
                reason: format!("unknown level '{other}'"),
            }),
        }
    }
}

/// Which llama.cpp build flavor to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlamaCppFlavor {
    Vulkan,
    Rocm,
    Metal,
    Cpu,
}

impl LlamaCppFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlamaCppFlavor::Vulkan => "vulkan",
            LlamaCppFlavor::Rocm => "rocm",
            LlamaCppFlavor::Metal => "metal",
            LlamaCppFlavor::Cpu => "cpu",
        }
    }
}

impl Default for LlamaCppFlavor {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            LlamaCppFlavor::Metal
        } else {
            LlamaCppFlavor::Vulkan
        }
    }
}

impl fmt::Display for LlamaCppFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlamaCppFlavor {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vulkan" => Ok(LlamaCppFlavor::Vulkan),
            "rocm" => Ok(LlamaCppFlavor::Rocm),
            "metal" => Ok(LlamaCppFlavor::Metal),
            "cpu" => Ok(LlamaCppFlavor::Cpu),
            other => Err(RouterError::InvalidConfig {
                field: "llamacpp",
                reason: format!("unknown backend '{other}' (vulkan|rocm|metal|cpu)"),
            }),
        }
    }
}

/// How many models of each type the router may hold at once. The router
/// currently holds at most one active backend; the extra slots are parsed
/// and validated so configurations stay forward-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxLoaded {
    pub llm: u32,
    pub embeddings: u32,
    pub reranking: u32,
    pub audio: u32,
}

impl Default for MaxLoaded {
    fn default() -> Self {
        Self {
            llm: 1,
            embeddings: 1,
            reranking: 1,
            audio: 1,
        }
    }
}

impl MaxLoaded {
    /// Accepts exactly 1 (`N`), 3 (`N E R`) or 4 (`N E R A`) positive
    /// integers; anything else is a usage error.
    pub fn try_from_values(values: &[u32]) -> Result<Self, RouterError> {
        if values.iter().any(|v| *v == 0) {
            return Err(RouterError::InvalidConfig {
                field: "max_loaded_models",
                reason: "counts must be positive".into(),
            });
        }
        let defaults = Self::default();
        match values {
            [llm] => Ok(Self {
                llm: *llm,
                ..defaults
            }),
            [llm, embeddings, reranking] => Ok(Self {
                llm: *llm,
                embeddings: *embeddings,
                reranking: *reranking,
                ..defaults
            }),
            [llm, embeddings, reranking, audio] => Ok(Self {
                llm: *llm,
                embeddings: *embeddings,
                reranking: *reranking,
                audio: *audio,
            }),
            other => Err(RouterError::InvalidConfig {
                field: "max_loaded_models",
                reason: format!("expected 1, 3 or 4 values, got {}", other.len()),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub ctx_size: u32,
    pub log_level: LogLevel,
    pub llamacpp_backend: LlamaCppFlavor,
    /// Opaque extra arguments appended to the llama-server argv.
    pub llamacpp_extra_args: Option<String>,
    pub max_loaded: MaxLoaded,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_owned(),
            ctx_size: DEFAULT_CTX_SIZE,
            log_level: LogLevel::default(),
            llamacpp_backend: LlamaCppFlavor::default(),
            llamacpp_extra_args: None,
            max_loaded: MaxLoaded::default(),
        }
    }
}

impl ServerConfig {
    /// Fold `LEMONADE_*` environment variables over the current values.
    /// Malformed values are rejected rather than silently ignored.
    pub fn apply_env(&mut self) -> Result<(), RouterError> {
        if let Ok(port) = std::env::var("LEMONADE_PORT") {
            self.port = port.parse().map_err(|_| RouterError::InvalidConfig {
                field: "LEMONADE_PORT",
                reason: format!("'{port}' is not a port number"),
            })?;
        }
        if let Ok(host) = std::env::var("LEMONADE_HOST") {
            self.host = host;
        }
        if let Ok(level) = std::env::var("LEMONADE_LOG_LEVEL") {
            self.log_level = level.parse()?;
        }
        if let Ok(ctx) = std::env::var("LEMONADE_CTX_SIZE") {
            self.ctx_size = ctx.parse().map_err(|_| RouterError::InvalidConfig {
                field: "LEMONADE_CTX_SIZE",
                reason: format!("'{ctx}' is not a context size"),
            })?;
        }
        if let Ok(flavor) = std::env::var("LEMONADE_LLAMACPP") {
            self.llamacpp_backend = flavor.parse()?;
        }
        if let Ok(args) = std::env::var("LEMONADE_LLAMACPP_ARGS") {
            self.llamacpp_extra_args = Some(args);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_loaded_arity() {
        assert_eq!(
            MaxLoaded::try_from_values(&[2]).unwrap(),
            MaxLoaded {
                llm: 2,
                embeddings: 1,
                reranking: 1,
                audio: 1
            }
        );
        assert_eq!(
            MaxLoaded::try_from_values(&[2, 3, 4]).unwrap(),
            MaxLoaded {
                llm: 2,
                embeddings: 3,
                reranking: 4,
                audio: 1
            }
        );
        assert_eq!(
            MaxLoaded::try_from_values(&[2, 3, 4, 5]).unwrap(),
            MaxLoaded {
                llm: 2,
                embeddings: 3,
                reranking: 4,
                audio: 5
            }
        );

        // 2 or 5+ values are usage errors, as is any zero
        assert!(MaxLoaded::try_from_values(&[1, 2]).is_err());
        assert!(MaxLoaded::try_from_values(&[1, 2, 3, 4, 5]).is_err());
        assert!(MaxLoaded::try_from_values(&[]).is_err());
        assert!(MaxLoaded::try_from_values(&[1, 0, 1]).is_err());
    }

    #[test]
    fn log_level_parse_and_filter() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!(LogLevel::Warning.as_filter_str(), "warn");
        assert_eq!(LogLevel::Warning.to_string(), "warning");
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn llamacpp_flavor_parse() {
        for (raw, flavor) in [
            ("vulkan", LlamaCppFlavor::Vulkan),
            ("ROCm", LlamaCppFlavor::Rocm),
            ("metal", LlamaCppFlavor::Metal),
            ("cpu", LlamaCppFlavor::Cpu),
        ] {
            assert_eq!(raw.parse::<LlamaCppFlavor>().unwrap(), flavor);
        }
        assert!("cuda".parse::<LlamaCppFlavor>().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides_defaults() {
        std::env::set_var("LEMONADE_PORT", "9123");
        std::env::set_var("LEMONADE_CTX_SIZE", "2048");
        std::env::set_var("LEMONADE_LOG_LEVEL", "debug");

        let mut config = ServerConfig::default();
        config.apply_env().unwrap();
        assert_eq!(config.port, 9123);
        assert_eq!(config.ctx_size, 2048);
        assert_eq!(config.log_level, LogLevel::Debug);

        std::env::set_var("LEMONADE_PORT", "not-a-port");
        assert!(config.apply_env().is_err());

        std::env::remove_var("LEMONADE_PORT");
        std::env::remove_var("LEMONADE_CTX_SIZE");
        std::env::remove_var("LEMONADE_LOG_LEVEL");
    }
}
