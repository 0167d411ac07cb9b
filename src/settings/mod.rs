//! Gateway configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables (`SERVER_PORT`, `MODEL`, `MAX_TURNS`, `CWD`,
//! `PERMISSION_MODE`, `DB_PATH`, `IDLE_GRACE_MS`, `WS_IDLE_TIMEOUT_S`).

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::engine::{PermissionMode, StreamOptions};

/// Effective gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Port the HTTP/WebSocket server listens on.
    pub server_port: u16,
    /// Model name forwarded to the engine.
    pub model: String,
    /// Maximum agent turns per prompt.
    pub max_turns: u32,
    /// Working directory for engine turns.
    pub cwd: PathBuf,
    /// Permission mode for engine tool execution.
    pub permission_mode: PermissionMode,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Grace period before an idle, unsubscribed session is reclaimed.
    pub idle_grace_ms: u64,
    /// WebSocket idle timeout in seconds.
    pub ws_idle_timeout_s: u64,
    /// Engine executable name or path.
    pub engine_binary: String,
    /// Restrict engine turns to these tools, if set.
    pub allowed_tools: Option<Vec<String>>,
    /// Text appended to the engine's system prompt.
    pub system_prompt_suffix: Option<String>,
    /// Capacity of the per-session prompt queue.
    pub queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server_port: 8080,
            model: "sonnet".to_string(),
            max_turns: 100,
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            permission_mode: PermissionMode::Default,
            db_path: PathBuf::from("./data/ccsdk.db"),
            idle_grace_ms: 60_000,
            ws_idle_timeout_s: 120,
            engine_binary: "claude".to_string(),
            allowed_tools: None,
            system_prompt_suffix: None,
            queue_capacity: 8,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            Environment::default()
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("allowed_tools"),
        );

        let config = builder.build().context("building configuration")?;

        // Missing keys fall through to the serde defaults.
        config
            .try_deserialize()
            .context("deserializing configuration")
    }

    /// Default stream options for an engine turn under this config.
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            model: self.model.clone(),
            max_turns: self.max_turns,
            cwd: self.cwd.clone(),
            allowed_tools: self.allowed_tools.clone(),
            system_prompt_suffix: self.system_prompt_suffix.clone(),
            permission_mode: self.permission_mode,
            ..StreamOptions::default()
        }
    }
}
