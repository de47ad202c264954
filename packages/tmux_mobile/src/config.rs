use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [server]
//                    port = 8787
//
//   env var:         TMUX_MOBILE_SERVER__PORT=8787   (double underscore = nesting)
//
//   CLI flags override both for the common knobs.

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub tmux: TmuxFileConfig,
}

/// Server knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_frontend_dir")]
    pub frontend_dir: PathBuf,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            frontend_dir: default_frontend_dir(),
        }
    }
}

/// Auth knobs (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    /// Shared token; generated at startup when absent.
    #[serde(default)]
    pub token: Option<String>,
    /// Optional second factor on top of the token.
    #[serde(default)]
    pub password: Option<String>,
}

/// tmux knobs (lives under `[tmux]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TmuxFileConfig {
    #[serde(default = "default_tmux_bin")]
    pub bin: String,
    #[serde(default = "default_session_name")]
    pub default_session: String,
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for TmuxFileConfig {
    fn default() -> Self {
        Self {
            bin: default_tmux_bin(),
            default_session: default_session_name(),
            scrollback_lines: default_scrollback_lines(),
            poll_interval_ms: default_poll_interval_ms(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_frontend_dir() -> PathBuf {
    PathBuf::from("frontend/dist")
}
fn default_tmux_bin() -> String {
    "tmux".to_string()
}
fn default_session_name() -> String {
    "main".to_string()
}
fn default_scrollback_lines() -> u32 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    2500
}
fn default_command_timeout_secs() -> u64 {
    5
}

/// Build a figment that layers: struct defaults → config.toml →
/// TMUX_MOBILE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TMUX_MOBILE_SERVER__PORT=9000`       →  `server.port = 9000`
///   `TMUX_MOBILE_AUTH__PASSWORD=hunter2`  →  `auth.password = "hunter2"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("TMUX_MOBILE_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig + CLI, used throughout the server)
// =============================================================================

/// Fully resolved configuration handed to the broker and HTTP surface.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
    pub password: Option<String>,
    pub default_session: String,
    pub scrollback_lines: u32,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    pub tmux_bin: String,
    pub frontend_dir: PathBuf,
}

impl RuntimeConfig {
    /// Resolve from the layered file config. Returns the config plus
    /// whether the token had to be generated (so the caller can log it).
    pub fn from_file(fc: &FileConfig) -> (Self, bool) {
        let (token, generated) = match &fc.auth.token {
            Some(token) if !token.is_empty() => (token.clone(), false),
            _ => (crate::auth::generate_token(), true),
        };

        (
            Self {
                host: fc.server.host.clone(),
                port: fc.server.port,
                token,
                password: fc.auth.password.clone().filter(|p| !p.is_empty()),
                default_session: fc.tmux.default_session.clone(),
                scrollback_lines: fc.tmux.scrollback_lines,
                poll_interval: Duration::from_millis(fc.tmux.poll_interval_ms),
                command_timeout: Duration::from_secs(fc.tmux.command_timeout_secs),
                tmux_bin: fc.tmux.bin.clone(),
                frontend_dir: fc.server.frontend_dir.clone(),
            },
            generated,
        )
    }
}

// =============================================================================
// Directory layout (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DataDir {
    pub data_dir: PathBuf,
}

impl DataDir {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".tmux-mobile"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
