//! Configuration loading for nexus-collab.
//!
//! The backend base address is resolved once, in order of precedence
//! (highest wins):
//!
//! 1. **CLI flag** — `--backend-url <URL>`
//! 2. **Environment variables** — `NEXUS_BACKEND_URL`, then `BACKEND_URL`
//! 3. **TOML file** — `--config <path>`, else `NEXUS_CONFIG`, else
//!    `nexus-collab.toml` in the current directory when present
//! 4. **Compiled default** — `http://localhost:8080`
//!
//! ```toml
//! [backend]
//! url = "http://localhost:8080"
//! connect_timeout_secs = 10
//! request_timeout_secs = 30
//!
//! [logging]
//! level = "info"
//! ```
//!
//! The resulting [`BackendAddress`] is handed explicitly to the HTTP client and
//! the push-channel manager so one session never mixes two addresses.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;

/// Address used when nothing else is configured.
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";

/// Config file picked up from the working directory when no path is given.
const LOCAL_CONFIG_FILE: &str = "nexus-collab.toml";

/// CLI arguments parsed by `clap`.
#[derive(Parser, Debug)]
#[command(
    name = "nexus-collab",
    version,
    about = "Edit, save and run backend collections with a live event log"
)]
pub struct Cli {
    /// Backend base address (e.g. http://localhost:8080)
    #[arg(long)]
    pub backend_url: Option<String>,
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// tracing filter, e.g. `debug` or `nexus_collab=trace`
    #[arg(long)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the names of all collections known to the backend.
    List,
    /// Open a collection and start the interactive console on it.
    Open {
        /// Collection name.
        name: String,
    },
}

/// Raw TOML config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend base address (default `http://localhost:8080`).
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// TCP/TLS connect timeout for HTTP calls (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Whole-request timeout for HTTP calls (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Validated configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub address: BackendAddress,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub log_level: String,
}

/// Errors raised while resolving configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Read { path: PathBuf, source: std::io::Error },
    /// The config file is not valid TOML for [`Config`].
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// The backend address is not an absolute http(s) URL.
    InvalidAddress(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config file {}: {}", path.display(), source)
            }
            ConfigError::InvalidAddress(msg) => write!(f, "Invalid backend address: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load and validate configuration from CLI args, env vars, and config file.
pub fn load_config(cli: &Cli) -> Result<ResolvedConfig, ConfigError> {
    let file = match config_path(cli, |name| std::env::var(name).ok()) {
        Some(path) => load_from_file(&path)?,
        None => Config::default(),
    };
    resolve(cli, file, |name| std::env::var(name).ok())
}

/// Pick the config file to read, if any.
fn config_path(cli: &Cli, env: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(expand_tilde(path));
    }
    if let Some(path) = env("NEXUS_CONFIG").filter(|p| !p.is_empty()) {
        return Some(expand_tilde(Path::new(&path)));
    }
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    local.exists().then_some(local)
}

/// Expand a leading `~` to `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn load_from_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply CLI and environment overrides on top of the file config.
fn resolve(
    cli: &Cli,
    file: Config,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig, ConfigError> {
    let url = cli
        .backend_url
        .clone()
        .or_else(|| env("NEXUS_BACKEND_URL").filter(|v| !v.is_empty()))
        .or_else(|| env("BACKEND_URL").filter(|v| !v.is_empty()))
        .unwrap_or(file.backend.url);

    Ok(ResolvedConfig {
        address: BackendAddress::parse(&url)?,
        connect_timeout: Duration::from_secs(file.backend.connect_timeout_secs),
        request_timeout: Duration::from_secs(file.backend.request_timeout_secs),
        log_level: cli.log_level.clone().unwrap_or(file.logging.level),
    })
}

/// Validated backend base address (no trailing slash).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddress {
    base: String,
}

impl BackendAddress {
    /// Parse an absolute `http://` or `https://` base address.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = reqwest::Url::parse(raw.trim())
            .map_err(|e| ConfigError::InvalidAddress(format!("{raw}: {e}")))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ConfigError::InvalidAddress(format!(
                    "{raw}: unsupported scheme '{other}'"
                )))
            }
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(ConfigError::InvalidAddress(format!(
                "{raw}: query and fragment are not allowed"
            )));
        }
        Ok(Self {
            base: url.as_str().trim_end_matches('/').to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.base
    }

    /// Absolute URL for a backend HTTP path such as `/api/run`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Push-channel URL for a collection: `ws(s)://<base>/ws?room=<key>`.
    pub fn channel_url(&self, key: &str) -> Result<reqwest::Url, String> {
        let ws_base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(format!("Invalid URL scheme: {}", self.base));
        };
        let room = encode_component(key);
        reqwest::Url::parse(&format!("{ws_base}/ws?room={room}"))
            .map_err(|e| format!("Invalid channel URL: {e}"))
    }
}

/// Bytes a URI component keeps as-is; everything else is percent-encoded.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Percent-encode a collection key for use as a query value.
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}
