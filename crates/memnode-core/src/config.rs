use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the default npm registry.
pub const REGISTRY_ENV: &str = "MEMNODE_NPM_REGISTRY";

/// Name of the optional per-project config file.
pub const CONFIG_FILE: &str = "memnode.json";

/// Runtime configuration for memnode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Current working directory on the host.
    pub cwd: PathBuf,

    /// Whether to emit JSON logs.
    pub json_logs: bool,

    /// Verbosity level (0 = INFO, 1 = DEBUG, 2+ = TRACE).
    pub verbosity: u8,

    /// Channel (dev, nightly, stable) - affects cache paths.
    pub channel: Channel,

    /// Registry URL override; wins over `.npmrc` and the environment.
    pub registry: Option<String>,
}

/// Release channel for cache directory namespacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Nightly,
    Dev,
}

impl Channel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Nightly => "nightly",
            Self::Dev => "dev",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            json_logs: false,
            verbosity: 0,
            channel: Channel::default(),
            registry: None,
        }
    }
}

/// Fields a project may pin in `memnode.json`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    channel: Option<Channel>,
    registry: Option<String>,
}

impl Config {
    /// Create a new config with the given working directory.
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    #[must_use]
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Option<String>) -> Self {
        if registry.is_some() {
            self.registry = registry;
        }
        self
    }

    /// Merge `memnode.json` from `dir` if present. Values already set on
    /// `self` (from flags) win over the file.
    pub fn merge_project_file(mut self, dir: &Path) -> Result<Self, Error> {
        let path = dir.join(CONFIG_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(self),
            Err(source) => return Err(Error::ConfigRead { path, source }),
        };
        let file: FileConfig =
            serde_json::from_str(&text).map_err(|source| Error::ConfigParse { path, source })?;

        if self.registry.is_none() {
            self.registry = file.registry;
        }
        if let Some(channel) = file.channel {
            if self.channel == Channel::default() {
                self.channel = channel;
            }
        }
        Ok(self)
    }

    /// The registry override from config or `MEMNODE_NPM_REGISTRY`.
    #[must_use]
    pub fn registry_override(&self) -> Option<String> {
        self.registry
            .clone()
            .or_else(|| std::env::var(REGISTRY_ENV).ok())
            .filter(|r| !r.trim().is_empty())
    }
}
