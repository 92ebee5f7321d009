use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::config::language::{EntrySubstitution, FileExtension, Language, SourceLayout};
use crate::types::ResourceLimits;

pub mod language;
mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../cubicle.example.toml");

/// Prefix for environment variable overrides (`CUBICLE__SERVER__BIND=...`)
pub const ENV_PREFIX: &str = "CUBICLE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid characters in file extension")]
    InvalidFileExtChars,

    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Workspace materialization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Largest archive accepted, in megabytes
    pub max_archive_mb: u64,

    /// Total bytes an archive may expand to, in megabytes
    pub max_extracted_mb: u64,

    /// Files above this size are enumerated without their content
    pub max_file_bytes: u64,

    /// Download deadline in seconds
    pub download_timeout_secs: u64,

    /// Directory names skipped during file enumeration
    pub excluded_dirs: Vec<String>,
}

impl WorkspaceConfig {
    pub fn max_archive_bytes(&self) -> u64 {
        self.max_archive_mb.saturating_mul(1024 * 1024)
    }

    pub fn max_extracted_bytes(&self) -> u64 {
        self.max_extracted_mb.saturating_mul(1024 * 1024)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            max_archive_mb: 50,
            max_extracted_mb: 200,
            max_file_bytes: 1024 * 1024,
            download_timeout_secs: 60,
            excluded_dirs: [
                "node_modules",
                "target",
                "build",
                "dist",
                "venv",
                "__pycache__",
                "__MACOSX",
                "vendor",
                "bin",
                "obj",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        }
    }
}

/// External code-understanding service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// OpenAI-compatible chat completions endpoint; static scanning only when unset
    pub endpoint: Option<String>,

    pub model: String,

    /// Environment variable holding the bearer token
    pub api_key_env: String,

    /// Attempts for project analysis before giving up
    pub max_attempts: u32,

    /// Linear backoff step between attempts, in milliseconds
    pub backoff_ms: u64,

    pub request_timeout_secs: u64,

    /// Upper bound on file content sent per file, in bytes
    pub max_file_bytes: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "gpt-4o-mini".to_owned(),
            api_key_env: "CUBICLE_ANALYZER_KEY".to_owned(),
            max_attempts: 3,
            backoff_ms: 1000,
            request_timeout_secs: 60,
            max_file_bytes: 16 * 1024,
        }
    }
}

/// Session lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time before a session is reaped, in seconds
    pub idle_timeout_secs: u64,

    /// Absolute session lifetime, in seconds
    pub max_lifetime_secs: u64,

    /// Interval between reaper sweeps, in seconds
    pub reaper_interval_secs: u64,
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            max_lifetime_secs: 30 * 60,
            reaper_interval_secs: 5 * 60,
        }
    }
}

/// Process-based app preview settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Binaries that must be on PATH before anything is installed
    pub toolchain: Vec<String>,

    pub install_timeout_secs: u64,
    pub backend_start_timeout_secs: u64,
    pub frontend_start_timeout_secs: u64,

    pub backend_port_base: u16,
    pub frontend_port_base: u16,

    /// Number of ports searched above each base
    pub port_window: u16,

    /// Host used when composing preview URLs
    pub public_host: String,

    /// Variables that receive the backend URL in the frontend environment
    pub backend_url_vars: Vec<String>,

    /// Time between SIGTERM and SIGKILL on stop, in seconds
    pub stop_grace_secs: u64,

    /// Lines kept per output stream
    pub log_max_lines: usize,
}

impl AppConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn backend_start_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_start_timeout_secs)
    }

    pub fn frontend_start_timeout(&self) -> Duration {
        Duration::from_secs(self.frontend_start_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            toolchain: vec!["node".to_owned(), "npm".to_owned()],
            install_timeout_secs: 5 * 60,
            backend_start_timeout_secs: 2 * 60,
            frontend_start_timeout_secs: 3 * 60,
            backend_port_base: 5000,
            frontend_port_base: 3000,
            port_window: 100,
            public_host: "localhost".to_owned(),
            backend_url_vars: vec![
                "REACT_APP_API_URL".to_owned(),
                "VITE_API_URL".to_owned(),
                "NEXT_PUBLIC_API_URL".to_owned(),
            ],
            stop_grace_secs: 5,
            log_max_lines: 500,
        }
    }
}

/// HTTP surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,

    /// Path prefix reserved for interactive websocket upgrades
    pub ws_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_owned(),
            ws_prefix: "/ws/interactive".to_owned(),
        }
    }
}

/// Config for Cubicle
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Default resource limits applied to all sandboxed runs.
    #[serde(default)]
    pub default_limits: ResourceLimits,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Language configurations keyed by language ID
    #[serde(default)]
    pub languages: HashMap<String, Language>,
}

impl Config {
    /// Create a new config with embedded default languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            default_limits: ResourceLimits::default(),
            workspace: WorkspaceConfig::default(),
            analyzer: AnalyzerConfig::default(),
            sessions: SessionConfig::default(),
            app: AppConfig::default(),
            server: ServerConfig::default(),
            languages: HashMap::new(),
        }
    }

    /// Get a language by ID
    pub fn get_language(&self, id: &str) -> Result<&Language, ConfigError> {
        self.languages
            .get(id)
            .ok_or_else(|| ConfigError::LanguageNotFound(id.to_string()))
    }

    /// Find a language by ID, by display name or by file extension
    ///
    /// Used to interpret loose category hints such as "Java" or "py".
    pub fn find_language(&self, hint: &str) -> Option<(&str, &Language)> {
        let hint = hint.trim().to_ascii_lowercase();
        if let Some((id, lang)) = self.languages.get_key_value(hint.as_str()) {
            return Some((id.as_str(), lang));
        }
        self.sorted_languages()
            .into_iter()
            .find(|(_, lang)| {
                lang.name.to_ascii_lowercase() == hint || lang.extension.as_str() == hint
            })
    }

    /// Languages sorted by ID, for deterministic iteration
    pub fn sorted_languages(&self) -> Vec<(&str, &Language)> {
        let mut languages: Vec<_> = self
            .languages
            .iter()
            .map(|(id, lang)| (id.as_str(), lang))
            .collect();
        languages.sort_by_key(|(id, _)| *id);
        languages
    }

    /// Merge resource limits with defaults
    pub fn effective_limits(&self, overrides: Option<&ResourceLimits>) -> ResourceLimits {
        match overrides {
            Some(limits) => self.default_limits.with_overrides(limits),
            None => self.default_limits.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}
