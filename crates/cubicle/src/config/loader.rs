//! Configuration file loading for Cubicle
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use regex::Regex;

use crate::config::{Config, ConfigError, ENV_PREFIX};
use crate::sandbox::is_image_reference;

impl Config {
    /// Load configuration from a file, applying `CUBICLE__*` environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        for (id, lang) in &self.languages {
            if lang.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if lang.extension.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty extension"
                )));
            }
            if lang.base_image.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty base image"
                )));
            }
            if !is_image_reference(&lang.base_image) {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' base image {:?} is not an image reference",
                    lang.base_image
                )));
            }
            if lang.run.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty run command"
                )));
            }
            if let Err(e) = Regex::new(&lang.entry_pattern) {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has invalid entry pattern: {e}"
                )));
            }
            if let Some(ref pattern) = lang.package_pattern {
                let regex = Regex::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "language '{id}' has invalid package pattern: {e}"
                    ))
                })?;
                if regex.captures_len() < 2 {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' package pattern needs a capture group"
                    )));
                }
            }
        }

        let app = &self.app;
        if app.port_window == 0 {
            return Err(ConfigError::Invalid("app.port_window must be positive".into()));
        }
        for (name, base) in [
            ("backend_port_base", app.backend_port_base),
            ("frontend_port_base", app.frontend_port_base),
        ] {
            if base == 0 || u32::from(base) + u32::from(app.port_window) > u32::from(u16::MAX) + 1 {
                return Err(ConfigError::Invalid(format!(
                    "app.{name} {base} does not leave room for a window of {}",
                    app.port_window
                )));
            }
        }

        if !self.server.ws_prefix.starts_with('/') || self.server.ws_prefix.len() < 2 {
            return Err(ConfigError::Invalid(format!(
                "server.ws_prefix '{}' must be an absolute path",
                self.server.ws_prefix
            )));
        }

        if self.workspace.max_extracted_mb < self.workspace.max_archive_mb {
            return Err(ConfigError::Invalid(
                "workspace.max_extracted_mb must be at least max_archive_mb".into(),
            ));
        }

        if self.sessions.reaper_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sessions.reaper_interval_secs must be positive".into(),
            ));
        }

        if self.analyzer.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "analyzer.max_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
