use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::types::ResourceLimits;

const INVALID_FILE_EXT_CHARS: [char; 2] = ['/', '.'];

/// How source files are arranged under the source root before building
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLayout {
    /// Files keep their archive-relative paths
    #[default]
    Flat,

    /// Files are moved to a directory derived from their package declaration
    Package,
}

/// Configuration for a batch/interactive language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    /// Human-readable name (e.g., "Java 17")
    pub name: String,

    /// File extension of source files
    pub extension: FileExtension,

    /// Container image the build recipe starts from
    pub base_image: String,

    /// Regex that identifies the file holding the program entry point
    pub entry_pattern: String,

    /// Regex with one capture group yielding the package/namespace
    #[serde(default)]
    pub package_pattern: Option<String>,

    /// Directory (relative to the image workdir) that sources are laid out under
    #[serde(default = "default_source_root")]
    pub source_root: String,

    #[serde(default)]
    pub layout: SourceLayout,

    /// Commands run before sources are copied in
    #[serde(default)]
    pub setup: Vec<String>,

    /// Build command with placeholders
    #[serde(default)]
    pub build: Option<String>,

    /// Run command with placeholders
    pub run: String,

    /// Resource limits for this language (overrides defaults)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

impl Language {
    /// Check if the language has a build step
    pub fn is_compiled(&self) -> bool {
        self.build.as_deref().is_some_and(|b| !b.trim().is_empty())
    }

    /// Expand placeholders in the given command
    ///
    /// Placeholders: {entry}, {source}, {stem}, {source_root}
    pub fn expand_command(command: &str, entry: &EntrySubstitution<'_>) -> String {
        command
            .replace("{entry}", entry.qualified_name)
            .replace("{source}", entry.source)
            .replace("{stem}", entry.stem)
            .replace("{source_root}", entry.source_root)
    }
}

/// Values substituted into build and run commands
#[derive(Debug, Clone, Copy)]
pub struct EntrySubstitution<'a> {
    /// Qualified entry-point name (e.g. `com.example.Main`)
    pub qualified_name: &'a str,
    /// Entry file path relative to the workdir after layout
    pub source: &'a str,
    /// Entry file name without extension
    pub stem: &'a str,
    pub source_root: &'a str,
}

/// File extension without dot (e.g., "java")
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileExtension(String);

impl FileExtension {
    pub fn new(extension: &str) -> Result<Self, ConfigError> {
        let contains_invalid = extension
            .chars()
            .any(|c| INVALID_FILE_EXT_CHARS.contains(&c));
        if contains_invalid {
            return Err(ConfigError::InvalidFileExtChars);
        }
        Ok(Self(extension.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `path` ends with this extension
    pub fn matches(&self, path: &str) -> bool {
        path.rsplit_once('.')
            .is_some_and(|(_, ext)| !self.0.is_empty() && ext == self.0)
    }
}

impl<'de> Deserialize<'de> for FileExtension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileExtension::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a file extension without '/' or '.' characters",
            )
        })
    }
}

impl std::fmt::Display for FileExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_source_root() -> String {
    ".".to_owned()
}
