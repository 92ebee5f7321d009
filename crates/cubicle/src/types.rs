use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Text reported in place of an empty output stream.
pub const NO_OUTPUT: &str = "No output";

/// Notice appended when captured output hits the configured ceiling.
pub const TRUNCATION_NOTICE: &str = "\n[output truncated]";

/// Resource ceilings for one isolated execution environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in megabytes
    #[serde(default)]
    pub memory_mb: Option<u64>,

    /// CPU share in cores (0.5 = half a core)
    #[serde(default)]
    pub cpus: Option<f64>,

    /// Wall clock timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<f64>,

    /// Deadline for building the image, in seconds
    #[serde(default)]
    pub build_timeout_secs: Option<f64>,

    /// Maximum number of processes/threads inside the environment
    #[serde(default)]
    pub max_processes: Option<i64>,

    /// Whether the environment may reach the network
    #[serde(default)]
    pub network: Option<bool>,

    /// Maximum captured output per stream in kilobytes
    #[serde(default)]
    pub max_output: Option<u64>,
}

impl ResourceLimits {
    /// Fallback wall clock timeout when none is configured
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Fallback image build deadline when none is configured
    pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(120);

    /// Create new resource limits with all fields set to None
    pub fn new() -> Self {
        Self {
            memory_mb: None,
            cpus: None,
            timeout_secs: None,
            build_timeout_secs: None,
            max_processes: None,
            network: None,
            max_output: None,
        }
    }

    /// Set the memory ceiling in megabytes
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    /// Set the CPU share in cores
    pub fn with_cpus(mut self, cpus: f64) -> Self {
        self.cpus = Some(cpus);
        self
    }

    /// Set the wall clock timeout in seconds
    pub fn with_timeout_secs(mut self, seconds: f64) -> Self {
        self.timeout_secs = Some(seconds);
        self
    }

    /// Set the image build deadline in seconds
    pub fn with_build_timeout_secs(mut self, seconds: f64) -> Self {
        self.build_timeout_secs = Some(seconds);
        self
    }

    /// Set the maximum number of processes
    pub fn with_max_processes(mut self, count: i64) -> Self {
        self.max_processes = Some(count);
        self
    }

    /// Allow or deny network access
    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network = Some(enabled);
        self
    }

    /// Set the maximum captured output in kilobytes
    pub fn with_max_output(mut self, kb: u64) -> Self {
        self.max_output = Some(kb);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_mb: overrides.memory_mb.or(self.memory_mb),
            cpus: overrides.cpus.or(self.cpus),
            timeout_secs: overrides.timeout_secs.or(self.timeout_secs),
            build_timeout_secs: overrides.build_timeout_secs.or(self.build_timeout_secs),
            max_processes: overrides.max_processes.or(self.max_processes),
            network: overrides.network.or(self.network),
            max_output: overrides.max_output.or(self.max_output),
        }
    }

    /// Wall clock timeout as a duration
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(Self::DEFAULT_TIMEOUT)
    }

    /// Image build deadline as a duration
    pub fn build_timeout(&self) -> Duration {
        self.build_timeout_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(Self::DEFAULT_BUILD_TIMEOUT)
    }

    /// Memory ceiling in bytes, as the container engine expects it
    pub fn memory_bytes(&self) -> Option<i64> {
        self.memory_mb
            .and_then(|mb| i64::try_from(mb.saturating_mul(1024 * 1024)).ok())
    }

    /// CPU share in units of 1e-9 cores
    pub fn nano_cpus(&self) -> Option<i64> {
        self.cpus
            .filter(|c| c.is_finite() && *c > 0.0)
            .map(|c| (c * 1_000_000_000.0) as i64)
    }

    /// Output ceiling per stream in bytes
    pub fn max_output_bytes(&self) -> usize {
        self.max_output
            .map(|kb| kb.saturating_mul(1024) as usize)
            .unwrap_or(usize::MAX)
    }

    pub fn network_enabled(&self) -> bool {
        self.network.unwrap_or(false)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: Some(256),
            cpus: Some(0.5),
            timeout_secs: Some(10.0),
            build_timeout_secs: Some(120.0),
            max_processes: Some(64),
            network: Some(false),
            max_output: Some(64),
        }
    }
}

/// Reference to a submission supplied by the surrounding application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRef {
    /// Where the zipped code bundle can be downloaded from
    #[serde(default)]
    pub archive_url: String,

    /// Language or category hint (e.g. "java", "python")
    #[serde(default)]
    pub category_hint: Option<String>,

    /// Correlation id, only used for logging
    #[serde(default)]
    pub submission_id: Option<String>,
}

impl SubmissionRef {
    pub fn new(archive_url: impl Into<String>) -> Self {
        Self {
            archive_url: archive_url.into(),
            ..Default::default()
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.category_hint = Some(hint.into());
        self
    }

    /// Reject references that cannot possibly be materialized
    pub fn validate(&self) -> Result<(), String> {
        let url = self.archive_url.trim();
        if url.is_empty() {
            return Err("archiveUrl is required".to_owned());
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("archiveUrl must be an http(s) URL, got '{url}'"));
        }
        Ok(())
    }

    /// Category hint with surrounding whitespace removed, if non-empty
    pub fn hint(&self) -> Option<&str> {
        self.category_hint
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }
}

/// How a batch program terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitClassification {
    /// Exited with code 0
    Success,

    /// Exited normally with a non-zero code
    NonZeroExit { code: i64 },
}

impl ExitClassification {
    pub fn from_exit_code(code: i64) -> Self {
        if code == 0 {
            Self::Success
        } else {
            Self::NonZeroExit { code }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of a batch run that reached completion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutput {
    pub stdout: String,
    pub stderr: String,
    pub language: String,
    /// Wall clock time of the run step in milliseconds
    pub execution_time: u64,
    pub exit_classification: ExitClassification,
}

/// Error kinds surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InputError,
    DownloadFailed,
    ResolutionError,
    NoEntryPointFound,
    BuildError,
    RuntimeTimeout,
    StartupTimeout,
    RuntimeError,
    ResourceError,
    Internal,
}

impl ErrorKind {
    /// Whether the submitted code is at fault, as opposed to the platform
    pub fn is_user_fault(&self) -> bool {
        matches!(
            self,
            ErrorKind::BuildError | ErrorKind::RuntimeError | ErrorKind::NoEntryPointFound
        )
    }
}

/// Structured error handed back to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raw_output: None,
        }
    }

    pub fn with_raw_output(mut self, output: impl Into<String>) -> Self {
        self.raw_output = Some(output.into());
        self
    }
}

/// Outcome of an explicit stop request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOutcome {
    pub success: bool,
    pub message: String,
}

impl StopOutcome {
    pub fn stopped(id: &str) -> Self {
        Self {
            success: true,
            message: format!("session {id} stopped"),
        }
    }

    pub fn not_found(id: &str) -> Self {
        Self {
            success: false,
            message: format!("session {id} not found"),
        }
    }
}

/// Decode captured bytes, trimming whitespace and substituting [`NO_OUTPUT`]
pub fn render_stream(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        NO_OUTPUT.to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_overrides_prefers_override_values() {
        let base = ResourceLimits::default();
        let overrides = ResourceLimits::new().with_memory_mb(1024).with_network(true);
        let merged = base.with_overrides(&overrides);
        assert_eq!(merged.memory_mb, Some(1024));
        assert_eq!(merged.network, Some(true));
        assert_eq!(merged.cpus, base.cpus);
        assert_eq!(merged.timeout_secs, base.timeout_secs);
    }

    #[test]
    fn timeout_defaults_to_ten_seconds() {
        assert_eq!(ResourceLimits::new().timeout(), Duration::from_secs(10));
        assert_eq!(ResourceLimits::default().timeout(), Duration::from_secs(10));
    }

    #[test]
    fn timeout_ignores_nonsense_values() {
        let limits = ResourceLimits::new().with_timeout_secs(-3.0);
        assert_eq!(limits.timeout(), ResourceLimits::DEFAULT_TIMEOUT);
        let limits = ResourceLimits::new().with_timeout_secs(f64::NAN);
        assert_eq!(limits.timeout(), ResourceLimits::DEFAULT_TIMEOUT);
    }

    #[test]
    fn build_timeout_is_separate_from_run_timeout() {
        let limits = ResourceLimits::new().with_timeout_secs(2.0);
        assert_eq!(limits.build_timeout(), ResourceLimits::DEFAULT_BUILD_TIMEOUT);
        let merged = limits.with_overrides(&ResourceLimits::new().with_build_timeout_secs(30.0));
        assert_eq!(merged.build_timeout(), Duration::from_secs(30));
        assert_eq!(merged.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn memory_and_cpu_conversions() {
        let limits = ResourceLimits::new().with_memory_mb(256).with_cpus(0.5);
        assert_eq!(limits.memory_bytes(), Some(256 * 1024 * 1024));
        assert_eq!(limits.nano_cpus(), Some(500_000_000));
    }

    #[test]
    fn network_disabled_unless_declared() {
        assert!(!ResourceLimits::new().network_enabled());
        assert!(!ResourceLimits::default().network_enabled());
        assert!(ResourceLimits::new().with_network(true).network_enabled());
    }

    #[test]
    fn max_output_unbounded_when_unset() {
        assert_eq!(ResourceLimits::new().max_output_bytes(), usize::MAX);
        assert_eq!(
            ResourceLimits::new().with_max_output(2).max_output_bytes(),
            2048
        );
    }

    #[test]
    fn render_stream_empty_is_no_output() {
        assert_eq!(render_stream(b""), NO_OUTPUT);
        assert_eq!(render_stream(b"  \n\t "), NO_OUTPUT);
    }

    #[test]
    fn render_stream_trims() {
        assert_eq!(render_stream(b"  hello\n"), "hello");
    }

    #[test]
    fn exit_classification_from_code() {
        assert!(ExitClassification::from_exit_code(0).is_success());
        assert_eq!(
            ExitClassification::from_exit_code(3),
            ExitClassification::NonZeroExit { code: 3 }
        );
    }

    #[test]
    fn submission_validate_rejects_blank_url() {
        assert!(SubmissionRef::new("").validate().is_err());
        assert!(SubmissionRef::new("   ").validate().is_err());
        assert!(SubmissionRef::new("ftp://host/a.zip").validate().is_err());
        assert!(SubmissionRef::new("https://host/a.zip").validate().is_ok());
    }

    #[test]
    fn submission_deserializes_camel_case() {
        let json = r#"{"archiveUrl":"https://x/a.zip","categoryHint":"java","submissionId":"s1"}"#;
        let sub: SubmissionRef = serde_json::from_str(json).unwrap();
        assert_eq!(sub.archive_url, "https://x/a.zip");
        assert_eq!(sub.hint(), Some("java"));
        assert_eq!(sub.submission_id.as_deref(), Some("s1"));
    }

    #[test]
    fn blank_hint_is_ignored() {
        let sub = SubmissionRef::new("https://x/a.zip").with_hint("  ");
        assert_eq!(sub.hint(), None);
    }

    #[test]
    fn user_fault_kinds() {
        assert!(ErrorKind::BuildError.is_user_fault());
        assert!(ErrorKind::RuntimeError.is_user_fault());
        assert!(!ErrorKind::RuntimeTimeout.is_user_fault());
        assert!(!ErrorKind::ResourceError.is_user_fault());
        assert!(!ErrorKind::DownloadFailed.is_user_fault());
    }

    #[test]
    fn error_report_omits_missing_raw_output() {
        let report = ErrorReport::new(ErrorKind::RuntimeTimeout, "timed out");
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("rawOutput"));
        let report = report.with_raw_output("log");
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"rawOutput\":\"log\""));
    }
}
