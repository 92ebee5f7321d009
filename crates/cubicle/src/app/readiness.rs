//! Readiness detection from process output
//!
//! Dev servers announce themselves with a banner line. Matching is
//! best-effort and bounded by the startup timeout; new frameworks are
//! supported by adding a row to [`RULES`].

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use crate::session::PortPurpose;

/// `(role, pattern)` pairs; a line matching any pattern for the role means ready
pub const RULES: &[(PortPurpose, &str)] = &[
    (PortPurpose::Backend, r"(?i)\blistening\b"),
    (PortPurpose::Backend, r"(?i)\bserver\b.*\b(running|started|ready)\b"),
    (PortPurpose::Backend, r"(?i)\brunning on\b.*:\d{2,5}"),
    (PortPurpose::Backend, r"(?i)\bon port\s*:?\s*\d{2,5}\b"),
    (PortPurpose::Backend, r"(?i)application startup complete"),
    (PortPurpose::Frontend, r"(?i)compiled successfully"),
    (PortPurpose::Frontend, r"(?i)webpack compiled"),
    (PortPurpose::Frontend, r"(?i)\blocal:\s+https?://"),
    (PortPurpose::Frontend, r"(?i)\bready in\s+\d+"),
    (PortPurpose::Frontend, r"(?i)\bready\b.*\bstarted server on\b"),
    (PortPurpose::Frontend, r"(?i)\bready on https?://"),
];

static COMPILED: LazyLock<Vec<(PortPurpose, Regex)>> = LazyLock::new(|| {
    RULES
        .iter()
        .filter_map(|(role, pattern)| Regex::new(pattern).ok().map(|re| (*role, re)))
        .collect()
});

static ANSI: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").ok());

static URL_PORT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]|[\w.\-]+):(\d{2,5})").ok()
});

/// Remove terminal color and cursor escapes
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    match ANSI.as_ref() {
        Some(re) => re.replace_all(line, ""),
        None => Cow::Borrowed(line),
    }
}

/// Whether `line` signals that a process in `role` is serving
pub fn is_ready(role: PortPurpose, line: &str) -> bool {
    let line = strip_ansi(line);
    COMPILED
        .iter()
        .any(|(r, re)| *r == role && re.is_match(&line))
}

/// Port of the first local URL printed on `line`
pub fn reported_port(line: &str) -> Option<u16> {
    let line = strip_ansi(line);
    URL_PORT
        .as_ref()?
        .captures(&line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
        .filter(|p| *p > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rule_compiles() {
        assert_eq!(COMPILED.len(), RULES.len());
    }

    #[test]
    fn backend_banners() {
        for line in [
            "Server listening on port 5000",
            "Example app listening at http://localhost:5000",
            "Server is running on port 5001",
            " * Running on http://127.0.0.1:5000",
            "INFO:     Uvicorn running on http://0.0.0.0:5000 (Press CTRL+C to quit)",
            "INFO:     Application startup complete.",
            "API started on port: 5002",
        ] {
            assert!(is_ready(PortPurpose::Backend, line), "{line}");
        }
        assert!(!is_ready(PortPurpose::Backend, "npm WARN deprecated request@2.88.2"));
        assert!(!is_ready(PortPurpose::Backend, "Compiled successfully!"));
    }

    #[test]
    fn frontend_banners() {
        for line in [
            "Compiled successfully!",
            "webpack compiled with 1 warning",
            "  \u{1b}[32m➜\u{1b}[39m  \u{1b}[1mLocal\u{1b}[22m:   \u{1b}[36mhttp://localhost:\u{1b}[1m5173\u{1b}[22m/\u{1b}[39m",
            "  VITE v5.2.0  ready in 312 ms",
            "ready - started server on 0.0.0.0:3000, url: http://localhost:3000",
        ] {
            assert!(is_ready(PortPurpose::Frontend, line), "{line}");
        }
        assert!(!is_ready(PortPurpose::Frontend, "Starting the development server..."));
    }

    #[test]
    fn ports_from_urls() {
        assert_eq!(reported_port("  Local:   http://localhost:5174/"), Some(5174));
        assert_eq!(
            reported_port("\u{1b}[36mhttp://localhost:\u{1b}[1m3001\u{1b}[22m/\u{1b}[39m"),
            Some(3001)
        );
        assert_eq!(reported_port("On Your Network:  http://192.168.1.4:3000"), Some(3000));
        assert_eq!(reported_port("no url here"), None);
    }

    #[test]
    fn strip_ansi_leaves_plain_text() {
        assert_eq!(strip_ansi("plain"), "plain");
        assert_eq!(strip_ansi("\u{1b}[1mbold\u{1b}[0m"), "bold");
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn scanning_never_panics(line in ".*") {
            let _ = is_ready(PortPurpose::Frontend, &line);
            let _ = is_ready(PortPurpose::Backend, &line);
            let _ = reported_port(&line);
        }
    }
}
