//! Static pattern scanning over workspace files
//!
//! The deterministic half of plan resolution: entry points, package
//! declarations, manifests and port literals.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::Language;
use crate::workspace::WorkspaceFile;

/// Dependency manifests recognized when describing a project
pub const MANIFEST_NAMES: &[&str] = &[
    "package.json",
    "requirements.txt",
    "pyproject.toml",
    "Pipfile",
    "pom.xml",
    "build.gradle",
    "go.mod",
    "Cargo.toml",
    "composer.json",
    "Gemfile",
];

/// Files conventionally holding a backend's listen call, most likely first
const BACKEND_ENTRY_NAMES: &[&str] = &[
    "server.js",
    "index.js",
    "app.js",
    "main.js",
    "server.ts",
    "index.ts",
    "app.ts",
    "app.py",
    "main.py",
    "server.py",
    "manage.py",
];

const SCANNED_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "ts", "py"];

static PORT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // app.listen(4000) / server.listen(4000, ...)
        r"\.listen\(\s*(\d{2,5})\b",
        // process.env.PORT || 4000, process.env.PORT ?? 4000
        r"PORT\s*(?:\|\||\?\?)\s*['\x22]?(\d{2,5})\b",
        // const PORT = 4000; PORT: 4000
        r"\bPORT\s*[:=]\s*['\x22]?(\d{2,5})\b",
        // app.run(port=8000), uvicorn.run(app, port=8000)
        r"\bport\s*=\s*(\d{2,5})\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static DOTENV_PORT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:export\s+)?PORT\s*=\s*["']?(\d{2,5})["']?\s*$"#).ok()
});

/// A located program entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMatch {
    /// Language ID the match was made for
    pub language: String,
    /// Path of the file relative to the workspace root
    pub file: String,
    /// Package/namespace declared in the file, if any
    pub package: Option<String>,
    /// Package-qualified entry name (`com.example.Main`) or the file stem
    pub qualified_name: String,
}

/// Find the first file, in traversal order, containing an entry-point marker
///
/// `languages` restricts which languages are considered; ties between
/// languages are resolved by file order, never by language order.
pub fn find_entry_point(
    files: &[WorkspaceFile],
    languages: &[(&str, &Language)],
) -> Option<EntryMatch> {
    let compiled: Vec<(&str, &Language, Regex, Option<Regex>)> = languages
        .iter()
        .filter_map(|(id, lang)| {
            let marker = Regex::new(&lang.entry_pattern).ok()?;
            let package = lang
                .package_pattern
                .as_deref()
                .and_then(|p| Regex::new(p).ok());
            Some((*id, *lang, marker, package))
        })
        .collect();

    for file in files {
        let Some(text) = file.text() else {
            continue;
        };
        for (id, lang, marker, package_re) in &compiled {
            if !lang.extension.matches(&file.path) || !marker.is_match(text) {
                continue;
            }
            let package = package_re.as_ref().and_then(|re| package_of(text, re));
            let qualified_name = match package {
                Some(ref pkg) => format!("{pkg}.{}", file.stem()),
                None => file.stem().to_owned(),
            };
            return Some(EntryMatch {
                language: (*id).to_owned(),
                file: file.path.clone(),
                package,
                qualified_name,
            });
        }
    }

    None
}

/// Extract the package declared in `text` using the first capture group of `re`
pub fn package_of(text: &str, re: &Regex) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_owned())
        .filter(|p| !p.is_empty())
}

/// Files whose name is a known dependency manifest
pub fn manifests(files: &[WorkspaceFile]) -> Vec<&WorkspaceFile> {
    files
        .iter()
        .filter(|f| MANIFEST_NAMES.contains(&f.file_name()))
        .collect()
}

/// Render the workspace as an indented folder tree
pub fn render_tree(files: &[WorkspaceFile]) -> String {
    let mut out = String::new();
    let mut open: Vec<&str> = Vec::new();

    for file in files {
        let parts: Vec<&str> = file.path.split('/').collect();
        let (dirs, name) = parts.split_at(parts.len() - 1);

        let common = open
            .iter()
            .zip(dirs.iter())
            .take_while(|(a, b)| a == b)
            .count();
        open.truncate(common);
        for dir in &dirs[common..] {
            out.push_str(&"  ".repeat(open.len()));
            out.push_str(dir);
            out.push_str("/\n");
            open.push(*dir);
        }

        out.push_str(&"  ".repeat(open.len()));
        out.push_str(name[0]);
        out.push('\n');
    }

    out
}

/// First literal port a backend source file listens on
///
/// Patterns are tried in order; a capture that is out of range or privileged
/// falls through to the next pattern.
pub fn port_literal(text: &str) -> Option<u16> {
    PORT_PATTERNS.iter().find_map(|re| {
        re.captures_iter(text)
            .filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok())
            .find(|p| *p >= 1024)
    })
}

/// `PORT=` assignment in a dotenv file
pub fn dotenv_port(text: &str) -> Option<u16> {
    DOTENV_PORT
        .as_ref()?
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .filter(|p| *p > 0)
}

/// Scan a backend directory for a literal listening port
///
/// Conventional entry files (and the manifest's `main`) are checked first,
/// then every other script under `dir` in traversal order.
pub fn backend_port(files: &[WorkspaceFile], dir: &str) -> Option<u16> {
    let in_dir: Vec<&WorkspaceFile> = files.iter().filter(|f| f.is_under(dir)).collect();

    let declared_main = in_dir
        .iter()
        .find(|f| f.file_name() == "package.json" && directly_in(f, dir))
        .and_then(|f| f.text())
        .and_then(|text| serde_json::from_str::<serde_json::Value>(text).ok())
        .and_then(|json| json.get("main")?.as_str().map(str::to_owned));

    let priority = |f: &WorkspaceFile| -> usize {
        let relative = relative_to(f, dir);
        if declared_main
            .as_deref()
            .is_some_and(|m| m.trim_start_matches("./") == relative)
        {
            return 0;
        }
        BACKEND_ENTRY_NAMES
            .iter()
            .position(|n| *n == f.file_name())
            .map(|i| i + 1)
            .unwrap_or(usize::MAX)
    };

    let mut candidates: Vec<&WorkspaceFile> = in_dir
        .into_iter()
        .filter(|f| {
            f.path
                .rsplit_once('.')
                .is_some_and(|(_, ext)| SCANNED_EXTENSIONS.contains(&ext))
        })
        .collect();
    // Stable sort keeps traversal order within equal priorities.
    candidates.sort_by_key(|f| priority(f));

    candidates
        .into_iter()
        .filter_map(|f| f.text())
        .find_map(port_literal)
}

fn relative_to<'a>(file: &'a WorkspaceFile, dir: &str) -> &'a str {
    let dir = dir.trim_matches('/');
    if dir.is_empty() || dir == "." {
        return &file.path;
    }
    file.path
        .strip_prefix(dir)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(&file.path)
}

fn directly_in(file: &WorkspaceFile, dir: &str) -> bool {
    !relative_to(file, dir).contains('/')
}
