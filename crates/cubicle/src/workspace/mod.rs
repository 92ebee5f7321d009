//! Workspace materialization
//!
//! Downloads a submission archive into a fresh temporary directory, extracts
//! it in place and enumerates the files the plan resolver works from.

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use futures_util::StreamExt;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::config::WorkspaceConfig;
use crate::types::ErrorKind;

const TEMP_PREFIX: &str = "cubicle-ws-";

/// Errors that occur while materializing a workspace
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to download archive from {url}: {message}")]
    Download { url: String, message: String },

    #[error("archive exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("extracted archive exceeds the {limit} byte limit")]
    ExtractedTooLarge { limit: u64 },

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("invalid workspace path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WorkspaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkspaceError::Download { .. } | WorkspaceError::TooLarge { .. } => {
                ErrorKind::DownloadFailed
            }
            WorkspaceError::ExtractedTooLarge { .. }
            | WorkspaceError::CorruptArchive(_)
            | WorkspaceError::InvalidPath(_) => ErrorKind::InputError,
            WorkspaceError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// A file extracted from the submission
///
/// Files above the configured size ceiling are enumerated with empty
/// `content`; their bytes stay on disk only.
#[derive(Debug, Clone)]
pub struct WorkspaceFile {
    /// Path relative to the workspace root, `/`-separated
    pub path: String,
    pub content: Vec<u8>,
    /// Size on disk in bytes
    pub size: u64,
}

impl WorkspaceFile {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            size: content.len() as u64,
            content,
        }
    }

    /// A file whose content was not loaded
    pub fn unloaded(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            content: Vec::new(),
            size,
        }
    }

    /// Whether `content` holds less than the file on disk
    pub fn is_unloaded(&self) -> bool {
        (self.content.len() as u64) < self.size
    }

    /// Content as UTF-8, if it is text
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Directory part of the path, empty for files at the root
    pub fn dir(&self) -> &str {
        self.path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    }

    /// File name without its extension
    pub fn stem(&self) -> &str {
        let name = self.file_name();
        name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
    }

    /// Whether this file lives in `dir` (or below it); `""` and `"."` match everything
    pub fn is_under(&self, dir: &str) -> bool {
        let dir = dir.trim_matches('/');
        dir.is_empty()
            || dir == "."
            || self
                .path
                .strip_prefix(dir)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// An extracted submission on disk
///
/// # Cleanup
///
/// Call [`cleanup()`](Self::cleanup) on every exit path. Dropping an
/// uncleaned workspace still removes the directory but logs a warning.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    files: Vec<WorkspaceFile>,
}

impl Workspace {
    /// Download and extract the archive at `url`
    #[instrument(skip(client, config))]
    pub async fn download(
        client: &reqwest::Client,
        url: &str,
        config: &WorkspaceConfig,
    ) -> Result<Self, WorkspaceError> {
        let dir = new_temp_dir()?;
        let archive = archive_path(dir.path());

        let fetch = fetch_archive(client, url, &archive, config.max_archive_bytes());
        match tokio::time::timeout(config.download_timeout(), fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(WorkspaceError::Download {
                    url: url.to_owned(),
                    message: format!(
                        "timed out after {}s",
                        config.download_timeout().as_secs()
                    ),
                });
            }
        }

        Self::materialize(dir, archive, config).await
    }

    /// Extract an archive from the local filesystem
    pub async fn from_archive_file(
        path: impl AsRef<Path>,
        config: &WorkspaceConfig,
    ) -> Result<Self, WorkspaceError> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        Self::from_archive_bytes(bytes, config).await
    }

    /// Extract an archive held in memory
    pub async fn from_archive_bytes(
        bytes: Vec<u8>,
        config: &WorkspaceConfig,
    ) -> Result<Self, WorkspaceError> {
        let limit = config.max_archive_bytes();
        if bytes.len() as u64 > limit {
            return Err(WorkspaceError::TooLarge { limit });
        }

        let dir = new_temp_dir()?;
        let archive = archive_path(dir.path());
        tokio::fs::write(&archive, bytes).await?;
        Self::materialize(dir, archive, config).await
    }

    async fn materialize(
        dir: TempDir,
        archive: PathBuf,
        config: &WorkspaceConfig,
    ) -> Result<Self, WorkspaceError> {
        let root = dir.path().to_path_buf();
        let excluded = config.excluded_dirs.clone();
        let max_extracted = config.max_extracted_bytes();
        let max_file = config.max_file_bytes;

        let extracted = tokio::task::spawn_blocking(move || {
            extract(&archive, &root, max_extracted)?;
            fs::remove_file(&archive)?;
            enumerate(&root, &excluded, max_file)
        })
        .await
        .map_err(|e| WorkspaceError::Io(io::Error::other(e)))?;

        // `dir` drops on the error path, removing any partial extraction.
        let files = extracted?;
        let path = dir.path().to_path_buf();
        debug!(?path, files = files.len(), "workspace materialized");

        Ok(Self {
            dir: Some(dir),
            path,
            files,
        })
    }

    /// Root directory of the extracted submission
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enumerated files in traversal order
    pub fn files(&self) -> &[WorkspaceFile] {
        &self.files
    }

    /// Look up a file by its relative path
    pub fn file(&self, path: &str) -> Option<&WorkspaceFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Resolve a relative directory inside the workspace
    ///
    /// Rejects absolute paths and parent components; `"."` and `""` resolve to the root.
    pub fn resolve_dir(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        let relative = relative.trim();
        let rel = Path::new(relative);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(WorkspaceError::InvalidPath(format!(
                "'{relative}' is not a relative path inside the workspace"
            )));
        }
        let dir = self.path.join(rel);
        if !dir.is_dir() {
            return Err(WorkspaceError::InvalidPath(format!(
                "'{relative}' is not a directory in the submission"
            )));
        }
        Ok(dir)
    }

    /// Whether the workspace directory has been removed
    pub fn is_cleaned_up(&self) -> bool {
        self.dir.is_none()
    }

    /// Remove the workspace directory
    ///
    /// Idempotent: calling this more than once is a no-op.
    #[must_use = "cleanup errors should be handled"]
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn cleanup(&mut self) -> Result<(), WorkspaceError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        dir.close()?;
        debug!("workspace removed");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.dir.is_some() {
            warn!(
                path = %self.path.display(),
                "workspace dropped without explicit cleanup"
            );
        }
    }
}

fn new_temp_dir() -> Result<TempDir, WorkspaceError> {
    Ok(tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?)
}

fn archive_path(root: &Path) -> PathBuf {
    root.join(format!(".cubicle-{}.zip", uuid::Uuid::new_v4().simple()))
}

async fn fetch_archive(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    limit: u64,
) -> Result<(), WorkspaceError> {
    let download_error = |message: String| WorkspaceError::Download {
        url: url.to_owned(),
        message,
    };

    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| download_error(e.to_string()))?;

    if let Some(len) = response.content_length()
        && len > limit
    {
        return Err(WorkspaceError::TooLarge { limit });
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| download_error(e.to_string()))?;
        total += chunk.len() as u64;
        if total > limit {
            return Err(WorkspaceError::TooLarge { limit });
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    debug!(bytes = total, "archive downloaded");
    Ok(())
}

/// Unpack `archive` into `root`, failing once more than `limit` bytes have
/// been written in total
///
/// Declared entry sizes are not trusted; the copy itself is bounded.
fn extract(archive: &Path, root: &Path, limit: u64) -> Result<(), WorkspaceError> {
    let corrupt = |e: zip::result::ZipError| WorkspaceError::CorruptArchive(e.to_string());

    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(corrupt)?;
    let mut written = 0u64;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(corrupt)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(WorkspaceError::CorruptArchive(format!(
                "entry '{}' escapes the workspace",
                entry.name()
            )));
        };
        let out = root.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }

        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let remaining = limit.saturating_sub(written);
        if entry.size() > remaining {
            return Err(WorkspaceError::ExtractedTooLarge { limit });
        }

        let mut dest = fs::File::create(&out)?;
        let name = entry.name().to_owned();
        let copied = io::copy(&mut (&mut entry).take(remaining.saturating_add(1)), &mut dest)
            .map_err(|e| WorkspaceError::CorruptArchive(format!("{name}: {e}")))?;
        written += copied;
        if written > limit {
            return Err(WorkspaceError::ExtractedTooLarge { limit });
        }
    }

    Ok(())
}

/// Walk `root` in sorted order, skipping dotfiles and dependency directories
///
/// Files larger than `max_file` are listed without their content.
fn enumerate(
    root: &Path,
    excluded: &[String],
    max_file: u64,
) -> Result<Vec<WorkspaceFile>, WorkspaceError> {
    let mut files = Vec::new();
    walk(root, root, excluded, max_file, &mut files)?;
    Ok(files)
}

fn walk(
    root: &Path,
    dir: &Path,
    excluded: &[String],
    max_file: u64,
    files: &mut Vec<WorkspaceFile>,
) -> Result<(), WorkspaceError> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            if excluded.iter().any(|e| e == name.as_ref()) {
                continue;
            }
            walk(root, &path, excluded, max_file, files)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| WorkspaceError::InvalidPath(e.to_string()))?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry.metadata()?.len();
            if size > max_file {
                debug!(file = %relative, size, "file above size ceiling, content not loaded");
                files.push(WorkspaceFile::unloaded(relative, size));
            } else {
                files.push(WorkspaceFile::new(relative, fs::read(&path)?));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{Cursor, Write};

    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use super::*;

    /// Build an in-memory zip from `(path, content)` pairs
    pub(crate) fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let raw: Vec<(&str, &[u8])> = entries.iter().map(|(n, c)| (*n, c.as_bytes())).collect();
        zip_raw(&raw)
    }

    pub(crate) fn zip_raw(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// Extract `entries` into a fresh workspace
    pub(crate) async fn workspace(entries: &[(&str, &str)]) -> Workspace {
        Workspace::from_archive_bytes(zip_bytes(entries), &WorkspaceConfig::default())
            .await
            .unwrap()
    }
}
