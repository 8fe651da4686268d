// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Flat on-disk book storage.
//!
//! Finished downloads live directly under one root directory as
//! `{sanitized-title}.{extension}`. There is no index: the directory listing
//! is the source of truth. In-flight transfers write to
//! `temp_{content_key}_{job_id}.part` in the same directory so promotion is a
//! same-filesystem rename.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;

use crate::download::{DownloadError, JobId};
use crate::security::confine;

/// Prefix of in-flight temporary files.
pub const TEMP_PREFIX: &str = "temp_";

/// Suffix of in-flight temporary files.
pub const TEMP_SUFFIX: &str = ".part";

/// Temp files untouched for this long are treated as abandoned.
///
/// Live transfers rewrite their temp file at least once per idle timeout, so
/// another process's in-flight download is never this old.
pub const ORPHAN_AGE: Duration = Duration::from_secs(15 * 60);

/// Permissions of finalized files: world-readable, owner-writable.
#[cfg(unix)]
const STORED_FILE_MODE: u32 = 0o644;

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\-_. ]").expect("filename regex"));

/// Make a title safe to use as a file stem.
///
/// Every character outside word characters, `-`, `_`, `.` and space becomes
/// `_`, then spaces become `_`.
pub fn sanitize_filename(title: &str) -> String {
    UNSAFE_CHARS.replace_all(title, "_").replace(' ', "_")
}

/// A stored file as listed by [`Storage::list`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredFile {
    pub filename: String,
    pub size: u64,
}

/// Owner of the storage root directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open (and create if needed) the storage root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create storage directory {:?}", root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Temporary path for one job's transfer.
    pub fn temp_path(&self, content_key: &str, job_id: &JobId) -> PathBuf {
        self.root
            .join(format!("{}{}_{}{}", TEMP_PREFIX, content_key, job_id, TEMP_SUFFIX))
    }

    /// Resolve a stored file name inside the root.
    ///
    /// Names that are not a single plain component, or that point outside the
    /// root, are reported as `NotFound`.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, DownloadError> {
        if is_temp_name(name) {
            return Err(DownloadError::NotFound(format!("file {}", name)));
        }
        confine(&self.root, name).ok_or_else(|| DownloadError::NotFound(format!("file {}", name)))
    }

    /// Move a finished temp file to its final name and fix its permissions.
    ///
    /// An existing file with the same name is overwritten. This is blocking
    /// I/O; the registry calls it under its write lock, so progress and cancel
    /// readers wait for the rename and chmod to finish.
    pub fn promote(&self, temp: &Path, final_name: &str) -> Result<PathBuf, DownloadError> {
        let target = confine(&self.root, final_name)
            .ok_or_else(|| DownloadError::Storage(format!("invalid file name {}", final_name)))?;
        fs::rename(temp, &target)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(STORED_FILE_MODE))?;
        }
        Ok(target)
    }

    /// Delete a stored file by name.
    pub fn delete(&self, name: &str) -> Result<(), DownloadError> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Err(DownloadError::NotFound(format!("file {}", name)));
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(DownloadError::NotFound(format!("file {}", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Path of an existing stored file, for serving.
    pub fn existing(&self, name: &str) -> Result<PathBuf, DownloadError> {
        let path = self.resolve(name)?;
        if path.is_file() {
            Ok(path)
        } else {
            Err(DownloadError::NotFound(format!("file {}", name)))
        }
    }

    /// Read a stored file's bytes.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>, DownloadError> {
        let path = self.existing(name)?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// List finished files, sorted by name. Temp files are skipped.
    pub fn list(&self) -> Result<Vec<StoredFile>, DownloadError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_temp_name(&name) {
                continue;
            }
            files.push(StoredFile {
                filename: name,
                size: meta.len(),
            });
        }
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(files)
    }

    /// Remove temp files left behind by a previous process.
    ///
    /// Only files whose last modification is at least `older_than` ago are
    /// removed; fresher ones may belong to a transfer running elsewhere on
    /// the same directory.
    pub fn sweep_orphans(&self, older_than: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read storage directory {:?}", self.root))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_temp_name(name) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            // Future mtimes (clock skew) count as fresh.
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or(Duration::ZERO);
            if age < older_than {
                tracing::debug!(file = %name, "Keeping recent temp file");
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(file = %name, "Removed orphaned temp file");
                }
                Err(e) => tracing::warn!(file = %name, "Failed to remove orphaned temp file: {}", e),
            }
        }
        Ok(removed)
    }
}

/// Best-effort removal of a temp file.
pub async fn discard_temp(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = ?path, "Failed to remove temp file: {}", e),
    }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("books")).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My Book"), "My_Book");
        assert_eq!(sanitize_filename("A/B: C?"), "A_B__C_");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("Dune-2.0_final"), "Dune-2.0_final");
        assert_eq!(sanitize_filename("Über Café"), "Über_Café");
    }

    #[test]
    fn test_temp_path_is_keyed_by_content_and_job() {
        let (_dir, storage) = storage();
        let id = JobId::from("0123");
        let path = storage.temp_path("abc123", &id);
        assert_eq!(path.file_name().unwrap(), "temp_abc123_0123.part");
        assert!(path.starts_with(storage.root()));
    }

    #[test]
    fn test_promote_renames_and_overwrites() {
        let (_dir, storage) = storage();
        let temp = storage.temp_path("abc", &JobId::from("1"));
        fs::write(&temp, b"new").unwrap();
        fs::write(storage.root().join("Book.pdf"), b"old").unwrap();

        let target = storage.promote(&temp, "Book.pdf").unwrap();
        assert!(!temp.exists());
        assert_eq!(fs::read(&target).unwrap(), b"new");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[test]
    fn test_delete_existing_and_missing() {
        let (_dir, storage) = storage();
        fs::write(storage.root().join("Book.epub"), b"x").unwrap();

        storage.delete("Book.epub").unwrap();
        assert!(!storage.root().join("Book.epub").exists());
        assert!(matches!(storage.delete("Book.epub"), Err(DownloadError::NotFound(_))));
    }

    #[test]
    fn test_delete_rejects_traversal() {
        let (dir, storage) = storage();
        let outside = dir.path().join("keep.txt");
        fs::write(&outside, b"keep").unwrap();

        assert!(matches!(storage.delete("../keep.txt"), Err(DownloadError::NotFound(_))));
        assert!(matches!(
            storage.delete("../../etc/passwd"),
            Err(DownloadError::NotFound(_))
        ));
        assert!(outside.exists());
    }

    #[test]
    fn test_list_skips_temp_files() {
        let (_dir, storage) = storage();
        fs::write(storage.root().join("b.pdf"), b"12").unwrap();
        fs::write(storage.root().join("a.epub"), b"1").unwrap();
        fs::write(storage.temp_path("abc", &JobId::from("9")), b"partial").unwrap();

        let files = storage.list().unwrap();
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["a.epub", "b.pdf"]);
        assert_eq!(files[1].size, 2);
    }

    #[test]
    fn test_temp_files_are_not_servable() {
        let (_dir, storage) = storage();
        let temp = storage.temp_path("abc", &JobId::from("9"));
        fs::write(&temp, b"partial").unwrap();
        let name = temp.file_name().unwrap().to_str().unwrap().to_string();
        assert!(storage.existing(&name).is_err());
    }

    #[tokio::test]
    async fn test_read_stored_file() {
        let (_dir, storage) = storage();
        fs::write(storage.root().join("My_Book.epub"), b"bytes").unwrap();

        assert_eq!(storage.read("My_Book.epub").await.unwrap(), b"bytes");
        assert!(matches!(
            storage.read("Missing.epub").await,
            Err(DownloadError::NotFound(_))
        ));
    }

    fn age(path: &Path, by: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_sweep_orphans_removes_stale_temp_files() {
        let (_dir, storage) = storage();
        let stale_a = storage.temp_path("abc", &JobId::from("1"));
        let stale_b = storage.temp_path("def", &JobId::from("2"));
        fs::write(&stale_a, b"x").unwrap();
        fs::write(&stale_b, b"y").unwrap();
        age(&stale_a, ORPHAN_AGE * 2);
        age(&stale_b, ORPHAN_AGE * 2);
        fs::write(storage.root().join("keep.pdf"), b"z").unwrap();
        age(&storage.root().join("keep.pdf"), ORPHAN_AGE * 2);

        assert_eq!(storage.sweep_orphans(ORPHAN_AGE).unwrap(), 2);
        assert!(!stale_a.exists());
        assert_eq!(storage.list().unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_orphans_keeps_recent_temp_files() {
        let (_dir, storage) = storage();
        let live = storage.temp_path("abc", &JobId::from("1"));
        let stale = storage.temp_path("def", &JobId::from("2"));
        fs::write(&live, b"in flight").unwrap();
        fs::write(&stale, b"abandoned").unwrap();
        age(&stale, ORPHAN_AGE + Duration::from_secs(60));

        assert_eq!(storage.sweep_orphans(ORPHAN_AGE).unwrap(), 1);
        assert!(live.exists());
        assert!(!stale.exists());
    }
}
