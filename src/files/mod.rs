//! On-disk lifecycle of a job: staged input, scratch workspace, packaged archive.
//!
//! Every path a job owns is named after its id (`<uploads>/<id>.<ext>`,
//! `<output>/<id>-XXXX/`, `<output>/<id>.zip`), which is what lets [`FileManager::release`]
//! find and remove them from the id alone.

mod archive;
mod disk;

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;

pub use archive::{ArchiveEntry, collect_entries, entry_name, write_archive};
#[cfg(test)]
pub(crate) use disk::FixedSpace;
pub use disk::{SpaceProbe, SysinfoSpaceProbe, mount_point_of};

const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

#[derive(Debug, Error)]
pub enum FileError {
    #[error("{0}")]
    InvalidFilename(String),

    #[error("insufficient disk space: {available} bytes free, {required} required")]
    InsufficientStorage { available: u64, required: u64 },

    #[error("unsafe archive entry: {0}")]
    UnsafeEntry(String),

    #[error("no output files found in {}", .0.display())]
    EmptyOutput(PathBuf),

    #[error("output archive would be {size} bytes, over the {limit} byte limit")]
    ArchiveTooLarge { size: u64, limit: u64 },

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Size and naming limits applied by the [`FileManager`].
#[derive(Debug, Clone)]
pub struct FileLimits {
    pub allowed_extensions: BTreeSet<String>,
    pub max_filename_len: usize,
    pub min_free_bytes: u64,
    pub max_archive_bytes: u64,
}

impl Default for FileLimits {
    fn default() -> Self {
        Self {
            allowed_extensions: ["mp3", "wav", "ogg", "flac", "m4a"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_filename_len: 255,
            min_free_bytes: 200 * 1024 * 1024,
            max_archive_bytes: 500 * 1024 * 1024,
        }
    }
}

/// An uploaded file as received from the transport.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

/// A job-scoped scratch directory, removed with everything beneath it on drop.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory now, reporting failures instead of swallowing them.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// A fully written result archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedArchive {
    pub path: PathBuf,
    pub size: u64,
    pub entries: Vec<String>,
}

pub struct FileManager {
    upload_dir: PathBuf,
    output_dir: PathBuf,
    limits: FileLimits,
    probe: Arc<dyn SpaceProbe>,
}

impl FileManager {
    /// Create the manager, making sure both roots exist.
    pub fn new(
        upload_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        limits: FileLimits,
    ) -> io::Result<Self> {
        let upload_dir = upload_dir.into();
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&upload_dir)?;
        std::fs::create_dir_all(&output_dir)?;
        tracing::info!(
            upload_dir = %upload_dir.display(),
            output_dir = %output_dir.display(),
            "file manager ready"
        );
        Ok(Self {
            upload_dir,
            output_dir,
            limits,
            probe: Arc::new(SysinfoSpaceProbe),
        })
    }

    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn limits(&self) -> &FileLimits {
        &self.limits
    }

    /// Free bytes on the filesystem holding `dir`, if known.
    pub fn available_space(&self, dir: &Path) -> Option<u64> {
        self.probe.available_space(dir)
    }

    /// Validate an upload filename and return its lowercase extension.
    ///
    /// Rejects rather than repairs: a name with separators, `..`, reserved or control
    /// characters never reaches the filesystem.
    pub fn validate_filename(&self, filename: &str) -> Result<String, FileError> {
        let invalid = |msg: String| Err(FileError::InvalidFilename(msg));

        if filename.trim().is_empty() {
            return invalid("Filename is missing. Please provide a valid filename.".into());
        }
        if filename.chars().count() > self.limits.max_filename_len {
            return invalid(format!(
                "Filename is too long. Maximum length is {} characters.",
                self.limits.max_filename_len
            ));
        }
        if filename
            .chars()
            .any(|c| RESERVED_CHARS.contains(&c) || c.is_control())
        {
            return invalid("Filename contains invalid characters.".into());
        }
        if filename.contains('/') || filename.contains('\\') || filename.starts_with("..") {
            return invalid("Filename must not contain path components.".into());
        }

        let allowed = self
            .limits
            .allowed_extensions
            .iter()
            .map(|e| format!(".{e}"))
            .collect::<Vec<_>>()
            .join(", ");
        let ext = match Path::new(filename).extension().and_then(|e| e.to_str()) {
            Some(ext) if !ext.is_empty() => ext.to_ascii_lowercase(),
            _ => {
                return invalid(format!(
                    "File must have an extension. Allowed types: {allowed}"
                ));
            }
        };
        if !self.limits.allowed_extensions.contains(&ext) {
            return invalid(format!(
                "Invalid file type '.{ext}'. Allowed types: {allowed}"
            ));
        }
        Ok(ext)
    }

    /// Fail with `InsufficientStorage` unless `dir` keeps the configured reserve after
    /// writing `incoming` more bytes. An unreadable disk is logged and allowed.
    pub fn ensure_space(&self, dir: &Path, incoming: u64) -> Result<(), FileError> {
        let required = self.limits.min_free_bytes.saturating_add(incoming);
        match self.probe.available_space(dir) {
            Some(available) if available < required => {
                tracing::warn!(
                    dir = %dir.display(),
                    available,
                    required,
                    "refusing write, disk space below reserve"
                );
                Err(FileError::InsufficientStorage {
                    available,
                    required,
                })
            }
            Some(_) => Ok(()),
            None => {
                tracing::warn!(dir = %dir.display(), "could not determine free disk space");
                Ok(())
            }
        }
    }

    /// Write `upload` to `<uploads>/<job_id>.<ext>` atomically.
    pub fn stage(&self, job_id: &str, upload: &Upload) -> Result<PathBuf, FileError> {
        let ext = self.validate_filename(&upload.filename)?;
        self.ensure_space(&self.upload_dir, upload.bytes.len() as u64)?;

        let dest = self.upload_dir.join(format!("{job_id}.{ext}"));
        let mut temp = NamedTempFile::new_in(&self.upload_dir)?;
        temp.write_all(&upload.bytes)?;
        temp.flush()?;
        temp.persist(&dest).map_err(|e| FileError::Io(e.error))?;

        tracing::info!(
            job_id,
            path = %dest.display(),
            bytes = upload.bytes.len(),
            "upload staged"
        );
        Ok(dest)
    }

    /// Allocate a fresh output directory for `job_id`.
    pub fn workspace(&self, job_id: &str) -> Result<Workspace, FileError> {
        self.ensure_space(&self.output_dir, 0)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{job_id}-"))
            .tempdir_in(&self.output_dir)?;
        Ok(Workspace { dir })
    }

    pub fn archive_path(&self, job_id: &str) -> PathBuf {
        self.output_dir.join(format!("{job_id}.zip"))
    }

    /// Zip every regular file under `dir` into the job's archive.
    pub fn package(&self, job_id: &str, dir: &Path) -> Result<PackagedArchive, FileError> {
        let entries = collect_entries(dir)?;
        if entries.is_empty() {
            return Err(FileError::EmptyOutput(dir.to_path_buf()));
        }
        let total: u64 = entries.iter().map(|e| e.size).sum();
        if total > self.limits.max_archive_bytes {
            return Err(FileError::ArchiveTooLarge {
                size: total,
                limit: self.limits.max_archive_bytes,
            });
        }
        self.ensure_space(&self.output_dir, total)?;

        let path = self.archive_path(job_id);
        let size = write_archive(&entries, &path)?;
        tracing::info!(
            job_id,
            files = entries.len(),
            bytes = size,
            path = %path.display(),
            "archive written"
        );
        Ok(PackagedArchive {
            path,
            size,
            entries: entries.into_iter().map(|e| e.name).collect(),
        })
    }

    /// Remove a single staged input. Missing files are not an error.
    pub fn remove_input(&self, path: &Path) {
        remove_path(path);
    }

    /// Delete everything owned by `job_id`. Safe to call any number of times.
    /// Returns how many paths were removed.
    ///
    /// Only exact names count: `<id>.zip`, `<id>.<ext>` and `<id>-<suffix>`. A prefix
    /// of another job's id matches nothing.
    pub fn release(&self, job_id: &str) -> usize {
        if job_id.is_empty() {
            return 0;
        }
        let mut removed = 0;
        if remove_path(&self.archive_path(job_id)) {
            removed += 1;
        }

        for (root, sep) in [(&self.upload_dir, '.'), (&self.output_dir, '-')] {
            let items = match std::fs::read_dir(root) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(dir = %root.display(), error = %e, "cannot list directory for cleanup");
                    continue;
                }
            };
            for item in items.flatten() {
                let owned = item
                    .file_name()
                    .to_str()
                    .is_some_and(|name| owned_by(name, job_id, sep));
                if owned && remove_path(&item.path()) {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::debug!(job_id, removed, "released job files");
        }
        removed
    }
}

// `<id><sep><suffix>` where the suffix is a bare extension or tempfile tag.
fn owned_by(name: &str, job_id: &str, sep: char) -> bool {
    name.strip_prefix(job_id)
        .and_then(|rest| rest.strip_prefix(sep))
        .is_some_and(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_alphanumeric()))
}

// Remove a file or directory tree; true if something was deleted.
fn remove_path(path: &Path) -> bool {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to clean up");
            false
        }
    }
}
