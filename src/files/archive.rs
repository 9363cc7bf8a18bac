//! Zip packaging of a job's output tree.
//!
//! The whole file list is collected before the writer is opened, and every entry name
//! is checked so that no entry can point outside the archive root when extracted.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::FileError;

/// A regular file and the name it gets inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    pub name: String,
    pub size: u64,
}

/// Recursively list regular files under `root`, sorted by entry name.
/// Symlinks and other special files are skipped.
pub fn collect_entries(root: &Path) -> Result<Vec<ArchiveEntry>, FileError> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for item in std::fs::read_dir(&dir)? {
            let item = item?;
            let path = item.path();
            let meta = std::fs::symlink_metadata(&path)?;
            if meta.is_dir() {
                pending.push(path);
            } else if meta.is_file() {
                let name = entry_name(root, &path)?;
                entries.push(ArchiveEntry {
                    source: path,
                    name,
                    size: meta.len(),
                });
            } else {
                tracing::warn!(path = %path.display(), "skipping non-regular file");
            }
        }
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Relative, `/`-separated name of `path` under `root`.
///
/// Fails closed: anything other than plain path components is rejected.
pub fn entry_name(root: &Path, path: &Path) -> Result<String, FileError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| FileError::UnsafeEntry(path.display().to_string()))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| FileError::UnsafeEntry(relative.display().to_string()))?;
                if part.contains('\\') || part.contains(':') {
                    return Err(FileError::UnsafeEntry(relative.display().to_string()));
                }
                parts.push(part);
            }
            _ => return Err(FileError::UnsafeEntry(relative.display().to_string())),
        }
    }
    if parts.is_empty() {
        return Err(FileError::UnsafeEntry(relative.display().to_string()));
    }
    Ok(parts.join("/"))
}

/// Write `entries` into a deflated zip at `dest`.
///
/// The archive is built in a temporary file next to `dest` and renamed into place, so
/// `dest` either does not exist or holds a complete archive. Returns the archive size.
pub fn write_archive(entries: &[ArchiveEntry], dest: &Path) -> Result<u64, FileError> {
    let dir = dest
        .parent()
        .ok_or_else(|| FileError::UnsafeEntry(dest.display().to_string()))?;
    let temp = NamedTempFile::new_in(dir)?;
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut writer = ZipWriter::new(temp);
    for entry in entries {
        writer.start_file(entry.name.as_str(), options)?;
        let mut source = File::open(&entry.source)?;
        io::copy(&mut source, &mut writer)?;
    }
    let mut temp = writer.finish()?;
    temp.flush()?;
    temp.as_file().sync_all()?;

    let file = temp.persist(dest).map_err(|e| FileError::Io(e.error))?;
    Ok(file.metadata()?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn entry_names_are_relative_and_slash_separated() {
        let root = Path::new("/work/job");
        assert_eq!(
            entry_name(root, Path::new("/work/job/vocals.wav")).unwrap(),
            "vocals.wav"
        );
        assert_eq!(
            entry_name(root, Path::new("/work/job/sub/drums.wav")).unwrap(),
            "sub/drums.wav"
        );
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let root = Path::new("/work/job");
        assert!(entry_name(root, Path::new("/work/job/../escape.wav")).is_err());
        assert!(entry_name(root, Path::new("/elsewhere/x.wav")).is_err());
        assert!(entry_name(root, Path::new("/work/job")).is_err());
        assert!(entry_name(root, Path::new("/work/job/a\\..\\b.wav")).is_err());
    }

    #[test]
    fn collect_walks_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top.wav"), b"1").unwrap();
        std::fs::write(dir.path().join("a/b/deep.wav"), b"22").unwrap();

        let entries = collect_entries(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a/b/deep.wav", "top.wav"]);
        assert_eq!(entries[0].size, 2);
    }

    #[cfg(unix)]
    #[test]
    fn collect_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(dir.path().join("vocals.wav"), b"v").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link.wav")).unwrap();

        let entries = collect_entries(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "vocals.wav");
    }

    #[test]
    fn write_archive_round_trips_contents() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("vocals.wav"), b"vocal data").unwrap();
        std::fs::write(src.path().join("accompaniment.wav"), b"band").unwrap();

        let entries = collect_entries(src.path()).unwrap();
        let dest = out.path().join("job.zip");
        let size = write_archive(&entries, &dest).unwrap();
        assert_eq!(size, std::fs::metadata(&dest).unwrap().len());

        let mut zip = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(zip.len(), 2);
        let mut body = String::new();
        zip.by_name("vocals.wav")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "vocal data");

        // Only the final archive remains in the destination directory.
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 1);
    }
}
