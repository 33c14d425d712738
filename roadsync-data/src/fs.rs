//! Capability-based filesystem helpers for store files and export output.

use std::io::{self, Write};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8};

/// Create `path` and any missing ancestors.
///
/// # Errors
///
/// Returns the underlying I/O error when a directory cannot be created.
pub fn ensure_dir(path: &Utf8Path) -> io::Result<()> {
    let (base, relative) = split_base(path)?;
    if relative.as_str().is_empty() {
        return Ok(());
    }
    base.create_dir_all(&relative)
}

/// Create the directory that will hold the file at `path`.
///
/// # Errors
///
/// Returns the underlying I/O error when a directory cannot be created.
pub fn ensure_parent_dir(path: &Utf8Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

/// Open `path` as a capability directory, creating it first if needed.
///
/// # Errors
///
/// Returns the underlying I/O error when the directory cannot be opened.
pub fn open_dir(path: &Utf8Path) -> io::Result<fs_utf8::Dir> {
    ensure_dir(path)?;
    fs_utf8::Dir::open_ambient_dir(path, ambient_authority())
}

/// Write `contents` to `name` inside `dir` and sync it to disk.
///
/// The file must not exist yet.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be created,
/// written or synced.
pub fn write_new_synced(dir: &fs_utf8::Dir, name: &str, contents: &[u8]) -> io::Result<()> {
    let mut options = fs_utf8::OpenOptions::new();
    options.write(true).create_new(true);
    let mut file = dir.open_with(name, &options)?;
    file.write_all(contents)?;
    file.flush()?;
    file.sync_all()
}

/// Split a path into an ambient base directory and the part below it.
fn split_base(path: &Utf8Path) -> io::Result<(fs_utf8::Dir, Utf8PathBuf)> {
    let mut components = path.components();
    let base = match components.clone().next() {
        Some(Utf8Component::Prefix(prefix)) => {
            components.next();
            if matches!(components.clone().next(), Some(Utf8Component::RootDir)) {
                components.next();
            }
            Utf8PathBuf::from(format!("{}{}", prefix.as_str(), std::path::MAIN_SEPARATOR))
        }
        Some(Utf8Component::RootDir) => {
            components.next();
            Utf8PathBuf::from(std::path::MAIN_SEPARATOR.to_string())
        }
        _ => Utf8PathBuf::from("."),
    };
    let dir = fs_utf8::Dir::open_ambient_dir(&base, ambient_authority())?;
    Ok((dir, components.as_path().to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn utf8(temp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf-8 temp dir")
    }

    #[rstest]
    fn creates_nested_directories_for_absolute_paths() {
        let temp = TempDir::new().expect("temp dir");
        let target = utf8(&temp).join("a/b/store.db");
        ensure_parent_dir(&target).expect("create parents");
        assert!(target.parent().expect("parent").is_dir());
    }

    #[rstest]
    fn refuses_to_overwrite_existing_files() {
        let temp = TempDir::new().expect("temp dir");
        let dir = open_dir(&utf8(&temp).join("out")).expect("open dir");
        write_new_synced(&dir, "batch.jsonl", b"{}\n").expect("first write");
        let err = write_new_synced(&dir, "batch.jsonl", b"{}\n").expect_err("second write");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
