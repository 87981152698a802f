//! Helpers for files on disk.

use std::fs;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use bytes::Bytes;
use log::trace;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use crate::commons::error::IoError;


/// Creates a sub dir if needed, return full path to it.
pub fn sub_dir(base: &Path, name: &str) -> Result<PathBuf, IoError> {
    let full_path = base.join(name);
    create_dir_all(&full_path)?;
    Ok(full_path)
}

/// Creates a directory and all its parents if needed.
pub fn create_dir_all(dir: &Path) -> Result<(), IoError> {
    if !dir.is_dir() {
        fs::create_dir_all(dir).map_err(|e| {
            IoError::new(
                format!("could not create dir: {}", dir.display()), e
            )
        })?;
    }
    Ok(())
}

/// Saves a file atomically.
///
/// The content is written to a temporary file in the same directory which
/// is then renamed to the target so readers never see partial content.
pub fn save(content: &[u8], full_path: &Path) -> Result<(), IoError> {
    let parent = full_path.parent().unwrap_or_else(|| Path::new("."));
    create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| {
        IoError::new(
            format!("could not create temp file in: {}", parent.display()), e
        )
    })?;
    tmp.write_all(content).map_err(|e| {
        IoError::new(
            format!("could not write to: {}", tmp.path().display()), e
        )
    })?;
    tmp.persist(full_path).map_err(|e| {
        IoError::new(
            format!("could not save: {}", full_path.display()), e.error
        )
    })?;

    trace!("Saved file: {}", full_path.display());
    Ok(())
}

/// Saves an object as JSON.
pub fn save_json<O: Serialize>(
    object: &O, full_path: &Path
) -> Result<(), IoError> {
    let json = serde_json::to_vec_pretty(object).map_err(|e| {
        IoError::new(
            format!("could not serialize json for: {}", full_path.display()),
            io::Error::other(e),
        )
    })?;
    save(&json, full_path)
}

/// Loads a file and deserializes it as JSON.
pub fn load_json<O: DeserializeOwned>(full_path: &Path) -> Result<O, IoError> {
    let bytes = read(full_path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        IoError::new(
            format!("could not load json from: {}", full_path.display()),
            io::Error::other(format!("could not deserialize json: {e}")),
        )
    })
}

/// Reads a file to Bytes.
pub fn read(path: &Path) -> Result<Bytes, IoError> {
    let mut f = File::open(path).map_err(|e| {
        IoError::new(format!("could not open: '{}'", path.display()), e)
    })?;
    let mut bytes = Vec::new();
    f.read_to_end(&mut bytes).map_err(|e| {
        IoError::new(format!("could not read: {}", path.display()), e)
    })?;
    Ok(Bytes::from(bytes))
}

/// Appends a single line to a file, creating it if needed.
pub fn append_line(line: &str, path: &Path) -> Result<(), IoError> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new()
        .create(true).append(true).open(path)
        .map_err(|e| {
            IoError::new(format!("could not open: {}", path.display()), e)
        })?;
    writeln!(f, "{line}").map_err(|e| {
        IoError::new(format!("could not append to: {}", path.display()), e)
    })
}

/// Deletes a file, but does not touch the parent directories.
pub fn delete_file(full_path: &Path) -> Result<(), IoError> {
    trace!("Removing file: {}", full_path.display());
    fs::remove_file(full_path).map_err(|e| {
        IoError::new(
            format!("could not remove file: {}", full_path.display()), e
        )
    })
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn save_and_read_back() {
        let dir = test::tmp_dir();
        let path = dir.path().join("sub").join("file.txt");
        save(b"content", &path).unwrap();
        assert_eq!(read(&path).unwrap().as_ref(), b"content");

        save(b"replaced", &path).unwrap();
        assert_eq!(read(&path).unwrap().as_ref(), b"replaced");

        delete_file(&path).unwrap();
        assert!(read(&path).is_err());
    }

    #[test]
    fn append_lines() {
        let dir = test::tmp_dir();
        let path = dir.path().join("log.txt");
        append_line("one", &path).unwrap();
        append_line("two", &path).unwrap();
        assert_eq!(read(&path).unwrap().as_ref(), b"one\ntwo\n");
    }
}
