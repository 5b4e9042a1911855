//! Filesystem conveniences for build-file authors. Thin wrappers around
//! the standard library; none of them write to the task output.

use std::fs::{self, File};
use std::io;
use std::time::SystemTime;

use camino::Utf8Path;

/// Create `path` if it does not exist; bump its mtime to now if it does.
pub fn touch(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    let path = path.as_ref();
    match File::options().append(true).create(true).open(path) {
        Ok(file) => file.set_modified(SystemTime::now()),
        Err(err) => Err(err),
    }
}

/// Create a directory and all of its missing parents. Succeeds if the
/// directory already exists.
pub fn create_dir(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    fs::create_dir_all(path.as_ref())
}

/// Copy a file, creating the destination's parent directories as needed.
pub fn copy(from: impl AsRef<Utf8Path>, to: impl AsRef<Utf8Path>) -> io::Result<u64> {
    let to = to.as_ref();
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from.as_ref(), to)
}

/// Remove every file matching a glob expression. Missing matches are not
/// an error; directories are skipped.
pub fn remove_glob(expression: &str) -> io::Result<()> {
    let paths = glob::glob(expression)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    for entry in paths {
        let path = entry.map_err(|e| io::Error::other(e.to_string()))?;
        if path.is_file() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
