use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Atomically write bytes to a host file.
///
/// The bytes go to a temp file in the same directory which is then persisted
/// over `path`, so readers see either the old or the new contents.
///
/// # Errors
/// Returns an error if the parent cannot be created or the write fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Remove a host file, treating "not found" as success.
///
/// # Errors
/// Returns any error other than `NotFound`.
pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_creates_and_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("entry.bin");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");

        atomic_write(&path, b"world").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"world");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entry.bin");

        atomic_write(&path, b"content").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_remove_file_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        remove_file_if_exists(&path).unwrap();

        fs::write(&path, "x").unwrap();
        remove_file_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
