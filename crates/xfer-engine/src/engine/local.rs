// ── Local file helpers ────────────────────────────────────────────────────────

use crate::engine::error::{TransferError, TransferResult};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom};
use std::path::Path;

fn io_err(path: &Path, action: &str, e: std::io::Error) -> TransferError {
    TransferError::local_io(format!("Failed to {} local file: {}", action, e))
        .with_path(path.display().to_string())
}

/// Length of the local file, `None` if it does not exist.
pub fn local_len(path: &Path) -> TransferResult<Option<u64>> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Err(TransferError::local_io("Local path is not a regular file")
            .with_path(path.display().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, "stat", e)),
    }
}

/// Create (or truncate) the local file, creating parent directories.
pub fn create_truncated(path: &Path) -> TransferResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, "create parent of", e))?;
        }
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| io_err(path, "create", e))
}

/// Open an existing local file for writing at `offset`. Bytes past
/// `offset` are cut so the file length always equals the resume offset.
pub fn open_write_at(path: &Path, offset: u64) -> TransferResult<File> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| io_err(path, "open", e))?;
    file.set_len(offset).map_err(|e| io_err(path, "truncate", e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| io_err(path, "seek", e))?;
    Ok(file)
}

/// Open the local file for reading at `offset`.
pub fn open_read_at(path: &Path, offset: u64) -> TransferResult<File> {
    let mut file = File::open(path).map_err(|e| io_err(path, "open", e))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| io_err(path, "seek", e))?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn missing_file_has_no_len() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(local_len(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(local_len(dir.path()).is_err());
    }

    #[test]
    fn create_truncated_makes_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.bin");
        let mut f = create_truncated(&path).unwrap();
        f.write_all(b"hello").unwrap();
        drop(f);
        assert_eq!(local_len(&path).unwrap(), Some(5));
        create_truncated(&path).unwrap();
        assert_eq!(local_len(&path).unwrap(), Some(0));
    }

    #[test]
    fn open_write_at_cuts_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        fs::write(&path, b"0123456789").unwrap();
        let mut f = open_write_at(&path, 4).unwrap();
        f.write_all(b"AB").unwrap();
        drop(f);
        assert_eq!(fs::read(&path).unwrap(), b"0123AB");
    }

    #[test]
    fn open_read_at_skips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("y.bin");
        fs::write(&path, b"0123456789").unwrap();
        let mut f = open_read_at(&path, 7).unwrap();
        let mut rest = String::new();
        f.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "789");
    }
}
