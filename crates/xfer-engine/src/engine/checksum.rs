// ── SHA-256 verification ──────────────────────────────────────────────────────

use crate::engine::error::{TransferError, TransferResult};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Hex SHA-256 of a local file.
pub fn file_sha256(path: &Path) -> TransferResult<String> {
    let mut file = File::open(path).map_err(|e| {
        TransferError::local_io(format!("Cannot open for checksum: {}", e))
            .with_path(path.display().to_string())
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of an in-memory buffer.
pub fn bytes_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
