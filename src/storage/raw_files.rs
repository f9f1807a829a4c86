//! Raw file helpers.
//!
//! Writes go to a randomly named sibling, are synced, then renamed over the
//! target so readers never observe a partial file.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use rand_core::{OsRng, RngCore};

use super::StorageError;

const MAX_FILE_LEN: u64 = 64 * 1024 * 1024;

pub fn write_atomic<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), StorageError> {
    let path = path.as_ref();
    let dir = path.parent().ok_or(StorageError::InvalidPath)?;
    let filename = path.file_name().ok_or(StorageError::InvalidPath)?;
    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(dir)?;
    }

    let mut suffix = [0u8; 6];
    OsRng.fill_bytes(&mut suffix);
    let temp_path = path.with_file_name(format!(
        ".{}.{}.tmp",
        filename.to_string_lossy(),
        hex::encode(suffix)
    ));

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result.map_err(StorageError::from)
}

/// Reads a whole file. A missing file is `Ok(None)`.
pub fn read_optional<P: AsRef<Path>>(path: P) -> Result<Option<Vec<u8>>, StorageError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() > MAX_FILE_LEN {
        return Err(StorageError::Corruption);
    }
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    Ok(Some(buffer))
}
