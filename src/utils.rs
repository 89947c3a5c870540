//! Utility functions for labvault
//!
//! Streaming checksums, path manipulation and the small filesystem helpers
//! the compensation layer is built from.
//!
//! ## Checksums
//!
//! Stored files are fingerprinted with CRC-32 (IEEE polynomial, the same value
//! zlib produces). The checksum is meant to detect corruption or confirm
//! identity, not to resist tampering. Content is streamed in 8 KiB chunks so
//! memory use does not depend on file size. A directory is checksummed by
//! feeding every file below it, in sorted path order, into one running CRC.

use crate::error::{Result, VaultError};
use flate2::Crc;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

const CHUNK_SIZE: usize = 8192;

/// Compute the CRC-32 checksum of a file or directory
///
/// # Arguments
///
/// * `path` - File, or directory whose files are checksummed together
///
/// # Returns
///
/// The 32-bit checksum.
///
/// # Errors
///
/// - [`VaultError::Io`] if a file cannot be read
/// - [`VaultError::WalkDir`] if a directory cannot be traversed
pub fn compute_checksum(path: &Path) -> Result<u32> {
    let mut crc = Crc::new();
    if path.is_dir() {
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() {
                feed_file(&mut crc, entry.path())?;
            }
        }
    } else {
        feed_file(&mut crc, path)?;
    }
    trace!("Checksum of {:?}: {}", path, crc.sum());
    Ok(crc.sum())
}

fn feed_file(crc: &mut Crc, path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        crc.update(&buffer[..bytes_read]);
    }
    Ok(())
}

/// CRC-32 of an in-memory buffer
pub fn checksum_bytes(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// Make a path relative to a base path
///
/// A lexical strip is tried first; canonicalization is only used when the
/// two paths differ in normalization.
///
/// # Errors
///
/// - [`VaultError::Internal`] if the path is not under the base path
/// - [`VaultError::Io`] if canonicalization fails
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            VaultError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Render a relative path as the `/`-separated text stored in the database
pub fn path_to_db_text(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        let part = component.as_os_str();
        parts.push(
            part.to_str()
                .ok_or_else(|| VaultError::PathConversion(part.to_os_string()))?
                .to_string(),
        );
    }
    Ok(parts.join("/"))
}

/// Final component of a path as UTF-8
pub fn file_name_str(path: &Path) -> Result<&str> {
    let name = path
        .file_name()
        .ok_or_else(|| VaultError::storage(path, "path has no file name"))?;
    name.to_str()
        .ok_or_else(|| VaultError::PathConversion(name.to_os_string()))
}

/// Remove a file, or a directory tree
pub fn remove_path(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    trace!("Removed {:?}", path);
    Ok(())
}

/// Remove directory if empty
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Copy a file or a whole directory tree to `dst`
///
/// `dst` must not exist. If the copy fails partway, whatever was already
/// written at `dst` is removed again.
pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    if dst.symlink_metadata().is_ok() {
        return Err(VaultError::storage(dst, "destination is already occupied"));
    }
    if let Err(e) = copy_tree(src, dst) {
        discard_partial(dst);
        return Err(e);
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let copy_file = |from: &Path, to: &Path| {
        fs::copy(from, to)
            .map(|_| ())
            .map_err(|e| VaultError::storage(from, format!("cannot copy to {:?}: {}", to, e)))
    };
    if !src.is_dir() {
        return copy_file(src, dst);
    }
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        let relative = make_relative(entry.path(), src)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| VaultError::storage(&target, format!("cannot create directory: {}", e)))?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn discard_partial(dst: &Path) {
    if dst.symlink_metadata().is_err() {
        return;
    }
    match remove_path(dst) {
        Ok(()) => debug!("Removed partial copy at {:?}", dst),
        Err(e) => warn!("Could not remove partial copy at {:?}: {}", dst, e),
    }
}

/// Move a file or directory, falling back to copy-and-remove across devices
///
/// `dst` must not exist; an occupied destination is never overwritten.
pub fn move_path(src: &Path, dst: &Path) -> Result<()> {
    if dst.symlink_metadata().is_ok() {
        return Err(VaultError::storage(dst, "destination is already occupied"));
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if crosses_devices(&e) => {
            copy_path(src, dst)?;
            remove_path(src)
        }
        Err(e) => Err(VaultError::storage(
            src,
            format!("cannot move to {:?}: {}", dst, e),
        )),
    }
}

fn crosses_devices(e: &std::io::Error) -> bool {
    // EXDEV on unix, ERROR_NOT_SAME_DEVICE on windows
    if cfg!(windows) {
        e.raw_os_error() == Some(17)
    } else {
        e.raw_os_error() == Some(18)
    }
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
