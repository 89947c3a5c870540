//! Stored file integrity checking
//!
//! Every filepath row records the CRC-32 of its content at ingestion time.
//! Verification recomputes it from disk and compares:
//!
//! - [`FilepathVerifier::verify`] checks one filepath;
//! - [`FilepathVerifier::verify_all`] checks every filepath and collects the
//!   results in a [`VerificationReport`];
//! - [`verify_checksum`] is the single-file primitive, failing with
//!   [`VaultError::Integrity`] on mismatch.
//!
//! Mismatches and missing files are reported, never raised, by the verifier.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use labvault::Vault;
//! use std::path::PathBuf;
//!
//! # fn main() -> labvault::Result<()> {
//! let vault = Vault::open(PathBuf::from("/data/labvault"))?;
//! let report = vault.verify_all()?;
//! if !report.is_valid() {
//!     println!("{}", report.summary());
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, VaultError};
use crate::ingest::FilepathIngestor;
use crate::links::LinkRegistry;
use crate::transaction::Transaction;
use crate::types::StoredFilepath;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Recomputes and compares stored checksums
#[derive(Debug, Clone)]
pub struct FilepathVerifier<'a> {
    ingestor: FilepathIngestor<'a>,
}

impl<'a> FilepathVerifier<'a> {
    /// Verifier resolving files under `base_dir`
    pub fn new(base_dir: &'a Path, links: Arc<LinkRegistry>) -> Self {
        Self {
            ingestor: FilepathIngestor::new(base_dir, links),
        }
    }

    /// Verify one filepath
    ///
    /// # Errors
    ///
    /// - [`VaultError::Lookup`] if the id does not exist
    pub fn verify(&self, tx: &mut Transaction<'_>, filepath_id: i64) -> Result<FileVerification> {
        let stored = self.ingestor.get_filepath(tx, filepath_id)?;
        Ok(check_stored(&stored))
    }

    /// Verify every stored filepath
    pub fn verify_all(&self, tx: &mut Transaction<'_>) -> Result<VerificationReport> {
        let start = Instant::now();
        let stored = self.ingestor.list_filepaths(tx)?;
        debug!("Verifying {} stored filepaths", stored.len());

        let mut report = VerificationReport::default();
        for filepath in &stored {
            let check = check_stored(filepath);
            if !check.is_valid() {
                report.errors.push(format!(
                    "Filepath {} ({:?}): {}",
                    check.filepath_id,
                    check.path,
                    check.error.as_deref().unwrap_or("checksum mismatch")
                ));
            }
            report.file_checks.push(check);
        }
        report.total_files_checked = report.file_checks.len();
        report.files_valid = report.file_checks.iter().filter(|f| f.is_valid()).count();
        report.verification_time_ms = start.elapsed().as_millis() as u64;

        info!(
            "Verified {} / {} filepaths in {}ms",
            report.files_valid, report.total_files_checked, report.verification_time_ms
        );
        Ok(report)
    }
}

/// Fail unless `path` has CRC-32 `expected`
///
/// # Errors
///
/// - [`VaultError::Integrity`] on mismatch
/// - [`VaultError::Io`] if the path cannot be read
pub fn verify_checksum(path: &Path, expected: u32) -> Result<()> {
    let actual = utils::compute_checksum(path)?;
    if actual != expected {
        return Err(VaultError::Integrity {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_stored(stored: &StoredFilepath) -> FileVerification {
    let mut verification = FileVerification {
        filepath_id: stored.id,
        path: stored.path.clone(),
        expected: stored.checksum,
        actual: None,
        exists: stored.path.exists(),
        error: None,
    };
    if !verification.exists {
        warn!("Filepath {} is missing at {:?}", stored.id, stored.path);
        verification.error = Some("file is missing".to_string());
        return verification;
    }

    match verify_checksum(&stored.path, stored.checksum) {
        Ok(()) => verification.actual = Some(stored.checksum),
        Err(VaultError::Integrity { actual, .. }) => {
            warn!(
                "Checksum mismatch for filepath {}: expected {}, got {}",
                stored.id, stored.checksum, actual
            );
            verification.actual = Some(actual);
        }
        Err(e) => verification.error = Some(e.to_string()),
    }
    verification
}

/// Result of checking one stored filepath
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVerification {
    /// Filepath id
    pub filepath_id: i64,
    /// Absolute location
    pub path: PathBuf,
    /// Checksum recorded at ingestion
    pub expected: u32,
    /// Checksum computed now, if the file could be read
    pub actual: Option<u32>,
    /// Whether the file exists
    pub exists: bool,
    /// Error reading the file
    pub error: Option<String>,
}

impl FileVerification {
    /// Whether the file exists and matches its recorded checksum
    pub fn is_valid(&self) -> bool {
        self.exists && self.error.is_none() && self.actual == Some(self.expected)
    }
}

/// Result of verifying every stored filepath
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Individual results
    pub file_checks: Vec<FileVerification>,
    /// Total files checked
    pub total_files_checked: usize,
    /// Files that matched
    pub files_valid: usize,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
    /// One line per failed check
    pub errors: Vec<String>,
}

impl VerificationReport {
    /// Whether every file matched
    pub fn is_valid(&self) -> bool {
        self.files_valid == self.total_files_checked && self.errors.is_empty()
    }

    /// Files that failed
    pub fn failures(&self) -> impl Iterator<Item = &FileVerification> {
        self.file_checks.iter().filter(|f| !f.is_valid())
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        if self.is_valid() {
            return format!(
                "All {} filepaths are valid (verified in {}ms)",
                self.total_files_checked, self.verification_time_ms
            );
        }
        let missing = self.file_checks.iter().filter(|f| !f.exists).count();
        let mismatched = self
            .file_checks
            .iter()
            .filter(|f| f.exists && f.actual.is_some_and(|a| a != f.expected))
            .count();
        let issues = [
            (missing > 0).then(|| format!("{} missing", missing)),
            (mismatched > 0).then(|| format!("{} checksum mismatches", mismatched)),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");
        format!(
            "{}/{} filepaths valid: {}",
            self.files_valid, self.total_files_checked, issues
        )
    }
}
