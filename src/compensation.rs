//! Filesystem side effects as compensatable actions
//!
//! The filesystem has no transactions, so every mutating file operation made
//! on behalf of a database transaction is expressed as an [`FsAction`]. When a
//! component performs a side effect it registers the *exact inverse* with the
//! transaction ([`transfer`] hands that inverse back), and deletions that must
//! only happen once a row delete is durable are registered as post-commit
//! actions. The lists of registered actions are the only source of truth for
//! what gets undone or finalized.

use crate::error::Result;
use crate::types::TransferMode;
use crate::utils;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A filesystem action run by a transaction hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsAction {
    /// Remove a file or a directory tree; a missing path is not an error
    RemovePath(PathBuf),
    /// Rename `from` to `to`
    Move {
        /// Current location
        from: PathBuf,
        /// Target location
        to: PathBuf,
    },
    /// Remove a directory only if nothing was left in it
    RemoveDirIfEmpty(PathBuf),
}

impl FsAction {
    /// Perform the action
    pub fn run(&self) -> Result<()> {
        match self {
            FsAction::RemovePath(path) => {
                if path.symlink_metadata().is_ok() {
                    utils::remove_path(path)?;
                } else {
                    debug!("Nothing to remove at {:?}", path);
                }
                Ok(())
            }
            FsAction::Move { from, to } => utils::move_path(from, to),
            FsAction::RemoveDirIfEmpty(path) => utils::remove_dir_if_empty(path).map(|_| ()),
        }
    }
}

impl fmt::Display for FsAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsAction::RemovePath(path) => write!(f, "remove {}", path.display()),
            FsAction::Move { from, to } => {
                write!(f, "move {} -> {}", from.display(), to.display())
            }
            FsAction::RemoveDirIfEmpty(path) => write!(f, "rmdir {}", path.display()),
        }
    }
}

/// Transfer `src` to `dst` and return the action that undoes it
///
/// A move is undone by moving the file back; a copy is undone by removing the
/// copy, which leaves the untouched source as it was. A transfer that fails
/// partway removes what it wrote, so an error means `dst` is still vacant.
///
/// # Errors
///
/// - [`crate::VaultError::Storage`] naming the offending path if `dst` is
///   occupied or the move or copy fails
pub fn transfer(src: &Path, dst: &Path, mode: TransferMode) -> Result<FsAction> {
    match mode {
        TransferMode::Move => {
            utils::move_path(src, dst)?;
            Ok(FsAction::Move {
                from: dst.to_path_buf(),
                to: src.to_path_buf(),
            })
        }
        TransferMode::Copy => {
            utils::copy_path(src, dst)?;
            Ok(FsAction::RemovePath(dst.to_path_buf()))
        }
    }
}
