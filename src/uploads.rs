//! Per-study upload folders
//!
//! Each uploads generation holds one folder per study (`<root>/<study_id>/`)
//! with a `trash/` folder inside for discarded uploads. Files move between
//! managed storage and these folders under the same compensation rules as
//! ingestion: every move registers the move back as a rollback action.

use crate::collector::TRASH_FOLDER;
use crate::compensation::FsAction;
use crate::error::{Result, VaultError};
use crate::links::LinkRegistry;
use crate::mountpoint::MountpointRegistry;
use crate::schema::quote_ident;
use crate::types::{Category, StoredFilepath};
use crate::transaction::Transaction;
use crate::utils;
use rusqlite::types::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Moves files in and out of study upload folders
#[derive(Debug, Clone)]
pub struct UploadManager<'a> {
    mountpoints: MountpointRegistry<'a>,
    links: Arc<LinkRegistry>,
}

impl<'a> UploadManager<'a> {
    /// Manager resolving upload folders under `base_dir`
    pub fn new(base_dir: &'a Path, links: Arc<LinkRegistry>) -> Self {
        Self {
            mountpoints: MountpointRegistry::new(base_dir),
            links,
        }
    }

    /// `(mountpoint id, file name)` of every uploaded file of a study
    ///
    /// Hidden files and directories (the trash folder included) are skipped.
    /// Every uploads generation is searched, active first.
    pub fn get_files_from_uploads_folders(
        &self,
        tx: &mut Transaction<'_>,
        study_id: i64,
    ) -> Result<Vec<(i64, String)>> {
        let mut files = Vec::new();
        for mountpoint in self.mountpoints.resolve(tx, Category::Uploads, true)? {
            let folder = mountpoint.root.join(study_id.to_string());
            if !folder.is_dir() {
                continue;
            }
            let mut names = Vec::new();
            for entry in fs::read_dir(&folder)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    debug!("Skipping non UTF-8 upload name {:?}", name);
                    continue;
                };
                if name.starts_with('.') || entry.file_type()?.is_dir() {
                    continue;
                }
                names.push(name.to_string());
            }
            names.sort();
            files.extend(names.into_iter().map(|name| (mountpoint.id, name)));
        }
        Ok(files)
    }

    /// Move uploaded files into their folder's `trash/`
    ///
    /// # Arguments
    ///
    /// * `files` - `(mountpoint id, file name)` pairs, as returned by
    ///   [`UploadManager::get_files_from_uploads_folders`]
    ///
    /// # Errors
    ///
    /// - [`VaultError::Storage`] when asked to trash the trash folder itself,
    ///   or when the study folder or the file is missing
    /// - [`VaultError::Lookup`] for a mountpoint id that is not an uploads
    ///   generation
    /// - [`VaultError::Storage`] if the trash already holds a file of the
    ///   same name; it is never overwritten
    ///
    /// Files already moved by the call are moved back on error.
    #[instrument(skip(self, tx, files), fields(count = files.len()))]
    pub fn move_upload_files_to_trash(
        &self,
        tx: &mut Transaction<'_>,
        study_id: i64,
        files: &[(i64, String)],
    ) -> Result<()> {
        tx.scope(|tx| {
            let roots: BTreeMap<i64, PathBuf> = self
                .mountpoints
                .resolve(tx, Category::Uploads, true)?
                .into_iter()
                .map(|m| (m.id, m.root))
                .collect();

            for (mountpoint_id, name) in files {
                if name == TRASH_FOLDER {
                    return Err(VaultError::storage(
                        name,
                        "the trash folder itself cannot be trashed",
                    ));
                }
                let root = roots.get(mountpoint_id).ok_or_else(|| {
                    VaultError::lookup(format!(
                        "mountpoint {} is not an uploads folder",
                        mountpoint_id
                    ))
                })?;
                let folder = root.join(study_id.to_string());
                if !folder.is_dir() {
                    return Err(VaultError::storage(
                        &folder,
                        format!("upload folder for study {} does not exist", study_id),
                    ));
                }
                let source = folder.join(name);
                if !source.exists() {
                    return Err(VaultError::storage(&source, "uploaded file does not exist"));
                }

                let trash = folder.join(TRASH_FOLDER);
                if !trash.exists() {
                    fs::create_dir_all(&trash)?;
                    tx.add_post_rollback_action(FsAction::RemoveDirIfEmpty(trash.clone()))?;
                }
                let destination = trash.join(name);
                if destination.symlink_metadata().is_ok() {
                    return Err(VaultError::storage(
                        &destination,
                        "a file with this name is already in the trash",
                    ));
                }
                utils::move_path(&source, &destination)?;
                tx.add_post_rollback_action(FsAction::Move {
                    from: destination,
                    to: source,
                })?;
            }
            info!("Moved {} uploads of study {} to trash", files.len(), study_id);
            Ok(())
        })
    }

    /// Delete filepath rows and hand their files back to the study's uploads
    ///
    /// Link rows in every owner link table are deleted along with the
    /// filepath row. `html_summary` files are not worth returning and are
    /// deleted once the transaction commits; every other file is moved into
    /// the active uploads folder of the study right away, and moved back if
    /// the transaction rolls back.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Storage`] if an upload with the same name already
    ///   exists
    /// - [`VaultError::StatementFailed`] if a row is still referenced
    ///   outside the owner link tables
    #[instrument(skip(self, tx, filepaths), fields(count = filepaths.len()))]
    pub fn move_filepaths_to_upload_folder(
        &self,
        tx: &mut Transaction<'_>,
        study_id: i64,
        filepaths: &[StoredFilepath],
    ) -> Result<()> {
        tx.scope(|tx| {
            let uploads = self.mountpoints.resolve_active(tx, Category::Uploads)?;
            let folder = uploads.root.join(study_id.to_string());
            if !folder.exists() {
                fs::create_dir_all(&folder)?;
                tx.add_post_rollback_action(FsAction::RemoveDirIfEmpty(folder.clone()))?;
            }

            let unlink: Vec<String> = self
                .links
                .owner_tables()
                .map(|(_, link)| {
                    format!(
                        "DELETE FROM {} WHERE {} = ?",
                        quote_ident(&link.table),
                        quote_ident(&link.filepath_column)
                    )
                })
                .collect();

            for filepath in filepaths {
                for sql in &unlink {
                    tx.add(sql.as_str(), vec![Value::Integer(filepath.id)])?;
                }
                tx.add(
                    "DELETE FROM filepath WHERE filepath_id = ?",
                    vec![Value::Integer(filepath.id)],
                )?;

                if filepath.filepath_type == "html_summary" {
                    tx.add_post_commit_action(FsAction::RemovePath(filepath.path.clone()))?;
                    continue;
                }
                let destination = folder.join(utils::file_name_str(&filepath.path)?);
                if destination.symlink_metadata().is_ok() {
                    return Err(VaultError::storage(
                        &destination,
                        "an upload with this name already exists",
                    ));
                }
                utils::move_path(&filepath.path, &destination)?;
                tx.add_post_rollback_action(FsAction::Move {
                    from: destination,
                    to: filepath.path.clone(),
                })?;
            }
            tx.execute()?;
            info!(
                "Returned {} filepaths to the upload folder of study {}",
                filepaths.len(),
                study_id
            );
            Ok(())
        })
    }
}
