//! Orphan collection
//!
//! A filepath row with no reference from any column discovered by the
//! [`LinkRegistry`] is orphaned. [`OrphanCollector::purge_filepaths`]:
//!
//! 1. takes every referencing `(table, column)` pair from the registry
//!    (refusing a registry older than the store schema);
//! 2. builds the referenced-id set as one `UNION` of their non-null values;
//! 3. selects the filepath rows whose id is absent from that set;
//! 4. queues a delete per orphan and registers a **post-commit** removal of
//!    its physical file or directory.
//!
//! A physical file is therefore removed if and only if the delete of its row
//! committed. A removal that fails after commit is reported, and the rest of
//! the purge goes ahead.
//!
//! The store transaction is opened with `BEGIN IMMEDIATE` on the vault's
//! single connection, so no link row can be inserted between the
//! referenced-id snapshot and the commit of the deletes.

use crate::compensation::FsAction;
use crate::error::Result;
use crate::links::LinkRegistry;
use crate::mountpoint::MountpointRegistry;
use crate::schema::quote_ident;
use crate::transaction::{as_i64, as_text, column, Transaction};
use crate::types::{Category, OrphanedFilepath, PurgeReport, TrashReport};
use rusqlite::types::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Name of the per-study folder holding discarded uploads
pub const TRASH_FOLDER: &str = "trash";

/// Deletes unreferenced filepath rows and their files
#[derive(Debug, Clone)]
pub struct OrphanCollector<'a> {
    mountpoints: MountpointRegistry<'a>,
    links: Arc<LinkRegistry>,
}

impl<'a> OrphanCollector<'a> {
    /// Collector resolving files under `base_dir`
    pub fn new(base_dir: &'a Path, links: Arc<LinkRegistry>) -> Self {
        Self {
            mountpoints: MountpointRegistry::new(base_dir),
            links,
        }
    }

    /// Remove every orphaned filepath row and, after commit, its file
    ///
    /// With `delete_files` unset this is a dry run: orphans are reported and
    /// nothing is mutated.
    ///
    /// Called inside an open scope, the report describes queued work:
    /// `rows_deleted` counts deletes that commit or roll back with the
    /// enclosing scope, and `hook_failures` stays empty because file removal
    /// only runs at the outermost commit.
    ///
    /// # Errors
    ///
    /// - [`crate::VaultError::Schema`] if the link registry is stale
    /// - [`crate::VaultError::StatementFailed`] if a delete fails; nothing
    ///   is deleted in that case
    #[instrument(skip(self, tx))]
    pub fn purge_filepaths(&self, tx: &mut Transaction<'_>, delete_files: bool) -> Result<PurgeReport> {
        let start = Instant::now();
        let mut report = tx.scope(|tx| {
            self.links.ensure_current(tx)?;

            let references = self.links.reference_columns();
            let sql = if references.is_empty() {
                warn!("No column references filepath; every filepath row is orphaned");
                "SELECT filepath_id, filepath, data_directory_id FROM filepath ORDER BY filepath_id"
                    .to_string()
            } else {
                let referenced = references
                    .iter()
                    .map(|r| {
                        let column = quote_ident(&r.column);
                        format!(
                            "SELECT {} FROM {} WHERE {} IS NOT NULL",
                            column,
                            quote_ident(&r.table),
                            column
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" UNION ");
                format!(
                    "SELECT filepath_id, filepath, data_directory_id FROM filepath \
                     WHERE filepath_id NOT IN ({}) ORDER BY filepath_id",
                    referenced
                )
            };

            tx.add("SELECT COUNT(*) FROM filepath", vec![])?;
            let rows_examined = match tx.execute_fetchlast()? {
                Some(count) => as_i64(&count)? as usize,
                None => 0,
            };

            tx.add(sql, vec![])?;
            let rows = tx.execute_fetchindex()?;

            let mut roots: HashMap<i64, PathBuf> = HashMap::new();
            let mut report = PurgeReport {
                rows_examined,
                dry_run: !delete_files,
                ..Default::default()
            };
            for row in &rows {
                let id = as_i64(column(row, 0)?)?;
                let relative = as_text(column(row, 1)?)?;
                let mountpoint_id = as_i64(column(row, 2)?)?;
                let root = match roots.get(&mountpoint_id) {
                    Some(root) => root.clone(),
                    None => {
                        let root = self.mountpoints.resolve_by_id(tx, mountpoint_id)?;
                        roots.insert(mountpoint_id, root.clone());
                        root
                    }
                };
                let path = root.join(&relative);
                let exists = path.symlink_metadata().is_ok();
                if !exists {
                    report.files_missing += 1;
                }

                if delete_files {
                    tx.add(
                        "DELETE FROM filepath WHERE filepath_id = ?",
                        vec![Value::Integer(id)],
                    )?;
                    if exists {
                        tx.add_post_commit_action(FsAction::RemovePath(path.clone()))?;
                        report.files_scheduled += 1;
                    } else {
                        warn!("Orphaned filepath {} has no file at {:?}", id, path);
                    }
                } else {
                    info!("Orphaned filepath {} at {:?} (dry run)", id, path);
                }
                report.orphans.push(OrphanedFilepath { id, path, exists });
            }

            if delete_files && !report.orphans.is_empty() {
                tx.execute()?;
                report.rows_deleted = report.orphans.len();
            }
            Ok(report)
        })?;

        report.hook_failures = tx.take_hook_failures();
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Purge examined {} filepaths, {} orphaned, {} deleted, {} file removals failed",
            report.rows_examined,
            report.orphans.len(),
            report.rows_deleted,
            report.hook_failures.len()
        );
        Ok(report)
    }

    /// Delete every file in the trash folder of every uploads generation
    ///
    /// Files directly inside a `trash` directory are removed after commit;
    /// with `delete_files` unset they are only reported.
    #[instrument(skip(self, tx))]
    pub fn empty_trash_upload_folder(
        &self,
        tx: &mut Transaction<'_>,
        delete_files: bool,
    ) -> Result<TrashReport> {
        let mut report = tx.scope(|tx| {
            let mut report = TrashReport {
                dry_run: !delete_files,
                ..Default::default()
            };
            for mountpoint in self.mountpoints.resolve(tx, Category::Uploads, true)? {
                if !mountpoint.root.is_dir() {
                    debug!("Uploads root {:?} is missing, skipping", mountpoint.root);
                    continue;
                }
                for entry in WalkDir::new(&mountpoint.root).sort_by_file_name() {
                    let entry = entry?;
                    let in_trash = entry
                        .path()
                        .parent()
                        .and_then(|p| p.file_name())
                        .is_some_and(|name| name == TRASH_FOLDER);
                    if !entry.file_type().is_file() || !in_trash {
                        continue;
                    }
                    let path = entry.path().to_path_buf();
                    if delete_files {
                        tx.add_post_commit_action(FsAction::RemovePath(path.clone()))?;
                    }
                    report.files.push(path);
                }
            }
            Ok(report)
        })?;

        report.hook_failures = tx.take_hook_failures();
        info!("Emptied {} files from upload trash folders", report.files.len());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::ingest::FilepathIngestor;
    use crate::schema;
    use crate::types::{FiletypeRef, OwnerKind, TransferMode};
    use crate::VaultError;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        db: Database,
        links: Arc<LinkRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let db = Database::open_in_memory().unwrap();
            let links = {
                let mut tx = db.transaction().unwrap();
                schema::initialize(&mut tx).unwrap();
                MountpointRegistry::new(temp.path())
                    .seed_defaults(&mut tx)
                    .unwrap();
                Arc::new(LinkRegistry::discover(&mut tx).unwrap())
            };
            Self { temp, db, links }
        }

        fn ingest(&self, name: &str, owner: i64) -> (i64, PathBuf) {
            let src = self.temp.path().join(name);
            fs::write(&src, name.as_bytes()).unwrap();
            let ingestor = FilepathIngestor::new(self.temp.path(), self.links.clone());
            let mut tx = self.db.transaction().unwrap();
            let ids = ingestor
                .insert_filepaths(
                    &mut tx,
                    &[(src, FiletypeRef::Id(1))],
                    owner,
                    Category::RawData,
                    TransferMode::Move,
                )
                .unwrap();
            let stored = ingestor.get_filepath(&mut tx, ids[0]).unwrap();
            (ids[0], stored.path)
        }

        fn link(&self, id: i64, owner: i64) {
            let ingestor = FilepathIngestor::new(self.temp.path(), self.links.clone());
            let mut tx = self.db.transaction().unwrap();
            ingestor
                .link_filepaths(&mut tx, OwnerKind::RawData, owner, &[id])
                .unwrap();
        }

        fn collector(&self) -> OrphanCollector<'_> {
            OrphanCollector::new(self.temp.path(), self.links.clone())
        }

        fn row_exists(&self, id: i64) -> bool {
            let ingestor = FilepathIngestor::new(self.temp.path(), self.links.clone());
            let mut tx = self.db.transaction().unwrap();
            ingestor.get_filepath(&mut tx, id).is_ok()
        }
    }

    #[test]
    fn test_only_unreferenced_rows_are_purged() {
        let fx = Fixture::new();
        let (orphan, orphan_path) = fx.ingest("orphan.fastq", 1);
        let (kept_a, kept_a_path) = fx.ingest("kept_a.fastq", 2);
        let (kept_b, kept_b_path) = fx.ingest("kept_b.fastq", 3);
        fx.link(kept_a, 2);
        fx.link(kept_b, 3);

        let mut tx = fx.db.transaction().unwrap();
        let report = fx.collector().purge_filepaths(&mut tx, true).unwrap();
        drop(tx);

        assert_eq!(report.rows_examined, 3);
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].id, orphan);
        assert_eq!(report.rows_deleted, 1);
        assert!(!orphan_path.exists());
        assert!(!fx.row_exists(orphan));
        assert!(fx.row_exists(kept_a) && kept_a_path.exists());
        assert!(fx.row_exists(kept_b) && kept_b_path.exists());
    }

    #[test]
    fn test_dry_run_mutates_nothing() {
        let fx = Fixture::new();
        let (orphan, path) = fx.ingest("orphan.fastq", 1);
        let mut tx = fx.db.transaction().unwrap();
        let report = fx.collector().purge_filepaths(&mut tx, false).unwrap();
        drop(tx);
        assert!(report.dry_run);
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.rows_deleted, 0);
        assert!(path.exists());
        assert!(fx.row_exists(orphan));
    }

    #[test]
    fn test_reference_column_keeps_row_and_nulls_are_ignored() {
        let fx = Fixture::new();
        let (referenced, path) = fx.ingest("greengenes.fna", 1);
        let (orphan, _) = fx.ingest("unused.fna", 2);
        {
            let mut tx = fx.db.transaction().unwrap();
            tx.scope(|tx| {
                tx.add(
                    "INSERT INTO reference (reference_name, sequence_filepath, taxonomy_filepath) \
                     VALUES ('gg', ?, NULL)",
                    vec![Value::Integer(referenced)],
                )?;
                tx.execute().map(|_| ())
            })
            .unwrap();
        }

        let mut tx = fx.db.transaction().unwrap();
        let report = fx.collector().purge_filepaths(&mut tx, true).unwrap();
        drop(tx);
        assert_eq!(
            report.orphans.iter().map(|o| o.id).collect::<Vec<_>>(),
            vec![orphan]
        );
        assert!(path.exists());
    }

    #[test]
    fn test_failed_purge_keeps_files() {
        let fx = Fixture::new();
        let (orphan, path) = fx.ingest("orphan.fastq", 1);
        let mut tx = fx.db.transaction().unwrap();
        let result: Result<()> = tx.scope(|tx| {
            fx.collector().purge_filepaths(tx, true)?;
            Err(VaultError::internal("failure after the delete was queued"))
        });
        assert!(result.is_err());
        drop(tx);
        assert!(path.exists());
        assert!(fx.row_exists(orphan));
    }

    #[test]
    fn test_nested_purge_reports_queued_work() {
        let fx = Fixture::new();
        let (orphan, path) = fx.ingest("orphan.fastq", 1);
        let mut tx = fx.db.transaction().unwrap();
        let report = tx
            .scope(|tx| {
                let report = fx.collector().purge_filepaths(tx, true)?;
                // removal waits for the enclosing commit
                assert!(path.exists());
                Ok(report)
            })
            .unwrap();
        drop(tx);

        assert_eq!(report.rows_deleted, 1);
        assert_eq!(report.files_scheduled, 1);
        assert!(report.hook_failures.is_empty());
        assert!(!path.exists());
        assert!(!fx.row_exists(orphan));
    }

    #[test]
    fn test_missing_file_row_is_still_deleted() {
        let fx = Fixture::new();
        let (orphan, path) = fx.ingest("orphan.fastq", 1);
        fs::remove_file(&path).unwrap();
        let mut tx = fx.db.transaction().unwrap();
        let report = fx.collector().purge_filepaths(&mut tx, true).unwrap();
        drop(tx);
        assert!(!report.orphans[0].exists);
        assert_eq!(report.files_scheduled, 0);
        assert_eq!(report.files_missing, 1);
        assert!(!fx.row_exists(orphan));
    }

    #[test]
    fn test_stale_registry_is_refused() {
        let fx = Fixture::new();
        let mut tx = fx.db.transaction().unwrap();
        schema::migrate(&mut tx, "CREATE TABLE extra (id INTEGER);").unwrap();
        assert!(matches!(
            fx.collector().purge_filepaths(&mut tx, true),
            Err(VaultError::Schema(_))
        ));
    }

    #[test]
    fn test_empty_trash_upload_folder() {
        let fx = Fixture::new();
        let study = fx.temp.path().join("uploads").join("1");
        fs::create_dir_all(study.join(TRASH_FOLDER)).unwrap();
        fs::write(study.join("keep.txt"), b"k").unwrap();
        fs::write(study.join(TRASH_FOLDER).join("gone.txt"), b"g").unwrap();

        let mut tx = fx.db.transaction().unwrap();
        let dry = fx.collector().empty_trash_upload_folder(&mut tx, false).unwrap();
        assert_eq!(dry.files.len(), 1);
        assert!(study.join(TRASH_FOLDER).join("gone.txt").exists());

        let report = fx.collector().empty_trash_upload_folder(&mut tx, true).unwrap();
        assert_eq!(report.files, vec![study.join(TRASH_FOLDER).join("gone.txt")]);
        assert!(!study.join(TRASH_FOLDER).join("gone.txt").exists());
        assert!(study.join("keep.txt").exists());
        assert!(study.join(TRASH_FOLDER).is_dir());
    }
}
