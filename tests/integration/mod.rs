//! Integration tests for labvault
//!
//! End-to-end scenarios across ingestion, collection, mountpoint
//! generations, upload folders and release bundles.

use ::labvault::transaction::as_i64;
use ::labvault::*;
use flate2::Crc;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;
use tracing::info;

/// A vault plus a scratch directory incoming files are written to
pub struct VaultTestHarness {
    pub base: TempDir,
    pub incoming: TempDir,
    pub vault: Vault,
}

impl VaultTestHarness {
    /// Fresh vault with default mountpoints
    pub fn new() -> Self {
        let base = TempDir::new().unwrap();
        let incoming = TempDir::new().unwrap();
        let vault = Vault::init(base.path().to_path_buf()).unwrap();
        Self {
            base,
            incoming,
            vault,
        }
    }

    /// Write an incoming file
    pub fn write_incoming(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.incoming.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    /// Ingest files without linking them to any owner
    pub fn ingest_unlinked(
        &self,
        names: &[&str],
        owner_id: i64,
        category: Category,
    ) -> anyhow::Result<Vec<i64>> {
        let files: Vec<(PathBuf, FiletypeRef)> = names
            .iter()
            .map(|name| (self.write_incoming(name, name.as_bytes()), FiletypeRef::Id(1)))
            .collect();
        let mut tx = self.vault.transaction()?;
        Ok(self.vault.ingestor().insert_filepaths(
            &mut tx,
            &files,
            owner_id,
            category,
            TransferMode::Move,
        )?)
    }

    /// Ingest files and link them to a raw data owner
    pub fn ingest_linked(&self, names: &[&str], owner_id: i64) -> anyhow::Result<Vec<i64>> {
        let files: Vec<(PathBuf, FiletypeRef)> = names
            .iter()
            .map(|name| (self.write_incoming(name, name.as_bytes()), FiletypeRef::Id(1)))
            .collect();
        Ok(self.vault.ingest(
            &files,
            OwnerKind::RawData,
            owner_id,
            Category::RawData,
            TransferMode::Move,
        )?)
    }

    /// Number of filepath rows
    pub fn filepath_count(&self) -> anyhow::Result<i64> {
        let mut tx = self.vault.transaction()?;
        let count = tx.scope(|tx| {
            tx.add("SELECT COUNT(*) FROM filepath", vec![])?;
            tx.execute_fetchlast()
        })?;
        Ok(count.map(|v| as_i64(&v)).transpose()?.unwrap_or(0))
    }

    /// Names of every file under `dir`, sorted
    pub fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().strip_prefix(dir).unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn independent_crc(path: &Path) -> u32 {
    let mut crc = Crc::new();
    crc.update(&fs::read(path).unwrap());
    crc.sum()
}

#[test]
fn test_flat_ingest_two_files() -> anyhow::Result<()> {
    let harness = VaultTestHarness::new();
    let a = harness.write_incoming("a.txt", b"Some text so we can actually compute a checksum");
    let b = harness.write_incoming("b.txt", b"\n");

    let mut tx = harness.vault.transaction()?;
    let ids = harness.vault.ingestor().insert_filepaths(
        &mut tx,
        &[(a, FiletypeRef::Id(1)), (b, FiletypeRef::Id(2))],
        3,
        Category::RawData,
        TransferMode::Move,
    )?;
    drop(tx);

    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);
    let stored_a = harness.vault.locate(ids[0])?;
    let stored_b = harness.vault.locate(ids[1])?;
    assert_eq!(stored_a.relative_path, "3_a.txt");
    assert_eq!(stored_b.relative_path, "3_b.txt");
    assert_eq!(stored_a.filepath_type, "raw_forward_seqs");
    assert_eq!(stored_b.filepath_type, "raw_reverse_seqs");
    assert_eq!(stored_b.checksum, 852952723);
    assert_eq!(stored_a.checksum, independent_crc(&stored_a.path));
    assert_eq!(stored_b.checksum, independent_crc(&stored_b.path));
    Ok(())
}

#[test]
fn test_purge_removes_only_unlinked_row() -> anyhow::Result<()> {
    let harness = VaultTestHarness::new();
    let linked = harness.ingest_linked(&["f1", "f2", "f3", "f4", "f5", "f6"], 1)?;
    assert_eq!(linked, vec![1, 2, 3, 4, 5, 6]);
    let orphan = harness.ingest_unlinked(&["f7"], 2, Category::RawData)?;
    let kept = harness.ingest_linked(&["f8", "f9"], 3)?;
    assert_eq!(orphan, vec![7]);
    assert_eq!(kept, vec![8, 9]);

    let orphan_path = harness.vault.locate(7)?.path;
    let kept_paths: Vec<PathBuf> = kept
        .iter()
        .map(|id| harness.vault.locate(*id).map(|s| s.path))
        .collect::<Result<_>>()?;

    let report = harness.vault.purge_filepaths(true)?;
    info!("purge report: {:?}", report);
    assert_eq!(report.orphans.iter().map(|o| o.id).collect::<Vec<_>>(), vec![7]);
    assert_eq!(report.rows_deleted, 1);

    assert!(!orphan_path.exists());
    assert!(matches!(harness.vault.locate(7), Err(VaultError::Lookup(_))));
    for (id, path) in kept.iter().zip(&kept_paths) {
        assert!(path.exists());
        assert!(harness.vault.locate(*id).is_ok());
    }
    assert_eq!(harness.filepath_count()?, 8);
    Ok(())
}

#[test]
fn test_deferred_deletion_survives_failed_transaction() -> anyhow::Result<()> {
    let harness = VaultTestHarness::new();
    let ids = harness.ingest_unlinked(&["orphan.txt"], 1, Category::RawData)?;
    let path = harness.vault.locate(ids[0])?.path;

    let collector = harness.vault.collector();
    let mut tx = harness.vault.transaction()?;
    let outcome: Result<()> = tx.scope(|tx| {
        let report = collector.purge_filepaths(tx, true)?;
        assert_eq!(report.rows_deleted, 1);
        Err(VaultError::internal("caller failed before commit"))
    });
    drop(tx);

    assert!(outcome.is_err());
    assert!(path.exists());
    assert_eq!(harness.vault.locate(ids[0])?.path, path);
    Ok(())
}

#[test]
fn test_failed_insert_restores_every_source() -> anyhow::Result<()> {
    let harness = VaultTestHarness::new();
    let a = harness.write_incoming("a.txt", b"a");
    let b = harness.write_incoming("b.txt", b"b");
    let before = VaultTestHarness::listing(harness.incoming.path());

    let mut tx = harness.vault.transaction()?;
    // type 999 does not exist, so the batched insert violates a foreign key
    let result = harness.vault.ingestor().insert_filepaths(
        &mut tx,
        &[(a, FiletypeRef::Id(1)), (b, FiletypeRef::Id(999))],
        3,
        Category::RawData,
        TransferMode::Move,
    );
    drop(tx);

    assert!(matches!(result, Err(VaultError::StatementFailed { .. })));
    assert_eq!(VaultTestHarness::listing(harness.incoming.path()), before);
    assert!(VaultTestHarness::listing(&harness.base.path().join("raw_data")).is_empty());
    assert_eq!(harness.filepath_count()?, 0);
    Ok(())
}

#[test]
fn test_compensations_run_in_reverse_order() -> anyhow::Result<()> {
    let harness = VaultTestHarness::new();
    let a = harness.write_incoming("a.txt", b"a");
    let b = harness.write_incoming("b.txt", b"b");
    let log: Rc<RefCell<Vec<(&str, bool, bool)>>> = Rc::new(RefCell::new(Vec::new()));
    let ingestor = harness.vault.ingestor();

    let check_state = |tx: &mut Transaction<'_>, label: &'static str| -> Result<()> {
        let seen = log.clone();
        let (a, b) = (a.clone(), b.clone());
        tx.add_post_rollback_func(label, move || {
            seen.borrow_mut().push((label, a.exists(), b.exists()));
            Ok(())
        })
    };

    let mut tx = harness.vault.transaction()?;
    let result: Result<()> = tx.scope(|tx| {
        check_state(tx, "before a")?;
        ingestor.insert_filepaths(tx, &[(a.clone(), FiletypeRef::Id(1))], 1, Category::RawData, TransferMode::Move)?;
        check_state(tx, "before b")?;
        ingestor.insert_filepaths(tx, &[(b.clone(), FiletypeRef::Id(1))], 1, Category::RawData, TransferMode::Move)?;
        assert!(!a.exists() && !b.exists());
        Err(VaultError::internal("abort"))
    });
    drop(tx);

    assert!(result.is_err());
    // b is moved back before a
    assert_eq!(
        *log.borrow(),
        vec![("before b", false, true), ("before a", true, true)]
    );
    assert_eq!(harness.filepath_count()?, 0);
    Ok(())
}

#[test]
fn test_mountpoint_resolution_order() -> anyhow::Result<()> {
    let harness = VaultTestHarness::new();
    let first = harness.vault.mountpoints();
    let mut tx = harness.vault.transaction()?;
    let original = first.resolve_active(&mut tx, Category::Job)?;
    drop(tx);

    let second = harness
        .vault
        .add_mountpoint(Category::Job, Path::new("job_2"), false, false)?;
    let third = harness
        .vault
        .add_mountpoint(Category::Job, Path::new("job_3"), true, true)?;

    let mut tx = harness.vault.transaction()?;
    let all = first.resolve(&mut tx, Category::Job, true)?;
    assert_eq!(
        all.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![third.id, second.id, original.id]
    );
    assert_eq!(all.iter().filter(|m| m.active).count(), 1);
    assert_eq!(first.resolve(&mut tx, Category::Job, false)?, vec![third.clone()]);
    drop(tx);

    harness.vault.activate_mountpoint(original.id)?;
    let mut tx = harness.vault.transaction()?;
    assert_eq!(first.resolve_active(&mut tx, Category::Job)?.id, original.id);
    Ok(())
}

#[test]
fn test_upload_round_trip() -> anyhow::Result<()> {
    let harness = VaultTestHarness::new();
    let uploads = harness.vault.uploads();
    let folder = harness.base.path().join("uploads").join("5");
    fs::create_dir_all(&folder)?;
    fs::write(folder.join("reads.fastq"), b"@r1")?;

    let mut tx = harness.vault.transaction()?;
    let files = uploads.get_files_from_uploads_folders(&mut tx, 5)?;
    assert_eq!(files.len(), 1);
    uploads.move_upload_files_to_trash(&mut tx, 5, &files)?;
    assert!(uploads.get_files_from_uploads_folders(&mut tx, 5)?.is_empty());
    drop(tx);

    let dry = harness.vault.empty_trash_upload_folder(false)?;
    assert_eq!(dry.files.len(), 1);
    let report = harness.vault.empty_trash_upload_folder(true)?;
    assert_eq!(report.files, vec![folder.join("trash").join("reads.fastq")]);
    assert!(!folder.join("trash").join("reads.fastq").exists());
    Ok(())
}

#[test]
fn test_release_through_vault() -> anyhow::Result<()> {
    let harness = VaultTestHarness::new();
    {
        let mut tx = harness.vault.transaction()?;
        tx.scope(|tx| {
            let record = |pairs: &[(&str, rusqlite::types::Value)]| {
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect::<std::collections::BTreeMap<_, _>>()
            };
            use rusqlite::types::Value;
            schema::insert_record(
                tx,
                "study",
                &record(&[
                    ("study_id", Value::Integer(1)),
                    ("title", Value::Text("Soil".into())),
                    ("status", Value::Text("private".into())),
                ]),
            )?;
            schema::insert_record(
                tx,
                "prep_template",
                &record(&[("prep_template_id", Value::Integer(1)), ("study_id", Value::Integer(1))]),
            )?;
            schema::insert_record(
                tx,
                "software_command",
                &record(&[("command_id", Value::Integer(1)), ("name", Value::Text("Deblur".into()))]),
            )?;
            schema::insert_record(
                tx,
                "artifact",
                &record(&[
                    ("artifact_id", Value::Integer(1)),
                    ("artifact_type", Value::Text("BIOM".into())),
                    ("command_id", Value::Integer(1)),
                    ("study_id", Value::Integer(1)),
                ]),
            )?;
            schema::insert_record(
                tx,
                "preparation_artifact",
                &record(&[("prep_template_id", Value::Integer(1)), ("artifact_id", Value::Integer(1))]),
            )?;
            Ok(())
        })?;
    }

    let ingest = |name: &str, kind: OwnerKind, category: Category, filetype: &str| {
        let path = harness.write_incoming(name, name.as_bytes());
        harness
            .vault
            .ingest(&[(path, FiletypeRef::from(filetype))], kind, 1, category, TransferMode::Move)
    };
    ingest("sample.txt", OwnerKind::SampleTemplate, Category::Templates, "sample_template")?;
    ingest("prep.txt", OwnerKind::PrepTemplate, Category::Templates, "prep_template")?;
    ingest("table.biom", OwnerKind::Artifact, Category::Biom, "biom")?;

    assert!(harness.vault.release(Visibility::Public)?.entries.is_empty());

    let bundle = harness.vault.release(Visibility::Private)?;
    assert_eq!(bundle.entries.len(), 1);
    assert_eq!(bundle.entries[0].biom_fp, Path::new("BIOM/1/table.biom"));
    assert_eq!(bundle.entries[0].command, "");
    assert!(bundle
        .archive_path
        .starts_with(harness.base.path().join("working_dir").join("releases")));
    assert!(bundle.archive_path.exists());
    assert!(bundle.manifest_path.exists());
    Ok(())
}

#[cfg(test)]
mod traced {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_purge_without_references_logs_warning() {
        let harness = VaultTestHarness::new();
        harness
            .vault
            .migrate(
                "DROP TABLE artifact_filepath; DROP TABLE raw_filepath;
                 DROP TABLE preprocessed_filepath; DROP TABLE processed_filepath;
                 DROP TABLE job_results_filepath; DROP TABLE analysis_filepath;
                 DROP TABLE sample_template_filepath; DROP TABLE prep_template_filepath;
                 DROP TABLE reference;",
            )
            .unwrap();
        harness.ingest_unlinked(&["x.txt"], 1, Category::RawData).unwrap();

        let report = harness.vault.purge_filepaths(false).unwrap();
        assert_eq!(report.orphans.len(), 1);
        assert!(logs_contain("every filepath row is orphaned"));
    }
}
