//! Main test module for labvault
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end scenarios
//! - Property-based tests for invariants

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::labvault::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn setup() -> (TempDir, TempDir, Vault) {
        let base = TempDir::new().unwrap();
        let incoming = TempDir::new().unwrap();
        let vault = Vault::init(base.path().to_path_buf()).unwrap();
        (base, incoming, vault)
    }

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let (_base, _incoming, vault) = setup();
        let ids = vault
            .ingest(&[], OwnerKind::RawData, 1, Category::RawData, TransferMode::Move)
            .unwrap();
        assert!(ids.is_empty());
        assert!(vault.verify_all().unwrap().file_checks.is_empty());
    }

    #[test]
    fn test_missing_source_leaves_nothing_behind() {
        let (base, incoming, vault) = setup();
        let present = incoming.path().join("present.txt");
        fs::write(&present, "here").unwrap();

        let result = vault.ingest(
            &[
                (present.clone(), FiletypeRef::Id(1)),
                (incoming.path().join("absent.txt"), FiletypeRef::Id(1)),
            ],
            OwnerKind::RawData,
            1,
            Category::RawData,
            TransferMode::Move,
        );

        assert!(result.is_err());
        assert!(present.exists());
        assert!(!base.path().join("raw_data").join("1_present.txt").exists());
    }

    #[test]
    fn test_unknown_filetype_name_is_refused_before_moving() {
        let (_base, incoming, vault) = setup();
        let source = incoming.path().join("file.txt");
        fs::write(&source, "x").unwrap();

        let result = vault.ingest(
            &[(source.clone(), FiletypeRef::from("no_such_type"))],
            OwnerKind::RawData,
            1,
            Category::RawData,
            TransferMode::Move,
        );

        assert!(matches!(result, Err(VaultError::Lookup(_))));
        assert!(source.exists());
    }

    #[test]
    fn test_special_filenames() {
        let (_base, incoming, vault) = setup();
        let names = ["file with spaces.txt", "file-with-dashes.txt", "файл.txt", "文件.txt"];
        let files: Vec<_> = names
            .iter()
            .map(|name| {
                let path = incoming.path().join(name);
                fs::write(&path, name).unwrap();
                (path, FiletypeRef::Id(9))
            })
            .collect();

        let ids = vault
            .ingest(&files, OwnerKind::Analysis, 4, Category::Analysis, TransferMode::Copy)
            .unwrap();

        for (id, name) in ids.iter().zip(names) {
            let stored = vault.locate(*id).unwrap();
            assert_eq!(stored.path.file_name().unwrap().to_str().unwrap(), name);
            assert_eq!(fs::read_to_string(&stored.path).unwrap(), name);
        }
    }

    #[test]
    fn test_directory_ingest_and_purge() {
        let (_base, incoming, vault) = setup();
        let dir = incoming.path().join("run_output");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested").join("x.log"), "log").unwrap();

        let ids = {
            let mut tx = vault.transaction().unwrap();
            vault
                .ingestor()
                .insert_filepaths(
                    &mut tx,
                    &[(dir.clone(), FiletypeRef::from("directory"))],
                    2,
                    Category::Job,
                    TransferMode::Move,
                )
                .unwrap()
        };
        let stored = vault.locate(ids[0]).unwrap();
        assert!(stored.path.join("nested").join("x.log").exists());

        let report = vault.purge_filepaths(true).unwrap();
        assert_eq!(report.rows_deleted, 1);
        assert!(!stored.path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_directory_copy_leaves_storage_untouched() {
        let (base, incoming, vault) = setup();
        let run = incoming.path().join("run1");
        fs::create_dir_all(&run).unwrap();
        fs::write(run.join("a.txt"), "a").unwrap();
        std::os::unix::fs::symlink(incoming.path().join("missing"), run.join("z_link")).unwrap();

        let raw_data = base.path().join("raw_data");
        let tree = |root: &Path| -> Vec<PathBuf> {
            walkdir::WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .map(|e| e.path().to_path_buf())
                .collect()
        };
        let before = tree(&raw_data);

        let result = vault.ingest(
            &[(run.clone(), FiletypeRef::from("directory"))],
            OwnerKind::RawData,
            3,
            Category::RawData,
            TransferMode::Copy,
        );

        assert!(matches!(result, Err(VaultError::Storage { .. })));
        assert_eq!(tree(&raw_data), before);
        assert!(run.join("a.txt").exists());

        // Nothing is left occupying the destination, so a retry succeeds
        fs::remove_file(run.join("z_link")).unwrap();
        let ids = vault
            .ingest(
                &[(run, FiletypeRef::from("directory"))],
                OwnerKind::RawData,
                3,
                Category::RawData,
                TransferMode::Copy,
            )
            .unwrap();
        assert!(vault.locate(ids[0]).unwrap().path.join("a.txt").exists());
    }

    #[test]
    fn test_corrupted_file_fails_verification() {
        let (_base, incoming, vault) = setup();
        let source = incoming.path().join("data.txt");
        fs::write(&source, "original").unwrap();
        let ids = vault
            .ingest(
                &[(source, FiletypeRef::Id(9))],
                OwnerKind::RawData,
                1,
                Category::RawData,
                TransferMode::Move,
            )
            .unwrap();

        fs::write(vault.locate(ids[0]).unwrap().path, "tampered").unwrap();
        let check = vault.verify(ids[0]).unwrap();
        assert!(!check.is_valid());
        assert!(check.exists);

        let report = vault.verify_all().unwrap();
        assert_eq!(report.failures().count(), 1);
        assert!(report.summary().contains("1 checksum mismatches"));
    }

    #[test]
    fn test_reopen_sees_previous_rows() {
        let (base, incoming, vault) = setup();
        let source = incoming.path().join("keep.txt");
        fs::write(&source, "kept").unwrap();
        let ids = vault
            .ingest(
                &[(source, FiletypeRef::Id(9))],
                OwnerKind::RawData,
                1,
                Category::RawData,
                TransferMode::Move,
            )
            .unwrap();
        drop(vault);

        let reopened = Vault::open(base.path().to_path_buf()).unwrap();
        assert_eq!(reopened.locate(ids[0]).unwrap().relative_path, "1_keep.txt");
    }

    #[test]
    fn test_open_uninitialized_base_fails() {
        let base = TempDir::new().unwrap();
        let result = Vault::open(base.path().to_path_buf());
        assert!(matches!(result, Err(VaultError::StorageNotInitialized(_))));
    }

    #[test]
    fn test_mountpoint_root_must_stay_under_base() {
        let (_base, _incoming, vault) = setup();
        for root in ["../outside", "/absolute"] {
            let result = vault.add_mountpoint(Category::Job, Path::new(root), false, false);
            assert!(matches!(result, Err(VaultError::Storage { .. })), "{}", root);
        }
    }
}
