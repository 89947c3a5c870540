//! Property-based tests for labvault
//!
//! Uses proptest to verify atomicity and checksum invariants across
//! generated batches.

use ::labvault::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Strategy for distinct file names with small contents
fn batch_strategy() -> impl Strategy<Value = Vec<(String, Vec<u8>)>> {
    prop::collection::btree_map("[a-z]{1,10}\\.(txt|fna|biom)", prop::collection::vec(any::<u8>(), 0..512), 1..8)
        .prop_map(|files| files.into_iter().collect())
}

fn write_batch(dir: &TempDir, batch: &[(String, Vec<u8>)]) -> Vec<(PathBuf, FiletypeRef)> {
    batch
        .iter()
        .map(|(name, content)| {
            let path = dir.path().join(name);
            fs::write(&path, content).unwrap();
            (path, FiletypeRef::Id(9))
        })
        .collect()
}

fn snapshot(dir: &std::path::Path) -> BTreeSet<(PathBuf, Vec<u8>)> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| (e.path().to_path_buf(), fs::read(e.path()).unwrap()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_checksum_matches_independent_read(batch in batch_strategy()) {
        let base = TempDir::new().unwrap();
        let incoming = TempDir::new().unwrap();
        let vault = Vault::init(base.path().to_path_buf()).unwrap();
        let files = write_batch(&incoming, &batch);

        let ids = vault
            .ingest(&files, OwnerKind::RawData, 1, Category::RawData, TransferMode::Move)
            .unwrap();
        prop_assert_eq!(ids.len(), batch.len());

        for (id, (_, content)) in ids.iter().zip(&batch) {
            let stored = vault.locate(*id).unwrap();
            let on_disk = fs::read(&stored.path).unwrap();
            prop_assert_eq!(&on_disk, content);
            prop_assert_eq!(stored.checksum, utils::checksum_bytes(&on_disk));
        }
    }

    #[test]
    fn prop_failed_batch_restores_filesystem(
        batch in batch_strategy(),
        fail_at in any::<prop::sample::Index>(),
    ) {
        let base = TempDir::new().unwrap();
        let incoming = TempDir::new().unwrap();
        let vault = Vault::init(base.path().to_path_buf()).unwrap();
        let mut files = write_batch(&incoming, &batch);

        // One entry refers to a type the store does not have
        let broken = fail_at.index(files.len());
        files[broken].1 = FiletypeRef::Id(10_000);

        let incoming_before = snapshot(incoming.path());

        let result = vault.ingest(&files, OwnerKind::RawData, 1, Category::RawData, TransferMode::Move);
        prop_assert!(result.is_err());

        prop_assert_eq!(snapshot(incoming.path()), incoming_before);
        prop_assert!(snapshot(&base.path().join("raw_data")).is_empty());
        prop_assert!(vault.verify_all().unwrap().file_checks.is_empty());
    }

    #[test]
    fn prop_rollback_hooks_run_in_reverse(labels in prop::collection::vec("[a-z]{1,6}", 1..12)) {
        let base = TempDir::new().unwrap();
        let vault = Vault::init(base.path().to_path_buf()).unwrap();
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

        let mut tx = vault.transaction().unwrap();
        let result: Result<()> = tx.scope(|tx| {
            for label in &labels {
                let seen = log.clone();
                let label = label.clone();
                tx.add_post_rollback_func(label.clone(), move || {
                    seen.borrow_mut().push(label);
                    Ok(())
                })?;
            }
            Err(VaultError::internal("abort"))
        });
        drop(tx);

        prop_assert!(result.is_err());
        let expected: Vec<String> = labels.iter().rev().cloned().collect();
        prop_assert_eq!(&*log.borrow(), &expected);
    }

    #[test]
    fn prop_commit_hooks_run_in_order(labels in prop::collection::vec("[a-z]{1,6}", 1..12)) {
        let base = TempDir::new().unwrap();
        let vault = Vault::init(base.path().to_path_buf()).unwrap();
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

        let mut tx = vault.transaction().unwrap();
        tx.scope(|tx| {
            for label in &labels {
                let seen = log.clone();
                let label = label.clone();
                tx.add_post_commit_func(label.clone(), move || {
                    seen.borrow_mut().push(label);
                    Ok(())
                })?;
            }
            Ok(())
        })
        .unwrap();

        prop_assert_eq!(&*log.borrow(), &labels);
    }
}
