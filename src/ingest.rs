//! File ingestion and filepath resolution
//!
//! [`FilepathIngestor::insert_filepaths`] brings incoming files under
//! management as one all-or-nothing step:
//!
//! 1. resolve the active generation of the category;
//! 2. resolve every type given by name (a bad name aborts before any file
//!    is touched);
//! 3. compute each destination: `root/<owner_id>/<name>` for generations
//!    with subdirectories, `root/<owner_id>_<name>` otherwise;
//! 4. move or copy each file, registering its exact inverse as a rollback
//!    compensation;
//! 5. checksum the destination;
//! 6. queue one batched insert and return the new ids in input order.
//!
//! Everything runs inside a transaction scope, so a failure anywhere
//! (collision, failed transfer, failed insert) restores the filesystem to its
//! state before the call. Stored paths are relative to the generation root
//! and include the owner subdirectory, which makes them resolvable on their
//! own.
//!
//! The remaining operations resolve stored rows back to locations.

use crate::compensation::{self, FsAction};
use crate::error::{Result, VaultError};
use crate::links::LinkRegistry;
use crate::mountpoint::MountpointRegistry;
use crate::schema::{self, quote_ident, Vocabulary, CRC32_ALGORITHM_ID};
use crate::transaction::{as_i64, as_text, column, Row, Transaction};
use crate::types::{Category, FiletypeRef, Mountpoint, OwnerKind, SortOrder, StoredFilepath, TransferMode};
use crate::utils;
use rusqlite::types::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub(crate) const SELECT_FILEPATH: &str = "SELECT f.filepath_id, f.filepath, t.filepath_type, \
     f.checksum, f.data_directory_id, d.mountpoint \
     FROM filepath AS f \
     JOIN filepath_type AS t ON t.filepath_type_id = f.filepath_type_id \
     JOIN data_directory AS d ON d.data_directory_id = f.data_directory_id";

/// Moves files into managed storage and resolves stored filepaths
#[derive(Debug, Clone)]
pub struct FilepathIngestor<'a> {
    mountpoints: MountpointRegistry<'a>,
    links: Arc<LinkRegistry>,
}

impl<'a> FilepathIngestor<'a> {
    /// Ingestor storing under `base_dir`, linking through `links`
    pub fn new(base_dir: &'a Path, links: Arc<LinkRegistry>) -> Self {
        Self {
            mountpoints: MountpointRegistry::new(base_dir),
            links,
        }
    }

    /// Ingest `files` for `owner_id` into the active generation of `category`
    ///
    /// # Arguments
    ///
    /// * `tx` - Transaction context; the call is atomic on its own and joins
    ///   the caller's scope when one is open
    /// * `files` - `(source path, type)` pairs
    /// * `owner_id` - Id of the owning entity, used in destination names
    /// * `category` - Storage category
    /// * `mode` - Move or copy
    ///
    /// # Returns
    ///
    /// The new filepath ids, in the same order as `files`. Empty input
    /// returns an empty list without touching the store.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Lookup`] for an unknown type name or a category
    ///   without an active generation
    /// - [`VaultError::Storage`] for a missing source or an occupied
    ///   destination
    /// - [`VaultError::StatementFailed`] if the insert fails
    #[instrument(skip(self, tx, files), fields(count = files.len()))]
    pub fn insert_filepaths(
        &self,
        tx: &mut Transaction<'_>,
        files: &[(PathBuf, FiletypeRef)],
        owner_id: i64,
        category: Category,
        mode: TransferMode,
    ) -> Result<Vec<i64>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        tx.scope(|tx| {
            let mountpoint = self.mountpoints.resolve_active(tx, category)?;

            let mut type_ids = Vec::with_capacity(files.len());
            for (_, filetype) in files {
                type_ids.push(match filetype {
                    FiletypeRef::Id(id) => *id,
                    FiletypeRef::Name(name) => {
                        schema::convert_to_id(tx, Vocabulary::FilepathType, name)?
                    }
                });
            }

            if mountpoint.subdirectory {
                let owner_dir = mountpoint.root.join(owner_id.to_string());
                if !owner_dir.exists() {
                    fs::create_dir_all(&owner_dir)?;
                    tx.add_post_rollback_action(FsAction::RemoveDirIfEmpty(owner_dir))?;
                }
            }

            let mut rows = Vec::with_capacity(files.len());
            for ((source, _), type_id) in files.iter().zip(type_ids) {
                let destination = destination_path(&mountpoint, owner_id, source)?;
                if source.symlink_metadata().is_err() {
                    return Err(VaultError::storage(source, "source file does not exist"));
                }
                if destination.symlink_metadata().is_ok() {
                    return Err(VaultError::storage(
                        &destination,
                        "destination is already occupied",
                    ));
                }

                let undo = compensation::transfer(source, &destination, mode)?;
                tx.add_post_rollback_action(undo)?;

                let checksum = utils::compute_checksum(&destination)?;
                let relative = utils::make_relative(&destination, &mountpoint.root)?;
                debug!("Ingested {:?} -> {:?} (crc32 {})", source, destination, checksum);
                rows.push(vec![
                    Value::Text(utils::path_to_db_text(&relative)?),
                    Value::Integer(type_id),
                    Value::Integer(i64::from(checksum)),
                    Value::Integer(CRC32_ALGORITHM_ID),
                    Value::Integer(mountpoint.id),
                ]);
            }

            let first = tx.index();
            tx.add_many(
                "INSERT INTO filepath \
                 (filepath, filepath_type_id, checksum, checksum_algorithm_id, data_directory_id) \
                 VALUES (?, ?, ?, ?, ?) RETURNING filepath_id",
                rows,
            )?;
            let results = tx.execute()?;
            let ids = results[first..]
                .iter()
                .map(|rs| {
                    let row = rs
                        .first()
                        .ok_or_else(|| VaultError::internal("filepath insert returned no id"))?;
                    as_i64(column(row, 0)?)
                })
                .collect::<Result<Vec<_>>>()?;

            info!(
                "Ingested {} files for owner {} into {} (mountpoint {})",
                ids.len(),
                owner_id,
                category,
                mountpoint.id
            );
            Ok(ids)
        })
    }

    /// Write link rows tying `filepath_ids` to an owner
    ///
    /// # Errors
    ///
    /// - [`VaultError::Lookup`] if the store has no link table for `kind`
    pub fn link_filepaths(
        &self,
        tx: &mut Transaction<'_>,
        kind: OwnerKind,
        owner_id: i64,
        filepath_ids: &[i64],
    ) -> Result<()> {
        let link = self.links.link_table(kind)?;
        if filepath_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?)",
            quote_ident(&link.table),
            quote_ident(&link.owner_column),
            quote_ident(&link.filepath_column)
        );
        tx.scope(|tx| {
            tx.add_many(
                sql,
                filepath_ids
                    .iter()
                    .map(|id| vec![Value::Integer(owner_id), Value::Integer(*id)])
                    .collect(),
            )?;
            tx.execute()?;
            debug!("Linked {} filepaths to {} {}", filepath_ids.len(), kind, owner_id);
            Ok(())
        })
    }

    /// Filepaths linked to an owner
    ///
    /// # Arguments
    ///
    /// * `sort` - Order by filepath id; `None` keeps store order
    /// * `fp_type` - Only return filepaths of this type
    pub fn retrieve_filepaths(
        &self,
        tx: &mut Transaction<'_>,
        kind: OwnerKind,
        owner_id: i64,
        sort: Option<SortOrder>,
        fp_type: Option<&str>,
    ) -> Result<Vec<StoredFilepath>> {
        let link = self.links.link_table(kind)?;
        let mut sql = format!(
            "{} JOIN {} AS l ON l.{} = f.filepath_id WHERE l.{} = ?",
            SELECT_FILEPATH,
            quote_ident(&link.table),
            quote_ident(&link.filepath_column),
            quote_ident(&link.owner_column)
        );
        let mut params = vec![Value::Integer(owner_id)];
        if let Some(fp_type) = fp_type {
            sql.push_str(" AND t.filepath_type = ?");
            params.push(Value::Text(fp_type.to_string()));
        }
        match sort {
            Some(SortOrder::Ascending) => sql.push_str(" ORDER BY f.filepath_id ASC"),
            Some(SortOrder::Descending) => sql.push_str(" ORDER BY f.filepath_id DESC"),
            None => {}
        }

        let rows = tx.scope(|tx| {
            tx.add(sql, params)?;
            tx.execute_fetchindex()
        })?;
        rows.iter()
            .map(|row| self.stored_from_row(row))
            .collect()
    }

    /// One stored filepath by id
    ///
    /// # Errors
    ///
    /// - [`VaultError::Lookup`] if the id does not exist
    pub fn get_filepath(&self, tx: &mut Transaction<'_>, filepath_id: i64) -> Result<StoredFilepath> {
        let rows = tx.scope(|tx| {
            tx.add(
                format!("{} WHERE f.filepath_id = ?", SELECT_FILEPATH),
                vec![Value::Integer(filepath_id)],
            )?;
            tx.execute_fetchindex()
        })?;
        match rows.first() {
            Some(row) => self.stored_from_row(row),
            None => Err(VaultError::lookup(format!(
                "filepath {} does not exist",
                filepath_id
            ))),
        }
    }

    /// Every stored filepath, by id
    pub fn list_filepaths(&self, tx: &mut Transaction<'_>) -> Result<Vec<StoredFilepath>> {
        let rows = tx.scope(|tx| {
            tx.add(format!("{} ORDER BY f.filepath_id", SELECT_FILEPATH), vec![])?;
            tx.execute_fetchindex()
        })?;
        rows.iter()
            .map(|row| self.stored_from_row(row))
            .collect()
    }

    /// Id of the filepath stored at absolute `path` under `category`
    ///
    /// Every generation of the category is searched, active first.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Lookup`] if no row matches
    pub fn get_filepath_id(
        &self,
        tx: &mut Transaction<'_>,
        category: Category,
        path: &Path,
    ) -> Result<i64> {
        tx.scope(|tx| {
            for mountpoint in self.mountpoints.resolve(tx, category, true)? {
                let Ok(relative) = path.strip_prefix(&mountpoint.root) else {
                    continue;
                };
                tx.add(
                    "SELECT filepath_id FROM filepath WHERE filepath = ? AND data_directory_id = ?",
                    vec![
                        Value::Text(utils::path_to_db_text(relative)?),
                        Value::Integer(mountpoint.id),
                    ],
                )?;
                if let Some(id) = tx.execute_fetchlast()? {
                    return as_i64(&id);
                }
            }
            Err(VaultError::lookup(format!(
                "no filepath stored at {:?} in category '{}'",
                path, category
            )))
        })
    }

    /// Location of a filepath relative to the storage base
    pub fn filepath_id_to_rel_path(&self, tx: &mut Transaction<'_>, filepath_id: i64) -> Result<PathBuf> {
        let stored = self.get_filepath(tx, filepath_id)?;
        Ok(utils::make_relative(&stored.path, self.mountpoints.base_dir())?)
    }

    /// Locations of several filepaths relative to the storage base
    ///
    /// Unknown ids are skipped.
    pub fn filepath_ids_to_rel_paths(
        &self,
        tx: &mut Transaction<'_>,
        filepath_ids: &[i64],
    ) -> Result<BTreeMap<i64, PathBuf>> {
        if filepath_ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let placeholders = vec!["?"; filepath_ids.len()].join(", ");
        let rows = tx.scope(|tx| {
            tx.add(
                format!(
                    "{} WHERE f.filepath_id IN ({})",
                    SELECT_FILEPATH, placeholders
                ),
                filepath_ids.iter().map(|id| Value::Integer(*id)).collect(),
            )?;
            tx.execute_fetchindex()
        })?;
        rows.iter()
            .map(|row| {
                let stored = self.stored_from_row(row)?;
                let relative = utils::make_relative(&stored.path, self.mountpoints.base_dir())?;
                Ok((stored.id, relative))
            })
            .collect()
    }

    /// Every filepath type, by name
    pub fn get_filepath_types(&self, tx: &mut Transaction<'_>) -> Result<BTreeMap<String, i64>> {
        schema::vocabulary_map(tx, Vocabulary::FilepathType)
    }

    /// Stable id of filepath type `name`
    pub fn convert_to_id(&self, tx: &mut Transaction<'_>, name: &str) -> Result<i64> {
        schema::convert_to_id(tx, Vocabulary::FilepathType, name)
    }

    /// Name of filepath type `id`
    pub fn convert_from_id(&self, tx: &mut Transaction<'_>, id: i64) -> Result<String> {
        schema::convert_from_id(tx, Vocabulary::FilepathType, id)
    }

    fn stored_from_row(&self, row: &Row) -> Result<StoredFilepath> {
        stored_filepath_from_row(self.mountpoints.base_dir(), row)
    }
}

/// Build a [`StoredFilepath`] from a row selected with [`SELECT_FILEPATH`]
pub(crate) fn stored_filepath_from_row(base_dir: &Path, row: &Row) -> Result<StoredFilepath> {
    let relative_path = as_text(column(row, 1)?)?;
    let checksum = as_i64(column(row, 3)?)?;
    let mountpoint_root = as_text(column(row, 5)?)?;
    Ok(StoredFilepath {
        id: as_i64(column(row, 0)?)?,
        path: base_dir.join(mountpoint_root).join(&relative_path),
        relative_path,
        filepath_type: as_text(column(row, 2)?)?,
        checksum: u32::try_from(checksum).map_err(|_| {
            VaultError::internal(format!("stored checksum {} is not a CRC-32 value", checksum))
        })?,
        mountpoint_id: as_i64(column(row, 4)?)?,
    })
}

fn destination_path(mountpoint: &Mountpoint, owner_id: i64, source: &Path) -> Result<PathBuf> {
    let name = utils::file_name_str(source)?;
    Ok(if mountpoint.subdirectory {
        mountpoint.root.join(owner_id.to_string()).join(name)
    } else {
        mountpoint.root.join(format!("{}_{}", owner_id, name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
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
                let registry = MountpointRegistry::new(temp.path());
                registry
                    .create(&mut tx, Category::RawData, Path::new("raw_data"), false, true)
                    .unwrap();
                registry
                    .create(&mut tx, Category::Biom, Path::new("BIOM"), true, true)
                    .unwrap();
                Arc::new(LinkRegistry::discover(&mut tx).unwrap())
            };
            Self { temp, db, links }
        }

        fn ingestor(&self) -> FilepathIngestor<'_> {
            FilepathIngestor::new(self.temp.path(), self.links.clone())
        }

        fn incoming(&self, name: &str, content: &[u8]) -> PathBuf {
            let dir = self.temp.path().join("incoming");
            fs::create_dir_all(&dir).unwrap();
            let path = dir.join(name);
            fs::write(&path, content).unwrap();
            path
        }
    }

    #[test]
    fn test_empty_input_touches_nothing() {
        let fx = Fixture::new();
        let mut tx = fx.db.transaction().unwrap();
        let ids = fx
            .ingestor()
            .insert_filepaths(&mut tx, &[], 1, Category::RawData, TransferMode::Move)
            .unwrap();
        assert!(ids.is_empty());
        assert_eq!(tx.index(), 0);
    }

    #[test]
    fn test_flat_layout_names_and_ids() {
        let fx = Fixture::new();
        let a = fx.incoming("a.txt", b"alpha");
        let b = fx.incoming("b.txt", b"beta");
        let ingestor = fx.ingestor();
        let mut tx = fx.db.transaction().unwrap();

        let ids = ingestor
            .insert_filepaths(
                &mut tx,
                &[(a.clone(), FiletypeRef::Id(1)), (b.clone(), FiletypeRef::Id(2))],
                3,
                Category::RawData,
                TransferMode::Move,
            )
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);

        let root = fx.temp.path().join("raw_data");
        assert!(root.join("3_a.txt").exists());
        assert!(root.join("3_b.txt").exists());
        assert!(!a.exists());

        let first = ingestor.get_filepath(&mut tx, ids[0]).unwrap();
        assert_eq!(first.relative_path, "3_a.txt");
        assert_eq!(first.filepath_type, "raw_forward_seqs");
        assert_eq!(first.checksum, utils::checksum_bytes(b"alpha"));
        let second = ingestor.get_filepath(&mut tx, ids[1]).unwrap();
        assert_eq!(second.filepath_type, "raw_reverse_seqs");
    }

    #[test]
    fn test_subdirectory_layout_and_copy() {
        let fx = Fixture::new();
        let table = fx.incoming("otu_table.biom", b"{}");
        let ingestor = fx.ingestor();
        let mut tx = fx.db.transaction().unwrap();

        let ids = ingestor
            .insert_filepaths(
                &mut tx,
                &[(table.clone(), "biom".into())],
                5,
                Category::Biom,
                TransferMode::Copy,
            )
            .unwrap();
        assert!(table.exists());
        let stored = ingestor.get_filepath(&mut tx, ids[0]).unwrap();
        assert_eq!(stored.relative_path, "5/otu_table.biom");
        assert_eq!(stored.path, fx.temp.path().join("BIOM/5/otu_table.biom"));
        assert_eq!(
            ingestor.filepath_id_to_rel_path(&mut tx, ids[0]).unwrap(),
            PathBuf::from("BIOM/5/otu_table.biom")
        );
        assert_eq!(
            ingestor
                .get_filepath_id(&mut tx, Category::Biom, &stored.path)
                .unwrap(),
            ids[0]
        );
    }

    #[test]
    fn test_unknown_type_name_aborts_before_transfer() {
        let fx = Fixture::new();
        let a = fx.incoming("a.txt", b"alpha");
        let b = fx.incoming("b.txt", b"beta");
        let mut tx = fx.db.transaction().unwrap();
        let err = fx
            .ingestor()
            .insert_filepaths(
                &mut tx,
                &[(a.clone(), FiletypeRef::Id(1)), (b.clone(), "no_such_type".into())],
                3,
                Category::RawData,
                TransferMode::Move,
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::Lookup(_)));
        assert!(a.exists() && b.exists());
    }

    #[test]
    fn test_failed_insert_moves_files_back() {
        let fx = Fixture::new();
        let a = fx.incoming("a.txt", b"alpha");
        let b = fx.incoming("b.txt", b"beta");
        let mut tx = fx.db.transaction().unwrap();
        let err = fx
            .ingestor()
            .insert_filepaths(
                &mut tx,
                &[(a.clone(), FiletypeRef::Id(1)), (b.clone(), FiletypeRef::Id(999))],
                3,
                Category::RawData,
                TransferMode::Move,
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::StatementFailed { .. }));
        assert_eq!(fs::read(&a).unwrap(), b"alpha");
        assert_eq!(fs::read(&b).unwrap(), b"beta");
        assert!(!fx.temp.path().join("raw_data/3_a.txt").exists());
        assert!(fx.ingestor().list_filepaths(&mut tx).unwrap().is_empty());
    }

    #[test]
    fn test_collision_rolls_back_earlier_files_and_owner_dir() {
        let fx = Fixture::new();
        let first = fx.incoming("table.biom", b"1");
        let other_dir = fx.temp.path().join("elsewhere");
        fs::create_dir_all(&other_dir).unwrap();
        let second = other_dir.join("table.biom");
        fs::write(&second, b"2").unwrap();

        let mut tx = fx.db.transaction().unwrap();
        let err = fx
            .ingestor()
            .insert_filepaths(
                &mut tx,
                &[(first.clone(), FiletypeRef::Id(7)), (second.clone(), FiletypeRef::Id(7))],
                9,
                Category::Biom,
                TransferMode::Move,
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::Storage { .. }));
        assert!(first.exists() && second.exists());
        assert!(!fx.temp.path().join("BIOM/9").exists());
    }

    #[test]
    fn test_link_and_retrieve() {
        let fx = Fixture::new();
        let a = fx.incoming("a.fastq", b"@r1");
        let b = fx.incoming("b.fastq", b"@r2");
        let ingestor = fx.ingestor();
        let mut tx = fx.db.transaction().unwrap();
        let ids = ingestor
            .insert_filepaths(
                &mut tx,
                &[(a, "raw_forward_seqs".into()), (b, "raw_barcodes".into())],
                4,
                Category::RawData,
                TransferMode::Move,
            )
            .unwrap();
        ingestor
            .link_filepaths(&mut tx, OwnerKind::RawData, 4, &ids)
            .unwrap();

        let desc = ingestor
            .retrieve_filepaths(&mut tx, OwnerKind::RawData, 4, Some(SortOrder::Descending), None)
            .unwrap();
        assert_eq!(desc.iter().map(|f| f.id).collect::<Vec<_>>(), vec![ids[1], ids[0]]);

        let barcodes = ingestor
            .retrieve_filepaths(&mut tx, OwnerKind::RawData, 4, None, Some("raw_barcodes"))
            .unwrap();
        assert_eq!(barcodes.len(), 1);
        assert_eq!(barcodes[0].id, ids[1]);

        let paths = ingestor.filepath_ids_to_rel_paths(&mut tx, &ids).unwrap();
        assert_eq!(paths[&ids[0]], PathBuf::from("raw_data/4_a.fastq"));
    }

    #[test]
    fn test_filepath_type_conversion() {
        let fx = Fixture::new();
        let ingestor = fx.ingestor();
        let mut tx = fx.db.transaction().unwrap();
        assert_eq!(ingestor.convert_to_id(&mut tx, "biom").unwrap(), 7);
        assert_eq!(ingestor.convert_from_id(&mut tx, 13).unwrap(), "log");
        assert_eq!(ingestor.get_filepath_types(&mut tx).unwrap()["directory"], 8);
        assert!(matches!(
            ingestor.get_filepath_id(&mut tx, Category::RawData, Path::new("/nowhere")),
            Err(VaultError::Lookup(_))
        ));
    }
}
