//! Mountpoint and storage-generation registry
//!
//! A category (raw data, uploads, BIOM tables, ...) is served by one or more
//! *generations*: physical root directories recorded relative to the storage
//! base. Exactly one generation per category is active and receives new
//! files; inactive generations stay resolvable so files written under them
//! remain addressable after storage is relocated. Every filepath row records
//! the generation it was written under.
//!
//! The "one active generation per category" invariant is enforced twice: by
//! [`MountpointRegistry::activate`] deactivating the previous generation in the
//! same transaction, and by a partial unique index in the schema.

use crate::compensation::FsAction;
use crate::error::{Result, VaultError};
use crate::transaction::{as_bool, as_i64, as_text, column, Row, Transaction};
use crate::types::{Category, Mountpoint};
use crate::utils;
use rusqlite::types::Value;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, instrument};

const SELECT_MOUNTPOINT: &str =
    "SELECT data_directory_id, data_type, mountpoint, subdirectory, active FROM data_directory";

/// Resolves categories and generation ids to physical roots
#[derive(Debug, Clone, Copy)]
pub struct MountpointRegistry<'a> {
    base_dir: &'a Path,
}

impl<'a> MountpointRegistry<'a> {
    /// Registry resolving roots against `base_dir`
    pub fn new(base_dir: &'a Path) -> Self {
        Self { base_dir }
    }

    /// Storage base every root is relative to
    pub fn base_dir(&self) -> &Path {
        self.base_dir
    }

    /// Generations of `category`
    ///
    /// Without `retrieve_all` only the active generation is returned. With it,
    /// the active generation comes first, followed by every inactive one,
    /// most recently created first.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Lookup`] if the category has no matching generation
    pub fn resolve(
        &self,
        tx: &mut Transaction<'_>,
        category: Category,
        retrieve_all: bool,
    ) -> Result<Vec<Mountpoint>> {
        let filter = if retrieve_all { "" } else { " AND active = 1" };
        let sql = format!(
            "{} WHERE data_type = ?{} ORDER BY active DESC, data_directory_id DESC",
            SELECT_MOUNTPOINT, filter
        );
        let rows = tx.scope(|tx| {
            tx.add(sql, vec![Value::Text(category.as_str().to_string())])?;
            tx.execute_fetchindex()
        })?;
        if rows.is_empty() {
            let which = if retrieve_all { "" } else { "active " };
            return Err(VaultError::lookup(format!(
                "no {}mountpoint for category '{}'",
                which, category
            )));
        }
        rows.iter().map(|row| self.parse_row(row)).collect()
    }

    /// The active generation of `category`
    pub fn resolve_active(&self, tx: &mut Transaction<'_>, category: Category) -> Result<Mountpoint> {
        let mut mountpoints = self.resolve(tx, category, false)?;
        Ok(mountpoints.remove(0))
    }

    /// Absolute root of generation `id`
    pub fn resolve_by_id(&self, tx: &mut Transaction<'_>, id: i64) -> Result<PathBuf> {
        Ok(self.get(tx, id)?.root)
    }

    /// Full record of generation `id`
    ///
    /// # Errors
    ///
    /// - [`VaultError::Lookup`] if no generation has this id
    pub fn get(&self, tx: &mut Transaction<'_>, id: i64) -> Result<Mountpoint> {
        let rows = tx.scope(|tx| {
            tx.add(
                format!("{} WHERE data_directory_id = ?", SELECT_MOUNTPOINT),
                vec![Value::Integer(id)],
            )?;
            tx.execute_fetchindex()
        })?;
        match rows.first() {
            Some(row) => self.parse_row(row),
            None => Err(VaultError::lookup(format!("mountpoint {} does not exist", id))),
        }
    }

    /// Every generation of every category
    pub fn list(&self, tx: &mut Transaction<'_>) -> Result<Vec<Mountpoint>> {
        let rows = tx.scope(|tx| {
            tx.add(
                format!(
                    "{} ORDER BY data_type, active DESC, data_directory_id DESC",
                    SELECT_MOUNTPOINT
                ),
                vec![],
            )?;
            tx.execute_fetchindex()
        })?;
        rows.iter().map(|row| self.parse_row(row)).collect()
    }

    /// Register a new generation
    ///
    /// The root directory is created if missing (and removed again if the
    /// transaction rolls back). When `active` is set the previous active
    /// generation of the category is deactivated.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Storage`] if `relative_root` escapes the storage base
    #[instrument(skip(self, tx))]
    pub fn create(
        &self,
        tx: &mut Transaction<'_>,
        category: Category,
        relative_root: &Path,
        subdirectory: bool,
        active: bool,
    ) -> Result<Mountpoint> {
        if relative_root.as_os_str().is_empty()
            || relative_root
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(VaultError::storage(
                relative_root,
                "mountpoint root must be a plain path relative to the storage base",
            ));
        }
        let stored_root = utils::path_to_db_text(relative_root)?;

        tx.scope(|tx| {
            let root = self.base_dir.join(relative_root);
            if !root.exists() {
                fs::create_dir_all(&root)?;
                tx.add_post_rollback_action(FsAction::RemoveDirIfEmpty(root.clone()))?;
            }

            if active {
                self.deactivate_category(tx, category)?;
            }
            tx.add(
                "INSERT INTO data_directory (data_type, mountpoint, subdirectory, active) \
                 VALUES (?, ?, ?, ?) RETURNING data_directory_id",
                vec![
                    Value::Text(category.as_str().to_string()),
                    Value::Text(stored_root.clone()),
                    Value::Integer(subdirectory as i64),
                    Value::Integer(active as i64),
                ],
            )?;
            let id = match tx.execute_fetchlast()? {
                Some(id) => as_i64(&id)?,
                None => return Err(VaultError::internal("mountpoint insert returned no id")),
            };
            info!("Registered mountpoint {} for {} at {:?}", id, category, root);
            Ok(Mountpoint {
                id,
                category,
                root,
                relative_root: PathBuf::from(&stored_root),
                subdirectory,
                active,
            })
        })
    }

    /// Make generation `id` the active one of its category
    #[instrument(skip(self, tx))]
    pub fn activate(&self, tx: &mut Transaction<'_>, id: i64) -> Result<Mountpoint> {
        tx.scope(|tx| {
            let mut mountpoint = self.get(tx, id)?;
            if mountpoint.active {
                return Ok(mountpoint);
            }
            self.deactivate_category(tx, mountpoint.category)?;
            tx.add(
                "UPDATE data_directory SET active = 1 WHERE data_directory_id = ?",
                vec![Value::Integer(id)],
            )?;
            tx.execute()?;
            mountpoint.active = true;
            info!("Mountpoint {} is now active for {}", id, mountpoint.category);
            Ok(mountpoint)
        })
    }

    /// Create a default active generation for every category that has none
    pub fn seed_defaults(&self, tx: &mut Transaction<'_>) -> Result<Vec<Mountpoint>> {
        tx.scope(|tx| {
            let mut created = Vec::new();
            for category in Category::ALL {
                tx.add(
                    "SELECT COUNT(*) FROM data_directory WHERE data_type = ?",
                    vec![Value::Text(category.as_str().to_string())],
                )?;
                let existing = match tx.execute_fetchlast()? {
                    Some(count) => as_i64(&count)?,
                    None => 0,
                };
                if existing == 0 {
                    created.push(self.create(
                        tx,
                        category,
                        Path::new(category.as_str()),
                        category.default_subdirectory(),
                        true,
                    )?);
                }
            }
            debug!("Seeded {} default mountpoints", created.len());
            Ok(created)
        })
    }

    fn deactivate_category(&self, tx: &mut Transaction<'_>, category: Category) -> Result<()> {
        tx.add(
            "UPDATE data_directory SET active = 0 WHERE data_type = ? AND active = 1",
            vec![Value::Text(category.as_str().to_string())],
        )
    }

    fn parse_row(&self, row: &Row) -> Result<Mountpoint> {
        let relative_root = PathBuf::from(as_text(column(row, 2)?)?);
        Ok(Mountpoint {
            id: as_i64(column(row, 0)?)?,
            category: as_text(column(row, 1)?)?.parse()?,
            root: self.base_dir.join(&relative_root),
            relative_root,
            subdirectory: as_bool(column(row, 3)?)?,
            active: as_bool(column(row, 4)?)?,
        })
    }
}
