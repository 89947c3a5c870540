//! Versioned registry of filepath link tables
//!
//! Which tables hold references to `filepath` is not hard-coded: the registry
//! is populated from the store's own foreign-key catalog, so an owning entity
//! kind introduced later (a new `*_filepath` table, or a nullable reference
//! column on some other table) is picked up without code changes.
//!
//! The registry is the single source of truth for both sides of the
//! reference count:
//!
//! - ingestion asks it where to write the link row of an [`OwnerKind`];
//! - orphan collection asks it for every referencing `(table, column)` pair.
//!
//! It records the schema version it was discovered under. Consumers that must
//! not act on a stale view (the collector) compare it with the store's
//! current version first.

use crate::error::{Result, VaultError};
use crate::schema;
use crate::transaction::{as_text, column, Transaction};
use crate::types::OwnerKind;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A `(table, column)` pair holding a foreign key into `filepath`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ReferenceColumn {
    /// Referencing table
    pub table: String,
    /// Referencing column
    pub column: String,
}

/// Link table of one owner kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkTable {
    /// Table name
    pub table: String,
    /// Column holding the owner id
    pub owner_column: String,
    /// Column holding the filepath id
    pub filepath_column: String,
}

/// Discovered layout of every filepath reference in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkRegistry {
    version: i64,
    owners: BTreeMap<OwnerKind, LinkTable>,
    references: Vec<ReferenceColumn>,
}

impl LinkRegistry {
    /// Read the foreign-key catalog
    ///
    /// # Errors
    ///
    /// - [`VaultError::Schema`] if an owner kind's link table exists but
    ///   lacks its owner column, or the schema version is missing
    pub fn discover(tx: &mut Transaction<'_>) -> Result<Self> {
        let references = tx.scope(|tx| {
            tx.add(
                "SELECT m.name, p.\"from\" \
                 FROM sqlite_master AS m \
                 JOIN pragma_foreign_key_list(m.name) AS p \
                 WHERE m.type = 'table' \
                   AND lower(p.\"table\") = 'filepath' \
                   AND (p.\"to\" IS NULL OR p.\"to\" = 'filepath_id') \
                 ORDER BY m.name, p.\"from\"",
                vec![],
            )?;
            tx.execute_fetchindex()?
                .iter()
                .map(|row| {
                    Ok(ReferenceColumn {
                        table: as_text(column(row, 0)?)?,
                        column: as_text(column(row, 1)?)?,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut owners = BTreeMap::new();
        for kind in OwnerKind::ALL {
            let Some(reference) = references.iter().find(|r| r.table == kind.link_table()) else {
                debug!("No link table for owner kind {}", kind);
                continue;
            };
            let columns = schema::get_table_cols(tx, &reference.table)?;
            if !columns.iter().any(|c| c == kind.owner_column()) {
                return Err(VaultError::schema(format!(
                    "link table '{}' has no owner column '{}'",
                    reference.table,
                    kind.owner_column()
                )));
            }
            owners.insert(
                kind,
                LinkTable {
                    table: reference.table.clone(),
                    owner_column: kind.owner_column().to_string(),
                    filepath_column: reference.column.clone(),
                },
            );
        }

        let version = schema::schema_version(tx)?;
        info!(
            "Discovered {} filepath references ({} owner link tables) at schema version {}",
            references.len(),
            owners.len(),
            version
        );
        Ok(Self {
            version,
            owners,
            references,
        })
    }

    /// Schema version this registry was discovered under
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Link table of `kind`
    ///
    /// # Errors
    ///
    /// - [`VaultError::Lookup`] if the store has no link table for the kind
    pub fn link_table(&self, kind: OwnerKind) -> Result<&LinkTable> {
        self.owners.get(&kind).ok_or_else(|| {
            VaultError::lookup(format!("no link table registered for owner kind '{}'", kind))
        })
    }

    /// Every owner link table
    pub fn owner_tables(&self) -> impl Iterator<Item = (OwnerKind, &LinkTable)> {
        self.owners.iter().map(|(kind, table)| (*kind, table))
    }

    /// Every column referencing `filepath`, link tables included
    pub fn reference_columns(&self) -> &[ReferenceColumn] {
        &self.references
    }

    /// Whether the store schema changed since discovery
    pub fn is_stale(&self, tx: &mut Transaction<'_>) -> Result<bool> {
        Ok(schema::schema_version(tx)? != self.version)
    }

    /// Fail with a schema error if the registry is stale
    pub fn ensure_current(&self, tx: &mut Transaction<'_>) -> Result<()> {
        let current = schema::schema_version(tx)?;
        if current != self.version {
            return Err(VaultError::schema(format!(
                "link registry was discovered at schema version {} but the store is at {}; refresh it",
                self.version, current
            )));
        }
        Ok(())
    }
}
