//! Store schema, seed data and column validation
//!
//! The DDL below is the relational layout every other module talks to. Link
//! tables declare a foreign key into `filepath(filepath_id)`; that catalog
//! entry is what [`crate::links::LinkRegistry`] discovers, so a new owning
//! entity kind only needs a new table here.
//!
//! The column helpers read `pragma_table_info` and are used to validate
//! generic record writes before any statement is queued.

use crate::error::{Result, VaultError};
use crate::transaction::{as_i64, as_text, column, Transaction};
use rusqlite::types::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Version written to `settings` by [`initialize`]
pub const SCHEMA_VERSION: i64 = 1;

/// Checksum algorithm id of CRC-32
pub const CRC32_ALGORITHM_ID: i64 = 1;

/// Seeded filepath types, by stable id
pub const FILEPATH_TYPES: &[(i64, &str)] = &[
    (1, "raw_forward_seqs"),
    (2, "raw_reverse_seqs"),
    (3, "raw_barcodes"),
    (4, "preprocessed_fasta"),
    (5, "preprocessed_fastq"),
    (6, "preprocessed_demux"),
    (7, "biom"),
    (8, "directory"),
    (9, "plain_text"),
    (10, "reference_seqs"),
    (11, "reference_tax"),
    (12, "reference_tree"),
    (13, "log"),
    (14, "sample_template"),
    (15, "prep_template"),
    (16, "qiime_map"),
    (17, "html_summary"),
];

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_directory (
    data_directory_id INTEGER PRIMARY KEY AUTOINCREMENT,
    data_type TEXT NOT NULL,
    mountpoint TEXT NOT NULL,
    subdirectory INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_data_directory_one_active
    ON data_directory(data_type) WHERE active = 1;

CREATE TABLE IF NOT EXISTS filepath_type (
    filepath_type_id INTEGER PRIMARY KEY,
    filepath_type TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS checksum_algorithm (
    checksum_algorithm_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS filepath (
    filepath_id INTEGER PRIMARY KEY AUTOINCREMENT,
    filepath TEXT NOT NULL,
    filepath_type_id INTEGER NOT NULL REFERENCES filepath_type(filepath_type_id),
    checksum INTEGER NOT NULL,
    checksum_algorithm_id INTEGER NOT NULL REFERENCES checksum_algorithm(checksum_algorithm_id),
    data_directory_id INTEGER NOT NULL REFERENCES data_directory(data_directory_id)
);

CREATE TABLE IF NOT EXISTS study (
    study_id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'sandbox'
);

CREATE TABLE IF NOT EXISTS prep_template (
    prep_template_id INTEGER PRIMARY KEY,
    study_id INTEGER NOT NULL REFERENCES study(study_id),
    data_type TEXT NOT NULL DEFAULT '16S'
);

CREATE TABLE IF NOT EXISTS software_command (
    command_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifact (
    artifact_id INTEGER PRIMARY KEY,
    artifact_type TEXT NOT NULL,
    command_id INTEGER REFERENCES software_command(command_id),
    command_parameters TEXT,
    study_id INTEGER REFERENCES study(study_id)
);

CREATE TABLE IF NOT EXISTS parent_artifact (
    artifact_id INTEGER NOT NULL REFERENCES artifact(artifact_id),
    parent_id INTEGER NOT NULL REFERENCES artifact(artifact_id),
    PRIMARY KEY (artifact_id, parent_id)
);

CREATE TABLE IF NOT EXISTS preparation_artifact (
    prep_template_id INTEGER NOT NULL REFERENCES prep_template(prep_template_id),
    artifact_id INTEGER NOT NULL REFERENCES artifact(artifact_id),
    PRIMARY KEY (prep_template_id, artifact_id)
);

CREATE TABLE IF NOT EXISTS artifact_filepath (
    artifact_id INTEGER NOT NULL REFERENCES artifact(artifact_id),
    filepath_id INTEGER NOT NULL REFERENCES filepath(filepath_id),
    PRIMARY KEY (artifact_id, filepath_id)
);

CREATE TABLE IF NOT EXISTS raw_filepath (
    raw_data_id INTEGER NOT NULL,
    filepath_id INTEGER NOT NULL REFERENCES filepath(filepath_id),
    PRIMARY KEY (raw_data_id, filepath_id)
);

CREATE TABLE IF NOT EXISTS preprocessed_filepath (
    preprocessed_data_id INTEGER NOT NULL,
    filepath_id INTEGER NOT NULL REFERENCES filepath(filepath_id),
    PRIMARY KEY (preprocessed_data_id, filepath_id)
);

CREATE TABLE IF NOT EXISTS processed_filepath (
    processed_data_id INTEGER NOT NULL,
    filepath_id INTEGER NOT NULL REFERENCES filepath(filepath_id),
    PRIMARY KEY (processed_data_id, filepath_id)
);

CREATE TABLE IF NOT EXISTS job_results_filepath (
    job_id INTEGER NOT NULL,
    filepath_id INTEGER NOT NULL REFERENCES filepath(filepath_id),
    PRIMARY KEY (job_id, filepath_id)
);

CREATE TABLE IF NOT EXISTS analysis_filepath (
    analysis_id INTEGER NOT NULL,
    filepath_id INTEGER NOT NULL REFERENCES filepath(filepath_id),
    PRIMARY KEY (analysis_id, filepath_id)
);

CREATE TABLE IF NOT EXISTS sample_template_filepath (
    study_id INTEGER NOT NULL REFERENCES study(study_id),
    filepath_id INTEGER NOT NULL REFERENCES filepath(filepath_id),
    PRIMARY KEY (study_id, filepath_id)
);

CREATE TABLE IF NOT EXISTS prep_template_filepath (
    prep_template_id INTEGER NOT NULL REFERENCES prep_template(prep_template_id),
    filepath_id INTEGER NOT NULL REFERENCES filepath(filepath_id),
    PRIMARY KEY (prep_template_id, filepath_id)
);

CREATE TABLE IF NOT EXISTS reference (
    reference_id INTEGER PRIMARY KEY,
    reference_name TEXT NOT NULL,
    sequence_filepath INTEGER REFERENCES filepath(filepath_id),
    taxonomy_filepath INTEGER REFERENCES filepath(filepath_id),
    tree_filepath INTEGER REFERENCES filepath(filepath_id)
);
"#;

/// Create every table and seed the fixed vocabularies
///
/// Idempotent: running it on an initialized store changes nothing.
pub fn initialize(tx: &mut Transaction<'_>) -> Result<()> {
    tx.scope(|tx| {
        tx.execute_script(DDL)?;

        tx.add_many(
            "INSERT OR IGNORE INTO filepath_type (filepath_type_id, filepath_type) VALUES (?, ?)",
            FILEPATH_TYPES
                .iter()
                .map(|(id, name)| vec![Value::Integer(*id), Value::Text(name.to_string())])
                .collect(),
        )?;
        tx.add(
            "INSERT OR IGNORE INTO checksum_algorithm (checksum_algorithm_id, name) VALUES (?, 'crc32')",
            vec![Value::Integer(CRC32_ALGORITHM_ID)],
        )?;
        tx.add(
            "INSERT OR IGNORE INTO settings (key, value) VALUES ('schema_version', ?)",
            vec![Value::Text(SCHEMA_VERSION.to_string())],
        )?;
        tx.execute()?;
        info!("Schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    })
}

/// Run additional DDL and bump the schema version
///
/// Link registries built before the change report themselves stale.
pub fn migrate(tx: &mut Transaction<'_>, ddl: &str) -> Result<i64> {
    tx.scope(|tx| {
        tx.execute_script(ddl)?;
        let version = schema_version(tx)? + 1;
        tx.add(
            "UPDATE settings SET value = ? WHERE key = 'schema_version'",
            vec![Value::Text(version.to_string())],
        )?;
        tx.execute()?;
        debug!("Schema migrated to version {}", version);
        Ok(version)
    })
}

/// Schema version recorded in `settings`
pub fn schema_version(tx: &mut Transaction<'_>) -> Result<i64> {
    tx.scope(|tx| {
        tx.add(
            "SELECT value FROM settings WHERE key = 'schema_version'",
            vec![],
        )?;
        match tx.execute_fetchlast()? {
            Some(value) => as_text(&value)?
                .parse()
                .map_err(|_| VaultError::schema("schema_version setting is not a number")),
            None => Err(VaultError::schema("schema_version setting is missing")),
        }
    })
}

/// Whether `table` exists
pub fn exists_table(tx: &mut Transaction<'_>, table: &str) -> Result<bool> {
    tx.scope(|tx| {
        tx.add(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
            vec![Value::Text(table.to_string())],
        )?;
        match tx.execute_fetchlast()? {
            Some(value) => as_i64(&value).map(|v| v != 0),
            None => Ok(false),
        }
    })
}

/// Column names of `table`, in declaration order
///
/// # Errors
///
/// - [`VaultError::Schema`] if the table does not exist
pub fn get_table_cols(tx: &mut Transaction<'_>, table: &str) -> Result<Vec<String>> {
    Ok(table_info(tx, table)?
        .into_iter()
        .map(|column| column.name)
        .collect())
}

struct ColumnInfo {
    name: String,
    required: bool,
}

fn table_info(tx: &mut Transaction<'_>, table: &str) -> Result<Vec<ColumnInfo>> {
    tx.scope(|tx| {
        tx.add(
            "SELECT name, \"notnull\", dflt_value IS NULL, pk, upper(type) \
             FROM pragma_table_info(?) ORDER BY cid",
            vec![Value::Text(table.to_string())],
        )?;
        let rows = tx.execute_fetchindex()?;
        if rows.is_empty() {
            return Err(VaultError::schema(format!("table '{}' does not exist", table)));
        }
        let mut pk_count = 0;
        for row in &rows {
            if as_i64(column(row, 3)?)? > 0 {
                pk_count += 1;
            }
        }
        rows.iter()
            .map(|row| {
                let not_null = as_i64(column(row, 1)?)? != 0;
                let no_default = as_i64(column(row, 2)?)? != 0;
                let primary_key = as_i64(column(row, 3)?)? > 0;
                // a lone INTEGER PRIMARY KEY is the rowid and gets assigned
                let rowid_alias = primary_key && pk_count == 1 && as_text(column(row, 4)?)? == "INTEGER";
                Ok(ColumnInfo {
                    name: as_text(column(row, 0)?)?,
                    required: no_default && (not_null || primary_key) && !rowid_alias,
                })
            })
            .collect()
    })
}

/// Fail if any of `keys` is not a column of `table`
pub fn check_table_cols<'k, I>(tx: &mut Transaction<'_>, keys: I, table: &str) -> Result<()>
where
    I: IntoIterator<Item = &'k str>,
{
    let columns = get_table_cols(tx, table)?;
    let unknown: Vec<&str> = keys
        .into_iter()
        .filter(|key| !columns.iter().any(|c| c == key))
        .collect();
    if !unknown.is_empty() {
        return Err(VaultError::column(format!(
            "non-database keys for table '{}': {}",
            table,
            unknown.join(", ")
        )));
    }
    Ok(())
}

/// Fail if a NOT NULL column without default is absent from `keys`
pub fn check_required_columns<'k, I>(tx: &mut Transaction<'_>, keys: I, table: &str) -> Result<()>
where
    I: IntoIterator<Item = &'k str>,
{
    let keys: Vec<&str> = keys.into_iter().collect();
    let missing: Vec<String> = table_info(tx, table)?
        .into_iter()
        .filter(|column| column.required && !keys.contains(&column.name.as_str()))
        .map(|column| column.name)
        .collect();
    if !missing.is_empty() {
        return Err(VaultError::column(format!(
            "required columns missing for table '{}': {}",
            table,
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Insert one row into `table` after validating its columns
///
/// Returns the new row id.
pub fn insert_record(
    tx: &mut Transaction<'_>,
    table: &str,
    values: &BTreeMap<String, Value>,
) -> Result<i64> {
    tx.scope(|tx| {
        let keys = values.keys().map(String::as_str);
        check_table_cols(tx, keys.clone(), table)?;
        check_required_columns(tx, keys, table)?;

        let columns: Vec<String> = values.keys().map(|k| quote_ident(k)).collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING rowid",
            quote_ident(table),
            columns.join(", "),
            placeholders
        );
        tx.add(sql, values.values().cloned().collect())?;
        match tx.execute_fetchlast()? {
            Some(id) => as_i64(&id),
            None => Err(VaultError::internal(format!(
                "insert into '{}' returned no row id",
                table
            ))),
        }
    })
}

/// Quote an identifier for interpolation into SQL text
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fixed vocabularies whose rows map a stable id to a name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    /// `filepath_type`
    FilepathType,
    /// `checksum_algorithm`
    ChecksumAlgorithm,
}

impl Vocabulary {
    fn table(&self) -> &'static str {
        match self {
            Vocabulary::FilepathType => "filepath_type",
            Vocabulary::ChecksumAlgorithm => "checksum_algorithm",
        }
    }

    fn id_column(&self) -> &'static str {
        match self {
            Vocabulary::FilepathType => "filepath_type_id",
            Vocabulary::ChecksumAlgorithm => "checksum_algorithm_id",
        }
    }

    fn text_column(&self) -> &'static str {
        match self {
            Vocabulary::FilepathType => "filepath_type",
            Vocabulary::ChecksumAlgorithm => "name",
        }
    }
}

/// Stable id of `value` in `vocabulary`
///
/// # Errors
///
/// - [`VaultError::Lookup`] if the value is unknown
pub fn convert_to_id(tx: &mut Transaction<'_>, vocabulary: Vocabulary, value: &str) -> Result<i64> {
    tx.scope(|tx| {
        tx.add(
            format!(
                "SELECT {} FROM {} WHERE {} = ?",
                vocabulary.id_column(),
                vocabulary.table(),
                vocabulary.text_column()
            ),
            vec![Value::Text(value.to_string())],
        )?;
        match tx.execute_fetchlast()? {
            Some(id) => as_i64(&id),
            None => Err(VaultError::lookup(format!(
                "{} not found in {}",
                value,
                vocabulary.table()
            ))),
        }
    })
}

/// Name of stable id `id` in `vocabulary`
///
/// # Errors
///
/// - [`VaultError::Lookup`] if the id is unknown
pub fn convert_from_id(tx: &mut Transaction<'_>, vocabulary: Vocabulary, id: i64) -> Result<String> {
    tx.scope(|tx| {
        tx.add(
            format!(
                "SELECT {} FROM {} WHERE {} = ?",
                vocabulary.text_column(),
                vocabulary.table(),
                vocabulary.id_column()
            ),
            vec![Value::Integer(id)],
        )?;
        match tx.execute_fetchlast()? {
            Some(name) => as_text(&name),
            None => Err(VaultError::lookup(format!(
                "id {} not found in {}",
                id,
                vocabulary.table()
            ))),
        }
    })
}

/// Every `(name, id)` pair of `vocabulary`
pub fn vocabulary_map(tx: &mut Transaction<'_>, vocabulary: Vocabulary) -> Result<BTreeMap<String, i64>> {
    tx.scope(|tx| {
        tx.add(
            format!(
                "SELECT {}, {} FROM {}",
                vocabulary.text_column(),
                vocabulary.id_column(),
                vocabulary.table()
            ),
            vec![],
        )?;
        tx.execute_fetchindex()?
            .iter()
            .map(|row| Ok((as_text(column(row, 0)?)?, as_i64(column(row, 1)?)?)))
            .collect()
    })
}
