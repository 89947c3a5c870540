//! Core types and data structures for labvault
//!
//! Closed enumerations replace the free-form strings the store uses for
//! storage categories and owning-entity kinds; they are validated once at the
//! boundary ([`std::str::FromStr`]) so a typo never reaches a SQL statement.
//! The remaining types are the records and reports returned by the
//! components.

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Logical storage category served by one or more mountpoint generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Raw sequencing data
    RawData,
    /// Output of preprocessing steps
    PreprocessedData,
    /// Output of processing steps
    ProcessedData,
    /// BIOM tables produced by processing commands
    Biom,
    /// Analysis results
    Analysis,
    /// Job outputs
    Job,
    /// Reference databases
    Reference,
    /// Metadata templates
    Templates,
    /// User upload area, one folder per study
    Uploads,
    /// Scratch space for jobs and releases
    WorkingDir,
}

impl Category {
    /// All categories, in seeding order
    pub const ALL: [Category; 10] = [
        Category::RawData,
        Category::PreprocessedData,
        Category::ProcessedData,
        Category::Biom,
        Category::Analysis,
        Category::Job,
        Category::Reference,
        Category::Templates,
        Category::Uploads,
        Category::WorkingDir,
    ];

    /// Name stored in the `data_directory.data_type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::RawData => "raw_data",
            Category::PreprocessedData => "preprocessed_data",
            Category::ProcessedData => "processed_data",
            Category::Biom => "BIOM",
            Category::Analysis => "analysis",
            Category::Job => "job",
            Category::Reference => "reference",
            Category::Templates => "templates",
            Category::Uploads => "uploads",
            Category::WorkingDir => "working_dir",
        }
    }

    /// Whether the default generation stores files under `root/<owner_id>/`
    pub fn default_subdirectory(&self) -> bool {
        matches!(self, Category::Biom | Category::Analysis)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| VaultError::lookup(format!("unknown storage category '{}'", s)))
    }
}

/// Kind of entity that can own filepaths through a link table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    /// Artifacts (any processing output)
    Artifact,
    /// Raw data
    RawData,
    /// Preprocessed data
    PreprocessedData,
    /// Processed data
    ProcessedData,
    /// Job results
    Job,
    /// Analyses
    Analysis,
    /// Sample metadata templates, owned by a study
    SampleTemplate,
    /// Preparation metadata templates
    PrepTemplate,
}

impl OwnerKind {
    /// All owner kinds
    pub const ALL: [OwnerKind; 8] = [
        OwnerKind::Artifact,
        OwnerKind::RawData,
        OwnerKind::PreprocessedData,
        OwnerKind::ProcessedData,
        OwnerKind::Job,
        OwnerKind::Analysis,
        OwnerKind::SampleTemplate,
        OwnerKind::PrepTemplate,
    ];

    /// Boundary name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Artifact => "artifact",
            OwnerKind::RawData => "raw_data",
            OwnerKind::PreprocessedData => "preprocessed_data",
            OwnerKind::ProcessedData => "processed_data",
            OwnerKind::Job => "job",
            OwnerKind::Analysis => "analysis",
            OwnerKind::SampleTemplate => "sample_template",
            OwnerKind::PrepTemplate => "prep_template",
        }
    }

    /// Link table this kind writes its ownership rows to
    pub fn link_table(&self) -> &'static str {
        match self {
            OwnerKind::Artifact => "artifact_filepath",
            OwnerKind::RawData => "raw_filepath",
            OwnerKind::PreprocessedData => "preprocessed_filepath",
            OwnerKind::ProcessedData => "processed_filepath",
            OwnerKind::Job => "job_results_filepath",
            OwnerKind::Analysis => "analysis_filepath",
            OwnerKind::SampleTemplate => "sample_template_filepath",
            OwnerKind::PrepTemplate => "prep_template_filepath",
        }
    }

    /// Column of the link table holding the owner id
    pub fn owner_column(&self) -> &'static str {
        match self {
            OwnerKind::Artifact => "artifact_id",
            OwnerKind::RawData => "raw_data_id",
            OwnerKind::PreprocessedData => "preprocessed_data_id",
            OwnerKind::ProcessedData => "processed_data_id",
            OwnerKind::Job => "job_id",
            OwnerKind::Analysis => "analysis_id",
            OwnerKind::SampleTemplate => "study_id",
            OwnerKind::PrepTemplate => "prep_template_id",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnerKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        OwnerKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| VaultError::lookup(format!("unknown owner kind '{}'", s)))
    }
}

/// Study visibility level used to select release content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Publicly visible studies
    Public,
    /// Private studies
    Private,
    /// Studies still being set up
    Sandbox,
}

impl Visibility {
    /// Value stored in `study.status`
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            "sandbox" => Ok(Visibility::Sandbox),
            other => Err(VaultError::lookup(format!("unknown visibility '{}'", other))),
        }
    }
}

/// How an incoming file reaches managed storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferMode {
    /// Rename into place; the source disappears
    #[default]
    Move,
    /// Copy into place; the source is left untouched
    Copy,
}

/// Filepath type given either as its stable id or its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiletypeRef {
    /// Stable `filepath_type_id`
    Id(i64),
    /// Human-readable type name, resolved through the store
    Name(String),
}

impl From<i64> for FiletypeRef {
    fn from(id: i64) -> Self {
        FiletypeRef::Id(id)
    }
}

impl From<&str> for FiletypeRef {
    fn from(name: &str) -> Self {
        FiletypeRef::Name(name.to_string())
    }
}

impl From<String> for FiletypeRef {
    fn from(name: String) -> Self {
        FiletypeRef::Name(name)
    }
}

/// Ordering of filepaths returned for an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest filepath id first
    Ascending,
    /// Newest filepath id first
    Descending,
}

/// One storage generation of a category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mountpoint {
    /// Generation id (`data_directory_id`)
    pub id: i64,
    /// Category served
    pub category: Category,
    /// Absolute root directory
    pub root: PathBuf,
    /// Root relative to the storage base, as stored
    pub relative_root: PathBuf,
    /// Whether files live under `root/<owner_id>/`
    pub subdirectory: bool,
    /// Whether this is the generation new files are written to
    pub active: bool,
}

/// A stored filepath row, resolved to its absolute location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFilepath {
    /// Filepath id
    pub id: i64,
    /// Absolute path on disk
    pub path: PathBuf,
    /// Path relative to the mountpoint root, as stored
    pub relative_path: String,
    /// Type name
    pub filepath_type: String,
    /// CRC-32 of the content at ingestion time
    pub checksum: u32,
    /// Generation the file was written under
    pub mountpoint_id: i64,
}

/// A post-commit or post-rollback hook that failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookFailure {
    /// Label describing the side effect
    pub label: String,
    /// Error text
    pub message: String,
}

/// An unreferenced filepath row found by the collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedFilepath {
    /// Filepath id
    pub id: i64,
    /// Absolute path of the physical file or directory
    pub path: PathBuf,
    /// Whether the physical path existed at collection time
    pub exists: bool,
}

/// Result of an orphan collection run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurgeReport {
    /// Number of filepath rows examined
    pub rows_examined: usize,
    /// Unreferenced rows found
    pub orphans: Vec<OrphanedFilepath>,
    /// Rows actually deleted (0 on a dry run)
    pub rows_deleted: usize,
    /// Physical paths scheduled for post-commit deletion
    pub files_scheduled: usize,
    /// Orphans whose physical path was already gone
    pub files_missing: usize,
    /// Deletions that failed after commit
    pub hook_failures: Vec<HookFailure>,
    /// Whether this was a dry run
    pub dry_run: bool,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

/// Result of emptying the upload trash folders
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrashReport {
    /// Files found in trash folders
    pub files: Vec<PathBuf>,
    /// Whether this was a dry run
    pub dry_run: bool,
    /// Deletions that failed after commit
    pub hook_failures: Vec<HookFailure>,
}

/// One manifest row of a release bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    /// Output file, relative to the storage base
    pub biom_fp: PathBuf,
    /// Sample metadata file, relative to the storage base
    pub sample_fp: PathBuf,
    /// Preparation metadata file, relative to the storage base
    pub prep_fp: PathBuf,
    /// Artifact the output belongs to
    pub artifact_id: i64,
    /// Provenance label
    pub command: String,
}

/// A written release bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseBundle {
    /// Compressed archive
    pub archive_path: PathBuf,
    /// Tab-separated manifest
    pub manifest_path: PathBuf,
    /// Manifest rows, in file order
    pub entries: Vec<ReleaseEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trip_names() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        }
        assert_eq!("BIOM".parse::<Category>().unwrap(), Category::Biom);
    }

    #[test]
    fn test_unknown_category_is_lookup_error() {
        let err = "raw-data".parse::<Category>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Lookup);
    }

    #[test]
    fn test_owner_kind_link_tables_are_distinct() {
        let mut tables: Vec<_> = OwnerKind::ALL.iter().map(|k| k.link_table()).collect();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), OwnerKind::ALL.len());
    }
}
