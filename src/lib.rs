//! # labvault - Transactional filepath storage
//!
//! Keeps a relational catalog of stored files and the files themselves in
//! lockstep, for data platforms where every uploaded or generated file is
//! owned by some entity (raw data, an artifact, a study's metadata template).
//!
//! ## Overview
//!
//! The database transaction is the unit of consistency, and the filesystem,
//! which has none, is brought along through compensating actions:
//!
//! - a file moved into storage during a transaction is moved back if the
//!   transaction rolls back;
//! - a file whose row is deleted is removed only after the delete commits.
//!
//! On top of that primitive the crate provides versioned storage roots per
//! file category, atomic multi-file ingestion with CRC-32 checksums, an
//! orphan collector driven by the store's foreign-key catalog, and a release
//! bundler exporting processed tables with their metadata.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use labvault::{Category, FiletypeRef, OwnerKind, TransferMode, Vault};
//! use std::path::PathBuf;
//!
//! # fn main() -> labvault::Result<()> {
//! let vault = Vault::init(PathBuf::from("/data/labvault"))?;
//!
//! let ids = vault.ingest(
//!     &[
//!         (PathBuf::from("/incoming/a.txt"), FiletypeRef::Id(1)),
//!         (PathBuf::from("/incoming/b.txt"), FiletypeRef::Id(2)),
//!     ],
//!     OwnerKind::RawData,
//!     3,
//!     Category::RawData,
//!     TransferMode::Move,
//! )?;
//! println!("Stored at {:?}", vault.locate(ids[0])?.path);
//!
//! let report = vault.purge_filepaths(true)?;
//! println!("Removed {} orphaned filepaths", report.rows_deleted);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`transaction`]: statement queue with post-commit and post-rollback hooks
//! - [`compensation`]: filesystem actions and their inverses
//! - [`mountpoint`]: storage generations per category
//! - [`ingest`]: moving files into storage and resolving them back
//! - [`collector`]: orphaned filepath collection and trash emptying
//! - [`uploads`]: per-study upload folders
//! - [`release`]: release archives and manifests
//! - [`verification`]: checksum verification of stored files
//! - [`links`]: discovery of every table referencing a filepath
//! - [`schema`]: store layout, vocabularies and column validation
//! - [`vault`]: the facade tying the above to one storage base

pub mod collector;
pub mod compensation;
pub mod config;
pub mod database;
pub mod error;
pub mod ingest;
pub mod links;
pub mod mountpoint;
pub mod release;
pub mod schema;
pub mod transaction;
pub mod types;
pub mod uploads;
pub mod utils;
pub mod vault;
pub mod verification;

pub use collector::OrphanCollector;
pub use compensation::FsAction;
pub use config::VaultConfig;
pub use database::Database;
pub use error::{ErrorKind, Result, VaultError};
pub use ingest::FilepathIngestor;
pub use links::LinkRegistry;
pub use mountpoint::MountpointRegistry;
pub use release::ReleaseBundler;
pub use transaction::{Transaction, TransactionStatus};
pub use types::*;
pub use uploads::UploadManager;
pub use vault::{Vault, VaultBuilder};
pub use verification::{FileVerification, FilepathVerifier, VerificationReport};
