//! Vault facade
//!
//! A [`Vault`] ties one storage base directory to its database and hands out
//! the components that operate on them. Each component borrows the vault's
//! base directory and shares the vault's [`LinkRegistry`]; every operation
//! takes the [`Transaction`] it runs in, so callers can group several
//! operations into one atomic scope:
//!
//! ```rust,no_run
//! use labvault::{Category, FiletypeRef, OwnerKind, TransferMode, Vault};
//! use std::path::PathBuf;
//!
//! # fn main() -> labvault::Result<()> {
//! let vault = Vault::open(PathBuf::from("/data/labvault"))?;
//! let ingestor = vault.ingestor();
//! let mut tx = vault.transaction()?;
//! tx.scope(|tx| {
//!     let ids = ingestor.insert_filepaths(
//!         tx,
//!         &[(PathBuf::from("/incoming/seqs.fastq"), FiletypeRef::from("raw_forward_seqs"))],
//!         3,
//!         Category::RawData,
//!         TransferMode::Move,
//!     )?;
//!     ingestor.link_filepaths(tx, OwnerKind::RawData, 3, &ids)
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! The convenience methods on [`Vault`] each run in a transaction of their
//! own.

use crate::collector::OrphanCollector;
use crate::config::VaultConfig;
use crate::database::Database;
use crate::error::{Result, VaultError};
use crate::ingest::FilepathIngestor;
use crate::links::LinkRegistry;
use crate::mountpoint::MountpointRegistry;
use crate::release::ReleaseBundler;
use crate::schema;
use crate::transaction::Transaction;
use crate::types::{
    Category, FiletypeRef, Mountpoint, OwnerKind, PurgeReport, ReleaseBundle, StoredFilepath,
    TransferMode, TrashReport, Visibility,
};
use crate::uploads::UploadManager;
use crate::verification::{FileVerification, FilepathVerifier, VerificationReport};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Storage base, database and link registry of one deployment
pub struct Vault {
    config: VaultConfig,
    db: Database,
    links: RwLock<Arc<LinkRegistry>>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("config", &self.config)
            .field("db", &self.db)
            .field("links_version", &self.links.read().version())
            .finish()
    }
}

impl Vault {
    /// Initialize a vault under `base_data_dir` with default settings
    ///
    /// Creates the directory, the database and the schema, and registers a
    /// default generation for every category. Initializing an existing vault
    /// is harmless.
    pub fn init(base_data_dir: PathBuf) -> Result<Self> {
        VaultBuilder::new().init(VaultConfig::new(base_data_dir))
    }

    /// Open an initialized vault under `base_data_dir`
    ///
    /// # Errors
    ///
    /// - [`VaultError::StorageNotInitialized`] if there is no database or it
    ///   has no schema
    pub fn open(base_data_dir: PathBuf) -> Result<Self> {
        Self::open_with_config(VaultConfig::new(base_data_dir))
    }

    /// Open an initialized vault described by `config`
    #[instrument(skip(config), fields(base = ?config.base_data_dir))]
    pub fn open_with_config(config: VaultConfig) -> Result<Self> {
        config.validate()?;
        if !config.database_path.exists() {
            return Err(VaultError::StorageNotInitialized(config.database_path.clone()));
        }
        let db = Database::open(
            &config.database_path,
            Duration::from_millis(config.lock_timeout_ms),
        )?;
        let links = {
            let mut tx = db.transaction()?;
            let initialized = tx.scope(|tx| schema::exists_table(tx, "settings"))?;
            if !initialized {
                return Err(VaultError::StorageNotInitialized(config.database_path.clone()));
            }
            LinkRegistry::discover(&mut tx)?
        };
        info!("Opened vault at {:?}", config.base_data_dir);
        Ok(Self {
            config,
            db,
            links: RwLock::new(Arc::new(links)),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Storage base directory
    pub fn base_dir(&self) -> &Path {
        &self.config.base_data_dir
    }

    /// Start a transaction context on the vault's database
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        self.db.transaction()
    }

    /// Current link registry
    pub fn links(&self) -> Arc<LinkRegistry> {
        self.links.read().clone()
    }

    /// Re-read the link registry after a schema change
    pub fn refresh_link_registry(&self) -> Result<Arc<LinkRegistry>> {
        let mut tx = self.transaction()?;
        let fresh = Arc::new(LinkRegistry::discover(&mut tx)?);
        *self.links.write() = fresh.clone();
        debug!("Link registry refreshed at schema version {}", fresh.version());
        Ok(fresh)
    }

    /// Apply a schema migration and refresh the link registry
    pub fn migrate(&self, ddl: &str) -> Result<i64> {
        let version = {
            let mut tx = self.transaction()?;
            schema::migrate(&mut tx, ddl)?
        };
        self.refresh_link_registry()?;
        Ok(version)
    }

    /// Mountpoint registry
    pub fn mountpoints(&self) -> MountpointRegistry<'_> {
        MountpointRegistry::new(self.base_dir())
    }

    /// File ingestor
    pub fn ingestor(&self) -> FilepathIngestor<'_> {
        FilepathIngestor::new(self.base_dir(), self.links())
    }

    /// Orphan collector
    pub fn collector(&self) -> OrphanCollector<'_> {
        OrphanCollector::new(self.base_dir(), self.links())
    }

    /// Upload folder manager
    pub fn uploads(&self) -> UploadManager<'_> {
        UploadManager::new(self.base_dir(), self.links())
    }

    /// Checksum verifier
    pub fn verifier(&self) -> FilepathVerifier<'_> {
        FilepathVerifier::new(self.base_dir(), self.links())
    }

    /// Release bundler writing to the configured releases directory
    pub fn release_bundler(&self) -> ReleaseBundler<'_> {
        ReleaseBundler::new(
            self.base_dir(),
            self.links(),
            self.config.releases_dir(),
            self.config.portal.clone(),
        )
    }

    /// Ingest `files` and link them to their owner in one transaction
    pub fn ingest(
        &self,
        files: &[(PathBuf, FiletypeRef)],
        kind: OwnerKind,
        owner_id: i64,
        category: Category,
        mode: TransferMode,
    ) -> Result<Vec<i64>> {
        let ingestor = self.ingestor();
        let mut tx = self.transaction()?;
        tx.scope(|tx| {
            let ids = ingestor.insert_filepaths(tx, files, owner_id, category, mode)?;
            ingestor.link_filepaths(tx, kind, owner_id, &ids)?;
            Ok(ids)
        })
    }

    /// Stored filepath by id
    pub fn locate(&self, filepath_id: i64) -> Result<StoredFilepath> {
        let mut tx = self.transaction()?;
        self.ingestor().get_filepath(&mut tx, filepath_id)
    }

    /// Every generation of every category
    pub fn list_mountpoints(&self) -> Result<Vec<Mountpoint>> {
        let mut tx = self.transaction()?;
        self.mountpoints().list(&mut tx)
    }

    /// Register a new generation
    pub fn add_mountpoint(
        &self,
        category: Category,
        relative_root: &Path,
        subdirectory: bool,
        active: bool,
    ) -> Result<Mountpoint> {
        let mut tx = self.transaction()?;
        self.mountpoints()
            .create(&mut tx, category, relative_root, subdirectory, active)
    }

    /// Make a generation the active one of its category
    pub fn activate_mountpoint(&self, id: i64) -> Result<Mountpoint> {
        let mut tx = self.transaction()?;
        self.mountpoints().activate(&mut tx, id)
    }

    /// Collect orphaned filepaths; see [`OrphanCollector::purge_filepaths`]
    pub fn purge_filepaths(&self, delete_files: bool) -> Result<PurgeReport> {
        let mut tx = self.transaction()?;
        self.collector().purge_filepaths(&mut tx, delete_files)
    }

    /// Empty the upload trash folders
    pub fn empty_trash_upload_folder(&self, delete_files: bool) -> Result<TrashReport> {
        let mut tx = self.transaction()?;
        self.collector().empty_trash_upload_folder(&mut tx, delete_files)
    }

    /// Verify one stored filepath
    pub fn verify(&self, filepath_id: i64) -> Result<FileVerification> {
        let mut tx = self.transaction()?;
        self.verifier().verify(&mut tx, filepath_id)
    }

    /// Verify every stored filepath
    pub fn verify_all(&self) -> Result<VerificationReport> {
        let mut tx = self.transaction()?;
        self.verifier().verify_all(&mut tx)
    }

    /// Write a release bundle for the studies at `visibility`
    pub fn release(&self, visibility: Visibility) -> Result<ReleaseBundle> {
        let mut tx = self.transaction()?;
        self.release_bundler().bundle(&mut tx, visibility)
    }
}

/// Builder for [`Vault`] instances
///
/// # Default Values
///
/// - `seed_default_mountpoints`: true
/// - `lock_timeout`: 10 seconds
/// - `portal`: `"QIITA"`
#[derive(Debug, Clone)]
pub struct VaultBuilder {
    seed_default_mountpoints: bool,
    lock_timeout: Option<Duration>,
    portal: Option<String>,
    working_dir: Option<PathBuf>,
}

impl Default for VaultBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VaultBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            seed_default_mountpoints: true,
            lock_timeout: None,
            portal: None,
            working_dir: None,
        }
    }

    /// Whether a new vault gets a default generation per category
    pub fn seed_default_mountpoints(mut self, seed: bool) -> Self {
        self.seed_default_mountpoints = seed;
        self
    }

    /// How long a transaction waits for the connection
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Portal name stamped on release file names
    pub fn portal(mut self, portal: impl Into<String>) -> Self {
        self.portal = Some(portal.into());
        self
    }

    /// Scratch area for release bundles
    pub fn working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Open the vault under `base_data_dir`, initializing it first if needed
    pub fn build(self, base_data_dir: PathBuf) -> Result<Vault> {
        let config = self.apply(VaultConfig::new(base_data_dir));
        if config.database_path.exists() {
            Vault::open_with_config(config)
        } else {
            self.init(config)
        }
    }

    fn apply(&self, mut config: VaultConfig) -> VaultConfig {
        if let Some(timeout) = self.lock_timeout {
            config.lock_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(portal) = &self.portal {
            config.portal = portal.clone();
        }
        if let Some(dir) = &self.working_dir {
            config.working_dir = dir.clone();
        }
        config
    }

    /// Create directories, database and schema for `config`
    #[instrument(skip(self, config), fields(base = ?config.base_data_dir))]
    pub fn init(&self, config: VaultConfig) -> Result<Vault> {
        let config = self.apply(config);
        fs::create_dir_all(&config.base_data_dir)?;
        config.validate()?;
        fs::create_dir_all(&config.working_dir)?;
        info!("Initializing vault at {:?}", config.base_data_dir);

        let db = Database::open(
            &config.database_path,
            Duration::from_millis(config.lock_timeout_ms),
        )?;
        let links = {
            let mut tx = db.transaction()?;
            tx.scope(|tx| {
                schema::initialize(tx)?;
                if self.seed_default_mountpoints {
                    MountpointRegistry::new(&config.base_data_dir).seed_defaults(tx)?;
                }
                Ok(())
            })?;
            LinkRegistry::discover(&mut tx)?
        };
        Ok(Vault {
            config,
            db,
            links: RwLock::new(Arc::new(links)),
        })
    }
}
