//! Release bundles
//!
//! A release is a portable export of every processed BIOM table of the
//! studies at one visibility, together with the metadata needed to use it:
//! a gzip-compressed tar archive and a tab-separated manifest, written side
//! by side as `<portal>-<visibility>-<timestamp>.{tgz,txt}`.
//!
//! For each study the latest sample-template file is used. For each BIOM
//! artifact of the study that was produced by a command, every `biom` output
//! (except `only-16s` variants) yields one manifest row per linked
//! preparation, so an artifact shared by two preparations appears twice.
//! Rows are not deduplicated: each carries its own preparation file.
//!
//! Paths in both the manifest and the archive are relative to the storage
//! base, which keeps the bundle valid on any host with the same layout.

use crate::error::{Result, VaultError};
use crate::ingest::FilepathIngestor;
use crate::links::LinkRegistry;
use crate::transaction::{as_i64, as_text, column, Transaction};
use crate::types::{OwnerKind, ReleaseBundle, ReleaseEntry, SortOrder, StoredFilepath, Visibility};
use crate::utils;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::types::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

/// First line of every manifest
pub const MANIFEST_HEADER: &str = "biom_fp\tsample_fp\tprep_fp\tqiita_artifact_id\tcommand";

/// Command whose parameters add a length annotation to the provenance label
const TRIMMING_COMMAND: &str = "Trimming";

const TIMESTAMP_FORMAT: &str = "%m%d%y-%H%M%S";

/// Assembles release archives and manifests
#[derive(Debug, Clone)]
pub struct ReleaseBundler<'a> {
    ingestor: FilepathIngestor<'a>,
    base_dir: &'a Path,
    releases_dir: PathBuf,
    portal: String,
}

impl<'a> ReleaseBundler<'a> {
    /// Bundler reading files under `base_dir` and writing to `releases_dir`
    pub fn new(
        base_dir: &'a Path,
        links: Arc<LinkRegistry>,
        releases_dir: impl Into<PathBuf>,
        portal: impl Into<String>,
    ) -> Self {
        Self {
            ingestor: FilepathIngestor::new(base_dir, links),
            base_dir,
            releases_dir: releases_dir.into(),
            portal: portal.into(),
        }
    }

    /// Write the archive and manifest of every study at `visibility`
    ///
    /// # Errors
    ///
    /// - [`VaultError::Io`] if a file cannot be read or the bundle cannot be
    ///   written; nothing is left at the final paths in that case
    /// - [`VaultError::Lookup`] if a trimming step lacks its length parameter
    #[instrument(skip(self, tx))]
    pub fn bundle(&self, tx: &mut Transaction<'_>, visibility: Visibility) -> Result<ReleaseBundle> {
        let entries = self.collect_entries(tx, visibility)?;

        fs::create_dir_all(&self.releases_dir)?;
        let stem = format!(
            "{}-{}-{}",
            self.portal,
            visibility,
            chrono::Local::now().format(TIMESTAMP_FORMAT)
        );
        let archive_path = self.releases_dir.join(format!("{}.tgz", stem));
        let manifest_path = self.releases_dir.join(format!("{}.txt", stem));

        let mut manifest = NamedTempFile::new_in(&self.releases_dir)?;
        writeln!(manifest, "{}", MANIFEST_HEADER)?;
        for entry in &entries {
            writeln!(manifest, "{}", manifest_row(entry)?)?;
        }

        let mut archive = NamedTempFile::new_in(&self.releases_dir)?;
        {
            let encoder = GzEncoder::new(&mut archive, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            for entry in &entries {
                for relative in [&entry.biom_fp, &entry.sample_fp, &entry.prep_fp] {
                    builder.append_path_with_name(self.base_dir.join(relative), relative)?;
                }
            }
            builder.into_inner()?.finish()?;
        }

        archive
            .persist(&archive_path)
            .map_err(|e| VaultError::Io(e.error))?;
        manifest
            .persist(&manifest_path)
            .map_err(|e| VaultError::Io(e.error))?;

        info!(
            "Wrote release {:?} with {} entries",
            archive_path,
            entries.len()
        );
        Ok(ReleaseBundle {
            archive_path,
            manifest_path,
            entries,
        })
    }

    /// Manifest rows of every study at `visibility`, without writing anything
    pub fn collect_entries(
        &self,
        tx: &mut Transaction<'_>,
        visibility: Visibility,
    ) -> Result<Vec<ReleaseEntry>> {
        tx.scope(|tx| {
            tx.add(
                "SELECT study_id FROM study WHERE status = ? ORDER BY study_id",
                vec![Value::Text(visibility.as_str().to_string())],
            )?;
            let studies = tx
                .execute_fetchflatten()?
                .iter()
                .map(as_i64)
                .collect::<Result<Vec<_>>>()?;
            debug!("{} {} studies", studies.len(), visibility);

            let mut entries = Vec::new();
            for study_id in studies {
                let samples = self.ingestor.retrieve_filepaths(
                    tx,
                    OwnerKind::SampleTemplate,
                    study_id,
                    Some(SortOrder::Descending),
                    None,
                )?;
                let Some(sample) = samples.first() else {
                    warn!("Study {} has no sample template file, skipping", study_id);
                    continue;
                };
                let sample_fp = self.relative(sample)?;

                for (artifact_id, command) in self.biom_artifacts(tx, study_id)? {
                    entries.extend(self.artifact_entries(tx, artifact_id, &command, &sample_fp)?);
                }
            }
            Ok(entries)
        })
    }

    /// Provenance label of an artifact produced by `command`
    ///
    /// One part per parent that was itself produced by a command: a trimming
    /// parent gives `"<command> @ <length>"`, any other gives
    /// `"<command>, <parent command>"`. Parts are joined with `", "`.
    pub fn provenance_label(
        &self,
        tx: &mut Transaction<'_>,
        artifact_id: i64,
        command: &str,
    ) -> Result<String> {
        let rows = tx.scope(|tx| {
            tx.add(
                "SELECT c.name, a.command_parameters \
                 FROM parent_artifact AS p \
                 JOIN artifact AS a ON a.artifact_id = p.parent_id \
                 JOIN software_command AS c ON c.command_id = a.command_id \
                 WHERE p.artifact_id = ? \
                 ORDER BY p.parent_id",
                vec![Value::Integer(artifact_id)],
            )?;
            tx.execute_fetchindex()
        })?;

        let mut parts = Vec::with_capacity(rows.len());
        for row in &rows {
            let parent_command = as_text(column(row, 0)?)?;
            if parent_command == TRIMMING_COMMAND {
                let length = trimming_length(column(row, 1)?)?;
                parts.push(format!("{} @ {}", command, length));
            } else {
                parts.push(format!("{}, {}", command, parent_command));
            }
        }
        Ok(parts.join(", "))
    }

    fn biom_artifacts(&self, tx: &mut Transaction<'_>, study_id: i64) -> Result<Vec<(i64, String)>> {
        tx.add(
            "SELECT a.artifact_id, c.name FROM artifact AS a \
             JOIN software_command AS c ON c.command_id = a.command_id \
             WHERE a.study_id = ? AND a.artifact_type = 'BIOM' \
             ORDER BY a.artifact_id",
            vec![Value::Integer(study_id)],
        )?;
        tx.execute_fetchindex()?
            .iter()
            .map(|row| Ok((as_i64(column(row, 0)?)?, as_text(column(row, 1)?)?)))
            .collect()
    }

    fn artifact_entries(
        &self,
        tx: &mut Transaction<'_>,
        artifact_id: i64,
        command: &str,
        sample_fp: &Path,
    ) -> Result<Vec<ReleaseEntry>> {
        let label = self.provenance_label(tx, artifact_id, command)?;

        let outputs: Vec<StoredFilepath> = self
            .ingestor
            .retrieve_filepaths(
                tx,
                OwnerKind::Artifact,
                artifact_id,
                Some(SortOrder::Ascending),
                Some("biom"),
            )?
            .into_iter()
            .filter(|f| !f.relative_path.contains("only-16s"))
            .collect();
        if outputs.is_empty() {
            return Ok(Vec::new());
        }

        tx.add(
            "SELECT prep_template_id FROM preparation_artifact \
             WHERE artifact_id = ? ORDER BY prep_template_id",
            vec![Value::Integer(artifact_id)],
        )?;
        let preps = tx
            .execute_fetchflatten()?
            .iter()
            .map(as_i64)
            .collect::<Result<Vec<_>>>()?;

        let mut prep_files = Vec::with_capacity(preps.len());
        for prep_id in preps {
            let candidates = self.ingestor.retrieve_filepaths(
                tx,
                OwnerKind::PrepTemplate,
                prep_id,
                Some(SortOrder::Descending),
                None,
            )?;
            match select_prep_file(&candidates) {
                Some(prep) => prep_files.push(self.relative(prep)?),
                None => warn!("Preparation {} has no files, skipping", prep_id),
            }
        }

        let mut entries = Vec::with_capacity(outputs.len() * prep_files.len());
        for output in &outputs {
            let biom_fp = self.relative(output)?;
            for prep_fp in &prep_files {
                entries.push(ReleaseEntry {
                    biom_fp: biom_fp.clone(),
                    sample_fp: sample_fp.to_path_buf(),
                    prep_fp: prep_fp.clone(),
                    artifact_id,
                    command: label.clone(),
                });
            }
        }
        Ok(entries)
    }

    fn relative(&self, stored: &StoredFilepath) -> Result<PathBuf> {
        utils::make_relative(&stored.path, self.base_dir)
    }
}

/// The first candidate not flavored "qiime", or the last one examined
fn select_prep_file(candidates: &[StoredFilepath]) -> Option<&StoredFilepath> {
    candidates
        .iter()
        .find(|f| !f.relative_path.contains("qiime"))
        .or_else(|| candidates.last())
}

fn trimming_length(parameters: &Value) -> Result<String> {
    let missing = || VaultError::lookup("trimming step has no 'length' parameter");
    let Value::Text(json) = parameters else {
        return Err(missing());
    };
    let parameters: serde_json::Value = serde_json::from_str(json)?;
    match parameters.get("length") {
        Some(serde_json::Value::String(length)) => Ok(length.clone()),
        Some(length) => Ok(length.to_string()),
        None => Err(missing()),
    }
}

fn manifest_row(entry: &ReleaseEntry) -> Result<String> {
    Ok(format!(
        "{}\t{}\t{}\t{}\t{}",
        utils::path_to_db_text(&entry.biom_fp)?,
        utils::path_to_db_text(&entry.sample_fp)?,
        utils::path_to_db_text(&entry.prep_fp)?,
        entry.artifact_id,
        entry.command
    ))
}
