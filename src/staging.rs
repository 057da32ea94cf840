//! Local staging area.
//!
//! Each extracted page is written as one newline-delimited JSON file under
//! `root/<source>/<server>/<db>/<job>/<YYYY-MM-DD>/`, named `<millis>_<seq>_<run>.json`. Files
//! are read back in creation order and removed once their batch is loaded, so a crashed run
//! leaves its unloaded pages behind.

use crate::error::{Error, Result};
use crate::normalize::NormalizedRecord;
use crate::registry::Value;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Date format of the staging sub-directory.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Staging directory of one job run.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
    run: String,
    sequence: u32,
}

impl StagingArea {
    /// Create (if needed) today's staging directory of a job.
    pub fn prepare(
        root: impl AsRef<Path>,
        source: &str,
        server: &str,
        db: &str,
        job: &str,
    ) -> Result<Self> {
        let date = Utc::now().format(DATE_FORMAT).to_string();
        let dir = root
            .as_ref()
            .join(source)
            .join(server)
            .join(db)
            .join(job)
            .join(date);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::staging(&dir, format!("cannot create directory: {}", e)))?;
        debug!("Staging directory: {}", dir.display());
        Ok(Self {
            dir,
            run: Uuid::new_v4().simple().to_string(),
            sequence: 0,
        })
    }

    /// Staging directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one batch; returns the file path.
    pub fn write_batch(&mut self, records: &[NormalizedRecord]) -> Result<PathBuf> {
        let name = format!(
            "{}_{:06}_{}.json",
            Utc::now().timestamp_millis(),
            self.sequence,
            self.run
        );
        self.sequence += 1;
        let path = self.dir.join(name);

        let file = File::create(&path)
            .map_err(|e| Error::staging(&path, format!("cannot create file: {}", e)))?;
        let mut writer = BufWriter::new(file);
        for record in records {
            serde_json::to_writer(&mut writer, record)
                .map_err(|e| Error::serialization("Failed to stage record", e))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        debug!("Staged {} records in {}", records.len(), path.display());
        Ok(path)
    }

    /// Staged files, oldest first.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| Error::staging(&self.dir, format!("cannot list directory: {}", e)))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Staged files written by this run, oldest first.
    pub fn run_files(&self) -> Result<Vec<PathBuf>> {
        let suffix = format!("_{}.json", self.run);
        Ok(self
            .files()?
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(&suffix))
            })
            .collect())
    }

    /// Remove files left behind by earlier runs; returns how many were removed.
    pub fn discard_leftovers(&self) -> Result<usize> {
        let ours = self.run_files()?;
        let mut removed = 0;
        for path in self.files()? {
            if !ours.contains(&path) {
                Self::remove(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            warn!(
                "Discarded {} staged files of an earlier run in {}",
                removed,
                self.dir.display()
            );
        }
        Ok(removed)
    }

    /// Read a staged file back into records with the given columns.
    pub fn read_batch(path: &Path, columns: &Arc<[String]>) -> Result<Vec<NormalizedRecord>> {
        let file =
            File::open(path).map_err(|e| Error::staging(path, format!("cannot open file: {}", e)))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let map: BTreeMap<String, Value> = serde_json::from_str(&line)
                .map_err(|e| Error::staging(path, format!("invalid staged record: {}", e)))?;
            records.push(NormalizedRecord::from_map(Arc::clone(columns), map));
        }
        Ok(records)
    }

    /// Remove a loaded file.
    pub fn remove(path: &Path) -> Result<()> {
        fs::remove_file(path)
            .map_err(|e| Error::staging(path, format!("cannot remove file: {}", e)))?;
        debug!("Removed staged file {}", path.display());
        Ok(())
    }
}
