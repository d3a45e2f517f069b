//! On-disk layout of the pipeline artifacts.
//!
//! All artifacts live in `[storage].data_dir`:
//!
//! | File | Producer | Contents |
//! |------|----------|----------|
//! | `ci_corpus.json` | corpus builder | JSON array of corpus entries |
//! | `index.bin` | indexer | flat inner-product index |
//! | `meta.json` | indexer | JSON array of CI metadata, aligned with `index.bin` |
//! | `manifest.json` | indexer | model, dims, count; written last |

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct DataLayout {
    dir: PathBuf,
}

impl DataLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.storage.data_dir.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn corpus_path(&self) -> PathBuf {
        self.dir.join("ci_corpus.json")
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join("index.bin")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    /// Create the data directory if it does not exist.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create data dir: {}", self.dir.display()))
    }
}

/// Sibling temp path used while an artifact is being written.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to a temp file next to `path` and flush it to disk.
///
/// The caller renames it into place with [`commit`].
pub fn stage(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    let mut file = std::fs::File::create(&tmp)
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    file.sync_all()?;
    Ok(tmp)
}

/// Move a staged temp file over its final path.
pub fn commit(staged: &Path, path: &Path) -> Result<()> {
    std::fs::rename(staged, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))
}

/// Replace `path` with `bytes` so readers see either the old or the new file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let staged = stage(path, bytes)?;
    commit(&staged, path)
}
