//! Embedding indexer and the exact inner-product index.
//!
//! [`FlatIpIndex`] stores unit vectors contiguously in insertion order; the
//! position of a vector is its handle, and `meta[handle]` in the metadata
//! artifact describes it. Search is brute force: every vector is scored and
//! the top `k` are returned, highest inner product first.
//!
//! # Artifacts
//!
//! [`write_artifacts`] persists three files produced from one pass over the
//! corpus:
//!
//! - `index.bin`: `CIFLATIP` magic, format version, dims, count, then the
//!   vectors as little-endian `f32`
//! - `meta.json`: JSON array of [`CiMeta`], positionally aligned with the index
//! - `manifest.json`: [`Manifest`] with model, dims, count and corpus digest
//!
//! The manifest is removed before the pair is replaced and rewritten only
//! after both renames succeed, so a crash mid-write leaves no manifest and
//! [`IndexSnapshot::load`] refuses the directory.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::artifact::{self, DataLayout};
use crate::embedding::{embed_normalized, inner_product, EmbeddingProvider};
use crate::models::{CiMeta, CorpusEntry};

const MAGIC: &[u8; 8] = b"CIFLATIP";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 4 + 8;

/// A vector whose length differs from the index dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("embedding dimension mismatch: index has {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// A search result: inner product with the query and the vector's handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub similarity: f32,
    pub handle: usize,
}

/// Exact nearest-neighbour index over inner product.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIpIndex {
    dims: usize,
    data: Vec<f32>,
}

impl FlatIpIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a vector and return its handle.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize, DimensionMismatch> {
        if vector.len() != self.dims || self.dims == 0 {
            return Err(DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        let handle = self.len();
        self.data.extend_from_slice(vector);
        Ok(handle)
    }

    /// Top `k` vectors by inner product with `query`.
    ///
    /// Equal similarities are ordered by handle. An empty index returns no
    /// hits for any query.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>, DimensionMismatch> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dims {
            return Err(DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }

        let mut hits: Vec<Hit> = self
            .data
            .chunks_exact(self.dims)
            .enumerate()
            .map(|(handle, v)| Hit {
                similarity: inner_product(v, query),
                handle,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.handle.cmp(&b.handle))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Serialize to the `index.bin` format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&vec_to_blob(&self.data));
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
            bail!("not an index artifact");
        }
        let version = u32::from_le_bytes(read_array(&bytes[8..12])?);
        if version != FORMAT_VERSION {
            bail!("unsupported index format version {}", version);
        }
        let dims = u32::from_le_bytes(read_array(&bytes[12..16])?) as usize;
        let count = u64::from_le_bytes(read_array(&bytes[16..24])?) as usize;

        let body = &bytes[HEADER_LEN..];
        let expected = count
            .checked_mul(dims)
            .and_then(|n| n.checked_mul(4))
            .context("index header overflows")?;
        if body.len() != expected {
            bail!(
                "index artifact truncated: header says {} x {} floats, body has {} bytes",
                count,
                dims,
                body.len()
            );
        }

        Ok(Self {
            dims,
            data: blob_to_vec(body),
        })
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().context("index header is malformed")
}

/// Encode `f32`s as little-endian bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Reverses [`vec_to_blob`]. Trailing bytes that do not form a full `f32`
/// are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Describes a complete index/metadata pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub model: String,
    pub dims: usize,
    pub count: usize,
    pub corpus_sha256: String,
    pub built_at: String,
}

/// Hex SHA-256 of the corpus artifact bytes.
pub fn corpus_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Encode every corpus text and build the index plus its parallel metadata.
///
/// Vectors and metadata come from the same ordered pass, so `meta[i]`
/// always describes handle `i`.
pub async fn build_index(
    corpus: &[CorpusEntry],
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
) -> Result<(FlatIpIndex, Vec<CiMeta>)> {
    let texts: Vec<String> = corpus.iter().map(|e| e.text.clone()).collect();
    let vectors = embed_normalized(provider, &texts, batch_size)
        .await
        .context("Failed to embed corpus")?;

    let dims = vectors.first().map(Vec::len).unwrap_or_else(|| provider.dims());
    let mut index = FlatIpIndex::new(dims);
    for v in &vectors {
        index.add(v)?;
    }

    let meta: Vec<CiMeta> = corpus.iter().map(|e| e.meta.clone()).collect();
    Ok((index, meta))
}

/// Persist the index, metadata and manifest into `layout`.
pub fn write_artifacts(
    layout: &DataLayout,
    index: &FlatIpIndex,
    meta: &[CiMeta],
    model: &str,
    corpus_sha256: &str,
) -> Result<Manifest> {
    if index.len() != meta.len() {
        bail!(
            "index has {} vectors but metadata has {} entries",
            index.len(),
            meta.len()
        );
    }
    layout.ensure_dir()?;

    let manifest = Manifest {
        model: model.to_string(),
        dims: index.dims(),
        count: index.len(),
        corpus_sha256: corpus_sha256.to_string(),
        built_at: Utc::now().to_rfc3339(),
    };

    let index_tmp = artifact::stage(&layout.index_path(), &index.to_bytes())?;
    let meta_tmp = artifact::stage(&layout.meta_path(), &serde_json::to_vec(meta)?)?;
    let manifest_tmp = artifact::stage(
        &layout.manifest_path(),
        &serde_json::to_vec_pretty(&manifest)?,
    )?;

    let manifest_path = layout.manifest_path();
    if manifest_path.exists() {
        std::fs::remove_file(&manifest_path)
            .with_context(|| format!("Failed to remove {}", manifest_path.display()))?;
    }
    artifact::commit(&index_tmp, &layout.index_path())?;
    artifact::commit(&meta_tmp, &layout.meta_path())?;
    artifact::commit(&manifest_tmp, &manifest_path)?;

    Ok(manifest)
}

/// The loaded index, metadata and manifest. Immutable after load.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub index: FlatIpIndex,
    pub meta: Vec<CiMeta>,
    pub manifest: Manifest,
}

impl IndexSnapshot {
    pub fn new(index: FlatIpIndex, meta: Vec<CiMeta>, manifest: Manifest) -> Result<Self> {
        if index.len() != meta.len() {
            bail!(
                "index has {} vectors but metadata has {} entries",
                index.len(),
                meta.len()
            );
        }
        Ok(Self {
            index,
            meta,
            manifest,
        })
    }

    /// Load and cross-check the artifacts in `layout`.
    ///
    /// Fails when the manifest is missing, when counts or dims disagree, or
    /// when the index was built with a model other than `expected_model`.
    pub fn load(layout: &DataLayout, expected_model: &str) -> Result<Self> {
        let manifest_path = layout.manifest_path();
        let manifest: Manifest = serde_json::from_slice(
            &std::fs::read(&manifest_path).with_context(|| {
                format!(
                    "No complete index in {} (missing {}); run `cisug index` first",
                    layout.dir().display(),
                    manifest_path.display()
                )
            })?,
        )
        .with_context(|| format!("Malformed manifest: {}", manifest_path.display()))?;

        if manifest.model != expected_model {
            bail!(
                "index was built with model '{}' but the configured model is '{}'; rebuild the index",
                manifest.model,
                expected_model
            );
        }

        let index_path = layout.index_path();
        let index = FlatIpIndex::from_bytes(
            &std::fs::read(&index_path)
                .with_context(|| format!("Failed to read {}", index_path.display()))?,
        )
        .with_context(|| format!("Malformed index artifact: {}", index_path.display()))?;

        let meta_path = layout.meta_path();
        let meta: Vec<CiMeta> = serde_json::from_slice(
            &std::fs::read(&meta_path)
                .with_context(|| format!("Failed to read {}", meta_path.display()))?,
        )
        .with_context(|| format!("Malformed metadata artifact: {}", meta_path.display()))?;

        if index.len() != manifest.count || meta.len() != manifest.count {
            bail!(
                "artifacts disagree: manifest count {}, index {}, metadata {}",
                manifest.count,
                index.len(),
                meta.len()
            );
        }
        if index.dims() != manifest.dims {
            bail!(
                "artifacts disagree: manifest dims {}, index dims {}",
                manifest.dims,
                index.dims()
            );
        }

        Self::new(index, meta, manifest)
    }
}
