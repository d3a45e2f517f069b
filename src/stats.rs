//! Artifact statistics.
//!
//! Provides a quick summary of what the last build produced: corpus size,
//! change coverage, index dimensions and model, and whether the index is
//! still in sync with the corpus on disk. Used by `cisug stats`.

use anyhow::Result;
use std::path::Path;

use crate::artifact::DataLayout;
use crate::config::Config;
use crate::corpus::read_corpus;
use crate::index::{corpus_digest, Manifest};

/// Summary of the artifacts in one data directory.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArtifactStats {
    pub corpus_entries: Option<usize>,
    pub corpus_bytes: u64,
    pub cis_without_changes: usize,
    pub total_changes: u64,
    pub incident_changes: u64,
    pub manifest: Option<Manifest>,
    pub index_bytes: u64,
    /// `Some(true)` when the manifest digest matches the corpus on disk.
    pub corpus_in_sync: Option<bool>,
}

/// Collect stats for the artifacts in `layout`. Missing files are reported
/// as absent rather than as errors.
pub fn collect(layout: &DataLayout) -> Result<ArtifactStats> {
    let mut stats = ArtifactStats::default();
    let corpus_path = layout.corpus_path();

    let mut digest = None;
    if corpus_path.exists() {
        let corpus = read_corpus(&corpus_path)?;
        stats.corpus_entries = Some(corpus.len());
        stats.cis_without_changes = corpus.iter().filter(|e| e.meta.stats.total == 0).count();
        stats.total_changes = corpus.iter().map(|e| e.meta.stats.total).sum();
        stats.incident_changes = corpus.iter().map(|e| e.meta.stats.caused_incidents).sum();
        stats.corpus_bytes = file_size(&corpus_path);
        digest = Some(corpus_digest(&std::fs::read(&corpus_path)?));
    }

    if let Ok(bytes) = std::fs::read(layout.manifest_path()) {
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        stats.corpus_in_sync = digest.map(|d| d == manifest.corpus_sha256);
        stats.manifest = Some(manifest);
        stats.index_bytes = file_size(&layout.index_path());
    }

    Ok(stats)
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Run the stats command: inspect the data directory and print a summary.
pub fn run_stats(config: &Config) -> Result<()> {
    let layout = DataLayout::from_config(config);
    let stats = collect(&layout)?;

    println!("CI Suggester Artifact Stats");
    println!("===========================");
    println!();
    println!("  Data dir:    {}", layout.dir().display());
    println!();

    match stats.corpus_entries {
        Some(n) => {
            println!("  Corpus:      {} CIs ({})", n, format_bytes(stats.corpus_bytes));
            println!("  No changes:  {}", stats.cis_without_changes);
            println!(
                "  Changes:     {} ({} caused incidents)",
                stats.total_changes, stats.incident_changes
            );
        }
        None => println!("  Corpus:      not built (run `cisug etl`)"),
    }
    println!();

    match &stats.manifest {
        Some(m) => {
            println!("  Index:       {} vectors ({})", m.count, format_bytes(stats.index_bytes));
            println!("  Dims:        {}", m.dims);
            println!("  Model:       {}", m.model);
            println!("  Built:       {}", format_built_at(&m.built_at));
            let sync = match stats.corpus_in_sync {
                Some(true) => "up to date",
                Some(false) => "stale (corpus changed since build)",
                None => "unknown (no corpus)",
            };
            println!("  Corpus sync: {}", sync);
        }
        None => println!("  Index:       not built (run `cisug index`)"),
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format an RFC 3339 build time relative to now (e.g. "3 hours ago").
fn format_built_at(built_at: &str) -> String {
    let Ok(ts) = chrono::DateTime::parse_from_rfc3339(built_at) else {
        return built_at.to_string();
    };
    let delta = (chrono::Utc::now() - ts.with_timezone(&chrono::Utc)).num_seconds();

    if delta < 0 {
        ts.format("%Y-%m-%d %H:%M").to_string()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}
