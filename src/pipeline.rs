//! Offline job orchestration.
//!
//! `etl` harvests the corpus, `index` embeds it and persists the index pair,
//! `build` runs both, and [`run_loop`] repeats `build` on an interval until a
//! run fails or the process is interrupted. Every run is a full rebuild.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::artifact::DataLayout;
use crate::config::Config;
use crate::corpus::{write_corpus, CorpusBuilder};
use crate::deps::check_dependencies;
use crate::embedding::EmbeddingProvider;
use crate::index::{build_index, corpus_digest, write_artifacts, Manifest};
use crate::models::CorpusEntry;
use crate::progress::{EtlProgressEvent, ProgressMode};
use crate::source::RecordSource;

/// Harvest the corpus and overwrite the corpus artifact.
///
/// Returns the number of entries written. Nothing is written if any fetch
/// fails.
pub async fn run_etl(
    config: &Config,
    source: &dyn RecordSource,
    progress: ProgressMode,
) -> Result<usize> {
    let layout = DataLayout::from_config(config);
    let reporter = progress.reporter();

    let corpus = CorpusBuilder::new(source, &config.etl, config.source.page_size)
        .with_reporter(progress.reporter())
        .build(
            &config.etl.ci_table,
            config.etl.days_back,
            config.etl.max_changes_per_ci,
        )
        .await
        .context("ETL run failed")?;

    layout.ensure_dir()?;
    let path = layout.corpus_path();
    write_corpus(&path, &corpus)?;
    reporter.report(EtlProgressEvent::Written {
        entries: corpus.len() as u64,
    });
    tracing::info!(
        stage = "etl",
        entries = corpus.len(),
        "Wrote {} CI profiles to {}",
        corpus.len(),
        path.display()
    );

    Ok(corpus.len())
}

/// Embed the corpus artifact and persist index, metadata and manifest.
pub async fn run_index(config: &Config, provider: &dyn EmbeddingProvider) -> Result<Manifest> {
    let layout = DataLayout::from_config(config);
    let path = layout.corpus_path();

    let bytes = std::fs::read(&path).with_context(|| {
        format!(
            "Failed to read corpus: {} (run `cisug etl` first)",
            path.display()
        )
    })?;
    let corpus: Vec<CorpusEntry> = serde_json::from_slice(&bytes)
        .with_context(|| format!("Malformed corpus artifact: {}", path.display()))?;

    let (index, meta) = build_index(&corpus, provider, config.embedding.batch_size).await?;
    let manifest = write_artifacts(
        &layout,
        &index,
        &meta,
        provider.model_name(),
        &corpus_digest(&bytes),
    )?;

    tracing::info!(
        stage = "index",
        vectors = manifest.count,
        dims = manifest.dims,
        "Built index with {} vectors ({} dims, model {})",
        manifest.count,
        manifest.dims,
        manifest.model
    );
    Ok(manifest)
}

/// One full offline pass: ETL then index.
pub async fn run_build(
    config: &Config,
    source: &dyn RecordSource,
    provider: &dyn EmbeddingProvider,
    progress: ProgressMode,
) -> Result<Manifest> {
    run_etl(config, source, progress).await?;
    run_index(config, provider).await
}

/// Repeat [`run_build`] every `interval` until a run fails or Ctrl-C.
///
/// Unless `skip_deps` is set, the dependency preflight runs first and a
/// failing check stops the loop before any build.
pub async fn run_loop(
    config: &Config,
    source: &dyn RecordSource,
    provider: &dyn EmbeddingProvider,
    progress: ProgressMode,
    interval: Duration,
    skip_deps: bool,
) -> Result<()> {
    if !skip_deps
        && !check_dependencies(&config.dependencies, source, config.source.page_size).await?
    {
        anyhow::bail!("dependency check failed");
    }

    let mut run = 0u64;
    loop {
        run += 1;
        tracing::info!(stage = "process", run, "Starting offline run {}", run);
        if let Err(e) = run_build(config, source, provider, progress).await {
            tracing::error!(stage = "process", run, "Offline run {} failed: {:#}", run, e);
            return Err(e);
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(stage = "process", "Interrupted, stopping after run {}", run);
                return Ok(());
            }
        }
    }
}
