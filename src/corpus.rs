//! Corpus builder.
//!
//! Joins every active CI with its change requests from the lookback window
//! and turns each pair into a [`CorpusEntry`]: a text profile for embedding
//! plus [`ChangeStats`] for rescoring.
//!
//! # Profile text
//!
//! The text is the space-joined, non-empty subset of:
//!
//! 1. CI name, description and comments
//! 2. `env:<environment>` and `service:<service>`
//! 3. the `max_changes_per_ci` most recent changes (newest first), each as
//!    `"<short_description> <description>"` trimmed
//!
//! Given the same records, window and cutoff, the text is byte-identical.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::path::Path;

use crate::artifact;
use crate::config::EtlConfig;
use crate::models::{ChangeRequest, ChangeStats, CiMeta, ConfigurationItem, CorpusEntry};
use crate::progress::{EtlProgressEvent, NoProgress, ProgressReporter};
use crate::source::{fetch_all, RecordSource, TableQuery};

/// Timestamp format the table API uses in filters and `sys_created_on`.
pub const SOURCE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const CHANGE_FIELDS: &[&str] = &[
    "sys_id",
    "cmdb_ci",
    "sys_created_on",
    "close_code",
    "u_caused_incident",
    "short_description",
    "description",
];

/// Start of the lookback window, formatted for the source's filters.
///
/// Fails when the window reaches outside the representable date range.
pub fn window_start(now: DateTime<Utc>, window_days: i64) -> Result<String> {
    let start = TimeDelta::try_days(window_days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| anyhow!("lookback window of {} days is out of range", window_days))?;
    Ok(start.format(SOURCE_TIMESTAMP_FORMAT).to_string())
}

/// Reduce a CI's change requests into aggregate statistics.
pub fn compute_stats(changes: &[ChangeRequest]) -> ChangeStats {
    let last_change_at = changes
        .iter()
        .filter_map(|c| c.created_at.as_deref())
        .filter(|ts| !ts.is_empty())
        .max()
        .map(str::to_string);

    ChangeStats {
        total: changes.len() as u64,
        success: changes.iter().filter(|c| c.is_successful()).count() as u64,
        caused_incidents: changes.iter().filter(|c| c.caused_incident()).count() as u64,
        last_change_at,
    }
}

/// Text from the `max_changes` most recent changes, newest first.
pub fn change_text(changes: &[ChangeRequest], max_changes: usize) -> String {
    let mut sorted: Vec<&ChangeRequest> = changes.iter().collect();
    // Stable: changes with equal timestamps keep their fetch order.
    sorted.sort_by(|a, b| {
        let a_ts = a.created_at.as_deref().unwrap_or("");
        let b_ts = b.created_at.as_deref().unwrap_or("");
        b_ts.cmp(a_ts)
    });

    sorted
        .iter()
        .take(max_changes)
        .map(|c| {
            format!(
                "{} {}",
                c.short_description.as_deref().unwrap_or(""),
                c.description.as_deref().unwrap_or("")
            )
            .trim()
            .to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Assemble the profile text for one CI.
pub fn profile_text(ci: &ConfigurationItem, change_text: &str) -> String {
    let parts = [
        ci.name.clone().unwrap_or_default(),
        ci.description.clone().unwrap_or_default(),
        ci.comments.clone().unwrap_or_default(),
        format!("env:{}", ci.environment.as_deref().unwrap_or("")),
        format!("service:{}", ci.service.as_deref().unwrap_or("")),
        change_text.to_string(),
    ];

    parts
        .iter()
        .filter(|p| !p.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the corpus entry for one CI, or `None` if the CI has no id.
pub fn build_entry(
    ci: &ConfigurationItem,
    changes: &[ChangeRequest],
    max_changes: usize,
) -> Option<CorpusEntry> {
    let id = ci.id.as_deref().filter(|id| !id.is_empty())?;
    let stats = compute_stats(changes);
    let text = profile_text(ci, &change_text(changes, max_changes));

    Some(CorpusEntry {
        text,
        meta: CiMeta {
            id: id.to_string(),
            name: ci.name.clone().unwrap_or_default(),
            stats,
        },
    })
}

fn decode_records<T: serde::de::DeserializeOwned>(records: Vec<Value>, table: &str) -> Result<Vec<T>> {
    records
        .into_iter()
        .map(|r| {
            serde_json::from_value(r)
                .with_context(|| format!("Malformed record in table {}", table))
        })
        .collect()
}

/// Harvests CIs and their changes from a [`RecordSource`].
pub struct CorpusBuilder<'a> {
    source: &'a dyn RecordSource,
    change_table: String,
    display_values: bool,
    page_size: usize,
    progress_every: usize,
    reporter: Box<dyn ProgressReporter>,
}

impl<'a> CorpusBuilder<'a> {
    pub fn new(source: &'a dyn RecordSource, etl: &EtlConfig, page_size: usize) -> Self {
        Self {
            source,
            change_table: etl.change_table.clone(),
            display_values: etl.display_values,
            page_size,
            progress_every: etl.progress_every.max(1),
            reporter: Box::new(NoProgress),
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Build the corpus with the window anchored at the current time.
    pub async fn build(
        &self,
        ci_table: &str,
        window_days: i64,
        max_changes_per_ci: usize,
    ) -> Result<Vec<CorpusEntry>> {
        self.build_at(Utc::now(), ci_table, window_days, max_changes_per_ci)
            .await
    }

    /// Build the corpus with the window anchored at `now`.
    ///
    /// Any page fetch that fails after retries aborts the whole build.
    pub async fn build_at(
        &self,
        now: DateTime<Utc>,
        ci_table: &str,
        window_days: i64,
        max_changes_per_ci: usize,
    ) -> Result<Vec<CorpusEntry>> {
        let since = window_start(now, window_days)?;

        self.reporter.report(EtlProgressEvent::Fetching {
            table: ci_table.to_string(),
        });
        let ci_query = TableQuery::new(ci_table)
            .filter("active=true")
            .display_value(self.display_values);
        let raw_cis = fetch_all(self.source, &ci_query, self.page_size).await?;
        let cis: Vec<ConfigurationItem> = decode_records(raw_cis, ci_table)?;
        let total = cis.len();
        tracing::info!(
            stage = "etl",
            count = total,
            "Retrieved {} CIs from {}",
            total,
            ci_table
        );

        let mut corpus = Vec::with_capacity(total);
        let mut processed = 0usize;

        for ci in &cis {
            let Some(ci_id) = ci.id.as_deref().filter(|id| !id.is_empty()) else {
                continue;
            };

            let change_query = TableQuery::new(self.change_table.as_str())
                .filter(format!("cmdb_ci={}^sys_created_on>={}", ci_id, since))
                .fields(CHANGE_FIELDS);
            let raw_changes = fetch_all(self.source, &change_query, self.page_size)
                .await
                .with_context(|| format!("Failed to fetch changes for CI {}", ci_id))?;
            let changes: Vec<ChangeRequest> = decode_records(raw_changes, &self.change_table)?;

            if let Some(entry) = build_entry(ci, &changes, max_changes_per_ci) {
                corpus.push(entry);
            }

            processed += 1;
            if processed % self.progress_every == 0 {
                tracing::info!(
                    stage = "etl",
                    processed,
                    total,
                    "Processed {}/{} CIs",
                    processed,
                    total
                );
                self.reporter.report(EtlProgressEvent::Profiling {
                    n: processed as u64,
                    total: total as u64,
                });
            }
        }

        if processed % self.progress_every != 0 {
            self.reporter.report(EtlProgressEvent::Profiling {
                n: processed as u64,
                total: total as u64,
            });
        }

        Ok(corpus)
    }
}

/// Serialize the corpus exactly as it is persisted.
pub fn corpus_bytes(corpus: &[CorpusEntry]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(corpus)?)
}

/// Overwrite the corpus artifact with a complete snapshot.
pub fn write_corpus(path: &Path, corpus: &[CorpusEntry]) -> Result<()> {
    artifact::write_atomic(path, &corpus_bytes(corpus)?)
        .with_context(|| format!("Failed to write corpus: {}", path.display()))
}

pub fn read_corpus(path: &Path) -> Result<Vec<CorpusEntry>> {
    let content = std::fs::read(path)
        .with_context(|| format!("Failed to read corpus: {}", path.display()))?;
    serde_json::from_slice(&content)
        .with_context(|| format!("Malformed corpus artifact: {}", path.display()))
}
