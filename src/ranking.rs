//! Ranking service: overfetch by similarity, then rescore with operational
//! signals.
//!
//! For a query and a requested `k`, the [`Suggester`] embeds the query with
//! the same provider and normalization used at build time, retrieves the top
//! `4k` vectors by inner product, and rescores each candidate:
//!
//! ```text
//! score = 0.35 * similarity
//!       + 0.30 * ln(1 + total)
//!       + 0.15 * exp(-recency_days / 90)
//!       + 0.20 * (success - 0.5 * caused_incidents) / max(1, total)
//! ```
//!
//! Candidates are stably sorted by score (ties keep retrieval order) and the
//! first `k` are returned. Scoring is a pure function of the candidate's
//! similarity, its [`ChangeStats`] and `now`.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Arc;

use crate::artifact::DataLayout;
use crate::config::Config;
use crate::embedding::{create_provider, embed_query, EmbeddingProvider};
use crate::index::{DimensionMismatch, FlatIpIndex, Hit, IndexSnapshot};
use crate::models::{ChangeStats, CiMeta, Features, ScoredCandidate};

pub const SIMILARITY_WEIGHT: f64 = 0.35;
pub const FREQUENCY_WEIGHT: f64 = 0.3;
pub const RECENCY_WEIGHT: f64 = 0.15;
pub const QUALITY_WEIGHT: f64 = 0.2;

/// Candidates retrieved per requested result.
pub const OVERFETCH_FACTOR: usize = 4;
/// Decay scale of the recency term, in days.
pub const RECENCY_SCALE_DAYS: f64 = 90.0;
/// Recency assumed when a CI has no (parseable) last change.
pub const FALLBACK_RECENCY_DAYS: f64 = 365.0;

/// Errors a single query can fail with. The loaded index is unaffected.
#[derive(Debug, thiserror::Error)]
pub enum SuggestError {
    #[error("failed to embed query: {0:#}")]
    Embedding(anyhow::Error),
    #[error("query embedding has {actual} dimensions but the index has {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl From<DimensionMismatch> for SuggestError {
    fn from(e: DimensionMismatch) -> Self {
        SuggestError::DimensionMismatch {
            expected: e.expected,
            actual: e.actual,
        }
    }
}

pub fn frequency_term(total: u64) -> f64 {
    (total as f64).ln_1p()
}

/// Parse a source timestamp, treating naive forms as UTC.
///
/// Accepts `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` (optional fraction,
/// optional trailing `Z`) and RFC 3339 with an offset.
pub fn parse_source_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = value.strip_suffix('Z').unwrap_or(value);
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|dt| dt.and_utc())
}

/// Whole days since `last_change_at`, never negative.
///
/// Missing or unparseable timestamps count as [`FALLBACK_RECENCY_DAYS`].
pub fn recency_days(last_change_at: Option<&str>, now: DateTime<Utc>) -> f64 {
    match last_change_at.and_then(parse_source_timestamp) {
        Some(ts) => (now - ts).num_days().max(0) as f64,
        None => FALLBACK_RECENCY_DAYS,
    }
}

pub fn recency_term(days: f64) -> f64 {
    (-days / RECENCY_SCALE_DAYS).exp()
}

pub fn quality_term(stats: &ChangeStats) -> f64 {
    let denom = stats.total.max(1) as f64;
    stats.success as f64 / denom - 0.5 * stats.caused_incidents as f64 / denom
}

/// Score one retrieved candidate.
pub fn score_candidate(similarity: f64, meta: &CiMeta, now: DateTime<Utc>) -> ScoredCandidate {
    let frequency = frequency_term(meta.stats.total);
    let recency = recency_term(recency_days(meta.stats.last_change_at.as_deref(), now));
    let quality = quality_term(&meta.stats);

    let score = SIMILARITY_WEIGHT * similarity
        + FREQUENCY_WEIGHT * frequency
        + RECENCY_WEIGHT * recency
        + QUALITY_WEIGHT * quality;

    ScoredCandidate {
        ci_id: meta.id.clone(),
        ci_name: meta.name.clone(),
        score,
        features: Features {
            similarity,
            frequency,
            recency,
            quality,
            total: meta.stats.total,
        },
    }
}

/// Number of candidates to retrieve for `k` results.
pub fn overfetch(k: usize) -> usize {
    k.saturating_mul(OVERFETCH_FACTOR)
}

/// Retrieve the overfetched candidate set for `k` results.
pub fn candidates(
    index: &FlatIpIndex,
    query: &[f32],
    k: usize,
) -> Result<Vec<Hit>, DimensionMismatch> {
    index.search(query, overfetch(k))
}

/// Rescore `hits` and keep the best `k`, ties in retrieval order.
pub fn rerank(hits: &[Hit], meta: &[CiMeta], k: usize, now: DateTime<Utc>) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = hits
        .iter()
        .filter_map(|hit| {
            meta.get(hit.handle)
                .map(|m| score_candidate(hit.similarity as f64, m, now))
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    scored
}

/// Query handle over an immutable index snapshot. Cheap to clone.
#[derive(Clone)]
pub struct Suggester {
    snapshot: Arc<IndexSnapshot>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl Suggester {
    pub fn new(snapshot: Arc<IndexSnapshot>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { snapshot, provider }
    }

    /// Create the configured provider and load the artifacts built with it.
    pub fn load(config: &Config) -> anyhow::Result<Self> {
        let provider = create_provider(&config.embedding)?;
        let snapshot =
            IndexSnapshot::load(&DataLayout::from_config(config), provider.model_name())?;
        tracing::info!(
            stage = "api",
            vectors = snapshot.index.len(),
            dims = snapshot.index.dims(),
            "Index loaded with {} vectors",
            snapshot.index.len()
        );
        Ok(Self::new(Arc::new(snapshot), provider))
    }

    pub fn snapshot(&self) -> &IndexSnapshot {
        &self.snapshot
    }

    pub async fn suggest(&self, query: &str, k: i64) -> Result<Vec<ScoredCandidate>, SuggestError> {
        self.suggest_at(query, k, Utc::now()).await
    }

    /// Rank CIs for `query` as of `now`. `k <= 0` yields no results.
    pub async fn suggest_at(
        &self,
        query: &str,
        k: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredCandidate>, SuggestError> {
        if k <= 0 || self.snapshot.index.is_empty() {
            return Ok(Vec::new());
        }
        let k = usize::try_from(k).unwrap_or(usize::MAX);

        let vector = embed_query(self.provider.as_ref(), query)
            .await
            .map_err(SuggestError::Embedding)?;
        let hits = candidates(&self.snapshot.index, &vector, k)?;
        let results = rerank(&hits, &self.snapshot.meta, k, now);

        tracing::info!(
            stage = "api",
            candidates = hits.len(),
            returned = results.len(),
            "suggest_ci q={:?} k={} returned {}",
            query,
            k,
            results.len()
        );

        Ok(results)
    }
}

/// Run `cisug suggest`: rank CIs for `query` and print them.
pub async fn run_suggest(config: &Config, query: &str, k: Option<i64>, json: bool) -> anyhow::Result<()> {
    let suggester = Suggester::load(config)?;
    let k = k.unwrap_or(config.server.default_k).min(config.server.max_k);
    let results = suggester.suggest(query, k).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No suggestions.");
        return Ok(());
    }

    for (i, r) in results.iter().enumerate() {
        println!("{}. [{:.4}] {} ({})", i + 1, r.score, r.ci_name, r.ci_id);
        println!(
            "    sim={:.3} freq={:.3} recency={:.3} quality={:.3} changes={}",
            r.features.similarity,
            r.features.frequency,
            r.features.recency,
            r.features.quality,
            r.features.total
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Manifest;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn meta(id: &str, total: u64, success: u64, incidents: u64, last: Option<&str>) -> CiMeta {
        CiMeta {
            id: id.to_string(),
            name: format!("{}-name", id),
            stats: ChangeStats {
                total,
                success,
                caused_incidents: incidents,
                last_change_at: last.map(str::to_string),
            },
        }
    }

    #[test]
    fn quality_is_zero_without_changes() {
        assert_eq!(quality_term(&ChangeStats::default()), 0.0);
    }

    #[test]
    fn quality_penalizes_incidents() {
        let stats = ChangeStats {
            total: 4,
            success: 2,
            caused_incidents: 2,
            last_change_at: None,
        };
        assert!((quality_term(&stats) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn recency_term_bounds_and_monotonicity() {
        assert_eq!(recency_term(0.0), 1.0);
        let mut prev = recency_term(0.0);
        for days in [1.0, 7.0, 30.0, 90.0, 365.0, 3650.0] {
            let r = recency_term(days);
            assert!(r > 0.0 && r <= 1.0);
            assert!(r < prev);
            prev = r;
        }
    }

    #[test]
    fn frequency_term_monotone_from_zero() {
        assert_eq!(frequency_term(0), 0.0);
        let mut prev = 0.0;
        for total in 1..50 {
            let f = frequency_term(total);
            assert!(f >= prev);
            prev = f;
        }
    }

    #[test]
    fn recency_days_parses_naive_as_utc() {
        assert_eq!(recency_days(Some("2024-05-31 12:00:00"), now()), 1.0);
        assert_eq!(recency_days(Some("2024-05-31 12:00:01"), now()), 0.0);
        assert_eq!(recency_days(Some("2024-05-22T12:00:00Z"), now()), 10.0);
        assert_eq!(recency_days(Some("2024-05-22T12:00:00.250"), now()), 10.0);
        assert_eq!(recency_days(Some("2024-05-22T14:00:00+02:00"), now()), 10.0);
    }

    #[test]
    fn recency_days_fallbacks() {
        assert_eq!(recency_days(None, now()), 365.0);
        assert_eq!(recency_days(Some("last tuesday"), now()), 365.0);
        assert_eq!(recency_days(Some("2030-01-01 00:00:00"), now()), 0.0);
    }

    #[test]
    fn busy_healthy_ci_beats_idle_ci_at_equal_similarity() {
        let a = meta("A", 10, 9, 0, Some("2024-06-01 08:00:00"));
        let b = meta("B", 0, 0, 0, None);

        let sa = score_candidate(0.5, &a, now());
        let sb = score_candidate(0.5, &b, now());
        assert!((sa.features.quality - 0.9).abs() < 1e-12);
        assert_eq!(sa.features.recency, 1.0);
        assert_eq!(sb.features.frequency, 0.0);
        assert!((sb.features.recency - (-365.0f64 / 90.0).exp()).abs() < 1e-12);
        assert_eq!(sb.features.quality, 0.0);

        let hits = [
            Hit {
                similarity: 0.5,
                handle: 1,
            },
            Hit {
                similarity: 0.5,
                handle: 0,
            },
        ];
        let ranked = rerank(&hits, &[a, b], 2, now());
        assert_eq!(ranked[0].ci_id, "A");
        assert_eq!(ranked[1].ci_id, "B");
    }

    #[test]
    fn ties_keep_retrieval_order() {
        let metas = vec![meta("x", 0, 0, 0, None), meta("y", 0, 0, 0, None)];
        let hits = [
            Hit {
                similarity: 0.3,
                handle: 1,
            },
            Hit {
                similarity: 0.3,
                handle: 0,
            },
        ];
        let ranked = rerank(&hits, &metas, 5, now());
        assert_eq!(ranked[0].ci_id, "y");
        assert_eq!(ranked[1].ci_id, "x");
    }

    #[test]
    fn nan_scores_do_not_disturb_finite_order() {
        let metas: Vec<CiMeta> = (0..4).map(|i| meta(&i.to_string(), 0, 0, 0, None)).collect();
        let hits: Vec<Hit> = [0.2, f32::NAN, 0.9, 0.5]
            .iter()
            .enumerate()
            .map(|(handle, &similarity)| Hit { similarity, handle })
            .collect();

        let ranked = rerank(&hits, &metas, 4, now());
        assert_eq!(ranked.len(), 4);
        let finite: Vec<&str> = ranked
            .iter()
            .filter(|c| c.score.is_finite())
            .map(|c| c.ci_id.as_str())
            .collect();
        assert_eq!(finite, vec!["2", "3", "0"]);
    }

    fn axis_index(n: usize, dims: usize) -> FlatIpIndex {
        let mut index = FlatIpIndex::new(dims);
        for i in 0..n {
            let mut v = vec![0.0; dims];
            v[0] = 1.0 - i as f32 / n as f32;
            v[1] = (i as f32 / n as f32).sqrt();
            index.add(&v).unwrap();
        }
        index
    }

    #[test]
    fn overfetch_is_four_times_k_capped_by_index_size() {
        let query = [1.0, 0.0];
        assert_eq!(candidates(&axis_index(10, 2), &query, 3).unwrap().len(), 10);
        assert_eq!(candidates(&axis_index(20, 2), &query, 3).unwrap().len(), 12);
        let metas: Vec<CiMeta> = (0..10).map(|i| meta(&i.to_string(), 0, 0, 0, None)).collect();
        let hits = candidates(&axis_index(10, 2), &query, 3).unwrap();
        assert_eq!(rerank(&hits, &metas, 3, now()).len(), 3);
    }

    #[test]
    fn rescoring_can_promote_beyond_similarity_top_k() {
        let index = axis_index(10, 2);
        let mut metas: Vec<CiMeta> = (0..10).map(|i| meta(&i.to_string(), 0, 0, 0, None)).collect();
        metas[8] = meta("busy", 40, 40, 0, Some("2024-06-01 00:00:00"));

        let hits = candidates(&index, &[1.0, 0.0], 3).unwrap();
        let ranked = rerank(&hits, &metas, 3, now());
        assert_eq!(ranked[0].ci_id, "busy");
    }

    /// Embeds "north"/"east" to fixed axes; anything else fails.
    struct CompassProvider {
        dims: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for CompassProvider {
        fn model_name(&self) -> &str {
            "compass"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dims];
                    match t.as_str() {
                        "north" => v[0] = 2.0,
                        "east" => v[1] = 3.0,
                        other => anyhow::bail!("unknown direction {}", other),
                    }
                    Ok(v)
                })
                .collect()
        }
    }

    fn suggester(provider_dims: usize) -> Suggester {
        let mut index = FlatIpIndex::new(2);
        index.add(&[1.0, 0.0]).unwrap();
        index.add(&[0.0, 1.0]).unwrap();
        let metas = vec![meta("n", 0, 0, 0, None), meta("e", 0, 0, 0, None)];
        let manifest = Manifest {
            model: "compass".to_string(),
            dims: 2,
            count: 2,
            corpus_sha256: String::new(),
            built_at: String::new(),
        };
        let snapshot = IndexSnapshot::new(index, metas, manifest).unwrap();
        Suggester::new(
            Arc::new(snapshot),
            Arc::new(CompassProvider {
                dims: provider_dims,
            }),
        )
    }

    #[tokio::test]
    async fn suggest_ranks_by_similarity_and_is_deterministic() {
        let s = suggester(2);
        let first = s.suggest_at("east", 2, now()).await.unwrap();
        let second = s.suggest_at("east", 2, now()).await.unwrap();

        assert_eq!(first[0].ci_id, "e");
        assert!((first[0].features.similarity - 1.0).abs() < 1e-6);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn non_positive_k_is_empty() {
        let s = suggester(2);
        assert!(s.suggest_at("north", 0, now()).await.unwrap().is_empty());
        assert!(s.suggest_at("north", -3, now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_reported() {
        let s = suggester(3);
        let err = s.suggest_at("north", 1, now()).await.unwrap_err();
        assert!(matches!(
            err,
            SuggestError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn embedding_failure_is_reported() {
        let s = suggester(2);
        let err = s.suggest_at("up", 1, now()).await.unwrap_err();
        assert!(matches!(err, SuggestError::Embedding(_)));
    }
}
