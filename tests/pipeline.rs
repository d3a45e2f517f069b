mod common;

use chrono::{TimeZone, Utc};
use ci_suggester::artifact::DataLayout;
use ci_suggester::config::EtlConfig;
use ci_suggester::corpus::{corpus_bytes, read_corpus, CorpusBuilder};
use ci_suggester::index::IndexSnapshot;
use ci_suggester::pipeline::{run_build, run_etl, run_index};
use ci_suggester::progress::ProgressMode;
use ci_suggester::ranking::Suggester;
use common::{fixture_source, test_config, HashEmbedder};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn corpus_is_byte_identical_across_runs() {
    let source = fixture_source();
    let etl = EtlConfig::default();
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

    let first = CorpusBuilder::new(&source, &etl, 2)
        .build_at(now, "cmdb_ci_service", 365, 50)
        .await
        .unwrap();
    let second = CorpusBuilder::new(&source, &etl, 3)
        .build_at(now, "cmdb_ci_service", 365, 50)
        .await
        .unwrap();

    assert_eq!(corpus_bytes(&first).unwrap(), corpus_bytes(&second).unwrap());
}

#[tokio::test]
async fn etl_writes_corpus_without_id_less_cis() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let n = run_etl(&config, &fixture_source(), ProgressMode::Off)
        .await
        .unwrap();
    assert_eq!(n, 3);

    let corpus = read_corpus(&DataLayout::from_config(&config).corpus_path()).unwrap();
    let ids: Vec<&str> = corpus.iter().map(|e| e.meta.id.as_str()).collect();
    assert_eq!(ids, vec!["ci-pay", "ci-mail", "ci-wiki"]);

    let pay = &corpus[0];
    assert_eq!(pay.meta.stats.total, 2);
    assert_eq!(pay.meta.stats.success, 2);
    assert_eq!(pay.meta.stats.caused_incidents, 1);
    assert_eq!(
        pay.meta.stats.last_change_at.as_deref(),
        Some("2024-05-30 09:00:00")
    );
    assert!(pay
        .text
        .ends_with("Rotate gateway TLS certificates Upgrade payment SDK"));

    let mail = &corpus[1];
    assert_eq!(mail.meta.stats.total, 1);
    assert_eq!(mail.meta.stats.caused_incidents, 1);
    assert_eq!(corpus[2].meta.stats.total, 0);
}

#[tokio::test]
async fn build_then_suggest_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let manifest = run_build(&config, &fixture_source(), &HashEmbedder, ProgressMode::Off)
        .await
        .unwrap();
    assert_eq!(manifest.count, 3);
    assert_eq!(manifest.dims, common::DIMS);
    assert_eq!(manifest.model, "hash-bow");

    let layout = DataLayout::from_config(&config);
    let snapshot = IndexSnapshot::load(&layout, "hash-bow").unwrap();
    assert_eq!(snapshot.meta.len(), snapshot.index.len());

    let suggester = Suggester::new(Arc::new(snapshot), Arc::new(HashEmbedder));
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

    let results = suggester
        .suggest_at("payments gateway certificates", 2, now)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].ci_id, "ci-pay");
    assert!(results[0].score >= results[1].score);
    assert!(results.iter().all(|r| r.ci_id != "orphan without id"));

    let again = suggester
        .suggest_at("payments gateway certificates", 2, now)
        .await
        .unwrap();
    assert_eq!(results, again);

    let everything = suggester.suggest_at("anything", 50, now).await.unwrap();
    assert_eq!(everything.len(), 3);
}

#[tokio::test]
async fn index_requires_a_corpus() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let err = run_index(&config, &HashEmbedder).await.unwrap_err();
    assert!(err.to_string().contains("cisug etl"));
}

#[tokio::test]
async fn failed_fetch_leaves_previous_corpus_untouched() {
    use anyhow::bail;
    use async_trait::async_trait;
    use ci_suggester::source::{RecordSource, TableQuery};
    use serde_json::{json, Value};

    struct ChangesDown;

    #[async_trait]
    impl RecordSource for ChangesDown {
        async fn fetch_page(
            &self,
            query: &TableQuery,
            offset: usize,
            _limit: usize,
        ) -> anyhow::Result<Vec<Value>> {
            if query.table == "change_request" {
                bail!("maximum retries reached");
            }
            Ok(if offset == 0 {
                vec![json!({ "sys_id": "x", "name": "x" })]
            } else {
                Vec::new()
            })
        }
    }

    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    run_etl(&config, &fixture_source(), ProgressMode::Off)
        .await
        .unwrap();
    let corpus_path = DataLayout::from_config(&config).corpus_path();
    let before = std::fs::read(&corpus_path).unwrap();

    assert!(run_etl(&config, &ChangesDown, ProgressMode::Off).await.is_err());
    assert_eq!(std::fs::read(&corpus_path).unwrap(), before);
}
