#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use ci_suggester::config::{parse_config, Config};
use ci_suggester::embedding::EmbeddingProvider;
use ci_suggester::source::{RecordSource, TableQuery};
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

pub const DIMS: usize = 64;

/// Bag-of-words embedder: each lowercase token bumps one hashed bucket.
pub struct HashEmbedder;

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        token.to_lowercase().hash(&mut hasher);
        v[(hasher.finish() % DIMS as u64) as usize] += 1.0;
    }
    v
}

/// In-memory table API: serves `cis` for any table except the change
/// table, and filters changes by the `cmdb_ci=` clause.
pub struct FixtureSource {
    pub cis: Vec<Value>,
    pub changes: Vec<Value>,
}

#[async_trait]
impl RecordSource for FixtureSource {
    async fn fetch_page(
        &self,
        query: &TableQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let rows: Vec<Value> = if query.table == "change_request" {
            let filter = query.filter.clone().unwrap_or_default();
            let ci = filter
                .strip_prefix("cmdb_ci=")
                .and_then(|rest| rest.split('^').next())
                .unwrap_or("")
                .to_string();
            self.changes
                .iter()
                .filter(|c| {
                    let field = &c["cmdb_ci"];
                    field.get("value").unwrap_or(field).as_str() == Some(ci.as_str())
                })
                .cloned()
                .collect()
        } else {
            self.cis.clone()
        };
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }
}

pub fn fixture_source() -> FixtureSource {
    FixtureSource {
        cis: vec![
            json!({ "sys_id": "ci-pay", "name": "payments-gateway",
                    "description": "Card payment processing gateway",
                    "u_environment": "prod", "u_service": "payments" }),
            json!({ "sys_id": "ci-mail", "name": "mail-relay",
                    "description": "Outbound SMTP relay", "u_environment": "prod" }),
            json!({ "name": "orphan without id", "description": "payments gateway" }),
            json!({ "sys_id": "ci-wiki", "name": "wiki", "comments": "Internal documentation" }),
        ],
        changes: vec![
            json!({ "sys_id": "c1", "cmdb_ci": "ci-pay", "sys_created_on": "2024-05-30 09:00:00",
                    "close_code": "successful", "u_caused_incident": "false",
                    "short_description": "Rotate gateway TLS certificates" }),
            json!({ "sys_id": "c2", "cmdb_ci": "ci-pay", "sys_created_on": "2024-05-20 09:00:00",
                    "close_code": "successful", "u_caused_incident": "1",
                    "short_description": "Upgrade payment SDK" }),
            json!({ "sys_id": "c3", "cmdb_ci": { "value": "ci-mail", "link": "x" },
                    "sys_created_on": "2024-01-02 00:00:00",
                    "close_code": "unsuccessful", "u_caused_incident": "true",
                    "short_description": "Relay failover test" }),
        ],
    }
}

pub fn test_config(data_dir: &Path) -> Config {
    parse_config(&format!(
        r#"
[source]
instance = "acme.service-now.com"
page_size = 2

[storage]
data_dir = "{}"

[embedding]
provider = "ollama"
model = "hash-bow"
dims = {}
"#,
        data_dir.display(),
        DIMS
    ))
    .unwrap()
}
