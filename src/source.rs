//! Remote record source: the asset store's paginated table API.
//!
//! [`RecordSource`] is the seam the corpus builder and dependency check read
//! through. [`TableApiSource`] is the HTTP implementation: it calls
//! `GET <base>/now/table/<table>` with offset/limit paging, an encoded filter
//! and an optional field projection, authenticating with basic auth. Each
//! page request runs under the configured [`RetryPolicy`].
//!
//! # Pagination
//!
//! Paging is purely offset-based. [`fetch_all`] requests pages of
//! `page_size` records, advancing the offset by `page_size` each time, and
//! stops at the first empty page. A page that fails after all retries aborts
//! the whole fetch; partial results are never returned.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::retry::RetryPolicy;

/// A filtered read against one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableQuery {
    pub table: String,
    /// Encoded filter expression, e.g. `active=true`.
    pub filter: Option<String>,
    /// Field projection; empty means all fields.
    pub fields: Vec<String>,
    /// Ask for display values instead of raw values.
    pub display_value: bool,
}

impl TableQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn display_value(mut self, on: bool) -> Self {
        self.display_value = on;
        self
    }
}

/// Paginated, read-only access to the asset store.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch one page. An empty vector means there are no more records.
    async fn fetch_page(
        &self,
        query: &TableQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>>;
}

/// Fetch every record matching `query`, page by page, in source order.
pub async fn fetch_all(
    source: &dyn RecordSource,
    query: &TableQuery,
    page_size: usize,
) -> Result<Vec<Value>> {
    if page_size == 0 {
        bail!("page size must be > 0");
    }

    let mut records = Vec::new();
    let mut offset = 0;

    loop {
        let page = source
            .fetch_page(query, offset, page_size)
            .await
            .with_context(|| {
                format!(
                    "Failed to fetch {} records at offset {}",
                    query.table, offset
                )
            })?;
        if page.is_empty() {
            break;
        }
        records.extend(page);
        offset += page_size;
    }

    Ok(records)
}

/// HTTP client for the table API.
pub struct TableApiSource {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    retry: RetryPolicy,
}

impl TableApiSource {
    /// Build a client from configuration, reading credentials from the
    /// environment.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let (username, password) = config.credentials()?;
        Self::with_base_url(
            config.api_base(),
            username,
            password,
            RetryPolicy::from_config(config),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Build a client against an explicit base URL (ending in `/api`).
    pub fn with_base_url(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            retry,
        })
    }

    fn page_params(query: &TableQuery, offset: usize, limit: usize) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("sysparm_limit", limit.to_string()),
            ("sysparm_offset", offset.to_string()),
        ];
        if let Some(filter) = query.filter.as_deref().filter(|f| !f.is_empty()) {
            params.push(("sysparm_query", filter.to_string()));
        }
        if !query.fields.is_empty() {
            params.push(("sysparm_fields", query.fields.join(",")));
        }
        if query.display_value {
            params.push(("sysparm_display_value", "true".to_string()));
        }
        params
    }
}

#[async_trait]
impl RecordSource for TableApiSource {
    async fn fetch_page(
        &self,
        query: &TableQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let url = format!("{}/now/table/{}", self.base_url, query.table);
        let params = Self::page_params(query, offset, limit);
        let label = format!("GET {} offset={}", query.table, offset);

        self.retry
            .run(&label, |_| {
                let request = self
                    .client
                    .get(&url)
                    .basic_auth(&self.username, Some(&self.password))
                    .header("Accept", "application/json")
                    .query(&params);
                async move {
                    let response = request.send().await?;
                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        bail!("table API error {}: {}", status, body);
                    }
                    let json: Value = response.json().await?;
                    Ok(page_records(json))
                }
            })
            .await
    }
}

/// Extract the `result` array from a table API response body.
fn page_records(body: Value) -> Vec<Value> {
    match body {
        Value::Object(mut map) => match map.remove("result") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves `total` numbered records and remembers every offset requested.
    struct CountingSource {
        total: usize,
        offsets: Mutex<Vec<usize>>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl RecordSource for CountingSource {
        async fn fetch_page(
            &self,
            _query: &TableQuery,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<Value>> {
            self.offsets.lock().unwrap().push(offset);
            if self.fail_at == Some(offset) {
                bail!("maximum retries reached");
            }
            Ok((offset..(offset + limit).min(self.total))
                .map(|i| json!({ "sys_id": format!("ci{}", i) }))
                .collect())
        }
    }

    #[tokio::test]
    async fn fetch_all_pages_until_empty() {
        let source = CountingSource {
            total: 7,
            offsets: Mutex::new(Vec::new()),
            fail_at: None,
        };
        let records = fetch_all(&source, &TableQuery::new("cmdb_ci"), 3)
            .await
            .unwrap();

        assert_eq!(records.len(), 7);
        assert_eq!(records[0]["sys_id"], "ci0");
        assert_eq!(records[6]["sys_id"], "ci6");
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 3, 6, 9]);
    }

    #[tokio::test]
    async fn fetch_all_propagates_page_failure() {
        let source = CountingSource {
            total: 10,
            offsets: Mutex::new(Vec::new()),
            fail_at: Some(4),
        };
        let err = fetch_all(&source, &TableQuery::new("cmdb_ci"), 2)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("offset 4"));
    }

    #[tokio::test]
    async fn fetch_all_rejects_zero_page_size() {
        let source = CountingSource {
            total: 1,
            offsets: Mutex::new(Vec::new()),
            fail_at: None,
        };
        assert!(fetch_all(&source, &TableQuery::new("t"), 0).await.is_err());
    }

    #[test]
    fn page_params_include_filter_and_fields() {
        let q = TableQuery::new("change_request")
            .filter("cmdb_ci=abc^sys_created_on>=2024-01-01 00:00:00")
            .fields(&["sys_id", "close_code"]);
        let params = TableApiSource::page_params(&q, 200, 100);
        assert!(params.contains(&("sysparm_limit", "100".to_string())));
        assert!(params.contains(&("sysparm_offset", "200".to_string())));
        assert!(params.contains(&(
            "sysparm_query",
            "cmdb_ci=abc^sys_created_on>=2024-01-01 00:00:00".to_string()
        )));
        assert!(params.contains(&("sysparm_fields", "sys_id,close_code".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "sysparm_display_value"));

        let params = TableApiSource::page_params(&q.display_value(true), 0, 100);
        assert!(params.contains(&("sysparm_display_value", "true".to_string())));
    }

    #[test]
    fn missing_result_is_an_empty_page() {
        assert!(page_records(json!({})).is_empty());
        assert!(page_records(json!({ "result": null })).is_empty());
        assert_eq!(page_records(json!({ "result": [{ "a": 1 }] })).len(), 1);
    }
}
