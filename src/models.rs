//! Core data models used throughout the CI suggester.
//!
//! Raw records ([`ConfigurationItem`], [`ChangeRequest`]) are decoded from the
//! table API's JSON, reduced into per-CI [`ChangeStats`] and [`CorpusEntry`]
//! profiles by the corpus builder, and surface at query time as
//! [`ScoredCandidate`]s.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Decode a record field that may arrive as a string, number, boolean, null,
/// or a reference object (`{"value": "...", "link": "..."}`).
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(value_to_string))
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(mut map) => map.remove("value").and_then(value_to_string),
        Value::Null | Value::Array(_) => None,
    }
}

/// Parse the boolean-like flags the asset store emits as strings.
///
/// Exactly `"true"` and `"1"` (case-insensitive) are truthy. Everything
/// else, including `"yes"` and padded values like `" true "`, is false.
pub fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

/// One asset record as fetched from the CI table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigurationItem {
    #[serde(rename = "sys_id", default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub comments: Option<String>,
    #[serde(rename = "u_environment", default, deserialize_with = "lenient_string")]
    pub environment: Option<String>,
    #[serde(rename = "u_service", default, deserialize_with = "lenient_string")]
    pub service: Option<String>,
}

/// One change record linked to a CI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeRequest {
    #[serde(rename = "sys_id", default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(rename = "cmdb_ci", default, deserialize_with = "lenient_string")]
    pub ci_id: Option<String>,
    /// `YYYY-MM-DD HH:MM:SS` in UTC; lexicographic order is chronological.
    #[serde(rename = "sys_created_on", default, deserialize_with = "lenient_string")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub close_code: Option<String>,
    #[serde(rename = "u_caused_incident", default, deserialize_with = "lenient_string")]
    pub caused_incident: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub short_description: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: Option<String>,
}

impl ChangeRequest {
    pub fn is_successful(&self) -> bool {
        self.close_code
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case("successful"))
    }

    pub fn caused_incident(&self) -> bool {
        self.caused_incident.as_deref().is_some_and(is_truthy)
    }
}

/// Aggregate change statistics for one CI over the lookback window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeStats {
    pub total: u64,
    pub success: u64,
    #[serde(rename = "caused_inc")]
    pub caused_incidents: u64,
    /// Latest `sys_created_on` in the window, kept in the source's format.
    #[serde(rename = "last_change")]
    pub last_change_at: Option<String>,
}

/// Per-CI metadata stored alongside the corpus text and the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiMeta {
    #[serde(rename = "sys_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stats: ChangeStats,
}

/// One element of the persisted corpus artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub text: String,
    pub meta: CiMeta,
}

/// Individual scoring terms reported with each suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Features {
    #[serde(rename = "s_i")]
    pub similarity: f64,
    #[serde(rename = "f_i")]
    pub frequency: f64,
    #[serde(rename = "r_i")]
    pub recency: f64,
    #[serde(rename = "q_i")]
    pub quality: f64,
    pub total: u64,
}

/// A ranked CI suggestion returned by the query endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    #[serde(rename = "ci_sys_id")]
    pub ci_id: String,
    pub ci_name: String,
    pub score: f64,
    pub features: Features,
}
