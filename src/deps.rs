//! Dependency preflight: verify required applications are installed on the
//! asset store at a minimum version before the offline job runs.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::config::DependencyConfig;
use crate::source::{fetch_all, RecordSource, TableQuery};

const APP_TABLE: &str = "sys_app";

/// Parse a dotted numeric version such as `1.4.0`.
pub fn parse_version(version: &str) -> Result<Vec<u64>> {
    let version = version.trim();
    if version.is_empty() {
        bail!("empty version string");
    }
    version
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .with_context(|| format!("invalid version component '{}' in '{}'", part, version))
        })
        .collect()
}

/// Whether `installed` satisfies `minimum`.
///
/// Components are compared left to right; the first differing component
/// decides. When one version is a prefix of the other the longer one is
/// considered newer, so `1.2.0.1` satisfies `1.2.0` but `1.2` does not.
pub fn compare_versions(installed: &str, minimum: &str) -> Result<bool> {
    let installed = parse_version(installed)?;
    let minimum = parse_version(minimum)?;

    for (i, m) in installed.iter().zip(minimum.iter()) {
        if i > m {
            return Ok(true);
        }
        if i < m {
            return Ok(false);
        }
    }
    Ok(installed.len() >= minimum.len())
}

#[derive(Debug, Deserialize)]
struct AppRecord {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Installed version of the application called `name`, matched
/// case-insensitively, or `None` if it is not installed.
pub async fn installed_version(
    source: &dyn RecordSource,
    name: &str,
    page_size: usize,
) -> Result<Option<String>> {
    let query = TableQuery::new(APP_TABLE).fields(&["name", "version"]);
    let records = fetch_all(source, &query, page_size).await?;

    for record in records {
        let Ok(app) = serde_json::from_value::<AppRecord>(record) else {
            continue;
        };
        if app
            .name
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case(name))
        {
            return Ok(app.version);
        }
    }
    Ok(None)
}

async fn check_application(
    source: &dyn RecordSource,
    name: &str,
    minimum: &str,
    page_size: usize,
) -> Result<bool> {
    let Some(installed) = installed_version(source, name, page_size).await? else {
        tracing::warn!(stage = "deps", "Application {} not installed", name);
        return Ok(false);
    };

    if compare_versions(&installed, minimum)? {
        tracing::info!(
            stage = "deps",
            "Application {} {} satisfies minimum {}",
            name,
            installed,
            minimum
        );
        Ok(true)
    } else {
        tracing::warn!(
            stage = "deps",
            "Application {} installed version {} is less than the required minimum version {}",
            name,
            installed,
            minimum
        );
        Ok(false)
    }
}

/// Check every configured application.
///
/// Returns `false` only when a check failed and `fail_on_error` is set;
/// otherwise failures are logged and the check passes.
pub async fn check_dependencies(
    config: &DependencyConfig,
    source: &dyn RecordSource,
    page_size: usize,
) -> Result<bool> {
    let mut all_ok = true;

    for (name, minimum) in &config.applications {
        let ok = match check_application(source, name, minimum, page_size).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!(stage = "deps", "Dependency check for {} failed: {:#}", name, e);
                false
            }
        };
        all_ok &= ok;
    }

    if all_ok || !config.fail_on_error {
        Ok(true)
    } else {
        Ok(false)
    }
}
