//! ETL progress reporting.
//!
//! Reports what the corpus builder is doing so operators can watch a long
//! harvest: which table is being fetched and how many CIs have been profiled.
//! Progress is emitted on **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event from the corpus builder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EtlProgressEvent {
    /// Paging through a table; total unknown until the last page arrives.
    Fetching { table: String },
    /// `n` of `total` CIs have been profiled.
    Profiling { n: u64, total: u64 },
    /// The corpus artifact was written with `entries` profiles.
    Written { entries: u64 },
}

/// Receives progress events. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: EtlProgressEvent);
}

/// Human-friendly progress on stderr: "etl  profiling  1,200 / 5,000 CIs".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: EtlProgressEvent) {
        let line = match &event {
            EtlProgressEvent::Fetching { table } => format!("etl  fetching {}...\n", table),
            EtlProgressEvent::Profiling { n, total } => format!(
                "etl  profiling  {} / {} CIs\n",
                format_number(*n),
                format_number(*total)
            ),
            EtlProgressEvent::Written { entries } => {
                format!("etl  wrote {} profiles\n", format_number(*entries))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: EtlProgressEvent) {
        let obj = match &event {
            EtlProgressEvent::Fetching { table } => serde_json::json!({
                "event": "progress",
                "phase": "fetching",
                "table": table
            }),
            EtlProgressEvent::Profiling { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "profiling",
                "n": n,
                "total": total
            }),
            EtlProgressEvent::Written { entries } => serde_json::json!({
                "event": "progress",
                "phase": "written",
                "entries": entries
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: EtlProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Parse the `--progress` flag; `auto` picks human output on a TTY.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::default_for_tty()),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            "off" => Some(ProgressMode::Off),
            _ => None,
        }
    }

    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn parse_modes() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
