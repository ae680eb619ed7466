//! Post-run utilities over `metadata.json`: inspect, amend, compare.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};

use crate::{RunMetadata, METADATA_FILENAME};

pub fn load_metadata(run_dir: &Path) -> Result<RunMetadata> {
    let path = run_dir.join(METADATA_FILENAME);
    let data = fs::read(&path)
        .with_context(|| format!("failed to read run metadata {}", path.display()))?;
    let metadata: RunMetadata = serde_json::from_slice(&data)
        .with_context(|| format!("failed to decode run metadata {}", path.display()))?;
    Ok(metadata)
}

/// Human-readable summary of one run. `verbose` appends the full
/// configuration tree.
pub fn inspect_run(run_dir: &Path, verbose: bool) -> Result<String> {
    let metadata = load_metadata(run_dir)?;

    let mut out = String::new();
    let _ = writeln!(out, "benchmark: {}", metadata.benchmark_name);
    let _ = writeln!(out, "run_id: {}", metadata.run_id);
    let _ = writeln!(out, "start time: {}", metadata.start_time.to_rfc3339());
    let _ = writeln!(out, "end time: {}", metadata.end_time.to_rfc3339());
    if metadata.custom.is_empty() {
        let _ = writeln!(out, "custom metadata: (none)");
    } else {
        let _ = writeln!(out, "custom metadata:");
        for (key, value) in &metadata.custom {
            let _ = writeln!(out, "  {key}: {value}");
        }
    }
    if verbose {
        let config = serde_json::to_string_pretty(&metadata.config)
            .context("failed to render configuration")?;
        let _ = writeln!(out, "config:\n{config}");
    }
    Ok(out)
}

/// Merge key/value pairs into a run's custom metadata and rewrite the
/// record in place.
pub fn edit_run_metadata(run_dir: &Path, pairs: &BTreeMap<String, String>) -> Result<RunMetadata> {
    let mut metadata = load_metadata(run_dir)?;
    for (key, value) in pairs {
        metadata.custom.insert(key.clone(), value.clone());
    }
    crate::save_metadata(&metadata, run_dir)?;
    Ok(metadata)
}

/// One compared custom-metadata key across two runs.
#[derive(Debug, PartialEq)]
pub enum ComparisonResult {
    /// Both sides parsed as numbers.
    Numeric {
        key: String,
        left: f64,
        right: f64,
    },
    /// At least one side is non-numeric or missing.
    Text {
        key: String,
        left: Option<String>,
        right: Option<String>,
    },
}

impl ComparisonResult {
    pub fn format(&self) -> String {
        match self {
            ComparisonResult::Numeric { key, left, right } => {
                let delta = right - left;
                if *left != 0.0 {
                    let percent = delta / left * 100.0;
                    format!("{key}: {left} -> {right} ({delta:+} / {percent:+.2}%)")
                } else {
                    format!("{key}: {left} -> {right} ({delta:+})")
                }
            }
            ComparisonResult::Text { key, left, right } => {
                let render = |side: &Option<String>| match side {
                    Some(value) => format!("\"{value}\""),
                    None => "<missing>".to_string(),
                };
                format!("{key}: {} -> {}", render(left), render(right))
            }
        }
    }
}

/// Compare two runs' custom metadata key by key. Values that parse as
/// numbers on both sides get numeric deltas.
pub fn compare_runs(left: &RunMetadata, right: &RunMetadata) -> Vec<ComparisonResult> {
    let mut keys: Vec<&String> = left.custom.keys().chain(right.custom.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut results = Vec::with_capacity(keys.len());
    for key in keys {
        let lhs = left.custom.get(key);
        let rhs = right.custom.get(key);
        let numeric = lhs
            .and_then(|v| v.parse::<f64>().ok())
            .zip(rhs.and_then(|v| v.parse::<f64>().ok()));
        match numeric {
            Some((l, r)) => results.push(ComparisonResult::Numeric {
                key: key.clone(),
                left: l,
                right: r,
            }),
            None => results.push(ComparisonResult::Text {
                key: key.clone(),
                left: lhs.cloned(),
                right: rhs.cloned(),
            }),
        }
    }
    results
}

pub fn format_comparison(results: &[ComparisonResult]) -> String {
    results
        .iter()
        .map(ComparisonResult::format)
        .collect::<Vec<_>>()
        .join("\n")
}
