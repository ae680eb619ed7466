//! Declarative benchmark configuration: typed model, strict decoding and
//! cross-field validation.
//!
//! A configuration names hosts, an ordered list of stages and optional
//! plots. Decoding is strict (unknown keys are errors, closed word sets are
//! enums); everything serde cannot express (uniqueness, references between
//! sections, mutually exclusive fields) is collected by [`Config::parse`]
//! into a single aggregated error listing every offence.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub benchmark: Benchmark,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts: BTreeMap<String, Host>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plots: Vec<Plot>,
}

/// Top-level benchmark metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Benchmark {
    /// Benchmark name recorded in run metadata.
    pub name: String,
    /// Directory under which numbered run directories are created.
    pub output_dir: String,
    /// Default shell invocation wrapping every stage command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Logging configuration. Without a path, logs go to stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// An execution environment. An empty `ip` means the local machine,
/// regardless of the other fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Host {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_password: String,
}

impl Host {
    /// A host with an empty network address runs commands locally.
    pub fn is_local(&self) -> bool {
        self.ip.trim().is_empty()
    }
}

/// One step of the workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    pub name: String,
    /// Single host alias. Mutually exclusive with `hosts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Host aliases the stage fans out over, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Path to a script; uploaded and executed on remote hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Shell invocation overriding the benchmark-level shell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// When set, stdout is parsed as one JSON object and merged into the
    /// run's custom metadata.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub append_metadata: bool,
    /// Detach the stage into its own process group; it is stopped and its
    /// outputs are collected at workflow teardown.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub background: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Output>,
}

/// Post-command readiness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheck {
    #[serde(rename = "type")]
    pub check_type: HealthCheckType,
    pub target: String,
    /// Duration string, e.g. `500ms` or `10s`.
    pub timeout: String,
    #[serde(default)]
    pub retries: u32,
}

/// Accepted health check kinds. Only `port` is currently executable; the
/// remaining names decode so configurations stay forward-compatible, and
/// the executor rejects them at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckType {
    Port,
    Http,
    File,
    Process,
    Command,
}

impl fmt::Display for HealthCheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthCheckType::Port => "port",
            HealthCheckType::Http => "http",
            HealthCheckType::File => "file",
            HealthCheckType::Process => "process",
            HealthCheckType::Command => "command",
        };
        f.write_str(name)
    }
}

/// A file collected from the stage's host into the run directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Output {
    pub name: String,
    pub remote_path: String,
    /// Explicit destination. Relative paths land under the run directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_schema: Option<DataSchema>,
}

/// Schema for structured (CSV) outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSchema {
    pub format: DataFormat,
    pub columns: Vec<DataColumn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Csv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Only meaningful for timestamp columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<TimestampFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    Float,
    String,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    Unix,
    UnixMs,
    UnixUs,
    UnixNs,
    Rfc3339,
    Rfc3339Nano,
    Iso8601,
}

impl TimestampFormat {
    /// Lower-case wire name, as passed to plot renderers.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampFormat::Unix => "unix",
            TimestampFormat::UnixMs => "unix_ms",
            TimestampFormat::UnixUs => "unix_us",
            TimestampFormat::UnixNs => "unix_ns",
            TimestampFormat::Rfc3339 => "rfc3339",
            TimestampFormat::Rfc3339Nano => "rfc3339_nano",
            TimestampFormat::Iso8601 => "iso8601",
        }
    }
}

/// A rendered view over one collected data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plot {
    pub name: String,
    #[serde(default)]
    pub title: String,
    /// Name of the stage output providing the data.
    pub source: String,
    #[serde(rename = "type")]
    pub plot_type: PlotType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub x: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ExportFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groupby: Option<String>,
    #[serde(default)]
    pub engine: Engine,
    /// Free-form renderer options, passed through verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotType {
    TimeSeries,
    Histogram,
    Boxplot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Avg,
    Median,
    P95,
    P99,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Png,
    Svg,
    Pdf,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Svg => "svg",
            ExportFormat::Pdf => "pdf",
        }
    }
}

/// Plot rendering engine. The external engine (pandas/seaborn through a
/// packaged script) is the default because it produces richer plots; the
/// native engine runs entirely in-process for environments without the
/// Python toolchain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Native,
    #[default]
    External,
}

impl Config {
    /// Strictly decode and validate a configuration document.
    pub fn parse(data: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, decode and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Config, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Config::parse(&data)
    }

    /// Cross-field validation. Every offence is collected so the user sees
    /// the whole list at once.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut errs: Vec<String> = Vec::new();

        if self.benchmark.name.trim().is_empty() {
            errs.push("benchmark.name must be set".to_string());
        }
        if self.benchmark.output_dir.trim().is_empty() {
            errs.push("benchmark.output_dir must be set".to_string());
        }

        // "local" is always a valid alias even when no hosts are declared.
        let mut aliases: BTreeSet<&str> = self.hosts.keys().map(String::as_str).collect();
        aliases.insert("local");

        let mut seen_stage_names: BTreeSet<&str> = BTreeSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                errs.push(format!("stages[{i}].name must be set"));
            } else if !seen_stage_names.insert(stage.name.as_str()) {
                errs.push(format!("stages[{i}].name '{}' is not unique", stage.name));
            }

            if stage.host.is_some() && !stage.hosts.is_empty() {
                errs.push(format!(
                    "stages[{i}]: host and hosts are mutually exclusive"
                ));
            }
            if let Some(host) = &stage.host {
                if !aliases.contains(host.as_str()) {
                    errs.push(format!(
                        "stages[{i}].host references unknown host '{host}'"
                    ));
                }
            }
            for host in &stage.hosts {
                if !aliases.contains(host.as_str()) {
                    errs.push(format!(
                        "stages[{i}].hosts references unknown host '{host}'"
                    ));
                }
            }

            let has_command = stage
                .command
                .as_deref()
                .is_some_and(|c| !c.trim().is_empty());
            let has_script = stage.script.as_deref().is_some_and(|s| !s.trim().is_empty());
            if has_command == has_script {
                errs.push(format!(
                    "stages[{i}]: exactly one of command or script must be set"
                ));
            }

            if stage.background && stage.append_metadata {
                errs.push(format!(
                    "stages[{i}]: background=true cannot set append_metadata"
                ));
            }

            if let Some(hc) = &stage.health_check {
                match parse_duration(&hc.timeout) {
                    Ok(d) if !d.is_zero() => {}
                    _ => errs.push(format!(
                        "stages[{i}].health_check.timeout must be a positive duration"
                    )),
                }
            }

            let mut seen_outputs: BTreeSet<&str> = BTreeSet::new();
            for (j, output) in stage.outputs.iter().enumerate() {
                if output.name.trim().is_empty() {
                    errs.push(format!("stages[{i}].outputs[{j}].name must be set"));
                } else if !seen_outputs.insert(output.name.as_str()) {
                    errs.push(format!(
                        "stages[{i}].outputs[{j}].name '{}' is not unique within the stage",
                        output.name
                    ));
                }
                if output.remote_path.trim().is_empty() {
                    errs.push(format!(
                        "stages[{i}].outputs[{j}].remote_path must be set"
                    ));
                }
                if let Some(schema) = &output.data_schema {
                    for (k, col) in schema.columns.iter().enumerate() {
                        if col.name.trim().is_empty() {
                            errs.push(format!(
                                "stages[{i}].outputs[{j}].data_schema.columns[{k}].name must be set"
                            ));
                        }
                        if col.format.is_some() && col.column_type != DataType::Timestamp {
                            errs.push(format!(
                                "stages[{i}].outputs[{j}].data_schema.columns[{k}].format is only valid for timestamp columns"
                            ));
                        }
                    }
                }
            }
        }

        let output_names: BTreeSet<&str> = self
            .stages
            .iter()
            .flat_map(|s| s.outputs.iter())
            .map(|o| o.name.as_str())
            .filter(|n| !n.trim().is_empty())
            .collect();

        let mut seen_plot_names: BTreeSet<&str> = BTreeSet::new();
        for (i, plot) in self.plots.iter().enumerate() {
            if plot.name.trim().is_empty() {
                errs.push(format!("plots[{i}].name must be set"));
            } else if !seen_plot_names.insert(plot.name.as_str()) {
                errs.push(format!("plots[{i}].name '{}' is not unique", plot.name));
            }
            if plot.source.trim().is_empty() {
                errs.push(format!("plots[{i}].source must be set"));
            } else if !output_names.contains(plot.source.as_str()) {
                errs.push(format!(
                    "plots[{i}].source references unknown output '{}'",
                    plot.source
                ));
            }
            if plot.groupby.is_some() && plot.engine == Engine::Native {
                errs.push(format!(
                    "plots[{i}].groupby is only supported with the external engine"
                ));
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errs))
        }
    }
}

/// Embedded default configuration template, written by `benchctl init`.
pub fn default_config_template() -> &'static str {
    include_str!("files/default_benchmark.yaml")
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration '{input}': {reason}")]
pub struct ParseDurationError {
    pub input: String,
    pub reason: &'static str,
}

/// Parse a Go-style duration string: a sequence of decimal numbers with a
/// unit suffix (`ns`, `us`, `ms`, `s`, `m`, `h`), e.g. `500ms` or `1m30s`.
pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let err = |reason| ParseDurationError {
        input: input.to_string(),
        reason,
    };

    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(err("empty string"));
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(err("expected a number"));
        }
        let value: f64 = rest[..digits].parse().map_err(|_| err("bad number"))?;
        let unit = &rest[digits..];
        let (consumed, nanos_per_unit) = if unit.starts_with("ns") {
            ("ns".len(), 1.0)
        } else if unit.starts_with("us") {
            ("us".len(), 1e3)
        } else if unit.starts_with("\u{b5}s") {
            ("\u{b5}s".len(), 1e3)
        } else if unit.starts_with("ms") {
            ("ms".len(), 1e6)
        } else if unit.starts_with('s') {
            (1, 1e9)
        } else if unit.starts_with('m') {
            (1, 60e9)
        } else if unit.starts_with('h') {
            (1, 3600e9)
        } else {
            return Err(err("missing or unknown unit"));
        };
        total += Duration::from_nanos((value * nanos_per_unit) as u64);
        rest = &unit[consumed..];
    }
    Ok(total)
}
