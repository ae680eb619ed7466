//! Workflow execution engine.
//!
//! Drives a validated configuration through its stages: allocates the run
//! directory, dispatches each stage to its hosts (local subprocess or SSH),
//! streams output to the console while capturing it for metadata, runs
//! health checks, collects declared outputs, stops background stages at
//! teardown, renders plots and persists the run's metadata record.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context as AnyhowContext, Result};
use bench_config::{
    Config, DataType, HealthCheckType, Host, Output, Stage,
};
use bench_exec::{
    call_with_retry, open_client, CommandRequest, Context, ExecutionClient, SharedSink,
};
use bench_plot::renderer_for;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

pub mod background;
pub mod inspect;

use background::{BackgroundManager, BackgroundRecord};

pub const ENV_RUN_ID: &str = "BENCHCTL_RUN_ID";
pub const ENV_OUTPUT_DIR: &str = "BENCHCTL_OUTPUT_DIR";
pub const ENV_RUN_DIR: &str = "BENCHCTL_RUN_DIR";
pub const ENV_CONFIG_PATH: &str = "BENCHCTL_CONFIG_PATH";
pub const ENV_BENCHCTL_BIN: &str = "BENCHCTL_BIN";

pub const DEFAULT_SHELL: &str = "bash -lic";

pub const METADATA_FILENAME: &str = "metadata.json";

/// The record persisted as `metadata.json` in every run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub benchmark_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub config: Config,
    pub hosts: BTreeMap<String, Host>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

/// Caller-supplied inputs for one workflow invocation.
#[derive(Debug, Default)]
pub struct WorkflowOptions {
    /// Seed for the run's custom metadata map.
    pub custom_metadata: BTreeMap<String, String>,
    /// Extra KEY=VALUE pairs exported into every stage.
    pub env_vars: BTreeMap<String, String>,
    /// Where the configuration was read from, exported as
    /// `BENCHCTL_CONFIG_PATH` when known.
    pub config_path: Option<PathBuf>,
    /// Stage names to skip in addition to per-stage `skip` flags.
    pub skip_stages: Vec<String>,
    /// Whether logs go to a file rather than the console; controls whether
    /// captured stage output is echoed into the log.
    pub log_to_file: bool,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
}

/// Execute the whole workflow. The run directory and `metadata.json` are
/// left behind even when a stage fails; background stages are always given
/// their teardown before an error is surfaced.
pub fn run_workflow(ctx: &Context, cfg: &Config, opts: WorkflowOptions) -> Result<RunOutcome> {
    let run_id = generate_run_id(&cfg.benchmark.output_dir)?;
    let run_dir = Path::new(&cfg.benchmark.output_dir).join(&run_id);
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;

    let start_time = Utc::now();
    let mut metadata = RunMetadata {
        run_id: run_id.clone(),
        benchmark_name: cfg.benchmark.name.clone(),
        start_time,
        end_time: start_time,
        config: cfg.clone(),
        hosts: cfg.hosts.clone(),
        custom: opts.custom_metadata.clone(),
    };

    info!("run ID: {run_id}");
    info!("results will be saved to: {}", run_dir.display());

    let mut background = BackgroundManager::new();
    let stage_err = execute_stages(ctx, cfg, &run_id, &run_dir, &mut metadata, &mut background, &opts)
        .err();
    let stop_err = background.stop_all(ctx, &run_dir).err();
    let plot_err = if stage_err.is_none() && stop_err.is_none() {
        render_plots(ctx, cfg, &run_dir).err()
    } else {
        None
    };

    // The metadata record is written even on failure so a broken run can
    // still be inspected and compared.
    metadata.end_time = Utc::now();
    let save_result = save_metadata(&metadata, &run_dir);

    if let Some(err) = stage_err {
        if let Some(stop_err) = stop_err {
            warn!("also failed to stop background stages: {stop_err:#}");
        }
        return Err(err);
    }
    if let Some(err) = stop_err {
        return Err(err);
    }
    if let Some(err) = plot_err {
        return Err(err);
    }
    save_result?;

    info!("workflow completed successfully");
    info!("results saved to: {}", run_dir.display());
    Ok(RunOutcome { run_id, run_dir })
}

/// Smallest positive integer with no existing directory under the output
/// root. Not atomic across concurrent invocations sharing the root; that
/// is a documented limitation.
pub fn generate_run_id(output_dir: &str) -> Result<String> {
    let root = Path::new(output_dir);
    let mut run_num: u64 = 1;
    loop {
        let run_id = run_num.to_string();
        if !root.join(&run_id).exists() {
            return Ok(run_id);
        }
        run_num = run_num
            .checked_add(1)
            .ok_or_else(|| anyhow!("run id space exhausted under {output_dir}"))?;
    }
}

fn execute_stages(
    ctx: &Context,
    cfg: &Config,
    run_id: &str,
    run_dir: &Path,
    metadata: &mut RunMetadata,
    background: &mut BackgroundManager,
    opts: &WorkflowOptions,
) -> Result<()> {
    if cfg.stages.is_empty() {
        return Ok(());
    }

    let env_prefix = build_env_prefix(run_id, run_dir, cfg, opts)?;
    let is_tty = io::stdout().is_terminal();
    let console: Option<SharedSink> = if is_tty {
        let sink: SharedSink = Arc::new(Mutex::new(io::stdout()));
        Some(sink)
    } else {
        None
    };
    // When the user already watches the stream live there is no point in
    // echoing the captured output a second time.
    let log_stage_output = !is_tty || opts.log_to_file;

    let mut runner = StageRunner {
        ctx,
        cfg,
        run_id,
        run_dir,
        env_prefix,
        console,
        use_pty: is_tty,
        log_stage_output,
        metadata,
        background,
        skip_stages: &opts.skip_stages,
    };
    runner.execute()
}

struct StageRunner<'a> {
    ctx: &'a Context,
    cfg: &'a Config,
    run_id: &'a str,
    run_dir: &'a Path,
    env_prefix: String,
    console: Option<SharedSink>,
    use_pty: bool,
    log_stage_output: bool,
    metadata: &'a mut RunMetadata,
    background: &'a mut BackgroundManager,
    skip_stages: &'a [String],
}

impl StageRunner<'_> {
    fn execute(&mut self) -> Result<()> {
        let cfg = self.cfg;
        let skip_stages = self.skip_stages;
        let total = cfg.stages.len();
        for (index, stage) in cfg.stages.iter().enumerate() {
            let skipped = stage.skip || skip_stages.iter().any(|s| s == &stage.name);
            if skipped {
                info!("skipping stage: {}/{} {}", index + 1, total, stage.name);
                continue;
            }
            info!("executing stage: {}/{} {}", index + 1, total, stage.name);

            let host_aliases = resolve_stage_hosts(stage);
            let multi_host = host_aliases.len() > 1;
            for (host_index, alias) in host_aliases.iter().enumerate() {
                let host = match cfg.hosts.get(alias) {
                    Some(host) => host.clone(),
                    None => {
                        ensure!(
                            alias == "local",
                            "stage {} references unknown host {alias}",
                            stage.name
                        );
                        Host::default()
                    }
                };

                let mut client = open_client(&host).map_err(|e| {
                    anyhow!("error creating execution client for stage {}: {e}", stage.name)
                })?;
                let outcome =
                    self.run_on_host(stage, &host, alias, host_index, multi_host, client.as_mut());
                let _ = client.close();
                outcome?;
            }
        }
        Ok(())
    }

    fn run_on_host(
        &mut self,
        stage: &Stage,
        host: &Host,
        host_alias: &str,
        host_index: usize,
        multi_host: bool,
        client: &mut dyn ExecutionClient,
    ) -> Result<()> {
        let command_body = prepare_stage_command(self.ctx, stage, host, self.run_id, client)?;
        let command_body = wrap_with_shell(&command_body, &resolve_stage_shell(self.cfg, stage));

        if stage.background {
            let pid = start_background_stage(self.ctx, client, &self.env_prefix, &command_body, stage)?;
            self.background.add(BackgroundRecord {
                stage: stage.clone(),
                host_alias: host_alias.to_string(),
                host: host.clone(),
                pid,
            });
            info!("stage {} is running in background", stage.name);
            return Ok(());
        }

        let result = client.run_command(
            self.ctx,
            CommandRequest {
                command: format!("{}{}", self.env_prefix, command_body),
                stdout: self.console.clone(),
                stderr: self.console.clone(),
                use_pty: self.use_pty,
                ..CommandRequest::default()
            },
        );
        let result = match result {
            Ok(result) if result.exit_code != 0 => {
                if self.log_stage_output && !result.output.trim().is_empty() {
                    info!("stage {} captured output:\n{}", stage.name, result.output);
                }
                bail!(
                    "stage {} failed on host {host_alias}: command exited with code {}",
                    stage.name,
                    result.exit_code
                );
            }
            Ok(result) => result,
            Err(err) => {
                return Err(anyhow!(err)
                    .context(format!("stage {} failed on host {host_alias}", stage.name)));
            }
        };

        if self.log_stage_output {
            info!("stage {} output: {}", stage.name, result.output);
        }
        info!("stage {} completed (exit code: {})", stage.name, result.exit_code);

        if stage.append_metadata && host_index == 0 {
            if multi_host {
                warn!(
                    "stage {} has append_metadata with multiple hosts; only the first host is used",
                    stage.name
                );
            }
            if let Err(err) = append_stage_metadata(&stage.name, self.metadata, &result.output) {
                warn!("{err:#}");
                warn!("stage {} output was: {}", stage.name, result.output);
            } else {
                info!("stage {} metadata appended", stage.name);
            }
        }

        if let Some(hc) = &stage.health_check {
            run_health_check(self.ctx, client, stage, hc)?;
        }

        if !stage.outputs.is_empty() {
            collect_stage_outputs(self.ctx, client, self.run_dir, stage, host_alias, multi_host)?;
        }

        Ok(())
    }
}

/// `hosts` wins over `host`; a stage naming neither runs locally.
pub fn resolve_stage_hosts(stage: &Stage) -> Vec<String> {
    if !stage.hosts.is_empty() {
        return stage.hosts.clone();
    }
    if let Some(host) = &stage.host {
        if !host.trim().is_empty() {
            return vec![host.clone()];
        }
    }
    vec!["local".to_string()]
}

/// Inline commands are used verbatim. Scripts run via bash: locally in
/// place, remotely after an upload to a run-scoped temp path.
fn prepare_stage_command(
    ctx: &Context,
    stage: &Stage,
    host: &Host,
    run_id: &str,
    client: &mut dyn ExecutionClient,
) -> Result<String> {
    if let Some(command) = &stage.command {
        if !command.trim().is_empty() {
            return Ok(command.clone());
        }
    }
    let script = stage
        .script
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow!("stage {} has no command or script", stage.name))?;

    if host.is_local() {
        if Path::new(script).is_absolute() {
            return Ok(format!("bash {}", shell_quote(script)));
        }
        return Ok(format!("bash ./{script}"));
    }

    let local_path = if Path::new(script).is_absolute() {
        PathBuf::from(script)
    } else {
        std::env::current_dir()?.join(script)
    };
    let base = local_path
        .file_name()
        .ok_or_else(|| anyhow!("stage {}: script path has no file name", stage.name))?
        .to_string_lossy()
        .into_owned();
    let remote_path = format!("/tmp/benchctl-{run_id}-{base}");
    client
        .copy_to_host(ctx, &local_path, &remote_path)
        .with_context(|| format!("failed to upload script for stage {}", stage.name))?;
    let quoted = shell_quote(&remote_path);
    Ok(format!("chmod +x {quoted} && bash {quoted}"))
}

/// Launch the command as a detached session so the whole group can be
/// signalled later, and capture the leader PID the launcher prints.
fn start_background_stage(
    ctx: &Context,
    client: &mut dyn ExecutionClient,
    env_prefix: &str,
    command_body: &str,
    stage: &Stage,
) -> Result<String> {
    let launcher = format!(
        "{env_prefix}setsid sh -c {} >/dev/null 2>&1 & echo $!",
        shell_quote(command_body)
    );
    let result = client
        .run_command(ctx, CommandRequest::new(launcher))
        .with_context(|| format!("stage {} failed to start background command", stage.name))?;
    let pid = parse_pid(&result.output);
    ensure!(
        !pid.is_empty(),
        "stage {} failed to start background command: pid not captured",
        stage.name
    );
    Ok(pid)
}

fn parse_pid(output: &str) -> String {
    output
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Merge a stage's JSON stdout into the run's custom metadata. Numbers
/// keep their literal text, strings pass through, anything else is
/// re-serialised. The map is untouched when the output does not decode.
fn append_stage_metadata(
    stage_name: &str,
    metadata: &mut RunMetadata,
    output: &str,
) -> Result<()> {
    let mut stream = serde_json::Deserializer::from_str(output)
        .into_iter::<serde_json::Map<String, Value>>();
    let parsed = match stream.next() {
        Some(Ok(map)) => map,
        Some(Err(err)) => bail!(
            "stage {stage_name} append_metadata enabled but output is not valid JSON: {err}"
        ),
        None => bail!("stage {stage_name} append_metadata enabled but output is empty"),
    };

    for (key, value) in parsed {
        let rendered = match value {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s,
            other => serde_json::to_string(&other)?,
        };
        metadata.custom.insert(key, rendered);
    }
    Ok(())
}

fn run_health_check(
    ctx: &Context,
    client: &mut dyn ExecutionClient,
    stage: &Stage,
    hc: &bench_config::HealthCheck,
) -> Result<()> {
    let timeout = bench_config::parse_duration(&hc.timeout).map_err(|e| {
        anyhow!("error parsing health check timeout for stage {}: {e}", stage.name)
    })?;

    info!("running health check: {}", hc.check_type);
    match hc.check_type {
        HealthCheckType::Port => {
            let healthy = call_with_retry(
                ctx,
                || client.check_port(ctx, &hc.target, timeout),
                hc.retries,
                Duration::from_secs(1),
            )
            .map_err(|e| anyhow!("health check for stage {} failed: {e}", stage.name))?;
            ensure!(
                healthy,
                "health check for stage {} failed: port {} is not listening",
                stage.name,
                hc.target
            );
            info!(
                "health check for stage {} passed: port {} is listening",
                stage.name, hc.target
            );
        }
        other => bail!("unknown health check type for stage {}: {other}", stage.name),
    }
    Ok(())
}

/// Collected filename: the output name plus the remote path's extension,
/// disambiguated with the host alias when the stage fanned out.
pub fn output_filename(output: &Output, multi_host: bool, host_alias: &str) -> String {
    let ext = Path::new(&output.remote_path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    if multi_host {
        format!("{}__{}{}", output.name, host_alias, ext)
    } else {
        format!("{}{}", output.name, ext)
    }
}

/// Where an output lands: an explicit `local_path` wins (relative paths
/// under the run directory), the derived filename otherwise.
pub fn output_destination(
    run_dir: &Path,
    output: &Output,
    multi_host: bool,
    host_alias: &str,
) -> PathBuf {
    if let Some(local_path) = output.local_path.as_deref().filter(|p| !p.trim().is_empty()) {
        let path = Path::new(local_path);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        return run_dir.join(path);
    }
    run_dir.join(output_filename(output, multi_host, host_alias))
}

pub(crate) fn collect_stage_outputs(
    ctx: &Context,
    client: &mut dyn ExecutionClient,
    run_dir: &Path,
    stage: &Stage,
    host_alias: &str,
    multi_host: bool,
) -> Result<()> {
    for output in &stage.outputs {
        let local_path = output_destination(run_dir, output, multi_host, host_alias);
        client
            .copy_from_host(ctx, &output.remote_path, &local_path)
            .map_err(|e| {
                anyhow!(
                    "failed to collect output {} for stage {}: {e}",
                    output.name,
                    stage.name
                )
            })?;
        info!(
            "collected output {}: {} -> {}",
            output.name,
            output.remote_path,
            local_path.display()
        );
        if let Some(schema) = &output.data_schema {
            for col in &schema.columns {
                if col.column_type == DataType::Timestamp && col.format.is_none() {
                    warn!(
                        "data_schema.{} has type=timestamp without format; parsing falls back to auto-detection",
                        col.name
                    );
                }
            }
        }
    }
    Ok(())
}

/// Stage shell beats the benchmark shell beats the default login shell.
pub fn resolve_stage_shell(cfg: &Config, stage: &Stage) -> String {
    for candidate in [&stage.shell, &cfg.benchmark.shell] {
        if let Some(shell) = candidate {
            if !shell.trim().is_empty() {
                return shell.trim().to_string();
            }
        }
    }
    DEFAULT_SHELL.to_string()
}

pub fn wrap_with_shell(command: &str, shell: &str) -> String {
    let shell = shell.trim();
    let shell = if shell.is_empty() { DEFAULT_SHELL } else { shell };
    format!("{shell} {}", shell_quote(command))
}

/// Single-quote a value for the shell, escaping embedded quotes.
pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The `export K='v' …; ` preamble prepended to every stage command. User
/// keys are emitted in sorted order so the prefix is reproducible.
fn build_env_prefix(
    run_id: &str,
    run_dir: &Path,
    cfg: &Config,
    opts: &WorkflowOptions,
) -> Result<String> {
    let mut exports = vec![
        format!("{ENV_RUN_ID}={}", shell_quote(run_id)),
        format!("{ENV_OUTPUT_DIR}={}", shell_quote(&cfg.benchmark.output_dir)),
        format!("{ENV_RUN_DIR}={}", shell_quote(&run_dir.to_string_lossy())),
    ];
    if let Some(config_path) = &opts.config_path {
        exports.push(format!(
            "{ENV_CONFIG_PATH}={}",
            shell_quote(&config_path.to_string_lossy())
        ));
    }
    if let Ok(exe) = std::env::current_exe() {
        exports.push(format!(
            "{ENV_BENCHCTL_BIN}={}",
            shell_quote(&exe.to_string_lossy())
        ));
    }
    for (key, value) in &opts.env_vars {
        ensure!(
            is_valid_env_key(key),
            "invalid environment variable name '{key}'"
        );
        exports.push(format!("{key}={}", shell_quote(value)));
    }
    Ok(format!("export {}; ", exports.join(" ")))
}

fn render_plots(ctx: &Context, cfg: &Config, run_dir: &Path) -> Result<()> {
    for plot in &cfg.plots {
        info!("generating plot: {}", plot.name);

        let (data_path, matched_output) = resolve_plot_source(cfg, run_dir, plot)
            .ok_or_else(|| {
                anyhow!("plot {} references unknown output {}", plot.name, plot.source)
            })?;

        let format = plot.format.unwrap_or(bench_config::ExportFormat::Png);
        let export_path = run_dir.join(format!("{}.{}", plot.name, format.extension()));

        let mut plot = plot.clone();
        if plot.engine == bench_config::Engine::External {
            if let Some(schema) = &matched_output.data_schema {
                let hint = schema
                    .columns
                    .iter()
                    .find(|c| c.name == plot.x && c.column_type == DataType::Timestamp);
                if let Some(col) = hint {
                    if let Some(format) = col.format {
                        plot.options.insert(
                            "x_time_format".to_string(),
                            Value::String(format.as_str().to_string()),
                        );
                    }
                    if let Some(unit) = col.unit.as_deref().filter(|u| !u.trim().is_empty()) {
                        plot.options
                            .insert("x_time_unit".to_string(), Value::String(unit.to_lowercase()));
                    }
                }
            }
        }

        let data_path = absolutize(&data_path);
        let export_path = absolutize(&export_path);
        let renderer = renderer_for(plot.engine);
        renderer
            .render(ctx, &plot, &data_path, &export_path)
            .map_err(|e| anyhow!("failed to generate plot {}: {e}", plot.name))?;
    }
    Ok(())
}

/// The collected file backing a plot: the first declared host's copy of
/// the first output whose name matches the plot source.
fn resolve_plot_source<'a>(
    cfg: &'a Config,
    run_dir: &Path,
    plot: &bench_config::Plot,
) -> Option<(PathBuf, &'a Output)> {
    for stage in &cfg.stages {
        let aliases = resolve_stage_hosts(stage);
        let multi_host = aliases.len() > 1;
        for output in &stage.outputs {
            if output.name == plot.source {
                let path = output_destination(run_dir, output, multi_host, &aliases[0]);
                return Some((path, output));
            }
        }
    }
    None
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

pub fn save_metadata(metadata: &RunMetadata, run_dir: &Path) -> Result<()> {
    let path = run_dir.join(METADATA_FILENAME);
    let bytes = serde_json::to_vec_pretty(metadata).context("failed to marshal metadata")?;
    fs::write(&path, bytes)
        .with_context(|| format!("failed to save metadata to {}", path.display()))?;
    Ok(())
}
