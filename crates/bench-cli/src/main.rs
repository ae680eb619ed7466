//! `benchctl`: benchmark workflow orchestrator CLI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use bench_config::{Config, LoggingConfig};
use bench_exec::Context;
use bench_runner::{inspect, run_workflow, WorkflowOptions};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "benchctl",
    version,
    about = "Orchestrate benchmark workflows across local and remote hosts"
)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the workflow described by a configuration file.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = "benchmark.yaml")]
        config: PathBuf,
        /// Custom metadata entries, key=value (repeatable).
        #[arg(short = 'm', long = "metadata", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
        /// Environment variables exported into every stage (repeatable).
        #[arg(short = 'e', long = "environment", value_name = "KEY=VALUE")]
        environment: Vec<String>,
        /// Abort the whole workflow after this duration, e.g. 30m.
        #[arg(long)]
        timeout: Option<String>,
        /// Stage names to skip (repeatable).
        #[arg(long = "skip", value_name = "STAGE")]
        skip: Vec<String>,
    },
    /// Write an embedded default configuration template.
    Init {
        #[arg(long, default_value = "benchmark.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Show a run's metadata record.
    Inspect {
        run_id: String,
        #[arg(long, default_value = "benchmark.yaml")]
        config: PathBuf,
        /// Also print the full configuration the run was produced with.
        #[arg(long)]
        full: bool,
    },
    /// Amend a run's custom metadata.
    Edit {
        run_id: String,
        #[arg(short = 'm', long = "metadata", value_name = "KEY=VALUE", required = true)]
        metadata: Vec<String>,
        #[arg(long, default_value = "benchmark.yaml")]
        config: PathBuf,
    },
    /// Compare two runs' custom metadata.
    Compare {
        run_id_a: String,
        run_id_b: String,
        #[arg(long, default_value = "benchmark.yaml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            metadata,
            environment,
            timeout,
            skip,
        } => run(cli.verbose, &config, &metadata, &environment, timeout, skip),
        Commands::Init { path, force } => init(&path, force),
        Commands::Inspect {
            run_id,
            config,
            full,
        } => {
            let run_dir = resolve_run_dir(&config, &run_id)?;
            print!("{}", inspect::inspect_run(&run_dir, full)?);
            Ok(())
        }
        Commands::Edit {
            run_id,
            metadata,
            config,
        } => {
            let run_dir = resolve_run_dir(&config, &run_id)?;
            let pairs = parse_pairs(&metadata)?;
            let updated = inspect::edit_run_metadata(&run_dir, &pairs)?;
            for (key, value) in &updated.custom {
                println!("{key}: {value}");
            }
            Ok(())
        }
        Commands::Compare {
            run_id_a,
            run_id_b,
            config,
        } => {
            let left = inspect::load_metadata(&resolve_run_dir(&config, &run_id_a)?)?;
            let right = inspect::load_metadata(&resolve_run_dir(&config, &run_id_b)?)?;
            let results = inspect::compare_runs(&left, &right);
            println!("{}", inspect::format_comparison(&results));
            Ok(())
        }
    }
}

fn run(
    verbose: u8,
    config_path: &Path,
    metadata: &[String],
    environment: &[String],
    timeout: Option<String>,
    skip: Vec<String>,
) -> Result<()> {
    let cfg = Config::from_path(config_path)
        .with_context(|| format!("error loading {}", config_path.display()))?;

    let log_to_file = init_tracing(verbose, cfg.benchmark.logging.as_ref())?;

    let custom_metadata = parse_pairs(metadata)?;
    let env_vars = parse_pairs(environment)?;
    for key in env_vars.keys() {
        if !bench_runner::is_valid_env_key(key) {
            bail!("invalid --environment name '{key}'");
        }
    }

    let mut ctx = Context::background();
    if let Some(timeout) = timeout {
        let duration = bench_config::parse_duration(&timeout)
            .map_err(|e| anyhow!("invalid --timeout: {e}"))?;
        ctx = ctx.with_timeout(duration);
    }
    let cancel = ctx.cancel_flag();
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    })
    .context("failed to install interrupt handler")?;

    let opts = WorkflowOptions {
        custom_metadata,
        env_vars,
        config_path: Some(config_path.to_path_buf()),
        skip_stages: skip,
        log_to_file,
    };
    let outcome = run_workflow(&ctx, &cfg, opts)?;
    println!("run_id: {}", outcome.run_id);
    println!("run_dir: {}", outcome.run_dir.display());
    Ok(())
}

fn init(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        bail!("config file already exists (use --force): {}", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bench_config::default_config_template())?;
    println!("wrote: {}", path.display());
    println!("next: edit {} and run `benchctl run --config {}`", path.display(), path.display());
    Ok(())
}

/// Runs live under the configured output root, one directory per id.
fn resolve_run_dir(config_path: &Path, run_id: &str) -> Result<PathBuf> {
    let cfg = Config::from_path(config_path)
        .with_context(|| format!("error loading {}", config_path.display()))?;
    let run_dir = Path::new(&cfg.benchmark.output_dir).join(run_id);
    if !run_dir.exists() {
        bail!("run {run_id} not found under {}", cfg.benchmark.output_dir);
    }
    Ok(run_dir)
}

fn parse_pairs(values: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid '{raw}': expected key=value"))?;
        if key.trim().is_empty() {
            bail!("invalid '{raw}': key cannot be empty");
        }
        out.insert(key.to_string(), value.to_string());
    }
    Ok(out)
}

/// Level comes from `-v` flags, then the config, then `info`; an explicit
/// `RUST_LOG` wins over all of them. Returns whether logs go to a file.
fn init_tracing(verbose: u8, logging: Option<&LoggingConfig>) -> Result<bool> {
    let level = match verbose {
        0 => logging
            .map(|l| l.level.trim())
            .filter(|l| !l.is_empty())
            .unwrap_or("info")
            .to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if let Some(path) = logging.and_then(|l| l.path.as_deref()).filter(|p| !p.trim().is_empty()) {
        let file = std::fs::File::create(path)
            .with_context(|| format!("error creating log file {path}"))?;
        builder.with_ansi(false).with_writer(Arc::new(file)).init();
        Ok(true)
    } else {
        builder.init();
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_parse_and_reject_garbage() {
        let parsed = parse_pairs(&["a=1".to_string(), "b=x=y".to_string()]).unwrap();
        assert_eq!(parsed["a"], "1");
        assert_eq!(parsed["b"], "x=y");
        assert!(parse_pairs(&["nope".to_string()]).is_err());
        assert!(parse_pairs(&["=value".to_string()]).is_err());
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "benchctl",
            "run",
            "--config",
            "bench.yaml",
            "-m",
            "owner=perf",
            "-e",
            "RATE=100",
            "--timeout",
            "30m",
            "--skip",
            "teardown",
        ])
        .expect("flags must parse");
        match cli.command {
            Commands::Run {
                config,
                metadata,
                environment,
                timeout,
                skip,
            } => {
                assert_eq!(config, PathBuf::from("bench.yaml"));
                assert_eq!(metadata, vec!["owner=perf"]);
                assert_eq!(environment, vec!["RATE=100"]);
                assert_eq!(timeout.as_deref(), Some("30m"));
                assert_eq!(skip, vec!["teardown"]);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn cli_parses_compare_positionals() {
        let cli = Cli::try_parse_from(["benchctl", "compare", "1", "2"]).expect("must parse");
        match cli.command {
            Commands::Compare {
                run_id_a, run_id_b, ..
            } => {
                assert_eq!(run_id_a, "1");
                assert_eq!(run_id_b, "2");
            }
            _ => panic!("expected compare command"),
        }
    }
}
