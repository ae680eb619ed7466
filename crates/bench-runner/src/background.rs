//! Lifecycle of detached background stages.
//!
//! A background stage is launched as its own session (`setsid`) so the
//! whole process group can be signalled by its leader PID. Records live
//! only for the duration of the workflow; teardown stops every group and
//! collects declared outputs best-effort.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as AnyhowContext, Result};
use bench_config::{Host, Stage};
use bench_exec::{open_client, CommandRequest, Context, ExecutionClient};
use tracing::{info, warn};

use crate::collect_stage_outputs;

/// How long a background stage gets to exit after SIGTERM before the
/// group is killed, and how long the kill is given to take effect.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(2);

const CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// One running background stage.
#[derive(Debug, Clone)]
pub struct BackgroundRecord {
    pub stage: Stage,
    pub host_alias: String,
    pub host: Host,
    /// Leader PID of the detached session, as printed by the launcher.
    pub pid: String,
}

/// Tracks background stages started by the executor and stops them at
/// workflow termination.
#[derive(Debug, Default)]
pub struct BackgroundManager {
    records: Vec<BackgroundRecord>,
}

impl BackgroundManager {
    pub fn new() -> BackgroundManager {
        BackgroundManager::default()
    }

    /// Register a running background stage. Idempotent per
    /// (stage, host alias, pid) tuple.
    pub fn add(&mut self, record: BackgroundRecord) {
        let duplicate = self.records.iter().any(|r| {
            r.stage.name == record.stage.name
                && r.host_alias == record.host_alias
                && r.pid == record.pid
        });
        if !duplicate {
            self.records.push(record);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stop every tracked stage and collect its outputs. Errors are
    /// accumulated so one stubborn host never hides another's failure.
    pub fn stop_all(&mut self, ctx: &Context, run_dir: &Path) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }

        let mut failures: Vec<String> = Vec::new();
        for record in self.records.drain(..) {
            if let Err(err) = stop_stage(ctx, run_dir, &record) {
                failures.push(format!("{err:#}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "failed to stop background stages: {}",
                failures.join("; ")
            ))
        }
    }
}

fn stop_stage(ctx: &Context, run_dir: &Path, record: &BackgroundRecord) -> Result<()> {
    info!(
        "stopping background stage {} (PID {})",
        record.stage.name, record.pid
    );

    let mut client = open_client(&record.host)
        .with_context(|| format!("background stage {}", record.stage.name))?;

    let result = terminate_pid(ctx, client.as_mut(), &record.stage.name, &record.pid);

    if result.is_ok() && !record.stage.outputs.is_empty() {
        // The stage is already over; collection failures are only warnings.
        let multi_host = record.stage.hosts.len() > 1;
        if let Err(err) = collect_stage_outputs(
            ctx,
            client.as_mut(),
            run_dir,
            &record.stage,
            &record.host_alias,
            multi_host,
        ) {
            warn!(
                "background stage {} outputs failed to collect: {err:#}",
                record.stage.name
            );
        }
    }

    let _ = client.close();
    result
}

/// Send SIGTERM to the process group, wait the grace period, escalate to
/// SIGKILL if the group is still alive and poll for exit.
fn terminate_pid(
    ctx: &Context,
    client: &mut dyn ExecutionClient,
    stage_name: &str,
    pid: &str,
) -> Result<()> {
    let term = format!("kill -TERM -{pid} >/dev/null 2>&1 || kill -TERM {pid} >/dev/null 2>&1 || true");
    let _ = client.run_command(
        ctx,
        CommandRequest {
            command: term,
            disable_capture: true,
            ..CommandRequest::default()
        },
    );

    ctx.sleep(TERMINATION_GRACE)
        .with_context(|| format!("background stage {stage_name}"))?;

    let alive = process_alive(ctx, client, pid)
        .with_context(|| format!("background stage {stage_name}"))?;
    if alive {
        let kill = format!("kill -KILL -{pid} >/dev/null 2>&1 || kill -KILL {pid} >/dev/null 2>&1 || true");
        let _ = client.run_command(
            ctx,
            CommandRequest {
                command: kill,
                disable_capture: true,
                ..CommandRequest::default()
            },
        );
        if let Err(err) = wait_for_exit(ctx, client, pid) {
            warn!("background stage {stage_name} still running: {err:#}");
        }
    }

    Ok(())
}

/// Probe liveness with a null signal, group first, then the bare PID.
fn process_alive(ctx: &Context, client: &mut dyn ExecutionClient, pid: &str) -> Result<bool> {
    let group = client.run_command(
        ctx,
        CommandRequest {
            command: format!("kill -0 -{pid} >/dev/null 2>&1"),
            disable_capture: true,
            ..CommandRequest::default()
        },
    )?;
    if group.exit_code == 0 {
        return Ok(true);
    }
    let single = client.run_command(
        ctx,
        CommandRequest {
            command: format!("kill -0 {pid} >/dev/null 2>&1"),
            disable_capture: true,
            ..CommandRequest::default()
        },
    )?;
    Ok(single.exit_code == 0)
}

fn wait_for_exit(ctx: &Context, client: &mut dyn ExecutionClient, pid: &str) -> Result<()> {
    let deadline = Instant::now() + TERMINATION_GRACE;
    while Instant::now() < deadline {
        if !process_alive(ctx, client, pid)? {
            return Ok(());
        }
        ctx.sleep(CHECK_INTERVAL)?;
    }
    Err(anyhow!("process {pid} still running after SIGKILL"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_exec::LocalClient;
    use std::process::Command;

    fn setsid_available() -> bool {
        Command::new("sh")
            .args(["-c", "command -v setsid >/dev/null 2>&1"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn spawn_detached(command: &str) -> String {
        let out = Command::new("sh")
            .args(["-c", &format!("setsid sh -c '{command}' >/dev/null 2>&1 & echo $!")])
            .output()
            .expect("failed to spawn helper");
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    fn group_alive(pid: &str) -> bool {
        Command::new("sh")
            .args([
                "-c",
                &format!("kill -0 -{pid} 2>/dev/null || kill -0 {pid} 2>/dev/null"),
            ])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn terminate_pid_stops_process() {
        if !setsid_available() {
            return;
        }
        let pid = spawn_detached("sleep 60");
        assert!(!pid.is_empty(), "expected a pid from the launcher");

        let mut client = LocalClient::new();
        let ctx = Context::background().with_timeout(Duration::from_secs(10));
        terminate_pid(&ctx, &mut client, "sleep-stage", &pid).expect("terminate must succeed");
        assert!(!group_alive(&pid), "process group {pid} must be gone");
    }

    #[test]
    fn terminate_pid_stops_whole_group() {
        if !setsid_available() {
            return;
        }
        let pid = spawn_detached("sleep 60 & wait");
        assert!(!pid.is_empty());

        let mut client = LocalClient::new();
        let ctx = Context::background().with_timeout(Duration::from_secs(10));
        terminate_pid(&ctx, &mut client, "bg-stage", &pid).expect("terminate must succeed");
        assert!(!group_alive(&pid), "process group {pid} must be gone");
    }

    #[test]
    fn add_is_idempotent_per_tuple() {
        let mut manager = BackgroundManager::new();
        let record = BackgroundRecord {
            stage: Stage {
                name: "monitor".to_string(),
                ..Stage::default()
            },
            host_alias: "local".to_string(),
            host: Host::default(),
            pid: "1234".to_string(),
        };
        manager.add(record.clone());
        manager.add(record.clone());
        assert_eq!(manager.records.len(), 1);

        manager.add(BackgroundRecord {
            pid: "5678".to_string(),
            ..record
        });
        assert_eq!(manager.records.len(), 2);
    }

    #[test]
    fn stop_all_with_no_records_is_a_noop() {
        let mut manager = BackgroundManager::new();
        manager
            .stop_all(&Context::background(), Path::new("/nonexistent"))
            .expect("empty manager must succeed");
    }
}
