//! End-to-end workflow runs against local hosts.

use std::collections::BTreeMap;
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use bench_config::{
    Benchmark, Config, Engine, ExportFormat, HealthCheck, HealthCheckType, Host, Output, Plot,
    PlotType, Stage,
};
use bench_exec::Context;
use bench_runner::{inspect, run_workflow, WorkflowOptions, METADATA_FILENAME};

fn base_config(output_root: &Path) -> Config {
    Config {
        benchmark: Benchmark {
            name: "integration".to_string(),
            output_dir: output_root.to_string_lossy().into_owned(),
            // A plain shell keeps test output free of login-profile noise.
            shell: Some("sh -c".to_string()),
            logging: None,
        },
        hosts: BTreeMap::new(),
        stages: Vec::new(),
        plots: Vec::new(),
    }
}

fn command_stage(name: &str, command: String) -> Stage {
    Stage {
        name: name.to_string(),
        command: Some(command),
        ..Stage::default()
    }
}

fn setsid_available() -> bool {
    Command::new("sh")
        .args(["-c", "command -v setsid >/dev/null 2>&1"])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[test]
fn local_echo_produces_run_dir_output_and_plot() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let data_file = dir.path().join("x.csv");
    let runid_file = dir.path().join("runid.txt");

    let mut cfg = base_config(&output_root);
    let mut stage = command_stage(
        "produce",
        format!(
            "printf 'a,b\\n1,2\\n3,4\\n' > '{data}'; printf %s \"$BENCHCTL_RUN_ID\" > '{runid}'",
            data = data_file.display(),
            runid = runid_file.display(),
        ),
    );
    stage.outputs.push(Output {
        name: "numbers".to_string(),
        remote_path: data_file.to_string_lossy().into_owned(),
        local_path: None,
        data_schema: None,
    });
    cfg.stages.push(stage);
    cfg.plots.push(Plot {
        name: "numbers_plot".to_string(),
        title: "Numbers".to_string(),
        source: "numbers".to_string(),
        plot_type: PlotType::TimeSeries,
        x: "a".to_string(),
        y: "b".to_string(),
        aggregation: None,
        // SVG keeps the test independent of system fonts.
        format: Some(ExportFormat::Svg),
        groupby: None,
        engine: Engine::Native,
        options: BTreeMap::new(),
    });

    let outcome = run_workflow(&Context::background(), &cfg, WorkflowOptions::default())
        .expect("workflow must succeed");
    assert_eq!(outcome.run_id, "1");
    assert_eq!(outcome.run_dir, output_root.join("1"));

    let collected = outcome.run_dir.join("numbers.csv");
    assert_eq!(
        fs::read_to_string(&collected).expect("collected file must exist"),
        "a,b\n1,2\n3,4\n"
    );
    assert_eq!(
        fs::read_to_string(&runid_file).expect("env prefix must be exported"),
        "1"
    );
    assert!(outcome.run_dir.join("numbers_plot.svg").exists());

    let metadata = inspect::load_metadata(&outcome.run_dir).expect("metadata must decode");
    assert_eq!(metadata.benchmark_name, "integration");
    assert_eq!(metadata.run_id, "1");
    assert!(metadata.end_time >= metadata.start_time);
}

#[test]
fn run_ids_increment_across_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let mut cfg = base_config(&output_root);
    cfg.stages.push(command_stage("noop", "true".to_string()));

    let first = run_workflow(&Context::background(), &cfg, WorkflowOptions::default()).unwrap();
    let second = run_workflow(&Context::background(), &cfg, WorkflowOptions::default()).unwrap();
    assert_eq!(first.run_id, "1");
    assert_eq!(second.run_id, "2");
}

#[test]
fn multi_host_fan_out_fails_fast_and_keeps_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let counter = dir.path().join("counter");

    let mut cfg = base_config(&output_root);
    for alias in ["a", "b", "c"] {
        cfg.hosts.insert(alias.to_string(), Host::default());
    }
    let mut stage = command_stage(
        "fanout",
        format!(
            "n=$(cat '{c}' 2>/dev/null || echo 0); n=$((n+1)); echo $n > '{c}'; test $n -ne 2",
            c = counter.display(),
        ),
    );
    stage.hosts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    cfg.stages.push(stage);
    cfg.stages
        .push(command_stage("never", "echo unreachable".to_string()));

    let err = run_workflow(&Context::background(), &cfg, WorkflowOptions::default())
        .expect_err("second host must abort the workflow");
    let message = format!("{err:#}");
    assert!(message.contains("fanout"), "got: {message}");
    assert!(message.contains("host b"), "got: {message}");

    // Host c was never touched, and no later stage ran.
    assert_eq!(fs::read_to_string(&counter).unwrap().trim(), "2");

    // The run directory still exists with a metadata record.
    let run_dir = output_root.join("1");
    assert!(run_dir.join(METADATA_FILENAME).exists());
    let metadata = inspect::load_metadata(&run_dir).unwrap();
    assert_eq!(metadata.benchmark_name, "integration");
}

#[test]
fn multi_host_outputs_are_disambiguated_by_alias() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let data = dir.path().join("metrics.csv");

    let mut cfg = base_config(&output_root);
    for alias in ["host-a", "host-b"] {
        cfg.hosts.insert(alias.to_string(), Host::default());
    }
    let mut stage = command_stage(
        "collect",
        format!("echo sample > '{}'", data.display()),
    );
    stage.hosts = vec!["host-a".to_string(), "host-b".to_string()];
    stage.outputs.push(Output {
        name: "metrics".to_string(),
        remote_path: data.to_string_lossy().into_owned(),
        local_path: None,
        data_schema: None,
    });
    cfg.stages.push(stage);

    let outcome = run_workflow(&Context::background(), &cfg, WorkflowOptions::default()).unwrap();
    assert!(outcome.run_dir.join("metrics__host-a.csv").exists());
    assert!(outcome.run_dir.join("metrics__host-b.csv").exists());
    assert!(!outcome.run_dir.join("metrics.csv").exists());
}

#[test]
fn background_stage_is_terminated_and_outputs_collected() {
    if !setsid_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let log = dir.path().join("monitor.log");

    let mut cfg = base_config(&output_root);
    let mut monitor = command_stage(
        "monitor",
        format!(
            "while true; do echo tick >> '{}'; sleep 0.2; done",
            log.display()
        ),
    );
    monitor.background = true;
    monitor.outputs.push(Output {
        name: "monitor_log".to_string(),
        remote_path: log.to_string_lossy().into_owned(),
        local_path: None,
        data_schema: None,
    });
    cfg.stages.push(monitor);
    cfg.stages
        .push(command_stage("finish", "sleep 1".to_string()));

    let outcome = run_workflow(&Context::background(), &cfg, WorkflowOptions::default())
        .expect("workflow must succeed");

    let collected = outcome.run_dir.join("monitor_log.log");
    assert!(collected.exists(), "background output must be collected");
    assert!(fs::read_to_string(&collected).unwrap().contains("tick"));

    // The writer group is gone: the source file stops growing.
    let size_before = fs::metadata(&log).unwrap().len();
    std::thread::sleep(Duration::from_millis(600));
    let size_after = fs::metadata(&log).unwrap().len();
    assert_eq!(size_before, size_after, "background process must be stopped");
}

#[test]
fn append_metadata_merges_stringified_json() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");

    let mut cfg = base_config(&output_root);
    let mut stage = command_stage(
        "report",
        r#"printf '{"p50_ms": 12.3, "notes": "ok"}'"#.to_string(),
    );
    stage.append_metadata = true;
    cfg.stages.push(stage);

    let mut opts = WorkflowOptions::default();
    opts.custom_metadata
        .insert("test_metadata".to_string(), "test_value".to_string());

    let outcome = run_workflow(&Context::background(), &cfg, opts).unwrap();
    let metadata = inspect::load_metadata(&outcome.run_dir).unwrap();
    assert_eq!(metadata.custom["p50_ms"], "12.3");
    assert_eq!(metadata.custom["notes"], "ok");
    assert_eq!(metadata.custom["test_metadata"], "test_value");
}

#[test]
fn append_metadata_parse_failure_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");

    let mut cfg = base_config(&output_root);
    let mut stage = command_stage("report", "echo this is not json".to_string());
    stage.append_metadata = true;
    cfg.stages.push(stage);

    let mut opts = WorkflowOptions::default();
    opts.custom_metadata
        .insert("seed".to_string(), "42".to_string());

    let outcome = run_workflow(&Context::background(), &cfg, opts).expect("warning, not failure");
    let metadata = inspect::load_metadata(&outcome.run_dir).unwrap();
    assert_eq!(metadata.custom.len(), 1);
    assert_eq!(metadata.custom["seed"], "42");
}

#[test]
fn port_health_check_passes_against_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let mut cfg = base_config(&output_root);
    let mut stage = command_stage("service", "true".to_string());
    stage.health_check = Some(HealthCheck {
        check_type: HealthCheckType::Port,
        target: port.to_string(),
        timeout: "500ms".to_string(),
        retries: 5,
    });
    cfg.stages.push(stage);

    run_workflow(&Context::background(), &cfg, WorkflowOptions::default())
        .expect("health check must pass within the configured retries");
}

#[test]
fn port_health_check_failure_aborts_the_stage() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let mut cfg = base_config(&output_root);
    let mut stage = command_stage("service", "true".to_string());
    stage.health_check = Some(HealthCheck {
        check_type: HealthCheckType::Port,
        // Port 1 is essentially never listening.
        target: "1".to_string(),
        timeout: "100ms".to_string(),
        retries: 1,
    });
    cfg.stages.push(stage);

    let err = run_workflow(&Context::background(), &cfg, WorkflowOptions::default())
        .expect_err("unreachable port must fail the stage");
    assert!(format!("{err:#}").contains("health check"), "got: {err:#}");
}

#[test]
fn reserved_health_check_types_error_at_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let mut cfg = base_config(&output_root);
    let mut stage = command_stage("service", "true".to_string());
    stage.health_check = Some(HealthCheck {
        check_type: HealthCheckType::Http,
        target: "http://localhost".to_string(),
        timeout: "1s".to_string(),
        retries: 0,
    });
    cfg.stages.push(stage);

    let err = run_workflow(&Context::background(), &cfg, WorkflowOptions::default())
        .expect_err("http checks are reserved");
    assert!(
        format!("{err:#}").contains("unknown health check type"),
        "got: {err:#}"
    );
}

#[test]
fn skip_flags_suppress_execution() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let counter = dir.path().join("counter");

    let append = |name: &str| {
        command_stage(name, format!("echo {name} >> '{}'", counter.display()))
    };
    let mut cfg = base_config(&output_root);
    cfg.stages.push(append("first"));
    let mut second = append("second");
    second.skip = true;
    cfg.stages.push(second);
    cfg.stages.push(append("third"));

    let opts = WorkflowOptions {
        skip_stages: vec!["third".to_string()],
        ..WorkflowOptions::default()
    };
    run_workflow(&Context::background(), &cfg, opts).expect("workflow must succeed");

    assert_eq!(fs::read_to_string(&counter).unwrap(), "first\n");
}

#[test]
fn local_script_stages_execute_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let marker = dir.path().join("marker");
    let script = dir.path().join("stage.sh");
    fs::write(
        &script,
        format!("#!/bin/sh\necho script-ran > '{}'\n", marker.display()),
    )
    .unwrap();

    let mut cfg = base_config(&output_root);
    cfg.stages.push(Stage {
        name: "scripted".to_string(),
        script: Some(script.to_string_lossy().into_owned()),
        ..Stage::default()
    });

    run_workflow(&Context::background(), &cfg, WorkflowOptions::default())
        .expect("script stage must succeed");
    assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "script-ran");
}

#[test]
fn cancelled_context_aborts_the_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let output_root = dir.path().join("results");
    let mut cfg = base_config(&output_root);
    cfg.stages
        .push(command_stage("hang", "sleep 30".to_string()));

    let ctx = Context::background();
    let flag = ctx.cancel_flag();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    });

    let start = std::time::Instant::now();
    let err = run_workflow(&ctx, &cfg, WorkflowOptions::default())
        .expect_err("cancelled workflow must fail");
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "cancellation must return promptly, took {:?}",
        start.elapsed()
    );
    assert!(format!("{err:#}").contains("cancelled"), "got: {err:#}");
    canceller.join().unwrap();

    // Even a cancelled run leaves its metadata behind.
    assert!(output_root.join("1").join(METADATA_FILENAME).exists());
}
