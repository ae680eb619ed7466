//! External renderer: a packaged pandas/seaborn script executed through
//! `uv run`, which resolves the script's inline dependency block.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use bench_config::Plot;
use bench_exec::Context;
use tracing::debug;

use crate::{export_format, PlotError, Renderer};

const RENDER_SCRIPT: &str = include_str!("files/render_plot.py");

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
pub struct ExternalRenderer {
    /// Override for the `uv` binary; the PATH entry is used otherwise.
    pub uv_path: Option<String>,
}

impl Renderer for ExternalRenderer {
    fn render(
        &self,
        ctx: &Context,
        plot: &Plot,
        data_path: &Path,
        export_path: &Path,
    ) -> Result<(), PlotError> {
        let uv = self.uv_path.as_deref().unwrap_or("uv");

        let workdir = tempfile::Builder::new()
            .prefix("benchctl-plot-")
            .tempdir()?;
        let script_path = workdir.path().join("render_plot.py");
        fs::write(&script_path, RENDER_SCRIPT)?;

        let spec = serde_json::json!({
            "type": plot.plot_type,
            "title": plot.title,
            "x": plot.x,
            "y": plot.y,
            "format": export_format(plot).extension(),
            "groupby": plot.groupby,
            "opts": plot.options,
        });
        let spec_path = workdir.path().join("spec.json");
        fs::write(&spec_path, serde_json::to_vec(&spec)?)?;

        debug!(plot = %plot.name, "invoking external renderer");
        let mut cmd = Command::new(uv);
        cmd.arg("run")
            .arg(&script_path)
            .arg("--input")
            .arg(data_path)
            .arg("--output")
            .arg(export_path)
            .arg("--spec")
            .arg(&spec_path)
            .current_dir(workdir.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| PlotError::External(format!("failed to start {uv}: {e}")))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let (status, combined) = std::thread::scope(|scope| {
            let out = scope.spawn(move || {
                let mut buf = String::new();
                if let Some(pipe) = stdout_pipe.as_mut() {
                    let _ = pipe.read_to_string(&mut buf);
                }
                buf
            });
            let err = scope.spawn(move || {
                let mut buf = String::new();
                if let Some(pipe) = stderr_pipe.as_mut() {
                    let _ = pipe.read_to_string(&mut buf);
                }
                buf
            });

            let mut cancelled = false;
            let status = loop {
                match child.try_wait() {
                    Ok(Some(status)) => break Ok(status),
                    Ok(None) => {
                        if !cancelled && ctx.err().is_some() {
                            let _ = child.kill();
                            cancelled = true;
                        }
                        std::thread::sleep(WAIT_POLL_INTERVAL);
                    }
                    Err(e) => break Err(e),
                }
            };
            let mut combined = out.join().unwrap_or_default();
            combined.push_str(&err.join().unwrap_or_default());
            (status, combined)
        });

        if ctx.err().is_some() {
            return Err(PlotError::Cancelled);
        }
        let status = status?;
        if !status.success() {
            return Err(PlotError::External(combined.trim().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_config::{Engine, ExportFormat, PlotType};
    use std::collections::BTreeMap;

    #[test]
    fn spec_json_carries_renderer_hints() {
        let mut options = BTreeMap::new();
        options.insert(
            "x_time_format".to_string(),
            serde_json::Value::String("unix_ms".to_string()),
        );
        let plot = Plot {
            name: "latency".to_string(),
            title: "Latency".to_string(),
            source: "metrics".to_string(),
            plot_type: PlotType::TimeSeries,
            x: "ts".to_string(),
            y: "ms".to_string(),
            aggregation: None,
            format: Some(ExportFormat::Svg),
            groupby: Some("host".to_string()),
            engine: Engine::External,
            options,
        };
        let spec = serde_json::json!({
            "type": plot.plot_type,
            "title": plot.title,
            "x": plot.x,
            "y": plot.y,
            "format": export_format(&plot).extension(),
            "groupby": plot.groupby,
            "opts": plot.options,
        });
        assert_eq!(spec["type"], "time_series");
        assert_eq!(spec["format"], "svg");
        assert_eq!(spec["groupby"], "host");
        assert_eq!(spec["opts"]["x_time_format"], "unix_ms");
    }
}
