//! Plot renderers.
//!
//! Two engines implement the same contract: the external engine shells out
//! to a packaged pandas/seaborn script (richer output, needs `uv` and a
//! Python toolchain on the machine), the native engine draws entirely
//! in-process. The workflow engine picks one per plot; external is the
//! default.

use std::path::Path;

use bench_config::{Engine, ExportFormat, Plot};
use bench_exec::Context;
use thiserror::Error;

pub mod external;
pub mod native;

pub use external::ExternalRenderer;
pub use native::NativeRenderer;

#[derive(Debug, Error)]
pub enum PlotError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to read csv data: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to encode renderer spec: {0}")]
    Spec(#[from] serde_json::Error),
    #[error("column '{0}' not found in data")]
    MissingColumn(String),
    #[error("no valid data points found")]
    NoData,
    #[error("the native engine cannot export {0}; use the external engine")]
    UnsupportedFormat(&'static str),
    #[error("render failed: {0}")]
    Render(String),
    #[error("external renderer failed: {0}")]
    External(String),
    #[error("render cancelled")]
    Cancelled,
}

/// Contract every plot engine fulfils: consume a collected CSV, write the
/// finished image to `export_path`.
pub trait Renderer {
    fn render(
        &self,
        ctx: &Context,
        plot: &Plot,
        data_path: &Path,
        export_path: &Path,
    ) -> Result<(), PlotError>;
}

/// Select the renderer for a plot's engine.
pub fn renderer_for(engine: Engine) -> Box<dyn Renderer> {
    match engine {
        Engine::Native => Box::new(NativeRenderer),
        Engine::External => Box::new(ExternalRenderer::default()),
    }
}

pub(crate) fn export_format(plot: &Plot) -> ExportFormat {
    plot.format.unwrap_or(ExportFormat::Png)
}
