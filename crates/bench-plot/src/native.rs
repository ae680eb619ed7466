//! In-process renderer built on plotters. Deliberately plain: one series,
//! fixed styling, no Python toolchain required.

use std::collections::BTreeMap;
use std::path::Path;

use bench_config::{ExportFormat, Plot, PlotType};
use bench_exec::Context;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use plotters::coord::Shift;
use plotters::prelude::*;

use crate::{export_format, PlotError, Renderer};

const PLOT_WIDTH: u32 = 960;
const PLOT_HEIGHT: u32 = 720;
const HISTOGRAM_BINS: usize = 16;

pub struct NativeRenderer;

impl Renderer for NativeRenderer {
    fn render(
        &self,
        ctx: &Context,
        plot: &Plot,
        data_path: &Path,
        export_path: &Path,
    ) -> Result<(), PlotError> {
        if ctx.err().is_some() {
            return Err(PlotError::Cancelled);
        }
        if let Some(parent) = export_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let table = CsvTable::load(data_path)?;

        match export_format(plot) {
            ExportFormat::Png => {
                let root =
                    BitMapBackend::new(export_path, (PLOT_WIDTH, PLOT_HEIGHT)).into_drawing_area();
                draw(&root, plot, &table)?;
                root.present().map_err(render_err)
            }
            ExportFormat::Svg => {
                let root =
                    SVGBackend::new(export_path, (PLOT_WIDTH, PLOT_HEIGHT)).into_drawing_area();
                draw(&root, plot, &table)?;
                root.present().map_err(render_err)
            }
            ExportFormat::Pdf => Err(PlotError::UnsupportedFormat("pdf")),
        }
    }
}

fn draw<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    plot: &Plot,
    table: &CsvTable,
) -> Result<(), PlotError> {
    root.fill(&WHITE).map_err(render_err)?;
    match plot.plot_type {
        PlotType::TimeSeries => draw_time_series(root, plot, table),
        PlotType::Histogram => draw_histogram(root, plot, table),
        PlotType::Boxplot => draw_boxplot(root, plot, table),
    }
}

fn draw_time_series<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    plot: &Plot,
    table: &CsvTable,
) -> Result<(), PlotError> {
    let x_col = table.column(&plot.x)?;
    let y_col = table.column(&plot.y)?;

    let mut points: Vec<(f64, f64)> = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let (Some(raw_x), Some(raw_y)) = (row.get(x_col), row.get(y_col)) else {
            continue;
        };
        let Some(x) = parse_x_value(raw_x) else {
            continue;
        };
        let Some(y) = parse_number(raw_y) else {
            continue;
        };
        points.push((x, y));
    }
    if points.is_empty() {
        return Err(PlotError::NoData);
    }

    let (x_range, y_range) = padded_ranges(&points);
    let mut chart = ChartBuilder::on(root)
        .caption(plot.title.as_str(), ("sans-serif", 24))
        .margin(12)
        .x_label_area_size(36)
        .y_label_area_size(52)
        .build_cartesian_2d(x_range, y_range)
        .map_err(render_err)?;
    chart
        .configure_mesh()
        .x_desc(plot.x.as_str())
        .y_desc(plot.y.as_str())
        .draw()
        .map_err(render_err)?;
    chart
        .draw_series(LineSeries::new(points, &RED))
        .map_err(render_err)?;
    Ok(())
}

fn draw_histogram<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    plot: &Plot,
    table: &CsvTable,
) -> Result<(), PlotError> {
    let x_col = table.column(&plot.x)?;
    let values: Vec<f64> = table
        .rows
        .iter()
        .filter_map(|row| row.get(x_col).and_then(parse_number))
        .collect();
    if values.is_empty() {
        return Err(PlotError::NoData);
    }

    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = (max - min).max(f64::EPSILON);

    let mut counts = vec![0usize; HISTOGRAM_BINS];
    for value in &values {
        let idx = (((value - min) / span) * HISTOGRAM_BINS as f64) as usize;
        counts[idx.min(HISTOGRAM_BINS - 1)] += 1;
    }
    // Normalised so the bars sum to 1.
    let total = values.len() as f64;
    let max_freq = counts.iter().copied().max().unwrap_or(0) as f64 / total;

    let mut chart = ChartBuilder::on(root)
        .caption(plot.title.as_str(), ("sans-serif", 24))
        .margin(12)
        .x_label_area_size(36)
        .y_label_area_size(52)
        .build_cartesian_2d(min..min + span, 0.0..max_freq * 1.1 + f64::EPSILON)
        .map_err(render_err)?;
    chart
        .configure_mesh()
        .x_desc(plot.x.as_str())
        .y_desc("frequency")
        .draw()
        .map_err(render_err)?;

    let bin_width = span / HISTOGRAM_BINS as f64;
    chart
        .draw_series(counts.iter().enumerate().map(|(i, count)| {
            let x0 = min + bin_width * i as f64;
            let x1 = x0 + bin_width;
            let freq = *count as f64 / total;
            Rectangle::new([(x0, 0.0), (x1, freq)], GREEN.mix(0.5).filled())
        }))
        .map_err(render_err)?;
    Ok(())
}

fn draw_boxplot<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    plot: &Plot,
    table: &CsvTable,
) -> Result<(), PlotError> {
    let x_col = table.column(&plot.x)?;
    let y_col = table.column(&plot.y)?;

    // Group Y values by the categorical X column, in first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for row in &table.rows {
        let (Some(category), Some(raw_y)) = (row.get(x_col), row.get(y_col)) else {
            continue;
        };
        if category.is_empty() {
            continue;
        }
        let Some(y) = parse_number(raw_y) else {
            continue;
        };
        if !groups.contains_key(category) {
            order.push(category.to_string());
        }
        groups.entry(category.to_string()).or_default().push(y);
    }
    if groups.is_empty() {
        return Err(PlotError::NoData);
    }

    let all: Vec<f64> = groups.values().flatten().copied().collect();
    let y_min = all.iter().cloned().fold(f64::INFINITY, f64::min);
    let y_max = all.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let pad = ((y_max - y_min) * 0.1).max(f64::EPSILON);

    let labels = order.clone();
    let mut chart = ChartBuilder::on(root)
        .caption(plot.title.as_str(), ("sans-serif", 24))
        .margin(12)
        .x_label_area_size(36)
        .y_label_area_size(52)
        .build_cartesian_2d(-0.5..order.len() as f64 - 0.5, y_min - pad..y_max + pad)
        .map_err(render_err)?;
    chart
        .configure_mesh()
        .x_desc(plot.x.as_str())
        .y_desc(plot.y.as_str())
        .x_labels(order.len())
        .x_label_formatter(&move |x| {
            let idx = x.round();
            if idx < 0.0 {
                return String::new();
            }
            labels.get(idx as usize).cloned().unwrap_or_default()
        })
        .draw()
        .map_err(render_err)?;

    for (i, category) in order.iter().enumerate() {
        let mut values = groups[category].clone();
        values.sort_by(|a, b| a.total_cmp(b));
        let summary = FiveNumber::of(&values);
        let x = i as f64;
        let half_width = 0.3;

        chart
            .draw_series(std::iter::once(Rectangle::new(
                [(x - half_width, summary.q1), (x + half_width, summary.q3)],
                GREEN.mix(0.5).filled(),
            )))
            .map_err(render_err)?;
        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(x - half_width, summary.median), (x + half_width, summary.median)],
                BLACK.stroke_width(2),
            )))
            .map_err(render_err)?;
        chart
            .draw_series(
                [
                    vec![(x, summary.min), (x, summary.q1)],
                    vec![(x, summary.q3), (x, summary.max)],
                ]
                .into_iter()
                .map(|path| PathElement::new(path, BLACK.stroke_width(1))),
            )
            .map_err(render_err)?;
    }
    Ok(())
}

struct FiveNumber {
    min: f64,
    q1: f64,
    median: f64,
    q3: f64,
    max: f64,
}

impl FiveNumber {
    /// `sorted` must be ascending and non-empty.
    fn of(sorted: &[f64]) -> FiveNumber {
        FiveNumber {
            min: sorted[0],
            q1: percentile(sorted, 0.25),
            median: percentile(sorted, 0.5),
            q3: percentile(sorted, 0.75),
            max: sorted[sorted.len() - 1],
        }
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

fn padded_ranges(points: &[(f64, f64)]) -> (std::ops::Range<f64>, std::ops::Range<f64>) {
    let mut x_min = f64::INFINITY;
    let mut x_max = f64::NEG_INFINITY;
    let mut y_min = f64::INFINITY;
    let mut y_max = f64::NEG_INFINITY;
    for (x, y) in points {
        x_min = x_min.min(*x);
        x_max = x_max.max(*x);
        y_min = y_min.min(*y);
        y_max = y_max.max(*y);
    }
    let x_pad = ((x_max - x_min) * 0.02).max(f64::EPSILON);
    let y_pad = ((y_max - y_min) * 0.05).max(f64::EPSILON);
    (x_min - x_pad..x_max + x_pad, y_min - y_pad..y_max + y_pad)
}

pub(crate) struct CsvTable {
    headers: Vec<String>,
    rows: Vec<csv::StringRecord>,
}

impl CsvTable {
    pub(crate) fn load(path: &Path) -> Result<CsvTable, PlotError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader.records().collect::<Result<Vec<_>, _>>()?;
        Ok(CsvTable { headers, rows })
    }

    pub(crate) fn column(&self, name: &str) -> Result<usize, PlotError> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| PlotError::MissingColumn(name.to_string()))
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

/// X values are numbers or timestamps; timestamps become epoch seconds.
fn parse_x_value(raw: &str) -> Option<f64> {
    if let Some(v) = parse_number(raw) {
        return Some(v);
    }
    parse_timestamp(raw)
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

fn parse_timestamp(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9);
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt.and_utc().timestamp() as f64);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(midnight.and_utc().timestamp() as f64);
    }
    if let Ok(time) = NaiveTime::parse_from_str(raw, "%H:%M:%S") {
        use chrono::Timelike;
        return Some(f64::from(time.num_seconds_from_midnight()));
    }
    None
}

fn render_err<E: std::fmt::Display>(e: E) -> PlotError {
    PlotError::Render(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_config::Engine;
    use std::io::Write;

    // SVG keeps the tests independent of system font availability; the
    // bitmap path shares all drawing code.
    fn sample_plot(plot_type: PlotType) -> Plot {
        Plot {
            name: "sample".to_string(),
            title: "Sample".to_string(),
            source: "metrics".to_string(),
            plot_type,
            x: "ts".to_string(),
            y: "ms".to_string(),
            aggregation: None,
            format: Some(ExportFormat::Svg),
            groupby: None,
            engine: Engine::Native,
            options: BTreeMap::new(),
        }
    }

    fn write_csv(dir: &Path, content: &str) -> std::path::PathBuf {
        let path = dir.join("data.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn renders_time_series_svg() {
        let dir = tempfile::tempdir().unwrap();
        let data = write_csv(dir.path(), "ts,ms\n1,10.0\n2,12.5\n3,11.0\n");
        let export = dir.path().join("out.svg");
        NativeRenderer
            .render(
                &Context::background(),
                &sample_plot(PlotType::TimeSeries),
                &data,
                &export,
            )
            .expect("render must succeed");
        assert!(export.exists());
        assert!(std::fs::metadata(&export).unwrap().len() > 0);
    }

    #[test]
    fn renders_histogram_and_boxplot() {
        let dir = tempfile::tempdir().unwrap();
        let data = write_csv(
            dir.path(),
            "ts,ms\na,10.0\na,12.0\nb,30.0\nb,31.0\nb,29.5\n",
        );
        let hist_data = write_csv(dir.path(), "ts,ms\n1,0\n2,0\n2.5,0\n9,0\n");

        let export = dir.path().join("hist.svg");
        NativeRenderer
            .render(
                &Context::background(),
                &sample_plot(PlotType::Histogram),
                &hist_data,
                &export,
            )
            .expect("histogram must render");
        assert!(export.exists());

        let export = dir.path().join("box.svg");
        NativeRenderer
            .render(
                &Context::background(),
                &sample_plot(PlotType::Boxplot),
                &data,
                &export,
            )
            .expect("boxplot must render");
        assert!(export.exists());
    }

    #[test]
    fn missing_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let data = write_csv(dir.path(), "other,ms\n1,10.0\n");
        let export = dir.path().join("out.svg");
        let err = NativeRenderer
            .render(
                &Context::background(),
                &sample_plot(PlotType::TimeSeries),
                &data,
                &export,
            )
            .expect_err("missing x column must fail");
        assert!(matches!(err, PlotError::MissingColumn(name) if name == "ts"));
    }

    #[test]
    fn rows_without_numbers_are_skipped_and_empty_fails() {
        let dir = tempfile::tempdir().unwrap();
        let data = write_csv(dir.path(), "ts,ms\nx,oops\n");
        let export = dir.path().join("out.svg");
        let err = NativeRenderer
            .render(
                &Context::background(),
                &sample_plot(PlotType::TimeSeries),
                &data,
                &export,
            )
            .expect_err("no parsable rows must fail");
        assert!(matches!(err, PlotError::NoData));
    }

    #[test]
    fn pdf_requires_external_engine() {
        let dir = tempfile::tempdir().unwrap();
        let data = write_csv(dir.path(), "ts,ms\n1,10.0\n");
        let mut plot = sample_plot(PlotType::TimeSeries);
        plot.format = Some(ExportFormat::Pdf);
        let err = NativeRenderer
            .render(&Context::background(), &plot, &data, &dir.path().join("o.pdf"))
            .expect_err("pdf must be rejected");
        assert!(matches!(err, PlotError::UnsupportedFormat("pdf")));
    }

    #[test]
    fn timestamps_parse_to_epoch_seconds() {
        assert_eq!(parse_timestamp("1970-01-01T00:00:10Z"), Some(10.0));
        assert_eq!(parse_timestamp("1970-01-01 00:01:00"), Some(60.0));
        assert_eq!(parse_timestamp("1970-01-02"), Some(86400.0));
        assert!(parse_timestamp("not a time").is_none());
    }
}
