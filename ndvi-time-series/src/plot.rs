use std::fs;
use std::ops::Range;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use ndarray::ArrayView5;
use plotters::coord::ranged1d::{KeyPointHint, NoDefaultFormatting, Ranged, ValueFormatter};
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::series::DashedLineSeries;
use svg2pdf::{usvg, ConversionOptions, PageOptions};

use crate::dates::TimeAxis;
use crate::quantile::QuantileSummary;

/// Prediction colours, cycled: b, r, g, c, m, y
const PREDICTION_COLORS: [RGBColor; 6] = [BLUE, RED, GREEN, CYAN, MAGENTA, YELLOW];
pub const TRUTH_COLOR: RGBColor = BLACK;
pub const REFERENCE_COLOR: RGBColor = GREEN;
const BAND_ALPHA: f64 = 0.1;

const FONT: &str = "sans-serif";
const Y_LABEL_AREA: u32 = 80;

/// Median line with its quantile band, already mapped to x positions.
#[derive(Debug, Clone)]
pub struct BandSeries {
    pub label: String,
    pub color: RGBColor,
    pub dashed: bool,
    pub x: Vec<f64>,
    pub lower: Vec<f64>,
    pub median: Vec<f64>,
    pub upper: Vec<f64>,
}

impl BandSeries {
    /// Keep the valid steps of `summary`; step `t` sits at axis position `offset + t`.
    pub fn from_summary(
        label: &str,
        color: RGBColor,
        dashed: bool,
        summary: &QuantileSummary,
        axis: &TimeAxis,
        offset: usize,
    ) -> Result<Self> {
        if offset + summary.time_steps() > axis.len() {
            bail!(
                "series '{}' covers steps {}..{}, the time axis has {}",
                label,
                offset,
                offset + summary.time_steps(),
                axis.len()
            );
        }
        let mut series = BandSeries {
            label: label.to_string(),
            color,
            dashed,
            x: Vec::new(),
            lower: Vec::new(),
            median: Vec::new(),
            upper: Vec::new(),
        };
        for t in summary.valid_steps() {
            let [lo, med, hi] = summary.at(t);
            series.x.push(axis.position(offset + t));
            series.lower.push(lo as f64);
            series.median.push(med as f64);
            series.upper.push(hi as f64);
        }
        Ok(series)
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    fn band_polygon(&self) -> Vec<(f64, f64)> {
        let mut area: Vec<(f64, f64)> = Vec::with_capacity(self.x.len() * 2);
        for i in 0..self.x.len() {
            area.push((self.x[i], self.upper[i]));
        }
        for i in (0..self.x.len()).rev() {
            area.push((self.x[i], self.lower[i]));
        }
        area
    }

    fn median_line(&self) -> Vec<(f64, f64)> {
        self.x.iter().copied().zip(self.median.iter().copied()).collect()
    }
}

pub fn prediction_color(i: usize) -> RGBColor {
    PREDICTION_COLORS[i % PREDICTION_COLORS.len()]
}

/// Rain panel value: `50 * band`
pub fn precipitation_mm(v: f32) -> f64 {
    50.0 * v as f64
}

/// Temperature panel value: `50 * (2 * band - 1)`
pub fn temperature_celsius(v: f32) -> f64 {
    50.0 * (2.0 * v as f64 - 1.0)
}

/// Weather band of the first sample's top-left pixel, step `t` drawn at position `t + 1`.
pub fn weather_series(
    truth: ArrayView5<f32>,
    band: usize,
    axis: &TimeAxis,
    scale: fn(f32) -> f64,
) -> Vec<(f64, f64)> {
    let n_t = truth.shape()[4].min(axis.len());
    (0..n_t.saturating_sub(1))
        .map(|t| (axis.position(t + 1), scale(truth[[0, band, 0, 0, t]])))
        .collect()
}

pub struct Figure {
    pub axis: TimeAxis,
    pub x_range: (f64, f64),
    /// Predictions first, then truth and reference year
    pub ndvi: Vec<BandSeries>,
    pub precipitation: Vec<(f64, f64)>,
    pub temperature: Vec<(f64, f64)>,
}

impl Figure {
    /// Assemble the three panels. The x range spans the valid truth steps.
    pub fn new(
        axis: TimeAxis,
        truth: BandSeries,
        reference: BandSeries,
        predictions: Vec<BandSeries>,
        precipitation: Vec<(f64, f64)>,
        temperature: Vec<(f64, f64)>,
    ) -> Result<Self> {
        let x_range = match (truth.x.first(), truth.x.last()) {
            (Some(&first), Some(&last)) if last > first => (first, last),
            (Some(&first), Some(_)) => (first - 0.5, first + 0.5),
            _ => bail!("truth has no valid time step to plot"),
        };
        if reference.is_empty() {
            warn!("reference series '{}' has no valid time step", reference.label);
        }

        let mut ndvi = Vec::with_capacity(predictions.len() + 2);
        for p in predictions {
            if p.is_empty() {
                warn!("prediction '{}' has no valid time step, skipped", p.label);
                continue;
            }
            ndvi.push(p);
        }
        ndvi.push(truth);
        if !reference.is_empty() {
            ndvi.push(reference);
        }

        Ok(Figure {
            axis,
            x_range,
            ndvi,
            precipitation,
            temperature,
        })
    }

    pub fn ndvi_range(&self) -> (f64, f64) {
        let values = self
            .ndvi
            .iter()
            .flat_map(|s| s.lower.iter().chain(s.median.iter()).chain(s.upper.iter()));
        padded_range(values.copied())
    }
}

/// Finite min/max with 5% padding; degenerate ranges widen by 0.1 each way.
pub fn padded_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    if hi - lo < 1e-9 {
        return (lo - 0.1, hi + 0.1);
    }
    let pad = (hi - lo) * 0.05;
    (lo - pad, hi + pad)
}

/// Chart file formats, picked from the output extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pdf,
    Svg,
    Png,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("pdf") => Ok(OutputFormat::Pdf),
            Some("svg") => Ok(OutputFormat::Svg),
            Some("png") => Ok(OutputFormat::Png),
            _ => bail!("cannot write {:?}: output must end in .pdf, .svg or .png", path),
        }
    }
}

/// Linear x axis whose key points are the time axis ticks (month starts on a calendar).
#[derive(Clone)]
struct TimeRange<'a> {
    axis: &'a TimeAxis,
    lo: f64,
    hi: f64,
    ticks: Vec<f64>,
}

impl<'a> TimeRange<'a> {
    fn new(axis: &'a TimeAxis, (lo, hi): (f64, f64)) -> Self {
        TimeRange {
            axis,
            lo,
            hi,
            ticks: axis.ticks(lo, hi),
        }
    }
}

impl Ranged for TimeRange<'_> {
    type FormatOption = NoDefaultFormatting;
    type ValueType = f64;

    fn map(&self, value: &f64, limit: (i32, i32)) -> i32 {
        let span = self.hi - self.lo;
        if span <= 0.0 {
            return limit.0;
        }
        let frac = (value - self.lo) / span;
        limit.0 + (frac * (limit.1 - limit.0) as f64).round() as i32
    }

    fn key_points<Hint: KeyPointHint>(&self, hint: Hint) -> Vec<f64> {
        let max = hint.max_num_points();
        if max == 0 {
            return Vec::new();
        }
        let stride = self.ticks.len().div_ceil(max).max(1);
        self.ticks.iter().step_by(stride).copied().collect()
    }

    fn range(&self) -> Range<f64> {
        self.lo..self.hi
    }
}

impl ValueFormatter<f64> for TimeRange<'_> {
    fn format(value: &f64) -> String {
        format!("{:.0}", value)
    }

    fn format_ext(&self, value: &f64) -> String {
        self.axis.label(*value)
    }
}

/// Write the figure in the format named by the path's extension.
pub fn render(fig: &Figure, path: &Path, size: (u32, u32)) -> Result<()> {
    let format = OutputFormat::from_path(path)?;
    debug!("rendering {:?} at {:?} as {:?}", path, size, format);
    match format {
        OutputFormat::Png => draw(BitMapBackend::new(path, size).into_drawing_area(), fig),
        OutputFormat::Svg => draw(SVGBackend::new(path, size).into_drawing_area(), fig),
        OutputFormat::Pdf => {
            let mut svg = String::new();
            draw(SVGBackend::with_string(&mut svg, size).into_drawing_area(), fig)?;
            let pdf = svg_to_pdf(&svg)?;
            fs::write(path, pdf).with_context(|| format!("writing {:?}", path))
        }
    }
}

fn svg_to_pdf(svg: &str) -> Result<Vec<u8>> {
    let mut options = usvg::Options::default();
    options.fontdb_mut().load_system_fonts();
    let tree = usvg::Tree::from_str(svg, &options)
        .map_err(|e| anyhow!("parsing rendered chart: {}", e))?;
    svg2pdf::to_pdf(&tree, ConversionOptions::default(), PageOptions::default())
        .map_err(|e| anyhow!("converting chart to PDF: {:?}", e))
}

fn draw<DB>(root: DrawingArea<DB, Shift>, fig: &Figure) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;
    let (_, height) = root.dim_in_pixel();
    // NDVI panel is three times the height of each weather panel
    let (top, rest) = root.split_vertically(height * 3 / 5);
    let (middle, bottom) = rest.split_vertically(height / 5);

    let x_axis = TimeRange::new(&fig.axis, fig.x_range);
    let label_x = |x: &f64| fig.axis.label(*x);

    // NDVI
    let (y0, y1) = fig.ndvi_range();
    let mut chart = ChartBuilder::on(&top)
        .margin(10)
        .x_label_area_size(0)
        .y_label_area_size(Y_LABEL_AREA)
        .build_cartesian_2d(x_axis.clone(), y0..y1)?;
    chart
        .configure_mesh()
        .y_desc("NDVI")
        .x_label_formatter(&label_x)
        .label_style((FONT, 16))
        .draw()?;

    for s in &fig.ndvi {
        chart.draw_series(std::iter::once(Polygon::new(
            s.band_polygon(),
            s.color.mix(BAND_ALPHA).filled(),
        )))?;
    }
    for s in &fig.ndvi {
        let color = s.color;
        let style = color.stroke_width(2);
        let anno = if s.dashed {
            chart.draw_series(DashedLineSeries::new(s.median_line(), 8, 5, style))?
        } else {
            chart.draw_series(LineSeries::new(s.median_line(), style))?
        };
        anno.label(s.label.as_str()).legend(move |(x, y)| {
            PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
        });
    }
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .label_font((FONT, 16))
        .draw()?;

    // Rain
    let (y0, y1) = padded_range(fig.precipitation.iter().map(|p| p.1));
    let mut chart = ChartBuilder::on(&middle)
        .margin(10)
        .x_label_area_size(0)
        .y_label_area_size(Y_LABEL_AREA)
        .build_cartesian_2d(x_axis.clone(), y0..y1)?;
    chart
        .configure_mesh()
        .y_desc("Rain (mm)")
        .x_label_formatter(&label_x)
        .label_style((FONT, 14))
        .draw()?;
    chart.draw_series(LineSeries::new(
        fig.precipitation.iter().copied(),
        BLUE.stroke_width(2),
    ))?;

    // Temperature
    let (y0, y1) = padded_range(fig.temperature.iter().map(|p| p.1));
    let mut chart = ChartBuilder::on(&bottom)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(Y_LABEL_AREA)
        .build_cartesian_2d(x_axis, y0..y1)?;
    chart
        .configure_mesh()
        .x_desc("Time")
        .y_desc("Temp (°C)")
        .x_label_formatter(&label_x)
        .label_style((FONT, 14))
        .draw()?;
    chart.draw_series(LineSeries::new(
        fig.temperature.iter().copied(),
        BLUE.stroke_width(2),
    ))?;

    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndvi::NdviSeries;
    use crate::quantile::summarize;
    use chrono::NaiveDate;
    use ndarray::{Array4, Array5, Axis};

    fn summary(steps: usize, value: f32, masked: &[usize]) -> QuantileSummary {
        let values = Array4::from_elem((1, 2, 2, steps), value);
        let mut observed = Array4::from_elem((1, 2, 2, steps), true);
        for &t in masked {
            observed.index_axis_mut(Axis(3), t).fill(false);
        }
        summarize(&NdviSeries { values, observed }, 0.5, 1).unwrap()
    }

    #[test]
    fn series_skips_invalid_steps_and_applies_offset() {
        let axis = TimeAxis::Index { len: 9 };
        let q = summary(6, 0.4, &[1]);
        let s = BandSeries::from_summary("p", BLUE, true, &q, &axis, 3).unwrap();
        assert_eq!(s.x, vec![3.0, 5.0, 6.0, 7.0, 8.0]);
        assert!(s.median.iter().all(|&m| (m - 0.4).abs() < 1e-6));

        let q = summary(6, 0.4, &[]);
        assert!(BandSeries::from_summary("p", BLUE, true, &q, &axis, 4).is_err());
    }

    #[test]
    fn figure_spans_valid_truth() {
        let axis = TimeAxis::Index { len: 6 };
        let q = summary(6, 0.5, &[0, 5]);
        let truth = BandSeries::from_summary("true median", BLACK, false, &q, &axis, 0).unwrap();
        let reference =
            BandSeries::from_summary("2020 median", GREEN, false, &summary(6, 0.3, &[]), &axis, 0)
                .unwrap();
        let empty_pred =
            BandSeries::from_summary("m", BLUE, true, &summary(4, 0.5, &[0, 1, 2, 3]), &axis, 2)
                .unwrap();
        let fig = Figure::new(axis, truth, reference, vec![empty_pred], vec![], vec![]).unwrap();
        assert_eq!(fig.x_range, (1.0, 4.0));
        assert_eq!(fig.ndvi.len(), 2);
        let (lo, hi) = fig.ndvi_range();
        assert!(lo < 0.3 && hi > 0.5);
    }

    #[test]
    fn figure_needs_truth() {
        let axis = TimeAxis::Index { len: 3 };
        let q = summary(3, 0.5, &[0, 1, 2]);
        let truth = BandSeries::from_summary("t", BLACK, false, &q, &axis, 0).unwrap();
        let reference = truth.clone();
        assert!(Figure::new(axis, truth, reference, vec![], vec![], vec![]).is_err());
    }

    #[test]
    fn weather_is_shifted_by_one_step() {
        let mut truth = Array5::<f32>::zeros((1, 9, 2, 2, 4));
        for t in 0..4 {
            truth[[0, 6, 0, 0, t]] = t as f32 * 0.1;
            truth[[0, 8, 0, 0, t]] = 0.5;
        }
        let axis = TimeAxis::Index { len: 4 };
        let rain = weather_series(truth.view(), 6, &axis, precipitation_mm);
        assert_eq!(rain.len(), 3);
        assert_eq!(rain[0], (1.0, 0.0));
        assert!((rain[2].1 - 10.0).abs() < 1e-4);

        let temp = weather_series(truth.view(), 8, &axis, temperature_celsius);
        assert!(temp.iter().all(|&(_, v)| v.abs() < 1e-9));
    }

    #[test]
    fn colors_cycle() {
        assert_eq!(prediction_color(0), BLUE);
        assert_eq!(prediction_color(6), BLUE);
        assert_eq!(prediction_color(1), RED);
    }

    #[test]
    fn range_padding() {
        let (lo, hi) = padded_range([0.3, 0.3].into_iter());
        assert!((lo - 0.2).abs() < 1e-12 && (hi - 0.4).abs() < 1e-12);
        assert_eq!(padded_range(std::iter::empty()), (0.0, 1.0));
        let (lo, hi) = padded_range([0.0, 1.0, f64::NAN].into_iter());
        assert!((lo + 0.05).abs() < 1e-12 && (hi - 1.05).abs() < 1e-12);
    }

    fn calendar_axis() -> TimeAxis {
        TimeAxis::calendar(
            NaiveDate::from_ymd_opt(2018, 1, 28).unwrap(),
            NaiveDate::from_ymd_opt(2018, 11, 23).unwrap(),
            6,
        )
        .unwrap()
    }

    fn calendar_figure() -> Figure {
        let axis = calendar_axis();
        let q = summary(6, 0.5, &[]);
        let truth = BandSeries::from_summary("true median", TRUTH_COLOR, false, &q, &axis, 0);
        let q = summary(6, 0.3, &[2]);
        let reference =
            BandSeries::from_summary("2020 median", REFERENCE_COLOR, false, &q, &axis, 0);
        let q = summary(4, 0.45, &[]);
        let pred = BandSeries::from_summary("ConvLSTM", prediction_color(0), true, &q, &axis, 2);
        let rain: Vec<(f64, f64)> = (1..6).map(|t| (axis.position(t), t as f64 * 3.0)).collect();
        let temp: Vec<(f64, f64)> = (1..6).map(|t| (axis.position(t), 10.0 - t as f64)).collect();
        Figure::new(
            axis,
            truth.unwrap(),
            reference.unwrap(),
            vec![pred.unwrap()],
            rain,
            temp,
        )
        .unwrap()
    }

    #[test]
    fn time_range_ticks_on_month_starts() {
        let axis = calendar_axis();
        let hi = axis.position(5);
        let range = TimeRange::new(&axis, (0.0, hi));
        let labels: Vec<String> = range
            .key_points(12usize)
            .iter()
            .map(|x| range.format_ext(x))
            .collect();
        assert_eq!(labels.len(), 10);
        assert_eq!(labels.first().map(String::as_str), Some("Feb"));
        assert_eq!(labels.last().map(String::as_str), Some("Nov"));
        assert!(range.key_points(5usize).len() <= 5);
        assert!(range.key_points(0usize).is_empty());

        assert_eq!(range.range(), 0.0..hi);
        assert_eq!(range.map(&0.0, (10, 110)), 10);
        assert_eq!(range.map(&hi, (10, 110)), 110);
        assert_eq!(range.map(&(hi / 2.0), (10, 110)), 60);
    }

    #[test]
    fn output_format_from_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("a/b.pdf")).unwrap(), OutputFormat::Pdf);
        assert_eq!(OutputFormat::from_path(Path::new("b.PNG")).unwrap(), OutputFormat::Png);
        assert_eq!(OutputFormat::from_path(Path::new("b.svg")).unwrap(), OutputFormat::Svg);
        assert!(OutputFormat::from_path(Path::new("b.jpg")).is_err());
        assert!(OutputFormat::from_path(Path::new("chart")).is_err());
    }

    #[test]
    fn renders_every_supported_format() {
        let dir = tempfile::tempdir().unwrap();
        let fig = calendar_figure();

        let svg_path = dir.path().join("chart.svg");
        render(&fig, &svg_path, (600, 450)).unwrap();
        let svg = std::fs::read_to_string(&svg_path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("Mar"));
        assert!(svg.contains("ConvLSTM"));

        let png_path = dir.path().join("chart.png");
        render(&fig, &png_path, (600, 450)).unwrap();
        assert!(std::fs::read(&png_path).unwrap().starts_with(b"\x89PNG"));

        let pdf_path = dir.path().join("chart.pdf");
        render(&fig, &pdf_path, (600, 450)).unwrap();
        assert!(std::fs::read(&pdf_path).unwrap().starts_with(b"%PDF"));
    }

    #[test]
    fn unsupported_output_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chart.jpg");
        assert!(render(&calendar_figure(), &path, (600, 450)).is_err());
        assert!(!path.exists());
    }
}
