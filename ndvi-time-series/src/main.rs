use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use ndarray::{Array5, Axis};

mod config;
mod data;
mod dates;
mod model;
mod ndvi;
mod plot;
mod quantile;

use config::{BandIndices, InputPaths, ModelSpec, PlotConfig};
use dates::{parse_date, TimeAxis};
use model::{check_prediction, prediction_count, Forecaster};
use ndvi::{masked_ndvi, unmasked_ndvi, BYTE_MASK_SCALE, UNIT_MASK_SCALE};
use plot::{
    precipitation_mm, prediction_color, temperature_celsius, weather_series, BandSeries, Figure,
    REFERENCE_COLOR, TRUTH_COLOR,
};
use quantile::summarize;

#[derive(Parser, Debug)]
#[command(name = "ndvi-time-series", version = "0.1.0")]
struct Args {
    /// JSON list of context cube paths
    #[arg(long, default_value = "Data/small_data/extreme_context_data_paths.json")]
    context_table: String,

    /// JSON list of target cube paths
    #[arg(long, default_value = "Data/small_data/extreme_target_data_paths.json")]
    target_table: String,

    /// Which entry of the path tables to evaluate
    #[arg(long, default_value = "0")]
    sample: usize,

    /// Forecasting model as LABEL=PATH (ONNX); repeat to compare several
    #[arg(long = "model", default_value = "ConvLSTM=trained_models/conv_lstm.onnx")]
    models: Vec<ModelSpec>,

    /// Name of the prediction output, defaults to the first graph output
    #[arg(long)]
    output_name: Option<String>,

    /// Directory holding sentinel_data_<year>.npy
    #[arg(long, default_value = "demos")]
    reference_dir: String,

    /// Reference observation year
    #[arg(long, default_value = "2020")]
    year: String,

    /// Date of the first truth time step (YYYY-MM-DD)
    #[arg(long, default_value = "2018-01-28")]
    start_date: String,

    /// Date of the last truth time step (YYYY-MM-DD)
    #[arg(long, default_value = "2018-11-23")]
    end_date: String,

    /// Plot against time step index instead of dates
    #[arg(long)]
    no_dates: bool,

    /// Width of the central quantile band (0.5 => 25th..75th percentile)
    #[arg(long, default_value = "0.5")]
    confidence: f64,

    /// Observed pixels a time step needs to be plotted
    #[arg(long, default_value = "1")]
    min_valid_pixels: usize,

    /// Normalised cloud value at or above which a pixel is not observed
    #[arg(long, default_value = "0.5")]
    cloud_threshold: f32,

    #[arg(long, default_value = "2")]
    red_band: usize,

    #[arg(long, default_value = "3")]
    nir_band: usize,

    #[arg(long, default_value = "4")]
    cloud_band: usize,

    #[arg(long, default_value = "6")]
    precipitation_band: usize,

    #[arg(long, default_value = "8")]
    temperature_band: usize,

    /// First band of the non-predictive features fed to the model
    #[arg(long, default_value = "5")]
    npf_start_band: usize,

    /// Output file (.pdf, .svg or .png); when omitted writes NDVI_time_series<year>.pdf
    /// and opens it
    #[arg(long)]
    output: Option<String>,

    /// Do not open the default output in a viewer
    #[arg(long)]
    no_show: bool,

    #[arg(long, default_value = "1200")]
    width: u32,

    #[arg(long, default_value = "900")]
    height: u32,
}

fn build_config(args: Args) -> Result<PlotConfig> {
    let date_bounds = if args.no_dates {
        None
    } else {
        Some((parse_date(&args.start_date)?, parse_date(&args.end_date)?))
    };
    let show = args.output.is_none() && !args.no_show;
    let cfg = PlotConfig {
        bands: BandIndices {
            red: args.red_band,
            nir: args.nir_band,
            cloud: args.cloud_band,
            precipitation: args.precipitation_band,
            temperature: args.temperature_band,
        },
        npf_start_band: args.npf_start_band,
        inputs: InputPaths {
            context_table: PathBuf::from(args.context_table),
            target_table: PathBuf::from(args.target_table),
            reference_dir: PathBuf::from(args.reference_dir),
            sample: args.sample,
        },
        models: args.models,
        output_name: args.output_name,
        year: args.year,
        date_bounds,
        confidence: args.confidence,
        min_valid_pixels: args.min_valid_pixels,
        cloud_threshold: args.cloud_threshold,
        output: args.output.map(PathBuf::from),
        show,
        size: (args.width, args.height),
    };
    cfg.validate()?;
    Ok(cfg)
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();
    info!("=== ndvi-time-series start ===");

    let args = Args::parse();
    info!("Parsed command-line args: {:?}", args);
    let cfg = build_config(args)?;

    // 1) evaluation sample
    let dp = data::load_data_point(
        &cfg.inputs.context_table,
        &cfg.inputs.target_table,
        cfg.inputs.sample,
        cfg.npf_start_band,
    )?;
    cfg.bands.check_observed(dp.truth.len_of(Axis(1)), "truth")?;
    let n_t = dp.time_steps();
    if n_t < 2 {
        bail!("truth has {} time steps, need at least 2", n_t);
    }
    info!(
        "truth shape={:?}, context steps={}, target steps={}",
        dp.truth.shape(),
        dp.context.len_of(Axis(4)),
        dp.target.len_of(Axis(4))
    );

    // 2) one forward pass per model
    let labels = cfg.model_labels();
    let count = prediction_count(n_t);
    let pb = ProgressBar::new(cfg.models.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}/{len:3} {msg}",
        )
        .context("building progress bar style")?
        .progress_chars("##-"),
    );
    let mut predictions: Vec<(String, Array5<f32>)> = Vec::with_capacity(cfg.models.len());
    for (spec, label) in cfg.models.iter().zip(labels) {
        pb.set_message(label.clone());
        let mut forecaster = Forecaster::load(&label, &spec.path, cfg.output_name.as_deref())?;
        let pred = forecaster.predict(&dp.context, count, &dp.npf)?;
        check_prediction(&pred, &dp.truth, &label)?;
        cfg.bands
            .check_predicted(pred.len_of(Axis(1)), &format!("prediction of '{}'", label))?;
        if pred.len_of(Axis(4)) != count {
            warn!(
                "model '{}' returned {} steps, asked for {}",
                label,
                pred.len_of(Axis(4)),
                count
            );
        }
        predictions.push((label, pred));
        pb.inc(1);
    }
    pb.finish_with_message("inference done");

    // 3) reference year
    let reference_path = cfg.reference_path();
    info!("Loading reference year {} from {:?}", cfg.year, reference_path);
    let reference = data::load_reference(&reference_path)?;
    cfg.bands
        .check_observed(reference.len_of(Axis(1)), "reference year")?;
    if reference.len_of(Axis(4)) != n_t {
        bail!(
            "reference year has {} time steps, truth has {}",
            reference.len_of(Axis(4)),
            n_t
        );
    }

    // 4) NDVI and 5) quantiles
    let truth_ndvi =
        masked_ndvi(dp.truth.view(), &cfg.bands, UNIT_MASK_SCALE, cfg.cloud_threshold);
    let reference_ndvi =
        masked_ndvi(reference.view(), &cfg.bands, BYTE_MASK_SCALE, cfg.cloud_threshold);
    let q_truth = summarize(&truth_ndvi, cfg.confidence, cfg.min_valid_pixels)?;
    let q_reference = summarize(&reference_ndvi, cfg.confidence, cfg.min_valid_pixels)?;
    info!(
        "quantile levels {:?}; valid steps: truth {}/{}, reference {}/{}",
        q_truth.levels,
        q_truth.valid_steps().count(),
        n_t,
        q_reference.valid_steps().count(),
        n_t
    );
    for (t, (&ok, &count)) in q_truth.valid.iter().zip(q_truth.counts.iter()).enumerate() {
        if !ok {
            warn!("truth step {} dropped, {} observed pixels", t, count);
        }
    }

    let axis = match cfg.date_bounds {
        Some((start, end)) => TimeAxis::calendar(start, end, n_t)?,
        None => TimeAxis::Index { len: n_t },
    };

    let mut pred_series = Vec::with_capacity(predictions.len());
    for (i, (label, pred)) in predictions.iter().enumerate() {
        let pred_ndvi = unmasked_ndvi(pred.view(), &cfg.bands);
        let q = summarize(&pred_ndvi, cfg.confidence, cfg.min_valid_pixels)?;
        let offset = n_t - pred.len_of(Axis(4));
        pred_series.push(BandSeries::from_summary(
            label,
            prediction_color(i),
            true,
            &q,
            &axis,
            offset,
        )?);
    }
    let truth_series =
        BandSeries::from_summary("true median", TRUTH_COLOR, false, &q_truth, &axis, 0)?;
    let reference_series = BandSeries::from_summary(
        &format!("{} median", cfg.year),
        REFERENCE_COLOR,
        false,
        &q_reference,
        &axis,
        0,
    )?;

    // 6) figure
    let precipitation = weather_series(
        dp.truth.view(),
        cfg.bands.precipitation,
        &axis,
        precipitation_mm,
    );
    let temperature = weather_series(
        dp.truth.view(),
        cfg.bands.temperature,
        &axis,
        temperature_celsius,
    );
    let fig = Figure::new(
        axis,
        truth_series,
        reference_series,
        pred_series,
        precipitation,
        temperature,
    )?;

    let out_path = cfg.output_path();
    plot::render(&fig, &out_path, cfg.size)
        .with_context(|| format!("rendering figure to {:?}", out_path))?;
    info!("Figure written to {:?}", out_path);

    if cfg.show {
        if let Err(e) = open::that(&out_path) {
            warn!("Cannot open {:?} in a viewer: {}", out_path, e);
        }
    }

    info!("=== Done. ===");
    Ok(())
}
