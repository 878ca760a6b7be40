use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::NaiveDate;

use crate::plot::OutputFormat;

/// Band positions inside the `[batch, band, height, width, time]` cubes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandIndices {
    pub red: usize,
    pub nir: usize,
    pub cloud: usize,
    pub precipitation: usize,
    pub temperature: usize,
}

impl Default for BandIndices {
    fn default() -> Self {
        BandIndices {
            red: 2,
            nir: 3,
            cloud: 4,
            precipitation: 6,
            temperature: 8,
        }
    }
}

impl BandIndices {
    /// Check that an observed cube (truth or reference year) carries every band we read.
    pub fn check_observed(&self, n_bands: usize, what: &str) -> Result<()> {
        let needed = [
            ("red", self.red),
            ("nir", self.nir),
            ("cloud", self.cloud),
            ("precipitation", self.precipitation),
            ("temperature", self.temperature),
        ];
        for (name, idx) in needed {
            if idx >= n_bands {
                bail!(
                    "{} has {} bands, but {} band index is {}",
                    what,
                    n_bands,
                    name,
                    idx
                );
            }
        }
        Ok(())
    }

    /// Predictions only need the two reflectance bands.
    pub fn check_predicted(&self, n_bands: usize, what: &str) -> Result<()> {
        let needed = self.red.max(self.nir) + 1;
        if n_bands < needed {
            bail!("{} has {} bands, need at least {} for red/nir", what, n_bands, needed);
        }
        Ok(())
    }
}

/// A forecasting model given on the command line as `LABEL=PATH` or just `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub label: Option<String>,
    pub path: PathBuf,
}

impl FromStr for ModelSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty model specification".to_string());
        }
        match s.split_once('=') {
            Some((label, path)) => {
                if path.is_empty() {
                    return Err(format!("model '{}' has no path", label));
                }
                let label = label.trim();
                Ok(ModelSpec {
                    label: (!label.is_empty()).then(|| label.to_string()),
                    path: PathBuf::from(path),
                })
            }
            None => Ok(ModelSpec {
                label: None,
                path: PathBuf::from(s),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputPaths {
    pub context_table: PathBuf,
    pub target_table: PathBuf,
    pub reference_dir: PathBuf,
    /// Entry of the path tables to evaluate
    pub sample: usize,
}

#[derive(Debug, Clone)]
pub struct PlotConfig {
    pub bands: BandIndices,
    pub npf_start_band: usize,
    pub inputs: InputPaths,
    pub models: Vec<ModelSpec>,
    pub output_name: Option<String>,
    pub year: String,
    pub date_bounds: Option<(NaiveDate, NaiveDate)>,
    pub confidence: f64,
    pub min_valid_pixels: usize,
    pub cloud_threshold: f32,
    pub output: Option<PathBuf>,
    pub show: bool,
    pub size: (u32, u32),
}

impl PlotConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            bail!("confidence must be within [0, 1], got {}", self.confidence);
        }
        if self.models.is_empty() {
            bail!("at least one model is required");
        }
        if let Some((start, end)) = self.date_bounds {
            if end <= start {
                bail!("end date {} is not after start date {}", end, start);
            }
        }
        if self.size.0 == 0 || self.size.1 == 0 {
            bail!("figure size must be non-zero, got {:?}", self.size);
        }
        OutputFormat::from_path(&self.output_path())?;
        Ok(())
    }

    /// Labels for every model, numbered `model N` where none was given.
    pub fn model_labels(&self) -> Vec<String> {
        self.models
            .iter()
            .enumerate()
            .map(|(i, m)| m.label.clone().unwrap_or_else(|| format!("model {}", i + 1)))
            .collect()
    }

    pub fn reference_path(&self) -> PathBuf {
        self.inputs
            .reference_dir
            .join(format!("sentinel_data_{}.npy", self.year))
    }

    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("NDVI_time_series{}.pdf", self.year)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> PlotConfig {
        PlotConfig {
            bands: BandIndices::default(),
            npf_start_band: 5,
            inputs: InputPaths {
                context_table: PathBuf::from("ctx.json"),
                target_table: PathBuf::from("tgt.json"),
                reference_dir: PathBuf::from("demos"),
                sample: 0,
            },
            models: vec![
                "ConvLSTM=a.onnx".parse().unwrap(),
                "b.onnx".parse().unwrap(),
            ],
            output_name: None,
            year: "2020".to_string(),
            date_bounds: None,
            confidence: 0.5,
            min_valid_pixels: 1,
            cloud_threshold: 0.5,
            output: None,
            show: true,
            size: (1200, 900),
        }
    }

    #[test]
    fn parses_labelled_and_bare_models() {
        let m: ModelSpec = "ConvLSTM=trained/conv.onnx".parse().unwrap();
        assert_eq!(m.label.as_deref(), Some("ConvLSTM"));
        assert_eq!(m.path, PathBuf::from("trained/conv.onnx"));

        let m: ModelSpec = "trained/conv.onnx".parse().unwrap();
        assert_eq!(m.label, None);

        assert!("Label=".parse::<ModelSpec>().is_err());
        assert!("".parse::<ModelSpec>().is_err());
    }

    #[test]
    fn unlabelled_models_are_numbered() {
        let cfg = sample_config();
        assert_eq!(cfg.model_labels(), vec!["ConvLSTM", "model 2"]);
    }

    #[test]
    fn default_paths_follow_year() {
        let cfg = sample_config();
        assert_eq!(cfg.reference_path(), PathBuf::from("demos/sentinel_data_2020.npy"));
        assert_eq!(cfg.output_path(), PathBuf::from("NDVI_time_series2020.pdf"));
    }

    #[test]
    fn rejects_bad_confidence_and_dates() {
        let mut cfg = sample_config();
        assert!(cfg.validate().is_ok());
        cfg.confidence = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        let d = NaiveDate::from_ymd_opt(2018, 5, 1).unwrap();
        cfg.date_bounds = Some((d, d));
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        cfg.output = Some(PathBuf::from("out/chart.SVG"));
        assert!(cfg.validate().is_ok());
        cfg.output = Some(PathBuf::from("out/chart.jpg"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn band_checks() {
        let bands = BandIndices::default();
        assert!(bands.check_observed(9, "truth").is_ok());
        assert!(bands.check_observed(8, "truth").is_err());
        assert!(bands.check_predicted(4, "prediction").is_ok());
        assert!(bands.check_predicted(3, "prediction").is_err());
    }
}
