use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use ndarray::{concatenate, s, Array5, ArrayD, Axis, Ix5};
use ndarray_npy::{read_npy, ReadNpyError};

/// Axis order of the legacy reference-year files is (H, W, band, T)
const REFERENCE_AXES: [usize; 4] = [2, 0, 1, 3];

/// One evaluation sample, every cube shaped `[batch, band, H, W, T]`.
pub struct DataPoint {
    pub truth: Array5<f32>,
    pub context: Array5<f32>,
    pub target: Array5<f32>,
    /// Non-predictive features over the whole truth span
    pub npf: Array5<f32>,
}

impl DataPoint {
    pub fn time_steps(&self) -> usize {
        self.truth.len_of(Axis(4))
    }
}

/// Read a `.npy` cube of any supported dtype (f32, f64, u8, u16), widened to f32.
pub fn read_cube(path: &Path) -> Result<ArrayD<f32>> {
    match read_npy::<_, ArrayD<f32>>(path) {
        Ok(a) => return Ok(a),
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
    }
    match read_npy::<_, ArrayD<f64>>(path) {
        Ok(a) => return Ok(a.mapv(|v| v as f32)),
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
    }
    match read_npy::<_, ArrayD<u8>>(path) {
        Ok(a) => return Ok(a.mapv(f32::from)),
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
    }
    let a: ArrayD<u16> = read_npy(path)
        .with_context(|| format!("reading {:?} (expected f32, f64, u8 or u16 data)", path))?;
    Ok(a.mapv(f32::from))
}

/// Read a JSON array of cube paths. Relative entries resolve against the table's directory.
pub fn read_path_table(path: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(path).with_context(|| format!("opening path table {:?}", path))?;
    let entries: Vec<PathBuf> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing path table {:?}", path))?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    Ok(entries
        .into_iter()
        .map(|p| if p.is_relative() { base.join(p) } else { p })
        .collect())
}

/// Give a 4-D `[band, H, W, T]` cube a leading batch axis; 5-D cubes pass through.
pub fn to_batched(cube: ArrayD<f32>, what: &str) -> Result<Array5<f32>> {
    let cube = match cube.ndim() {
        4 => cube.insert_axis(Axis(0)),
        5 => cube,
        n => bail!("{} must be 4-D or 5-D, got {}-D with shape {:?}", what, n, cube.shape()),
    };
    let cube = cube
        .into_dimensionality::<Ix5>()
        .with_context(|| format!("{} is not 5-D", what))?;
    Ok(cube.as_standard_layout().into_owned())
}

/// Join context and target along time and slice off the non-predictive features.
pub fn split_data_point(
    context: Array5<f32>,
    target: Array5<f32>,
    npf_start_band: usize,
) -> Result<DataPoint> {
    let (cb, cc, ch, cw, _) = context.dim();
    let (tb, tc, th, tw, _) = target.dim();
    if (cb, cc, ch, cw) != (tb, tc, th, tw) {
        bail!(
            "context shape {:?} and target shape {:?} differ outside the time axis",
            context.shape(),
            target.shape()
        );
    }
    if npf_start_band >= cc {
        bail!("npf start band {} is out of range for {} bands", npf_start_band, cc);
    }

    let truth = concatenate(Axis(4), &[context.view(), target.view()])
        .context("concatenating context and target")?
        .as_standard_layout()
        .into_owned();
    let npf = truth.slice(s![.., npf_start_band.., .., .., ..]).to_owned();
    debug!("truth shape={:?}, npf shape={:?}", truth.shape(), npf.shape());

    Ok(DataPoint {
        truth,
        context,
        target,
        npf,
    })
}

pub fn load_data_point(
    context_table: &Path,
    target_table: &Path,
    sample: usize,
    npf_start_band: usize,
) -> Result<DataPoint> {
    let contexts = read_path_table(context_table)?;
    let targets = read_path_table(target_table)?;
    info!(
        "Path tables: {} context entries, {} target entries",
        contexts.len(),
        targets.len()
    );

    let (ctx_path, tgt_path) = match (contexts.get(sample), targets.get(sample)) {
        (Some(c), Some(t)) => (c, t),
        _ => bail!(
            "sample {} out of range (context table has {}, target table has {})",
            sample,
            contexts.len(),
            targets.len()
        ),
    };

    info!("Loading context={:?}, target={:?}", ctx_path, tgt_path);
    let context = to_batched(read_cube(ctx_path)?, "context")?;
    let target = to_batched(read_cube(tgt_path)?, "target")?;
    split_data_point(context, target, npf_start_band)
}

/// Load a legacy reference-year cube and reorder it to `[1, band, H, W, T]`.
pub fn load_reference(path: &Path) -> Result<Array5<f32>> {
    let raw = read_cube(path)?;
    reference_to_batched(raw).with_context(|| format!("reference year cube {:?}", path))
}

pub fn reference_to_batched(raw: ArrayD<f32>) -> Result<Array5<f32>> {
    if raw.ndim() != 4 {
        bail!("expected (H, W, band, T), got shape {:?}", raw.shape());
    }
    let permuted = raw.permuted_axes(REFERENCE_AXES.to_vec());
    to_batched(permuted, "reference year")
}
