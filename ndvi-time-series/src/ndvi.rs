use ndarray::{Array4, ArrayView4, ArrayView5, Axis, Zip};

use crate::config::BandIndices;

pub const NDVI_EPS: f32 = 1e-6;

/// Cloud mask stored on a 0..1 scale (current datasets)
pub const UNIT_MASK_SCALE: f32 = 1.0;
/// Cloud mask stored on a 0..255 scale (legacy reference years)
pub const BYTE_MASK_SCALE: f32 = 255.0;

/// NDVI values per `[batch, H, W, T]`, plus which pixels count as observed.
pub struct NdviSeries {
    pub values: Array4<f32>,
    pub observed: Array4<bool>,
}

impl NdviSeries {
    pub fn time_steps(&self) -> usize {
        self.values.len_of(Axis(3))
    }
}

/// Plain normalised difference `(nir - red) / (nir + red + eps)`; NaN propagates.
pub fn normalized_difference(nir: ArrayView4<f32>, red: ArrayView4<f32>) -> Array4<f32> {
    Zip::from(&nir)
        .and(&red)
        .par_map_collect(|&n, &r| (n - r) / (n + r + NDVI_EPS))
}

/// NDVI of an observed cube, zeroed by `(1 - cloud / mask_scale)`.
///
/// A pixel is observed when its normalised cloud value is below `cloud_threshold`
/// and the index is finite.
pub fn masked_ndvi(
    cube: ArrayView5<f32>,
    bands: &BandIndices,
    mask_scale: f32,
    cloud_threshold: f32,
) -> NdviSeries {
    let nir = cube.index_axis(Axis(1), bands.nir);
    let red = cube.index_axis(Axis(1), bands.red);
    let cloud = cube.index_axis(Axis(1), bands.cloud);

    let raw = normalized_difference(nir, red);
    let values = Zip::from(&raw)
        .and(&cloud)
        .par_map_collect(|&v, &c| v * (1.0 - c / mask_scale));
    let observed = Zip::from(&raw)
        .and(&cloud)
        .par_map_collect(|&v, &c| v.is_finite() && c / mask_scale < cloud_threshold);

    NdviSeries { values, observed }
}

/// NDVI of a predicted cube. Predictions carry no cloud band, every finite pixel counts.
pub fn unmasked_ndvi(cube: ArrayView5<f32>, bands: &BandIndices) -> NdviSeries {
    let values = normalized_difference(
        cube.index_axis(Axis(1), bands.nir),
        cube.index_axis(Axis(1), bands.red),
    );
    let observed = values.mapv(f32::is_finite);
    NdviSeries { values, observed }
}
