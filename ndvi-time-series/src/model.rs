use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use ndarray::{arr1, Array5, ArrayD, Axis, Ix5, IxDyn};
use ort::{
    inputs,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};

const INPUT_CONTEXT: &str = "x";
const INPUT_PREDICTION_COUNT: &str = "prediction_count";
const INPUT_NON_PRED_FEAT: &str = "non_pred_feat";

/// Target length requested from the model: two thirds of the truth sequence.
pub fn prediction_count(truth_steps: usize) -> usize {
    truth_steps * 2 / 3
}

/// An exported forecasting network run through ONNX Runtime.
pub struct Forecaster {
    pub label: String,
    session: Session,
    output_name: String,
}

impl Forecaster {
    /// `output_name` selects the primary output; by default the graph's first output.
    pub fn load(label: &str, path: &Path, output_name: Option<&str>) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(path)
            .with_context(|| format!("loading model '{}' from {:?}", label, path))?;

        let output_name = match output_name {
            Some(name) => {
                if !session.outputs.iter().any(|o| o.name == name) {
                    bail!("model '{}' has no output named '{}'", label, name);
                }
                name.to_string()
            }
            None => match session.outputs.first() {
                Some(o) => o.name.clone(),
                None => bail!("model '{}' declares no outputs", label),
            },
        };
        debug!(
            "model '{}': inputs={:?}, primary output={}",
            label,
            session.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            output_name
        );

        Ok(Forecaster {
            label: label.to_string(),
            session,
            output_name,
        })
    }

    /// One forward pass. Auxiliary outputs are discarded.
    pub fn predict(
        &mut self,
        context: &Array5<f32>,
        prediction_count: usize,
        npf: &Array5<f32>,
    ) -> Result<Array5<f32>> {
        let context = context.as_standard_layout().into_owned();
        let npf = npf.as_standard_layout().into_owned();
        let count = arr1(&[prediction_count as i64]);

        let model_inputs = inputs! {
            INPUT_CONTEXT => TensorRef::from_array_view(&context)?,
            INPUT_PREDICTION_COUNT => TensorRef::from_array_view(&count)?,
            INPUT_NON_PRED_FEAT => TensorRef::from_array_view(&npf)?,
        };

        let outputs = self
            .session
            .run(model_inputs)
            .with_context(|| format!("running model '{}'", self.label))?;
        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .with_context(|| format!("model '{}' output is not an f32 tensor", self.label))?;
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        let pred = ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec())?
            .into_dimensionality::<Ix5>()
            .with_context(|| format!("model '{}' output must be 5-D, got {:?}", self.label, dims))?;

        info!(
            "model '{}' predicted {} steps, shape={:?}",
            self.label,
            pred.len_of(Axis(4)),
            pred.shape()
        );
        Ok(pred)
    }
}

/// Predictions must line up with the truth in batch and space and fit inside its time span.
pub fn check_prediction(pred: &Array5<f32>, truth: &Array5<f32>, label: &str) -> Result<()> {
    let (pb, _, ph, pw, pt) = pred.dim();
    let (tb, _, th, tw, tt) = truth.dim();
    if (pb, ph, pw) != (tb, th, tw) {
        bail!(
            "model '{}' prediction shape {:?} does not match truth shape {:?}",
            label,
            pred.shape(),
            truth.shape()
        );
    }
    if pt == 0 || pt > tt {
        bail!(
            "model '{}' predicted {} steps, truth has {}",
            label,
            pt,
            tt
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ShapeBuilder;

    // x -> pred, non_pred_feat -> aux, prediction_count -> count, all Identity
    const IDENTITY_MODEL: &str =
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/identity_forecaster.onnx");

    fn cube(shape: (usize, usize, usize, usize, usize), offset: f32) -> Array5<f32> {
        Array5::from_shape_fn(shape, |(_, c, h, w, t)| {
            offset + (c * 100 + h * 10 + w) as f32 + t as f32 * 0.01
        })
    }

    #[test]
    fn two_thirds_of_sequence() {
        assert_eq!(prediction_count(30), 20);
        assert_eq!(prediction_count(31), 20);
        assert_eq!(prediction_count(3), 2);
    }

    #[test]
    fn prediction_shape_checks() {
        let truth = Array5::<f32>::zeros((1, 9, 4, 4, 30));
        let good = Array5::<f32>::zeros((1, 4, 4, 4, 20));
        assert!(check_prediction(&good, &truth, "m").is_ok());

        let wrong_space = Array5::<f32>::zeros((1, 4, 2, 4, 20));
        assert!(check_prediction(&wrong_space, &truth, "m").is_err());

        let too_long = Array5::<f32>::zeros((1, 4, 4, 4, 31));
        assert!(check_prediction(&too_long, &truth, "m").is_err());
    }

    #[test]
    fn first_graph_output_is_the_prediction() {
        let mut model = Forecaster::load("identity", Path::new(IDENTITY_MODEL), None).unwrap();
        let context = cube((1, 4, 2, 2, 6), 0.0);
        let npf = cube((1, 3, 2, 2, 6), 1000.0);
        let pred = model.predict(&context, prediction_count(6), &npf).unwrap();
        assert_eq!(pred, context);

        // column-major input goes in as the same logical array
        let mut fortran = Array5::<f32>::zeros((1, 4, 2, 2, 6).f());
        fortran.assign(&context);
        assert_eq!(model.predict(&fortran, 4, &npf).unwrap(), context);
    }

    #[test]
    fn named_output_selects_auxiliary_tensor() {
        let path = Path::new(IDENTITY_MODEL);
        let mut model = Forecaster::load("identity", path, Some("aux")).unwrap();
        let context = cube((1, 4, 2, 2, 6), 0.0);
        let npf = cube((1, 3, 2, 2, 6), 1000.0);
        assert_eq!(model.predict(&context, 4, &npf).unwrap(), npf);
    }

    #[test]
    fn rejects_unknown_and_non_float_outputs() {
        let path = Path::new(IDENTITY_MODEL);
        assert!(Forecaster::load("identity", path, Some("missing")).is_err());

        let mut model = Forecaster::load("identity", path, Some("count")).unwrap();
        let context = cube((1, 4, 2, 2, 6), 0.0);
        let npf = cube((1, 3, 2, 2, 6), 1000.0);
        assert!(model.predict(&context, 4, &npf).is_err());

        assert!(Forecaster::load("nothing", Path::new("no/such/model.onnx"), None).is_err());
    }
}
