use std::{collections::HashMap, path::Path};

use candle_core::Tensor;

use super::save::{read_export, transpose_impl, NetworkHeader};
use crate::{
    config::ModelConfig,
    error::{Error, Result},
    nn::ParamStore,
};

/// Input plane holding the fifty-move counter.
const RULE50_PLANE: usize = 109;

/// Planes fed to an input convolution.
const INPUT_PLANES: usize = 112;

/// Only an input convolution sees the raw counter; the dense embedding is fed the normalised planes.
const INPUT_CONV: &str = "input/conv2d/kernel";

/// Older encodings fed the counter as plies in `0..=99` rather than scaled to `0..1`.
const RULE50_SCALE: f32 = 99.0;

/// `[out, in, h, w]` to `[h, w, in, out]`.
pub fn transpose_conv_kernel(dims: [usize; 4], weights: &[f32]) -> Vec<f32> {
    let [outputs, inputs, h, w] = dims;
    let mut out = vec![0.0; weights.len()];
    for o in 0..outputs {
        for i in 0..inputs {
            for y in 0..h {
                for x in 0..w {
                    let src = ((o * inputs + i) * h + y) * w + x;
                    let dst = ((y * w + x) * inputs + i) * outputs + o;
                    out[dst] = weights[src];
                }
            }
        }
    }
    out
}

fn check_format(header: &NetworkHeader, model: &ModelConfig, ignore_errors: bool) -> Result<()> {
    let checks = [
        ("policy", format!("{:?}", model.policy), format!("{:?}", header.model.policy)),
        ("value", format!("{:?}", model.value), format!("{:?}", header.model.value)),
        ("moves left", format!("{:?}", model.moves_left), format!("{:?}", header.model.moves_left)),
    ];

    for (head, expected, found) in checks {
        if expected == found {
            continue;
        }

        if ignore_errors {
            tracing::warn!(head, %expected, %found, "head format mismatch, loading anyway");
        } else {
            return Err(Error::WeightFormat { head, expected, found });
        }
    }

    Ok(())
}

/// Scales the fifty-move plane of an `[out, in, h, w]` input convolution kernel.
fn rescale_rule50(dims: [usize; 4], values: &mut [f32]) {
    let [_, inputs, h, w] = dims;
    if inputs != INPUT_PLANES {
        return;
    }

    let spatial = h * w;
    for (i, v) in values.iter_mut().enumerate() {
        if (i % (INPUT_PLANES * spatial)) / spatial == RULE50_PLANE {
            *v *= RULE50_SCALE;
        }
    }
}

/// Converts one exported record into the trainer's layout for a weight of `shape`.
fn to_trainer_layout(shape: &[usize], values: &[f32]) -> Vec<f32> {
    match *shape {
        [inputs, outputs] => transpose_impl(outputs, inputs, values),
        [h, w, inputs, outputs] => transpose_conv_kernel([outputs, inputs, h, w], values),
        _ => values.to_vec(),
    }
}

/// Loads an inference export from `dir` into `params`, returning how many weights were replaced.
///
/// With `ignore_errors`, format mismatches, absent tensors and tensors of the
/// wrong size are logged and skipped, leaving those weights untouched.
pub fn replace_weights(dir: &Path, model: &ModelConfig, params: &ParamStore, ignore_errors: bool) -> Result<usize> {
    let (header, records) = read_export(dir)?;
    check_format(&header, model, ignore_errors)?;

    let records: HashMap<String, Vec<f32>> = records.into_iter().collect();
    let raw_rule50 = !header.model.input_type.has_normalised_rule50();
    let mut replaced = 0;

    for param in params.iter() {
        let Some(values) = records.get(&param.name) else {
            if ignore_errors {
                tracing::warn!(name = %param.name, "no values in export, keeping initialised weights");
                continue;
            }
            return Err(Error::MissingWeight(param.name.clone()));
        };

        let expected = param.var.elem_count();
        if values.len() != expected {
            if ignore_errors {
                tracing::warn!(name = %param.name, expected, found = values.len(), "wrong length, skipping");
                continue;
            }
            return Err(Error::WeightLength { name: param.name.clone(), expected, found: values.len() });
        }

        let values = match *param.shape() {
            [h, w, inputs, outputs] if raw_rule50 && param.name == INPUT_CONV => {
                let mut raw = values.clone();
                rescale_rule50([outputs, inputs, h, w], &mut raw);
                to_trainer_layout(param.shape(), &raw)
            }
            _ => to_trainer_layout(param.shape(), values),
        };

        param.var.set(&Tensor::from_vec(values, param.shape(), params.device())?)?;
        replaced += 1;
    }

    tracing::info!(path = %dir.display(), step = header.step, replaced, "replaced weights");
    Ok(replaced)
}
