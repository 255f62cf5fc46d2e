use candle_core::{DType, Module, Result as CandleResult, Tensor, Var, D};

use super::{
    activation::Activation,
    params::{ParamKind, ParamStore},
};
use crate::{
    error::Result,
    rng::{Init, WeightRng},
};

/// Construction options for a dense layer.
#[derive(Clone, Copy, Debug)]
pub struct DenseSpec {
    pub init: Init,
    pub bias: bool,
    pub activation: Option<Activation>,
    pub regularise_kernel: bool,
    pub regularise_bias: bool,
}

impl DenseSpec {
    pub fn new(init: Init) -> Self {
        Self { init, bias: true, activation: None, regularise_kernel: false, regularise_bias: false }
    }

    pub fn glorot() -> Self {
        Self::new(Init::GLOROT_NORMAL)
    }

    pub fn no_bias(mut self) -> Self {
        self.bias = false;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn regularised(mut self) -> Self {
        self.regularise_kernel = true;
        self
    }

    pub fn regularised_bias(mut self) -> Self {
        self.regularise_bias = true;
        self
    }
}

/// `act(x @ W + b)` over the last axis, with `W` stored as `[in, out]`.
pub struct Dense {
    pub name: String,
    kernel: Var,
    bias: Option<Var>,
    activation: Option<Activation>,
}

impl Dense {
    pub fn new(
        store: &mut ParamStore,
        rng: &mut WeightRng,
        name: &str,
        inputs: usize,
        outputs: usize,
        spec: DenseSpec,
    ) -> Result<Self> {
        let values = rng.kernel(spec.init, inputs, outputs);
        let kernel =
            store.add(&format!("{name}/kernel"), values, &[inputs, outputs], ParamKind::Kernel, spec.regularise_kernel)?;

        let bias = if spec.bias {
            let zeros = vec![0.0; outputs];
            Some(store.add(&format!("{name}/bias"), zeros, &[outputs], ParamKind::Bias, spec.regularise_bias)?)
        } else {
            None
        };

        Ok(Self { name: name.to_string(), kernel, bias, activation: spec.activation })
    }

    pub fn kernel(&self) -> &Var {
        &self.kernel
    }
}

impl Module for Dense {
    fn forward(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let dims = xs.dims().to_vec();
        let (lead, inputs) = dims.split_at(dims.len() - 1);
        let rows = lead.iter().product::<usize>();

        let kernel = self.kernel.as_tensor().to_dtype(xs.dtype())?;
        let mut out = xs.reshape((rows, inputs[0]))?.matmul(&kernel)?;

        if let Some(bias) = &self.bias {
            out = out.broadcast_add(&bias.as_tensor().to_dtype(xs.dtype())?)?;
        }

        let mut shape = lead.to_vec();
        shape.push(kernel.dim(1)?);
        let out = out.reshape(shape)?;

        match self.activation {
            Some(act) => act.forward(&out),
            None => Ok(out),
        }
    }
}

/// Layer normalisation over the last axis with learned scale and shift.
pub struct LayerNorm {
    gamma: Var,
    beta: Var,
    eps: f64,
}

impl LayerNorm {
    pub const DEFAULT_EPS: f64 = 1e-3;

    pub fn new(store: &mut ParamStore, name: &str, size: usize) -> Result<Self> {
        let gamma = store.add(&format!("{name}/gamma"), vec![1.0; size], &[size], ParamKind::NormScale, false)?;
        let beta = store.add(&format!("{name}/beta"), vec![0.0; size], &[size], ParamKind::NormShift, false)?;
        Ok(Self { gamma, beta, eps: Self::DEFAULT_EPS })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centred = xs.broadcast_sub(&mean)?;
        let var = centred.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centred.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(self.gamma.as_tensor())?.broadcast_add(self.beta.as_tensor())?.to_dtype(dtype)
    }
}

/// Per-square multiplicative then additive gates on the embedding.
pub struct Gating {
    mult: Var,
    add: Var,
}

impl Gating {
    pub fn new(store: &mut ParamStore, name: &str, squares: usize, size: usize) -> Result<Self> {
        let n = squares * size;
        let mult = store.add(&format!("{name}/mult_gate/gate"), vec![1.0; n], &[squares, size], ParamKind::MultGate, false)?;
        let add = store.add(&format!("{name}/add_gate/gate"), vec![0.0; n], &[squares, size], ParamKind::AddGate, false)?;
        Ok(Self { mult, add })
    }
}

impl Module for Gating {
    fn forward(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let mult = self.mult.as_tensor().to_dtype(xs.dtype())?;
        let add = self.add.as_tensor().to_dtype(xs.dtype())?;
        xs.broadcast_mul(&mult)?.broadcast_add(&add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn dense_flattens_leading_axes() {
        let mut store = ParamStore::new(&Device::Cpu);
        let mut rng = WeightRng::seeded(0);
        let dense = Dense::new(&mut store, &mut rng, "d", 4, 3, DenseSpec::glorot()).unwrap();
        let xs = Tensor::ones((2, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let ys = dense.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[2, 5, 3]);
        assert_eq!(store.len(), 2);
        assert!(store.get("d/kernel").is_some() && store.get("d/bias").is_some());
    }

    #[test]
    fn layer_norm_normalises() {
        let mut store = ParamStore::new(&Device::Cpu);
        let ln = LayerNorm::new(&mut store, "ln", 4).unwrap();
        let xs = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();
        let ys = ln.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
        let mean = ys[0].iter().sum::<f32>() / 4.0;
        let var = ys[0].iter().map(|y| (y - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.25 / 1.251).abs() < 1e-4);
    }

    #[test]
    fn gating_starts_as_identity() {
        let mut store = ParamStore::new(&Device::Cpu);
        let gate = Gating::new(&mut store, "embedding", 64, 2).unwrap();
        let xs = Tensor::rand(-1.0f32, 1.0, (3, 64, 2), &Device::Cpu).unwrap();
        let ys = gate.forward(&xs).unwrap();
        let diff = (ys - &xs).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(diff, 0.0);
    }
}
