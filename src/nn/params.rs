use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};

use crate::error::{Error, Result};

/// L2 penalty coefficient applied to regularised weights.
pub const L2_COEFFICIENT: f64 = 0.5 * 1e-4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    Kernel,
    Bias,
    NormScale,
    NormShift,
    /// Multiplicative gate, kept non-negative.
    MultGate,
    AddGate,
}

pub struct Param {
    pub name: String,
    pub var: Var,
    pub kind: ParamKind,
    pub regularised: bool,
}

impl Param {
    pub fn shape(&self) -> &[usize] {
        self.var.dims()
    }

    pub fn values(&self) -> Result<Vec<f32>> {
        Ok(self.var.as_tensor().flatten_all()?.to_vec1()?)
    }
}

/// Every trainable tensor of a network, in construction order.
pub struct ParamStore {
    params: Vec<Param>,
    device: Device,
}

impl ParamStore {
    pub fn new(device: &Device) -> Self {
        Self { params: Vec::new(), device: device.clone() }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn add(&mut self, name: &str, data: Vec<f32>, shape: &[usize], kind: ParamKind, regularised: bool) -> Result<Var> {
        if self.params.iter().any(|p| p.name == name) {
            return Err(Error::Config(format!("duplicate weight name {name}")));
        }

        let var = Var::from_tensor(&Tensor::from_vec(data, shape, &self.device)?)?;
        self.params.push(Param { name: name.to_string(), var: var.clone(), kind, regularised });
        Ok(var)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn num_weights(&self) -> usize {
        self.params.iter().map(|p| p.var.elem_count()).sum()
    }

    /// Independent copies of every weight, in store order.
    pub fn snapshot(&self) -> Result<Vec<Tensor>> {
        self.params.iter().map(|p| Ok(p.var.as_detached_tensor().copy()?)).collect()
    }

    /// Overwrites every weight from a snapshot taken in store order.
    pub fn assign(&self, values: &[Tensor]) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(Error::Config(format!("expected {} tensors, got {}", self.params.len(), values.len())));
        }

        for (param, value) in self.params.iter().zip(values) {
            param.var.set(&value.to_device(&self.device)?.to_dtype(DType::F32)?)?;
        }

        Ok(())
    }

    /// Copies the weights of another store with identical layout.
    pub fn copy_from(&self, other: &ParamStore) -> Result<()> {
        self.assign(&other.params.iter().map(|p| p.var.as_detached_tensor()).collect::<Vec<_>>())
    }

    pub fn named_tensors(&self) -> Result<HashMap<String, Tensor>> {
        self.params.iter().map(|p| Ok((p.name.clone(), p.var.as_detached_tensor().copy()?))).collect()
    }

    /// Loads every weight by name; all must be present with matching shapes.
    pub fn load_named_tensors(&self, map: &HashMap<String, Tensor>) -> Result<()> {
        for param in &self.params {
            let value = map.get(&param.name).ok_or_else(|| Error::MissingWeight(param.name.clone()))?;
            if value.dims() != param.shape() {
                return Err(Error::WeightLength {
                    name: param.name.clone(),
                    expected: param.var.elem_count(),
                    found: value.elem_count(),
                });
            }
            param.var.set(&value.to_device(&self.device)?.to_dtype(DType::F32)?)?;
        }

        Ok(())
    }

    /// `L2_COEFFICIENT * sum(w^2)` over regularised weights.
    pub fn l2_penalty(&self) -> Result<Tensor> {
        let mut total = Tensor::zeros((), DType::F32, &self.device)?;
        for param in self.params.iter().filter(|p| p.regularised) {
            total = (total + param.var.as_tensor().sqr()?.sum_all()?)?;
        }

        Ok((total * L2_COEFFICIENT)?)
    }

    /// Projects constrained weights back into their feasible set.
    pub fn apply_constraints(&self) -> Result<()> {
        for param in self.params.iter().filter(|p| p.kind == ParamKind::MultGate) {
            param.var.set(&param.var.as_tensor().relu()?)?;
        }

        Ok(())
    }
}
