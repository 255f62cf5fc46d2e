mod lookahead;
mod nadam;
mod rmsprop;
mod sgd;

pub use lookahead::{Lookahead, LookaheadParams};
pub use nadam::{Nadam, NadamParams};
pub use rmsprop::{RmsProp, RmsPropParams};
pub use sgd::{Sgd, SgdParams};

use std::collections::HashMap;

use candle_core::{DType, Tensor};

use crate::{
    config::TrainingConfig,
    error::{Error, Result},
    nn::ParamStore,
};

/// Per-weight optimiser slots and update rule.
pub trait OptimiserState: Sized + Send {
    type Params: Clone + std::fmt::Debug + Send;

    fn new(weight: &Tensor, params: &Self::Params) -> Result<Self>;

    /// Returns the updated weight.
    fn update(&mut self, weight: &Tensor, grad: &Tensor, learning_rate: f32) -> Result<Tensor>;

    fn reset(&mut self, weight: &Tensor) -> Result<()>;

    /// Slots keyed by their name, without the weight prefix.
    fn slots(&self) -> Result<Vec<(String, Tensor)>>;

    fn load_slots(&mut self, slots: &HashMap<String, Tensor>) -> Result<()>;
}

/// A whole-network optimiser, object safe so the trainer can pick one from config.
pub trait Optimiser: Send {
    fn name(&self) -> String;

    /// Applies one step with gradients given in parameter store order.
    fn update(&mut self, params: &ParamStore, grads: &[Tensor], learning_rate: f32) -> Result<()>;

    fn reset(&mut self, params: &ParamStore) -> Result<()>;

    /// Every slot tensor, keyed `{weight}/{slot}`.
    fn state_tensors(&self) -> Result<HashMap<String, Tensor>>;

    fn load_state_tensors(&mut self, map: &HashMap<String, Tensor>) -> Result<()>;
}

/// Runs one `OptimiserState` per weight.
pub struct WrapOptimiser<S: OptimiserState> {
    name: String,
    states: Vec<(String, S)>,
}

impl<S: OptimiserState> WrapOptimiser<S> {
    pub fn new(name: &str, params: &ParamStore, state_params: &S::Params) -> Result<Self> {
        let states = params
            .iter()
            .map(|p| Ok((p.name.clone(), S::new(&p.var.as_detached_tensor(), state_params)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { name: name.to_string(), states })
    }
}

impl<S: OptimiserState> Optimiser for WrapOptimiser<S> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn update(&mut self, params: &ParamStore, grads: &[Tensor], learning_rate: f32) -> Result<()> {
        if grads.len() != self.states.len() || params.len() != self.states.len() {
            return Err(Error::Config(format!("optimiser tracks {} weights, got {}", self.states.len(), grads.len())));
        }

        for ((param, grad), (_, state)) in params.iter().zip(grads).zip(self.states.iter_mut()) {
            let weight = param.var.as_detached_tensor();
            let updated = state.update(&weight, &grad.to_dtype(DType::F32)?, learning_rate)?;
            param.var.set(&updated)?;
        }

        Ok(())
    }

    fn reset(&mut self, params: &ParamStore) -> Result<()> {
        for (param, (_, state)) in params.iter().zip(self.states.iter_mut()) {
            state.reset(&param.var.as_detached_tensor())?;
        }

        Ok(())
    }

    fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut map = HashMap::new();
        for (id, state) in &self.states {
            for (slot, tensor) in state.slots()? {
                map.insert(format!("{id}/{slot}"), tensor);
            }
        }

        Ok(map)
    }

    fn load_state_tensors(&mut self, map: &HashMap<String, Tensor>) -> Result<()> {
        for (id, state) in self.states.iter_mut() {
            let prefix = format!("{id}/");
            let slots = map
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|slot| (slot.to_string(), v.clone())))
                .filter(|(slot, _)| !slot.contains('/'))
                .collect::<HashMap<_, _>>();
            state.load_slots(&slots)?;
        }

        Ok(())
    }
}

pub(crate) fn slot<'a>(slots: &'a HashMap<String, Tensor>, name: &str) -> Result<&'a Tensor> {
    slots.get(name).ok_or_else(|| Error::MissingWeight(format!("optimiser slot {name}")))
}

pub(crate) fn scalar_slot(value: f64, like: &Tensor) -> Result<Tensor> {
    Ok(Tensor::new(&[value as f32], like.device())?)
}

pub(crate) fn read_scalar_slot(slots: &HashMap<String, Tensor>, name: &str) -> Result<f64> {
    Ok(f64::from(slot(slots, name)?.to_vec1::<f32>()?.first().copied().unwrap_or_default()))
}

fn build_with<S: OptimiserState + 'static>(
    name: &str,
    training: &TrainingConfig,
    params: &ParamStore,
    inner: S::Params,
) -> Result<Box<dyn Optimiser>> {
    if training.lookahead_optimizer {
        let params_la = LookaheadParams::new(inner);
        let name = format!("lookahead({name})");
        Ok(Box::new(WrapOptimiser::<Lookahead<S>>::new(&name, params, &params_la)?))
    } else {
        Ok(Box::new(WrapOptimiser::<S>::new(name, params, &inner)?))
    }
}

/// Chooses the optimiser named by the training config.
pub fn from_config(training: &TrainingConfig, params: &ParamStore) -> Result<Box<dyn Optimiser>> {
    if training.rmsprop_optimizer {
        build_with::<RmsProp>("rmsprop", training, params, RmsPropParams { epsilon: training.epsilon, ..Default::default() })
    } else if training.nadam_optimizer {
        let nadam = NadamParams {
            beta1: training.beta_1,
            beta2: training.beta_2,
            epsilon: training.epsilon,
            decay: training.weight_decay,
        };
        let name = if training.weight_decay > 0.0 { "nadamw" } else { "nadam" };
        build_with::<Nadam>(name, training, params, nadam)
    } else {
        build_with::<Sgd>("sgd-nesterov", training, params, SgdParams::default())
    }
}
