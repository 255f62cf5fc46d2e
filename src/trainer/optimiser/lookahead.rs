use std::collections::HashMap;

use candle_core::Tensor;

use super::{read_scalar_slot, scalar_slot, slot, OptimiserState};
use crate::error::Result;

#[derive(Clone, Debug)]
pub struct LookaheadParams<T> {
    pub inner: T,
    pub alpha: f32,
    pub k: usize,
}

impl<T> LookaheadParams<T> {
    pub fn new(inner: T) -> Self {
        Self { inner, alpha: 0.5, k: 6 }
    }
}

/// Every `k` steps, moves slow weights `alpha` of the way to the fast ones and
/// restarts the fast weights from there.
pub struct Lookahead<S> {
    inner: S,
    slow: Tensor,
    alpha: f32,
    k: usize,
    step: usize,
}

impl<S: OptimiserState> OptimiserState for Lookahead<S> {
    type Params = LookaheadParams<S::Params>;

    fn new(weight: &Tensor, params: &Self::Params) -> Result<Self> {
        Ok(Self {
            inner: S::new(weight, &params.inner)?,
            slow: weight.copy()?,
            alpha: params.alpha,
            k: params.k,
            step: 0,
        })
    }

    fn update(&mut self, weight: &Tensor, grad: &Tensor, learning_rate: f32) -> Result<Tensor> {
        self.step += 1;
        let fast = self.inner.update(weight, grad, learning_rate)?;

        if self.step % self.k != 0 {
            return Ok(fast);
        }

        self.slow = (&self.slow + ((fast - &self.slow)? * f64::from(self.alpha))?)?;
        Ok(self.slow.copy()?)
    }

    fn reset(&mut self, weight: &Tensor) -> Result<()> {
        self.inner.reset(weight)?;
        self.slow = weight.copy()?;
        self.step = 0;
        Ok(())
    }

    fn slots(&self) -> Result<Vec<(String, Tensor)>> {
        let mut slots = self.inner.slots()?;
        slots.push(("slow".to_string(), self.slow.copy()?));
        slots.push(("lookahead_step".to_string(), scalar_slot(self.step as f64, &self.slow)?));
        Ok(slots)
    }

    fn load_slots(&mut self, slots: &HashMap<String, Tensor>) -> Result<()> {
        self.inner.load_slots(slots)?;
        self.slow = slot(slots, "slow")?.to_device(self.slow.device())?;
        self.step = read_scalar_slot(slots, "lookahead_step")?.round() as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::optimiser::{Sgd, SgdParams};
    use candle_core::Device;

    #[test]
    fn syncs_every_k_steps() {
        let w = Tensor::new(&[0.0f32], &Device::Cpu).unwrap();
        let g = Tensor::new(&[-1.0f32], &Device::Cpu).unwrap();
        let params = LookaheadParams { inner: SgdParams { momentum: 0.0, nesterov: false }, alpha: 0.5, k: 2 };
        let mut opt = Lookahead::<Sgd>::new(&w, &params).unwrap();

        let w = opt.update(&w, &g, 1.0).unwrap();
        assert_eq!(w.to_vec1::<f32>().unwrap(), vec![1.0]);

        // fast reaches 2, slow moves halfway from 0
        let w = opt.update(&w, &g, 1.0).unwrap();
        assert_eq!(w.to_vec1::<f32>().unwrap(), vec![1.0]);

        let w = opt.update(&w, &g, 1.0).unwrap();
        assert_eq!(w.to_vec1::<f32>().unwrap(), vec![2.0]);
    }
}
