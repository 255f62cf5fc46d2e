use std::collections::HashMap;

use candle_core::Tensor;

use super::{slot, OptimiserState};
use crate::error::Result;

#[derive(Clone, Copy, Debug)]
pub struct SgdParams {
    pub momentum: f32,
    pub nesterov: bool,
}

impl Default for SgdParams {
    fn default() -> Self {
        Self { momentum: 0.9, nesterov: true }
    }
}

/// Momentum SGD, velocity stored as `v = m * v - lr * g`.
pub struct Sgd {
    velocity: Tensor,
    params: SgdParams,
}

impl OptimiserState for Sgd {
    type Params = SgdParams;

    fn new(weight: &Tensor, params: &Self::Params) -> Result<Self> {
        Ok(Self { velocity: weight.zeros_like()?, params: *params })
    }

    fn update(&mut self, weight: &Tensor, grad: &Tensor, learning_rate: f32) -> Result<Tensor> {
        let momentum = f64::from(self.params.momentum);
        let step = (grad * f64::from(learning_rate))?;
        self.velocity = ((&self.velocity * momentum)? - &step)?;

        let delta = if self.params.nesterov { ((&self.velocity * momentum)? - step)? } else { self.velocity.clone() };
        Ok((weight + delta)?)
    }

    fn reset(&mut self, weight: &Tensor) -> Result<()> {
        self.velocity = weight.zeros_like()?;
        Ok(())
    }

    fn slots(&self) -> Result<Vec<(String, Tensor)>> {
        Ok(vec![("momentum".to_string(), self.velocity.copy()?)])
    }

    fn load_slots(&mut self, slots: &HashMap<String, Tensor>) -> Result<()> {
        self.velocity = slot(slots, "momentum")?.to_device(self.velocity.device())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(x: &[f32]) -> Tensor {
        Tensor::new(x, &Device::Cpu).unwrap()
    }

    #[test]
    fn nesterov_steps() {
        let w = t(&[1.0]);
        let mut sgd = Sgd::new(&w, &SgdParams::default()).unwrap();

        // v = -0.1, w = 1 + 0.9 * -0.1 - 0.1
        let w = sgd.update(&w, &t(&[1.0]), 0.1).unwrap();
        assert!((w.to_vec1::<f32>().unwrap()[0] - 0.81).abs() < 1e-6);

        // v = -0.09 - 0.1 = -0.19, w = 0.81 - 0.171 - 0.1
        let w = sgd.update(&w, &t(&[1.0]), 0.1).unwrap();
        assert!((w.to_vec1::<f32>().unwrap()[0] - 0.539).abs() < 1e-6);
    }

    #[test]
    fn doubled_gradient_at_half_rate_matches() {
        let w = t(&[0.5, -0.25]);
        let g = t(&[0.3, -0.7]);
        let mut a = Sgd::new(&w, &SgdParams::default()).unwrap();
        let mut b = Sgd::new(&w, &SgdParams::default()).unwrap();

        let (mut wa, mut wb) = (w.clone(), w);
        for _ in 0..3 {
            wa = a.update(&wa, &g, 0.2).unwrap();
            wb = b.update(&wb, &(&g + &g).unwrap(), 0.1).unwrap();
        }

        let diff = (wa - wb).unwrap().abs().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-6);
    }
}
