use std::collections::HashMap;

use candle_core::Tensor;

use super::{slot, OptimiserState};
use crate::error::Result;

#[derive(Clone, Copy, Debug)]
pub struct RmsPropParams {
    pub rho: f32,
    pub epsilon: f32,
    pub centered: bool,
}

impl Default for RmsPropParams {
    fn default() -> Self {
        Self { rho: 0.9, epsilon: 1e-7, centered: true }
    }
}

pub struct RmsProp {
    mean_square: Tensor,
    mean_grad: Tensor,
    params: RmsPropParams,
}

impl OptimiserState for RmsProp {
    type Params = RmsPropParams;

    fn new(weight: &Tensor, params: &Self::Params) -> Result<Self> {
        Ok(Self { mean_square: weight.zeros_like()?, mean_grad: weight.zeros_like()?, params: *params })
    }

    fn update(&mut self, weight: &Tensor, grad: &Tensor, learning_rate: f32) -> Result<Tensor> {
        let rho = f64::from(self.params.rho);
        self.mean_square = ((&self.mean_square * rho)? + (grad.sqr()? * (1.0 - rho))?)?;

        let mut denom = self.mean_square.clone();
        if self.params.centered {
            self.mean_grad = ((&self.mean_grad * rho)? + (grad * (1.0 - rho))?)?;
            denom = (denom - self.mean_grad.sqr()?)?;
        }

        let step = (grad * f64::from(learning_rate))?.div(&(denom + f64::from(self.params.epsilon))?.sqrt()?)?;
        Ok((weight - step)?)
    }

    fn reset(&mut self, weight: &Tensor) -> Result<()> {
        self.mean_square = weight.zeros_like()?;
        self.mean_grad = weight.zeros_like()?;
        Ok(())
    }

    fn slots(&self) -> Result<Vec<(String, Tensor)>> {
        Ok(vec![("rms".to_string(), self.mean_square.copy()?), ("mg".to_string(), self.mean_grad.copy()?)])
    }

    fn load_slots(&mut self, slots: &HashMap<String, Tensor>) -> Result<()> {
        let device = self.mean_square.device().clone();
        self.mean_square = slot(slots, "rms")?.to_device(&device)?;
        self.mean_grad = slot(slots, "mg")?.to_device(&device)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn centred_first_step() {
        let w = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
        let g = Tensor::new(&[2.0f32], &Device::Cpu).unwrap();
        let mut opt = RmsProp::new(&w, &RmsPropParams::default()).unwrap();
        let w = opt.update(&w, &g, 0.01).unwrap().to_vec1::<f32>().unwrap()[0];

        // ms = 0.4, mg = 0.2, denom = 0.36
        let expected = 1.0 - 0.01 * 2.0 / (0.36f32 + 1e-7).sqrt();
        assert!((w - expected).abs() < 1e-6);
    }
}
