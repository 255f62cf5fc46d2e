use std::collections::HashMap;

use candle_core::Tensor;

use super::{read_scalar_slot, scalar_slot, slot, OptimiserState};
use crate::error::Result;

#[derive(Clone, Copy, Debug)]
pub struct NadamParams {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Decoupled weight decay, applied as `w -= decay * w` before each step.
    pub decay: f32,
}

impl Default for NadamParams {
    fn default() -> Self {
        Self { beta1: 0.9, beta2: 0.999, epsilon: 1e-7, decay: 0.0 }
    }
}

/// Nesterov Adam with the 0.96^(0.004 t) momentum schedule.
pub struct Nadam {
    m: Tensor,
    v: Tensor,
    iterations: u64,
    m_schedule: f64,
    params: NadamParams,
}

impl Nadam {
    const DECAY_BASE: f64 = 0.96;
    const SCHEDULE_DECAY: f64 = 0.004;

    fn momentum_at(&self, t: f64) -> f64 {
        f64::from(self.params.beta1) * (1.0 - 0.5 * Self::DECAY_BASE.powf(Self::SCHEDULE_DECAY * t))
    }
}

impl OptimiserState for Nadam {
    type Params = NadamParams;

    fn new(weight: &Tensor, params: &Self::Params) -> Result<Self> {
        Ok(Self { m: weight.zeros_like()?, v: weight.zeros_like()?, iterations: 0, m_schedule: 1.0, params: *params })
    }

    fn update(&mut self, weight: &Tensor, grad: &Tensor, learning_rate: f32) -> Result<Tensor> {
        let (beta1, beta2) = (f64::from(self.params.beta1), f64::from(self.params.beta2));

        let weight = if self.params.decay > 0.0 {
            (weight - (weight * f64::from(self.params.decay))?)?
        } else {
            weight.clone()
        };

        self.iterations += 1;
        let t = self.iterations as f64;
        let u_t = self.momentum_at(t);
        let u_t1 = self.momentum_at(t + 1.0);
        let m_schedule_new = self.m_schedule * u_t;
        let m_schedule_next = m_schedule_new * u_t1;
        self.m_schedule = m_schedule_new;

        self.m = ((&self.m * beta1)? + (grad * (1.0 - beta1))?)?;
        self.v = ((&self.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

        let g_prime = (grad * ((1.0 - u_t) / (1.0 - m_schedule_new)))?;
        let m_prime = (&self.m * (u_t1 / (1.0 - m_schedule_next)))?;
        let m_bar = (g_prime + m_prime)?;
        let v_hat = (&self.v / (1.0 - beta2.powf(t)))?;

        let denom = (v_hat.sqrt()? + f64::from(self.params.epsilon))?;
        let step = ((m_bar / denom)? * f64::from(learning_rate))?;
        Ok((weight - step)?)
    }

    fn reset(&mut self, weight: &Tensor) -> Result<()> {
        self.m = weight.zeros_like()?;
        self.v = weight.zeros_like()?;
        self.iterations = 0;
        self.m_schedule = 1.0;
        Ok(())
    }

    fn slots(&self) -> Result<Vec<(String, Tensor)>> {
        Ok(vec![
            ("m".to_string(), self.m.copy()?),
            ("v".to_string(), self.v.copy()?),
            ("iterations".to_string(), scalar_slot(self.iterations as f64, &self.m)?),
            ("m_schedule".to_string(), scalar_slot(self.m_schedule, &self.m)?),
        ])
    }

    fn load_slots(&mut self, slots: &HashMap<String, Tensor>) -> Result<()> {
        let device = self.m.device().clone();
        self.m = slot(slots, "m")?.to_device(&device)?;
        self.v = slot(slots, "v")?.to_device(&device)?;
        self.iterations = read_scalar_slot(slots, "iterations")?.round() as u64;
        self.m_schedule = read_scalar_slot(slots, "m_schedule")?;
        Ok(())
    }
}
