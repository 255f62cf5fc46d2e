use std::collections::HashMap;

use candle_core::Tensor;

use crate::{
    error::{Error, Result},
    nn::ParamStore,
};

/// Stochastic weight averaging over the trainable weights.
///
/// After `n` updates each shadow tensor is the mean of the weights seen so far.
/// Once `n` reaches `max_n` it becomes an exponential average with momentum
/// `1 - 1 / (max_n + 1)`.
pub struct SwaManager {
    names: Vec<String>,
    shadow: Vec<Tensor>,
    count: usize,
    max_n: usize,
}

impl SwaManager {
    pub fn new(params: &ParamStore, max_n: usize) -> Result<Self> {
        Ok(Self {
            names: params.iter().map(|p| p.name.clone()).collect(),
            shadow: params.snapshot()?,
            count: 0,
            max_n,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn weights(&self) -> &[Tensor] {
        &self.shadow
    }

    /// Forgets the history, e.g. after the live weights were replaced wholesale.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// `swa += (w - swa) / (n + 1)`, then `n = min(n + 1, max_n)`. Reads the live weights only.
    pub fn update(&mut self, params: &ParamStore) -> Result<()> {
        let weight = 1.0 / (self.count as f64 + 1.0);

        for (shadow, param) in self.shadow.iter_mut().zip(params.iter()) {
            let live = param.var.as_detached_tensor();
            *shadow = (&*shadow + ((live - &*shadow)? * weight)?)?;
        }

        self.count = (self.count + 1).min(self.max_n);
        Ok(())
    }

    /// Swaps the averaged weights into `params` until the guard is dropped.
    pub fn swap_in<'a>(&self, params: &'a ParamStore) -> Result<SwappedWeights<'a>> {
        let backup = params.snapshot()?;
        params.assign(&self.shadow)?;
        Ok(SwappedWeights { params, backup: Some(backup) })
    }

    /// Runs `f` with the averaged weights in place, restoring the live weights on every exit path.
    pub fn with_swapped<T>(&self, params: &ParamStore, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard = self.swap_in(params)?;
        let result = f();
        guard.restore()?;
        result
    }

    pub fn named_tensors(&self) -> Result<HashMap<String, Tensor>> {
        self.names.iter().zip(&self.shadow).map(|(n, t)| Ok((n.clone(), t.copy()?))).collect()
    }

    pub fn load_named_tensors(&mut self, map: &HashMap<String, Tensor>, count: usize) -> Result<()> {
        for (name, shadow) in self.names.iter().zip(self.shadow.iter_mut()) {
            let value = map.get(name).ok_or_else(|| Error::MissingWeight(format!("swa {name}")))?;
            if value.dims() != shadow.dims() {
                return Err(Error::WeightLength {
                    name: name.clone(),
                    expected: shadow.elem_count(),
                    found: value.elem_count(),
                });
            }
            *shadow = value.to_device(shadow.device())?;
        }

        self.count = count;
        Ok(())
    }
}

/// Live weights set aside while the averaged ones are in use.
pub struct SwappedWeights<'a> {
    params: &'a ParamStore,
    backup: Option<Vec<Tensor>>,
}

impl SwappedWeights<'_> {
    pub fn restore(mut self) -> Result<()> {
        match self.backup.take() {
            Some(backup) => self.params.assign(&backup),
            None => Ok(()),
        }
    }
}

impl Drop for SwappedWeights<'_> {
    fn drop(&mut self) {
        if let Some(backup) = self.backup.take() {
            if let Err(err) = self.params.assign(&backup) {
                tracing::error!(%err, "failed to restore live weights after swa evaluation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::ParamKind;
    use candle_core::Device;

    fn store(x: f32) -> ParamStore {
        let mut store = ParamStore::new(&Device::Cpu);
        store.add("w", vec![x, -x], &[2], ParamKind::Kernel, false).unwrap();
        store
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.to_vec1::<f32>().unwrap()
    }

    #[test]
    fn constant_weights_are_a_fixed_point() {
        let params = store(0.3);
        let mut swa = SwaManager::new(&params, 10).unwrap();
        for _ in 0..25 {
            swa.update(&params).unwrap();
        }
        assert_eq!(values(&swa.weights()[0]), vec![0.3, -0.3]);
        assert_eq!(swa.count(), 10);
    }

    #[test]
    fn running_mean_then_capped() {
        let params = store(0.0);
        let mut swa = SwaManager::new(&params, 2).unwrap();
        let w = params.get("w").unwrap().var.clone();

        for x in [1.0f32, 2.0, 3.0] {
            w.set(&Tensor::new(&[x, -x], &Device::Cpu).unwrap()).unwrap();
            swa.update(&params).unwrap();
        }

        // mean of 1 and 2, then 3 weighted by 1 / (2 + 1)
        let got = values(&swa.weights()[0]);
        assert!((got[0] - (1.5 + (3.0 - 1.5) / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn swap_restores_on_error() {
        let params = store(1.0);
        let mut swa = SwaManager::new(&params, 4).unwrap();
        swa.update(&params).unwrap();
        params.get("w").unwrap().var.set(&Tensor::new(&[5.0f32, 5.0], &Device::Cpu).unwrap()).unwrap();

        let seen: Result<()> = swa.with_swapped(&params, || {
            assert_eq!(params.get("w").unwrap().values().unwrap(), vec![1.0, -1.0]);
            Err(Error::Data("boom".into()))
        });
        assert!(seen.is_err());
        assert_eq!(params.get("w").unwrap().values().unwrap(), vec![5.0, 5.0]);

        {
            let _guard = swa.swap_in(&params).unwrap();
            assert_eq!(params.get("w").unwrap().values().unwrap(), vec![1.0, -1.0]);
        }
        assert_eq!(params.get("w").unwrap().values().unwrap(), vec![5.0, 5.0]);
    }
}
